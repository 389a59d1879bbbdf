//! The reconciler: the single writer that turns runtime events into a
//! consistent routing model and a validated, reloaded gateway.
//!
//! Startup learns the controller's own networks, anchors the event stream
//! timestamp, full-scans the runtime, and performs the first render +
//! validate + reload. After that every event is one cycle under the
//! exclusive lock: inspect, mutate the model, render, validate, reload.
//! Because every effect is `remove_container` composed with an idempotent
//! merge, replaying missed events (or the same event twice) cannot drift
//! the model. Render, validate, or reload failures end the cycle with the
//! previous gateway configuration still live and the in-memory model kept;
//! the next event re-renders.

mod derive;

pub use derive::{derive_hosts, reachable_address, NetworkTable};

use std::{
	collections::HashMap,
	sync::Arc,
	time::{SystemTime, UNIX_EPOCH},
};

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
	certs::CertificateManager,
	config::Config,
	error::Error,
	events::EventProcessor,
	gateway::Gateway,
	model::{Host, RoutingModel},
	processors,
	render::{render, RenderSettings},
	runtime::{
		ContainerDetails, EventAction, EventScope, Runtime, RuntimeError, RuntimeEvent,
	},
};

/// Reconciler state, owned exclusively by the event-handling cycle.
#[derive(Debug, Default)]
struct State {
	model: RoutingModel,
	containers: HashMap<String, ContainerDetails>,
	networks: NetworkTable,
	self_id: Option<String>,
}

/// The orchestrator. One instance per controller process; all methods
/// take `&self` and serialise through the internal lock.
#[derive(Debug)]
pub struct Reconciler {
	runtime: Runtime,
	gateway: Gateway,
	certs: Arc<CertificateManager>,
	config: Config,
	settings: RenderSettings,
	state: RwLock<State>,
}

impl Reconciler {
	/// A reconciler over the given collaborators.
	#[must_use]
	pub fn new(
		runtime: Runtime,
		gateway: Gateway,
		certs: Arc<CertificateManager>,
		config: Config,
	) -> Self {
		let settings = RenderSettings::from_config(&config);

		Self {
			runtime,
			gateway,
			certs,
			config,
			settings,
			state: RwLock::new(State::default()),
		}
	}

	/// Startup: learn own networks, anchor the event timestamp, full-scan,
	/// and perform the first sync. Returns the anchor to subscribe the
	/// event stream from; any event raced against the scan will be
	/// replayed and absorbed by idempotence.
	///
	/// # Errors
	/// Returns an error when the initial container listing fails; sync
	/// failures at startup are logged but not fatal, the first event
	/// re-renders.
	pub async fn start(&self) -> Result<i64, Error> {
		self.learn_self().await;

		let since = i64::try_from(
			SystemTime::now()
				.duration_since(UNIX_EPOCH)
				.unwrap_or_default()
				.as_secs(),
		)
		.unwrap_or_default();

		let mut state = self.state.write().await;
		self.rescan_locked(&mut state).await?;

		if let Err(err) = self.sync_locked(&mut state).await {
			error!(kind = %err.kind(), %err, "initial sync failed, keeping existing gateway configuration");
		}

		info!(
			hosts = state.model.host_count(),
			containers = state.containers.len(),
			"startup reconciliation complete"
		);

		Ok(since)
	}

	/// Consume the event feed until it closes or `cancel` fires. The
	/// in-flight cycle always completes; cancellation is only observed
	/// between events.
	pub async fn run(&self, events: &mut EventProcessor, cancel: CancellationToken) {
		loop {
			let event = tokio::select! {
				() = cancel.cancelled() => {
					info!("reconciler shutting down");
					return;
				}
				event = events.next() => event,
			};

			match event {
				Some(event) => self.handle(event).await,
				None => {
					warn!("event feed closed, reconciler stopping");
					return;
				}
			}
		}
	}

	/// Apply one event. Errors are logged, never propagated: a failed
	/// cycle leaves the previous gateway configuration live and the next
	/// event tries again.
	pub async fn handle(&self, event: RuntimeEvent) {
		debug!(?event, "handling runtime event");

		let result = match (event.scope, &event.action) {
			(EventScope::Container, EventAction::Start | EventAction::Restart | EventAction::Unpause) => {
				self.apply_container(&event.actor).await
			}
			(EventScope::Container, EventAction::Die | EventAction::Stop | EventAction::Kill) => {
				self.remove_container(&event.actor).await
			}
			(EventScope::Container, _) => Ok(()),
			(EventScope::Network, EventAction::Connect | EventAction::Disconnect) => {
				self.network_membership_changed(&event).await
			}
			(EventScope::Network, EventAction::Destroy) => {
				self.network_destroyed(&event.actor).await
			}
			(EventScope::Network, _) => Ok(()),
		};

		if let Err(err) = result {
			error!(kind = %err.kind(), %err, ?event, "reconciliation cycle failed");
		}
	}

	/// Re-apply one container: remove it from the model first (dropping
	/// stale injected directives), then re-inspect, derive, decorate, and
	/// merge. A container the runtime no longer knows degrades into plain
	/// removal.
	async fn apply_container(&self, id: &str) -> Result<(), Error> {
		let mut state = self.state.write().await;

		let details = match self.runtime.inspect_container(id).await {
			Ok(details) => details,
			Err(RuntimeError::NotFound { .. }) => {
				debug!(container = id, "container vanished before inspection");
				return self.remove_locked(&mut state, id).await;
			}
			Err(err) => return Err(err.into()),
		};

		state.model.remove_container(id);

		if details.running {
			let mut hosts = derive_hosts(&details, &state.networks);
			processors::apply_all(&details.env, &mut hosts, id, &self.config);

			for host in hosts {
				state.model.add(host);
			}

			state.containers.insert(id.to_string(), details);
		} else {
			state.containers.remove(id);
		}

		self.sync_locked(&mut state).await
	}

	/// Remove one container and re-sync if anything changed.
	async fn remove_container(&self, id: &str) -> Result<(), Error> {
		let mut state = self.state.write().await;
		self.remove_locked(&mut state, id).await
	}

	async fn remove_locked(&self, state: &mut State, id: &str) -> Result<(), Error> {
		state.containers.remove(id);

		if state.model.remove_container(id) {
			self.sync_locked(state).await
		} else {
			debug!(container = id, "removal changed nothing, skipping render");
			Ok(())
		}
	}

	/// A container joined or left a network. For the controller itself
	/// the reachability set changed, so the whole model is re-derived;
	/// for any other container, a re-apply (or removal) is enough.
	async fn network_membership_changed(&self, event: &RuntimeEvent) -> Result<(), Error> {
		let Some(container) = &event.container else {
			return Ok(());
		};

		let is_self = {
			let state = self.state.read().await;
			state.self_id.as_deref() == Some(container.as_str())
		};

		if is_self {
			let mut state = self.state.write().await;

			if event.action == EventAction::Connect {
				match self.runtime.inspect_network(&event.actor).await {
					Ok(network) => {
						info!(network = network.name, "controller joined network");
						state.networks.insert(network.id, network.name);
					}
					Err(err) => warn!(%err, "could not resolve joined network"),
				}
			} else {
				info!(network = event.actor, "controller left network");
				state.networks.remove(&event.actor);
			}

			self.rescan_locked(&mut state).await?;
			return self.sync_locked(&mut state).await;
		}

		// Another container's membership changed: re-derive just that
		// container; a vanished one degrades into removal inside.
		self.apply_container(container).await
	}

	/// A known network was destroyed: forget it and re-derive everything.
	async fn network_destroyed(&self, network: &str) -> Result<(), Error> {
		let mut state = self.state.write().await;

		if !state.networks.remove(network) {
			return Ok(());
		}

		info!(network, "known network destroyed, rescanning");
		self.rescan_locked(&mut state).await?;
		self.sync_locked(&mut state).await
	}

	/// Rebuild the model from scratch: list, inspect, derive, decorate,
	/// merge. Containers that fail inspection are skipped with a warning;
	/// the scan continues.
	async fn rescan_locked(&self, state: &mut State) -> Result<(), Error> {
		let ids = self.runtime.list_containers().await.map_err(Error::from)?;

		state.model.clear();
		state.containers.clear();

		for id in ids {
			let details = match self.runtime.inspect_container(&id).await {
				Ok(details) => details,
				Err(err) => {
					warn!(%err, container = id, "skipping container during rescan");
					continue;
				}
			};

			if !details.running {
				continue;
			}

			let mut hosts = derive_hosts(&details, &state.networks);
			processors::apply_all(&details.env, &mut hosts, &id, &self.config);

			for host in hosts {
				state.model.add(host);
			}

			state.containers.insert(id, details);
		}

		Ok(())
	}

	/// One render + validate + reload pass over a consistent snapshot.
	/// TLS hosts get their certificate names resolved first, which may
	/// trigger issuance (or fallback) in the certificate manager.
	async fn sync_locked(&self, state: &mut State) -> Result<(), Error> {
		let mut hosts = state
			.model
			.consolidate_for_render(self.config.default_host.as_deref());

		self.resolve_certificates(&mut hosts).await;

		let text = render(&hosts, &self.settings);

		self.gateway.write_config(&text).await?;
		self.gateway.validate().await?;
		self.gateway.reload().await?;

		debug!(hosts = hosts.len(), bytes = text.len(), "gateway reloaded");
		Ok(())
	}

	/// Fill in `ssl_file` for every TLS host. Resolution failures leave
	/// the name empty, so the host serves the synthetic default
	/// certificate instead of blocking the cycle.
	async fn resolve_certificates(&self, hosts: &mut [Host]) {
		for host in hosts.iter_mut() {
			if !host.ssl_enabled || !host.ssl_file.is_empty() {
				continue;
			}

			match self.certs.certificate_for(&host.hostname).await {
				Ok(name) => host.ssl_file = name,
				Err(err) => {
					error!(%err, hostname = host.hostname, "certificate resolution failed");
				}
			}
		}
	}

	/// Learn the controller's own attached networks by inspecting its own
	/// container (the hostname is the container id inside a container).
	/// On failure, fall back to the default bridge network and proceed.
	async fn learn_self(&self) {
		let mut state = self.state.write().await;

		let own_hostname = hostname::get()
			.map(|name| name.to_string_lossy().into_owned())
			.unwrap_or_default();

		match self.runtime.inspect_container(&own_hostname).await {
			Ok(details) => {
				info!(
					container = details.id,
					networks = details.networks.len(),
					"controller container identified"
				);
				for attached in &details.networks {
					state.networks.insert(attached.id.clone(), attached.name.clone());
				}
				state.self_id = Some(details.id);
			}
			Err(err) => {
				warn!(%err, "could not inspect own container, falling back to the default bridge network");
				match self.runtime.inspect_network("bridge").await {
					Ok(network) => state.networks.insert(network.id, network.name),
					Err(err) => warn!(%err, "default network discovery failed too"),
				}
			}
		}
	}

	/// A read-only snapshot of the current model, for introspection and
	/// tests.
	pub async fn model(&self) -> RoutingModel {
		self.state.read().await.model.clone()
	}
}
