//! The Docker daemon runtime backend.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bollard::{
	models::{ContainerInspectResponse, EventMessage, EventMessageTypeEnum},
	query_parameters::{
		EventsOptionsBuilder, InspectContainerOptions, InspectNetworkOptions,
		ListContainersOptions,
	},
};
use futures_util::StreamExt;

use super::{
	backend::{EventStream, RuntimeBackend},
	AttachedNetwork, ContainerDetails, EventAction, EventScope, NetworkDetails, RuntimeError,
	RuntimeEvent,
};

/// A runtime backend talking to the local Docker daemon over its default
/// socket.
#[derive(Debug)]
pub struct Docker {
	client: bollard::Docker,
}

impl Docker {
	/// Connect with the daemon's local defaults (unix socket, or the
	/// environment's `DOCKER_HOST`).
	///
	/// # Errors
	/// Returns an error if no daemon connection can be configured.
	pub fn connect() -> Result<Self, RuntimeError> {
		let client = bollard::Docker::connect_with_local_defaults().map_err(api_error)?;

		Ok(Self { client })
	}
}

fn api_error(err: bollard::errors::Error) -> RuntimeError {
	RuntimeError::Api {
		message: err.to_string(),
	}
}

/// Map a daemon inspect response onto the controller's container record.
fn container_details(response: ContainerInspectResponse) -> ContainerDetails {
	let id = response.id.unwrap_or_default();
	let name = response
		.name
		.unwrap_or_default()
		.trim_start_matches('/')
		.to_string();

	let running = response
		.state
		.and_then(|state| state.running)
		.unwrap_or_default();

	let env = response
		.config
		.as_ref()
		.and_then(|config| config.env.as_ref())
		.map(|entries| {
			entries
				.iter()
				.filter_map(|entry| entry.split_once('='))
				.map(|(key, value)| (key.to_string(), value.to_string()))
				.collect::<BTreeMap<_, _>>()
		})
		.unwrap_or_default();

	let mut exposed_ports = response
		.config
		.and_then(|config| config.exposed_ports)
		.map(|ports| {
			ports
				.keys()
				// Keys look like "8080/tcp".
				.filter_map(|key| key.split('/').next())
				.filter_map(|port| port.parse::<u16>().ok())
				.collect::<Vec<_>>()
		})
		.unwrap_or_default();
	exposed_ports.sort_unstable();
	exposed_ports.dedup();

	let mut networks = response
		.network_settings
		.and_then(|settings| settings.networks)
		.map(|networks| {
			networks
				.into_iter()
				.map(|(name, endpoint)| AttachedNetwork {
					id: endpoint.network_id.unwrap_or_default(),
					name,
					address: endpoint
						.ip_address
						.filter(|addr| !addr.is_empty())
						.and_then(|addr| addr.parse().ok()),
				})
				.collect::<Vec<_>>()
		})
		.unwrap_or_default();
	networks.sort_by(|a, b| a.name.cmp(&b.name));

	ContainerDetails {
		id,
		name,
		running,
		env,
		networks,
		exposed_ports,
	}
}

/// Map a daemon event onto the typed feed; `None` for event types the
/// reconciler has no use for (images, volumes, ...).
fn runtime_event(message: EventMessage) -> Option<RuntimeEvent> {
	let scope = match message.typ? {
		EventMessageTypeEnum::CONTAINER => EventScope::Container,
		EventMessageTypeEnum::NETWORK => EventScope::Network,
		_ => return None,
	};

	let actor = message.actor?;
	let attributes = actor.attributes.unwrap_or_default();

	Some(RuntimeEvent {
		scope,
		action: EventAction::parse(message.action.as_deref().unwrap_or_default()),
		actor: actor.id.unwrap_or_default(),
		container: attributes.get("container").cloned(),
		time: message.time.unwrap_or_default(),
	})
}

#[async_trait]
impl RuntimeBackend for Docker {
	async fn list_containers(&self) -> Result<Vec<String>, RuntimeError> {
		let summaries = self
			.client
			.list_containers(None::<ListContainersOptions>)
			.await
			.map_err(api_error)?;

		Ok(summaries
			.into_iter()
			.filter_map(|summary| summary.id)
			.collect())
	}

	async fn inspect_container(&self, id: &str) -> Result<ContainerDetails, RuntimeError> {
		let response = self
			.client
			.inspect_container(id, None::<InspectContainerOptions>)
			.await
			.map_err(|err| match err {
				bollard::errors::Error::DockerResponseServerError {
					status_code: 404, ..
				} => RuntimeError::NotFound {
					what: "container",
					id: id.to_string(),
				},
				err => api_error(err),
			})?;

		Ok(container_details(response))
	}

	async fn inspect_network(&self, id: &str) -> Result<NetworkDetails, RuntimeError> {
		let network = self
			.client
			.inspect_network(id, None::<InspectNetworkOptions>)
			.await
			.map_err(|err| RuntimeError::Network {
				id: id.to_string(),
				message: err.to_string(),
			})?;

		Ok(NetworkDetails {
			id: network.id.unwrap_or_default(),
			name: network.name.unwrap_or_default(),
		})
	}

	async fn events_since(&self, since: i64) -> Result<EventStream, RuntimeError> {
		let options = EventsOptionsBuilder::default()
			.since(&since.to_string())
			.build();

		let stream = self.client.events(Some(options)).map(|item| match item {
			Ok(message) => Ok(runtime_event(message)),
			Err(err) => Err(RuntimeError::Stream {
				message: err.to_string(),
			}),
		});

		// Drop the event types the reconciler has no use for.
		let stream = stream.filter_map(|item| async move { item.transpose() });

		Ok(Box::pin(stream))
	}
}
