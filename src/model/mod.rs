//! The in-memory routing model.
//!
//! [`RoutingModel`] is the authoritative picture of what the gateway should
//! route: hostnames to ports to [`Host`]s, each with its locations,
//! backends, and upstreams. The reconciler is the only writer; everything
//! here is plain data with total, idempotent operations so that replaying
//! missed container events (or the same event twice) cannot produce drift.

mod extras;
mod host;


use std::collections::BTreeMap;

pub use self::{
	extras::{ExtraValue, Extras, INJECTED},
	host::{upstream_id, Backend, BasicAuth, Host, IpFilter, Location, Upstream},
};

/// The full routing model: hostname, then listening port, to host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingModel {
	hosts: BTreeMap<String, BTreeMap<u16, Host>>,
}

impl RoutingModel {
	/// An empty model.
	#[must_use]
	pub const fn new() -> Self {
		Self {
			hosts: BTreeMap::new(),
		}
	}

	/// Whether the model holds no hosts at all.
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.hosts.is_empty()
	}

	/// Number of hosts across all hostnames and ports.
	#[must_use]
	pub fn host_count(&self) -> usize {
		self.hosts.values().map(BTreeMap::len).sum()
	}

	/// Look up a host.
	#[must_use]
	pub fn get(&self, hostname: &str, port: u16) -> Option<&Host> {
		self.hosts.get(hostname).and_then(|ports| ports.get(&port))
	}

	/// Iterate over all hosts in `(hostname, port)` order. This is the
	/// iteration order every deterministic decision (rendering, default
	/// server election) observes.
	pub fn iter(&self) -> impl Iterator<Item = &Host> {
		self.hosts.values().flat_map(BTreeMap::values)
	}

	/// Drop every host.
	pub fn clear(&mut self) {
		self.hosts.clear();
	}

	/// Insert `host`, or merge it into the existing host for the same
	/// `(hostname, port)`: locations union by path, backends union by
	/// container id within a shared path, injected directives replace,
	/// other extras merge by type. Upstreams are rebuilt afterwards, so
	/// the upstream-membership invariant holds on every return.
	pub fn add(&mut self, host: Host) {
		let ports = self.hosts.entry(host.hostname.clone()).or_default();

		match ports.get_mut(&host.port) {
			Some(existing) => existing.merge_from(host),
			None => {
				let mut host = host;
				host.rebuild_upstreams();
				ports.insert(host.port, host);
			}
		}
	}

	/// Remove a container from every host and location. Locations that
	/// become empty are dropped; hosts left with no routes (and the stubs
	/// the container owned) are dropped with their extras. Upstreams of
	/// every touched host are rebuilt. Returns whether anything changed,
	/// so callers can skip a render cycle when nothing did. Removing an
	/// absent container is a no-op.
	pub fn remove_container(&mut self, container_id: &str) -> bool {
		let mut changed = false;

		for ports in self.hosts.values_mut() {
			ports.retain(|_, host| {
				if host.stub_owner.as_deref() == Some(container_id) {
					changed = true;
					return false;
				}

				let mut touched = false;

				host.locations.retain(|_, location| {
					if location.backends.remove(container_id).is_some() {
						touched = true;
					}
					!location.is_empty()
				});

				if touched {
					changed = true;
					host.rebuild_upstreams();
				}

				if host.has_routes() || host.is_stub() {
					true
				} else {
					host.extras.clear();
					false
				}
			});
		}

		self.hosts.retain(|_, ports| !ports.is_empty());

		changed
	}

	/// Project the model into the list of hosts to render, in renderer
	/// iteration order. This resolves everything that needs a global view:
	///
	/// - redirect sources with an empty target inherit the hostname of
	///   the only real host, when exactly one exists (otherwise they are
	///   skipped);
	/// - redirects to an HTTPS-enabled target emit `https://`, others
	///   `http://`;
	/// - missing redirect targets get a stub host so the target name
	///   resolves at the gateway;
	/// - when a hostname has both an HTTPS and a plain-HTTP variant, only
	///   the HTTPS variant is emitted, with `ssl_redirect` set;
	/// - exactly one host ends up flagged default server: the first
	///   flagged one in iteration order, or the host named by
	///   `default_host` when no container claimed the role.
	#[must_use]
	pub fn consolidate_for_render(&self, default_host: Option<&str>) -> Vec<Host> {
		let sole_real_host = {
			let mut real = self.iter().filter(|host| !host.is_stub());
			match (real.next(), real.next()) {
				(Some(host), None) => Some(host.hostname.clone()),
				_ => None,
			}
		};

		let mut hosts = Vec::new();

		for host in self.iter() {
			let mut host = host.clone();

			if host.is_redirect {
				if host.redirect_target.is_empty() {
					match &sole_real_host {
						Some(target) => host.redirect_target.clone_from(target),
						None => continue,
					}
				}

				host.redirect_ssl = self
					.hosts
					.get(&host.redirect_target)
					.into_iter()
					.flat_map(BTreeMap::values)
					.any(|target| target.ssl_enabled);
			}

			hosts.push(host);
		}

		// Stub out redirect targets that aren't hosts themselves.
		let targets = hosts
			.iter()
			.filter(|host| host.is_redirect)
			.map(|host| host.redirect_target.clone())
			.collect::<Vec<_>>();
		for target in targets {
			if !hosts.iter().any(|host| host.hostname == target) {
				let mut stub = Host::new(target, 80);
				stub.is_down = true;
				hosts.push(stub);
			}
		}

		// Collapse HTTP variants of hostnames that also serve HTTPS.
		let tls_hostnames = hosts
			.iter()
			.filter(|host| host.ssl_enabled)
			.map(|host| host.hostname.clone())
			.collect::<Vec<_>>();
		hosts.retain(|host| {
			host.ssl_enabled || host.port != 80 || !tls_hostnames.contains(&host.hostname)
		});
		for host in &mut hosts {
			if host.ssl_enabled {
				host.ssl_redirect = true;
			}
		}

		hosts.sort_by(|a, b| (&a.hostname, a.port).cmp(&(&b.hostname, b.port)));

		// Default server election: first flagged wins, or the configured
		// fallback hostname when nobody asked for the role.
		let mut elected = false;
		for host in &mut hosts {
			if host.is_default_server {
				if elected {
					host.is_default_server = false;
				}
				elected = true;
			}
		}
		if !elected {
			if let Some(default_host) = default_host {
				if let Some(host) = hosts.iter_mut().find(|host| host.hostname == default_host) {
					host.is_default_server = true;
				}
			}
		}

		hosts
	}

	/// Verify the structural invariants the rest of the system relies on.
	/// Used by tests; returns a description of the first violation found.
	///
	/// # Errors
	/// Returns a human-readable description of the violated invariant.
	pub fn check_invariants(&self) -> Result<(), String> {
		for host in self.iter() {
			for location in host.locations.values() {
				let expect_upstream = location.backends.len() >= 2;

				if location.upstream_enabled != expect_upstream {
					return Err(format!(
						"host {}:{} location {} has {} backends but upstream_enabled={}",
						host.hostname,
						host.port,
						location.path,
						location.backends.len(),
						location.upstream_enabled,
					));
				}

				if expect_upstream {
					if location.upstream_id.is_empty() {
						return Err(format!(
							"host {}:{} location {} is upstream-enabled with an empty id",
							host.hostname, host.port, location.path,
						));
					}

					let referenced = host
						.upstreams
						.iter()
						.filter(|upstream| upstream.id == location.upstream_id)
						.collect::<Vec<_>>();

					if referenced.len() != 1 {
						return Err(format!(
							"host {}:{} location {} references upstream {:?} {} times",
							host.hostname,
							host.port,
							location.path,
							location.upstream_id,
							referenced.len(),
						));
					}

					let mut upstream_ids = referenced[0]
						.backends
						.iter()
						.map(|backend| backend.id.clone())
						.collect::<Vec<_>>();
					upstream_ids.sort();
					let location_ids = location.backends.keys().cloned().collect::<Vec<_>>();

					if upstream_ids != location_ids {
						return Err(format!(
							"host {}:{} upstream {:?} members {:?} != location members {:?}",
							host.hostname,
							host.port,
							location.upstream_id,
							upstream_ids,
							location_ids,
						));
					}
				} else if !location.upstream_id.is_empty() {
					return Err(format!(
						"host {}:{} location {} is single-backend but has upstream id {:?}",
						host.hostname, host.port, location.path, location.upstream_id,
					));
				}
			}

			for upstream in &host.upstreams {
				let referenced = host
					.locations
					.values()
					.any(|location| location.upstream_id == upstream.id);
				if !referenced {
					return Err(format!(
						"host {}:{} has orphaned upstream {:?}",
						host.hostname, host.port, upstream.id,
					));
				}
			}

			if !host.has_routes() && !host.is_stub() {
				return Err(format!(
					"host {}:{} has no routes and is not a stub",
					host.hostname, host.port,
				));
			}
		}

		Ok(())
	}
}
