//! Pure derivation of hosts from one inspected container.
//!
//! Reachability, backend address and port resolution, and the
//! `VIRTUAL_PORT` / `LETSENCRYPT_HOST` rules live here, as functions of
//! `(container details, known networks, controller config)` with no I/O,
//! so the whole derivation is unit-testable without a runtime.

use std::{collections::BTreeMap, net::IpAddr};

use tracing::{debug, warn};

use crate::{
	model::{Backend, Host, Location},
	runtime::ContainerDetails,
	spec::{self, VirtualHostSpec},
};

/// The bidirectional table of networks the controller itself is attached
/// to. A container is reachable iff it shares at least one of these.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkTable {
	by_id: BTreeMap<String, String>,
	by_name: BTreeMap<String, String>,
}

impl NetworkTable {
	/// An empty table.
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Record a network under both its id and its name.
	pub fn insert(&mut self, id: impl Into<String>, name: impl Into<String>) {
		let (id, name) = (id.into(), name.into());
		self.by_id.insert(id.clone(), name.clone());
		self.by_name.insert(name, id);
	}

	/// Drop a network by id or name. Returns whether it was known.
	pub fn remove(&mut self, id_or_name: &str) -> bool {
		if let Some(name) = self.by_id.remove(id_or_name) {
			self.by_name.remove(&name);
			return true;
		}

		if let Some(id) = self.by_name.remove(id_or_name) {
			self.by_id.remove(&id);
			return true;
		}

		false
	}

	/// Whether a network id or name is known.
	#[must_use]
	pub fn contains(&self, id_or_name: &str) -> bool {
		self.by_id.contains_key(id_or_name) || self.by_name.contains_key(id_or_name)
	}

	/// Whether no networks are known.
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.by_id.is_empty()
	}
}

/// The address the gateway uses to reach `details`: its IP on the first
/// shared network, in network-name order.
#[must_use]
pub fn reachable_address(details: &ContainerDetails, networks: &NetworkTable) -> Option<IpAddr> {
	details
		.networks
		.iter()
		.filter(|attached| networks.contains(&attached.id) || networks.contains(&attached.name))
		.find_map(|attached| attached.address)
}

/// Derive the hosts declared by one container. Unreachable containers and
/// unparsable specs contribute nothing (with a warning); everything else
/// becomes a host with one location holding one backend, ready for the
/// processors and the model merge.
#[must_use]
pub fn derive_hosts(details: &ContainerDetails, networks: &NetworkTable) -> Vec<Host> {
	let specs = collect_valid_specs(details);

	if specs.is_empty() {
		return Vec::new();
	}

	let address = reachable_address(details, networks);
	if address.is_none() && specs.iter().any(|spec| !spec.is_static) {
		warn!(
			container = details.id,
			"container declares virtual hosts but shares no network with the controller"
		);
	}

	let declared = specs.iter().filter(|spec| !spec.is_static).count();

	let mut hosts = Vec::new();

	for mut vhost in specs {
		if !vhost.is_static {
			// LETSENCRYPT_HOST upgrades the single declared spec to TLS.
			if declared == 1 && details.env.contains_key("LETSENCRYPT_HOST") {
				vhost.upgrade_to_ssl();
			}
		}

		let mut location = Location::new(vhost.external_path.clone());
		location.websocket =
			vhost.scheme.is_websocket() || vhost.container_scheme.is_websocket();
		location.http_fallback = location.websocket;
		location.is_static = vhost.is_static;

		for directive in &vhost.extras {
			location.inject(directive.clone());
		}

		if !vhost.is_static {
			let Some(address) = address else {
				continue;
			};

			location.backends.insert(
				details.id.clone(),
				Backend {
					id: details.id.clone(),
					address,
					port: backend_port(&vhost, details, declared),
					scheme: vhost.container_scheme,
					path: vhost.container_path.clone(),
				},
			);
		}

		let mut host = Host::new(vhost.hostname.clone(), vhost.server_port);
		host.scheme = vhost.scheme;
		host.ssl_enabled = vhost.ssl_enabled();
		host.locations.insert(location.path.clone(), location);

		// A spec whose backend could not be derived contributes nothing;
		// merging a routeless host would only create a stale 503 entry.
		if !host.has_routes() {
			continue;
		}

		debug!(
			container = details.id,
			hostname = host.hostname,
			port = host.port,
			"derived virtual host"
		);
		hosts.push(host);
	}

	hosts
}

/// Parse every `VIRTUAL_HOST`-family entry, dropping failures with a
/// warning so one bad spec cannot take down its siblings.
fn collect_valid_specs(details: &ContainerDetails) -> Vec<VirtualHostSpec> {
	spec::collect(&details.env)
		.into_iter()
		.filter_map(|(key, parsed)| match parsed {
			Ok(vhost) => Some(vhost),
			Err(err) => {
				warn!(%err, container = details.id, key, "dropping unparsable virtual host spec");
				None
			}
		})
		.collect()
}

/// Backend port precedence: explicit internal port, `VIRTUAL_PORT` (when
/// the container declares exactly one spec), the single exposed port, 80.
fn backend_port(vhost: &VirtualHostSpec, details: &ContainerDetails, declared: usize) -> u16 {
	if vhost.container_port != 0 {
		return vhost.container_port;
	}

	if declared == 1 {
		if let Some(value) = details.env.get("VIRTUAL_PORT") {
			match value.parse() {
				Ok(port) => return port,
				Err(_) => {
					warn!(container = details.id, value, "ignoring non-numeric VIRTUAL_PORT");
				}
			}
		}
	}

	if let [port] = details.exposed_ports.as_slice() {
		return *port;
	}

	80
}

#[cfg(test)]
mod tests {
	use std::collections::BTreeMap;

	use super::*;
	use crate::runtime::AttachedNetwork;

	fn networks() -> NetworkTable {
		let mut table = NetworkTable::new();
		table.insert("net-1", "frontend");
		table
	}

	fn container(env: &[(&str, &str)], exposed: &[u16]) -> ContainerDetails {
		ContainerDetails {
			id: "c1".to_string(),
			name: "web".to_string(),
			running: true,
			env: env
				.iter()
				.map(|(k, v)| ((*k).to_string(), (*v).to_string()))
				.collect::<BTreeMap<_, _>>(),
			networks: vec![
				AttachedNetwork {
					id: "net-9".to_string(),
					name: "backend".to_string(),
					address: Some("10.0.0.9".parse().unwrap()),
				},
				AttachedNetwork {
					id: "net-1".to_string(),
					name: "frontend".to_string(),
					address: Some("172.20.0.10".parse().unwrap()),
				},
			],
			exposed_ports: exposed.to_vec(),
		}
	}

	#[test]
	fn network_table_is_bidirectional() {
		let mut table = networks();

		assert!(table.contains("net-1"));
		assert!(table.contains("frontend"));
		assert!(!table.contains("backend"));

		assert!(table.remove("frontend"));
		assert!(!table.contains("net-1"));
		assert!(!table.remove("frontend"));
	}

	#[test]
	fn reachability_picks_the_shared_network() {
		let details = container(&[("VIRTUAL_HOST", "example.com")], &[]);

		// "backend" sorts first but is not shared; "frontend" is.
		assert_eq!(
			reachable_address(&details, &networks()),
			Some("172.20.0.10".parse().unwrap())
		);
	}

	#[test]
	fn unreachable_container_derives_no_backends() {
		let details = container(&[("VIRTUAL_HOST", "example.com")], &[]);
		let hosts = derive_hosts(&details, &NetworkTable::new());

		assert!(hosts.is_empty() || hosts.iter().all(|host| !host.has_routes()));
	}

	#[test]
	fn single_exposed_port_is_used() {
		let details = container(&[("VIRTUAL_HOST", "example.com")], &[8080]);
		let hosts = derive_hosts(&details, &networks());

		let backend = hosts[0].locations["/"].backends.get("c1").unwrap();
		assert_eq!(backend.port, 8080);
		assert_eq!(backend.address, "172.20.0.10".parse::<IpAddr>().unwrap());
	}

	#[test]
	fn explicit_internal_port_beats_everything() {
		let details = container(
			&[("VIRTUAL_HOST", "example.com -> :9000"), ("VIRTUAL_PORT", "7000")],
			&[8080],
		);
		let hosts = derive_hosts(&details, &networks());

		assert_eq!(hosts[0].locations["/"].backends["c1"].port, 9000);
	}

	#[test]
	fn virtual_port_beats_exposed_port() {
		let details = container(
			&[("VIRTUAL_HOST", "example.com"), ("VIRTUAL_PORT", "7000")],
			&[8080],
		);
		let hosts = derive_hosts(&details, &networks());

		assert_eq!(hosts[0].locations["/"].backends["c1"].port, 7000);
	}

	#[test]
	fn virtual_port_is_ignored_with_multiple_specs() {
		let details = container(
			&[
				("VIRTUAL_HOST", "a.example.com"),
				("VIRTUAL_HOST1", "b.example.com"),
				("VIRTUAL_PORT", "7000"),
			],
			&[8080, 9090],
		);
		let hosts = derive_hosts(&details, &networks());

		// Two exposed ports and an inapplicable VIRTUAL_PORT: fall back
		// to 80 for both.
		assert!(hosts
			.iter()
			.all(|host| host.locations["/"].backends["c1"].port == 80));
	}

	#[test]
	fn fallback_port_is_80() {
		let details = container(&[("VIRTUAL_HOST", "example.com")], &[]);
		let hosts = derive_hosts(&details, &networks());

		assert_eq!(hosts[0].locations["/"].backends["c1"].port, 80);
	}

	#[test]
	fn letsencrypt_host_upgrades_single_spec() {
		let details = container(
			&[("VIRTUAL_HOST", "example.com"), ("LETSENCRYPT_HOST", "example.com")],
			&[8080],
		);
		let hosts = derive_hosts(&details, &networks());

		assert!(hosts[0].ssl_enabled);
		assert_eq!(hosts[0].port, 443);
	}

	#[test]
	fn letsencrypt_host_does_not_touch_multiple_specs() {
		let details = container(
			&[
				("VIRTUAL_HOST", "a.example.com"),
				("VIRTUAL_HOST1", "b.example.com"),
				("LETSENCRYPT_HOST", "a.example.com"),
			],
			&[8080],
		);
		let hosts = derive_hosts(&details, &networks());

		assert!(hosts.iter().all(|host| !host.ssl_enabled));
	}

	#[test]
	fn static_spec_has_no_backend() {
		let details = container(
			&[("STATIC_VIRTUAL_HOST", "docs.example.com ; root /srv/docs")],
			&[],
		);
		let hosts = derive_hosts(&details, &networks());

		let location = &hosts[0].locations["/"];
		assert!(location.is_static);
		assert!(location.backends.is_empty());
		assert_eq!(location.injected, vec!["root /srv/docs".to_string()]);
	}

	#[test]
	fn extras_become_injected_directives() {
		let details = container(
			&[("VIRTUAL_HOST", "example.com ; client_max_body_size 50m")],
			&[8080],
		);
		let hosts = derive_hosts(&details, &networks());

		assert_eq!(
			hosts[0].locations["/"].injected,
			vec!["client_max_body_size 50m".to_string()]
		);
	}

	#[test]
	fn websocket_spec_flags_the_location() {
		let details = container(&[("VIRTUAL_HOST", "ws://push.example.com -> :3000")], &[]);
		let hosts = derive_hosts(&details, &networks());

		assert!(hosts[0].locations["/"].websocket);
		assert!(hosts[0].locations["/"].http_fallback);
	}

	#[test]
	fn unparsable_spec_is_dropped_but_siblings_apply() {
		let details = container(
			&[
				("VIRTUAL_HOST", "a.example.com -> :80 -> :90"),
				("VIRTUAL_HOST1", "b.example.com"),
			],
			&[8080],
		);
		let hosts = derive_hosts(&details, &networks());

		assert_eq!(hosts.len(), 1);
		assert_eq!(hosts[0].hostname, "b.example.com");
	}
}
