//! Hosts, locations, upstreams, and backends.

use std::{collections::BTreeMap, net::IpAddr};

use ipnet::IpNet;

use super::extras::Extras;
use crate::spec::Scheme;

/// One proxied container endpoint. Identity is the container id; everything
/// else is routing detail.
#[derive(Debug, Clone, Eq)]
pub struct Backend {
	/// Container id
	pub id: String,
	/// Container address on a network the controller can reach
	pub address: IpAddr,
	/// Container port
	pub port: u16,
	/// Scheme the gateway uses towards the container
	pub scheme: Scheme,
	/// Path prefix on the container
	pub path: String,
}

impl PartialEq for Backend {
	fn eq(&self, other: &Self) -> bool {
		self.id == other.id
	}
}

/// Basic-auth settings on a host or location.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BasicAuth {
	/// Whether requests must authenticate
	pub enabled: bool,
	/// Path of the generated password file
	pub file: String,
}

/// IP allowlist / trusted-proxy settings on a host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IpFilter {
	/// Whether the filter applies
	pub enabled: bool,
	/// Allowed client networks
	pub allow: Vec<IpNet>,
	/// Whether everything outside `allow` is denied
	pub deny_all: bool,
	/// Header carrying the real client address, if any
	pub real_ip_header: Option<String>,
	/// Whether real-IP substitution recurses through the header
	pub recursive: bool,
}

/// A path prefix on a virtual host with its own backend set and policy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Location {
	/// The path prefix
	pub path: String,
	/// Backends serving this path, keyed by container id
	pub backends: BTreeMap<String, Backend>,
	/// Id of the upstream addressing the backends collectively; empty when
	/// single-backend
	pub upstream_id: String,
	/// Whether traffic goes through the upstream (two or more backends)
	pub upstream_enabled: bool,
	/// Whether connections upgrade to websocket
	pub websocket: bool,
	/// Whether a websocket location also serves plain HTTP requests
	pub http_fallback: bool,
	/// Whether this location serves without a proxied backend
	pub is_static: bool,
	/// Basic-auth settings scoped to this location
	pub auth: BasicAuth,
	/// Injected gateway directives, insertion-ordered and de-duplicated
	pub injected: Vec<String>,
	/// Per-location extras
	pub extras: Extras,
}

impl Location {
	/// A new empty location for `path`.
	#[must_use]
	pub fn new(path: impl Into<String>) -> Self {
		Self {
			path: path.into(),
			..Self::default()
		}
	}

	/// Append an injected directive unless already present.
	pub fn inject(&mut self, directive: impl Into<String>) {
		let directive = directive.into();
		if !self.injected.contains(&directive) {
			self.injected.push(directive);
		}
	}

	/// The scheme used towards this location's backends. With several
	/// backends they agree by construction (one spec per path per render
	/// cycle); the first one decides.
	#[must_use]
	pub fn backend_scheme(&self) -> Scheme {
		self.backends
			.values()
			.next()
			.map_or(Scheme::Http, |backend| backend.scheme)
	}

	/// Whether this location routes no traffic: no backends and not
	/// static.
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.backends.is_empty() && !self.is_static
	}

	/// Merge another location for the same path into this one: union
	/// backends by container id, union injected directives, merge extras,
	/// and let set flags win.
	pub fn merge_from(&mut self, incoming: Self) {
		for (id, backend) in incoming.backends {
			self.backends.insert(id, backend);
		}

		for directive in incoming.injected {
			self.inject(directive);
		}

		self.websocket |= incoming.websocket;
		self.http_fallback |= incoming.http_fallback;
		self.is_static |= incoming.is_static;

		if incoming.auth.enabled {
			self.auth = incoming.auth;
		}

		self.extras.merge(incoming.extras);
	}
}

/// A named group of backends addressed collectively from a location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
	/// The upstream name used in the generated configuration
	pub id: String,
	/// The member backends, in container-id order
	pub backends: Vec<Backend>,
}

/// Generate the deterministic upstream id for a location:
/// `{hostname}-{port}-{sanitised path}`, where `/` alone becomes `root`
/// and path separators become `_`.
#[must_use]
pub fn upstream_id(hostname: &str, port: u16, path: &str) -> String {
	let path_tag = if path == "/" {
		"root".to_string()
	} else {
		path.trim_matches('/').replace('/', "_")
	};

	format!("{hostname}-{port}-{path_tag}")
}

/// One virtual host: a `(hostname, port)` pair with its locations,
/// upstreams, TLS and policy settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Host {
	/// The hostname clients connect with
	pub hostname: String,
	/// The listening port
	pub port: u16,
	/// The external scheme
	pub scheme: Scheme,
	/// Whether the gateway terminates TLS for this host
	pub ssl_enabled: bool,
	/// Certificate name used in the rendered configuration; empty until
	/// resolved against the certificate store
	pub ssl_file: String,
	/// Whether an HTTP companion server issues a 301 to HTTPS
	pub ssl_redirect: bool,
	/// Whether this host only redirects to another hostname
	pub is_redirect: bool,
	/// Redirect target hostname; empty means "the only real host"
	pub redirect_target: String,
	/// Whether the redirect goes to `https://`; resolved from the target
	/// host's TLS state during consolidation
	pub redirect_ssl: bool,
	/// Whether this host answers 503 unconditionally
	pub is_down: bool,
	/// Whether this host is the gateway's default server
	pub is_default_server: bool,
	/// Container id this host exists for when it is a pure stub (redirect
	/// sources); stubs are dropped with their container
	pub stub_owner: Option<String>,
	/// Host-wide basic-auth settings
	pub auth: BasicAuth,
	/// Host-wide IP allowlist settings
	pub ip_filter: IpFilter,
	/// Locations by path
	pub locations: BTreeMap<String, Location>,
	/// Upstreams, rebuilt from the locations after every mutation
	pub upstreams: Vec<Upstream>,
	/// Host-wide extras
	pub extras: Extras,
}

impl Host {
	/// A new empty host.
	#[must_use]
	pub fn new(hostname: impl Into<String>, port: u16) -> Self {
		Self {
			hostname: hostname.into(),
			port,
			..Self::default()
		}
	}

	/// A redirect-mode stub owned by the declaring container.
	#[must_use]
	pub fn redirect_stub(
		hostname: impl Into<String>,
		target: impl Into<String>,
		owner: impl Into<String>,
	) -> Self {
		Self {
			hostname: hostname.into(),
			port: 80,
			is_redirect: true,
			redirect_target: target.into(),
			stub_owner: Some(owner.into()),
			..Self::default()
		}
	}

	/// Whether this host is a pure stub (redirect or hard-down), entitled
	/// to exist without any backend.
	#[must_use]
	pub const fn is_stub(&self) -> bool {
		self.is_redirect || self.is_down
	}

	/// Whether any location still routes traffic.
	#[must_use]
	pub fn has_routes(&self) -> bool {
		self.locations.values().any(|location| !location.is_empty())
	}

	/// Discard all upstreams and re-synthesise them from the locations:
	/// every location with two or more backends gets exactly one upstream
	/// with a deterministic id; single-backend locations proxy directly.
	/// Afterwards upstream membership exactly tracks location membership,
	/// so a removed container can never keep receiving traffic through a
	/// stale upstream.
	pub fn rebuild_upstreams(&mut self) {
		self.upstreams.clear();

		let hostname = self.hostname.clone();
		let port = self.port;

		for location in self.locations.values_mut() {
			if location.backends.len() >= 2 {
				let id = upstream_id(&hostname, port, &location.path);
				location.upstream_id.clone_from(&id);
				location.upstream_enabled = true;
				self.upstreams.push(Upstream {
					id,
					backends: location.backends.values().cloned().collect(),
				});
			} else {
				location.upstream_id = String::new();
				location.upstream_enabled = false;
			}
		}
	}

	/// Merge another host for the same `(hostname, port)` into this one:
	/// union locations by path, let set flags and scalar settings win, and
	/// rebuild the upstreams.
	pub fn merge_from(&mut self, incoming: Self) {
		for (path, location) in incoming.locations {
			match self.locations.get_mut(&path) {
				Some(existing) => existing.merge_from(location),
				None => {
					self.locations.insert(path, location);
				}
			}
		}

		if incoming.scheme != Scheme::default() {
			self.scheme = incoming.scheme;
		}

		self.ssl_enabled |= incoming.ssl_enabled;
		self.ssl_redirect |= incoming.ssl_redirect;
		self.is_down |= incoming.is_down;
		self.is_default_server |= incoming.is_default_server;

		if incoming.is_redirect {
			self.is_redirect = true;
			self.redirect_target = incoming.redirect_target;
			self.stub_owner = incoming.stub_owner;
		}

		if !incoming.ssl_file.is_empty() {
			self.ssl_file = incoming.ssl_file;
		}

		if incoming.auth.enabled {
			self.auth = incoming.auth;
		}

		if incoming.ip_filter.enabled {
			self.ip_filter = incoming.ip_filter;
		}

		self.extras.merge(incoming.extras);
		self.rebuild_upstreams();
	}
}
