//! Parsing of the `VIRTUAL_HOST` declarative routing grammar.
//!
//! One `VIRTUAL_HOST`-family environment value describes one virtual host:
//!
//! ```text
//! spec     := main ( ";" extra )*
//! main     := external ( "->" internal )?
//! external := [ scheme "://" ] hostname [ ":" port ] [ path ]
//! internal := ( ":" port [ path ] ) | ( scheme "://" ... ) | path
//! ```
//!
//! For example `https://app.example.com -> :8080/api; client_max_body_size 50m`
//! routes `https://app.example.com/` to port 8080, path `/api`, of the
//! declaring container and injects one extra nginx directive. Parsing is a
//! pure function of the input string; everything that needs the container
//! (addresses, port fallbacks) happens later, during derivation.

use std::{
	collections::BTreeMap,
	fmt::{Display, Formatter, Result as FmtResult},
	str::FromStr,
};

/// The error returned when a `VIRTUAL_HOST`-family value cannot be parsed.
/// The offending spec is dropped; other specs on the same container still
/// apply.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
	/// More than one `->` separator
	#[error("more than one \"->\" in virtual host spec {0:?}")]
	TooManyArrows(String),
	/// A port failed to parse as a number
	#[error("invalid port {0:?} in virtual host spec")]
	InvalidPort(String),
	/// An unrecognised scheme prefix
	#[error("unknown scheme {0:?} in virtual host spec")]
	UnknownScheme(String),
	/// The external part has no hostname
	#[error("missing hostname in virtual host spec {0:?}")]
	MissingHostname(String),
	/// The internal part is neither `:port`, a scheme form, nor a path
	#[error("invalid internal address {0:?} in virtual host spec")]
	InvalidInternal(String),
}

/// A routing scheme, on either side of the proxy.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Scheme {
	/// Plain HTTP
	#[default]
	Http,
	/// HTTP over TLS
	Https,
	/// Websocket
	Ws,
	/// Websocket over TLS
	Wss,
	/// gRPC
	Grpc,
	/// gRPC over TLS
	Grpcs,
}

impl Scheme {
	/// Whether this scheme terminates TLS at the gateway.
	#[must_use]
	pub const fn is_tls(self) -> bool {
		matches!(self, Self::Https | Self::Wss | Self::Grpcs)
	}

	/// Whether this scheme upgrades connections to websocket.
	#[must_use]
	pub const fn is_websocket(self) -> bool {
		matches!(self, Self::Ws | Self::Wss)
	}

	/// Whether this scheme proxies gRPC.
	#[must_use]
	pub const fn is_grpc(self) -> bool {
		matches!(self, Self::Grpc | Self::Grpcs)
	}

	/// The TLS variant of this scheme (`http` becomes `https`, and so on).
	#[must_use]
	pub const fn secure(self) -> Self {
		match self {
			Self::Http | Self::Https => Self::Https,
			Self::Ws | Self::Wss => Self::Wss,
			Self::Grpc | Self::Grpcs => Self::Grpcs,
		}
	}

	/// The non-TLS variant of this scheme (`https` becomes `http`, and so
	/// on). Backends are addressed with this variant unless the spec says
	/// otherwise, since TLS terminates at the gateway.
	#[must_use]
	pub const fn insecure(self) -> Self {
		match self {
			Self::Http | Self::Https => Self::Http,
			Self::Ws | Self::Wss => Self::Ws,
			Self::Grpc | Self::Grpcs => Self::Grpc,
		}
	}

	/// The canonical lowercase name of this scheme.
	#[must_use]
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Http => "http",
			Self::Https => "https",
			Self::Ws => "ws",
			Self::Wss => "wss",
			Self::Grpc => "grpc",
			Self::Grpcs => "grpcs",
		}
	}
}

impl Display for Scheme {
	fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
		fmt.write_str(self.as_str())
	}
}

impl FromStr for Scheme {
	type Err = ParseError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"http" => Ok(Self::Http),
			"https" => Ok(Self::Https),
			"ws" => Ok(Self::Ws),
			"wss" => Ok(Self::Wss),
			"grpc" => Ok(Self::Grpc),
			"grpcs" => Ok(Self::Grpcs),
			other => Err(ParseError::UnknownScheme(other.to_string())),
		}
	}
}

/// One parsed `VIRTUAL_HOST`-family value. Immutable parser output; the
/// container side is completed during derivation (a `container_port` of 0
/// means "resolve from `VIRTUAL_PORT`, the exposed ports, or 80").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualHostSpec {
	/// External scheme clients connect with
	pub scheme: Scheme,
	/// External hostname
	pub hostname: String,
	/// External server port (normalised to 443 when TLS is on)
	pub server_port: u16,
	/// External path prefix, `/` when unspecified
	pub external_path: String,
	/// Scheme the gateway uses towards the container
	pub container_scheme: Scheme,
	/// Container port, 0 meaning "auto"
	pub container_port: u16,
	/// Path prefix on the container
	pub container_path: String,
	/// Whether this host serves without a proxied backend
	pub is_static: bool,
	/// Extra nginx directives, injected verbatim
	pub extras: Vec<String>,
}

impl VirtualHostSpec {
	/// Whether the gateway terminates TLS for this host.
	#[must_use]
	pub const fn ssl_enabled(&self) -> bool {
		self.scheme.is_tls()
	}

	/// Upgrade this spec to its TLS variant, as `LETSENCRYPT_HOST` does.
	/// Port 80 is normalised to 443, like everywhere else TLS is enabled.
	pub fn upgrade_to_ssl(&mut self) {
		self.scheme = self.scheme.secure();
		if self.server_port == 80 {
			self.server_port = 443;
		}
	}
}

impl Display for VirtualHostSpec {
	fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
		write!(fmt, "{}://{}:{}", self.scheme, self.hostname, self.server_port)?;
		if self.external_path != "/" {
			fmt.write_str(&self.external_path)?;
		}

		let default_scheme = self.scheme.insecure();
		let internal_needed = self.container_port != 0
			|| self.container_path != self.external_path
			|| self.container_scheme != default_scheme;

		if internal_needed {
			fmt.write_str(" -> ")?;
			if self.container_scheme != default_scheme {
				write!(fmt, "{}://", self.container_scheme)?;
			}
			if self.container_port != 0 {
				write!(fmt, ":{}", self.container_port)?;
			}
			if self.container_path != "/" {
				fmt.write_str(&self.container_path)?;
			}
		}

		for extra in &self.extras {
			write!(fmt, "; {extra}")?;
		}

		Ok(())
	}
}

/// Parse one `VIRTUAL_HOST`-family value. `is_static` marks values taken
/// from `STATIC_VIRTUAL_HOST*` keys.
///
/// # Errors
/// Returns a [`ParseError`] when the value has more than one `->`, a
/// non-numeric port, an unknown scheme, no hostname, or a malformed
/// internal address. No I/O is performed.
pub fn parse(value: &str, is_static: bool) -> Result<VirtualHostSpec, ParseError> {
	let mut parts = value.split(';');
	let main = parts.next().unwrap_or_default().trim();
	let extras = parts
		.map(str::trim)
		.filter(|extra| !extra.is_empty())
		.map(str::to_string)
		.collect::<Vec<_>>();

	let arrow_parts = main.split("->").map(str::trim).collect::<Vec<_>>();
	if arrow_parts.len() > 2 {
		return Err(ParseError::TooManyArrows(value.to_string()));
	}

	let (scheme, hostname, server_port, external_path) = parse_external(arrow_parts[0], value)?;

	let mut spec = VirtualHostSpec {
		scheme,
		hostname,
		server_port: server_port.unwrap_or(80),
		external_path: external_path.clone(),
		container_scheme: scheme.insecure(),
		container_port: 0,
		container_path: external_path,
		is_static,
		extras,
	};

	if let Some(internal) = arrow_parts.get(1) {
		parse_internal(internal, &mut spec)?;
	}

	if spec.ssl_enabled() && spec.server_port == 80 {
		spec.server_port = 443;
	}

	Ok(spec)
}

/// Split an address into `(scheme, remainder)` if it has a `://` prefix.
fn split_scheme(addr: &str) -> Result<(Option<Scheme>, &str), ParseError> {
	match addr.split_once("://") {
		Some((scheme, rest)) => Ok((Some(scheme.parse()?), rest)),
		None => Ok((None, addr)),
	}
}

/// Parse `[ scheme "://" ] hostname [ ":" port ] [ path ]`.
fn parse_external(
	external: &str,
	original: &str,
) -> Result<(Scheme, String, Option<u16>, String), ParseError> {
	let (scheme, rest) = split_scheme(external)?;
	let scheme = scheme.unwrap_or_default();

	let (authority, path) = match rest.find('/') {
		Some(idx) => (&rest[..idx], &rest[idx..]),
		None => (rest, "/"),
	};

	let (hostname, port) = match authority.split_once(':') {
		Some((host, port)) => (
			host,
			Some(
				port.parse::<u16>()
					.map_err(|_| ParseError::InvalidPort(port.to_string()))?,
			),
		),
		None => (authority, None),
	};

	if hostname.is_empty() {
		return Err(ParseError::MissingHostname(original.to_string()));
	}

	// An empty path and "/" mean the same thing.
	let path = if path.is_empty() { "/" } else { path };

	Ok((scheme, hostname.to_string(), port, path.to_string()))
}

/// Parse `( ":" port [ path ] ) | ( scheme "://" ... ) | path` into the
/// container side of `spec`.
fn parse_internal(internal: &str, spec: &mut VirtualHostSpec) -> Result<(), ParseError> {
	let (scheme, rest) = split_scheme(internal)?;
	if let Some(scheme) = scheme {
		spec.container_scheme = scheme;
	}

	if let Some(port_and_path) = rest.strip_prefix(':') {
		let (port, path) = match port_and_path.find('/') {
			Some(idx) => (&port_and_path[..idx], Some(&port_and_path[idx..])),
			None => (port_and_path, None),
		};

		spec.container_port = port
			.parse()
			.map_err(|_| ParseError::InvalidPort(port.to_string()))?;

		// A bare `:port` resets the container path to the root; a port
		// with a path uses that path.
		spec.container_path = path.unwrap_or("/").to_string();
	} else if rest.starts_with('/') {
		spec.container_path = rest.to_string();
	} else if rest.is_empty() {
		if scheme.is_none() {
			return Err(ParseError::InvalidInternal(internal.to_string()));
		}
	} else {
		// A hostname makes no sense on the container side; the backend
		// address always comes from runtime inspection.
		return Err(ParseError::InvalidInternal(internal.to_string()));
	}

	Ok(())
}

/// Collect the `VIRTUAL_HOST`-family entries of a container environment, in
/// sorted key order so derivation is deterministic. Returns each key with
/// its parse result; the caller logs and drops the failures.
#[must_use]
pub fn collect(env: &BTreeMap<String, String>) -> Vec<(String, Result<VirtualHostSpec, ParseError>)> {
	env.iter()
		.filter_map(|(key, value)| {
			virtual_host_key(key).map(|is_static| (key.clone(), parse(value, is_static)))
		})
		.collect()
}

/// Whether `key` declares a virtual host, and if so whether a static one.
/// Matches `VIRTUAL_HOST`, `VIRTUAL_HOST<N>`, and `STATIC_VIRTUAL_HOST*`.
#[must_use]
pub fn virtual_host_key(key: &str) -> Option<bool> {
	if key.starts_with("STATIC_VIRTUAL_HOST") {
		return Some(true);
	}

	key.strip_prefix("VIRTUAL_HOST")
		.filter(|suffix| suffix.is_empty() || suffix.bytes().all(|b| b.is_ascii_digit()))
		.map(|_| false)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn bare_hostname() {
		let spec = parse("example.com", false).unwrap();

		assert_eq!(spec.scheme, Scheme::Http);
		assert_eq!(spec.hostname, "example.com");
		assert_eq!(spec.server_port, 80);
		assert_eq!(spec.external_path, "/");
		assert_eq!(spec.container_scheme, Scheme::Http);
		assert_eq!(spec.container_port, 0);
		assert_eq!(spec.container_path, "/");
		assert!(!spec.ssl_enabled());
		assert!(spec.extras.is_empty());
	}

	#[test]
	fn https_normalises_port_to_443() {
		let spec = parse("https://app.example.com", false).unwrap();

		assert_eq!(spec.server_port, 443);
		assert!(spec.ssl_enabled());
		assert_eq!(spec.container_scheme, Scheme::Http);
	}

	#[test]
	fn explicit_https_port_80_normalises_too() {
		let spec = parse("https://app.example.com:80", false).unwrap();

		assert_eq!(spec.server_port, 443);
	}

	#[test]
	fn explicit_nonstandard_tls_port_is_kept() {
		let spec = parse("https://app.example.com:8443", false).unwrap();

		assert_eq!(spec.server_port, 8443);
	}

	#[test]
	fn internal_port_and_path() {
		let spec = parse("https://app.example.com -> :8080/api", false).unwrap();

		assert_eq!(spec.container_port, 8080);
		assert_eq!(spec.container_path, "/api");
	}

	#[test]
	fn bare_internal_port_resets_path() {
		let spec = parse("example.com/api -> :8080", false).unwrap();

		assert_eq!(spec.external_path, "/api");
		assert_eq!(spec.container_port, 8080);
		assert_eq!(spec.container_path, "/");
	}

	#[test]
	fn external_path_is_inherited_without_internal() {
		let spec = parse("example.com/api", false).unwrap();

		assert_eq!(spec.external_path, "/api");
		assert_eq!(spec.container_path, "/api");
	}

	#[test]
	fn internal_path_only() {
		let spec = parse("example.com -> /backend", false).unwrap();

		assert_eq!(spec.container_port, 0);
		assert_eq!(spec.container_path, "/backend");
	}

	#[test]
	fn internal_scheme_override() {
		let spec = parse("wss://push.example.com -> ws://:3000/socket", false).unwrap();

		assert_eq!(spec.scheme, Scheme::Wss);
		assert_eq!(spec.server_port, 443);
		assert_eq!(spec.container_scheme, Scheme::Ws);
		assert_eq!(spec.container_port, 3000);
		assert_eq!(spec.container_path, "/socket");
	}

	#[test]
	fn grpc_schemes() {
		let spec = parse("grpcs://rpc.example.com -> :50051", false).unwrap();

		assert!(spec.scheme.is_grpc());
		assert!(spec.ssl_enabled());
		assert_eq!(spec.container_scheme, Scheme::Grpc);
	}

	#[test]
	fn extras_are_split_and_trimmed() {
		let spec = parse(
			"example.com ; client_max_body_size 50m;  proxy_buffering off ; ",
			false,
		)
		.unwrap();

		assert_eq!(
			spec.extras,
			vec!["client_max_body_size 50m".to_string(), "proxy_buffering off".to_string()]
		);
	}

	#[test]
	fn too_many_arrows() {
		assert!(matches!(
			parse("a.com -> :80 -> :90", false),
			Err(ParseError::TooManyArrows(_))
		));
	}

	#[test]
	fn invalid_ports() {
		assert!(matches!(
			parse("a.com:eighty", false),
			Err(ParseError::InvalidPort(_))
		));
		assert!(matches!(
			parse("a.com -> :eighty", false),
			Err(ParseError::InvalidPort(_))
		));
	}

	#[test]
	fn unknown_scheme() {
		assert!(matches!(
			parse("ftp://a.com", false),
			Err(ParseError::UnknownScheme(_))
		));
	}

	#[test]
	fn missing_hostname() {
		assert!(matches!(
			parse(":8080", false),
			Err(ParseError::MissingHostname(_))
		));
	}

	#[test]
	fn internal_hostname_is_rejected() {
		assert!(matches!(
			parse("a.com -> other-host:8080", false),
			Err(ParseError::InvalidInternal(_))
		));
	}

	#[test]
	fn upgrade_to_ssl() {
		let mut spec = parse("ws://push.example.com", false).unwrap();
		spec.upgrade_to_ssl();

		assert_eq!(spec.scheme, Scheme::Wss);
		assert_eq!(spec.server_port, 443);

		let mut spec = parse("example.com:8080", false).unwrap();
		spec.upgrade_to_ssl();

		assert_eq!(spec.scheme, Scheme::Https);
		assert_eq!(spec.server_port, 8080);
	}

	#[test]
	fn round_trips_through_display() {
		for input in [
			"example.com",
			"example.com/api",
			"https://app.example.com -> :8080/api",
			"example.com/api -> :8080",
			"wss://push.example.com -> ws://:3000/socket",
			"grpcs://rpc.example.com -> :50051",
			"example.com -> /backend",
			"https://app.example.com:8443",
		] {
			let spec = parse(input, false).unwrap();
			let reparsed = parse(&spec.to_string(), false).unwrap();

			assert_eq!(spec, reparsed, "round-trip failed for {input:?}");
		}
	}

	#[test]
	fn key_matching() {
		assert_eq!(virtual_host_key("VIRTUAL_HOST"), Some(false));
		assert_eq!(virtual_host_key("VIRTUAL_HOST1"), Some(false));
		assert_eq!(virtual_host_key("VIRTUAL_HOST42"), Some(false));
		assert_eq!(virtual_host_key("STATIC_VIRTUAL_HOST"), Some(true));
		assert_eq!(virtual_host_key("STATIC_VIRTUAL_HOST_DOCS"), Some(true));
		assert_eq!(virtual_host_key("VIRTUAL_HOST_EXTRA"), None);
		assert_eq!(virtual_host_key("VIRTUAL_PORT"), None);
		assert_eq!(virtual_host_key("HOME"), None);
	}

	#[test]
	fn collect_is_sorted_and_keeps_failures() {
		let env = BTreeMap::from([
			("VIRTUAL_HOST2".to_string(), "b.example.com".to_string()),
			("VIRTUAL_HOST".to_string(), "a.example.com".to_string()),
			("VIRTUAL_HOST1".to_string(), ":broken".to_string()),
			("PATH".to_string(), "/bin".to_string()),
		]);

		let collected = collect(&env);
		let keys = collected.iter().map(|(key, _)| key.as_str()).collect::<Vec<_>>();

		assert_eq!(keys, ["VIRTUAL_HOST", "VIRTUAL_HOST1", "VIRTUAL_HOST2"]);
		assert!(collected[0].1.is_ok());
		assert!(collected[1].1.is_err());
		assert!(collected[2].1.is_ok());
	}
}
