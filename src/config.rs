//! Controller configuration.
//!
//! The controller itself is configured entirely through its own process
//! environment (the routing intent lives in *container* environments and is
//! handled by [`crate::spec`]). The following variables are read:
//!
//! - `NGINX_CONF_DIR` - Directory the generated gateway configuration is
//!   written into. **Default `/etc/nginx/conf.d`**.
//! - `CHALLENGE_DIR` - Directory ACME HTTP-01 challenge tokens are written
//!   into. **Default `/usr/share/nginx/challenge`**.
//! - `SSL_DIR` - Root of the certificate store (`certs/`, `private/`,
//!   `accounts/`). **Default `/etc/nginx/ssl`**.
//! - `HTPASSWD_DIR` - Directory generated basic-auth files are written
//!   into. **Default `/etc/nginx/htpasswd`**.
//! - `CLIENT_MAX_BODY_SIZE` - Value for the `client_max_body_size`
//!   directive, e.g. `100m`. **No default** (nginx's own default applies).
//! - `DHPARAM_SIZE` - Bit size of the generated Diffie-Hellman parameters.
//!   **Default `2048`**.
//! - `DEFAULT_HOST` - Hostname elected as the default server when no
//!   container asks for the role itself. **No default**.
//! - `LETSENCRYPT_API` - ACME directory URL. **Default Let's Encrypt v2
//!   production**.
//! - `TRUSTED_PROXY_IPS` - Global comma-separated CIDR allowlist applied to
//!   every host without a per-container override. **No default**.
//! - `REAL_IP_HEADER` - Header carrying the client address when behind
//!   another proxy, e.g. `X-Forwarded-For`. **No default**.
//! - `REAL_IP_RECURSIVE` - Whether real-IP substitution recurses. **Default
//!   `false`**.
//! - `LOG_LEVEL` - Tracing filter directive. **Default `info`**.

use std::{collections::HashMap, path::PathBuf};

use ipnet::IpNet;

use crate::processors::ip_filter::parse_cidr_list;

/// The ACME directory used when `LETSENCRYPT_API` is not set.
pub const DEFAULT_ACME_API: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// The error returned when the controller environment is invalid.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
	/// A numeric variable failed to parse
	#[error("environment variable {key} has non-numeric value {value:?}")]
	InvalidNumber {
		/// The variable name
		key: &'static str,
		/// The rejected value
		value: String,
	},
}

/// Immutable controller configuration, parsed once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
	/// Directory the generated gateway configuration is written into
	pub nginx_conf_dir: PathBuf,
	/// Directory ACME HTTP-01 challenge tokens are served from
	pub challenge_dir: PathBuf,
	/// Root of the certificate store
	pub ssl_dir: PathBuf,
	/// Directory generated basic-auth files are written into
	pub htpasswd_dir: PathBuf,
	/// Optional `client_max_body_size` value, passed through verbatim
	pub client_max_body_size: Option<String>,
	/// Bit size of the generated Diffie-Hellman parameters
	pub dhparam_size: u32,
	/// Hostname elected as default server when no container claims the role
	pub default_host: Option<String>,
	/// ACME directory URL
	pub acme_url: String,
	/// Global trusted-proxy allowlist, overridable per container
	pub trusted_proxy_ips: Vec<IpNet>,
	/// Global real-IP header, overridable per container
	pub real_ip_header: Option<String>,
	/// Global real-IP recursion flag, overridable per container
	pub real_ip_recursive: bool,
}

impl Config {
	/// Parse the configuration from this process's environment.
	///
	/// # Errors
	/// Returns an error if a numeric variable has a non-numeric value.
	/// Invalid `TRUSTED_PROXY_IPS` entries are discarded with a warning
	/// rather than failing startup.
	pub fn from_env() -> Result<Self, ConfigError> {
		Self::from_vars(&std::env::vars().collect())
	}

	/// Parse the configuration from an explicit variable map. This is what
	/// [`Config::from_env`] does under the hood and what tests call
	/// directly.
	///
	/// # Errors
	/// Returns an error if a numeric variable has a non-numeric value.
	pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
		let path = |key: &str, default: &str| {
			PathBuf::from(vars.get(key).map_or(default, String::as_str))
		};

		let non_empty = |key: &str| {
			vars.get(key)
				.map(|val| val.trim())
				.filter(|val| !val.is_empty())
				.map(str::to_string)
		};

		let dhparam_size = match vars.get("DHPARAM_SIZE") {
			None => 2048,
			Some(val) => val.parse().map_err(|_| ConfigError::InvalidNumber {
				key: "DHPARAM_SIZE",
				value: val.clone(),
			})?,
		};

		let trusted_proxy_ips = vars
			.get("TRUSTED_PROXY_IPS")
			.map(|val| parse_cidr_list(val))
			.unwrap_or_default();

		Ok(Self {
			nginx_conf_dir: path("NGINX_CONF_DIR", "/etc/nginx/conf.d"),
			challenge_dir: path("CHALLENGE_DIR", "/usr/share/nginx/challenge"),
			ssl_dir: path("SSL_DIR", "/etc/nginx/ssl"),
			htpasswd_dir: path("HTPASSWD_DIR", "/etc/nginx/htpasswd"),
			client_max_body_size: non_empty("CLIENT_MAX_BODY_SIZE"),
			dhparam_size,
			default_host: non_empty("DEFAULT_HOST"),
			acme_url: non_empty("LETSENCRYPT_API").unwrap_or_else(|| DEFAULT_ACME_API.to_string()),
			trusted_proxy_ips,
			real_ip_header: non_empty("REAL_IP_HEADER"),
			real_ip_recursive: vars
				.get("REAL_IP_RECURSIVE")
				.is_some_and(|val| val.eq_ignore_ascii_case("true")),
		})
	}

	/// Path of the generated gateway configuration file.
	#[must_use]
	pub fn conf_path(&self) -> PathBuf {
		self.nginx_conf_dir.join("default.conf")
	}

	/// Path of the generated Diffie-Hellman parameter file.
	#[must_use]
	pub fn dhparam_path(&self) -> PathBuf {
		self.ssl_dir.join("dhparam.pem")
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
		pairs
			.iter()
			.map(|(k, v)| ((*k).to_string(), (*v).to_string()))
			.collect()
	}

	#[test]
	fn defaults() {
		let config = Config::from_vars(&HashMap::new()).unwrap();

		assert_eq!(config.nginx_conf_dir, PathBuf::from("/etc/nginx/conf.d"));
		assert_eq!(config.conf_path(), PathBuf::from("/etc/nginx/conf.d/default.conf"));
		assert_eq!(config.ssl_dir, PathBuf::from("/etc/nginx/ssl"));
		assert_eq!(config.dhparam_size, 2048);
		assert_eq!(config.acme_url, DEFAULT_ACME_API);
		assert_eq!(config.client_max_body_size, None);
		assert!(!config.real_ip_recursive);
		assert!(config.trusted_proxy_ips.is_empty());
	}

	#[test]
	fn explicit_values() {
		let config = Config::from_vars(&vars(&[
			("NGINX_CONF_DIR", "/tmp/conf"),
			("CLIENT_MAX_BODY_SIZE", "100m"),
			("DHPARAM_SIZE", "4096"),
			("DEFAULT_HOST", "example.com"),
			("TRUSTED_PROXY_IPS", "10.0.0.0/8, 192.168.1.1"),
			("REAL_IP_HEADER", "X-Forwarded-For"),
			("REAL_IP_RECURSIVE", "true"),
		]))
		.unwrap();

		assert_eq!(config.nginx_conf_dir, PathBuf::from("/tmp/conf"));
		assert_eq!(config.client_max_body_size.as_deref(), Some("100m"));
		assert_eq!(config.dhparam_size, 4096);
		assert_eq!(config.default_host.as_deref(), Some("example.com"));
		assert_eq!(config.trusted_proxy_ips.len(), 2);
		assert_eq!(
			config.trusted_proxy_ips[1],
			"192.168.1.1/32".parse::<IpNet>().unwrap()
		);
		assert!(config.real_ip_recursive);
	}

	#[test]
	fn bad_number_is_an_error() {
		let err = Config::from_vars(&vars(&[("DHPARAM_SIZE", "big")])).unwrap_err();

		assert!(matches!(err, ConfigError::InvalidNumber { key: "DHPARAM_SIZE", .. }));
	}

	#[test]
	fn invalid_cidr_entries_are_discarded() {
		let config =
			Config::from_vars(&vars(&[("TRUSTED_PROXY_IPS", "10.0.0.0/8, not-a-net")])).unwrap();

		assert_eq!(config.trusted_proxy_ips.len(), 1);
	}
}
