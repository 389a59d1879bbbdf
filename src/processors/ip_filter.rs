//! Per-host IP allowlists and trusted-proxy configuration.

use std::collections::BTreeMap;

use ipnet::IpNet;
use tracing::warn;

use crate::{config::Config, model::Host};

/// Parse a comma-separated CIDR list. Bare addresses are upgraded to
/// `/32` (IPv4) or `/128` (IPv6); entries that parse as neither are
/// discarded with a warning.
#[must_use]
pub fn parse_cidr_list(value: &str) -> Vec<IpNet> {
	value
		.split(',')
		.map(str::trim)
		.filter(|entry| !entry.is_empty())
		.filter_map(|entry| {
			if let Ok(net) = entry.parse::<IpNet>() {
				return Some(net);
			}

			if let Ok(addr) = entry.parse::<std::net::IpAddr>() {
				return Some(IpNet::from(addr));
			}

			warn!(entry, "discarding invalid trusted-ip entry");
			None
		})
		.collect()
}

/// Apply the effective IP filter to every host derived for one container.
/// `PROXY_TRUSTED_IPS` and `PROXY_REAL_IP_HEADER` fully override the
/// controller-wide values; a non-empty allowlist turns the filter on with
/// deny-by-default.
pub fn apply(env: &BTreeMap<String, String>, hosts: &mut [Host], config: &Config) {
	let allow = env
		.get("PROXY_TRUSTED_IPS")
		.map_or_else(|| config.trusted_proxy_ips.clone(), |value| parse_cidr_list(value));

	if allow.is_empty() {
		return;
	}

	let real_ip_header = env
		.get("PROXY_REAL_IP_HEADER")
		.cloned()
		.or_else(|| config.real_ip_header.clone());

	for host in hosts {
		host.ip_filter.enabled = true;
		host.ip_filter.deny_all = true;
		host.ip_filter.allow.clone_from(&allow);
		host.ip_filter.real_ip_header.clone_from(&real_ip_header);
		host.ip_filter.recursive = config.real_ip_recursive;
	}
}
