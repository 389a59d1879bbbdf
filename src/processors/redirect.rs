//! Cross-domain redirect rules.
//!
//! `PROXY_FULL_REDIRECT` syntax:
//!
//! ```text
//! src1[,src2,...] -> target
//! ```
//!
//! Every source hostname becomes a redirect-mode host answering 301 to the
//! target, preserving the request URI. An empty target defers to render
//! consolidation, which substitutes the only real host when exactly one
//! exists. The redirect scheme (`http` or `https`) follows the target
//! host's TLS state, also resolved at consolidation.

use std::collections::BTreeMap;

use tracing::warn;

use crate::model::Host;

/// Parse a `PROXY_FULL_REDIRECT` value into `(sources, target)`.
pub(crate) fn parse_rule(value: &str) -> Option<(Vec<String>, String)> {
	let Some((sources, target)) = value.split_once("->") else {
		warn!(value, "ignoring redirect rule without \"->\"");
		return None;
	};

	let sources = sources
		.split(',')
		.map(str::trim)
		.filter(|source| !source.is_empty())
		.map(str::to_string)
		.collect::<Vec<_>>();

	if sources.is_empty() {
		warn!(value, "ignoring redirect rule without sources");
		return None;
	}

	Some((sources, target.trim().to_string()))
}

/// Append a redirect stub for every source named by the container's
/// `PROXY_FULL_REDIRECT`. Stubs are owned by the container so they
/// disappear with it.
pub fn apply(env: &BTreeMap<String, String>, hosts: &mut Vec<Host>, container_id: &str) {
	let Some((sources, target)) = env.get("PROXY_FULL_REDIRECT").and_then(|value| parse_rule(value))
	else {
		return;
	};

	for source in sources {
		hosts.push(Host::redirect_stub(source, target.clone(), container_id));
	}
}
