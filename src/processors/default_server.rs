//! Default-server candidacy.
//!
//! A container with `PROXY_DEFAULT_SERVER=true` nominates its hosts for
//! the gateway's default-server role. Several containers may nominate;
//! render consolidation keeps exactly one flagged host (the first in
//! renderer iteration order) and clears the rest.

use std::collections::BTreeMap;

use crate::model::Host;

/// Mark every host derived for this container as a default-server
/// candidate when the container asks for the role.
pub fn apply(env: &BTreeMap<String, String>, hosts: &mut [Host]) {
	let nominated = env
		.get("PROXY_DEFAULT_SERVER")
		.is_some_and(|value| value.eq_ignore_ascii_case("true"));

	if !nominated {
		return;
	}

	for host in hosts {
		host.is_default_server = true;
	}
}
