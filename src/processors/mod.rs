//! Stateless decorators layered on the routing model.
//!
//! Processors read additional environment keys of a container and decorate
//! the hosts derived for it before the reconciler merges them into the
//! model: credentials for protected hosts and locations, cross-domain
//! redirects, default-server candidacy, and IP allowlists. They never
//! touch the model itself and never hold the reconciler's lock; anything
//! that needs a global view (redirect target stubs, the default-server
//! election) is resolved later, during render consolidation.

pub mod basic_auth;
pub mod default_server;
pub mod ip_filter;
pub mod redirect;

use std::collections::BTreeMap;

use tracing::warn;

use crate::{config::Config, model::Host};

/// Run every processor over the hosts derived for one container.
pub fn apply_all(
	env: &BTreeMap<String, String>,
	hosts: &mut Vec<Host>,
	container_id: &str,
	config: &Config,
) {
	ip_filter::apply(env, hosts, config);

	if let Err(err) = basic_auth::apply(env, hosts, &config.htpasswd_dir) {
		warn!(%err, container = container_id, "could not write basic-auth credentials");
	}

	redirect::apply(env, hosts, container_id);
	default_server::apply(env, hosts);
}
