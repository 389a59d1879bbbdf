//! The credential store for protected hosts and locations.
//!
//! `PROXY_BASIC_AUTH` syntax:
//!
//! ```text
//! [host[/path] ->] user:pass[, user2:pass2]*
//! ```
//!
//! Without the `host ->` prefix the credentials protect every host the
//! container declares; with it, only the named host (path `/` or absent
//! meaning host-wide, anything else protecting that location). Passwords
//! are hashed with bcrypt into one file per protected scope, which the
//! generated configuration points the gateway at.

use std::{collections::BTreeMap, io::Error as IoError, path::Path};

use tracing::warn;

use crate::{model::Host, util::atomic_write};

/// Bcrypt work factor for generated password files.
const BCRYPT_COST: u32 = 10;

/// Minimum accepted username and password length.
const MIN_CREDENTIAL_LEN: usize = 3;

/// One parsed `PROXY_BASIC_AUTH` rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Rule {
	/// Hostname the rule applies to; `None` means every derived host
	pub host: Option<String>,
	/// Path within the host; `/` means host-wide
	pub path: String,
	/// Accepted `(user, password)` pairs
	pub users: Vec<(String, String)>,
}

/// Parse a `PROXY_BASIC_AUTH` value. Credential pairs shorter than the
/// minimum are dropped with a warning; returns `None` when nothing valid
/// remains.
pub(crate) fn parse_rule(value: &str) -> Option<Rule> {
	let (scope, credentials) = match value.split_once("->") {
		Some((scope, credentials)) => (Some(scope.trim()), credentials),
		None => (None, value),
	};

	let (host, path) = match scope {
		None | Some("") => (None, "/".to_string()),
		Some(scope) => match scope.find('/') {
			Some(idx) => (Some(scope[..idx].to_string()), scope[idx..].to_string()),
			None => (Some(scope.to_string()), "/".to_string()),
		},
	};

	let users = credentials
		.split(',')
		.map(str::trim)
		.filter(|pair| !pair.is_empty())
		.filter_map(|pair| {
			let (user, pass) = pair.split_once(':')?;
			if user.len() < MIN_CREDENTIAL_LEN || pass.len() < MIN_CREDENTIAL_LEN {
				warn!(user, "dropping basic-auth pair with too-short username or password");
				return None;
			}
			Some((user.to_string(), pass.to_string()))
		})
		.collect::<Vec<_>>();

	if users.is_empty() {
		None
	} else {
		Some(Rule { host, path, users })
	}
}

/// File name for a protected scope: `example.com.htpasswd` host-wide,
/// `example.com_api.htpasswd` for `/api`.
fn file_name(hostname: &str, path: &str) -> String {
	if path == "/" {
		format!("{hostname}.htpasswd")
	} else {
		format!("{hostname}_{}.htpasswd", path.trim_matches('/').replace('/', "_"))
	}
}

/// Apply `PROXY_BASIC_AUTH` to the hosts derived for one container,
/// writing the password file and marking the matching host or location.
///
/// # Errors
/// Returns an error when hashing fails or the password file cannot be
/// written; the caller logs it and the cycle continues without the
/// protection applied.
pub fn apply(
	env: &BTreeMap<String, String>,
	hosts: &mut [Host],
	htpasswd_dir: &Path,
) -> Result<(), IoError> {
	let Some(rule) = env.get("PROXY_BASIC_AUTH").and_then(|value| parse_rule(value)) else {
		return Ok(());
	};

	let mut entries = String::new();
	for (user, pass) in &rule.users {
		let hash = bcrypt::hash(pass, BCRYPT_COST).map_err(IoError::other)?;
		entries.push_str(user);
		entries.push(':');
		entries.push_str(&hash);
		entries.push('\n');
	}

	for host in hosts.iter_mut() {
		if rule.host.as_deref().is_some_and(|name| name != host.hostname) {
			continue;
		}

		let file = htpasswd_dir.join(file_name(&host.hostname, &rule.path));
		std::fs::create_dir_all(htpasswd_dir)?;
		atomic_write(&file, entries.as_bytes(), 0o644)?;

		let file = file.to_string_lossy().into_owned();

		if rule.path == "/" {
			host.auth.enabled = true;
			host.auth.file = file;
		} else if let Some(location) = host.locations.get_mut(&rule.path) {
			location.auth.enabled = true;
			location.auth.file = file;
		} else {
			warn!(
				hostname = host.hostname,
				path = rule.path,
				"basic-auth rule names a location the host does not have"
			);
		}
	}

	Ok(())
}
