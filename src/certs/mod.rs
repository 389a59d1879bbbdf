//! Certificate storage, issuance policy, and renewal.
//!
//! The on-disk layout under the SSL root is the persistent ground truth:
//!
//! ```text
//! certs/<name>.crt          world-readable certificates
//! private/<name>.key        private keys, 0600
//! accounts/<name>.account.key   ACME account keys, 0600
//! ```
//!
//! In-memory state is only a cache of expiry instants. Per domain, the
//! resolution policy is: a valid certificate on disk wins; then a wildcard
//! parent; then, for blacklisted domains, a self-signed fallback; and only
//! then an ACME order. A failed order blacklists the domain for three
//! hours and falls back to self-signed so the TLS server keeps answering.
//! The renewal loop re-issues everything within a week of expiry, once a
//! day, and is joined on shutdown.

mod selfsigned;

pub(crate) use selfsigned::load_or_create_rsa;

use std::{
	collections::HashMap,
	fmt::Debug,
	path::{Path, PathBuf},
	sync::Arc,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use time::{Duration, OffsetDateTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{acme::AcmeError, util::atomic_write};

/// Minimum remaining validity for a certificate on disk to be used as-is.
const MIN_VALIDITY: Duration = Duration::days(2);

/// How long a domain stays blacklisted after a failed ACME order.
const BLACKLIST_TTL: Duration = Duration::hours(3);

/// Renew certificates with at most this many days of validity left.
const RENEW_BELOW_DAYS: i64 = 7;

/// Cadence of the renewal loop.
const RENEW_INTERVAL: std::time::Duration = std::time::Duration::from_secs(24 * 60 * 60);

/// The name of the synthetic catch-all certificate (hostname `_`).
pub const DEFAULT_CERT_NAME: &str = "default";

/// The error returned by certificate storage and fallback generation.
#[derive(Debug, thiserror::Error)]
pub enum CertError {
	/// Certificate store I/O failed
	#[error("certificate store i/o failed: {0}")]
	Io(#[from] std::io::Error),
	/// Key or certificate handling failed
	#[error("certificate handling failed: {0}")]
	Crypto(#[from] openssl::error::ErrorStack),
}

/// Certificate issuance, implemented by the ACME client and by test
/// stand-ins. Writes the certificate chain to `cert_out` on success.
#[async_trait]
pub trait Issuer: Debug + Send + Sync {
	/// Obtain a certificate for `domain`.
	///
	/// # Errors
	/// Returns an error when the order cannot be completed; the caller
	/// blacklists the domain and falls back to self-signed.
	async fn issue(
		&self,
		domain: &str,
		account_key: &Path,
		domain_key: &Path,
		cert_out: &Path,
	) -> Result<(), AcmeError>;
}

/// Path layout of the certificate store.
#[derive(Debug, Clone)]
pub struct CertStore {
	ssl_dir: PathBuf,
}

impl CertStore {
	/// A store rooted at `ssl_dir`.
	#[must_use]
	pub fn new(ssl_dir: PathBuf) -> Self {
		Self { ssl_dir }
	}

	/// Create the layout directories. Key directories are not readable by
	/// other users.
	///
	/// # Errors
	/// Returns an error if a directory cannot be created or chmodded.
	pub fn ensure_layout(&self) -> Result<(), CertError> {
		use std::{fs::Permissions, os::unix::fs::PermissionsExt};

		std::fs::create_dir_all(self.ssl_dir.join("certs"))?;
		for private in ["private", "accounts"] {
			let dir = self.ssl_dir.join(private);
			std::fs::create_dir_all(&dir)?;
			std::fs::set_permissions(&dir, Permissions::from_mode(0o700))?;
		}

		Ok(())
	}

	/// Path of the certificate named `name`.
	#[must_use]
	pub fn cert_path(&self, name: &str) -> PathBuf {
		self.ssl_dir.join("certs").join(format!("{name}.crt"))
	}

	/// Path of the private key named `name`.
	#[must_use]
	pub fn key_path(&self, name: &str) -> PathBuf {
		self.ssl_dir.join("private").join(format!("{name}.key"))
	}

	/// Path of the ACME account key named `name`.
	#[must_use]
	pub fn account_key_path(&self, name: &str) -> PathBuf {
		self.ssl_dir
			.join("accounts")
			.join(format!("{name}.account.key"))
	}

	/// The `notAfter` instant of the stored certificate `name`, or `None`
	/// when there is no such certificate. An unparsable certificate is
	/// treated as absent, with a warning, so a corrupt file degrades into
	/// re-issuance instead of a stuck host.
	///
	/// # Errors
	/// Returns an error only for I/O failures other than the file being
	/// absent.
	pub fn not_after(&self, name: &str) -> Result<Option<OffsetDateTime>, CertError> {
		let path = self.cert_path(name);

		let pem = match std::fs::read(&path) {
			Ok(pem) => pem,
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
			Err(err) => return Err(err.into()),
		};

		match selfsigned::not_after(&pem) {
			Ok(instant) => Ok(Some(instant)),
			Err(err) => {
				warn!(%err, path = %path.display(), "ignoring unparsable certificate");
				Ok(None)
			}
		}
	}
}

/// Cached per-domain certificate state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CertState {
	not_after: OffsetDateTime,
	self_signed: bool,
}

/// Stores, issues, renews, and falls back certificates per domain.
#[derive(Debug)]
pub struct CertificateManager {
	store: CertStore,
	issuer: Arc<dyn Issuer>,
	state: Mutex<HashMap<String, CertState>>,
	blacklist: Mutex<HashMap<String, OffsetDateTime>>,
}

impl CertificateManager {
	/// A manager over `ssl_dir` issuing through `issuer`. Creates the
	/// store layout.
	///
	/// # Errors
	/// Returns an error if the store directories cannot be created.
	pub fn new(ssl_dir: PathBuf, issuer: Arc<dyn Issuer>) -> Result<Self, CertError> {
		let store = CertStore::new(ssl_dir);
		store.ensure_layout()?;

		Ok(Self {
			store,
			issuer,
			state: Mutex::new(HashMap::new()),
			blacklist: Mutex::new(HashMap::new()),
		})
	}

	/// The underlying path layout.
	#[must_use]
	pub const fn store(&self) -> &CertStore {
		&self.store
	}

	/// Resolve the certificate name for `domain`, issuing, falling back,
	/// or reusing as the policy dictates. The returned name plugs into the
	/// rendered configuration's certificate paths.
	///
	/// # Errors
	/// Returns an error only when even the self-signed fallback cannot be
	/// produced.
	pub async fn certificate_for(&self, domain: &str) -> Result<String, CertError> {
		let now = OffsetDateTime::now_utc();

		if let Some(not_after) = self.store.not_after(domain)? {
			if not_after - now > MIN_VALIDITY {
				self.cache(domain, not_after, false);
				return Ok(domain.to_string());
			}
		}

		if let Some(wildcard) = wildcard_name(domain) {
			if let Some(not_after) = self.store.not_after(&wildcard)? {
				if not_after - now > MIN_VALIDITY {
					debug!(domain, wildcard, "using wildcard parent certificate");
					return Ok(wildcard);
				}
			}
		}

		if self.is_blacklisted(domain) {
			debug!(domain, "domain is blacklisted, using self-signed certificate");
			return self.ensure_self_signed(domain);
		}

		self.issue_or_fall_back(domain).await
	}

	/// Order a certificate for `domain`; on failure blacklist it and fall
	/// back to self-signed.
	async fn issue_or_fall_back(&self, domain: &str) -> Result<String, CertError> {
		let issued = self
			.issuer
			.issue(
				domain,
				&self.store.account_key_path(domain),
				&self.store.key_path(domain),
				&self.store.cert_path(domain),
			)
			.await;

		match issued {
			Ok(()) => {
				let not_after = self.store.not_after(domain)?.unwrap_or_else(|| {
					warn!(domain, "issued certificate is missing on disk");
					OffsetDateTime::now_utc()
				});
				self.cache(domain, not_after, false);
				info!(domain, %not_after, "certificate issued");
				Ok(domain.to_string())
			}
			Err(err) => {
				warn!(%err, domain, "certificate order failed, blacklisting domain");
				self.blacklist
					.lock()
					.insert(domain.to_string(), OffsetDateTime::now_utc() + BLACKLIST_TTL);
				self.ensure_self_signed(domain)
			}
		}
	}

	/// Make sure a self-signed certificate exists for `domain` and return
	/// its name (`<domain>.selfsigned`).
	///
	/// # Errors
	/// Returns an error if generation or the write fails.
	pub fn ensure_self_signed(&self, domain: &str) -> Result<String, CertError> {
		let name = format!("{domain}.selfsigned");
		let now = OffsetDateTime::now_utc();

		if let Some(not_after) = self.store.not_after(&name)? {
			if not_after - now > MIN_VALIDITY {
				self.cache(domain, not_after, true);
				return Ok(name);
			}
		}

		let (cert_pem, key) = selfsigned::self_signed_pair(domain)?;
		atomic_write(&self.store.key_path(&name), &key.private_key_to_pem_pkcs8()?, 0o600)?;
		atomic_write(&self.store.cert_path(&name), &cert_pem, 0o644)?;

		let not_after = selfsigned::not_after(&cert_pem)?;
		self.cache(domain, not_after, true);
		info!(domain, "self-signed certificate generated");

		Ok(name)
	}

	/// Provision the synthetic catch-all certificate (hostname `_`) used
	/// by the default TLS server.
	///
	/// # Errors
	/// Returns an error if generation or the write fails.
	pub fn ensure_default(&self) -> Result<(), CertError> {
		let now = OffsetDateTime::now_utc();
		if let Some(not_after) = self.store.not_after(DEFAULT_CERT_NAME)? {
			if not_after - now > MIN_VALIDITY {
				return Ok(());
			}
		}

		let (cert_pem, key) = selfsigned::self_signed_pair("_")?;
		atomic_write(
			&self.store.key_path(DEFAULT_CERT_NAME),
			&key.private_key_to_pem_pkcs8()?,
			0o600,
		)?;
		atomic_write(&self.store.cert_path(DEFAULT_CERT_NAME), &cert_pem, 0o644)?;
		info!("default catch-all certificate generated");

		Ok(())
	}

	/// Generate the Diffie-Hellman parameter file referenced by the TLS
	/// servers, if it does not exist yet. Generation is CPU-heavy; call
	/// through `spawn_blocking` from async contexts.
	///
	/// # Errors
	/// Returns an error if generation or the write fails.
	pub fn ensure_dhparam(&self, path: &Path, bits: u32) -> Result<(), CertError> {
		if path.exists() {
			return Ok(());
		}

		info!(bits, "generating Diffie-Hellman parameters, this can take a while");
		let dh = openssl::dh::Dh::generate_params(bits, 2)?;
		atomic_write(path, &dh.params_to_pem()?, 0o644)?;

		Ok(())
	}

	/// Whether `domain` is currently blacklisted.
	#[must_use]
	pub fn is_blacklisted(&self, domain: &str) -> bool {
		let now = OffsetDateTime::now_utc();
		let mut blacklist = self.blacklist.lock();

		match blacklist.get(domain) {
			Some(until) if *until > now => true,
			Some(_) => {
				blacklist.remove(domain);
				false
			}
			None => false,
		}
	}

	/// One pass of the renewal policy: re-issue every cached domain within
	/// [`RENEW_BELOW_DAYS`] of expiry, and retry self-signed fallbacks
	/// whose blacklist has lapsed.
	pub async fn renew_due(&self) {
		let now = OffsetDateTime::now_utc();
		let snapshot = self
			.state
			.lock()
			.iter()
			.map(|(domain, state)| (domain.clone(), *state))
			.collect::<Vec<_>>();

		for (domain, state) in snapshot {
			let days_remaining = (state.not_after - now).whole_days();
			let due = state.self_signed || days_remaining <= RENEW_BELOW_DAYS;

			if !due {
				continue;
			}

			if self.is_blacklisted(&domain) {
				debug!(domain, "renewal due but domain still blacklisted");
				continue;
			}

			debug!(domain, days_remaining, "renewing certificate");
			if let Err(err) = self.issue_or_fall_back(&domain).await {
				warn!(%err, domain, "certificate renewal failed");
			}
		}
	}

	/// The daily renewal loop. Runs until cancelled; the caller joins the
	/// task on shutdown.
	pub async fn run_renewal_loop(&self, cancel: CancellationToken) {
		let mut ticker = tokio::time::interval(RENEW_INTERVAL);
		// The first tick fires immediately; startup just resolved every
		// certificate, so skip it.
		ticker.tick().await;

		loop {
			tokio::select! {
				() = cancel.cancelled() => {
					debug!("renewal loop cancelled");
					return;
				}
				_ = ticker.tick() => self.renew_due().await,
			}
		}
	}

	fn cache(&self, domain: &str, not_after: OffsetDateTime, self_signed: bool) {
		self.state.lock().insert(
			domain.to_string(),
			CertState {
				not_after,
				self_signed,
			},
		);
	}

	#[cfg(test)]
	fn cache_for_test(&self, domain: &str, not_after: OffsetDateTime, self_signed: bool) {
		self.cache(domain, not_after, self_signed);
	}
}

/// The wildcard parent of a domain: the leftmost label replaced by `*`.
/// `None` when the remainder would not be a plausible certificate subject.
fn wildcard_name(domain: &str) -> Option<String> {
	let (_, parent) = domain.split_once('.')?;

	if parent.contains('.') {
		Some(format!("*.{parent}"))
	} else {
		None
	}
}
