//! A minimal ACMEv2 client, sufficient for HTTP-01 issuance.
//!
//! The implemented RFC 8555 subset: directory discovery, `newNonce`,
//! account registration (terms agreed, account URL captured as the JWS
//! `kid`), order creation, HTTP-01 authorisation fulfilment, CSR
//! finalisation, and certificate download. Order state machine:
//! `pending -> ready -> processing -> valid | invalid`; per
//! authorisation: `pending -> valid | invalid`. Polling is bounded with a
//! fixed delay; transport errors are retried a handful of times before
//! surfacing.

mod jws;

use std::{
	path::{Path, PathBuf},
	time::Duration,
};

use async_trait::async_trait;
use openssl::{
	hash::MessageDigest,
	pkey::{PKey, Private},
	stack::Stack,
	x509::{extension::SubjectAlternativeName, X509NameBuilder, X509ReqBuilder},
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::{certs::Issuer, util::atomic_write};

/// Fixed delay between authorisation and order polls.
const POLL_DELAY: Duration = Duration::from_secs(3);

/// Maximum polls while a challenge or order stays pending.
const MAX_POLLS: u32 = 10;

/// Transport-level retries per request.
const TRANSPORT_RETRIES: u32 = 3;

/// The error returned by ACME operations.
#[derive(Debug, thiserror::Error)]
pub enum AcmeError {
	/// An HTTP request could not be completed
	#[error("acme request to {url} failed: {message}")]
	Transport {
		/// The request URL
		url: String,
		/// The transport failure
		message: String,
	},
	/// The server answered with an error document
	#[error("acme server rejected {what}: {message}")]
	Protocol {
		/// Which step was rejected
		what: &'static str,
		/// The server's error document or status
		message: String,
	},
	/// A challenge or authorisation failed validation
	#[error("authorization for {domain} ended in status {status:?}")]
	Challenge {
		/// The domain under validation
		domain: String,
		/// The final authorisation status
		status: String,
	},
	/// Polling gave up while the server was still processing
	#[error("gave up polling, last status {status:?}")]
	PollTimeout {
		/// The last observed status
		status: String,
	},
	/// A response lacked a field the protocol requires
	#[error("acme response is missing {what}")]
	Missing {
		/// The absent field or header
		what: &'static str,
	},
	/// Challenge file or certificate I/O failed
	#[error("acme file i/o failed: {0}")]
	Io(#[from] std::io::Error),
	/// Key or CSR handling failed
	#[error("acme crypto failed: {0}")]
	Crypto(#[from] openssl::error::ErrorStack),
}

#[derive(Debug, Deserialize)]
struct DirectoryDocument {
	#[serde(rename = "newNonce")]
	new_nonce: String,
	#[serde(rename = "newAccount")]
	new_account: String,
	#[serde(rename = "newOrder")]
	new_order: String,
}

#[derive(Debug, Deserialize)]
struct OrderDocument {
	status: String,
	#[serde(default)]
	authorizations: Vec<String>,
	finalize: String,
	certificate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AuthorizationDocument {
	status: String,
	identifier: Identifier,
	#[serde(default)]
	challenges: Vec<ChallengeDocument>,
}

#[derive(Debug, Deserialize)]
struct Identifier {
	value: String,
}

#[derive(Debug, Deserialize)]
struct ChallengeDocument {
	#[serde(rename = "type")]
	typ: String,
	url: String,
	token: String,
}

/// The ACME client. One instance serves any number of orders; account
/// and domain keys are loaded (or created) per call from the paths the
/// certificate store hands in.
#[derive(Debug, Clone)]
pub struct AcmeClient {
	http: reqwest::Client,
	directory_url: String,
	challenge_dir: PathBuf,
}

impl AcmeClient {
	/// A client against `directory_url`, writing HTTP-01 tokens into
	/// `challenge_dir`.
	///
	/// # Errors
	/// Returns an error if the HTTP client cannot be constructed.
	pub fn new(directory_url: String, challenge_dir: PathBuf) -> Result<Self, AcmeError> {
		let http = reqwest::Client::builder()
			.timeout(Duration::from_secs(30))
			.build()
			.map_err(|err| AcmeError::Transport {
				url: directory_url.clone(),
				message: err.to_string(),
			})?;

		Ok(Self {
			http,
			directory_url,
			challenge_dir,
		})
	}

	/// Order a certificate for `domains` (the first one is the subject,
	/// all of them become SANs) and write the chain to `cert_out`.
	///
	/// # Errors
	/// Returns an error when any step of the order cannot be completed;
	/// nothing is written to `cert_out` in that case.
	pub async fn order(
		&self,
		domains: &[String],
		account_key_path: &Path,
		domain_key_path: &Path,
		cert_out: &Path,
	) -> Result<(), AcmeError> {
		let account_key = crate::certs::load_or_create_rsa(account_key_path)
			.map_err(|err| AcmeError::Protocol {
				what: "account key",
				message: err.to_string(),
			})?;

		let directory: DirectoryDocument = self
			.get_json(&self.directory_url)
			.await?;

		let mut session = Session {
			client: self,
			account_key,
			kid: None,
			nonce: self.fetch_nonce(&directory.new_nonce).await?,
		};

		session.register_account(&directory.new_account).await?;

		info!(?domains, "creating certificate order");
		let identifiers = domains
			.iter()
			.map(|domain| json!({ "type": "dns", "value": domain }))
			.collect::<Vec<_>>();

		let (order_url, order) = session
			.post_for_order(
				&directory.new_order,
				&json!({ "identifiers": identifiers }).to_string(),
			)
			.await?;

		for authz_url in &order.authorizations {
			session.fulfil_authorization(authz_url).await?;
		}

		let domain_key = crate::certs::load_or_create_rsa(domain_key_path)
			.map_err(|err| AcmeError::Protocol {
				what: "domain key",
				message: err.to_string(),
			})?;
		let csr = certificate_request(domains, &domain_key)?;

		let finalized = session
			.post_json::<OrderDocument>(&order.finalize, &json!({ "csr": csr }).to_string())
			.await?;

		let order = session.poll_order(&order_url, finalized).await?;

		let certificate_url = order
			.certificate
			.ok_or(AcmeError::Missing {
				what: "certificate URL",
			})?;

		let chain = session.post_raw(&certificate_url, "").await?;
		atomic_write(cert_out, chain.as_bytes(), 0o644)?;
		info!(?domains, path = %cert_out.display(), "certificate downloaded");

		Ok(())
	}

	async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, AcmeError> {
		let response = self
			.http
			.get(url)
			.send()
			.await
			.map_err(|err| AcmeError::Transport {
				url: url.to_string(),
				message: err.to_string(),
			})?;

		response.json().await.map_err(|err| AcmeError::Transport {
			url: url.to_string(),
			message: err.to_string(),
		})
	}

	async fn fetch_nonce(&self, new_nonce_url: &str) -> Result<String, AcmeError> {
		let response = self
			.http
			.head(new_nonce_url)
			.send()
			.await
			.map_err(|err| AcmeError::Transport {
				url: new_nonce_url.to_string(),
				message: err.to_string(),
			})?;

		nonce_from(&response).ok_or(AcmeError::Missing {
			what: "Replay-Nonce header",
		})
	}
}

fn nonce_from(response: &reqwest::Response) -> Option<String> {
	response
		.headers()
		.get("replay-nonce")
		.and_then(|value| value.to_str().ok())
		.map(str::to_string)
}

/// One signing session: the account key, the `kid` once registered, and
/// the rolling nonce.
struct Session<'a> {
	client: &'a AcmeClient,
	account_key: PKey<Private>,
	kid: Option<String>,
	nonce: String,
}

impl Session<'_> {
	/// Register (or look up) the account and capture its URL as the `kid`
	/// for all subsequent requests.
	async fn register_account(&mut self, new_account_url: &str) -> Result<(), AcmeError> {
		let payload = json!({ "termsOfServiceAgreed": true }).to_string();
		let response = self.signed_post(new_account_url, &payload).await?;

		let kid = response
			.headers()
			.get("location")
			.and_then(|value| value.to_str().ok())
			.map(str::to_string)
			.ok_or(AcmeError::Missing {
				what: "account Location header",
			})?;

		debug!(kid, "acme account ready");
		self.kid = Some(kid);

		Ok(())
	}

	/// Create an order, returning its URL (from `Location`) and document.
	async fn post_for_order(
		&mut self,
		url: &str,
		payload: &str,
	) -> Result<(String, OrderDocument), AcmeError> {
		let response = self.signed_post(url, payload).await?;

		let order_url = response
			.headers()
			.get("location")
			.and_then(|value| value.to_str().ok())
			.map(str::to_string)
			.ok_or(AcmeError::Missing {
				what: "order Location header",
			})?;

		let order = response.json().await.map_err(|err| AcmeError::Transport {
			url: url.to_string(),
			message: err.to_string(),
		})?;

		Ok((order_url, order))
	}

	/// Drive one authorisation through the HTTP-01 challenge: write the
	/// key authorisation file, notify the server, and poll until the
	/// authorisation leaves `pending`.
	async fn fulfil_authorization(&mut self, authz_url: &str) -> Result<(), AcmeError> {
		let authz: AuthorizationDocument = self.post_json(authz_url, "").await?;
		let domain = authz.identifier.value.clone();

		if authz.status == "valid" {
			debug!(domain, "authorization already valid");
			return Ok(());
		}

		let challenge = authz
			.challenges
			.iter()
			.find(|challenge| challenge.typ == "http-01")
			.ok_or(AcmeError::Missing {
				what: "http-01 challenge",
			})?;

		let key_authorization = format!(
			"{}.{}",
			challenge.token,
			jws::thumbprint(&self.account_key)?
		);

		std::fs::create_dir_all(&self.client.challenge_dir)?;
		let token_path = self.client.challenge_dir.join(&challenge.token);
		atomic_write(&token_path, key_authorization.as_bytes(), 0o644)?;
		debug!(domain, path = %token_path.display(), "challenge token written");

		// Empty JSON object: "I am ready, go validate".
		let challenge_url = challenge.url.clone();
		let _: Value = self.post_json(&challenge_url, "{}").await?;

		let result = self.poll_authorization(authz_url, &domain).await;

		// The token is single-use either way.
		if let Err(err) = std::fs::remove_file(&token_path) {
			debug!(%err, "could not remove challenge token");
		}

		result
	}

	async fn poll_authorization(
		&mut self,
		authz_url: &str,
		domain: &str,
	) -> Result<(), AcmeError> {
		let mut status = "pending".to_string();

		for _ in 0..MAX_POLLS {
			tokio::time::sleep(POLL_DELAY).await;

			let authz: AuthorizationDocument = self.post_json(authz_url, "").await?;
			status = authz.status;

			match status.as_str() {
				"valid" => {
					info!(domain, "authorization valid");
					return Ok(());
				}
				"invalid" => {
					return Err(AcmeError::Challenge {
						domain: domain.to_string(),
						status,
					});
				}
				_ => debug!(domain, status, "authorization still pending"),
			}
		}

		Err(AcmeError::PollTimeout { status })
	}

	/// Poll the order until it turns `valid`.
	async fn poll_order(
		&mut self,
		order_url: &str,
		mut order: OrderDocument,
	) -> Result<OrderDocument, AcmeError> {
		for _ in 0..MAX_POLLS {
			match order.status.as_str() {
				"valid" => return Ok(order),
				"invalid" => {
					return Err(AcmeError::Protocol {
						what: "order",
						message: "order ended in status \"invalid\"".to_string(),
					});
				}
				_ => {
					tokio::time::sleep(POLL_DELAY).await;
					order = self.post_json(order_url, "").await?;
				}
			}
		}

		Err(AcmeError::PollTimeout {
			status: order.status,
		})
	}

	async fn post_json<T: serde::de::DeserializeOwned>(
		&mut self,
		url: &str,
		payload: &str,
	) -> Result<T, AcmeError> {
		let response = self.signed_post(url, payload).await?;

		response.json().await.map_err(|err| AcmeError::Transport {
			url: url.to_string(),
			message: err.to_string(),
		})
	}

	async fn post_raw(&mut self, url: &str, payload: &str) -> Result<String, AcmeError> {
		let response = self.signed_post(url, payload).await?;

		response.text().await.map_err(|err| AcmeError::Transport {
			url: url.to_string(),
			message: err.to_string(),
		})
	}

	/// One signed POST: JWK-form before registration, `kid`-form after.
	/// The nonce rolls forward from every response; transport failures
	/// retry with a fresh request.
	async fn signed_post(
		&mut self,
		url: &str,
		payload: &str,
	) -> Result<reqwest::Response, AcmeError> {
		let mut last_err = None;

		for attempt in 1..=TRANSPORT_RETRIES {
			let mut protected = json!({
				"alg": "RS256",
				"nonce": self.nonce,
				"url": url,
			});
			match &self.kid {
				Some(kid) => protected["kid"] = Value::String(kid.clone()),
				None => protected["jwk"] = jws::jwk(&self.account_key)?,
			}

			let body = jws::sign(&protected, payload, &self.account_key)?;

			let sent = self
				.client
				.http
				.post(url)
				.header("content-type", "application/jose+json")
				.body(body)
				.send()
				.await;

			match sent {
				Ok(response) => {
					if let Some(nonce) = nonce_from(&response) {
						self.nonce = nonce;
					}

					if response.status().is_success() {
						return Ok(response);
					}

					let status = response.status();
					let detail = response.text().await.unwrap_or_default();
					return Err(AcmeError::Protocol {
						what: "request",
						message: format!("{url} answered {status}: {detail}"),
					});
				}
				Err(err) => {
					warn!(%err, url, attempt, "acme transport error");
					last_err = Some(AcmeError::Transport {
						url: url.to_string(),
						message: err.to_string(),
					});
					tokio::time::sleep(Duration::from_secs(1)).await;
				}
			}
		}

		Err(last_err.unwrap_or(AcmeError::Missing {
			what: "transport error detail",
		}))
	}
}

/// Build the DER CSR for `domains` (first is the subject CN, all are DNS
/// SANs, in order), base64url-encoded the way `finalize` expects.
fn certificate_request(domains: &[String], key: &PKey<Private>) -> Result<String, AcmeError> {
	let mut builder = X509ReqBuilder::new()?;

	let mut name = X509NameBuilder::new()?;
	name.append_entry_by_text(
		"CN",
		domains.first().ok_or(AcmeError::Missing { what: "domain" })?,
	)?;
	builder.set_subject_name(&name.build())?;
	builder.set_pubkey(key)?;

	let mut san = SubjectAlternativeName::new();
	for domain in domains {
		san.dns(domain);
	}
	let mut extensions = Stack::new()?;
	extensions.push(san.build(&builder.x509v3_context(None))?)?;
	builder.add_extensions(&extensions)?;

	builder.sign(key, MessageDigest::sha256())?;

	Ok(jws::b64(&builder.build().to_der()?))
}

#[async_trait]
impl Issuer for AcmeClient {
	async fn issue(
		&self,
		domain: &str,
		account_key: &Path,
		domain_key: &Path,
		cert_out: &Path,
	) -> Result<(), AcmeError> {
		self.order(&[domain.to_string()], account_key, domain_key, cert_out)
			.await
	}
}
