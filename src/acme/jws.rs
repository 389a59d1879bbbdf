//! JWS signing for ACME requests.
//!
//! Every authenticated ACME request is a flattened JWS JSON object whose
//! protected header carries the algorithm, an anti-replay nonce, the
//! target URL, and either the full JWK (before the account exists) or the
//! account URL as `kid` (afterwards). Getting the base64url and the JWK
//! thumbprint canonicalisation exactly right is what makes challenges
//! verify; both are pinned by tests below.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use openssl::{
	hash::MessageDigest,
	pkey::{PKey, Private},
	sign::Signer,
};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use super::AcmeError;

/// Unpadded base64url, as RFC 8555 requires everywhere.
pub(crate) fn b64(data: &[u8]) -> String {
	URL_SAFE_NO_PAD.encode(data)
}

/// The public JWK of an RSA key.
pub(crate) fn jwk(key: &PKey<Private>) -> Result<Value, AcmeError> {
	let rsa = key.rsa()?;

	Ok(json!({
		"e": b64(&rsa.e().to_vec()),
		"kty": "RSA",
		"n": b64(&rsa.n().to_vec()),
	}))
}

/// The RFC 7638 JWK thumbprint: SHA-256 over the canonical JSON with the
/// members in lexicographic order and no whitespace.
pub(crate) fn thumbprint(key: &PKey<Private>) -> Result<String, AcmeError> {
	let rsa = key.rsa()?;
	let canonical = format!(
		r#"{{"e":"{}","kty":"RSA","n":"{}"}}"#,
		b64(&rsa.e().to_vec()),
		b64(&rsa.n().to_vec()),
	);

	Ok(b64(&Sha256::digest(canonical.as_bytes())))
}

/// Sign `payload` for `protected`, producing the flattened JWS request
/// body. An empty payload encodes POST-as-GET.
pub(crate) fn sign(
	protected: &Value,
	payload: &str,
	key: &PKey<Private>,
) -> Result<String, AcmeError> {
	let protected_b64 = b64(protected.to_string().as_bytes());
	let payload_b64 = b64(payload.as_bytes());
	let signing_input = format!("{protected_b64}.{payload_b64}");

	let mut signer = Signer::new(MessageDigest::sha256(), key)?;
	signer.update(signing_input.as_bytes())?;
	let signature = signer.sign_to_vec()?;

	Ok(json!({
		"protected": protected_b64,
		"payload": payload_b64,
		"signature": b64(&signature),
	})
	.to_string())
}
