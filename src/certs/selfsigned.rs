//! Key generation and self-signed certificate fabrication.

use std::path::Path;

use openssl::{
	asn1::Asn1Time,
	bn::{BigNum, MsbOption},
	hash::MessageDigest,
	pkey::{PKey, Private},
	rsa::Rsa,
	x509::{extension::SubjectAlternativeName, X509Builder, X509NameBuilder, X509},
};
use time::{Duration, OffsetDateTime};

use super::CertError;
use crate::util::atomic_write;

/// Key size for generated RSA keys (accounts, domains, self-signed).
pub(crate) const RSA_BITS: u32 = 2048;

/// Validity of generated self-signed certificates.
const SELF_SIGNED_DAYS: u32 = 365;

/// Load an RSA private key from `path`, or generate one and persist it
/// with private-only permissions.
pub(crate) fn load_or_create_rsa(path: &Path) -> Result<PKey<Private>, CertError> {
	if path.exists() {
		let pem = std::fs::read(path)?;
		return Ok(PKey::private_key_from_pem(&pem)?);
	}

	let key = PKey::from_rsa(Rsa::generate(RSA_BITS)?)?;

	if let Some(dir) = path.parent() {
		std::fs::create_dir_all(dir)?;
	}
	atomic_write(path, &key.private_key_to_pem_pkcs8()?, 0o600)?;

	Ok(key)
}

/// Generate a self-signed certificate for `common_name`, returning the
/// PEM-encoded certificate and its freshly generated key.
pub(crate) fn self_signed_pair(
	common_name: &str,
) -> Result<(Vec<u8>, PKey<Private>), CertError> {
	let key = PKey::from_rsa(Rsa::generate(RSA_BITS)?)?;

	let mut name = X509NameBuilder::new()?;
	name.append_entry_by_text("CN", common_name)?;
	let name = name.build();

	let mut builder = X509Builder::new()?;
	builder.set_version(2)?;

	let mut serial = BigNum::new()?;
	serial.rand(127, MsbOption::MAYBE_ZERO, false)?;
	builder.set_serial_number(serial.to_asn1_integer()?.as_ref())?;

	builder.set_subject_name(&name)?;
	builder.set_issuer_name(&name)?;
	builder.set_pubkey(&key)?;
	builder.set_not_before(Asn1Time::days_from_now(0)?.as_ref())?;
	builder.set_not_after(Asn1Time::days_from_now(SELF_SIGNED_DAYS)?.as_ref())?;

	// The catch-all's "_" is not a DNS name, so it gets no SAN.
	if common_name.contains('.') {
		let san = SubjectAlternativeName::new()
			.dns(common_name)
			.build(&builder.x509v3_context(None, None))?;
		builder.append_extension(san)?;
	}

	builder.sign(&key, MessageDigest::sha256())?;
	let cert = builder.build();

	Ok((cert.to_pem()?, key))
}

/// Read the `notAfter` instant of a PEM certificate.
pub(crate) fn not_after(pem: &[u8]) -> Result<OffsetDateTime, CertError> {
	let cert = X509::from_pem(pem)?;

	// Asn1Time exposes no timestamp of its own; the difference from the
	// unix epoch does the conversion.
	let epoch = Asn1Time::from_unix(0)?;
	let diff = epoch.diff(cert.not_after())?;

	Ok(OffsetDateTime::UNIX_EPOCH
		+ Duration::days(i64::from(diff.days))
		+ Duration::seconds(i64::from(diff.secs)))
}
