//! A manual certificate CLI wrapping the same ACME client the controller
//! uses. Orders (or re-orders) a certificate for every domain given on
//! the command line, against the same on-disk certificate store.

use std::path::PathBuf;

use clap::Parser;
use colored::Colorize;
use gangway::{
	acme::AcmeClient,
	certs::CertStore,
	config::DEFAULT_ACME_API,
};
use time::OffsetDateTime;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(
	name = "getssl",
	version,
	about = "Obtain TLS certificates via ACME HTTP-01 for one or more domains.",
	long_about = None
)]
struct Cli {
	/// Skip checking that each domain resolves before ordering
	#[clap(long)]
	skip_dns_check: bool,

	/// Discard the existing account key and register a fresh account
	#[clap(long)]
	new: bool,

	/// Order even when a valid certificate already exists
	#[clap(long)]
	force: bool,

	/// ACME directory URL
	#[clap(long, env = "LETSENCRYPT_API", default_value = DEFAULT_ACME_API)]
	api: String,

	/// Certificate store root
	#[clap(long, env = "SSL_DIR", default_value = "/etc/nginx/ssl")]
	ssl_dir: PathBuf,

	/// Directory HTTP-01 challenge tokens are written into
	#[clap(long, env = "CHALLENGE_DIR", default_value = "/usr/share/nginx/challenge")]
	challenge_dir: PathBuf,

	/// Domains to obtain certificates for
	#[clap(required = true)]
	domains: Vec<String>,
}

#[tokio::main]
async fn main() {
	let cli = Cli::parse();

	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_new("info").unwrap_or_default())
		.init();

	if run(cli).await {
		std::process::exit(1);
	}
}

/// Attempt every domain; returns whether any of them failed.
async fn run(cli: Cli) -> bool {
	let store = CertStore::new(cli.ssl_dir);
	if let Err(err) = store.ensure_layout() {
		eprintln!("{} {err}", "error:".red().bold());
		return true;
	}

	let client = match AcmeClient::new(cli.api, cli.challenge_dir) {
		Ok(client) => client,
		Err(err) => {
			eprintln!("{} {err}", "error:".red().bold());
			return true;
		}
	};

	let mut any_failed = false;

	for domain in &cli.domains {
		if !cli.force {
			if let Ok(Some(not_after)) = store.not_after(domain) {
				if not_after > OffsetDateTime::now_utc() {
					println!(
						"{} {domain}: valid until {not_after}, skipping (use --force to reissue)",
						"ok:".green().bold()
					);
					continue;
				}
			}
		}

		if cli.new {
			if let Err(err) = std::fs::remove_file(store.account_key_path(domain)) {
				if err.kind() != std::io::ErrorKind::NotFound {
					eprintln!("{} {domain}: could not discard account key: {err}", "error:".red().bold());
					any_failed = true;
					continue;
				}
			}
		}

		if !cli.skip_dns_check {
			if let Err(err) = tokio::net::lookup_host((domain.as_str(), 80)).await {
				eprintln!(
					"{} {domain}: does not resolve ({err}); use --skip-dns-check to order anyway",
					"error:".red().bold()
				);
				any_failed = true;
				continue;
			}
		}

		let result = client
			.order(
				std::slice::from_ref(domain),
				&store.account_key_path(domain),
				&store.key_path(domain),
				&store.cert_path(domain),
			)
			.await;

		match result {
			Ok(()) => {
				println!(
					"{} {domain}: certificate written to {}",
					"ok:".green().bold(),
					store.cert_path(domain).display()
				);
			}
			Err(err) => {
				eprintln!("{} {domain}: {err}", "error:".red().bold());
				any_failed = true;
			}
		}
	}

	any_failed
}
