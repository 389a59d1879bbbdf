//! # gangway server
//!
//! The controller daemon: watches the Docker event stream, maintains the
//! routing model, and keeps the co-located nginx configured and reloaded.
//! Configuration comes entirely from the process environment; see the
//! crate documentation for the variables.

use std::sync::Arc;

use anyhow::Context;
use gangway::{
	acme::AcmeClient,
	certs::CertificateManager,
	config::Config,
	events::EventProcessor,
	gateway::{Gateway, Nginx},
	reconciler::Reconciler,
	runtime::{Docker, Runtime},
	util::CONTROLLER_NAME,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
	let filter = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
	let filter = EnvFilter::try_new(&filter)
		.with_context(|| format!("invalid LOG_LEVEL {filter:?}"))?;

	let (writer, _appender_guard) = tracing_appender::non_blocking(std::io::stdout());
	tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_writer(writer)
		.init();

	info!(server = CONTROLLER_NAME, "starting gangway");

	let config = Config::from_env().context("controller configuration")?;

	for dir in [
		&config.nginx_conf_dir,
		&config.challenge_dir,
		&config.htpasswd_dir,
	] {
		std::fs::create_dir_all(dir)
			.with_context(|| format!("creating directory {}", dir.display()))?;
	}

	let runtime = Runtime::new(Docker::connect().context("connecting to the container runtime")?);
	let gateway = Gateway::new(Nginx::new(config.conf_path()));

	let acme = AcmeClient::new(config.acme_url.clone(), config.challenge_dir.clone())
		.context("constructing the acme client")?;
	let certs = Arc::new(
		CertificateManager::new(config.ssl_dir.clone(), Arc::new(acme))
			.context("initializing the certificate store")?,
	);

	certs
		.ensure_default()
		.context("provisioning the default catch-all certificate")?;

	{
		let certs = Arc::clone(&certs);
		let path = config.dhparam_path();
		let bits = config.dhparam_size;
		tokio::task::spawn_blocking(move || certs.ensure_dhparam(&path, bits))
			.await
			.context("dhparam generation task")?
			.context("generating Diffie-Hellman parameters")?;
	}

	let cancel = CancellationToken::new();

	{
		let cancel = cancel.clone();
		tokio::spawn(async move {
			shutdown_signal().await;
			info!("shutdown signal received");
			cancel.cancel();
		});
	}

	let reconciler = Reconciler::new(
		runtime.clone(),
		gateway,
		Arc::clone(&certs),
		config,
	);

	let since = reconciler.start().await.context("startup reconciliation")?;

	let mut events = EventProcessor::spawn(runtime, since, cancel.clone())
		.await
		.context("subscribing to runtime events")?;

	let renewal = {
		let certs = Arc::clone(&certs);
		let cancel = cancel.clone();
		tokio::spawn(async move { certs.run_renewal_loop(cancel).await })
	};

	reconciler.run(&mut events, cancel.clone()).await;

	// Either a signal fired or the event feed died; tear everything down.
	cancel.cancel();
	events.join().await;
	if let Err(err) = renewal.await {
		error!(%err, "renewal loop task panicked");
	}

	info!("gangway stopped");
	Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
	use tokio::signal::unix::{signal, SignalKind};

	let mut sigterm = match signal(SignalKind::terminate()) {
		Ok(sigterm) => sigterm,
		Err(err) => {
			warn!(%err, "could not install the SIGTERM handler");
			let () = std::future::pending().await;
			unreachable!()
		}
	};

	tokio::select! {
		_ = tokio::signal::ctrl_c() => {}
		_ = sigterm.recv() => {}
	}
}
