//! The real nginx gateway backend.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::process::Command;

use super::{GatewayBackend, GatewayError};
use crate::util::atomic_write;

/// Drives an nginx process co-located with the controller: configuration
/// goes to `conf_path`, validation is `nginx -t`, reload is
/// `nginx -s reload`.
#[derive(Debug, Clone)]
pub struct Nginx {
	conf_path: PathBuf,
	binary: PathBuf,
}

impl Nginx {
	/// A backend writing to `conf_path` and signalling the `nginx` binary
	/// on the search path.
	#[must_use]
	pub fn new(conf_path: PathBuf) -> Self {
		Self {
			conf_path,
			binary: PathBuf::from("nginx"),
		}
	}

	/// Override the nginx binary, e.g. for a non-standard install.
	#[must_use]
	pub fn with_binary(mut self, binary: PathBuf) -> Self {
		self.binary = binary;
		self
	}

	async fn run(&self, args: &[&str]) -> Result<std::process::Output, std::io::Error> {
		Command::new(&self.binary).args(args).output().await
	}
}

#[async_trait]
impl GatewayBackend for Nginx {
	async fn write_config(&self, text: &str) -> Result<(), GatewayError> {
		let path = self.conf_path.clone();
		let text = text.to_string();

		// Rename-into-place so the gateway never reads a half-written file.
		tokio::task::spawn_blocking(move || atomic_write(&path, text.as_bytes(), 0o644))
			.await
			.map_err(|err| GatewayError::Write(std::io::Error::other(err)))??;

		Ok(())
	}

	async fn validate(&self) -> Result<(), GatewayError> {
		let output = self.run(&["-t"]).await.map_err(GatewayError::Exec)?;

		if output.status.success() {
			Ok(())
		} else {
			Err(GatewayError::Validate {
				stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
			})
		}
	}

	async fn reload(&self) -> Result<(), GatewayError> {
		let output = self
			.run(&["-s", "reload"])
			.await
			.map_err(GatewayError::Exec)?;

		if output.status.success() {
			Ok(())
		} else {
			Err(GatewayError::Reload {
				stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
			})
		}
	}
}
