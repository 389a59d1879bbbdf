//! The gateway process interface.
//!
//! The data plane is an external nginx; the controller only writes its
//! configuration, asks it to validate, and signals it to hot-reload. The
//! [`GatewayBackend`] trait keeps that surface swappable: [`Nginx`] drives
//! the real process, [`Memory`] records configurations for tests and
//! dry-runs. The controller never restarts the data plane; a failed
//! validate keeps the previous configuration live and surfaces the error.

mod memory;
mod nginx;

use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;
use tracing::instrument;

pub use self::{memory::Memory, nginx::Nginx};

/// The error returned by gateway operations. None of these are retried;
/// a broken configuration must surface to the reconcile cycle.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
	/// The configuration file could not be written
	#[error("could not write gateway configuration: {0}")]
	Write(#[from] std::io::Error),
	/// The gateway binary could not be executed at all
	#[error("could not run the gateway binary: {0}")]
	Exec(#[source] std::io::Error),
	/// The gateway rejected the configuration
	#[error("gateway configuration validation failed: {stderr}")]
	Validate {
		/// What the config test printed
		stderr: String,
	},
	/// The gateway could not be signalled to reload
	#[error("gateway reload failed: {stderr}")]
	Reload {
		/// What the reload command printed
		stderr: String,
	},
}

/// The operations the controller needs from a gateway process.
#[async_trait]
pub trait GatewayBackend: Debug + Send + Sync {
	/// Atomically replace the gateway configuration with `text`.
	async fn write_config(&self, text: &str) -> Result<(), GatewayError>;

	/// Ask the gateway to check the current configuration without applying
	/// it. A non-zero exit keeps the previous configuration live.
	async fn validate(&self) -> Result<(), GatewayError>;

	/// Signal the gateway to hot-reload the validated configuration.
	/// Returns once the signal is delivered.
	async fn reload(&self) -> Result<(), GatewayError>;
}

/// A cheaply clonable handle to a [`GatewayBackend`] with uniform logging.
/// Write/validate/reload calls are serialised by the reconciler, never
/// here.
#[derive(Debug, Clone)]
pub struct Gateway {
	backend: Arc<dyn GatewayBackend>,
}

impl Gateway {
	/// Wrap a backend.
	#[must_use]
	pub fn new(backend: impl GatewayBackend + 'static) -> Self {
		Self {
			backend: Arc::new(backend),
		}
	}

	/// Atomically replace the gateway configuration.
	///
	/// # Errors
	/// Returns an error if the file cannot be written.
	#[instrument(level = "debug", skip(self, text), fields(bytes = text.len()), err)]
	pub async fn write_config(&self, text: &str) -> Result<(), GatewayError> {
		self.backend.write_config(text).await
	}

	/// Validate the written configuration.
	///
	/// # Errors
	/// Returns an error carrying the gateway's own diagnostics on a
	/// non-zero exit.
	#[instrument(level = "debug", skip(self), err)]
	pub async fn validate(&self) -> Result<(), GatewayError> {
		self.backend.validate().await
	}

	/// Hot-reload the gateway.
	///
	/// # Errors
	/// Returns an error if the reload signal could not be delivered.
	#[instrument(level = "debug", skip(self), err)]
	pub async fn reload(&self) -> Result<(), GatewayError> {
		self.backend.reload().await
	}
}
