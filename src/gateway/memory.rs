//! An in-memory gateway backend for tests and dry-runs.

use std::sync::{
	atomic::{AtomicBool, Ordering},
	Arc,
};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{GatewayBackend, GatewayError};

/// Records every written configuration instead of driving a process.
/// Validation and reload succeed unless told to fail, so reconcile error
/// paths can be exercised deterministically.
#[derive(Debug, Clone, Default)]
pub struct Memory {
	configs: Arc<Mutex<Vec<String>>>,
	reloads: Arc<Mutex<u32>>,
	fail_validate: Arc<AtomicBool>,
	fail_reload: Arc<AtomicBool>,
}

impl Memory {
	/// A fresh recording backend.
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Every configuration written so far, oldest first.
	#[must_use]
	pub fn configs(&self) -> Vec<String> {
		self.configs.lock().clone()
	}

	/// The most recently written configuration, if any.
	#[must_use]
	pub fn current_config(&self) -> Option<String> {
		self.configs.lock().last().cloned()
	}

	/// How many times the gateway was reloaded.
	#[must_use]
	pub fn reload_count(&self) -> u32 {
		*self.reloads.lock()
	}

	/// Make future validations fail (or succeed again).
	pub fn set_fail_validate(&self, fail: bool) {
		self.fail_validate.store(fail, Ordering::SeqCst);
	}

	/// Make future reloads fail (or succeed again).
	pub fn set_fail_reload(&self, fail: bool) {
		self.fail_reload.store(fail, Ordering::SeqCst);
	}
}

#[async_trait]
impl GatewayBackend for Memory {
	async fn write_config(&self, text: &str) -> Result<(), GatewayError> {
		self.configs.lock().push(text.to_string());
		Ok(())
	}

	async fn validate(&self) -> Result<(), GatewayError> {
		if self.fail_validate.load(Ordering::SeqCst) {
			Err(GatewayError::Validate {
				stderr: "validation failure injected".to_string(),
			})
		} else {
			Ok(())
		}
	}

	async fn reload(&self) -> Result<(), GatewayError> {
		if self.fail_reload.load(Ordering::SeqCst) {
			Err(GatewayError::Reload {
				stderr: "reload failure injected".to_string(),
			})
		} else {
			*self.reloads.lock() += 1;
			Ok(())
		}
	}
}
