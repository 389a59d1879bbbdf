//! Miscellaneous statics and helpers used throughout gangway.

use std::{future::Future, io::Error as IoError, path::Path, time::Duration};

use tempfile::NamedTempFile;
use tracing::warn;

/// A string representation of this crate's version. In debug builds, this
/// is in the form of `[full semver crate version]+debug`. In release
/// builds this gets shortened to `MAJOR.MINOR`.
pub const VERSION: &str = if cfg!(debug_assertions) {
	concat!(env!("CARGO_PKG_VERSION"), "+debug")
} else {
	concat!(
		env!("CARGO_PKG_VERSION_MAJOR"),
		".",
		env!("CARGO_PKG_VERSION_MINOR")
	)
};

/// The name this controller reports about itself, used in log messages and
/// in the banner comment of generated gateway configuration.
pub const CONTROLLER_NAME: &str = concat!("gangway/", env!("CARGO_PKG_VERSION"));

/// Maximum number of attempts for retryable runtime-client calls.
pub const RETRY_ATTEMPTS: u32 = 3;

/// Initial delay between retry attempts. Doubles per attempt.
pub const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// Ceiling on the delay between retry attempts.
pub const RETRY_MAX_DELAY: Duration = Duration::from_secs(30);

/// Retry `op` with exponential backoff (2x per attempt, capped), up to
/// [`RETRY_ATTEMPTS`] attempts. Only runtime-client calls go through this;
/// gateway and certificate errors must surface immediately.
///
/// # Errors
/// Returns the last error once all attempts are exhausted.
pub async fn retry<T, E, F, Fut>(what: &str, mut op: F) -> Result<T, E>
where
	E: std::fmt::Display,
	F: FnMut() -> Fut,
	Fut: Future<Output = Result<T, E>>,
{
	let mut delay = RETRY_BASE_DELAY;

	for attempt in 1..=RETRY_ATTEMPTS {
		match op().await {
			Ok(val) => return Ok(val),
			Err(err) if attempt == RETRY_ATTEMPTS => return Err(err),
			Err(err) => {
				warn!(%err, attempt, what, "retryable operation failed");
				tokio::time::sleep(delay).await;
				delay = (delay * 2).min(RETRY_MAX_DELAY);
			}
		}
	}

	unreachable!("retry loop returns on the final attempt")
}

/// Atomically replace the file at `path` with `contents` by writing a
/// temporary file in the same directory and renaming it into place. The
/// unix file mode is applied before the rename, so the file is never
/// observable with wrong permissions.
///
/// # Errors
/// Returns an error if the temporary file cannot be created, written,
/// chmodded, or renamed.
pub fn atomic_write(path: &Path, contents: &[u8], mode: u32) -> Result<(), IoError> {
	use std::{fs::Permissions, io::Write, os::unix::fs::PermissionsExt};

	let dir = path.parent().unwrap_or_else(|| Path::new("."));
	let mut file = NamedTempFile::new_in(dir)?;
	file.write_all(contents)?;
	file.as_file().set_permissions(Permissions::from_mode(mode))?;
	file.persist(path).map_err(|err| err.error)?;

	Ok(())
}

#[cfg(test)]
mod tests {
	use std::{
		os::unix::fs::PermissionsExt,
		sync::atomic::{AtomicU32, Ordering},
	};

	use super::*;

	#[tokio::test(start_paused = true)]
	async fn retry_succeeds_after_failures() {
		let calls = AtomicU32::new(0);

		let res: Result<u32, &str> = retry("test", || {
			let n = calls.fetch_add(1, Ordering::SeqCst);
			async move {
				if n < 2 {
					Err("nope")
				} else {
					Ok(n)
				}
			}
		})
		.await;

		assert_eq!(res, Ok(2));
		assert_eq!(calls.load(Ordering::SeqCst), 3);
	}

	#[tokio::test(start_paused = true)]
	async fn retry_gives_up() {
		let calls = AtomicU32::new(0);

		let res: Result<(), &str> = retry("test", || {
			calls.fetch_add(1, Ordering::SeqCst);
			async { Err("still no") }
		})
		.await;

		assert_eq!(res, Err("still no"));
		assert_eq!(calls.load(Ordering::SeqCst), RETRY_ATTEMPTS);
	}

	#[test]
	fn atomic_write_replaces_and_sets_mode() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("out.txt");

		atomic_write(&path, b"one", 0o600).unwrap();
		atomic_write(&path, b"two", 0o644).unwrap();

		assert_eq!(std::fs::read(&path).unwrap(), b"two");
		let mode = std::fs::metadata(&path).unwrap().permissions().mode();
		assert_eq!(mode & 0o777, 0o644);
	}
}
