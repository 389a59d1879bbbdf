//! The trait every container runtime implementation provides.

use std::{fmt::Debug, pin::Pin};

use async_trait::async_trait;
use futures_util::Stream;

use super::{ContainerDetails, NetworkDetails, RuntimeError, RuntimeEvent};

/// The typed lifecycle event feed, terminated by the runtime going away.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<RuntimeEvent, RuntimeError>> + Send>>;

/// The operations the controller needs from a container runtime. This is
/// the only coupling to the outside world; the reconciler, parser, and
/// model never see daemon wire types.
#[async_trait]
pub trait RuntimeBackend: Debug + Send + Sync {
	/// Ids of all running containers.
	///
	/// # Errors
	/// Returns an error if the runtime cannot be queried.
	async fn list_containers(&self) -> Result<Vec<String>, RuntimeError>;

	/// Inspect one container by id or name.
	///
	/// # Errors
	/// Returns an error if the container does not exist or the runtime
	/// cannot be queried.
	async fn inspect_container(&self, id: &str) -> Result<ContainerDetails, RuntimeError>;

	/// Inspect one network by id or name.
	///
	/// # Errors
	/// Returns an error if the network does not exist or the runtime
	/// cannot be queried.
	async fn inspect_network(&self, id: &str) -> Result<NetworkDetails, RuntimeError>;

	/// Subscribe to container and network lifecycle events from `since`
	/// (unix seconds) onwards. Anchoring in the past is what makes the
	/// startup scan crash-safe: events raced during the scan are replayed
	/// from the subscription rather than lost.
	///
	/// # Errors
	/// Returns an error if the subscription cannot be established.
	async fn events_since(&self, since: i64) -> Result<EventStream, RuntimeError>;
}
