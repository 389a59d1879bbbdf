//! The container runtime interface.
//!
//! Everything the controller knows about the outside world arrives through
//! the [`RuntimeBackend`] trait: listing and inspecting containers,
//! resolving networks, and the lifecycle event stream. [`Docker`] talks to
//! a real Docker daemon; [`Memory`] is a scriptable in-process runtime for
//! tests and dry-runs. All other modules only ever see the typed records
//! defined here, never the daemon's own wire types.

pub mod backend;
mod docker;
mod memory;

use std::{collections::BTreeMap, net::IpAddr, sync::Arc};

use tracing::instrument;

pub use self::{
	backend::{EventStream, RuntimeBackend},
	docker::Docker,
	memory::Memory,
};
use crate::{error::Kind, util::retry};

/// The error returned by runtime operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RuntimeError {
	/// The daemon rejected or failed a request
	#[error("container runtime request failed: {message}")]
	Api {
		/// What the daemon said
		message: String,
	},
	/// A container or network that should exist does not
	#[error("{what} {id:?} not found")]
	NotFound {
		/// What was looked up
		what: &'static str,
		/// The id or name used
		id: String,
	},
	/// A network inspection failed
	#[error("network inspection of {id:?} failed: {message}")]
	Network {
		/// The network id or name
		id: String,
		/// What went wrong
		message: String,
	},
	/// The event stream broke
	#[error("container event stream failed: {message}")]
	Stream {
		/// What went wrong
		message: String,
	},
}

impl RuntimeError {
	/// The failure class for logging and propagation policy.
	#[must_use]
	pub const fn kind(&self) -> Kind {
		match self {
			Self::Network { .. } => Kind::Network,
			_ => Kind::Runtime,
		}
	}
}

/// A network a container is attached to, with the address the controller
/// would use to reach it there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachedNetwork {
	/// Network id
	pub id: String,
	/// Network name
	pub name: String,
	/// The container's address on this network, when assigned
	pub address: Option<IpAddr>,
}

/// Everything derivation needs to know about one container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerDetails {
	/// Container id
	pub id: String,
	/// Container name, without the daemon's leading slash
	pub name: String,
	/// Whether the container is currently running
	pub running: bool,
	/// The container environment
	pub env: BTreeMap<String, String>,
	/// Attached networks, sorted by name so "the first reachable network"
	/// is deterministic
	pub networks: Vec<AttachedNetwork>,
	/// Exposed ports, sorted
	pub exposed_ports: Vec<u16>,
}

/// An inspected network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkDetails {
	/// Network id
	pub id: String,
	/// Network name
	pub name: String,
}

/// What a lifecycle event is about.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EventScope {
	/// A container changed state
	Container,
	/// A network changed state or membership
	Network,
}

/// The action of a lifecycle event. Everything the reconciler does not
/// react to collapses into [`EventAction::Other`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventAction {
	/// Container started
	Start,
	/// Container restarted
	Restart,
	/// Container resumed
	Unpause,
	/// Container paused
	Pause,
	/// Container exited
	Die,
	/// Container stopped
	Stop,
	/// Container killed
	Kill,
	/// A container joined a network
	Connect,
	/// A container left a network
	Disconnect,
	/// A network was destroyed
	Destroy,
	/// Anything else
	Other(String),
}

impl EventAction {
	/// Map a runtime action string onto the typed action.
	#[must_use]
	pub fn parse(action: &str) -> Self {
		match action {
			"start" => Self::Start,
			"restart" => Self::Restart,
			"unpause" => Self::Unpause,
			"pause" => Self::Pause,
			"die" => Self::Die,
			"stop" => Self::Stop,
			"kill" => Self::Kill,
			"connect" => Self::Connect,
			"disconnect" => Self::Disconnect,
			"destroy" => Self::Destroy,
			other => Self::Other(other.to_string()),
		}
	}
}

/// One typed lifecycle event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeEvent {
	/// What the event is about
	pub scope: EventScope,
	/// What happened
	pub action: EventAction,
	/// The container or network the event is about
	pub actor: String,
	/// For network membership events, the container that joined or left
	pub container: Option<String>,
	/// Unix timestamp of the event
	pub time: i64,
}

/// A cheaply clonable handle to a [`RuntimeBackend`] adding uniform
/// logging and the retry policy for point requests. The event stream is
/// not retried here; the event processor owns resubscription.
#[derive(Debug, Clone)]
pub struct Runtime {
	backend: Arc<dyn RuntimeBackend>,
}

impl Runtime {
	/// Wrap a backend.
	#[must_use]
	pub fn new(backend: impl RuntimeBackend + 'static) -> Self {
		Self {
			backend: Arc::new(backend),
		}
	}

	/// Ids of all running containers.
	///
	/// # Errors
	/// Returns the last error after exhausting the retry budget.
	#[instrument(level = "debug", skip(self), err)]
	pub async fn list_containers(&self) -> Result<Vec<String>, RuntimeError> {
		retry("list containers", || self.backend.list_containers()).await
	}

	/// Inspect one container.
	///
	/// # Errors
	/// Returns the last error after exhausting the retry budget.
	#[instrument(level = "debug", skip(self), err)]
	pub async fn inspect_container(&self, id: &str) -> Result<ContainerDetails, RuntimeError> {
		retry("inspect container", || self.backend.inspect_container(id)).await
	}

	/// Inspect one network by id or name.
	///
	/// # Errors
	/// Returns the last error after exhausting the retry budget.
	#[instrument(level = "debug", skip(self), err)]
	pub async fn inspect_network(&self, id: &str) -> Result<NetworkDetails, RuntimeError> {
		retry("inspect network", || self.backend.inspect_network(id)).await
	}

	/// Subscribe to lifecycle events from `since` (unix seconds) onwards.
	///
	/// # Errors
	/// Returns an error if the subscription itself cannot be established.
	#[instrument(level = "debug", skip(self), err)]
	pub async fn events_since(&self, since: i64) -> Result<EventStream, RuntimeError> {
		self.backend.events_since(since).await
	}
}
