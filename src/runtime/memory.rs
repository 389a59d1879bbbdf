//! A scriptable in-memory runtime backend for tests and dry-runs.

use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use futures_util::stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{
	backend::{EventStream, RuntimeBackend},
	ContainerDetails, NetworkDetails, RuntimeError, RuntimeEvent,
};

type EventSender = mpsc::UnboundedSender<Result<RuntimeEvent, RuntimeError>>;

/// Holds containers and networks in memory and lets the caller script
/// lifecycle events. Cloning shares the state, so a test can keep a handle
/// while the reconciler owns another.
#[derive(Debug, Clone, Default)]
pub struct Memory {
	inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
	containers: Mutex<BTreeMap<String, ContainerDetails>>,
	networks: Mutex<BTreeMap<String, NetworkDetails>>,
	subscribers: Mutex<Vec<EventSender>>,
}

impl Memory {
	/// An empty runtime.
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Add or replace a container.
	pub fn upsert_container(&self, details: ContainerDetails) {
		self.inner
			.containers
			.lock()
			.insert(details.id.clone(), details);
	}

	/// Remove a container, as `docker rm` would.
	pub fn remove_container(&self, id: &str) {
		self.inner.containers.lock().remove(id);
	}

	/// Add or replace a network.
	pub fn upsert_network(&self, details: NetworkDetails) {
		self.inner
			.networks
			.lock()
			.insert(details.id.clone(), details);
	}

	/// Deliver an event to every subscriber.
	pub fn emit(&self, event: RuntimeEvent) {
		self.inner
			.subscribers
			.lock()
			.retain(|sender| sender.send(Ok(event.clone())).is_ok());
	}

	/// Deliver a stream error to every subscriber, as a daemon hiccup
	/// would.
	pub fn emit_error(&self, message: &str) {
		let err = RuntimeError::Stream {
			message: message.to_string(),
		};
		self.inner
			.subscribers
			.lock()
			.retain(|sender| sender.send(Err(err.clone())).is_ok());
	}
}

#[async_trait]
impl RuntimeBackend for Memory {
	async fn list_containers(&self) -> Result<Vec<String>, RuntimeError> {
		Ok(self
			.inner
			.containers
			.lock()
			.values()
			.filter(|details| details.running)
			.map(|details| details.id.clone())
			.collect())
	}

	async fn inspect_container(&self, id: &str) -> Result<ContainerDetails, RuntimeError> {
		self.inner
			.containers
			.lock()
			.get(id)
			.cloned()
			.ok_or_else(|| RuntimeError::NotFound {
				what: "container",
				id: id.to_string(),
			})
	}

	async fn inspect_network(&self, id: &str) -> Result<NetworkDetails, RuntimeError> {
		let networks = self.inner.networks.lock();

		networks
			.get(id)
			.or_else(|| networks.values().find(|details| details.name == id))
			.cloned()
			.ok_or_else(|| RuntimeError::Network {
				id: id.to_string(),
				message: "no such network".to_string(),
			})
	}

	async fn events_since(&self, _since: i64) -> Result<EventStream, RuntimeError> {
		// Events are delivered live; tests emit after subscribing, so the
		// anchor has nothing to replay.
		let (tx, rx) = mpsc::unbounded_channel();
		self.inner.subscribers.lock().push(tx);

		Ok(Box::pin(stream::unfold(rx, |mut rx| async move {
			rx.recv().await.map(|item| (item, rx))
		})))
	}
}

#[cfg(test)]
mod tests {
	use futures_util::StreamExt;

	use super::*;
	use crate::runtime::{EventAction, EventScope, Runtime};

	fn container(id: &str, running: bool) -> ContainerDetails {
		ContainerDetails {
			id: id.to_string(),
			name: format!("name-{id}"),
			running,
			..ContainerDetails::default()
		}
	}

	#[tokio::test]
	async fn lists_only_running_containers() {
		let memory = Memory::new();
		memory.upsert_container(container("c1", true));
		memory.upsert_container(container("c2", false));

		let runtime = Runtime::new(memory);

		assert_eq!(runtime.list_containers().await.unwrap(), ["c1"]);
	}

	#[tokio::test]
	async fn inspect_missing_container_is_not_found() {
		let runtime = Runtime::new(Memory::new());

		assert!(matches!(
			runtime.inspect_container("nope").await,
			Err(RuntimeError::NotFound { .. })
		));
	}

	#[tokio::test]
	async fn network_lookup_by_id_or_name() {
		let memory = Memory::new();
		memory.upsert_network(NetworkDetails {
			id: "net-1".to_string(),
			name: "frontend".to_string(),
		});

		let runtime = Runtime::new(memory);

		assert_eq!(
			runtime.inspect_network("net-1").await.unwrap().name,
			"frontend"
		);
		assert_eq!(
			runtime.inspect_network("frontend").await.unwrap().id,
			"net-1"
		);
	}

	#[tokio::test]
	async fn events_reach_subscribers() {
		let memory = Memory::new();
		let runtime = Runtime::new(memory.clone());

		let mut events = runtime.events_since(0).await.unwrap();

		memory.emit(RuntimeEvent {
			scope: EventScope::Container,
			action: EventAction::Start,
			actor: "c1".to_string(),
			container: None,
			time: 1,
		});

		let event = events.next().await.unwrap().unwrap();
		assert_eq!(event.action, EventAction::Start);
		assert_eq!(event.actor, "c1");
	}
}
