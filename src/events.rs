//! The event processor: adapts the raw runtime event stream into a typed,
//! cancellable feed for the reconciler.
//!
//! One task owns the raw stream and forwards events over a bounded
//! channel, so the stream keeps draining even while the reconciler is in
//! the middle of a long cycle. When the stream errors or ends, the task
//! resubscribes anchored at the last observed event time (with the
//! standard retry policy); the events replayed across such a gap are safe
//! because every reconciler effect is idempotent.

use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::{
	runtime::{Runtime, RuntimeError, RuntimeEvent},
	util::retry,
};

use futures_util::StreamExt;

/// How many events may queue up while the reconciler is busy before the
/// processor task blocks (backpressure, not loss).
const CHANNEL_CAPACITY: usize = 64;

/// The typed, cancellable event feed.
#[derive(Debug)]
pub struct EventProcessor {
	rx: mpsc::Receiver<RuntimeEvent>,
	handle: JoinHandle<()>,
}

impl EventProcessor {
	/// Subscribe to runtime events from `since` onwards and start the
	/// forwarding task. Subscribing before returning is what guarantees
	/// events raced against the caller's startup scan are not lost.
	///
	/// # Errors
	/// Returns an error if the initial subscription cannot be established.
	pub async fn spawn(
		runtime: Runtime,
		since: i64,
		cancel: CancellationToken,
	) -> Result<Self, RuntimeError> {
		let stream = runtime.events_since(since).await?;
		let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

		let handle = tokio::spawn(forward(runtime, stream, since, tx, cancel));

		Ok(Self { rx, handle })
	}

	/// The next event, or `None` once the feed has shut down (cancellation
	/// or an unrecoverable stream failure).
	pub async fn next(&mut self) -> Option<RuntimeEvent> {
		self.rx.recv().await
	}

	/// Wait for the forwarding task to finish. Call after cancellation.
	pub async fn join(self) {
		drop(self.rx);
		if let Err(err) = self.handle.await {
			error!(%err, "event processor task panicked");
		}
	}
}

async fn forward(
	runtime: Runtime,
	mut stream: crate::runtime::EventStream,
	since: i64,
	tx: mpsc::Sender<RuntimeEvent>,
	cancel: CancellationToken,
) {
	// The resubscription anchor: the newest event time seen so far.
	let mut anchor = since;

	loop {
		let item = tokio::select! {
			() = cancel.cancelled() => {
				debug!("event processor cancelled");
				return;
			}
			item = stream.next() => item,
		};

		match item {
			Some(Ok(event)) => {
				anchor = anchor.max(event.time);
				if tx.send(event).await.is_err() {
					// Receiver gone; the reconciler has shut down.
					return;
				}
			}
			Some(Err(err)) => {
				warn!(%err, "event stream error, resubscribing");
				match resubscribe(&runtime, anchor, &cancel).await {
					Some(new_stream) => stream = new_stream,
					None => return,
				}
			}
			None => {
				warn!("event stream ended, resubscribing");
				match resubscribe(&runtime, anchor, &cancel).await {
					Some(new_stream) => stream = new_stream,
					None => return,
				}
			}
		}
	}
}

/// Re-establish the event stream from `anchor`; `None` when cancelled or
/// the retry budget is exhausted (the feed then closes and the controller
/// shuts down rather than silently stop reconciling).
async fn resubscribe(
	runtime: &Runtime,
	anchor: i64,
	cancel: &CancellationToken,
) -> Option<crate::runtime::EventStream> {
	let resubscription = retry("resubscribe to events", || runtime.events_since(anchor));

	tokio::select! {
		() = cancel.cancelled() => None,
		result = resubscription => match result {
			Ok(stream) => Some(stream),
			Err(err) => {
				error!(%err, "could not re-establish the event stream");
				None
			}
		}
	}
}
