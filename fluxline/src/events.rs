//! Write outcome events and their delivery.
//!
//! The dispatcher publishes one [`WriteEvent`] per outcome. Events are queued
//! to a dedicated delivery task, so publishing never waits on listener code.
//! Every listener and every subscriber sees each event exactly once, in the
//! order the dispatcher published them.
//!
//! A listener that panics is isolated: the panic is caught and logged, and
//! delivery continues with the next listener.
//!
//! Callers that register nothing receive no notification of failed writes.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::TransportError;
use crate::target::{WritePrecision, WriteTarget};

/// A batch was accepted by the server.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteSuccessEvent {
    /// Destination organization.
    pub organization: String,
    /// Destination bucket.
    pub bucket: String,
    /// Precision of the batch.
    pub precision: WritePrecision,
    /// The exact payload that was sent.
    pub line_protocol: String,
}

/// A batch was discarded after a permanent failure or exhausted retries.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteErrorEvent {
    /// Destination organization.
    pub organization: String,
    /// Destination bucket.
    pub bucket: String,
    /// Precision of the batch.
    pub precision: WritePrecision,
    /// The payload that failed.
    pub line_protocol: String,
    /// The last failure reported by the transport.
    pub cause: TransportError,
}

/// A batch failed transiently and will be retried.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRetriableErrorEvent {
    /// Destination organization.
    pub organization: String,
    /// Destination bucket.
    pub bucket: String,
    /// Precision of the batch.
    pub precision: WritePrecision,
    /// The payload that will be resent.
    pub line_protocol: String,
    /// The transient failure.
    pub cause: TransportError,
    /// Delay before the resend.
    pub retry_delay: Duration,
    /// Retries left after the scheduled one.
    pub attempts_remaining: u32,
}

/// Queued batches were discarded because the buffer limit was exceeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackpressureEvent {
    /// Destination organization of the discarded batch.
    pub organization: String,
    /// Destination bucket of the discarded batch.
    pub bucket: String,
    /// Number of lines discarded.
    pub dropped_lines: usize,
    /// Number of lines still waiting after the discard.
    pub buffered_lines: usize,
}

/// Any outcome published by the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteEvent {
    /// See [`WriteSuccessEvent`].
    Success(WriteSuccessEvent),
    /// See [`WriteErrorEvent`].
    Error(WriteErrorEvent),
    /// See [`WriteRetriableErrorEvent`].
    RetriableError(WriteRetriableErrorEvent),
    /// See [`BackpressureEvent`].
    Backpressure(BackpressureEvent),
}

impl WriteEvent {
    pub(crate) fn success(target: &WriteTarget, line_protocol: &str) -> Self {
        Self::Success(WriteSuccessEvent {
            organization: target.organization.clone(),
            bucket: target.bucket.clone(),
            precision: target.precision,
            line_protocol: line_protocol.to_string(),
        })
    }

    pub(crate) fn error(target: &WriteTarget, line_protocol: &str, cause: TransportError) -> Self {
        Self::Error(WriteErrorEvent {
            organization: target.organization.clone(),
            bucket: target.bucket.clone(),
            precision: target.precision,
            line_protocol: line_protocol.to_string(),
            cause,
        })
    }

    pub(crate) fn retriable(
        target: &WriteTarget,
        line_protocol: &str,
        cause: TransportError,
        retry_delay: Duration,
        attempts_remaining: u32,
    ) -> Self {
        Self::RetriableError(WriteRetriableErrorEvent {
            organization: target.organization.clone(),
            bucket: target.bucket.clone(),
            precision: target.precision,
            line_protocol: line_protocol.to_string(),
            cause,
            retry_delay,
            attempts_remaining,
        })
    }
}

/// Identifier returned by [`EventNotifier::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&WriteEvent) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(ListenerId, Listener)>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<WriteEvent>>>,
}

enum Delivery {
    Event(WriteEvent),
    Barrier(oneshot::Sender<()>),
}

/// Registration point for write outcome listeners.
#[derive(Clone)]
pub struct EventNotifier {
    registry: Arc<Registry>,
}

impl EventNotifier {
    /// Registers a callback invoked for every event.
    ///
    /// Callbacks run on the delivery task and should return quickly.
    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&WriteEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.registry.next_id.fetch_add(1, Ordering::Relaxed));
        self.registry
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(listener)));
        id
    }

    /// Unregisters a callback. Returns `false` if it was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self
            .registry
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Opens a stream receiving every event published from now on.
    ///
    /// The stream is unbounded and every event carries a copy of its
    /// payload: a stream that is never read grows for as long as the
    /// pipeline runs. Drop streams that are no longer consumed, or use
    /// [`EventNotifier::add_listener`] instead.
    pub fn subscribe(&self) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.registry
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        EventStream { rx }
    }
}

/// Stream of events returned by [`EventNotifier::subscribe`].
///
/// The stream ends once the pipeline is dropped and all events are delivered.
/// Unread events are buffered without limit; dropping the stream
/// unsubscribes it.
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<WriteEvent>,
}

impl EventStream {
    /// Waits for the next event.
    pub async fn recv(&mut self) -> Option<WriteEvent> {
        self.rx.recv().await
    }

    /// Returns the next event if one is already delivered.
    pub fn try_recv(&mut self) -> Option<WriteEvent> {
        self.rx.try_recv().ok()
    }
}

/// Sending half used by the pipeline.
#[derive(Clone)]
pub(crate) struct EventPublisher {
    tx: mpsc::UnboundedSender<Delivery>,
}

impl EventPublisher {
    /// Queues an event for delivery.
    pub(crate) fn publish(&self, event: WriteEvent) {
        // The delivery task only stops once every publisher is gone.
        let _ = self.tx.send(Delivery::Event(event));
    }

    /// Resolves once every event published before the call is delivered.
    pub(crate) async fn delivered(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Delivery::Barrier(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

/// Starts the delivery task on `handle`.
pub(crate) fn spawn(handle: &Handle) -> (EventNotifier, EventPublisher, JoinHandle<()>) {
    let registry = Arc::new(Registry::default());
    let (tx, rx) = mpsc::unbounded_channel();

    let task = handle.spawn(deliver(rx, Arc::clone(&registry)));

    (EventNotifier { registry }, EventPublisher { tx }, task)
}

async fn deliver(mut rx: mpsc::UnboundedReceiver<Delivery>, registry: Arc<Registry>) {
    while let Some(delivery) = rx.recv().await {
        match delivery {
            Delivery::Event(event) => dispatch_event(&registry, &event),
            Delivery::Barrier(done) => {
                let _ = done.send(());
            }
        }
    }
}

fn dispatch_event(registry: &Registry, event: &WriteEvent) {
    // Snapshot so listeners may (un)register from inside a callback.
    let listeners: Vec<(ListenerId, Listener)> = registry
        .listeners
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();

    for (id, listener) in listeners {
        if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
            tracing::error!(listener = id.0, "write event listener panicked");
        }
    }

    registry
        .subscribers
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .retain(|tx| tx.send(event.clone()).is_ok());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn target() -> WriteTarget {
        WriteTarget::new("bucket", "org", WritePrecision::Ns).unwrap()
    }

    #[tokio::test]
    async fn test_listeners_receive_events_in_order() {
        let (notifier, publisher, _task) = spawn(&Handle::current());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        notifier.add_listener(move |event| {
            if let WriteEvent::Success(success) = event {
                sink.lock().unwrap().push(success.line_protocol.clone());
            }
        });

        for i in 0..5 {
            publisher.publish(WriteEvent::success(&target(), &format!("m v={i}")));
        }
        publisher.delivered().await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["m v=0", "m v=1", "m v=2", "m v=3", "m v=4"]
        );
    }

    #[tokio::test]
    async fn test_panicking_listener_is_isolated() {
        let (notifier, publisher, _task) = spawn(&Handle::current());
        let count = Arc::new(AtomicUsize::new(0));

        notifier.add_listener(|_| panic!("listener bug"));
        let counter = Arc::clone(&count);
        notifier.add_listener(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        publisher.publish(WriteEvent::success(&target(), "m v=1"));
        publisher.publish(WriteEvent::success(&target(), "m v=2"));
        publisher.delivered().await;

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_remove_listener_stops_delivery() {
        let (notifier, publisher, _task) = spawn(&Handle::current());
        let count = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&count);
        let id = notifier.add_listener(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        publisher.publish(WriteEvent::success(&target(), "m v=1"));
        publisher.delivered().await;
        assert!(notifier.remove_listener(id));
        assert!(!notifier.remove_listener(id));

        publisher.publish(WriteEvent::success(&target(), "m v=2"));
        publisher.delivered().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_subscriber_stream() {
        let (notifier, publisher, _task) = spawn(&Handle::current());
        let mut stream = notifier.subscribe();

        let cause = TransportError::Http {
            status: 400,
            message: "bad timestamp".to_string(),
            retry_after: None,
        };
        publisher.publish(WriteEvent::error(&target(), "m v=1 1x", cause.clone()));

        match stream.recv().await {
            Some(WriteEvent::Error(error)) => {
                assert_eq!(error.line_protocol, "m v=1 1x");
                assert_eq!(error.cause, cause);
                assert_eq!(error.bucket, "bucket");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(stream.try_recv().is_none());
    }
}
