//! Batch dispatch with retry.
//!
//! A single worker takes batches off the [`DispatchQueue`] in FIFO order and
//! sends each through the [`WriteTransport`]. Outcomes are classified:
//!
//! - success publishes a `WriteSuccessEvent`;
//! - a retriable failure with retries left publishes a
//!   `WriteRetriableErrorEvent` and resends after a backoff delay;
//! - anything else publishes a `WriteErrorEvent` and drops the batch.
//!
//! The backoff delay is `BatchOptions::retry_delay`, unless the server sent a
//! `Retry-After`, which wins (still capped at `max_retry_delay`). Once
//! shutdown starts, waiting retries are abandoned and remaining batches get a
//! single attempt.

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::accumulator::{Batch, DispatchQueue};
use crate::error::TransportError;
use crate::events::{EventPublisher, WriteEvent};
use crate::options::BatchOptions;
use crate::scheduler::stopped;
use crate::transport::{ContentEncoding, WriteRequest, WriteTransport};

/// The dispatch worker.
pub(crate) struct Dispatcher {
    pub(crate) transport: Arc<dyn WriteTransport>,
    pub(crate) options: BatchOptions,
    pub(crate) content_encoding: ContentEncoding,
    pub(crate) queue: Arc<DispatchQueue>,
    pub(crate) events: EventPublisher,
    pub(crate) shutdown: watch::Receiver<bool>,
}

impl Dispatcher {
    /// Starts the worker. It exits once the queue is closed and drained.
    pub(crate) fn spawn(self, handle: &Handle) -> JoinHandle<()> {
        handle.spawn(self.run())
    }

    async fn run(self) {
        while let Some(batch) = self.queue.pop().await {
            self.dispatch(batch).await;
        }
        tracing::debug!("dispatcher drained");
    }

    async fn dispatch(&self, batch: Batch) {
        let payload = batch.payload();
        let target = &batch.target;

        let request = match WriteRequest::encode(target, &payload, self.content_encoding) {
            Ok(request) => request,
            Err(cause) => {
                tracing::error!(%target, error = %cause, "failed to encode batch");
                self.events.publish(WriteEvent::error(target, &payload, cause));
                return;
            }
        };

        let mut attempt: u32 = 0;
        loop {
            let cause = match self.transport.post_write(&request).await {
                Ok(()) => {
                    tracing::debug!(%target, lines = batch.lines.len(), attempt, "batch written");
                    self.events.publish(WriteEvent::success(target, &payload));
                    return;
                }
                Err(cause) => cause,
            };

            if !cause.is_retriable() || attempt >= self.options.max_retries || self.is_shutting_down()
            {
                tracing::error!(
                    %target,
                    lines = batch.lines.len(),
                    attempt,
                    error = %cause,
                    "batch write failed"
                );
                self.events.publish(WriteEvent::error(target, &payload, cause));
                return;
            }

            let delay = self.backoff(&cause, attempt);
            let attempts_remaining = self.options.max_retries - attempt - 1;
            tracing::warn!(
                %target,
                error = %cause,
                ?delay,
                attempts_remaining,
                "batch write failed, retrying"
            );
            self.events.publish(WriteEvent::retriable(
                target,
                &payload,
                cause.clone(),
                delay,
                attempts_remaining,
            ));

            attempt += 1;
            if !self.wait_retry(delay).await {
                tracing::warn!(%target, "shutdown abandoned pending retry");
                self.events.publish(WriteEvent::error(target, &payload, cause));
                return;
            }
        }
    }

    fn backoff(&self, cause: &TransportError, attempt: u32) -> Duration {
        match cause.retry_after() {
            Some(requested) => requested.min(self.options.max_retry_delay),
            None => self.options.retry_delay(attempt),
        }
    }

    /// Sleeps for `delay`. Returns `false` if shutdown started first.
    async fn wait_retry(&self, delay: Duration) -> bool {
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            () = tokio::time::sleep(delay) => true,
            () = stopped(&mut shutdown) => false,
        }
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{self, EventStream};
    use crate::target::{WritePrecision, WriteTarget};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::time::Instant;

    /// Replays scripted outcomes and records when each call happened.
    struct Scripted {
        outcomes: Mutex<VecDeque<Result<(), TransportError>>>,
        calls: Mutex<Vec<Instant>>,
    }

    impl Scripted {
        fn new(outcomes: Vec<Result<(), TransportError>>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn call_times(&self) -> Vec<Instant> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl WriteTransport for Scripted {
        async fn post_write(&self, _request: &WriteRequest) -> Result<(), TransportError> {
            self.calls.lock().unwrap().push(Instant::now());
            self.outcomes.lock().unwrap().pop_front().unwrap_or(Ok(()))
        }
    }

    fn unavailable() -> TransportError {
        TransportError::Http {
            status: 503,
            message: "service unavailable".to_string(),
            retry_after: None,
        }
    }

    struct Harness {
        queue: Arc<DispatchQueue>,
        stream: EventStream,
        stop: watch::Sender<bool>,
        worker: JoinHandle<()>,
    }

    fn start(transport: Arc<Scripted>, options: BatchOptions) -> Harness {
        let handle = Handle::current();
        let (notifier, publisher, _task) = events::spawn(&handle);
        let stream = notifier.subscribe();
        let queue = Arc::new(DispatchQueue::new(options.buffer_limit, publisher.clone()));
        let (stop, shutdown) = watch::channel(false);

        let worker = Dispatcher {
            transport,
            options,
            content_encoding: ContentEncoding::Identity,
            queue: Arc::clone(&queue),
            events: publisher,
            shutdown,
        }
        .spawn(&handle);

        Harness {
            queue,
            stream,
            stop,
            worker,
        }
    }

    fn batch(lines: &[&str]) -> Batch {
        Batch {
            target: WriteTarget::new("b", "o", WritePrecision::Ns).unwrap(),
            lines: lines.iter().map(|l| (*l).to_string()).collect(),
        }
    }

    fn options() -> BatchOptions {
        BatchOptions::default()
            .with_retry_interval(Duration::from_millis(100))
            .with_max_retry_delay(Duration::from_millis(1_000))
            .with_max_retries(3)
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_with_backoff_then_succeeds() {
        let transport = Scripted::new(vec![Err(unavailable()), Err(unavailable()), Ok(())]);
        let mut h = start(Arc::clone(&transport), options());

        h.queue.push(batch(&["m v=1", "m v=2"]));

        let mut delays = Vec::new();
        loop {
            match h.stream.recv().await.unwrap() {
                WriteEvent::RetriableError(e) => {
                    assert_eq!(e.line_protocol, "m v=1\nm v=2");
                    delays.push((e.retry_delay, e.attempts_remaining));
                }
                WriteEvent::Success(s) => {
                    assert_eq!(s.line_protocol, "m v=1\nm v=2");
                    break;
                }
                other => panic!("unexpected event {other:?}"),
            }
        }

        assert_eq!(
            delays,
            vec![
                (Duration::from_millis(100), 2),
                (Duration::from_millis(200), 1)
            ]
        );

        let calls = transport.call_times();
        assert_eq!(calls.len(), 3);
        assert!(calls[1] - calls[0] >= Duration::from_millis(100));
        assert!(calls[2] - calls[1] >= Duration::from_millis(200));

        h.queue.close();
        h.worker.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_report_error() {
        let transport = Scripted::new(vec![Err(unavailable()); 10]);
        let mut h = start(Arc::clone(&transport), options());

        h.queue.push(batch(&["m v=1"]));

        let mut retriable = 0;
        loop {
            match h.stream.recv().await.unwrap() {
                WriteEvent::RetriableError(_) => retriable += 1,
                WriteEvent::Error(e) => {
                    assert_eq!(e.cause.status(), Some(503));
                    break;
                }
                other => panic!("unexpected event {other:?}"),
            }
        }

        assert_eq!(retriable, 3);
        assert_eq!(transport.call_times().len(), 4);

        h.queue.close();
        h.worker.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_is_not_retried() {
        let bad_request = TransportError::Http {
            status: 400,
            message: "unable to parse 'm v=1 x': bad timestamp".to_string(),
            retry_after: None,
        };
        let transport = Scripted::new(vec![Err(bad_request.clone())]);
        let mut h = start(Arc::clone(&transport), options());

        h.queue.push(batch(&["m v=1 x"]));

        match h.stream.recv().await.unwrap() {
            WriteEvent::Error(e) => assert_eq!(e.cause, bad_request),
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(transport.call_times().len(), 1);

        h.queue.close();
        h.worker.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_overrides_backoff() {
        let throttled = TransportError::Http {
            status: 429,
            message: "too many requests".to_string(),
            retry_after: Some(Duration::from_millis(700)),
        };
        let transport = Scripted::new(vec![Err(throttled), Ok(())]);
        let mut h = start(Arc::clone(&transport), options());

        h.queue.push(batch(&["m v=1"]));

        match h.stream.recv().await.unwrap() {
            WriteEvent::RetriableError(e) => {
                assert_eq!(e.retry_delay, Duration::from_millis(700));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(matches!(h.stream.recv().await, Some(WriteEvent::Success(_))));

        h.queue.close();
        h.worker.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_abandons_pending_retry() {
        let transport = Scripted::new(vec![Err(unavailable()); 10]);
        let mut h = start(
            Arc::clone(&transport),
            options().with_retry_interval(Duration::from_millis(500)),
        );

        h.queue.push(batch(&["m v=1"]));
        assert!(matches!(
            h.stream.recv().await,
            Some(WriteEvent::RetriableError(_))
        ));

        h.stop.send_replace(true);
        h.queue.push(batch(&["m v=2"]));
        h.queue.close();

        // The abandoned retry and the single attempt of the late batch.
        for expected in ["m v=1", "m v=2"] {
            match h.stream.recv().await.unwrap() {
                WriteEvent::Error(e) => assert_eq!(e.line_protocol, expected),
                other => panic!("unexpected event {other:?}"),
            }
        }

        h.worker.await.unwrap();
        assert_eq!(transport.call_times().len(), 2);
    }
}
