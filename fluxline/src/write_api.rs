//! Buffered, non-blocking write pipeline.
//!
//! [`WriteApi`] accepts records, points and entities, converts them to line
//! protocol on the calling thread and returns immediately. Fragments are
//! batched per [`WriteTarget`] and sent by a background dispatcher; outcomes
//! surface only through the [`EventNotifier`].
//!
//! Background work runs on the tokio runtime the pipeline was built in:
//!
//! - a flush timer, firing every `flush_interval` plus jitter;
//! - a single dispatcher, sending batches in hand-off order with retry;
//! - an event delivery task, calling listeners in publish order.
//!
//! Errors detectable locally (missing destination, invalid entity schema,
//! closed pipeline) are returned synchronously and nothing is enqueued.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::accumulator::{Accumulator, DispatchQueue};
use crate::dispatcher::Dispatcher;
use crate::entity::{Entity, ErasedEntity};
use crate::error::{PipelineError, Result};
use crate::events::{self, EventNotifier, EventPublisher};
use crate::line_protocol::{PendingItem, render_items};
use crate::options::{BatchOptions, WriteDefaults};
use crate::point::{Point, group_by_precision};
use crate::scheduler;
use crate::target::{WritePrecision, WriteTarget};
use crate::transport::{ContentEncoding, WriteTransport};

/// Builder for [`WriteApi`].
pub struct WriteApiBuilder {
    transport: Arc<dyn WriteTransport>,
    options: BatchOptions,
    defaults: WriteDefaults,
    content_encoding: ContentEncoding,
}

impl WriteApiBuilder {
    /// Sets the batching and retry options.
    #[must_use]
    pub fn with_batch_options(mut self, options: BatchOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the default destination and tags.
    #[must_use]
    pub fn with_defaults(mut self, defaults: WriteDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    /// Sets the request body encoding.
    #[must_use]
    pub fn with_content_encoding(mut self, encoding: ContentEncoding) -> Self {
        self.content_encoding = encoding;
        self
    }

    /// Validates the options and starts the background tasks.
    ///
    /// # Errors
    ///
    /// Returns a config error for invalid options, or
    /// [`PipelineError::NoRuntime`] when called outside a tokio runtime.
    pub fn build(self) -> Result<WriteApi> {
        self.options.validate()?;
        let handle = Handle::try_current().map_err(|_| PipelineError::NoRuntime)?;

        let (notifier, publisher, _delivery) = events::spawn(&handle);
        let queue = Arc::new(DispatchQueue::new(
            self.options.buffer_limit,
            publisher.clone(),
        ));
        let accumulator = Arc::new(Accumulator::new(
            self.options.batch_size,
            Arc::clone(&queue),
        ));
        let (shutdown, shutdown_rx) = watch::channel(false);

        let scheduler = scheduler::spawn(
            &handle,
            Arc::clone(&accumulator),
            self.options.flush_interval,
            self.options.jitter_interval,
            shutdown_rx.clone(),
        );
        let dispatcher = Dispatcher {
            transport: self.transport,
            options: self.options.clone(),
            content_encoding: self.content_encoding,
            queue: Arc::clone(&queue),
            events: publisher.clone(),
            shutdown: shutdown_rx,
        }
        .spawn(&handle);

        tracing::debug!(
            batch_size = self.options.batch_size,
            flush_interval = ?self.options.flush_interval,
            jitter_interval = ?self.options.jitter_interval,
            max_retries = self.options.max_retries,
            "write pipeline started"
        );

        Ok(WriteApi {
            defaults: self.defaults,
            accumulator,
            queue,
            notifier,
            publisher,
            shutdown,
            tasks: Mutex::new(vec![("flush timer", scheduler), ("dispatcher", dispatcher)]),
        })
    }
}

/// Buffered write pipeline.
///
/// Write methods never wait on the network. Call [`WriteApi::close`] to
/// flush, send what is left and wait for the last events; dropping the
/// pipeline flushes and lets the background tasks finish on their own.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use fluxline::{HttpConfig, HttpTransport, Point, WriteApi, WriteDefaults, WriteEvent};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let transport = HttpTransport::new(HttpConfig::new("http://localhost:8086").with_token("t"))?;
/// let api = WriteApi::builder(Arc::new(transport))
///     .with_defaults(WriteDefaults::default().with_bucket("b").with_organization("o"))
///     .build()?;
///
/// api.events().add_listener(|event| {
///     if let WriteEvent::Error(error) = event {
///         eprintln!("write failed: {}", error.cause);
///     }
/// });
///
/// api.write_point(&Point::measurement("cpu").tag("host", "a").field("usage", 0.5))?;
/// api.close().await;
/// # Ok(())
/// # }
/// ```
pub struct WriteApi {
    defaults: WriteDefaults,
    accumulator: Arc<Accumulator>,
    queue: Arc<DispatchQueue>,
    notifier: EventNotifier,
    publisher: EventPublisher,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl WriteApi {
    /// Starts building a pipeline writing through `transport`.
    pub fn builder(transport: Arc<dyn WriteTransport>) -> WriteApiBuilder {
        WriteApiBuilder {
            transport,
            options: BatchOptions::default(),
            defaults: WriteDefaults::default(),
            content_encoding: ContentEncoding::default(),
        }
    }

    /// Returns the registration point for outcome listeners.
    pub fn events(&self) -> &EventNotifier {
        &self.notifier
    }

    /// Writes one line-protocol record to the default destination.
    ///
    /// The record is passed through verbatim; a blank record is ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if no destination resolves or the pipeline is closed.
    pub fn write_record(&self, precision: WritePrecision, record: &str) -> Result<()> {
        self.write_items(None, None, precision, [PendingItem::Record(record)])
    }

    /// Writes one line-protocol record to `bucket` in `organization`.
    ///
    /// # Errors
    ///
    /// See [`WriteApi::write_record`].
    pub fn write_record_to(
        &self,
        bucket: &str,
        organization: &str,
        precision: WritePrecision,
        record: &str,
    ) -> Result<()> {
        self.write_items(
            Some(bucket),
            Some(organization),
            precision,
            [PendingItem::Record(record)],
        )
    }

    /// Writes line-protocol records to the default destination, in order.
    ///
    /// # Errors
    ///
    /// See [`WriteApi::write_record`].
    pub fn write_records<I>(&self, precision: WritePrecision, records: I) -> Result<()>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        self.write_records_impl(None, None, precision, records)
    }

    /// Writes line-protocol records to `bucket` in `organization`, in order.
    ///
    /// # Errors
    ///
    /// See [`WriteApi::write_record`].
    pub fn write_records_to<I>(
        &self,
        bucket: &str,
        organization: &str,
        precision: WritePrecision,
        records: I,
    ) -> Result<()>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        self.write_records_impl(Some(bucket), Some(organization), precision, records)
    }

    /// Writes a point to the default destination, at the point's precision.
    ///
    /// A point without writable fields is ignored.
    ///
    /// # Errors
    ///
    /// See [`WriteApi::write_record`].
    pub fn write_point(&self, point: &Point) -> Result<()> {
        self.write_points_impl(None, None, [point])
    }

    /// Writes a point to `bucket` in `organization`.
    ///
    /// # Errors
    ///
    /// See [`WriteApi::write_record`].
    pub fn write_point_to(&self, bucket: &str, organization: &str, point: &Point) -> Result<()> {
        self.write_points_impl(Some(bucket), Some(organization), [point])
    }

    /// Writes points to the default destination.
    ///
    /// Points are grouped by precision; each group is batched separately.
    ///
    /// # Errors
    ///
    /// See [`WriteApi::write_record`].
    pub fn write_points<'a, I>(&self, points: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a Point>,
    {
        self.write_points_impl(None, None, points)
    }

    /// Writes points to `bucket` in `organization`.
    ///
    /// # Errors
    ///
    /// See [`WriteApi::write_record`].
    pub fn write_points_to<'a, I>(&self, bucket: &str, organization: &str, points: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a Point>,
    {
        self.write_points_impl(Some(bucket), Some(organization), points)
    }

    /// Maps an entity and writes it to the default destination.
    ///
    /// # Errors
    ///
    /// Returns a mapping error for an invalid schema or timestamp, besides
    /// the errors of [`WriteApi::write_record`].
    pub fn write_measurement<E: Entity>(&self, precision: WritePrecision, entity: &E) -> Result<()> {
        self.write_measurements_impl(None, None, precision, [entity])
    }

    /// Maps an entity and writes it to `bucket` in `organization`.
    ///
    /// # Errors
    ///
    /// See [`WriteApi::write_measurement`].
    pub fn write_measurement_to<E: Entity>(
        &self,
        bucket: &str,
        organization: &str,
        precision: WritePrecision,
        entity: &E,
    ) -> Result<()> {
        self.write_measurements_impl(Some(bucket), Some(organization), precision, [entity])
    }

    /// Maps entities and writes them to the default destination.
    ///
    /// Nothing is enqueued if any entity fails to map.
    ///
    /// # Errors
    ///
    /// See [`WriteApi::write_measurement`].
    pub fn write_measurements<'a, E, I>(&self, precision: WritePrecision, entities: I) -> Result<()>
    where
        E: Entity,
        I: IntoIterator<Item = &'a E>,
    {
        self.write_measurements_impl(None, None, precision, entities)
    }

    /// Maps entities and writes them to `bucket` in `organization`.
    ///
    /// # Errors
    ///
    /// See [`WriteApi::write_measurement`].
    pub fn write_measurements_to<'a, E, I>(
        &self,
        bucket: &str,
        organization: &str,
        precision: WritePrecision,
        entities: I,
    ) -> Result<()>
    where
        E: Entity,
        I: IntoIterator<Item = &'a E>,
    {
        self.write_measurements_impl(Some(bucket), Some(organization), precision, entities)
    }

    /// Hands every pending batch to the dispatcher without waiting for it.
    pub fn flush(&self) {
        let batches = self.accumulator.flush_all();
        tracing::debug!(batches, "explicit flush");
    }

    /// Hands the pending batch of one target to the dispatcher.
    pub fn flush_target(&self, target: &WriteTarget) {
        if self.accumulator.flush_target(target) {
            tracing::debug!(%target, "explicit flush");
        }
    }

    /// Number of lines accumulated but not yet handed to the dispatcher.
    pub fn pending_lines(&self) -> usize {
        self.accumulator.pending_lines()
    }

    /// Number of lines handed off and waiting to be sent.
    pub fn queued_lines(&self) -> usize {
        self.queue.buffered_lines()
    }

    /// Flushes, sends everything still queued and waits until the resulting
    /// events are delivered.
    ///
    /// Retries waiting for their backoff are abandoned and reported as
    /// errors; a request already in flight completes. Writes issued after
    /// `close` fail with [`PipelineError::Closed`].
    pub async fn close(&self) {
        self.begin_shutdown();

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for (name, task) in tasks {
            if let Err(e) = task.await {
                tracing::error!(task = name, error = %e, "background task failed");
            }
        }

        self.publisher.delivered().await;
        tracing::debug!("write pipeline closed");
    }

    fn begin_shutdown(&self) {
        let Some(batches) = self.accumulator.close() else {
            return;
        };
        self.shutdown.send_replace(true);
        tracing::debug!(batches, "write pipeline shutting down");
    }

    fn write_records_impl<I>(
        &self,
        bucket: Option<&str>,
        organization: Option<&str>,
        precision: WritePrecision,
        records: I,
    ) -> Result<()>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let records: Vec<I::Item> = records.into_iter().collect();
        let items = records.iter().map(|r| PendingItem::Record(r.as_ref()));
        self.write_items(bucket, organization, precision, items)
    }

    fn write_measurements_impl<'a, E, I>(
        &self,
        bucket: Option<&str>,
        organization: Option<&str>,
        precision: WritePrecision,
        entities: I,
    ) -> Result<()>
    where
        E: Entity,
        I: IntoIterator<Item = &'a E>,
    {
        let items = entities
            .into_iter()
            .map(|e| PendingItem::Entity(e as &dyn ErasedEntity));
        self.write_items(bucket, organization, precision, items)
    }

    fn write_items<'a, I>(
        &self,
        bucket: Option<&str>,
        organization: Option<&str>,
        precision: WritePrecision,
        items: I,
    ) -> Result<()>
    where
        I: IntoIterator<Item = PendingItem<'a>>,
    {
        self.ensure_open()?;
        let target = self.defaults.resolve(bucket, organization, precision)?;
        let fragments = render_items(items, precision, &self.defaults.default_tags)?;
        self.enqueue(&target, fragments)
    }

    fn write_points_impl<'a, I>(
        &self,
        bucket: Option<&str>,
        organization: Option<&str>,
        points: I,
    ) -> Result<()>
    where
        I: IntoIterator<Item = &'a Point>,
    {
        self.ensure_open()?;

        // Resolve every group before enqueueing any of them.
        let mut prepared = Vec::new();
        for (precision, group) in group_by_precision(points) {
            let target = self.defaults.resolve(bucket, organization, precision)?;
            let fragments: Vec<String> = group
                .into_iter()
                .filter_map(|p| p.to_line_protocol(&self.defaults.default_tags))
                .collect();
            prepared.push((target, fragments));
        }

        for (target, fragments) in prepared {
            self.enqueue(&target, fragments)?;
        }
        Ok(())
    }

    fn enqueue(&self, target: &WriteTarget, fragments: Vec<String>) -> Result<()> {
        if fragments.is_empty() {
            tracing::trace!(%target, "nothing writable, skipping");
            return Ok(());
        }
        self.accumulator.enqueue(target, fragments)?;
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.accumulator.is_closed() {
            return Err(PipelineError::Closed.into());
        }
        Ok(())
    }
}

impl Drop for WriteApi {
    fn drop(&mut self) {
        self.begin_shutdown();
    }
}
