//! # fluxline
//!
//! Buffered write pipeline for InfluxDB line protocol.
//!
//! fluxline accepts raw line-protocol records, structured points and
//! annotated Rust types, batches them per destination and sends them in the
//! background with retry and backoff. Write calls return as soon as the data
//! is converted; outcomes are published to listeners.
//!
//! **Status**: This crate is in early development. The API is not yet stable.
//!
//! ## Key Properties
//!
//! - Size-triggered and timer-triggered flushes, with jitter on the timer
//! - One request never mixes buckets, organizations or precisions
//! - Retriable failures (429, 5xx, network) are resent with exponential backoff
//! - Malformed lines are left to the server and reported once, never retried
//! - Closing the pipeline flushes everything still pending
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use fluxline::{
//!     BatchOptions, HttpConfig, HttpTransport, Point, WriteApi, WriteDefaults, WriteEvent,
//!     WritePrecision,
//! };
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = HttpTransport::new(
//!     HttpConfig::new("http://localhost:8086").with_token("my-token"),
//! )?;
//!
//! let api = WriteApi::builder(Arc::new(transport))
//!     .with_batch_options(
//!         BatchOptions::default()
//!             .with_batch_size(5_000)
//!             .with_flush_interval(Duration::from_secs(1))
//!             .with_jitter_interval(Duration::from_millis(200)),
//!     )
//!     .with_defaults(
//!         WriteDefaults::default()
//!             .with_bucket("my-bucket")
//!             .with_organization("my-org")
//!             .with_default_tag("region", "eu-west"),
//!     )
//!     .build()?;
//!
//! // Outcomes only surface here.
//! api.events().add_listener(|event| match event {
//!     WriteEvent::Error(e) => eprintln!("dropped batch: {}", e.cause),
//!     WriteEvent::RetriableError(e) => eprintln!("retrying in {:?}", e.retry_delay),
//!     _ => {}
//! });
//!
//! api.write_record(WritePrecision::S, "cpu,host=web1 usage=85.5 1700000000")?;
//! api.write_point(&Point::measurement("mem").tag("host", "web1").field("used", 1_024))?;
//!
//! // Flush and wait for the last outcomes.
//! api.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`WriteApi`]: Buffered pipeline: converts, batches and dispatches in the background
//! - [`DirectWriteApi`]: One awaited request per call, no batching
//! - [`WriteTransport`]: Transport seam; [`HttpTransport`] posts to `/api/v2/write`
//! - [`EventNotifier`]: Listener registration for write outcomes
//!
//! ## Modules
//!
//! - [`write_api`]: Buffered pipeline lifecycle and write methods
//! - [`direct`]: Unbuffered writes
//! - [`line_protocol`]: Wire format rendering and escaping
//! - [`point`]: Structured points
//! - [`entity`]: Mapping of annotated types, with per-type metadata cache
//! - [`options`]: Batch, retry and default-destination configuration
//! - [`target`]: Write destinations and timestamp precision
//! - [`transport`]: Request encoding and the HTTP transport
//! - [`events`]: Outcome events and delivery
//! - [`error`]: Error types

mod accumulator;
mod dispatcher;
mod scheduler;

pub mod direct;
pub mod entity;
pub mod error;
pub mod events;
pub mod line_protocol;
pub mod options;
pub mod point;
pub mod target;
pub mod transport;
pub mod write_api;

// Re-export primary API types at crate root for convenience.
pub use direct::DirectWriteApi;
pub use entity::{Column, Entity, EntitySchema, Value};
pub use error::{ConfigError, FluxlineError, MappingError, PipelineError, Result, TransportError};
pub use events::{
    BackpressureEvent, EventNotifier, EventStream, ListenerId, WriteErrorEvent, WriteEvent,
    WriteRetriableErrorEvent, WriteSuccessEvent,
};
pub use line_protocol::FieldValue;
pub use options::{BatchOptions, WriteDefaults};
pub use point::Point;
pub use target::{WritePrecision, WriteTarget};
pub use transport::{ContentEncoding, WriteRequest, WriteTransport};
#[cfg(feature = "http")]
pub use transport::{HttpConfig, HttpTransport};
pub use write_api::{WriteApi, WriteApiBuilder};
