//! Shared helpers for the integration tests: an in-memory write server and
//! an event collector.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::Read as _;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use flate2::read::GzDecoder;
use fluxline::{
    ContentEncoding, TransportError, WriteApi, WriteEvent, WritePrecision, WriteRequest,
    WriteTransport,
};
use tokio::time::Instant;

/// One request as seen by [`MockServer`].
#[derive(Debug, Clone)]
pub struct Received {
    pub bucket: String,
    pub organization: String,
    pub precision: WritePrecision,
    pub body: String,
    pub at: Instant,
}

/// In-memory stand-in for the write endpoint.
///
/// Rejects lines whose timestamp is not an integer, the way the server does,
/// and can be scripted to fail the next calls.
#[derive(Default)]
pub struct MockServer {
    received: Mutex<Vec<Received>>,
    failures: Mutex<VecDeque<TransportError>>,
    latency: Duration,
}

impl MockServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_latency(latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            latency,
            ..Self::default()
        })
    }

    /// Fails the next calls with `errors`, in order.
    pub fn fail_next(&self, errors: impl IntoIterator<Item = TransportError>) {
        self.failures.lock().unwrap().extend(errors);
    }

    pub fn received(&self) -> Vec<Received> {
        self.received.lock().unwrap().clone()
    }

    pub fn bodies(&self) -> Vec<String> {
        self.received().into_iter().map(|r| r.body).collect()
    }

    pub fn lines(&self) -> Vec<String> {
        self.bodies()
            .iter()
            .flat_map(|b| b.split('\n').map(str::to_string).collect::<Vec<_>>())
            .collect()
    }
}

fn decode(request: &WriteRequest) -> String {
    match request.content_encoding {
        ContentEncoding::Identity => String::from_utf8(request.body.clone()).unwrap(),
        ContentEncoding::Gzip => {
            let mut body = String::new();
            GzDecoder::new(request.body.as_slice())
                .read_to_string(&mut body)
                .unwrap();
            body
        }
    }
}

fn check_timestamps(body: &str) -> Result<(), TransportError> {
    for line in body.lines() {
        let parts: Vec<&str> = line.split(' ').collect();
        if parts.len() == 3 && parts[2].parse::<i64>().is_err() {
            return Err(TransportError::Http {
                status: 400,
                message: format!("unable to parse '{line}': bad timestamp"),
                retry_after: None,
            });
        }
    }
    Ok(())
}

#[async_trait]
impl WriteTransport for MockServer {
    async fn post_write(&self, request: &WriteRequest) -> Result<(), TransportError> {
        let body = decode(request);
        self.received.lock().unwrap().push(Received {
            bucket: request.bucket.clone(),
            organization: request.organization.clone(),
            precision: request.precision,
            body: body.clone(),
            at: Instant::now(),
        });

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let scripted = self.failures.lock().unwrap().pop_front();
        if let Some(error) = scripted {
            return Err(error);
        }
        check_timestamps(&body)
    }
}

/// Collects every event published by `api`.
pub fn collect_events(api: &WriteApi) -> Arc<Mutex<Vec<WriteEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    api.events().add_listener(move |event| {
        sink.lock().unwrap().push(event.clone());
    });
    events
}

pub fn unavailable() -> TransportError {
    TransportError::Http {
        status: 503,
        message: "service unavailable".to_string(),
        retry_after: None,
    }
}
