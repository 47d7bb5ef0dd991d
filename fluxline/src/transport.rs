//! Transport seam between the dispatcher and the database.
//!
//! The pipeline hands a fully encoded [`WriteRequest`] to a
//! [`WriteTransport`] and classifies the returned [`TransportError`]. The
//! `http` feature (on by default) provides [`HttpTransport`], which posts to
//! the InfluxDB v2 `/api/v2/write` endpoint.

use std::io::Write as _;

use async_trait::async_trait;
use flate2::Compression;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};

use crate::error::TransportError;
use crate::target::{WritePrecision, WriteTarget};

/// Encoding of the request body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentEncoding {
    /// Plain UTF-8 text.
    #[default]
    Identity,
    /// Gzip-compressed text.
    Gzip,
}

impl ContentEncoding {
    /// Returns the `Content-Encoding` header value.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Gzip => "gzip",
        }
    }
}

/// One write call: destination plus encoded body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRequest {
    /// Destination organization.
    pub organization: String,
    /// Destination bucket.
    pub bucket: String,
    /// Precision of the timestamps in the body.
    pub precision: WritePrecision,
    /// Encoded body bytes.
    pub body: Vec<u8>,
    /// Encoding applied to `body`.
    pub content_encoding: ContentEncoding,
}

impl WriteRequest {
    /// Encodes a line-protocol payload for `target`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Encoding`] if compression fails.
    pub fn encode(
        target: &WriteTarget,
        payload: &str,
        content_encoding: ContentEncoding,
    ) -> Result<Self, TransportError> {
        let body = match content_encoding {
            ContentEncoding::Identity => payload.as_bytes().to_vec(),
            ContentEncoding::Gzip => compress_gzip(payload.as_bytes())?,
        };

        Ok(Self {
            organization: target.organization.clone(),
            bucket: target.bucket.clone(),
            precision: target.precision,
            body,
            content_encoding,
        })
    }
}

fn compress_gzip(data: &[u8]) -> Result<Vec<u8>, TransportError> {
    let to_error = |e: std::io::Error| TransportError::Encoding {
        message: e.to_string(),
    };

    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 4), Compression::default());
    encoder.write_all(data).map_err(to_error)?;
    encoder.finish().map_err(to_error)
}

/// Performs write calls against the database.
///
/// Implementations must classify failures through [`TransportError`]:
/// throttling (429) and server failures (5xx) as HTTP errors with those
/// statuses, network failures as [`TransportError::Connection`] or
/// [`TransportError::Timeout`].
#[async_trait]
pub trait WriteTransport: Send + Sync {
    /// Sends one write request.
    async fn post_write(&self, request: &WriteRequest) -> Result<(), TransportError>;
}

/// Extracts the server diagnostic from an error response body.
///
/// InfluxDB answers with `{"code": "...", "message": "..."}`; anything else
/// is returned trimmed as-is.
pub fn error_message(body: &str) -> String {
    #[derive(Deserialize)]
    struct ErrorBody {
        message: Option<String>,
    }

    match serde_json::from_str::<ErrorBody>(body) {
        Ok(ErrorBody {
            message: Some(message),
        }) if !message.is_empty() => message,
        _ => body.trim().to_string(),
    }
}

#[cfg(feature = "http")]
pub use http::{HttpConfig, HttpTransport};

#[cfg(feature = "http")]
mod http {
    use std::time::Duration;

    use async_trait::async_trait;
    use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE, RETRY_AFTER};

    use super::{WriteRequest, WriteTransport, error_message};
    use crate::error::{ConfigError, TransportError};

    /// Configuration of the HTTP transport.
    #[derive(Debug, Clone)]
    pub struct HttpConfig {
        /// Base URL of the server (e.g., `http://localhost:8086`).
        pub url: String,
        /// API token sent as `Authorization: Token <token>`.
        pub token: Option<String>,
        /// Timeout of a single write call.
        pub timeout: Duration,
        /// Additional HTTP headers.
        pub headers: Vec<(String, String)>,
    }

    impl HttpConfig {
        /// Creates a new config with a 10s timeout and no token.
        pub fn new(url: impl Into<String>) -> Self {
            Self {
                url: url.into(),
                token: None,
                timeout: Duration::from_secs(10),
                headers: Vec::new(),
            }
        }

        /// Sets the API token.
        #[must_use]
        pub fn with_token(mut self, token: impl Into<String>) -> Self {
            self.token = Some(token.into());
            self
        }

        /// Sets the timeout of a single write call.
        #[must_use]
        pub fn with_timeout(mut self, timeout: Duration) -> Self {
            self.timeout = timeout;
            self
        }

        /// Adds an HTTP header.
        #[must_use]
        pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
            self.headers.push((name.into(), value.into()));
            self
        }

        fn write_endpoint(&self) -> String {
            format!("{}/api/v2/write", self.url.trim_end_matches('/'))
        }
    }

    /// [`WriteTransport`] posting to `/api/v2/write` with reqwest.
    pub struct HttpTransport {
        client: reqwest::Client,
        config: HttpConfig,
    }

    impl HttpTransport {
        /// Builds the HTTP client.
        ///
        /// # Errors
        ///
        /// Returns [`ConfigError::ClientCreate`] if the client cannot be built.
        pub fn new(config: HttpConfig) -> Result<Self, ConfigError> {
            let client = reqwest::Client::builder()
                .timeout(config.timeout)
                .build()
                .map_err(|e| ConfigError::ClientCreate { source: e })?;

            Ok(Self { client, config })
        }
    }

    #[async_trait]
    impl WriteTransport for HttpTransport {
        async fn post_write(&self, request: &WriteRequest) -> Result<(), TransportError> {
            let mut builder = self
                .client
                .post(self.config.write_endpoint())
                .query(&[
                    ("org", request.organization.as_str()),
                    ("bucket", request.bucket.as_str()),
                    ("precision", request.precision.as_str()),
                ])
                .header(CONTENT_TYPE, "text/plain; charset=utf-8")
                .header(CONTENT_ENCODING, request.content_encoding.as_str())
                .header("Accept", "application/json");

            if let Some(token) = &self.config.token {
                builder = builder.header("Authorization", format!("Token {token}"));
            }
            for (name, value) in &self.config.headers {
                builder = builder.header(name, value);
            }

            let response = builder
                .body(request.body.clone())
                .send()
                .await
                .map_err(classify_send_error)?;

            let status = response.status();
            if status.is_success() {
                return Ok(());
            }

            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = response.text().await.unwrap_or_default();
            let mut message = error_message(&body);
            if message.is_empty() {
                message = status.canonical_reason().unwrap_or("unknown error").to_string();
            }

            Err(TransportError::Http {
                status: status.as_u16(),
                message,
                retry_after,
            })
        }
    }

    fn classify_send_error(error: reqwest::Error) -> TransportError {
        if error.is_timeout() {
            TransportError::Timeout {
                message: error.to_string(),
            }
        } else {
            TransportError::Connection {
                message: error.to_string(),
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_config_builder() {
            let config = HttpConfig::new("http://localhost:8086/")
                .with_token("my-token")
                .with_timeout(Duration::from_secs(3))
                .with_header("User-Agent", "fluxline");

            assert_eq!(config.write_endpoint(), "http://localhost:8086/api/v2/write");
            assert_eq!(config.token.as_deref(), Some("my-token"));
            assert_eq!(config.timeout, Duration::from_secs(3));
            assert_eq!(config.headers.len(), 1);
        }

        #[tokio::test]
        async fn test_unreachable_server_is_retriable() {
            // Port 9 (discard) on localhost is expected to refuse connections.
            let transport = HttpTransport::new(
                HttpConfig::new("http://127.0.0.1:9").with_timeout(Duration::from_secs(2)),
            )
            .unwrap();
            let target =
                crate::target::WriteTarget::new("b", "o", crate::target::WritePrecision::Ns)
                    .unwrap();
            let request =
                WriteRequest::encode(&target, "m v=1", super::super::ContentEncoding::Identity)
                    .unwrap();

            let err = transport.post_write(&request).await.unwrap_err();
            assert!(err.is_retriable());
        }
    }
}
