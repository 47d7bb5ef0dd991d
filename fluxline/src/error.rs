//! Error types for the fluxline write pipeline.

use std::time::Duration;

use thiserror::Error;

/// The main error type for all fluxline operations.
///
/// Only failures that can be detected at the call site are returned through
/// this type. Outcomes of batched writes are reported asynchronously through
/// the [`EventNotifier`](crate::events::EventNotifier) instead.
#[derive(Error, Debug)]
pub enum FluxlineError {
    /// Invalid or incomplete configuration.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// An entity could not be mapped to line protocol.
    #[error("mapping error: {0}")]
    Mapping(#[from] MappingError),

    /// A direct (non-batched) write failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The pipeline cannot accept the request.
    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

/// Errors raised while validating options or resolving a write destination.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// No bucket was given and no default bucket is configured.
    #[error("bucket is required when no default bucket is configured")]
    MissingBucket,

    /// No organization was given and no default organization is configured.
    #[error("organization is required when no default organization is configured")]
    MissingOrganization,

    /// A batching option is out of range.
    #[error("invalid option '{option}': {reason}")]
    InvalidOption {
        /// Name of the offending option.
        option: &'static str,
        /// Why the value is rejected.
        reason: String,
    },

    /// The HTTP client could not be built.
    #[cfg(feature = "http")]
    #[error("failed to create HTTP client: {source}")]
    ClientCreate {
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },
}

/// Errors raised by the entity mapper.
#[derive(Error, Debug)]
pub enum MappingError {
    /// The entity schema declares an empty measurement name.
    #[error("entity type {type_name} declares an empty measurement name")]
    EmptyMeasurement {
        /// Rust type name of the entity.
        type_name: &'static str,
    },

    /// More than one property is marked as the timestamp.
    #[error("measurement '{measurement}' marks both '{first}' and '{second}' as timestamp")]
    MultipleTimestamps {
        /// Measurement name of the entity.
        measurement: String,
        /// First property marked as timestamp.
        first: &'static str,
        /// Second property marked as timestamp.
        second: &'static str,
    },

    /// The timestamp property holds a value that is not a point in time.
    #[error("timestamp property '{property}' of measurement '{measurement}' is invalid: {reason}")]
    InvalidTimestamp {
        /// Measurement name of the entity.
        measurement: String,
        /// The timestamp property.
        property: &'static str,
        /// Description of the problem.
        reason: String,
    },
}

/// Errors returned by a [`WriteTransport`](crate::transport::WriteTransport).
///
/// Cloneable so the same cause can be carried by several events.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    /// Server answered with a non-2xx status.
    #[error("server returned status {status}: {message}")]
    Http {
        /// The HTTP status code.
        status: u16,
        /// The server's diagnostic message.
        message: String,
        /// Delay requested by the server through `Retry-After`.
        retry_after: Option<Duration>,
    },

    /// The request never produced a response (connect failure, reset).
    #[error("connection failed: {message}")]
    Connection {
        /// Description of the failure.
        message: String,
    },

    /// The request timed out.
    #[error("request timed out: {message}")]
    Timeout {
        /// Description of the failure.
        message: String,
    },

    /// The request body could not be encoded.
    #[error("failed to encode request body: {message}")]
    Encoding {
        /// Description of the failure.
        message: String,
    },
}

impl TransportError {
    /// Returns `true` for throttling and transient unavailability.
    ///
    /// HTTP 429, server errors other than 501 and 505, connection failures
    /// and timeouts are retriable; every other failure will reproduce
    /// identically on resend.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Http { status, .. } => match status {
                429 => true,
                501 | 505 => false,
                500..=599 => true,
                _ => false,
            },
            Self::Connection { .. } | Self::Timeout { .. } => true,
            Self::Encoding { .. } => false,
        }
    }

    /// Returns the server-requested retry delay, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Http { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Returns the HTTP status code, if the server answered.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Errors raised by the pipeline lifecycle.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// The pipeline was created outside of a tokio runtime.
    #[error("no tokio runtime available to run the write pipeline")]
    NoRuntime,

    /// The pipeline has been closed and accepts no more writes.
    #[error("write pipeline is closed")]
    Closed,
}

/// Type alias for `Result<T, FluxlineError>`.
pub type Result<T> = std::result::Result<T, FluxlineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_classification() {
        let throttled = TransportError::Http {
            status: 429,
            message: "slow down".to_string(),
            retry_after: None,
        };
        let unavailable = TransportError::Http {
            status: 503,
            message: "unavailable".to_string(),
            retry_after: Some(Duration::from_secs(2)),
        };
        let malformed = TransportError::Http {
            status: 400,
            message: "bad timestamp".to_string(),
            retry_after: None,
        };
        let unauthorized = TransportError::Http {
            status: 401,
            message: "unauthorized access".to_string(),
            retry_after: None,
        };

        assert!(throttled.is_retriable());
        assert!(unavailable.is_retriable());
        for status in [500, 502, 504] {
            let err = TransportError::Http {
                status,
                message: "upstream failure".to_string(),
                retry_after: None,
            };
            assert!(err.is_retriable(), "status {status} should be retriable");
        }
        for status in [501, 505] {
            let err = TransportError::Http {
                status,
                message: "not supported".to_string(),
                retry_after: None,
            };
            assert!(!err.is_retriable(), "status {status} should be permanent");
        }
        assert!(!malformed.is_retriable());
        assert!(!unauthorized.is_retriable());
        assert!(
            TransportError::Connection {
                message: "reset".to_string()
            }
            .is_retriable()
        );
        assert!(
            !TransportError::Encoding {
                message: "gzip".to_string()
            }
            .is_retriable()
        );
        assert_eq!(unavailable.retry_after(), Some(Duration::from_secs(2)));
        assert_eq!(malformed.status(), Some(400));
    }

    #[test]
    fn test_error_messages_carry_server_detail() {
        let err: FluxlineError = TransportError::Http {
            status: 400,
            message: "unable to parse 'cpu x=1 1x': bad timestamp".to_string(),
            retry_after: None,
        }
        .into();

        assert!(err.to_string().contains("bad timestamp"));
        assert!(err.to_string().contains("400"));
    }
}
