//! Pipeline configuration: batching, retry and write defaults.
//!
//! Options are supplied once when a pipeline is built and are immutable
//! afterwards. Both structs (de)serialize with serde; durations are written
//! as whole milliseconds under `*_ms` keys and missing keys take the
//! defaults, so a partial JSON document is a valid configuration.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::target::{WritePrecision, WriteTarget};

/// Batching and retry options.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use fluxline::options::BatchOptions;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let options = BatchOptions::default()
///     .with_batch_size(5_000)
///     .with_flush_interval(Duration::from_secs(10))
///     .with_jitter_interval(Duration::from_secs(2));
/// options.validate()?;
///
/// let json = serde_json::to_string(&options)?;
/// assert!(json.contains("\"flush_interval_ms\":10000"));
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchOptions {
    /// Number of fragments per target that triggers an immediate flush.
    pub batch_size: usize,

    /// Base period of the flush timer.
    #[serde(rename = "flush_interval_ms", with = "duration_ms")]
    pub flush_interval: Duration,

    /// Upper bound of the random delay added to every timer period.
    #[serde(rename = "jitter_interval_ms", with = "duration_ms")]
    pub jitter_interval: Duration,

    /// Delay before the first retry of a retriable failure.
    #[serde(rename = "retry_interval_ms", with = "duration_ms")]
    pub retry_interval: Duration,

    /// Number of retries before a batch is reported as failed.
    pub max_retries: u32,

    /// Cap applied to the exponential retry delay.
    #[serde(rename = "max_retry_delay_ms", with = "duration_ms")]
    pub max_retry_delay: Duration,

    /// Growth factor of the retry delay.
    pub exponential_base: f64,

    /// Maximum number of lines waiting for dispatch.
    ///
    /// When exceeded, the oldest waiting batches are discarded and reported
    /// through a backpressure event.
    pub buffer_limit: usize,
}

impl Default for BatchOptions {
    /// Defaults: batches of 1000, 1s flush, no jitter, 5s first retry,
    /// 5 retries, 125s delay cap, base 2, 10 000 buffered lines.
    fn default() -> Self {
        Self {
            batch_size: 1_000,
            flush_interval: Duration::from_millis(1_000),
            jitter_interval: Duration::ZERO,
            retry_interval: Duration::from_millis(5_000),
            max_retries: 5,
            max_retry_delay: Duration::from_millis(125_000),
            exponential_base: 2.0,
            buffer_limit: 10_000,
        }
    }
}

impl BatchOptions {
    /// Sets the batch size.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Sets the flush interval.
    #[must_use]
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Sets the jitter interval.
    #[must_use]
    pub fn with_jitter_interval(mut self, interval: Duration) -> Self {
        self.jitter_interval = interval;
        self
    }

    /// Sets the first retry delay.
    #[must_use]
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Sets the maximum number of retries.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the retry delay cap.
    #[must_use]
    pub fn with_max_retry_delay(mut self, delay: Duration) -> Self {
        self.max_retry_delay = delay;
        self
    }

    /// Sets the retry growth factor.
    #[must_use]
    pub fn with_exponential_base(mut self, base: f64) -> Self {
        self.exponential_base = base;
        self
    }

    /// Sets the buffer limit.
    #[must_use]
    pub fn with_buffer_limit(mut self, limit: usize) -> Self {
        self.buffer_limit = limit;
        self
    }

    /// Validates the options.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidOption`] naming the first invalid option.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(invalid("batch_size", "must be at least 1".to_string()));
        }
        if self.flush_interval < Duration::from_millis(1) {
            return Err(invalid("flush_interval", "must be at least 1ms".to_string()));
        }
        if self.retry_interval < Duration::from_millis(1) {
            return Err(invalid("retry_interval", "must be at least 1ms".to_string()));
        }
        if self.max_retry_delay < self.retry_interval {
            return Err(invalid(
                "max_retry_delay",
                format!(
                    "({:?}) must be >= retry_interval ({:?})",
                    self.max_retry_delay, self.retry_interval
                ),
            ));
        }
        if !self.exponential_base.is_finite() || self.exponential_base < 1.0 {
            return Err(invalid(
                "exponential_base",
                format!("{} must be a finite number >= 1", self.exponential_base),
            ));
        }
        if self.buffer_limit < self.batch_size {
            return Err(invalid(
                "buffer_limit",
                format!(
                    "{} must be >= batch_size ({})",
                    self.buffer_limit, self.batch_size
                ),
            ));
        }
        Ok(())
    }

    /// Delay before retry number `attempt + 1` (`attempt` counts from zero).
    ///
    /// `min(max_retry_delay, retry_interval * exponential_base^attempt)`.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let scaled = self.retry_interval.as_secs_f64() * self.exponential_base.powi(exponent);
        let cap = self.max_retry_delay.as_secs_f64();

        if !scaled.is_finite() || scaled >= cap {
            self.max_retry_delay
        } else {
            Duration::from_secs_f64(scaled)
        }
    }
}

fn invalid(option: &'static str, reason: String) -> ConfigError {
    ConfigError::InvalidOption { option, reason }
}

/// Default destination and tags applied to every write.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteDefaults {
    /// Bucket used when a write names none.
    pub bucket: Option<String>,
    /// Organization used when a write names none.
    pub organization: Option<String>,
    /// Tags added to every point and entity; the item's own tags win.
    pub default_tags: BTreeMap<String, String>,
}

impl WriteDefaults {
    /// Sets the default bucket.
    #[must_use]
    pub fn with_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = Some(bucket.into());
        self
    }

    /// Sets the default organization.
    #[must_use]
    pub fn with_organization(mut self, organization: impl Into<String>) -> Self {
        self.organization = Some(organization.into());
        self
    }

    /// Adds a default tag.
    #[must_use]
    pub fn with_default_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_tags.insert(key.into(), value.into());
        self
    }

    /// Resolves the destination of a write, falling back to the defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingBucket`] or
    /// [`ConfigError::MissingOrganization`] when neither the call nor the
    /// defaults provide a non-blank value.
    pub fn resolve(
        &self,
        bucket: Option<&str>,
        organization: Option<&str>,
        precision: WritePrecision,
    ) -> Result<WriteTarget> {
        let bucket = bucket
            .or(self.bucket.as_deref())
            .ok_or(ConfigError::MissingBucket)?;
        let organization = organization
            .or(self.organization.as_deref())
            .ok_or(ConfigError::MissingOrganization)?;

        Ok(WriteTarget::new(bucket, organization, precision)?)
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
