//! Write destinations and timestamp precision.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Time unit in which a batch's timestamps are expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WritePrecision {
    /// Nanoseconds.
    #[default]
    Ns,
    /// Microseconds.
    Us,
    /// Milliseconds.
    Ms,
    /// Seconds.
    S,
}

impl WritePrecision {
    /// Returns the wire name used in the `precision` query parameter.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ns => "ns",
            Self::Us => "us",
            Self::Ms => "ms",
            Self::S => "s",
        }
    }

    fn nanos_per_unit(self) -> i128 {
        match self {
            Self::Ns => 1,
            Self::Us => 1_000,
            Self::Ms => 1_000_000,
            Self::S => 1_000_000_000,
        }
    }

    /// Converts a wall-clock instant to an integer timestamp in this unit.
    ///
    /// Sub-unit remainders are truncated toward negative infinity, so
    /// instants before the epoch stay ordered. Values outside the `i64`
    /// range saturate.
    pub fn timestamp_of(self, time: SystemTime) -> i64 {
        let nanos = match time.duration_since(UNIX_EPOCH) {
            Ok(elapsed) => i128::try_from(elapsed.as_nanos()).unwrap_or(i128::MAX),
            Err(before) => -i128::try_from(before.duration().as_nanos()).unwrap_or(i128::MAX),
        };
        let scaled = nanos.div_euclid(self.nanos_per_unit());
        i64::try_from(scaled).unwrap_or(if scaled < 0 { i64::MIN } else { i64::MAX })
    }
}

impl fmt::Display for WritePrecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WritePrecision {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ns" => Ok(Self::Ns),
            "us" => Ok(Self::Us),
            "ms" => Ok(Self::Ms),
            "s" => Ok(Self::S),
            other => Err(ConfigError::InvalidOption {
                option: "precision",
                reason: format!("unknown precision '{other}' (expected ns, us, ms or s)"),
            }),
        }
    }
}

/// Destination of a batch: bucket, organization and precision.
///
/// Fragments are grouped by target so that a single write call never mixes
/// destinations or precisions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WriteTarget {
    /// Destination bucket name.
    pub bucket: String,
    /// Destination organization name or ID.
    pub organization: String,
    /// Precision of the timestamps in the batch.
    pub precision: WritePrecision,
}

impl WriteTarget {
    /// Creates a target, rejecting blank bucket or organization names.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingBucket`] or
    /// [`ConfigError::MissingOrganization`] for blank names.
    pub fn new(
        bucket: impl Into<String>,
        organization: impl Into<String>,
        precision: WritePrecision,
    ) -> Result<Self, ConfigError> {
        let bucket = bucket.into();
        let organization = organization.into();

        if bucket.trim().is_empty() {
            return Err(ConfigError::MissingBucket);
        }
        if organization.trim().is_empty() {
            return Err(ConfigError::MissingOrganization);
        }

        Ok(Self {
            bucket,
            organization,
            precision,
        })
    }
}

impl fmt::Display for WriteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} ({})", self.organization, self.bucket, self.precision)
    }
}
