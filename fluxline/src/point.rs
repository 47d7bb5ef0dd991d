//! Structured data points.

use std::collections::BTreeMap;
use std::time::SystemTime;

use crate::line_protocol::{FieldValue, render_line};
use crate::target::WritePrecision;

/// A single measurement with tags, fields and an optional timestamp.
///
/// Tags and fields are kept sorted by key, so the rendered line is stable
/// regardless of insertion order.
///
/// # Example
///
/// ```rust
/// use fluxline::point::Point;
/// use fluxline::target::WritePrecision;
///
/// let point = Point::measurement("h2o_feet")
///     .tag("location", "west")
///     .field("water_level", 1)
///     .timestamp(1_700_000_000, WritePrecision::S);
///
/// assert_eq!(
///     point.to_line_protocol(&Default::default()).unwrap(),
///     "h2o_feet,location=west water_level=1i 1700000000",
/// );
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    measurement: String,
    tags: BTreeMap<String, String>,
    fields: BTreeMap<String, FieldValue>,
    timestamp: Option<i64>,
    precision: WritePrecision,
}

impl Point {
    /// Starts a point for the given measurement.
    pub fn measurement(name: impl Into<String>) -> Self {
        Self {
            measurement: name.into(),
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
            timestamp: None,
            precision: WritePrecision::default(),
        }
    }

    /// Adds or replaces a tag.
    #[must_use]
    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Adds or replaces a field.
    #[must_use]
    pub fn field(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Sets an explicit timestamp expressed in `precision`.
    #[must_use]
    pub fn timestamp(mut self, timestamp: i64, precision: WritePrecision) -> Self {
        self.timestamp = Some(timestamp);
        self.precision = precision;
        self
    }

    /// Sets the timestamp from a wall-clock instant, truncated to `precision`.
    #[must_use]
    pub fn time(self, time: SystemTime, precision: WritePrecision) -> Self {
        let timestamp = precision.timestamp_of(time);
        self.timestamp(timestamp, precision)
    }

    /// Returns the measurement name.
    pub fn name(&self) -> &str {
        &self.measurement
    }

    /// Returns the precision of the point's timestamp.
    pub fn precision(&self) -> WritePrecision {
        self.precision
    }

    /// Returns the explicit timestamp, if any.
    pub fn timestamp_value(&self) -> Option<i64> {
        self.timestamp
    }

    /// Returns `true` if the point has at least one writable field.
    pub fn has_fields(&self) -> bool {
        self.fields.values().any(FieldValue::is_writable)
    }

    /// Renders the point as a line-protocol fragment.
    ///
    /// `default_tags` are added for keys the point does not set itself.
    /// Returns `None` for a point without writable fields or with a blank
    /// measurement name.
    pub fn to_line_protocol(&self, default_tags: &BTreeMap<String, String>) -> Option<String> {
        if self.measurement.trim().is_empty() {
            return None;
        }
        let fields = self.fields.iter().map(|(k, v)| (k.as_str(), v));

        if default_tags.is_empty() {
            let tags = self.tags.iter().map(|(k, v)| (k.as_str(), v.as_str()));
            return render_line(&self.measurement, tags, fields, self.timestamp);
        }

        let mut merged: BTreeMap<&str, &str> = default_tags
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        for (key, value) in &self.tags {
            merged.insert(key, value);
        }

        render_line(&self.measurement, merged, fields, self.timestamp)
    }
}

/// Groups points by precision, keeping first-seen order of precisions and
/// input order within each group.
pub(crate) fn group_by_precision<'a, I>(points: I) -> Vec<(WritePrecision, Vec<&'a Point>)>
where
    I: IntoIterator<Item = &'a Point>,
{
    let mut groups: Vec<(WritePrecision, Vec<&'a Point>)> = Vec::new();
    for point in points {
        match groups.iter_mut().find(|(precision, _)| *precision == point.precision) {
            Some((_, group)) => group.push(point),
            None => groups.push((point.precision, vec![point])),
        }
    }
    groups
}
