//! Line-protocol serialization.
//!
//! Wire format, one point per line:
//!
//! ```text
//! measurement[,tag_key=tag_value...] field_key=field_value[,...] [timestamp]
//! ```
//!
//! Measurement names, tag keys, tag values and field keys escape `,`, ` `
//! and `=` with a backslash, and write newlines, carriage returns and tabs
//! as `\n`, `\r` and `\t`. String field values are double-quoted with `"`
//! and `\` escaped. The timestamp is omitted when not supplied, in which
//! case the server assigns the ingestion time.
//!
//! Nothing here validates records beyond what is needed to produce a line;
//! malformed raw records are passed through and rejected by the server.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::entity::{self, ErasedEntity};
use crate::error::MappingError;
use crate::point::Point;
use crate::target::WritePrecision;

/// A typed field value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// 64-bit float, written in shortest round-trip form.
    Float(f64),
    /// Signed integer, written with an `i` suffix.
    Integer(i64),
    /// Unsigned integer, written with a `u` suffix.
    UInteger(u64),
    /// String, written double-quoted.
    String(String),
    /// Boolean, written as `true` / `false`.
    Boolean(bool),
}

impl FieldValue {
    /// Returns `false` for values that cannot be represented on the wire
    /// (non-finite floats).
    pub fn is_writable(&self) -> bool {
        match self {
            Self::Float(v) => v.is_finite(),
            _ => true,
        }
    }

    fn write_to(&self, out: &mut String) {
        // Writing into a String is infallible.
        let _ = match self {
            Self::Float(v) => write!(out, "{v}"),
            Self::Integer(v) => write!(out, "{v}i"),
            Self::UInteger(v) => write!(out, "{v}u"),
            Self::Boolean(v) => write!(out, "{v}"),
            Self::String(v) => {
                out.push('"');
                escape_string_field(v, out);
                out.push('"');
                Ok(())
            }
        };
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<f32> for FieldValue {
    fn from(value: f32) -> Self {
        Self::Float(f64::from(value))
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for FieldValue {
    fn from(value: i32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<u64> for FieldValue {
    fn from(value: u64) -> Self {
        Self::UInteger(value)
    }
}

impl From<u32> for FieldValue {
    fn from(value: u32) -> Self {
        Self::UInteger(u64::from(value))
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

/// Escapes a measurement name, tag key, tag value or field key.
///
/// Newlines, carriage returns and tabs are written as `\n`, `\r` and `\t`
/// so one item always renders as one line.
pub fn escape_key(value: &str, out: &mut String) {
    for c in value.chars() {
        match c {
            ',' | ' ' | '=' => {
                out.push('\\');
                out.push(c);
            }
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
}

/// Escapes the contents of a string field value (without the quotes).
pub fn escape_string_field(value: &str, out: &mut String) {
    for c in value.chars() {
        if matches!(c, '"' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
}

/// Renders one line from its parts.
///
/// Tags with an empty key or value are skipped; an empty tag value is a
/// distinct error case on the server and is never emitted. Fields that are
/// not writable are skipped. Returns `None` when no field remains.
pub fn render_line<'a, T, F>(
    measurement: &str,
    tags: T,
    fields: F,
    timestamp: Option<i64>,
) -> Option<String>
where
    T: IntoIterator<Item = (&'a str, &'a str)>,
    F: IntoIterator<Item = (&'a str, &'a FieldValue)>,
{
    let mut line = String::with_capacity(64);
    escape_key(measurement, &mut line);

    for (key, value) in tags {
        if key.is_empty() || value.is_empty() {
            continue;
        }
        line.push(',');
        escape_key(key, &mut line);
        line.push('=');
        escape_key(value, &mut line);
    }

    let mut has_fields = false;
    for (key, value) in fields {
        if key.is_empty() || !value.is_writable() {
            continue;
        }
        line.push(if has_fields { ',' } else { ' ' });
        escape_key(key, &mut line);
        line.push('=');
        value.write_to(&mut line);
        has_fields = true;
    }

    if !has_fields {
        return None;
    }

    if let Some(ts) = timestamp {
        let _ = write!(line, " {ts}");
    }

    Some(line)
}

/// One input item awaiting conversion.
pub enum PendingItem<'a> {
    /// A pre-formatted line-protocol record, passed through verbatim apart
    /// from trailing line breaks.
    Record(&'a str),
    /// A structured point.
    Point(&'a Point),
    /// An annotated entity, mapped through its cached schema metadata.
    Entity(&'a dyn ErasedEntity),
}

impl PendingItem<'_> {
    /// Converts the item into a line-protocol fragment.
    ///
    /// `precision` applies to entity timestamps; points carry their own.
    /// `default_tags` are merged into points and entities, never records.
    /// Returns `Ok(None)` when the item carries nothing writable.
    ///
    /// # Errors
    ///
    /// Returns [`MappingError`] if an entity's schema or timestamp is invalid.
    pub fn to_line_protocol(
        &self,
        precision: WritePrecision,
        default_tags: &BTreeMap<String, String>,
    ) -> Result<Option<String>, MappingError> {
        match self {
            Self::Record(record) => {
                if record.trim().is_empty() {
                    return Ok(None);
                }
                // Batches are joined with `\n`; a trailing line break would
                // leave an empty line in the payload.
                let record = record.trim_end_matches(['\n', '\r']);
                Ok(Some(record.to_string()))
            }
            Self::Point(point) => Ok(point.to_line_protocol(default_tags)),
            Self::Entity(entity) => entity::map_erased(*entity, precision, default_tags),
        }
    }
}

/// Converts items in order, skipping those with nothing writable.
///
/// Fails on the first mapping error, before any fragment leaves this call.
pub(crate) fn render_items<'a, I>(
    items: I,
    precision: WritePrecision,
    default_tags: &BTreeMap<String, String>,
) -> Result<Vec<String>, MappingError>
where
    I: IntoIterator<Item = PendingItem<'a>>,
{
    let mut fragments = Vec::new();
    for item in items {
        if let Some(fragment) = item.to_line_protocol(precision, default_tags)? {
            fragments.push(fragment);
        }
    }
    Ok(fragments)
}
