//! Entity mapping: annotated Rust types to line protocol.
//!
//! A type opts in by implementing [`Entity`]: a static [`EntitySchema`]
//! declares the measurement name and, in order, which properties are tags,
//! fields or the timestamp, and [`Entity::value`] reads a property from an
//! instance.
//!
//! The schema is resolved into [`TypeMetadata`] once per type and kept in a
//! process-wide registry keyed by [`TypeId`]. Entries are never evicted: the
//! shape of a type does not change during the lifetime of the process, and
//! the registry is bounded by the number of entity types in use.
//!
//! # Example
//!
//! ```rust
//! use std::time::{Duration, SystemTime, UNIX_EPOCH};
//! use fluxline::entity::{self, Column, Entity, EntitySchema, Value};
//! use fluxline::target::WritePrecision;
//!
//! struct H2o {
//!     location: String,
//!     level: Option<f64>,
//!     time: SystemTime,
//! }
//!
//! impl Entity for H2o {
//!     fn schema() -> EntitySchema {
//!         EntitySchema::new("h2o")
//!             .column(Column::tag("location"))
//!             .column(Column::field("level"))
//!             .column(Column::timestamp("time"))
//!     }
//!
//!     fn value(&self, property: &str) -> Value<'_> {
//!         match property {
//!             "location" => self.location.as_str().into(),
//!             "level" => self.level.into(),
//!             "time" => self.time.into(),
//!             _ => Value::Null,
//!         }
//!     }
//! }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let h2o = H2o {
//!     location: "coyote_creek".to_string(),
//!     level: Some(2.927),
//!     time: UNIX_EPOCH + Duration::from_secs(10),
//! };
//! let line = entity::to_line_protocol(&h2o, WritePrecision::S, &Default::default())?;
//! assert_eq!(line.as_deref(), Some("h2o,location=coyote_creek level=2.927 10"));
//! # Ok(())
//! # }
//! ```

use std::any::{TypeId, type_name};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use std::time::SystemTime;

use crate::error::MappingError;
use crate::line_protocol::{FieldValue, render_line};
use crate::target::WritePrecision;

/// Role of a property in the rendered line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnKind {
    /// Indexed string tag.
    Tag,
    /// Field value.
    Field,
    /// The point's timestamp.
    Timestamp,
}

/// Declaration of one property of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    property: &'static str,
    kind: ColumnKind,
    name: Option<&'static str>,
}

impl Column {
    /// Declares `property` as a tag.
    pub const fn tag(property: &'static str) -> Self {
        Self {
            property,
            kind: ColumnKind::Tag,
            name: None,
        }
    }

    /// Declares `property` as a field.
    pub const fn field(property: &'static str) -> Self {
        Self {
            property,
            kind: ColumnKind::Field,
            name: None,
        }
    }

    /// Declares `property` as the timestamp.
    pub const fn timestamp(property: &'static str) -> Self {
        Self {
            property,
            kind: ColumnKind::Timestamp,
            name: None,
        }
    }

    /// Overrides the column name written on the wire.
    #[must_use]
    pub const fn named(mut self, name: &'static str) -> Self {
        self.name = Some(name);
        self
    }
}

/// Static description of an entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntitySchema {
    measurement: &'static str,
    columns: Vec<Column>,
}

impl EntitySchema {
    /// Starts a schema for the given measurement name.
    pub fn new(measurement: &'static str) -> Self {
        Self {
            measurement,
            columns: Vec::new(),
        }
    }

    /// Appends a column declaration; declaration order is preserved.
    #[must_use]
    pub fn column(mut self, column: Column) -> Self {
        self.columns.push(column);
        self
    }
}

/// A property value read from an entity instance.
#[derive(Debug, Clone, PartialEq)]
pub enum Value<'a> {
    /// Absent value; omitted from the line.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Unsigned integer.
    UInt(u64),
    /// Float.
    Float(f64),
    /// Borrowed string.
    Str(&'a str),
    /// Wall-clock instant.
    Time(SystemTime),
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident as $conv:ty),* $(,)?) => {
        $(
            impl From<$ty> for Value<'_> {
                fn from(value: $ty) -> Self {
                    Self::$variant(<$conv>::from(value))
                }
            }
        )*
    };
}

value_from! {
    bool => Bool as bool,
    i64 => Int as i64,
    i32 => Int as i64,
    u64 => UInt as u64,
    u32 => UInt as u64,
    f64 => Float as f64,
    f32 => Float as f64,
    SystemTime => Time as SystemTime,
}

impl<'a> From<&'a str> for Value<'a> {
    fn from(value: &'a str) -> Self {
        Self::Str(value)
    }
}

impl<'a> From<&'a String> for Value<'a> {
    fn from(value: &'a String) -> Self {
        Self::Str(value.as_str())
    }
}

impl<'a, T: Into<Value<'a>>> From<Option<T>> for Value<'a> {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

/// A type that can be written as a line-protocol point.
pub trait Entity: 'static {
    /// Returns the static schema of the type.
    ///
    /// Called once per type; a valid result is cached for the lifetime of
    /// the process. Must not map entities itself.
    fn schema() -> EntitySchema;

    /// Reads a declared property from this instance.
    fn value(&self, property: &str) -> Value<'_>;
}

/// Resolved metadata for one property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMetadata {
    /// Property identity, as passed to [`Entity::value`].
    pub property: &'static str,
    /// Role of the property.
    pub kind: ColumnKind,
    /// Name written on the wire.
    pub column_name: &'static str,
}

/// Cached per-type mapping metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeMetadata {
    /// Measurement name.
    pub measurement: &'static str,
    /// Columns in declaration order.
    pub columns: Vec<ColumnMetadata>,
}

impl TypeMetadata {
    fn resolve(schema: EntitySchema, type_name: &'static str) -> Result<Self, MappingError> {
        if schema.measurement.trim().is_empty() {
            return Err(MappingError::EmptyMeasurement { type_name });
        }

        let mut timestamp: Option<&'static str> = None;
        let mut columns = Vec::with_capacity(schema.columns.len());

        for column in schema.columns {
            if column.kind == ColumnKind::Timestamp {
                if let Some(first) = timestamp {
                    return Err(MappingError::MultipleTimestamps {
                        measurement: schema.measurement.to_string(),
                        first,
                        second: column.property,
                    });
                }
                timestamp = Some(column.property);
            }

            let column_name = match column.name {
                Some(name) if !name.is_empty() => name,
                _ => column.property,
            };

            columns.push(ColumnMetadata {
                property: column.property,
                kind: column.kind,
                column_name,
            });
        }

        Ok(Self {
            measurement: schema.measurement,
            columns,
        })
    }
}

type Registry = RwLock<HashMap<TypeId, Arc<TypeMetadata>>>;

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Returns the cached metadata for `E`, resolving it on first use.
///
/// # Errors
///
/// Returns [`MappingError`] if the schema of `E` is invalid. Invalid schemas
/// are not cached.
pub fn metadata<E: Entity>() -> Result<Arc<TypeMetadata>, MappingError> {
    let key = TypeId::of::<E>();

    if let Some(found) = registry()
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&key)
    {
        return Ok(Arc::clone(found));
    }

    // Resolve under the write lock so a type's schema is read exactly once.
    let mut entries = registry().write().unwrap_or_else(PoisonError::into_inner);
    if let Some(found) = entries.get(&key) {
        return Ok(Arc::clone(found));
    }

    let resolved = Arc::new(TypeMetadata::resolve(E::schema(), type_name::<E>())?);
    entries.insert(key, Arc::clone(&resolved));
    Ok(resolved)
}

/// Object-safe view of an [`Entity`], used by the pipeline to mix entity
/// types behind one item type.
pub trait ErasedEntity {
    /// Returns the cached metadata of the concrete type.
    ///
    /// # Errors
    ///
    /// Returns [`MappingError`] if the schema is invalid.
    fn erased_metadata(&self) -> Result<Arc<TypeMetadata>, MappingError>;

    /// Reads a property from the instance.
    fn erased_value(&self, property: &str) -> Value<'_>;
}

impl<E: Entity> ErasedEntity for E {
    fn erased_metadata(&self) -> Result<Arc<TypeMetadata>, MappingError> {
        metadata::<E>()
    }

    fn erased_value(&self, property: &str) -> Value<'_> {
        self.value(property)
    }
}

/// Maps an entity to a line-protocol fragment.
///
/// Returns `Ok(None)` when no field carries a value.
///
/// # Errors
///
/// Returns [`MappingError`] if the schema is invalid or the timestamp
/// property does not hold an instant.
pub fn to_line_protocol<E: Entity>(
    entity: &E,
    precision: WritePrecision,
    default_tags: &BTreeMap<String, String>,
) -> Result<Option<String>, MappingError> {
    map_erased(entity, precision, default_tags)
}

pub(crate) fn map_erased(
    entity: &dyn ErasedEntity,
    precision: WritePrecision,
    default_tags: &BTreeMap<String, String>,
) -> Result<Option<String>, MappingError> {
    let meta = entity.erased_metadata()?;

    let mut tags: BTreeMap<&str, String> = default_tags
        .iter()
        .map(|(k, v)| (k.as_str(), v.clone()))
        .collect();
    let mut fields: Vec<(&str, FieldValue)> = Vec::new();
    let mut timestamp = None;

    for column in &meta.columns {
        let value = entity.erased_value(column.property);

        match column.kind {
            ColumnKind::Tag => {
                if let Some(text) = tag_text(&value, precision) {
                    tags.insert(column.column_name, text);
                }
            }
            ColumnKind::Field => {
                if let Some(field) = field_value(value, precision) {
                    fields.push((column.column_name, field));
                }
            }
            ColumnKind::Timestamp => {
                timestamp = timestamp_value(&value, precision).map_err(|reason| {
                    MappingError::InvalidTimestamp {
                        measurement: meta.measurement.to_string(),
                        property: column.property,
                        reason,
                    }
                })?;
            }
        }
    }

    Ok(render_line(
        meta.measurement,
        tags.iter().map(|(k, v)| (*k, v.as_str())),
        fields.iter().map(|(k, v)| (*k, v)),
        timestamp,
    ))
}

fn tag_text(value: &Value<'_>, precision: WritePrecision) -> Option<String> {
    let text = match value {
        Value::Null => return None,
        Value::Bool(v) => v.to_string(),
        Value::Int(v) => v.to_string(),
        Value::UInt(v) => v.to_string(),
        Value::Float(v) => v.to_string(),
        Value::Str(v) => (*v).to_string(),
        Value::Time(t) => precision.timestamp_of(*t).to_string(),
    };
    (!text.is_empty()).then_some(text)
}

fn field_value(value: Value<'_>, precision: WritePrecision) -> Option<FieldValue> {
    match value {
        Value::Null => None,
        Value::Bool(v) => Some(FieldValue::Boolean(v)),
        Value::Int(v) => Some(FieldValue::Integer(v)),
        Value::UInt(v) => Some(FieldValue::UInteger(v)),
        Value::Float(v) => Some(FieldValue::Float(v)),
        Value::Str(v) => Some(FieldValue::String(v.to_string())),
        Value::Time(t) => Some(FieldValue::Integer(precision.timestamp_of(t))),
    }
}

fn timestamp_value(value: &Value<'_>, precision: WritePrecision) -> Result<Option<i64>, String> {
    match value {
        Value::Null => Ok(None),
        Value::Time(t) => Ok(Some(precision.timestamp_of(*t))),
        // Raw integers are taken as already expressed in the batch precision.
        Value::Int(v) => Ok(Some(*v)),
        Value::UInt(v) => i64::try_from(*v)
            .map(Some)
            .map_err(|_| format!("{v} does not fit in a signed 64-bit timestamp")),
        other => Err(format!("expected an instant, got {other:?}")),
    }
}
