use std::{
    borrow::Cow,
    fmt,
    str::FromStr,
};

use anyhow::Context;
use chrono::{
    DateTime,
    FixedOffset,
    NaiveDateTime,
    SecondsFormat,
};
use errors::ErrorMetadata;
use indexmap::IndexMap;
use serde_json::{
    Map as JsonMap,
    Value as JsonValue,
};
use uuid::Uuid;

pub const PARTITION_KEY: &str = "PartitionKey";
pub const ROW_KEY: &str = "RowKey";
pub const ETAG_FIELD: &str = "ETag";
pub const TIMESTAMP_FIELD: &str = "Timestamp";
/// Name under which the table service reports an entity's version on rows it
/// returns.
pub const ODATA_ETAG: &str = "odata.etag";
/// Suffix of the JSON property carrying the type annotation of another
/// property, eg `"Born@odata.type": "Edm.DateTime"`.
pub const ODATA_TYPE_SUFFIX: &str = "@odata.type";

/// JSON form of a date-time without an offset.
const NAIVE_DATE_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// The store types a field value may have. Anything else a caller passes in is
/// flagged as unsupported.
pub const SUPPORTED_FIELD_TYPES: &[&str] = &[
    "Edm.Binary",
    "Edm.Boolean",
    "Edm.DateTime",
    "Edm.Double",
    "Edm.Guid",
    "Edm.Int32",
    "Edm.Int64",
    "Edm.String",
];

/// A scalar value that can be stored in an entity field.
#[derive(Clone, Debug, PartialEq)]
pub enum EntityValue {
    Binary(Vec<u8>),
    Boolean(bool),
    /// Date-time without an offset. Stored by the service as UTC.
    DateTime(NaiveDateTime),
    DateTimeOffset(DateTime<FixedOffset>),
    Double(f64),
    Guid(Uuid),
    Int32(i32),
    Int64(i64),
    String(String),
}

impl EntityValue {
    /// Returns the store type name of this value.
    pub fn type_name(&self) -> &'static str {
        match self {
            EntityValue::Binary(_) => "Edm.Binary",
            EntityValue::Boolean(_) => "Edm.Boolean",
            EntityValue::DateTime(_) | EntityValue::DateTimeOffset(_) => "Edm.DateTime",
            EntityValue::Double(_) => "Edm.Double",
            EntityValue::Guid(_) => "Edm.Guid",
            EntityValue::Int32(_) => "Edm.Int32",
            EntityValue::Int64(_) => "Edm.Int64",
            EntityValue::String(_) => "Edm.String",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            EntityValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the value as an instant with an offset, treating values without
    /// an offset as UTC.
    pub fn as_date_time(&self) -> Option<DateTime<FixedOffset>> {
        match self {
            EntityValue::DateTime(v) => Some(v.and_utc().fixed_offset()),
            EntityValue::DateTimeOffset(v) => Some(*v),
            _ => None,
        }
    }

    /// Whether the JSON form of this value needs an `@odata.type` annotation
    /// to be read back with the same type.
    fn needs_type_annotation(&self) -> bool {
        match self {
            EntityValue::Binary(_)
            | EntityValue::DateTime(_)
            | EntityValue::DateTimeOffset(_)
            | EntityValue::Guid(_)
            | EntityValue::Int64(_) => true,
            EntityValue::Double(v) => !v.is_finite(),
            EntityValue::Boolean(_) | EntityValue::Int32(_) | EntityValue::String(_) => false,
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            EntityValue::Binary(v) => JsonValue::String(base64::encode(v)),
            EntityValue::Boolean(v) => JsonValue::Bool(*v),
            EntityValue::DateTime(v) => {
                JsonValue::String(v.format(NAIVE_DATE_TIME_FORMAT).to_string())
            },
            EntityValue::DateTimeOffset(v) => {
                JsonValue::String(v.to_rfc3339_opts(SecondsFormat::AutoSi, true))
            },
            // JSON has no NaN or infinities, so those travel as annotated
            // strings.
            EntityValue::Double(v) if !v.is_finite() => JsonValue::String(v.to_string()),
            EntityValue::Double(v) => JsonValue::from(*v),
            EntityValue::Guid(v) => JsonValue::String(v.to_string()),
            EntityValue::Int32(v) => JsonValue::from(*v),
            // Int64 travels as a string so it survives JSON readers that only
            // have doubles.
            EntityValue::Int64(v) => JsonValue::String(v.to_string()),
            EntityValue::String(v) => JsonValue::String(v.clone()),
        }
    }

    /// Reads a JSON value that was annotated with the store type
    /// `type_name`.
    pub fn from_annotated_json(type_name: &str, value: &JsonValue) -> anyhow::Result<Self> {
        let invalid = || {
            ErrorMetadata::bad_request(
                "InvalidTypedValue",
                format!("The value {value} is not a valid {type_name}"),
            )
        };
        Ok(match (type_name, value) {
            ("Edm.Binary", JsonValue::String(s)) => {
                EntityValue::Binary(base64::decode(s).context(invalid())?)
            },
            ("Edm.Boolean", JsonValue::Bool(b)) => EntityValue::Boolean(*b),
            ("Edm.DateTime", JsonValue::String(s)) => match DateTime::parse_from_rfc3339(s) {
                Ok(v) => EntityValue::DateTimeOffset(v),
                Err(_) => EntityValue::DateTime(
                    NaiveDateTime::parse_from_str(s, NAIVE_DATE_TIME_FORMAT).context(invalid())?,
                ),
            },
            ("Edm.Double", JsonValue::Number(n)) => {
                EntityValue::Double(n.as_f64().ok_or_else(invalid)?)
            },
            ("Edm.Double", JsonValue::String(s)) => {
                EntityValue::Double(f64::from_str(s).context(invalid())?)
            },
            ("Edm.Guid", JsonValue::String(s)) => {
                EntityValue::Guid(Uuid::parse_str(s).context(invalid())?)
            },
            ("Edm.Int32", JsonValue::Number(n)) => EntityValue::Int32(
                n.as_i64()
                    .and_then(|v| i32::try_from(v).ok())
                    .ok_or_else(invalid)?,
            ),
            ("Edm.Int64", JsonValue::Number(n)) => {
                EntityValue::Int64(n.as_i64().ok_or_else(invalid)?)
            },
            ("Edm.Int64", JsonValue::String(s)) => {
                EntityValue::Int64(i64::from_str(s).context(invalid())?)
            },
            ("Edm.String", JsonValue::String(s)) => EntityValue::String(s.clone()),
            _ if SUPPORTED_FIELD_TYPES.contains(&type_name) => anyhow::bail!(invalid()),
            _ => anyhow::bail!(ErrorMetadata::bad_request(
                "UnsupportedTypeAnnotation",
                format!(
                    "Unsupported type annotation {type_name}. Supported types are: {}",
                    SUPPORTED_FIELD_TYPES.join(", ")
                ),
            )),
        })
    }
}

impl fmt::Display for EntityValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_json() {
            JsonValue::String(s) => write!(f, "{s}"),
            other => write!(f, "{other}"),
        }
    }
}

macro_rules! impl_from_for_entity_value {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for EntityValue {
                fn from(v: $ty) -> Self {
                    EntityValue::$variant(v.into())
                }
            }
        )*
    };
}

impl_from_for_entity_value!(
    Vec<u8> => Binary,
    bool => Boolean,
    NaiveDateTime => DateTime,
    DateTime<FixedOffset> => DateTimeOffset,
    f64 => Double,
    Uuid => Guid,
    i32 => Int32,
    i64 => Int64,
    String => String,
    &str => String,
);

/// Opaque version token the service assigns to every stored entity.
#[derive(Clone, Debug, PartialEq, Eq, Hash, derive_more::Display)]
pub struct ETag(String);

impl ETag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    /// True for the wildcard tag `*`, which matches any stored version.
    pub fn is_any(&self) -> bool {
        self.0 == "*"
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A row as returned by a table backend. Carries the service's version token
/// under [`ODATA_ETAG`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WireRow(pub IndexMap<String, EntityValue>);

/// A normalized record: an ordered set of uniquely named fields plus the
/// reserved version and timestamp slots.
///
/// `PartitionKey` and `RowKey` are regular string fields. Rows coming back from
/// a projected query may lack them, so they are only enforced when an entity is
/// submitted.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Entity {
    fields: IndexMap<String, EntityValue>,
    etag: Option<ETag>,
    timestamp: Option<DateTime<FixedOffset>>,
}

impl Entity {
    pub fn new(partition_key: impl Into<String>, row_key: impl Into<String>) -> Self {
        let mut entity = Self::default();
        entity.insert(PARTITION_KEY, partition_key.into());
        entity.insert(ROW_KEY, row_key.into());
        entity
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<EntityValue>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn with_etag(mut self, etag: ETag) -> Self {
        self.etag = Some(etag);
        self
    }

    /// Sets a field, keeping its position if it already exists.
    pub fn insert(
        &mut self,
        name: impl Into<String>,
        value: impl Into<EntityValue>,
    ) -> Option<EntityValue> {
        self.fields.insert(name.into(), value.into())
    }

    pub fn remove(&mut self, name: &str) -> Option<EntityValue> {
        self.fields.shift_remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&EntityValue> {
        self.fields.get(name)
    }

    /// Like [`Entity::get`], but also resolves the reserved `Timestamp` and
    /// `ETag` slots so they can be sorted and filtered on.
    pub fn lookup(&self, name: &str) -> Option<Cow<'_, EntityValue>> {
        if let Some(value) = self.fields.get(name) {
            return Some(Cow::Borrowed(value));
        }
        match name {
            TIMESTAMP_FIELD => self
                .timestamp
                .map(|ts| Cow::Owned(EntityValue::DateTimeOffset(ts))),
            ETAG_FIELD => self
                .etag
                .as_ref()
                .map(|etag| Cow::Owned(EntityValue::String(etag.to_string()))),
            _ => None,
        }
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &EntityValue)> {
        self.fields.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn into_fields(self) -> IndexMap<String, EntityValue> {
        self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn partition_key(&self) -> Option<&str> {
        self.fields.get(PARTITION_KEY).and_then(EntityValue::as_str)
    }

    pub fn row_key(&self) -> Option<&str> {
        self.fields.get(ROW_KEY).and_then(EntityValue::as_str)
    }

    /// Returns `(PartitionKey, RowKey)` if both are set to non-empty strings.
    pub fn identity(&self) -> Option<(&str, &str)> {
        match (self.partition_key(), self.row_key()) {
            (Some(pk), Some(rk)) if !pk.is_empty() && !rk.is_empty() => Some((pk, rk)),
            _ => None,
        }
    }

    pub fn etag(&self) -> Option<&ETag> {
        self.etag.as_ref()
    }

    pub fn set_etag(&mut self, etag: Option<ETag>) {
        self.etag = etag;
    }

    pub fn timestamp(&self) -> Option<DateTime<FixedOffset>> {
        self.timestamp
    }

    pub fn set_timestamp(&mut self, timestamp: Option<DateTime<FixedOffset>>) {
        self.timestamp = timestamp;
    }

    /// Ingests a row returned by a backend, routing the version token and the
    /// server timestamp into their reserved slots.
    pub fn from_wire_row(row: WireRow) -> anyhow::Result<Self> {
        let mut entity = Self::default();
        for (name, value) in row.0 {
            match name.as_str() {
                ODATA_ETAG => {
                    let EntityValue::String(tag) = value else {
                        anyhow::bail!(
                            "The backend returned a non-string {ODATA_ETAG} ({})",
                            value.type_name()
                        );
                    };
                    entity.etag = Some(ETag(tag));
                },
                TIMESTAMP_FIELD => {
                    let timestamp = match &value {
                        EntityValue::String(s) => DateTime::parse_from_rfc3339(s)
                            .with_context(|| format!("Invalid {TIMESTAMP_FIELD} {s}"))?,
                        other => other.as_date_time().with_context(|| {
                            format!("Invalid {TIMESTAMP_FIELD} type {}", other.type_name())
                        })?,
                    };
                    entity.timestamp = Some(timestamp);
                },
                _ => {
                    entity.fields.insert(name, value);
                },
            }
        }
        Ok(entity)
    }

    /// The inverse of [`Entity::from_wire_row`]. The identity fields come
    /// first, then the timestamp, then the remaining fields in order.
    pub fn into_wire_row(self) -> WireRow {
        let mut row = IndexMap::with_capacity(self.fields.len() + 2);
        if let Some(etag) = self.etag {
            row.insert(ODATA_ETAG.to_string(), EntityValue::String(etag.0));
        }
        let mut fields = self.fields;
        for key in [PARTITION_KEY, ROW_KEY] {
            if let Some(value) = fields.shift_remove(key) {
                row.insert(key.to_string(), value);
            }
        }
        if let Some(timestamp) = self.timestamp {
            row.insert(
                TIMESTAMP_FIELD.to_string(),
                EntityValue::DateTimeOffset(timestamp),
            );
        }
        row.extend(fields);
        WireRow(row)
    }

    /// Renders the entity as a JSON object: `ETag` first, then the fields in
    /// order, then `Timestamp`. Values whose type JSON can't express carry an
    /// `@odata.type` annotation so [`crate::RawRecord::from_json`] reads them
    /// back unchanged.
    pub fn to_json(&self) -> JsonValue {
        let mut object = JsonMap::new();
        if let Some(etag) = &self.etag {
            object.insert(ETAG_FIELD.to_string(), JsonValue::String(etag.to_string()));
        }
        for (name, value) in &self.fields {
            object.insert(name.clone(), value.to_json());
            if value.needs_type_annotation() {
                object.insert(
                    format!("{name}{ODATA_TYPE_SUFFIX}"),
                    JsonValue::String(value.type_name().to_string()),
                );
            }
        }
        if let Some(timestamp) = self.timestamp {
            let value = EntityValue::DateTimeOffset(timestamp);
            object.insert(TIMESTAMP_FIELD.to_string(), value.to_json());
            object.insert(
                format!("{TIMESTAMP_FIELD}{ODATA_TYPE_SUFFIX}"),
                JsonValue::String(value.type_name().to_string()),
            );
        }
        JsonValue::Object(object)
    }
}
