//! Normalization of caller-supplied records into [`Entity`] values.
//!
//! Each supported record shape has a converter. The shared rules live in the
//! provided methods of [`EntityConverter`]; a converter only says how to read
//! the fields of its shape.

mod hashtable;
mod object;
mod registry;
mod sorted_list;

use chrono::DateTime;
use errors::ErrorMetadata;

pub use self::{
    hashtable::HashtableEntityConverter,
    object::ObjectEntityConverter,
    registry::ConverterRegistry,
    sorted_list::SortedListEntityConverter,
};
use crate::{
    entity::{
        ETag,
        Entity,
        EntityValue,
        ETAG_FIELD,
        PARTITION_KEY,
        ROW_KEY,
        TIMESTAMP_FIELD,
    },
    record::{
        RawRecord,
        RawValue,
    },
};

pub trait EntityConverter: Send + Sync {
    /// Name of the record shape this converter handles.
    fn type_name(&self) -> &'static str;

    /// Returns the record's fields in iteration order, or `None` if the record
    /// has a different shape.
    fn fields<'a>(&self, record: &'a RawRecord) -> Option<Vec<(&'a str, &'a RawValue)>>;

    fn can_convert(&self, record: &RawRecord) -> bool {
        self.fields(record).is_some()
    }

    /// True iff the record has this shape and carries non-empty string
    /// `PartitionKey` and `RowKey` fields.
    fn validate(&self, record: &RawRecord) -> bool {
        self.fields(record).is_some_and(|fields| {
            has_identity_field(&fields, PARTITION_KEY) && has_identity_field(&fields, ROW_KEY)
        })
    }

    /// Fails with the names of the fields whose values don't map onto a store
    /// type. `ETag` and `Timestamp` are checked by [`EntityConverter::convert`]
    /// instead. A record of another shape has nothing to report.
    fn validate_field_types(&self, record: &RawRecord) -> Result<(), Vec<String>> {
        report_fields(self, record, |name, value| {
            name != ETAG_FIELD && name != TIMESTAMP_FIELD && !value.is_supported()
        })
    }

    /// Fails with the names of the fields whose values are null.
    fn validate_no_nulls(&self, record: &RawRecord) -> Result<(), Vec<String>> {
        report_fields(self, record, |_, value| value.is_null())
    }

    /// Builds an entity from the record.
    ///
    /// Null fields are dropped. Nested values are stored as their JSON text. A
    /// field named `ETag` must be a string and becomes the entity's version
    /// tag; a field named `Timestamp` must be a date-time (or an RFC 3339
    /// string) and becomes the entity's timestamp.
    fn convert(&self, record: &RawRecord) -> anyhow::Result<Entity> {
        let mut entity = Entity::default();
        for (name, value) in shape_fields(self, record)? {
            match (name, value) {
                (_, RawValue::Null) => (),
                (ETAG_FIELD, RawValue::Value(EntityValue::String(tag))) => {
                    entity.set_etag(Some(ETag::new(tag.clone())));
                },
                (ETAG_FIELD, other) => anyhow::bail!(ErrorMetadata::bad_request(
                    "ConversionError",
                    format!(
                        "{ETAG_FIELD} must be a string but has type {}",
                        other.type_name()
                    ),
                )),
                (TIMESTAMP_FIELD, other) => {
                    entity.set_timestamp(Some(timestamp_value(other)?));
                },
                (_, RawValue::Value(value)) => {
                    entity.insert(name, value.clone());
                },
                (_, nested) => {
                    entity.insert(name, nested.to_json().to_string());
                },
            }
        }
        Ok(entity)
    }
}

fn shape_fields<'a, C>(
    converter: &C,
    record: &'a RawRecord,
) -> anyhow::Result<Vec<(&'a str, &'a RawValue)>>
where
    C: EntityConverter + ?Sized,
{
    converter.fields(record).ok_or_else(|| {
        ErrorMetadata::bad_request(
            "ConversionError",
            format!(
                "The {} converter can't read a {} record",
                converter.type_name(),
                record.shape_name()
            ),
        )
        .into()
    })
}

fn report_fields<C>(
    converter: &C,
    record: &RawRecord,
    mut is_flagged: impl FnMut(&str, &RawValue) -> bool,
) -> Result<(), Vec<String>>
where
    C: EntityConverter + ?Sized,
{
    let flagged: Vec<_> = converter
        .fields(record)
        .unwrap_or_default()
        .into_iter()
        .filter(|(name, value)| is_flagged(*name, *value))
        .map(|(name, _)| name.to_string())
        .collect();
    if flagged.is_empty() {
        Ok(())
    } else {
        Err(flagged)
    }
}

fn has_identity_field(fields: &[(&str, &RawValue)], key: &str) -> bool {
    fields.iter().any(|(name, value)| {
        *name == key
            && matches!(value, RawValue::Value(EntityValue::String(s)) if !s.is_empty())
    })
}

fn timestamp_value(value: &RawValue) -> anyhow::Result<DateTime<chrono::FixedOffset>> {
    let parsed = match value {
        RawValue::Value(EntityValue::String(s)) => DateTime::parse_from_rfc3339(s).ok(),
        RawValue::Value(v) => v.as_date_time(),
        _ => None,
    };
    parsed.ok_or_else(|| {
        ErrorMetadata::bad_request(
            "ConversionError",
            format!(
                "{TIMESTAMP_FIELD} must be a date-time but has type {}",
                value.type_name()
            ),
        )
        .into()
    })
}
