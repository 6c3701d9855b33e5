use std::collections::{
    BTreeMap,
    HashMap,
};

use errors::ErrorMetadata;
use serde_json::{
    Map as JsonMap,
    Value as JsonValue,
};

use crate::entity::{
    Entity,
    EntityValue,
    ETAG_FIELD,
    ODATA_TYPE_SUFFIX,
    TIMESTAMP_FIELD,
};

/// A caller-supplied field value before normalization. Only
/// [`RawValue::Value`] maps onto a store type; nested values are accepted but
/// flagged.
#[derive(Clone, Debug, PartialEq)]
pub enum RawValue {
    Null,
    Value(EntityValue),
    List(Vec<RawValue>),
    Object(Vec<(String, RawValue)>),
}

impl RawValue {
    /// The type name reported in diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            RawValue::Null => "null",
            RawValue::Value(v) => v.type_name(),
            RawValue::List(_) => "list",
            RawValue::Object(_) => "object",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, RawValue::Null)
    }

    /// Whether the value maps onto a store type. `Null` counts as supported;
    /// it's reported separately.
    pub fn is_supported(&self) -> bool {
        matches!(self, RawValue::Null | RawValue::Value(_))
    }

    /// Reads an unannotated JSON value. Integers that fit in 32 bits become
    /// `Int32`, other integers `Int64`, and everything else numeric `Double`.
    pub fn from_json(value: JsonValue) -> Self {
        match value {
            JsonValue::Null => RawValue::Null,
            JsonValue::Bool(b) => RawValue::Value(EntityValue::Boolean(b)),
            JsonValue::Number(n) => {
                let value = match n.as_i64() {
                    Some(i) => match i32::try_from(i) {
                        Ok(i) => EntityValue::Int32(i),
                        Err(_) => EntityValue::Int64(i),
                    },
                    None => EntityValue::Double(n.as_f64().unwrap_or(f64::NAN)),
                };
                RawValue::Value(value)
            },
            JsonValue::String(s) => RawValue::Value(EntityValue::String(s)),
            JsonValue::Array(items) => {
                RawValue::List(items.into_iter().map(RawValue::from_json).collect())
            },
            JsonValue::Object(map) => RawValue::Object(
                map.into_iter()
                    .map(|(k, v)| (k, RawValue::from_json(v)))
                    .collect(),
            ),
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            RawValue::Null => JsonValue::Null,
            RawValue::Value(v) => v.to_json(),
            RawValue::List(items) => JsonValue::Array(items.iter().map(Self::to_json).collect()),
            RawValue::Object(props) => JsonValue::Object(
                props
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect::<JsonMap<_, _>>(),
            ),
        }
    }
}

macro_rules! impl_from_for_raw_value {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for RawValue {
                fn from(v: $ty) -> Self {
                    RawValue::Value(EntityValue::from(v))
                }
            }
        )*
    };
}

impl_from_for_raw_value!(
    EntityValue,
    Vec<u8>,
    bool,
    chrono::NaiveDateTime,
    chrono::DateTime<chrono::FixedOffset>,
    f64,
    uuid::Uuid,
    i32,
    i64,
    String,
    &str,
);

/// One named property of an object-shaped record.
#[derive(Clone, Debug, PartialEq)]
pub struct NamedProperty {
    pub name: String,
    pub value: RawValue,
}

/// A caller-supplied record in one of the accepted shapes.
#[derive(Clone, Debug, PartialEq)]
pub enum RawRecord {
    /// Unordered map. Field order follows the map's iteration order.
    Hashtable(HashMap<String, RawValue>),
    /// Generic object with ordered named properties.
    Object(Vec<NamedProperty>),
    /// Map whose iteration order is sorted by key.
    SortedList(BTreeMap<String, RawValue>),
}

impl RawRecord {
    /// Name of the record's shape, as reported for unsupported input.
    pub fn shape_name(&self) -> &'static str {
        match self {
            RawRecord::Hashtable(_) => "Hashtable",
            RawRecord::Object(_) => "Object",
            RawRecord::SortedList(_) => "SortedList",
        }
    }

    pub fn object<K, V>(props: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<RawValue>,
    {
        RawRecord::Object(
            props
                .into_iter()
                .map(|(name, value)| NamedProperty {
                    name: name.into(),
                    value: value.into(),
                })
                .collect(),
        )
    }

    /// Reads a JSON object as an object-shaped record. A property named
    /// `<field>@odata.type` gives the store type of `<field>`.
    pub fn from_json(value: JsonValue) -> anyhow::Result<Self> {
        let JsonValue::Object(map) = value else {
            anyhow::bail!(ErrorMetadata::bad_request(
                "InvalidRecord",
                format!("Expected a JSON object but found {value}"),
            ));
        };
        let mut annotations = HashMap::new();
        for (name, value) in &map {
            if let Some(field) = name.strip_suffix(ODATA_TYPE_SUFFIX) {
                let JsonValue::String(type_name) = value else {
                    anyhow::bail!(ErrorMetadata::bad_request(
                        "InvalidTypeAnnotation",
                        format!("The type annotation {name} must be a string"),
                    ));
                };
                annotations.insert(field.to_string(), type_name.clone());
            }
        }
        let mut props = Vec::with_capacity(map.len() - annotations.len());
        for (name, value) in map {
            if name.ends_with(ODATA_TYPE_SUFFIX) {
                continue;
            }
            let value = match annotations.remove(&name) {
                Some(type_name) if !value.is_null() => {
                    RawValue::Value(EntityValue::from_annotated_json(&type_name, &value)?)
                },
                _ => RawValue::from_json(value),
            };
            props.push(NamedProperty { name, value });
        }
        if let Some(field) = annotations.keys().next() {
            anyhow::bail!(ErrorMetadata::bad_request(
                "InvalidTypeAnnotation",
                format!("Found a type annotation for {field}, which has no value"),
            ));
        }
        Ok(RawRecord::Object(props))
    }

    /// Reads either a single JSON object or an array of them.
    pub fn list_from_json(value: JsonValue) -> anyhow::Result<Vec<Self>> {
        match value {
            JsonValue::Array(items) => items.into_iter().map(Self::from_json).collect(),
            other => Ok(vec![Self::from_json(other)?]),
        }
    }

    pub fn list_from_json_str(s: &str) -> anyhow::Result<Vec<Self>> {
        let value: JsonValue = serde_json::from_str(s).map_err(|e| {
            ErrorMetadata::bad_request("InvalidRecord", format!("Invalid JSON input: {e}"))
        })?;
        Self::list_from_json(value)
    }
}

/// Turns an entity back into an object-shaped record, in the same order as
/// [`Entity::to_json`]. The converters pick `ETag` and `Timestamp` up again.
impl From<Entity> for RawRecord {
    fn from(entity: Entity) -> Self {
        let etag = entity.etag().cloned();
        let timestamp = entity.timestamp();
        let mut props = Vec::with_capacity(entity.len() + 2);
        if let Some(etag) = etag {
            props.push(NamedProperty {
                name: ETAG_FIELD.to_string(),
                value: RawValue::from(etag.as_str()),
            });
        }
        props.extend(
            entity
                .into_fields()
                .into_iter()
                .map(|(name, value)| NamedProperty {
                    name,
                    value: RawValue::Value(value),
                }),
        );
        if let Some(timestamp) = timestamp {
            props.push(NamedProperty {
                name: TIMESTAMP_FIELD.to_string(),
                value: RawValue::from(timestamp),
            });
        }
        RawRecord::Object(props)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::entity::ETag;

    #[test]
    fn test_json_numbers_pick_the_narrowest_type() {
        assert_eq!(RawValue::from_json(json!(5)), RawValue::from(5));
        assert_eq!(
            RawValue::from_json(json!(1i64 << 40)),
            RawValue::from(1i64 << 40)
        );
        assert_eq!(RawValue::from_json(json!(1.5)), RawValue::from(1.5));
    }

    #[test]
    fn test_record_from_json_keeps_property_order() -> anyhow::Result<()> {
        let record = RawRecord::from_json(json!({
            "PartitionKey": "P1",
            "RowKey": "1",
            "Tags": ["a", "b"],
            "Owner": null,
        }))?;
        assert_eq!(
            record,
            RawRecord::object([
                ("PartitionKey", RawValue::from("P1")),
                ("RowKey", RawValue::from("1")),
                (
                    "Tags",
                    RawValue::List(vec![RawValue::from("a"), RawValue::from("b")])
                ),
                ("Owner", RawValue::Null),
            ])
        );
        Ok(())
    }

    #[test]
    fn test_record_from_json_applies_type_annotations() -> anyhow::Result<()> {
        let record = RawRecord::from_json(json!({
            "PartitionKey": "P1",
            "RowKey": "1",
            "Id@odata.type": "Edm.Guid",
            "Id": "67e55044-10b1-426f-9247-bb680e5fe0c8",
        }))?;
        let RawRecord::Object(props) = record else {
            panic!("expected an object record");
        };
        assert_eq!(props.len(), 3);
        assert_eq!(props[2].value.type_name(), "Edm.Guid");

        let err = RawRecord::from_json(json!({ "Id@odata.type": "Edm.Guid" })).unwrap_err();
        assert!(errors::ErrorMetadataAnyhowExt::is_bad_request(&err));
        Ok(())
    }

    #[test]
    fn test_entity_json_reads_back_unchanged() -> anyhow::Result<()> {
        let entity = Entity::new("P1", "1")
            .with_field("Big", 1i64 << 40)
            .with_field("Data", vec![1u8, 2, 3])
            .with_etag(ETag::new("W/\"3\""));
        let record = RawRecord::from_json(entity.to_json())?;
        assert_eq!(record, RawRecord::from(entity));
        Ok(())
    }

    #[test]
    fn test_edge_values_read_back_with_their_type() -> anyhow::Result<()> {
        let born = chrono::NaiveDate::from_ymd_opt(1990, 5, 1)
            .and_then(|d| d.and_hms_milli_opt(8, 30, 0, 250))
            .unwrap();
        let entity = Entity::new("P1", "1")
            .with_field("Ceiling", f64::INFINITY)
            .with_field("Floor", f64::NEG_INFINITY)
            .with_field("Born", born);
        let record = RawRecord::from_json(entity.to_json())?;
        assert_eq!(record, RawRecord::from(entity));

        let nan = Entity::new("P1", "1").with_field("Score", f64::NAN);
        let RawRecord::Object(props) = RawRecord::from_json(nan.to_json())? else {
            panic!("expected an object record");
        };
        let score = props.iter().find(|p| p.name == "Score").unwrap();
        assert!(matches!(&score.value, RawValue::Value(EntityValue::Double(v)) if v.is_nan()));
        Ok(())
    }

    #[test]
    fn test_list_from_json_accepts_single_objects_and_arrays() -> anyhow::Result<()> {
        assert_eq!(
            RawRecord::list_from_json_str(r#"{"PartitionKey": "P1"}"#)?.len(),
            1
        );
        assert_eq!(
            RawRecord::list_from_json_str(r#"[{"RowKey": "1"}, {"RowKey": "2"}]"#)?.len(),
            2
        );
        assert!(RawRecord::list_from_json_str("[1]").is_err());
        assert!(RawRecord::list_from_json_str("{").is_err());
        Ok(())
    }
}
