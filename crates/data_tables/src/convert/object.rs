use indexmap::IndexMap;

use super::EntityConverter;
use crate::record::{
    RawRecord,
    RawValue,
};

/// Reads generic objects, keeping the order their properties were declared
/// in. A repeated property name keeps its first position and its last value.
pub struct ObjectEntityConverter;

impl EntityConverter for ObjectEntityConverter {
    fn type_name(&self) -> &'static str {
        "Object"
    }

    fn fields<'a>(&self, record: &'a RawRecord) -> Option<Vec<(&'a str, &'a RawValue)>> {
        let RawRecord::Object(props) = record else {
            return None;
        };
        let mut fields = IndexMap::with_capacity(props.len());
        for prop in props {
            fields.insert(prop.name.as_str(), &prop.value);
        }
        Some(fields.into_iter().collect())
    }
}
