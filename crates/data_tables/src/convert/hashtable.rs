use super::EntityConverter;
use crate::record::{
    RawRecord,
    RawValue,
};

/// Reads unordered map records.
pub struct HashtableEntityConverter;

impl EntityConverter for HashtableEntityConverter {
    fn type_name(&self) -> &'static str {
        "Hashtable"
    }

    fn fields<'a>(&self, record: &'a RawRecord) -> Option<Vec<(&'a str, &'a RawValue)>> {
        let RawRecord::Hashtable(map) = record else {
            return None;
        };
        Some(map.iter().map(|(k, v)| (k.as_str(), v)).collect())
    }
}
