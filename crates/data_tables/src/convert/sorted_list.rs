use super::EntityConverter;
use crate::record::{
    RawRecord,
    RawValue,
};

/// Reads key-sorted map records. Fields come out in key order.
pub struct SortedListEntityConverter;

impl EntityConverter for SortedListEntityConverter {
    fn type_name(&self) -> &'static str {
        "SortedList"
    }

    fn fields<'a>(&self, record: &'a RawRecord) -> Option<Vec<(&'a str, &'a RawValue)>> {
        let RawRecord::SortedList(map) = record else {
            return None;
        };
        Some(map.iter().map(|(k, v)| (k.as_str(), v)).collect())
    }
}
