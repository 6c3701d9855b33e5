use super::{
    EntityConverter,
    HashtableEntityConverter,
    ObjectEntityConverter,
    SortedListEntityConverter,
};
use crate::record::RawRecord;

/// Ordered table of converters. The first converter that can read a record
/// handles it.
#[derive(Clone, Copy)]
pub struct ConverterRegistry {
    converters: &'static [&'static dyn EntityConverter],
}

impl ConverterRegistry {
    pub const BUILTIN: ConverterRegistry = ConverterRegistry {
        converters: &[
            &HashtableEntityConverter,
            &ObjectEntityConverter,
            &SortedListEntityConverter,
        ],
    };

    pub const fn new(converters: &'static [&'static dyn EntityConverter]) -> Self {
        Self { converters }
    }

    pub fn converter_for(&self, record: &RawRecord) -> Option<&'static dyn EntityConverter> {
        self.converters
            .iter()
            .find(|converter| converter.can_convert(record))
            .copied()
    }

    pub fn supported_type_names(&self) -> Vec<&'static str> {
        self.converters.iter().map(|c| c.type_name()).collect()
    }

    /// False when no converter claims the record.
    pub fn validate(&self, record: &RawRecord) -> bool {
        self.converter_for(record)
            .is_some_and(|converter| converter.validate(record))
    }
}

impl Default for ConverterRegistry {
    fn default() -> Self {
        Self::BUILTIN
    }
}

impl std::fmt::Debug for ConverterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.supported_type_names()).finish()
    }
}
