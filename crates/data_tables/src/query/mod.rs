mod filter;

use std::cmp::Ordering;

pub use self::filter::{
    CompareOp,
    Filter,
    Operand,
};
use crate::{
    backend::QueryRequest,
    entity::{
        Entity,
        EntityValue,
    },
};

/// Options for reading entities from a table.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueryOptions {
    pub filter: Option<String>,
    /// Fields to return. Empty returns every field.
    pub select: Vec<String>,
    /// Maximum number of entities to return, counted after `skip`.
    pub top: Option<usize>,
    pub skip: Option<usize>,
    /// Fields to sort by, most significant first. Sorting happens on the
    /// client, after reading every matching row.
    pub sort_by: Vec<String>,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn select<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.select = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn top(mut self, top: usize) -> Self {
        self.top = Some(top);
        self
    }

    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn sort_by<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sort_by = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn is_sorted(&self) -> bool {
        !self.sort_by.is_empty()
    }

    /// The request sent to the backend. Without sorting the backend only has to
    /// produce `skip + top` rows; sorting needs all of them.
    pub(crate) fn backend_request(&self) -> QueryRequest {
        let top = if self.is_sorted() {
            None
        } else {
            self.top
                .map(|top| top.saturating_add(self.skip.unwrap_or(0)))
        };
        QueryRequest {
            filter: self.filter.clone(),
            select: (!self.select.is_empty()).then(|| self.select.clone()),
            top,
        }
    }
}

/// Position of a value's type in the sort order used when values of
/// different types are compared. Numbers compare with each other by value,
/// and so do the two date-time types.
fn type_rank(value: &EntityValue) -> u8 {
    match value {
        EntityValue::Boolean(_) => 0,
        EntityValue::Int32(_) | EntityValue::Int64(_) | EntityValue::Double(_) => 1,
        EntityValue::DateTime(_) | EntityValue::DateTimeOffset(_) => 2,
        EntityValue::Guid(_) => 3,
        EntityValue::String(_) => 4,
        EntityValue::Binary(_) => 5,
    }
}

/// Orders two values of the same type family, or `None` if they belong to
/// different families.
pub(crate) fn compare_same_family(a: &EntityValue, b: &EntityValue) -> Option<Ordering> {
    use EntityValue::*;
    Some(match (a, b) {
        (Boolean(a), Boolean(b)) => a.cmp(b),
        (Int32(a), Int32(b)) => a.cmp(b),
        (Int64(a), Int64(b)) => a.cmp(b),
        (Int32(a), Int64(b)) => i64::from(*a).cmp(b),
        (Int64(a), Int32(b)) => a.cmp(&i64::from(*b)),
        (Double(a), Double(b)) => a.total_cmp(b),
        (Double(a), Int32(b)) => a.total_cmp(&f64::from(*b)),
        (Int32(a), Double(b)) => f64::from(*a).total_cmp(b),
        (Int64(a), Double(b)) => compare_int_double(*a, *b),
        (Double(a), Int64(b)) => compare_int_double(*b, *a).reverse(),
        (DateTime(_) | DateTimeOffset(_), DateTime(_) | DateTimeOffset(_)) => {
            a.as_date_time().cmp(&b.as_date_time())
        },
        (Guid(a), Guid(b)) => a.cmp(b),
        (String(a), String(b)) => a.cmp(b),
        (Binary(a), Binary(b)) => a.cmp(b),
        _ => return None,
    })
}

/// Exact comparison of an integer with a double. Converting the integer
/// rounds, so ties are settled on the integral value.
fn compare_int_double(a: i64, b: f64) -> Ordering {
    match (a as f64).total_cmp(&b) {
        Ordering::Equal => i128::from(a).cmp(&(b as i128)),
        other => other,
    }
}

/// Total order over optional field values: missing values first, then by type
/// rank, then by value. Strings compare ordinally.
pub fn compare_values(a: Option<&EntityValue>, b: Option<&EntityValue>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => compare_same_family(a, b)
            .unwrap_or_else(|| type_rank(a).cmp(&type_rank(b))),
    }
}

/// Stable sort by `sort_by`, the first field being the most significant.
/// Entities that compare equal keep their relative order.
pub fn sort_entities(entities: &mut [Entity], sort_by: &[String]) {
    entities.sort_by(|a, b| {
        sort_by
            .iter()
            .map(|field| compare_values(a.lookup(field).as_deref(), b.lookup(field).as_deref()))
            .find(|ordering| ordering.is_ne())
            .unwrap_or(Ordering::Equal)
    });
}
