use std::{
    fmt,
    str::FromStr,
    sync::Arc,
};

use async_trait::async_trait;
use errors::ErrorMetadata;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use crate::{
    credentials::Credentials,
    entity::WireRow,
    operation::TransactionAction,
};

/// A validated table name: 3 to 63 ASCII letters and digits, starting with a
/// letter.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableName(String);

impl TableName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for TableName {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let valid = (3..=63).contains(&s.len())
            && s.starts_with(|c: char| c.is_ascii_alphabetic())
            && s.chars().all(|c| c.is_ascii_alphanumeric());
        if !valid {
            anyhow::bail!(ErrorMetadata::bad_request(
                "InvalidTableName",
                format!(
                    "Invalid table name {s:?}: table names have 3 to 63 letters and digits and \
                     start with a letter"
                ),
            ));
        }
        Ok(Self(s.to_string()))
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What to read from a table. `top` caps the number of rows the backend needs
/// to produce; it may return fewer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueryRequest {
    /// OData filter expression, see [`crate::query::Filter`].
    pub filter: Option<String>,
    /// Fields to return. `None` returns every field.
    pub select: Option<Vec<String>>,
    pub top: Option<usize>,
}

pub type RowStream = BoxStream<'static, anyhow::Result<WireRow>>;

/// The table store. Implementations classify failures by attaching
/// [`ErrorMetadata`]: OCC for a version mismatch, not found for a missing
/// table or row, conflict for an existing row, and unauthenticated for
/// rejected credentials.
#[async_trait]
pub trait TableBackend: Send + Sync {
    /// Succeeds if the table already exists.
    async fn create_table_if_not_exists(
        &self,
        table: &TableName,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()>;

    async fn delete_table(&self, table: &TableName, cancel: &CancellationToken)
        -> anyhow::Result<()>;

    async fn list_tables(
        &self,
        filter: Option<&str>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Vec<String>>;

    /// Applies all actions atomically. Every action shares one partition key
    /// and there are at most [`crate::batch::MAX_TRANSACTION_ACTIONS`] of
    /// them.
    async fn submit_transaction(
        &self,
        table: &TableName,
        actions: Vec<TransactionAction>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()>;

    async fn query(
        &self,
        table: &TableName,
        request: QueryRequest,
        cancel: &CancellationToken,
    ) -> anyhow::Result<RowStream>;
}

/// Turns credentials into a connected backend.
#[async_trait]
pub trait TableConnector: Send + Sync {
    async fn connect(
        &self,
        credentials: &Credentials,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Arc<dyn TableBackend>>;
}
