//! An in-memory table store for tests. It applies transactions the way the
//! hosted service does: atomically, with version checks on conditional
//! actions, and it records every transaction it was asked to apply.

use std::{
    collections::BTreeMap,
    sync::Arc,
};

use async_trait::async_trait;
use chrono::Utc;
use cmd_util::env::config_test;
use errors::ErrorMetadata;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{
    backend::{
        QueryRequest,
        RowStream,
        TableBackend,
        TableConnector,
        TableName,
    },
    credentials::{
        ConnectionType,
        Credentials,
    },
    entity::{
        ETag,
        Entity,
        TIMESTAMP_FIELD,
    },
    identity::CredentialProvider,
    operation::{
        OperationKind,
        TransactionAction,
    },
    query::Filter,
};

type Rows = BTreeMap<(String, String), Entity>;

/// The field table listings are filtered on.
const TABLE_NAME_FIELD: &str = "TableName";

/// A transaction as submitted, and whether it was applied.
#[derive(Clone, Debug)]
pub struct RecordedTransaction {
    pub table: String,
    pub actions: Vec<TransactionAction>,
    pub committed: bool,
}

impl RecordedTransaction {
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn partition_key(&self) -> Option<&str> {
        self.actions.first().and_then(|action| action.partition_key())
    }

    pub fn kinds(&self) -> Vec<OperationKind> {
        self.actions.iter().map(|action| action.kind).collect()
    }
}

#[derive(Default)]
struct Inner {
    tables: BTreeMap<String, Rows>,
    next_etag: u64,
    transactions: Vec<RecordedTransaction>,
    connections: Vec<ConnectionType>,
    fail_transaction: Option<usize>,
    reject_connections: bool,
}

impl Inner {
    fn new_etag(&mut self) -> ETag {
        self.next_etag += 1;
        ETag::new(format!("W/\"{}\"", self.next_etag))
    }

    fn table_mut(&mut self, table: &TableName) -> anyhow::Result<&mut Rows> {
        self.tables
            .get_mut(table.as_str())
            .ok_or_else(|| table_not_found(table))
    }

    /// Stamps a row being written with a fresh version and timestamp.
    fn stamp(&mut self, mut entity: Entity) -> Entity {
        entity.set_etag(Some(self.new_etag()));
        entity.set_timestamp(Some(Utc::now().fixed_offset()));
        entity
    }

    fn apply(&mut self, table: &TableName, actions: &[TransactionAction]) -> anyhow::Result<()> {
        let mut staged = self.table_mut(table)?.clone();
        for action in actions {
            let Some((pk, rk)) = action.entity.identity() else {
                anyhow::bail!(ErrorMetadata::bad_request(
                    "InvalidInput",
                    "Every entity in a transaction needs a PartitionKey and a RowKey"
                ));
            };
            let key = (pk.to_string(), rk.to_string());
            let existing = staged.get(&key);
            if let (Some(if_match), Some(existing)) = (&action.if_match, existing) {
                if !if_match.is_any() && existing.etag() != Some(if_match) {
                    anyhow::bail!(ErrorMetadata::occ(Some(table.as_str())));
                }
            }
            let merged = |existing: Option<&Entity>| {
                let mut merged = existing.cloned().unwrap_or_default();
                for (name, value) in action.entity.fields() {
                    merged.insert(name, value.clone());
                }
                merged
            };
            let row = match action.kind {
                OperationKind::Add => {
                    if existing.is_some() {
                        anyhow::bail!(ErrorMetadata::conflict(
                            "EntityAlreadyExists",
                            format!("The entity ({pk}, {rk}) already exists in {table}")
                        ));
                    }
                    Some(action.entity.clone())
                },
                OperationKind::Delete | OperationKind::UpdateMerge | OperationKind::UpdateReplace
                    if existing.is_none() =>
                {
                    anyhow::bail!(ErrorMetadata::not_found(
                        "ResourceNotFound",
                        format!("The entity ({pk}, {rk}) does not exist in {table}")
                    ));
                },
                OperationKind::Delete => None,
                OperationKind::UpdateMerge | OperationKind::UpsertMerge => Some(merged(existing)),
                OperationKind::UpdateReplace | OperationKind::UpsertReplace => {
                    Some(action.entity.clone())
                },
            };
            match row {
                Some(row) => {
                    let row = self.stamp(row);
                    staged.insert(key, row);
                },
                None => {
                    staged.remove(&key);
                },
            }
        }
        *self.table_mut(table)? = staged;
        Ok(())
    }
}

fn table_not_found(table: &TableName) -> anyhow::Error {
    ErrorMetadata::not_found("TableNotFound", format!("The table {table} does not exist")).into()
}

fn passes(filter: Option<&Filter>, entity: &Entity) -> bool {
    match filter {
        Some(filter) => filter.matches(entity),
        None => true,
    }
}

fn check_canceled(cancel: &CancellationToken) -> anyhow::Result<()> {
    if cancel.is_cancelled() {
        anyhow::bail!(ErrorMetadata::canceled());
    }
    Ok(())
}

/// Keeps only the selected fields. The version tag is always returned, the
/// timestamp only when selected.
fn project(entity: &Entity, select: &[String]) -> Entity {
    let mut projected = Entity::default();
    for name in select {
        if let Some(value) = entity.get(name) {
            projected.insert(name.as_str(), value.clone());
        }
    }
    projected.set_etag(entity.etag().cloned());
    if select.iter().any(|name| name == TIMESTAMP_FIELD) {
        projected.set_timestamp(entity.timestamp());
    }
    projected
}

/// Both the connector and the backend. Clones share state, so a test can keep
/// a handle to inspect what a service did.
#[derive(Clone, Default)]
pub struct InMemoryTableStore {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryTableStore {
    pub fn new() -> Self {
        config_test();
        Self::default()
    }

    pub fn with_table(self, table: &str) -> Self {
        self.inner.lock().tables.entry(table.to_string()).or_default();
        self
    }

    /// Stores a row directly, bypassing transactions. Returns its version.
    pub fn insert(&self, table: &str, entity: Entity) -> anyhow::Result<ETag> {
        let mut inner = self.inner.lock();
        let Some((pk, rk)) = entity.identity() else {
            anyhow::bail!("Seeded entities need a PartitionKey and a RowKey");
        };
        let key = (pk.to_string(), rk.to_string());
        let entity = inner.stamp(entity);
        let etag = entity.etag().cloned();
        inner
            .tables
            .entry(table.to_string())
            .or_default()
            .insert(key, entity);
        etag.ok_or_else(|| anyhow::anyhow!("Stamped entity has no ETag"))
    }

    pub fn entity(&self, table: &str, partition_key: &str, row_key: &str) -> Option<Entity> {
        self.inner
            .lock()
            .tables
            .get(table)?
            .get(&(partition_key.to_string(), row_key.to_string()))
            .cloned()
    }

    /// Every row of `table` in key order.
    pub fn rows(&self, table: &str) -> Vec<Entity> {
        self.inner
            .lock()
            .tables
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_table(&self, table: &str) -> bool {
        self.inner.lock().tables.contains_key(table)
    }

    pub fn transactions(&self) -> Vec<RecordedTransaction> {
        self.inner.lock().transactions.clone()
    }

    /// Connection types of every successful connect, in order.
    pub fn connections(&self) -> Vec<ConnectionType> {
        self.inner.lock().connections.clone()
    }

    /// Makes the transaction with this zero-based index fail without being
    /// applied.
    pub fn fail_transaction(&self, index: usize) {
        self.inner.lock().fail_transaction = Some(index);
    }

    pub fn reject_connections(&self) {
        self.inner.lock().reject_connections = true;
    }
}

#[async_trait]
impl TableConnector for InMemoryTableStore {
    async fn connect(
        &self,
        credentials: &Credentials,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Arc<dyn TableBackend>> {
        check_canceled(cancel)?;
        let mut inner = self.inner.lock();
        if inner.reject_connections {
            anyhow::bail!(ErrorMetadata::unauthenticated(
                "AuthenticationFailed",
                "The table service rejected the credentials"
            ));
        }
        inner.connections.push(credentials.connection_type());
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait]
impl TableBackend for InMemoryTableStore {
    async fn create_table_if_not_exists(
        &self,
        table: &TableName,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        check_canceled(cancel)?;
        self.inner
            .lock()
            .tables
            .entry(table.to_string())
            .or_default();
        Ok(())
    }

    async fn delete_table(
        &self,
        table: &TableName,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        check_canceled(cancel)?;
        self.inner
            .lock()
            .tables
            .remove(table.as_str())
            .map(|_| ())
            .ok_or_else(|| table_not_found(table))
    }

    async fn list_tables(
        &self,
        filter: Option<&str>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Vec<String>> {
        check_canceled(cancel)?;
        let filter = filter.map(Filter::parse).transpose()?;
        let inner = self.inner.lock();
        Ok(inner
            .tables
            .keys()
            .filter(|name| {
                let entity = Entity::default().with_field(TABLE_NAME_FIELD, name.as_str());
                passes(filter.as_ref(), &entity)
            })
            .cloned()
            .collect())
    }

    async fn submit_transaction(
        &self,
        table: &TableName,
        actions: Vec<TransactionAction>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        check_canceled(cancel)?;
        let mut inner = self.inner.lock();
        let index = inner.transactions.len();
        let result = if inner.fail_transaction == Some(index) {
            Err(ErrorMetadata::overloaded(
                "InjectedFailure",
                format!("Transaction {index} was set up to fail"),
            )
            .into())
        } else {
            inner.apply(table, &actions)
        };
        inner.transactions.push(RecordedTransaction {
            table: table.to_string(),
            actions,
            committed: result.is_ok(),
        });
        result
    }

    async fn query(
        &self,
        table: &TableName,
        request: QueryRequest,
        cancel: &CancellationToken,
    ) -> anyhow::Result<RowStream> {
        check_canceled(cancel)?;
        let filter = request.filter.as_deref().map(Filter::parse).transpose()?;
        let inner = self.inner.lock();
        let rows = inner
            .tables
            .get(table.as_str())
            .ok_or_else(|| table_not_found(table))?;
        let rows: Vec<_> = rows
            .values()
            .filter(|entity| passes(filter.as_ref(), entity))
            .take(request.top.unwrap_or(usize::MAX))
            .map(|entity| match &request.select {
                Some(select) => project(entity, select),
                None => entity.clone(),
            })
            .map(|entity| anyhow::Ok(entity.into_wire_row()))
            .collect();
        Ok(futures::stream::iter(rows).boxed())
    }
}

/// A [`CredentialProvider`] that hands out a fixed token, or refuses to.
#[derive(Clone, Debug)]
pub struct StaticCredentialProvider {
    token: Option<String>,
}

impl StaticCredentialProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
        }
    }

    pub fn unavailable() -> Self {
        Self { token: None }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentialProvider {
    async fn managed_identity_token(
        &self,
        account_name: &str,
        _client_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<String> {
        check_canceled(cancel)?;
        self.token.clone().ok_or_else(|| {
            ErrorMetadata::unauthenticated(
                "ManagedIdentityUnavailable",
                format!("No managed identity can access {account_name}"),
            )
            .into()
        })
    }
}
