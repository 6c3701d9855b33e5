//! Splits pending actions into the transaction shape the store accepts and
//! submits them in order.

use errors::ErrorMetadata;
use indexmap::IndexMap;
use tokio_util::sync::CancellationToken;

use crate::{
    backend::{
        TableBackend,
        TableName,
    },
    operation::TransactionAction,
};

/// The store rejects transactions with more actions than this.
pub const MAX_TRANSACTION_ACTIONS: usize = 100;

/// Actions that share one partition key, submitted as a single atomic
/// transaction.
#[derive(Clone, Debug, PartialEq)]
pub struct TransactionBatch {
    partition_key: String,
    actions: Vec<TransactionAction>,
}

impl TransactionBatch {
    pub fn partition_key(&self) -> &str {
        &self.partition_key
    }

    pub fn actions(&self) -> &[TransactionAction] {
        &self.actions
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn into_actions(self) -> Vec<TransactionAction> {
        self.actions
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub actions: usize,
    pub transactions: usize,
}

/// Groups actions by partition key and slices every group into chunks of at
/// most [`MAX_TRANSACTION_ACTIONS`]. Groups come out in order of first
/// appearance and actions keep their relative order.
pub fn partition_into_batches(
    actions: Vec<TransactionAction>,
) -> anyhow::Result<Vec<TransactionBatch>> {
    let mut groups: IndexMap<String, Vec<TransactionAction>> = IndexMap::new();
    for (index, action) in actions.into_iter().enumerate() {
        let Some((partition_key, _)) = action.entity.identity() else {
            anyhow::bail!(ErrorMetadata::bad_request(
                "MissingIdentityField",
                format!(
                    "The {} action at index {index} is missing its PartitionKey or RowKey",
                    action.kind
                ),
            ));
        };
        groups
            .entry(partition_key.to_string())
            .or_default()
            .push(action);
    }
    let mut batches = Vec::new();
    for (partition_key, group) in groups {
        let mut group = group.into_iter().peekable();
        while group.peek().is_some() {
            batches.push(TransactionBatch {
                partition_key: partition_key.clone(),
                actions: group.by_ref().take(MAX_TRANSACTION_ACTIONS).collect(),
            });
        }
    }
    Ok(batches)
}

/// Submits actions to one table, one transaction per batch.
///
/// Transactions are submitted sequentially and submission stops at the first
/// failure. Transactions that were already committed stay committed.
pub struct TransactionBatcher<'a> {
    backend: &'a dyn TableBackend,
    table: &'a TableName,
    cancel: &'a CancellationToken,
}

impl<'a> TransactionBatcher<'a> {
    pub fn new(
        backend: &'a dyn TableBackend,
        table: &'a TableName,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            backend,
            table,
            cancel,
        }
    }

    pub async fn submit(&self, actions: Vec<TransactionAction>) -> anyhow::Result<BatchSummary> {
        let batches = partition_into_batches(actions)?;
        let total = batches.len();
        let mut summary = BatchSummary::default();
        for (i, batch) in batches.into_iter().enumerate() {
            if self.cancel.is_cancelled() {
                anyhow::bail!(ErrorMetadata::canceled());
            }
            let partition_key = batch.partition_key;
            let len = batch.actions.len();
            tracing::debug!(
                "Submitting transaction {}/{total} to {} ({len} actions in partition \
                 {partition_key})",
                i + 1,
                self.table,
            );
            self.backend
                .submit_transaction(self.table, batch.actions, self.cancel)
                .await
                .inspect_err(|_| {
                    if summary.transactions > 0 {
                        tracing::warn!(
                            "Transaction {}/{total} failed after {} actions in {} transactions \
                             were committed",
                            i + 1,
                            summary.actions,
                            summary.transactions,
                        );
                    }
                })?;
            summary.actions += len;
            summary.transactions += 1;
        }
        Ok(summary)
    }
}
