//! Entity and table operations against a key-attribute table store.
//!
//! Records come in as one of a few structural shapes ([`RawRecord`]), are
//! validated and converted into [`Entity`] values, then written in
//! transactions that each cover one partition. Reads go through
//! [`QueryOptions`], with sorting done on the client.

pub mod backend;
pub mod batch;
pub mod command;
pub mod convert;
pub mod credentials;
pub mod entity;
pub mod error;
pub mod identity;
pub mod knobs;
pub mod operation;
pub mod query;
pub mod record;
pub mod service;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

#[cfg(test)]
mod tests;

pub use self::{
    backend::{
        TableBackend,
        TableConnector,
        TableName,
    },
    credentials::{
        ConnectionContext,
        Credentials,
    },
    entity::{
        ETag,
        Entity,
        EntityValue,
    },
    error::{
        OperationErrorCode,
        TableError,
        ValidationWarning,
    },
    operation::OperationKind,
    query::QueryOptions,
    record::RawRecord,
    service::{
        TableService,
        WriteSummary,
    },
};
