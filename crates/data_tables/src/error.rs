use std::fmt;

use crate::operation::OperationKind;

/// Identifies the operation that failed. Stable, so callers can match on it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
pub enum OperationErrorCode {
    ConnectWithConnectionStringError,
    #[strum(to_string = "ConnectWithSASError")]
    ConnectWithSasError,
    ConnectWithStorageKeyError,
    ConnectWithTokenError,
    ConnectWithManagedIdentityError,
    CreateTableError,
    TableNameRequiredError,
    InvalidTableNameError,
    TableClientError,
    AddEntitiesError,
    RemoveEntitiesError,
    UpdateEntitiesError,
    GetEntitiesError,
    ClearTableError,
    DeleteTableError,
    GetTablesError,
}

#[derive(thiserror::Error, Debug)]
pub enum TableError {
    #[error("{code}: {source:#}")]
    Connection {
        code: OperationErrorCode,
        #[source]
        source: anyhow::Error,
    },
    #[error(
        "{code}: entity type {type_name} is not supported. Supported types are: {}",
        .supported.join(", ")
    )]
    UnsupportedEntityType {
        code: OperationErrorCode,
        type_name: &'static str,
        supported: Vec<&'static str>,
    },
    #[error(
        "{code}: the {type_name} record at index {index} is missing a PartitionKey or RowKey \
         with a non-empty string value"
    )]
    MissingIdentityField {
        code: OperationErrorCode,
        index: usize,
        type_name: &'static str,
    },
    #[error("{code}: {kind} is not a valid operation here")]
    InvalidOperationKind {
        kind: OperationKind,
        code: OperationErrorCode,
    },
    #[error("{code}: this operation needs a table name")]
    TableNameRequired { code: OperationErrorCode },
    #[error("{code}: {source:#}")]
    InvalidTableName {
        code: OperationErrorCode,
        #[source]
        source: anyhow::Error,
    },
    #[error("{code}: {source:#}")]
    Conversion {
        code: OperationErrorCode,
        #[source]
        source: anyhow::Error,
    },
    #[error("{code}: the entity was changed since it was read: {source:#}")]
    ConcurrencyConflict {
        code: OperationErrorCode,
        #[source]
        source: anyhow::Error,
    },
    #[error("{code}: {source:#}")]
    Backend {
        code: OperationErrorCode,
        #[source]
        source: anyhow::Error,
    },
    #[error("{code}: the operation was canceled")]
    Canceled { code: OperationErrorCode },
}

impl TableError {
    /// The code of the operation that failed. Validation failures report the
    /// operation they were validating for.
    pub fn code(&self) -> OperationErrorCode {
        match self {
            TableError::Connection { code, .. }
            | TableError::UnsupportedEntityType { code, .. }
            | TableError::MissingIdentityField { code, .. }
            | TableError::InvalidOperationKind { code, .. }
            | TableError::TableNameRequired { code }
            | TableError::InvalidTableName { code, .. }
            | TableError::Conversion { code, .. }
            | TableError::ConcurrencyConflict { code, .. }
            | TableError::Backend { code, .. }
            | TableError::Canceled { code } => *code,
        }
    }

    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(self, TableError::ConcurrencyConflict { .. })
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, TableError::Canceled { .. })
    }
}

/// A problem with a record that doesn't stop the operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ValidationWarning {
    UnsupportedFieldTypes {
        record_index: usize,
        fields: Vec<String>,
    },
    NullFieldValues {
        record_index: usize,
        fields: Vec<String>,
    },
}

impl fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationWarning::UnsupportedFieldTypes {
                record_index,
                fields,
            } => write!(
                f,
                "Record {record_index} has fields of unsupported types, which are stored as \
                 their JSON text: {}",
                fields.join(", ")
            ),
            ValidationWarning::NullFieldValues {
                record_index,
                fields,
            } => write!(
                f,
                "Record {record_index} has null fields, which are not stored: {}",
                fields.join(", ")
            ),
        }
    }
}
