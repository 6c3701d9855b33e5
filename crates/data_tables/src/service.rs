use std::sync::Arc;

use errors::ErrorMetadataAnyhowExt;
use futures::TryStreamExt;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    backend::{
        RowStream,
        TableBackend,
        TableConnector,
        TableName,
    },
    batch::TransactionBatcher,
    convert::ConverterRegistry,
    credentials::{
        table_sas_url,
        ConnectionContext,
        ConnectionType,
        Credentials,
    },
    entity::{
        Entity,
        PARTITION_KEY,
        ROW_KEY,
    },
    error::{
        OperationErrorCode,
        TableError,
        ValidationWarning,
    },
    identity::CredentialProvider,
    knobs::QUERY_SORT_WARN_THRESHOLD,
    operation::{
        OperationKind,
        TransactionAction,
    },
    query::{
        sort_entities,
        QueryOptions,
    },
    record::RawRecord,
};

/// Outcome of a write. `warnings` lists record problems that didn't stop the
/// write; they are also logged.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WriteSummary {
    pub actions: usize,
    pub transactions: usize,
    pub warnings: Vec<ValidationWarning>,
}

fn connect_error_code(connection_type: ConnectionType) -> OperationErrorCode {
    match connection_type {
        ConnectionType::ConnectionString => OperationErrorCode::ConnectWithConnectionStringError,
        ConnectionType::Sas => OperationErrorCode::ConnectWithSasError,
        ConnectionType::AccountKey => OperationErrorCode::ConnectWithStorageKeyError,
        ConnectionType::Token => OperationErrorCode::ConnectWithTokenError,
        ConnectionType::ManagedIdentity => OperationErrorCode::ConnectWithManagedIdentityError,
    }
}

fn connection_error(code: OperationErrorCode, e: anyhow::Error) -> TableError {
    if e.is_canceled() {
        TableError::Canceled { code }
    } else {
        TableError::Connection { code, source: e }
    }
}

/// Maps a backend failure into the error of the operation `code`.
fn backend_error(code: OperationErrorCode, e: anyhow::Error) -> TableError {
    if e.is_canceled() {
        TableError::Canceled { code }
    } else if e.is_occ() {
        TableError::ConcurrencyConflict { code, source: e }
    } else {
        TableError::Backend { code, source: e }
    }
}

/// Blank names count as no name.
fn parse_table_name(table_name: Option<&str>) -> Result<Option<TableName>, TableError> {
    let Some(name) = table_name.map(str::trim).filter(|name| !name.is_empty()) else {
        return Ok(None);
    };
    name.parse()
        .map(Some)
        .map_err(|source| TableError::InvalidTableName {
            code: OperationErrorCode::InvalidTableNameError,
            source,
        })
}

/// Entity and table operations against one table service, and optionally one
/// table in it.
///
/// Every record passed to a write is validated and converted before the
/// first call to the backend, so a bad record fails the write without
/// touching the table.
pub struct TableService {
    backend: Arc<dyn TableBackend>,
    table: Option<TableName>,
    connection_type: ConnectionType,
    registry: ConverterRegistry,
    cancel: CancellationToken,
}

impl TableService {
    pub async fn create_with_connection_string(
        connector: &dyn TableConnector,
        connection_string: &str,
        table_name: Option<&str>,
        create_table_if_not_exists: bool,
        cancel: CancellationToken,
    ) -> Result<Self, TableError> {
        let table = parse_table_name(table_name)?;
        let credentials = Credentials::connection_string(connection_string).map_err(|e| {
            connection_error(OperationErrorCode::ConnectWithConnectionStringError, e)
        })?;
        Self::establish(
            connector,
            credentials,
            ConnectionType::ConnectionString,
            table,
            create_table_if_not_exists,
            cancel,
        )
        .await
    }

    /// `sas_url` may point at the service or at the table. When a table name
    /// is given and the URL doesn't end with it, the name is appended to the
    /// path.
    pub async fn create_with_sas(
        connector: &dyn TableConnector,
        sas_url: &Url,
        table_name: Option<&str>,
        create_table_if_not_exists: bool,
        cancel: CancellationToken,
    ) -> Result<Self, TableError> {
        let table = parse_table_name(table_name)?;
        let url = match &table {
            Some(table) => table_sas_url(sas_url, table),
            None => sas_url.clone(),
        };
        let credentials = Credentials::shared_access_signature(url)
            .map_err(|e| connection_error(OperationErrorCode::ConnectWithSasError, e))?;
        Self::establish(
            connector,
            credentials,
            ConnectionType::Sas,
            table,
            create_table_if_not_exists,
            cancel,
        )
        .await
    }

    pub async fn create_with_account_key(
        connector: &dyn TableConnector,
        account_name: &str,
        account_key: &str,
        table_name: Option<&str>,
        create_table_if_not_exists: bool,
        cancel: CancellationToken,
    ) -> Result<Self, TableError> {
        let table = parse_table_name(table_name)?;
        let credentials = Credentials::AccountKey {
            account_name: account_name.to_string(),
            account_key: account_key.to_string(),
        };
        Self::establish(
            connector,
            credentials,
            ConnectionType::AccountKey,
            table,
            create_table_if_not_exists,
            cancel,
        )
        .await
    }

    pub async fn create_with_token(
        connector: &dyn TableConnector,
        account_name: &str,
        token: &str,
        table_name: Option<&str>,
        create_table_if_not_exists: bool,
        cancel: CancellationToken,
    ) -> Result<Self, TableError> {
        let table = parse_table_name(table_name)?;
        let credentials = Credentials::BearerToken {
            account_name: account_name.to_string(),
            token: token.to_string(),
        };
        Self::establish(
            connector,
            credentials,
            ConnectionType::Token,
            table,
            create_table_if_not_exists,
            cancel,
        )
        .await
    }

    /// Fetches a token for the managed identity, or for the user-assigned
    /// identity `client_id`, and connects with it.
    pub async fn create_with_managed_identity(
        connector: &dyn TableConnector,
        provider: &dyn CredentialProvider,
        account_name: &str,
        client_id: Option<&str>,
        table_name: Option<&str>,
        create_table_if_not_exists: bool,
        cancel: CancellationToken,
    ) -> Result<Self, TableError> {
        const CODE: OperationErrorCode = OperationErrorCode::ConnectWithManagedIdentityError;
        let table = parse_table_name(table_name)?;
        if create_table_if_not_exists && table.is_none() {
            return Err(TableError::TableNameRequired {
                code: OperationErrorCode::TableNameRequiredError,
            });
        }
        let token = provider
            .managed_identity_token(account_name, client_id, &cancel)
            .await
            .map_err(|e| connection_error(CODE, e))?;
        let credentials = Credentials::BearerToken {
            account_name: account_name.to_string(),
            token,
        };
        Self::establish(
            connector,
            credentials,
            ConnectionType::ManagedIdentity,
            table,
            create_table_if_not_exists,
            cancel,
        )
        .await
    }

    /// Connects with whatever credentials `context` carries.
    pub async fn connect(
        connector: &dyn TableConnector,
        provider: &dyn CredentialProvider,
        context: &ConnectionContext,
        create_table_if_not_exists: bool,
        cancel: CancellationToken,
    ) -> Result<Self, TableError> {
        let table_name = context.table_name.as_deref();
        let create = create_table_if_not_exists;
        match &context.credentials {
            Credentials::ConnectionString(cs) => {
                Self::create_with_connection_string(connector, cs.as_str(), table_name, create, cancel)
                    .await
            },
            Credentials::SharedAccessSignature(url) => {
                Self::create_with_sas(connector, url, table_name, create, cancel).await
            },
            Credentials::AccountKey {
                account_name,
                account_key,
            } => {
                Self::create_with_account_key(
                    connector,
                    account_name,
                    account_key,
                    table_name,
                    create,
                    cancel,
                )
                .await
            },
            Credentials::BearerToken {
                account_name,
                token,
            } => {
                Self::create_with_token(connector, account_name, token, table_name, create, cancel)
                    .await
            },
            Credentials::ManagedIdentity {
                account_name,
                client_id,
            } => {
                Self::create_with_managed_identity(
                    connector,
                    provider,
                    account_name,
                    client_id.as_deref(),
                    table_name,
                    create,
                    cancel,
                )
                .await
            },
        }
    }

    async fn establish(
        connector: &dyn TableConnector,
        credentials: Credentials,
        connection_type: ConnectionType,
        table: Option<TableName>,
        create_table_if_not_exists: bool,
        cancel: CancellationToken,
    ) -> Result<Self, TableError> {
        if create_table_if_not_exists && table.is_none() {
            return Err(TableError::TableNameRequired {
                code: OperationErrorCode::TableNameRequiredError,
            });
        }
        tracing::info!("Connecting to the table service with {connection_type} credentials");
        let backend = connector
            .connect(&credentials, &cancel)
            .await
            .map_err(|e| connection_error(connect_error_code(connection_type), e))?;
        let service = Self {
            backend,
            table,
            connection_type,
            registry: ConverterRegistry::BUILTIN,
            cancel,
        };
        if create_table_if_not_exists {
            service.create_table_if_not_exists().await?;
        }
        Ok(service)
    }

    /// Replaces the converters used to read records.
    pub fn with_registry(mut self, registry: ConverterRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn table_name(&self) -> Option<&TableName> {
        self.table.as_ref()
    }

    pub fn connection_type(&self) -> ConnectionType {
        self.connection_type
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn supported_entity_types(&self) -> Vec<&'static str> {
        self.registry.supported_type_names()
    }

    fn table(&self, code: OperationErrorCode) -> Result<&TableName, TableError> {
        self.table
            .as_ref()
            .ok_or(TableError::TableNameRequired { code })
    }

    /// Validates and converts every record. Identity problems and
    /// unconvertible records fail the whole call; field problems become
    /// warnings when `check_fields` is set.
    fn prepare(
        &self,
        records: &[RawRecord],
        code: OperationErrorCode,
        check_fields: bool,
    ) -> Result<(Vec<Entity>, Vec<ValidationWarning>), TableError> {
        let mut entities = Vec::with_capacity(records.len());
        let mut warnings = Vec::new();
        for (index, record) in records.iter().enumerate() {
            let converter =
                self.registry
                    .converter_for(record)
                    .ok_or_else(|| TableError::UnsupportedEntityType {
                        code,
                        type_name: record.shape_name(),
                        supported: self.registry.supported_type_names(),
                    })?;
            if !converter.validate(record) {
                return Err(TableError::MissingIdentityField {
                    code,
                    index,
                    type_name: converter.type_name(),
                });
            }
            if check_fields {
                if let Err(fields) = converter.validate_field_types(record) {
                    warnings.push(ValidationWarning::UnsupportedFieldTypes {
                        record_index: index,
                        fields,
                    });
                }
                if let Err(fields) = converter.validate_no_nulls(record) {
                    warnings.push(ValidationWarning::NullFieldValues {
                        record_index: index,
                        fields,
                    });
                }
            }
            let entity = converter
                .convert(record)
                .map_err(|source| TableError::Conversion { code, source })?;
            entities.push(entity);
        }
        for warning in &warnings {
            tracing::warn!("{warning}");
        }
        Ok((entities, warnings))
    }

    async fn submit(
        &self,
        table: &TableName,
        actions: Vec<TransactionAction>,
        code: OperationErrorCode,
        warnings: Vec<ValidationWarning>,
    ) -> Result<WriteSummary, TableError> {
        let summary = TransactionBatcher::new(self.backend.as_ref(), table, &self.cancel)
            .submit(actions)
            .await
            .map_err(|e| backend_error(code, e))?;
        Ok(WriteSummary {
            actions: summary.actions,
            transactions: summary.transactions,
            warnings,
        })
    }

    /// Inserts (`Add`) or upserts the records.
    pub async fn add_entities(
        &self,
        records: &[RawRecord],
        kind: OperationKind,
    ) -> Result<WriteSummary, TableError> {
        const CODE: OperationErrorCode = OperationErrorCode::AddEntitiesError;
        if !OperationKind::ADD_KINDS.contains(&kind) {
            return Err(TableError::InvalidOperationKind { kind, code: CODE });
        }
        let table = self.table(OperationErrorCode::TableClientError)?;
        let (entities, warnings) = self.prepare(records, CODE, true)?;
        tracing::info!("Writing {} entities to {table} with {kind}", entities.len());
        let actions = entities
            .into_iter()
            .map(|entity| TransactionAction::new(kind, entity))
            .collect();
        self.submit(table, actions, CODE, warnings).await
    }

    /// Deletes the rows the records identify. With `validate_etag`, a record
    /// carrying an `ETag` is only deleted if the stored row still has that
    /// version.
    pub async fn remove_entities(
        &self,
        records: &[RawRecord],
        validate_etag: bool,
    ) -> Result<WriteSummary, TableError> {
        const CODE: OperationErrorCode = OperationErrorCode::RemoveEntitiesError;
        let table = self.table(OperationErrorCode::TableClientError)?;
        let (entities, warnings) = self.prepare(records, CODE, false)?;
        tracing::info!("Removing {} entities from {table}", entities.len());
        let actions = entities
            .into_iter()
            .map(|entity| {
                if validate_etag {
                    TransactionAction::conditional(OperationKind::Delete, entity)
                } else {
                    TransactionAction::new(OperationKind::Delete, entity)
                }
            })
            .collect();
        self.submit(table, actions, CODE, warnings).await
    }

    /// Updates or upserts the records. With `validate_etag`, updates of
    /// records carrying an `ETag` only apply if the stored row still has that
    /// version.
    pub async fn update_entities(
        &self,
        records: &[RawRecord],
        kind: OperationKind,
        validate_etag: bool,
    ) -> Result<WriteSummary, TableError> {
        const CODE: OperationErrorCode = OperationErrorCode::UpdateEntitiesError;
        if !OperationKind::UPDATE_KINDS.contains(&kind) {
            return Err(TableError::InvalidOperationKind { kind, code: CODE });
        }
        let table = self.table(OperationErrorCode::TableClientError)?;
        let (entities, warnings) = self.prepare(records, CODE, true)?;
        tracing::info!("Updating {} entities in {table} with {kind}", entities.len());
        let actions = entities
            .into_iter()
            .map(|entity| {
                if validate_etag {
                    TransactionAction::conditional(kind, entity)
                } else {
                    TransactionAction::new(kind, entity)
                }
            })
            .collect();
        self.submit(table, actions, CODE, warnings).await
    }

    async fn next_entity(
        &self,
        rows: &mut RowStream,
        code: OperationErrorCode,
    ) -> Result<Option<Entity>, TableError> {
        if self.cancel.is_cancelled() {
            return Err(TableError::Canceled { code });
        }
        let Some(row) = rows.try_next().await.map_err(|e| backend_error(code, e))? else {
            return Ok(None);
        };
        Entity::from_wire_row(row)
            .map(Some)
            .map_err(|e| backend_error(code, e))
    }

    async fn query(
        &self,
        table: &TableName,
        options: &QueryOptions,
        code: OperationErrorCode,
    ) -> Result<RowStream, TableError> {
        self.backend
            .query(table, options.backend_request(), &self.cancel)
            .await
            .map_err(|e| backend_error(code, e))
    }

    /// Reads entities. With `sort_by`, every matching row is read and sorted
    /// before `skip` and `top` apply. Otherwise rows are read only until `top`
    /// entities past `skip` have been seen.
    pub async fn get_entities(&self, options: &QueryOptions) -> Result<Vec<Entity>, TableError> {
        const CODE: OperationErrorCode = OperationErrorCode::GetEntitiesError;
        let table = self.table(OperationErrorCode::TableClientError)?;
        tracing::info!("Querying {table}");
        let mut rows = self.query(table, options, CODE).await?;
        let skip = options.skip.unwrap_or(0);
        let top = options.top.unwrap_or(usize::MAX);

        if options.is_sorted() {
            let mut entities = Vec::new();
            while let Some(entity) = self.next_entity(&mut rows, CODE).await? {
                entities.push(entity);
            }
            if entities.len() > *QUERY_SORT_WARN_THRESHOLD {
                tracing::warn!(
                    "Sorting {} entities from {table} in memory. Narrow the filter to read fewer \
                     rows.",
                    entities.len()
                );
            }
            sort_entities(&mut entities, &options.sort_by);
            return Ok(entities.into_iter().skip(skip).take(top).collect());
        }

        let mut entities = Vec::new();
        let mut skipped = 0;
        while entities.len() < top {
            let Some(entity) = self.next_entity(&mut rows, CODE).await? else {
                break;
            };
            if skipped < skip {
                skipped += 1;
            } else {
                entities.push(entity);
            }
        }
        Ok(entities)
    }

    /// Deletes every entity in the table, one partition transaction at a
    /// time. If a transaction fails, the ones before it stay committed.
    pub async fn clear_table(&self) -> Result<WriteSummary, TableError> {
        const CODE: OperationErrorCode = OperationErrorCode::ClearTableError;
        let table = self.table(OperationErrorCode::TableClientError)?;
        let options = QueryOptions::new().select([PARTITION_KEY, ROW_KEY]);
        let mut rows = self.query(table, &options, CODE).await?;
        let mut actions = Vec::new();
        while let Some(entity) = self.next_entity(&mut rows, CODE).await? {
            actions.push(TransactionAction::new(OperationKind::Delete, entity));
        }
        tracing::info!("Clearing {} entities from {table}", actions.len());
        self.submit(table, actions, CODE, vec![]).await
    }

    /// Creates the table. An existing table is not an error.
    pub async fn create_table_if_not_exists(&self) -> Result<(), TableError> {
        const CODE: OperationErrorCode = OperationErrorCode::CreateTableError;
        let table = self.table(OperationErrorCode::TableNameRequiredError)?;
        tracing::info!("Creating table {table} if it doesn't exist");
        self.backend
            .create_table_if_not_exists(table, &self.cancel)
            .await
            .map_err(|e| backend_error(CODE, e))
    }

    pub async fn remove_table(&self) -> Result<(), TableError> {
        const CODE: OperationErrorCode = OperationErrorCode::DeleteTableError;
        let table = self.table(OperationErrorCode::TableNameRequiredError)?;
        tracing::info!("Deleting table {table}");
        self.backend
            .delete_table(table, &self.cancel)
            .await
            .map_err(|e| backend_error(CODE, e))
    }

    /// Lists table names, optionally filtered with an OData expression over
    /// `TableName`.
    pub async fn list_tables(&self, filter: Option<&str>) -> Result<Vec<String>, TableError> {
        const CODE: OperationErrorCode = OperationErrorCode::GetTablesError;
        self.backend
            .list_tables(filter, &self.cancel)
            .await
            .map_err(|e| backend_error(CODE, e))
    }
}
