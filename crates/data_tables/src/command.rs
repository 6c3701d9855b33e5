//! Command-line surface over [`TableService`]: one invocation connects, runs
//! one subcommand and returns its output.

use std::{
    io::Write,
    path::PathBuf,
};

use clap::{
    ArgGroup,
    Args,
    Parser,
    Subcommand,
};
use cmd_util::env::config_tool;
use errors::ErrorMetadata;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    backend::TableConnector,
    convert::ConverterRegistry,
    credentials::{
        ConnectionContext,
        Credentials,
    },
    entity::Entity,
    identity::CredentialProvider,
    operation::OperationKind,
    query::QueryOptions,
    record::RawRecord,
    service::{
        TableService,
        WriteSummary,
    },
};

#[derive(Parser, Debug, Clone)]
#[command(name = "data-tables", about = "Manage tables and entities in a table store")]
pub struct TableCli {
    #[command(flatten)]
    pub connection: ConnectionArgs,

    #[command(subcommand)]
    pub command: TableCommand,
}

/// How to reach the table service. Exactly one way of authenticating may be
/// given.
#[derive(Args, Debug, Clone, Default)]
#[command(group(ArgGroup::new("auth").multiple(false)))]
pub struct ConnectionArgs {
    /// Name of the table to operate on
    #[arg(long, env = "DATA_TABLES_TABLE_NAME", global = true)]
    pub table_name: Option<String>,

    /// Connection string of the storage account
    #[arg(long, env = "DATA_TABLES_CONNECTION_STRING", group = "auth")]
    pub connection_string: Option<String>,

    /// Table service URL with a shared access signature in its query
    #[arg(long, group = "auth")]
    pub sas: Option<Url>,

    /// Name of the storage account, for key, token and managed identity
    /// authentication
    #[arg(long, env = "DATA_TABLES_ACCOUNT_NAME")]
    pub account_name: Option<String>,

    #[arg(long, requires = "account_name", group = "auth")]
    pub account_key: Option<String>,

    /// Bearer token for the table service
    #[arg(long, requires = "account_name", group = "auth")]
    pub token: Option<String>,

    /// Authenticate as the managed identity of the host
    #[arg(long, requires = "account_name", group = "auth")]
    pub managed_identity: bool,

    /// Client id of a user-assigned managed identity
    #[arg(long, requires = "managed_identity")]
    pub client_id: Option<String>,
}

impl ConnectionArgs {
    pub fn context(&self) -> anyhow::Result<ConnectionContext> {
        let account_name = || self.account_name.clone().unwrap_or_default();
        let credentials = if let Some(connection_string) = &self.connection_string {
            Credentials::connection_string(connection_string)?
        } else if let Some(sas) = &self.sas {
            Credentials::SharedAccessSignature(sas.clone())
        } else if let Some(account_key) = &self.account_key {
            Credentials::AccountKey {
                account_name: account_name(),
                account_key: account_key.clone(),
            }
        } else if let Some(token) = &self.token {
            Credentials::BearerToken {
                account_name: account_name(),
                token: token.clone(),
            }
        } else if self.managed_identity {
            Credentials::ManagedIdentity {
                account_name: account_name(),
                client_id: self.client_id.clone(),
            }
        } else {
            anyhow::bail!(ErrorMetadata::bad_request(
                "MissingCredentials",
                "Pass one of --connection-string, --sas, --account-key, --token or \
                 --managed-identity"
            ));
        };
        let context = ConnectionContext::new(credentials);
        Ok(match &self.table_name {
            Some(table_name) => context.with_table_name(table_name.as_str()),
            None => context,
        })
    }
}

/// Entities as JSON, either inline or in a file. An object is one entity, an
/// array is many.
#[derive(Args, Debug, Clone)]
pub struct EntityInput {
    #[arg(long, conflicts_with = "entity_file")]
    pub entity: Option<String>,

    #[arg(long)]
    pub entity_file: Option<PathBuf>,
}

impl EntityInput {
    pub async fn records(&self) -> anyhow::Result<Vec<RawRecord>> {
        let json = match (&self.entity, &self.entity_file) {
            (Some(entity), _) => entity.clone(),
            (None, Some(path)) => tokio::fs::read_to_string(path).await?,
            (None, None) => anyhow::bail!(ErrorMetadata::bad_request(
                "MissingEntities",
                "Pass the entities with --entity or --entity-file"
            )),
        };
        RawRecord::list_from_json_str(&json)
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum TableCommand {
    /// Add entities to the table
    AddEntity {
        #[command(flatten)]
        entities: EntityInput,

        /// Add, UpsertMerge or UpsertReplace
        #[arg(long, default_value_t = OperationKind::Add, conflicts_with = "force")]
        operation_type: OperationKind,

        /// Overwrite entities that already exist
        #[arg(long)]
        force: bool,

        #[arg(long)]
        create_table_if_not_exists: bool,
    },
    /// Read entities from the table
    GetEntity {
        /// OData filter expression
        #[arg(long)]
        filter: Option<String>,

        /// Fields to return
        #[arg(long, value_delimiter = ',')]
        property: Vec<String>,

        /// Fields to sort by, most significant first
        #[arg(long, value_delimiter = ',')]
        sort: Vec<String>,

        /// Maximum number of entities to return
        #[arg(long)]
        first: Option<usize>,

        #[arg(long)]
        skip: Option<usize>,
    },
    /// Update entities in the table
    UpdateEntity {
        #[command(flatten)]
        entities: EntityInput,

        /// UpdateMerge, UpdateReplace, UpsertMerge or UpsertReplace
        #[arg(long, default_value_t = OperationKind::UpdateMerge)]
        operation_type: OperationKind,

        /// Skip the ETag check and overwrite entities changed since they were
        /// read
        #[arg(long)]
        force: bool,
    },
    /// Remove entities from the table
    RemoveEntity {
        #[command(flatten)]
        entities: EntityInput,

        /// Skip the ETag check and remove entities changed since they were
        /// read
        #[arg(long)]
        force: bool,
    },
    /// Remove every entity from the table
    ClearTable,
    /// Create the table if it doesn't exist
    NewTable,
    /// List the tables of the storage account
    GetTable {
        /// OData filter expression over TableName
        #[arg(long)]
        filter: Option<String>,
    },
    /// Delete the table
    RemoveTable,
    /// List the record shapes entities can be given in
    SupportedEntityTypes,
}

#[derive(Debug)]
pub enum CommandOutput {
    Entities(Vec<Entity>),
    Tables(Vec<String>),
    EntityTypes(Vec<&'static str>),
    Written(WriteSummary),
    Done,
}

impl CommandOutput {
    /// One JSON document per line.
    pub fn to_json_lines(&self) -> Vec<String> {
        match self {
            CommandOutput::Entities(entities) => entities
                .iter()
                .map(|entity| entity.to_json().to_string())
                .collect(),
            CommandOutput::Tables(tables) => tables
                .iter()
                .map(|table| json!({ "TableName": table }).to_string())
                .collect(),
            CommandOutput::EntityTypes(types) => {
                types.iter().map(|t| json!(t).to_string()).collect()
            },
            CommandOutput::Written(summary) => {
                let warnings: Vec<_> = summary.warnings.iter().map(|w| w.to_string()).collect();
                vec![json!({
                    "actions": summary.actions,
                    "transactions": summary.transactions,
                    "warnings": warnings,
                })
                .to_string()]
            },
            CommandOutput::Done => vec![],
        }
    }
}

pub async fn execute(
    cli: TableCli,
    connector: &dyn TableConnector,
    provider: &dyn CredentialProvider,
    cancel: CancellationToken,
) -> anyhow::Result<CommandOutput> {
    if let TableCommand::SupportedEntityTypes = cli.command {
        return Ok(CommandOutput::EntityTypes(
            ConverterRegistry::BUILTIN.supported_type_names(),
        ));
    }
    let create_table = matches!(
        cli.command,
        TableCommand::NewTable
            | TableCommand::AddEntity {
                create_table_if_not_exists: true,
                ..
            }
    );
    let service = match &cli.connection.connection_string {
        Some(connection_string) => {
            TableService::create_with_connection_string(
                connector,
                connection_string,
                cli.connection.table_name.as_deref(),
                create_table,
                cancel,
            )
            .await?
        },
        None => {
            let context = cli.connection.context()?;
            TableService::connect(connector, provider, &context, create_table, cancel).await?
        },
    };

    let output = match cli.command {
        TableCommand::AddEntity {
            entities,
            operation_type,
            force,
            ..
        } => {
            let kind = if force {
                OperationKind::UpsertReplace
            } else {
                operation_type
            };
            let records = entities.records().await?;
            CommandOutput::Written(service.add_entities(&records, kind).await?)
        },
        TableCommand::GetEntity {
            filter,
            property,
            sort,
            first,
            skip,
        } => {
            let options = QueryOptions {
                filter,
                select: property,
                top: first,
                skip,
                sort_by: sort,
            };
            CommandOutput::Entities(service.get_entities(&options).await?)
        },
        TableCommand::UpdateEntity {
            entities,
            operation_type,
            force,
        } => {
            let records = entities.records().await?;
            CommandOutput::Written(
                service
                    .update_entities(&records, operation_type, !force)
                    .await?,
            )
        },
        TableCommand::RemoveEntity { entities, force } => {
            let records = entities.records().await?;
            CommandOutput::Written(service.remove_entities(&records, !force).await?)
        },
        TableCommand::ClearTable => CommandOutput::Written(service.clear_table().await?),
        TableCommand::NewTable => CommandOutput::Done,
        TableCommand::GetTable { filter } => {
            if service.table_name().is_some() {
                tracing::warn!(
                    "A table name was given but is not used to list tables. Use --filter to look \
                     for a specific table."
                );
            }
            CommandOutput::Tables(service.list_tables(filter.as_deref()).await?)
        },
        TableCommand::RemoveTable => {
            service.remove_table().await?;
            CommandOutput::Done
        },
        TableCommand::SupportedEntityTypes => {
            CommandOutput::EntityTypes(service.supported_entity_types())
        },
    };
    Ok(output)
}

/// Runs one invocation as a command-line tool does: diagnostics go to
/// stderr, Ctrl-C cancels the operation and the output is printed to stdout
/// as JSON lines.
pub async fn run(
    cli: TableCli,
    connector: &dyn TableConnector,
    provider: &dyn CredentialProvider,
) -> anyhow::Result<()> {
    let _guard = config_tool();
    let cancel = CancellationToken::new();
    let ctrl_c = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Canceling after Ctrl-C");
                cancel.cancel();
            }
        }
    });
    let result = execute(cli, connector, provider, cancel).await;
    ctrl_c.abort();
    let mut stdout = std::io::stdout().lock();
    for line in result?.to_json_lines() {
        writeln!(stdout, "{line}")?;
    }
    Ok(())
}
