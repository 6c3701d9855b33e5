//! How a caller authenticates against the table service, and the endpoints
//! that follow from it.

use std::{
    fmt,
    str::FromStr,
};

use anyhow::Context;
use cmd_util::keyvalue::parse_key_value_list;
use errors::ErrorMetadata;
use url::Url;

use crate::{
    backend::TableName,
    knobs::TABLE_ENDPOINT_SUFFIX,
};

const DEVELOPMENT_STORAGE_ENDPOINT: &str = "http://127.0.0.1:10002/devstoreaccount1";
const REDACTED: &str = "<redacted>";

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum ConnectionType {
    ConnectionString,
    #[strum(to_string = "SAS")]
    Sas,
    AccountKey,
    Token,
    ManagedIdentity,
}

/// Parsed `Key=Value;...` storage connection string. Keys are matched
/// case-insensitively.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionString {
    raw: String,
    settings: Vec<(String, String)>,
}

impl ConnectionString {
    fn get(&self, key: &str) -> Option<&str> {
        self.settings
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn account_name(&self) -> Option<&str> {
        self.get("AccountName")
    }

    pub fn account_key(&self) -> Option<&str> {
        self.get("AccountKey")
    }

    pub fn shared_access_signature(&self) -> Option<&str> {
        self.get("SharedAccessSignature")
    }

    pub fn uses_development_storage(&self) -> bool {
        self.get("UseDevelopmentStorage")
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }

    /// The table service endpoint: `TableEndpoint` if given, the local
    /// emulator for development storage, otherwise built from the account
    /// name and `EndpointSuffix`.
    pub fn table_endpoint(&self) -> anyhow::Result<Url> {
        if let Some(endpoint) = self.get("TableEndpoint") {
            return Url::parse(endpoint).context(ErrorMetadata::bad_request(
                "InvalidConnectionString",
                format!("TableEndpoint {endpoint} is not a valid URL"),
            ));
        }
        if self.uses_development_storage() {
            return Ok(Url::parse(DEVELOPMENT_STORAGE_ENDPOINT)?);
        }
        let account_name = self.account_name().context(ErrorMetadata::bad_request(
            "InvalidConnectionString",
            "The connection string has neither a TableEndpoint nor an AccountName",
        ))?;
        let protocol = self.get("DefaultEndpointsProtocol").unwrap_or("https");
        let endpoint = match self.get("EndpointSuffix") {
            Some(suffix) => format!("{protocol}://{account_name}.table.{suffix}/"),
            None => format!("{protocol}://{account_name}.{}/", *TABLE_ENDPOINT_SUFFIX),
        };
        Url::parse(&endpoint).context(ErrorMetadata::bad_request(
            "InvalidConnectionString",
            format!("Could not build a table endpoint from the connection string: {endpoint}"),
        ))
    }
}

impl FromStr for ConnectionString {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let settings = parse_key_value_list(s, ';').context(ErrorMetadata::bad_request(
            "InvalidConnectionString",
            "Connection strings are Key=Value pairs separated by semicolons",
        ))?;
        let connection_string = Self {
            raw: s.to_string(),
            settings,
        };
        let has_shared_key = connection_string.account_name().is_some()
            && connection_string.account_key().is_some();
        let has_endpoint = connection_string.get("TableEndpoint").is_some();
        if !has_shared_key && !has_endpoint && !connection_string.uses_development_storage() {
            anyhow::bail!(ErrorMetadata::bad_request(
                "InvalidConnectionString",
                "The connection string needs AccountName and AccountKey, a TableEndpoint, or \
                 UseDevelopmentStorage=true",
            ));
        }
        Ok(connection_string)
    }
}

impl fmt::Debug for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (key, value) in &self.settings {
            let secret = key.eq_ignore_ascii_case("AccountKey")
                || key.eq_ignore_ascii_case("SharedAccessSignature");
            map.entry(key, &if secret { REDACTED } else { value.as_str() });
        }
        map.finish()
    }
}

#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    ConnectionString(ConnectionString),
    /// A service or table URL whose query string is the signature.
    SharedAccessSignature(Url),
    AccountKey {
        account_name: String,
        account_key: String,
    },
    BearerToken {
        account_name: String,
        token: String,
    },
    /// Resolved into a [`Credentials::BearerToken`] through a
    /// [`crate::identity::CredentialProvider`] before connecting.
    ManagedIdentity {
        account_name: String,
        client_id: Option<String>,
    },
}

impl Credentials {
    pub fn connection_string(s: &str) -> anyhow::Result<Self> {
        Ok(Credentials::ConnectionString(s.parse()?))
    }

    pub fn shared_access_signature(url: Url) -> anyhow::Result<Self> {
        if !url.query().is_some_and(|q| !q.is_empty()) {
            anyhow::bail!(ErrorMetadata::bad_request(
                "MissingSasToken",
                format!(
                    "The URL {} has no shared access signature in its query string",
                    url.origin().ascii_serialization()
                ),
            ));
        }
        Ok(Credentials::SharedAccessSignature(url))
    }

    pub fn connection_type(&self) -> ConnectionType {
        match self {
            Credentials::ConnectionString(_) => ConnectionType::ConnectionString,
            Credentials::SharedAccessSignature(_) => ConnectionType::Sas,
            Credentials::AccountKey { .. } => ConnectionType::AccountKey,
            Credentials::BearerToken { .. } => ConnectionType::Token,
            Credentials::ManagedIdentity { .. } => ConnectionType::ManagedIdentity,
        }
    }

    /// The table service endpoint these credentials authenticate against,
    /// without any table name or signature.
    pub fn service_endpoint(&self) -> anyhow::Result<Url> {
        match self {
            Credentials::ConnectionString(cs) => cs.table_endpoint(),
            Credentials::SharedAccessSignature(url) => {
                Ok(Url::parse(&url.origin().ascii_serialization())?)
            },
            Credentials::AccountKey { account_name, .. }
            | Credentials::BearerToken { account_name, .. }
            | Credentials::ManagedIdentity { account_name, .. } => account_endpoint(account_name),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::ConnectionString(cs) => {
                f.debug_tuple("ConnectionString").field(cs).finish()
            },
            Credentials::SharedAccessSignature(url) => f
                .debug_tuple("SharedAccessSignature")
                .field(&format!("{}{}?{REDACTED}", url.origin().ascii_serialization(), url.path()))
                .finish(),
            Credentials::AccountKey { account_name, .. } => f
                .debug_struct("AccountKey")
                .field("account_name", account_name)
                .field("account_key", &REDACTED)
                .finish(),
            Credentials::BearerToken { account_name, .. } => f
                .debug_struct("BearerToken")
                .field("account_name", account_name)
                .field("token", &REDACTED)
                .finish(),
            Credentials::ManagedIdentity {
                account_name,
                client_id,
            } => f
                .debug_struct("ManagedIdentity")
                .field("account_name", account_name)
                .field("client_id", client_id)
                .finish(),
        }
    }
}

/// Everything needed to reach one table: credentials plus the table name,
/// which only table-level operations need.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionContext {
    pub table_name: Option<String>,
    pub credentials: Credentials,
}

impl ConnectionContext {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            table_name: None,
            credentials,
        }
    }

    pub fn with_table_name(mut self, table_name: impl Into<String>) -> Self {
        self.table_name = Some(table_name.into());
        self
    }
}

/// `https://{account}.{TABLE_ENDPOINT_SUFFIX}/`
pub fn account_endpoint(account_name: &str) -> anyhow::Result<Url> {
    let endpoint = format!("https://{account_name}.{}/", *TABLE_ENDPOINT_SUFFIX);
    Url::parse(&endpoint).context(ErrorMetadata::bad_request(
        "InvalidAccountName",
        format!("{account_name:?} is not a valid storage account name"),
    ))
}

/// Points a SAS URL at `table`, inserting the table name before the query
/// string unless the URL already ends with it.
pub fn table_sas_url(sas_url: &Url, table: &TableName) -> Url {
    let path = sas_url.path().trim_end_matches('/');
    if path.rsplit('/').next() == Some(table.as_str()) {
        return sas_url.clone();
    }
    let mut url = sas_url.clone();
    url.set_path(&format!("{path}/{table}"));
    url
}
