use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use errors::{
    ErrorCode,
    ErrorMetadata,
};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::knobs::{
    MANAGED_IDENTITY_API_VERSION,
    TABLE_ENDPOINT_SUFFIX,
};

const IDENTITY_ENDPOINT_VAR: &str = "IDENTITY_ENDPOINT";
const IDENTITY_HEADER_VAR: &str = "IDENTITY_HEADER";
const IDENTITY_HEADER: &str = "X-IDENTITY-HEADER";

// Timeout for calls to the local identity endpoint
const IDENTITY_TIMEOUT: Duration = Duration::from_secs(10);

/// Produces bearer tokens for the table service.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Returns an access token for the table service of `account_name`,
    /// issued to the system-assigned identity or to the user-assigned
    /// identity `client_id`.
    async fn managed_identity_token(
        &self,
        account_name: &str,
        client_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<String>;
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

fn format_identity_error(status: reqwest::StatusCode, response_body: &str) -> String {
    let truncated_body = if response_body.len() > 1000 {
        let end = (0..=1000)
            .rev()
            .find(|i| response_body.is_char_boundary(*i))
            .unwrap_or(0);
        format!("{}...", &response_body[..end])
    } else {
        response_body.to_string()
    };
    format!(
        "The identity endpoint returned HTTP {} {}: {}",
        status.as_u16(),
        status.canonical_reason().unwrap_or("Unknown"),
        truncated_body
    )
}

/// Fetches tokens from the managed identity endpoint of the hosting
/// environment (`IDENTITY_ENDPOINT`, authenticated with `IDENTITY_HEADER`).
pub struct ManagedIdentityCredential {
    endpoint: Url,
    identity_header: Option<String>,
    client: reqwest::Client,
}

impl ManagedIdentityCredential {
    pub fn new(endpoint: Url, identity_header: Option<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(IDENTITY_TIMEOUT)
            .build()?;
        Ok(Self {
            endpoint,
            identity_header,
            client,
        })
    }

    pub fn from_env() -> anyhow::Result<Self> {
        let endpoint = std::env::var(IDENTITY_ENDPOINT_VAR).context(
            ErrorMetadata::unauthenticated(
                "ManagedIdentityUnavailable",
                format!("{IDENTITY_ENDPOINT_VAR} is not set, so no managed identity is available"),
            ),
        )?;
        let endpoint = Url::parse(&endpoint)
            .with_context(|| format!("{IDENTITY_ENDPOINT_VAR} is not a valid URL: {endpoint}"))?;
        Self::new(endpoint, std::env::var(IDENTITY_HEADER_VAR).ok())
    }

    pub fn token_request_url(&self, account_name: &str, client_id: Option<&str>) -> Url {
        let mut url = self.endpoint.clone();
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("api-version", &MANAGED_IDENTITY_API_VERSION)
                .append_pair(
                    "resource",
                    &format!("https://{account_name}.{}", *TABLE_ENDPOINT_SUFFIX),
                );
            if let Some(client_id) = client_id {
                query.append_pair("client_id", client_id);
            }
        }
        url
    }

    async fn request_token(
        &self,
        account_name: &str,
        client_id: Option<&str>,
    ) -> anyhow::Result<String> {
        let mut request = self
            .client
            .get(self.token_request_url(account_name, client_id));
        if let Some(header) = &self.identity_header {
            request = request.header(IDENTITY_HEADER, header);
        }
        let response = request
            .send()
            .await
            .context("Failed to reach the managed identity endpoint")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let code =
                ErrorCode::from_http_status_code(status).unwrap_or(ErrorCode::Unauthenticated);
            anyhow::bail!(ErrorMetadata {
                code,
                short_msg: "ManagedIdentityTokenError".into(),
                msg: format_identity_error(status, &body).into(),
            });
        }
        let token: TokenResponse = response
            .json()
            .await
            .context("The identity endpoint returned a response without an access_token")?;
        Ok(token.access_token)
    }
}

#[async_trait]
impl CredentialProvider for ManagedIdentityCredential {
    async fn managed_identity_token(
        &self,
        account_name: &str,
        client_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<String> {
        tracing::info!("Requesting a managed identity token for {account_name}");
        tokio::select! {
            biased;
            _ = cancel.cancelled() => anyhow::bail!(ErrorMetadata::canceled()),
            token = self.request_token(account_name, client_id) => token,
        }
    }
}
