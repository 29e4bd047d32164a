use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{de::DeserializeOwned, Serialize};
use shared::{
    domain::AttachedClient,
    error::{ApiError, ApiException, ErrorCode},
    protocol::{
        AttachedClientDisconnectInput, AttachedClientsData, DisconnectData, DisconnectVariables,
        GraphqlRequest, GraphqlResponse, NoVariables, ATTACHED_CLIENTS_QUERY,
        ATTACHED_CLIENT_DISCONNECT_MUTATION,
    },
};
use tracing::{debug, info};
use url::Url;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Talks to the account GraphQL endpoint for both the client list and the
/// disconnect mutation.
#[derive(Clone)]
pub struct GraphqlAccountClient {
    http: Client,
    endpoint: Url,
    bearer_token: Option<String>,
}

impl GraphqlAccountClient {
    pub fn new(endpoint: Url, bearer_token: Option<String>) -> Result<Self> {
        Self::with_timeout(endpoint, bearer_token, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(
        endpoint: Url,
        bearer_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        if !matches!(endpoint.scheme(), "http" | "https") {
            return Err(anyhow!(
                "graphql endpoint must use http:// or https://, got '{endpoint}'"
            ));
        }
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build graphql http client")?;
        Ok(Self {
            http,
            endpoint,
            bearer_token: bearer_token.filter(|token| !token.trim().is_empty()),
        })
    }

    async fn execute<V, T>(&self, operation: &str, query: &str, variables: V) -> Result<T>
    where
        V: Serialize,
        T: DeserializeOwned,
    {
        let mut request = self
            .http
            .post(self.endpoint.clone())
            .json(&GraphqlRequest {
                query: query.to_string(),
                variables,
            });
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("failed to send {operation} to {}", self.endpoint))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiException::new(
                ErrorCode::from_http_status(status.as_u16()),
                format!("{operation} returned HTTP {status}: {}", body.trim()),
            )
            .into());
        }

        let body: GraphqlResponse<T> = response
            .json()
            .await
            .with_context(|| format!("malformed {operation} response"))?;
        if let Some(first) = body.errors.first() {
            let error = ApiError::from(first);
            debug!(
                "graphql: {operation} returned {} error(s), first code={:?}",
                body.errors.len(),
                error.code
            );
            return Err(ApiException::from(error).into());
        }

        body.data
            .ok_or_else(|| anyhow!("{operation} response carried neither data nor errors"))
    }
}

#[async_trait]
impl crate::AttachedClientSource for GraphqlAccountClient {
    async fn fetch_attached_clients(&self) -> Result<Vec<AttachedClient>> {
        let data: AttachedClientsData = self
            .execute("GetAttachedClients", ATTACHED_CLIENTS_QUERY, NoVariables {})
            .await?;
        info!(
            "graphql: fetched attached clients count={}",
            data.account.attached_clients.len()
        );
        Ok(data.account.attached_clients)
    }
}

#[async_trait]
impl crate::DisconnectGateway for GraphqlAccountClient {
    async fn disconnect(&self, input: &AttachedClientDisconnectInput) -> Result<()> {
        let data: DisconnectData = self
            .execute(
                "attachedClientDisconnect",
                ATTACHED_CLIENT_DISCONNECT_MUTATION,
                DisconnectVariables {
                    input: input.clone(),
                },
            )
            .await?;
        debug!(
            "graphql: attachedClientDisconnect acknowledged mutation_id={:?}",
            data.attached_client_disconnect
                .and_then(|payload| payload.client_mutation_id)
        );
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/graphql_client_tests.rs"]
mod tests;
