use std::path::Path;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use shared::{
    domain::AttachedClient,
    protocol::{AttachedClientDisconnectInput, AttachedClientsData, GraphqlResponse},
};

pub mod controller;
pub mod graphql_client;
pub mod normalizer;
pub mod runtime;
pub mod services;

pub use controller::{
    CompletedDisconnect, ControllerEffect, ControllerEvent, DisconnectAdvice, DisconnectController,
    DisconnectFailure, DisconnectStage, DisconnectView, ReasonRouting, TransitionObserver,
    TransitionRecord, TransitionRejected,
};
pub use graphql_client::GraphqlAccountClient;
pub use normalizer::{classify, has_mobile_device, normalize, ServiceBrand};
pub use runtime::{ConnectedServicesRuntime, RuntimeHandle, ServicesEvent, ServicesView};
pub use services::ConnectedServices;

#[async_trait]
pub trait AttachedClientSource: Send + Sync {
    async fn fetch_attached_clients(&self) -> Result<Vec<AttachedClient>>;
}

#[async_trait]
pub trait DisconnectGateway: Send + Sync {
    async fn disconnect(&self, input: &AttachedClientDisconnectInput) -> Result<()>;
}

pub struct MissingAttachedClientSource;

#[async_trait]
impl AttachedClientSource for MissingAttachedClientSource {
    async fn fetch_attached_clients(&self) -> Result<Vec<AttachedClient>> {
        Err(anyhow!("attached client source is unavailable"))
    }
}

pub struct MissingDisconnectGateway;

#[async_trait]
impl DisconnectGateway for MissingDisconnectGateway {
    async fn disconnect(&self, _input: &AttachedClientDisconnectInput) -> Result<()> {
        Err(anyhow!("disconnect gateway is unavailable"))
    }
}

/// Serves a fixed snapshot, e.g. one exported from the settings page.
#[derive(Debug, Clone, Default)]
pub struct StaticClientSource {
    clients: Vec<AttachedClient>,
}

impl StaticClientSource {
    pub fn new(clients: Vec<AttachedClient>) -> Self {
        Self { clients }
    }

    /// Accepts either a bare array of clients or a full `attachedClients` query response.
    pub fn from_json(raw: &str) -> Result<Self> {
        if let Ok(clients) = serde_json::from_str::<Vec<AttachedClient>>(raw) {
            return Ok(Self::new(clients));
        }

        let response: GraphqlResponse<AttachedClientsData> =
            serde_json::from_str(raw).context("snapshot is neither a client list nor a query response")?;
        let data = response
            .data
            .ok_or_else(|| anyhow!("snapshot query response carries no data"))?;
        Ok(Self::new(data.account.attached_clients))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read snapshot '{}'", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("invalid snapshot '{}'", path.display()))
    }
}

#[async_trait]
impl AttachedClientSource for StaticClientSource {
    async fn fetch_attached_clients(&self) -> Result<Vec<AttachedClient>> {
        Ok(self.clients.clone())
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
