use serde::{Deserialize, Serialize};

use crate::{
    domain::{AttachedClient, ClientId, ClientIdentity, DeviceId, RefreshTokenId, SessionTokenId},
    error::{ApiError, ErrorCode},
};

pub const ATTACHED_CLIENTS_QUERY: &str = "query GetAttachedClients {
  account {
    attachedClients {
      clientId
      isCurrentSession
      userAgent
      deviceType
      deviceId
      name
      lastAccessTime
      os
      sessionTokenId
      refreshTokenId
    }
  }
}";

pub const ATTACHED_CLIENT_DISCONNECT_MUTATION: &str =
    "mutation attachedClientDisconnect($input: AttachedClientDisconnectInput!) {
  attachedClientDisconnect(input: $input) {
    clientMutationId
  }
}";

/// Handles sent to the disconnect mutation; absent handles are omitted.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachedClientDisconnectInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<ClientId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<DeviceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token_id: Option<RefreshTokenId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_token_id: Option<SessionTokenId>,
}

impl From<ClientIdentity> for AttachedClientDisconnectInput {
    fn from(value: ClientIdentity) -> Self {
        Self {
            client_id: value.client_id,
            device_id: value.device_id,
            refresh_token_id: value.refresh_token_id,
            session_token_id: value.session_token_id,
        }
    }
}

impl From<&AttachedClient> for AttachedClientDisconnectInput {
    fn from(value: &AttachedClient) -> Self {
        value.identity().into()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphqlRequest<V> {
    pub query: String,
    pub variables: V,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisconnectVariables {
    pub input: AttachedClientDisconnectInput,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NoVariables {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphqlResponse<T> {
    #[serde(default = "Option::default")]
    pub data: Option<T>,
    #[serde(default)]
    pub errors: Vec<GraphqlErrorEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphqlErrorEntry {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<GraphqlErrorExtensions>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphqlErrorExtensions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl From<&GraphqlErrorEntry> for ApiError {
    fn from(value: &GraphqlErrorEntry) -> Self {
        let code = value
            .extensions
            .as_ref()
            .and_then(|ext| ext.code.as_deref())
            .map(ErrorCode::from_graphql_code)
            .unwrap_or(ErrorCode::Internal);
        ApiError::new(code, value.message.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachedClientsData {
    pub account: AccountAttachedClients,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountAttachedClients {
    #[serde(default)]
    pub attached_clients: Vec<AttachedClient>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectData {
    pub attached_client_disconnect: Option<DisconnectPayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectPayload {
    #[serde(default)]
    pub client_mutation_id: Option<String>,
}
