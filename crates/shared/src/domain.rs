use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

id_newtype!(ClientId);
id_newtype!(DeviceId);
id_newtype!(RefreshTokenId);
id_newtype!(SessionTokenId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    Mobile,
    Desktop,
    Tablet,
    Other,
    Unknown,
}

impl DeviceType {
    /// Maps a raw server `deviceType` value. Empty values yield `None` so callers
    /// can fall back to other markers.
    pub fn from_raw(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        let kind = match raw.to_ascii_lowercase().as_str() {
            "mobile" | "phone" => Self::Mobile,
            "tablet" => Self::Tablet,
            "desktop" => Self::Desktop,
            _ => Self::Other,
        };
        Some(kind)
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Mobile => "mobile",
            Self::Desktop => "desktop",
            Self::Tablet => "tablet",
            Self::Other => "other",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DisconnectReason {
    #[default]
    NoneSelected,
    LostOrStolen,
    Suspicious,
    Duplicate,
    NotMine,
    Other,
}

impl DisconnectReason {
    pub const ALL: [DisconnectReason; 6] = [
        Self::NoneSelected,
        Self::LostOrStolen,
        Self::Suspicious,
        Self::Duplicate,
        Self::NotMine,
        Self::Other,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoneSelected => "none-selected",
            Self::LostOrStolen => "lost-or-stolen",
            Self::Suspicious => "suspicious",
            Self::Duplicate => "duplicate",
            Self::NotMine => "not-mine",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown disconnect reason '{0}'")]
pub struct UnknownDisconnectReason(pub String);

impl FromStr for DisconnectReason {
    type Err = UnknownDisconnectReason;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase().replace('_', "-");
        Self::ALL
            .into_iter()
            .find(|reason| reason.as_str() == normalized)
            .ok_or_else(|| UnknownDisconnectReason(value.to_string()))
    }
}

/// Revocation handles carried by a client. Two records with the same identity
/// refer to the same server-side grant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientIdentity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<ClientId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<DeviceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token_id: Option<RefreshTokenId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_token_id: Option<SessionTokenId>,
}

impl ClientIdentity {
    pub fn is_addressable(&self) -> bool {
        self.client_id.is_some() || self.device_id.is_some() || self.refresh_token_id.is_some()
    }

    /// True when `selector` equals any of the carried handles.
    pub fn matches_handle(&self, selector: &str) -> bool {
        self.client_id.as_ref().is_some_and(|id| id.as_str() == selector)
            || self.device_id.as_ref().is_some_and(|id| id.as_str() == selector)
            || self
                .refresh_token_id
                .as_ref()
                .is_some_and(|id| id.as_str() == selector)
            || self
                .session_token_id
                .as_ref()
                .is_some_and(|id| id.as_str() == selector)
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(id) = &self.client_id {
            parts.push(format!("client={id}"));
        }
        if let Some(id) = &self.device_id {
            parts.push(format!("device={id}"));
        }
        if let Some(id) = &self.refresh_token_id {
            parts.push(format!("refresh_token={id}"));
        }
        if let Some(id) = &self.session_token_id {
            parts.push(format!("session_token={id}"));
        }
        if parts.is_empty() {
            f.write_str("<none>")
        } else {
            f.write_str(&parts.join(" "))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachedClient {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<ClientId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<DeviceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token_id: Option<RefreshTokenId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_token_id: Option<SessionTokenId>,
    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_access_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_current_session: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
}

impl AttachedClient {
    pub fn identity(&self) -> ClientIdentity {
        ClientIdentity {
            client_id: self.client_id.clone(),
            device_id: self.device_id.clone(),
            refresh_token_id: self.refresh_token_id.clone(),
            session_token_id: self.session_token_id.clone(),
        }
    }

    pub fn has_identity(&self) -> bool {
        self.identity().is_addressable()
    }
}

#[cfg(test)]
#[path = "tests/domain_tests.rs"]
mod tests;
