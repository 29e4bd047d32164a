use shared::domain::{AttachedClient, ClientIdentity};

use crate::normalizer::{has_mobile_device, normalize};

/// Normalized clients currently shown to the user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectedServices {
    clients: Vec<AttachedClient>,
}

impl ConnectedServices {
    pub fn from_snapshot(snapshot: &[AttachedClient]) -> Self {
        Self {
            clients: normalize(snapshot),
        }
    }

    pub fn replace_snapshot(&mut self, snapshot: &[AttachedClient]) {
        self.clients = normalize(snapshot);
    }

    pub fn clients(&self) -> &[AttachedClient] {
        &self.clients
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn has_mobile_device(&self) -> bool {
        has_mobile_device(&self.clients)
    }

    pub fn find(&self, identity: &ClientIdentity) -> Option<&AttachedClient> {
        self.clients
            .iter()
            .find(|client| &client.identity() == identity)
    }

    /// Looks up a row by any revocation handle, falling back to an exact name match.
    pub fn select(&self, selector: &str) -> Option<&AttachedClient> {
        self.clients
            .iter()
            .find(|client| client.identity().matches_handle(selector))
            .or_else(|| self.clients.iter().find(|client| client.name == selector))
    }

    /// Drops every row carrying `identity`. Returns whether anything was removed.
    pub fn remove(&mut self, identity: &ClientIdentity) -> bool {
        let before = self.clients.len();
        self.clients.retain(|client| &client.identity() != identity);
        self.clients.len() != before
    }
}

#[cfg(test)]
#[path = "tests/services_tests.rs"]
mod tests;
