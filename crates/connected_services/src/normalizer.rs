//! Display ordering and classification for attached-client snapshots.

use std::{cmp::Ordering, collections::HashSet};

use shared::domain::{AttachedClient, DeviceType};

const MOBILE_OS_NAMES: &[&str] = &["android", "ios"];

/// Application names that only ship on phones and tablets.
const MOBILE_APP_MARKERS: &[&str] = &[
    "firefox for android",
    "firefox for ios",
    "fennec",
    "firefox focus",
    "firefox klar",
    "lockwise for android",
    "lockwise for ios",
    "firefox preview",
    "a-c logins sync sample",
    "reference browser",
];

const POCKET_LINK: &str = "https://www.mozilla.org/en-US/firefox/pocket/";
const MONITOR_LINK: &str = "https://monitor.firefox.com/";
const LOCKWISE_LINK: &str = "https://www.mozilla.org/en-US/firefox/lockwise/";
const PRIVATE_NETWORK_LINK: &str = "https://vpn.mozilla.com/";
const SYNC_LINK: &str = "https://support.mozilla.org/en-US/kb/how-do-i-set-sync-my-computer";

pub fn classify(client: &AttachedClient) -> DeviceType {
    if let Some(kind) = client.device_type.as_deref().and_then(DeviceType::from_raw) {
        return kind;
    }

    if client.os.as_deref().is_some_and(|os| {
        let os = os.trim().to_ascii_lowercase();
        MOBILE_OS_NAMES.contains(&os.as_str())
    }) {
        return DeviceType::Mobile;
    }

    let name = client.name.to_ascii_lowercase();
    if MOBILE_APP_MARKERS.iter().any(|marker| name.contains(marker)) {
        return DeviceType::Mobile;
    }

    DeviceType::Unknown
}

pub fn is_mobile_device(client: &AttachedClient) -> bool {
    classify(client) == DeviceType::Mobile
}

pub fn has_mobile_device(clients: &[AttachedClient]) -> bool {
    clients.iter().any(is_mobile_device)
}

/// Most recent first; records without an access time go last. Callers rely on a
/// stable sort for ties.
fn by_last_access_desc(a: &AttachedClient, b: &AttachedClient) -> Ordering {
    match (a.last_access_time, b.last_access_time) {
        (Some(a), Some(b)) => b.cmp(&a),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Key under which web services collapse. Sync devices and unnamed records
/// are always listed individually.
fn service_dedup_key(client: &AttachedClient) -> Option<&str> {
    if client.device_id.is_some() {
        return None;
    }
    let name = client.name.trim();
    (!name.is_empty()).then_some(name)
}

pub fn normalize(clients: &[AttachedClient]) -> Vec<AttachedClient> {
    let mut valid: Vec<AttachedClient> = clients
        .iter()
        .filter(|client| client.has_identity())
        .cloned()
        .collect();

    valid.sort_by(by_last_access_desc);

    let mut seen_services = HashSet::new();
    valid.retain(|client| match service_dedup_key(client) {
        Some(key) => seen_services.insert(key.to_string()),
        None => true,
    });

    valid
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceBrand {
    Pocket,
    Monitor,
    Lockwise,
    PrivateNetwork,
    Sync,
    Mobile,
    Default,
}

impl ServiceBrand {
    pub fn for_client(client: &AttachedClient) -> Self {
        match client.name.trim() {
            "Pocket" => return Self::Pocket,
            "Firefox Monitor" => return Self::Monitor,
            "Firefox Lockwise" => return Self::Lockwise,
            "Firefox Private Network" => return Self::PrivateNetwork,
            "Firefox Sync" => return Self::Sync,
            _ => {}
        }

        if is_mobile_device(client) {
            Self::Mobile
        } else if client.device_id.is_some() {
            Self::Sync
        } else {
            Self::Default
        }
    }

    pub fn link(self) -> Option<&'static str> {
        match self {
            Self::Pocket => Some(POCKET_LINK),
            Self::Monitor => Some(MONITOR_LINK),
            Self::Lockwise => Some(LOCKWISE_LINK),
            Self::PrivateNetwork => Some(PRIVATE_NETWORK_LINK),
            Self::Sync => Some(SYNC_LINK),
            Self::Mobile | Self::Default => None,
        }
    }
}

#[cfg(test)]
#[path = "tests/normalizer_tests.rs"]
mod tests;
