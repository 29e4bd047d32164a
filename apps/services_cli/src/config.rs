use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context};
use url::Url;

pub const DEFAULT_CONFIG_FILE: &str = "connected-services.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub graphql_url: String,
    pub session_token: Option<String>,
    pub request_timeout_secs: u64,
    pub log_filter: String,
    pub snapshot_path: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            graphql_url: "http://127.0.0.1:8080/graphql".into(),
            session_token: None,
            request_timeout_secs: 30,
            log_filter: "info".into(),
            snapshot_path: None,
        }
    }
}

/// Defaults, then the config file, then the environment. An explicitly named
/// config file must exist; the default one is optional.
pub fn load_settings(config_path: Option<&Path>) -> anyhow::Result<Settings> {
    let mut settings = Settings::default();

    let (path, required) = match config_path {
        Some(path) => (path.to_path_buf(), true),
        None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
    };
    match fs::read_to_string(&path) {
        Ok(raw) => apply_file(&mut settings, &raw)
            .with_context(|| format!("invalid config file '{}'", path.display()))?,
        Err(err) if required => {
            return Err(err).with_context(|| format!("failed to read config '{}'", path.display()));
        }
        Err(_) => {}
    }

    apply_env(&mut settings, |key| std::env::var(key).ok());
    Ok(settings)
}

fn apply_file(settings: &mut Settings, raw: &str) -> anyhow::Result<()> {
    let file_cfg = toml::from_str::<HashMap<String, toml::Value>>(raw)?;

    if let Some(v) = string_value(&file_cfg, "graphql_url") {
        settings.graphql_url = v;
    }
    if let Some(v) = string_value(&file_cfg, "session_token") {
        settings.session_token = Some(v);
    }
    if let Some(v) = file_cfg.get("request_timeout_secs") {
        settings.request_timeout_secs = match v {
            toml::Value::Integer(secs) if *secs > 0 => *secs as u64,
            other => {
                return Err(anyhow!(
                    "request_timeout_secs must be a positive integer, got {other}"
                ))
            }
        };
    }
    if let Some(v) = string_value(&file_cfg, "log_filter") {
        settings.log_filter = v;
    }
    if let Some(v) = string_value(&file_cfg, "snapshot_path") {
        settings.snapshot_path = Some(PathBuf::from(v));
    }

    Ok(())
}

fn string_value(file_cfg: &HashMap<String, toml::Value>, key: &str) -> Option<String> {
    file_cfg
        .get(key)
        .and_then(toml::Value::as_str)
        .map(str::to_string)
}

fn apply_env(settings: &mut Settings, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("GRAPHQL_URL") {
        settings.graphql_url = v;
    }
    if let Some(v) = var("APP__GRAPHQL_URL") {
        settings.graphql_url = v;
    }

    if let Some(v) = var("FXA_SESSION_TOKEN") {
        settings.session_token = Some(v);
    }
    if let Some(v) = var("APP__SESSION_TOKEN") {
        settings.session_token = Some(v);
    }

    if let Some(v) = var("APP__REQUEST_TIMEOUT_SECS") {
        if let Ok(parsed) = v.parse::<u64>() {
            if parsed > 0 {
                settings.request_timeout_secs = parsed;
            }
        }
    }

    if let Some(v) = var("RUST_LOG") {
        settings.log_filter = v;
    }
    if let Some(v) = var("APP__LOG_FILTER") {
        settings.log_filter = v;
    }

    if let Some(v) = var("APP__SNAPSHOT_PATH") {
        settings.snapshot_path = Some(PathBuf::from(v));
    }
}

/// Accepts `host:port`, a bare origin or a full endpoint URL. Origins without a
/// path get `/graphql`.
pub fn prepare_graphql_url(raw: &str) -> anyhow::Result<Url> {
    let raw = raw.trim();
    let raw = if raw.is_empty() {
        Settings::default().graphql_url
    } else if raw.contains("://") {
        raw.to_string()
    } else {
        format!("http://{raw}")
    };

    let mut url = Url::parse(&raw).with_context(|| format!("invalid graphql url '{raw}'"))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(anyhow!(
            "graphql url must use http:// or https://, got '{raw}'"
        ));
    }
    if url.path().is_empty() || url.path() == "/" {
        url.set_path("/graphql");
    }
    Ok(url)
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
