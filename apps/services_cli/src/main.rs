use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use connected_services::{
    classify, has_mobile_device, normalize, AttachedClientSource, CompletedDisconnect,
    ConnectedServices, ConnectedServicesRuntime, DisconnectGateway, DisconnectStage,
    GraphqlAccountClient, MissingAttachedClientSource, ReasonRouting, ServiceBrand, ServicesEvent,
    StaticClientSource,
};
use futures::StreamExt;
use shared::domain::{AttachedClient, DisconnectReason};
use tokio_stream::wrappers::BroadcastStream;

mod config;

use config::{load_settings, prepare_graphql_url, Settings};

/// Extra time the CLI waits past the HTTP timeout so transport errors surface
/// before the outer deadline.
const DISCONNECT_WAIT_HEADROOM: Duration = Duration::from_secs(5);

const MOBILE_PROMO: &str =
    "Connect a mobile device: get Firefox on your phone and sign in to sync everywhere.";

#[derive(Parser, Debug)]
#[command(name = "connected-services", about = "Inspect and sign out of connected services")]
struct Cli {
    /// Config file, defaults to ./connected-services.toml when present.
    #[arg(long)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the normalized client list.
    List {
        /// Read clients from a JSON snapshot instead of the account server.
        #[arg(long)]
        snapshot: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Sign out of one service, selected by handle or exact name.
    Disconnect {
        selector: String,
        #[arg(long, default_value = "none-selected")]
        reason: DisconnectReason,
        #[arg(long)]
        snapshot: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load_settings(cli.config.as_deref())?;
    tracing_subscriber::fmt()
        .with_env_filter(settings.log_filter.as_str())
        .init();

    match cli.command {
        Command::List { snapshot, json } => {
            let clients = load_snapshot(&settings, snapshot).await?;
            let shown = normalize(&clients);
            if json {
                println!("{}", serde_json::to_string_pretty(&shown)?);
                return Ok(());
            }
            if shown.is_empty() {
                println!("No connected services.");
            }
            for client in &shown {
                println!("{}", format_row(client));
            }
            if !has_mobile_device(&shown) {
                println!("{MOBILE_PROMO}");
            }
        }
        Command::Disconnect {
            selector,
            reason,
            snapshot,
        } => {
            let clients = load_snapshot(&settings, snapshot).await?;
            let gateway = Arc::new(build_account_client(&settings)?);
            let completed = run_disconnect(
                clients,
                gateway,
                &selector,
                reason,
                disconnect_wait(&settings),
            )
            .await?;
            println!("Signed out of {}.", display_name(&completed.target));
            if let Some(advice) = completed.advice {
                println!("{}", advice.message());
            }
        }
    }

    Ok(())
}

fn build_account_client(settings: &Settings) -> Result<GraphqlAccountClient> {
    let endpoint = prepare_graphql_url(&settings.graphql_url)?;
    GraphqlAccountClient::with_timeout(
        endpoint,
        settings.session_token.clone(),
        Duration::from_secs(settings.request_timeout_secs),
    )
}

fn disconnect_wait(settings: &Settings) -> Duration {
    Duration::from_secs(settings.request_timeout_secs) + DISCONNECT_WAIT_HEADROOM
}

async fn load_snapshot(settings: &Settings, flag: Option<PathBuf>) -> Result<Vec<AttachedClient>> {
    match flag.or_else(|| settings.snapshot_path.clone()) {
        Some(path) => StaticClientSource::load(&path)?.fetch_attached_clients().await,
        None => build_account_client(settings)?
            .fetch_attached_clients()
            .await
            .context("failed to fetch attached clients"),
    }
}

/// Drives one disconnect through the runtime: confirm, then wait for the
/// completion notice or a failure.
async fn run_disconnect(
    clients: Vec<AttachedClient>,
    gateway: Arc<dyn DisconnectGateway>,
    selector: &str,
    reason: DisconnectReason,
    wait: Duration,
) -> Result<CompletedDisconnect> {
    let target = ConnectedServices::from_snapshot(&clients)
        .select(selector)
        .cloned()
        .ok_or_else(|| anyhow!("no connected service matches '{selector}'"))?;

    let (handle, task) = ConnectedServicesRuntime::spawn(
        clients,
        Arc::new(MissingAttachedClientSource),
        gateway,
        ReasonRouting::default(),
    );
    let mut events = BroadcastStream::new(handle.subscribe_events());

    handle.initiate(target).await?;
    if reason != DisconnectReason::NoneSelected {
        handle.select_reason(reason).await?;
    }
    handle.confirm().await?;

    let outcome = tokio::time::timeout(wait, async {
        while let Some(event) = events.next().await {
            match event {
                Ok(ServicesEvent::ViewUpdated(view)) => {
                    if let Some(notice) = view.disconnect.notice {
                        return Ok(notice);
                    }
                    if view.disconnect.stage == DisconnectStage::Confirming {
                        if let Some(failure) = view.disconnect.error {
                            return Err(anyhow!("disconnect failed: {}", failure.message));
                        }
                    }
                }
                Ok(ServicesEvent::Rejected { event, reason }) => {
                    return Err(anyhow!("disconnect {event} rejected: {reason}"));
                }
                Ok(_) => {}
                Err(err) => tracing::debug!("disconnect: event stream lagged: {err}"),
            }
        }
        Err(anyhow!("connected services runtime stopped before completion"))
    })
    .await
    .map_err(|_| anyhow!("timed out waiting for disconnect after {}s", wait.as_secs()));

    let _ = handle.teardown().await;
    let _ = task.await;
    outcome?
}

fn display_name(client: &AttachedClient) -> &str {
    let name = client.name.trim();
    if name.is_empty() {
        "unnamed service"
    } else {
        name
    }
}

fn format_last_access(last_access: Option<DateTime<Utc>>) -> String {
    last_access
        .map(|at| at.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| "never".to_string())
}

fn format_row(client: &AttachedClient) -> String {
    let marker = if client.is_current_session { "*" } else { " " };
    let mut row = format!(
        "{marker} {:<32} {:<8} {}",
        display_name(client),
        classify(client).label(),
        format_last_access(client.last_access_time)
    );
    if let Some(link) = ServiceBrand::for_client(client).link() {
        row.push_str("  ");
        row.push_str(link);
    }
    row
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
