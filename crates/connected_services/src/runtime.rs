//! Event-queue driver for the connected services page.
//!
//! One task owns the working set and the [`DisconnectController`]. Presentation
//! events arrive through [`RuntimeHandle`]; gateway and source calls run on
//! spawned tasks and re-enter through an internal queue, so every state change
//! happens on the runtime task. Once the runtime stops, outstanding responses
//! have nowhere to land and are dropped.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use shared::domain::{AttachedClient, ClientIdentity, DisconnectReason};
use tokio::{
    sync::{broadcast, mpsc, RwLock},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    controller::{
        ControllerEffect, ControllerEvent, DisconnectController, DisconnectFailure, DisconnectTicket,
        DisconnectView, ReasonRouting, TransitionObserver, TransitionRecord, TransitionRejected,
    },
    services::ConnectedServices,
    AttachedClientSource, DisconnectGateway,
};

const COMMAND_QUEUE_CAPACITY: usize = 64;
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServicesView {
    pub clients: Vec<AttachedClient>,
    pub has_mobile_device: bool,
    pub disconnect: DisconnectView,
}

#[derive(Debug, Clone)]
pub enum ServicesEvent {
    ViewUpdated(ServicesView),
    Transitioned(TransitionRecord),
    Rejected {
        event: &'static str,
        reason: TransitionRejected,
    },
    RefreshFailed(String),
}

enum RuntimeCommand {
    Controller(ControllerEvent),
    Refresh,
    ReplaceSnapshot(Vec<AttachedClient>),
    Teardown,
}

enum InternalEvent {
    GatewayResolved {
        ticket: DisconnectTicket,
        outcome: Result<(), DisconnectFailure>,
    },
    SnapshotFetched {
        generation: u64,
        result: Result<Vec<AttachedClient>, String>,
    },
}

struct BroadcastObserver {
    events: broadcast::Sender<ServicesEvent>,
}

impl TransitionObserver for BroadcastObserver {
    fn on_transition(&self, record: &TransitionRecord) {
        let _ = self.events.send(ServicesEvent::Transitioned(record.clone()));
    }
}

#[derive(Clone)]
pub struct RuntimeHandle {
    commands: mpsc::Sender<RuntimeCommand>,
    view: Arc<RwLock<ServicesView>>,
    events: broadcast::Sender<ServicesEvent>,
}

impl RuntimeHandle {
    pub async fn initiate(&self, client: AttachedClient) -> Result<()> {
        self.controller(ControllerEvent::Initiate(client)).await
    }

    pub async fn cancel(&self) -> Result<()> {
        self.controller(ControllerEvent::Cancel).await
    }

    pub async fn select_reason(&self, reason: DisconnectReason) -> Result<()> {
        self.controller(ControllerEvent::SelectReason(reason)).await
    }

    pub async fn confirm(&self) -> Result<()> {
        self.controller(ControllerEvent::Confirm).await
    }

    pub async fn dismiss_notice(&self) -> Result<()> {
        self.controller(ControllerEvent::DismissNotice).await
    }

    /// Re-fetches the snapshot from the configured source.
    pub async fn refresh(&self) -> Result<()> {
        self.send(RuntimeCommand::Refresh).await
    }

    pub async fn replace_snapshot(&self, snapshot: Vec<AttachedClient>) -> Result<()> {
        self.send(RuntimeCommand::ReplaceSnapshot(snapshot)).await
    }

    /// Releases any pending session and stops the runtime.
    pub async fn teardown(&self) -> Result<()> {
        self.send(RuntimeCommand::Teardown).await
    }

    pub async fn view(&self) -> ServicesView {
        self.view.read().await.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ServicesEvent> {
        self.events.subscribe()
    }

    async fn controller(&self, event: ControllerEvent) -> Result<()> {
        self.send(RuntimeCommand::Controller(event)).await
    }

    async fn send(&self, command: RuntimeCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| anyhow!("connected services runtime has stopped"))
    }
}

pub struct ConnectedServicesRuntime {
    services: ConnectedServices,
    controller: DisconnectController,
    source: Arc<dyn AttachedClientSource>,
    gateway: Arc<dyn DisconnectGateway>,
    view: Arc<RwLock<ServicesView>>,
    events: broadcast::Sender<ServicesEvent>,
    internal: mpsc::UnboundedSender<InternalEvent>,
    /// Last snapshot generation handed out, by `refresh` or `replace_snapshot`.
    issued_generation: u64,
    applied_generation: u64,
    /// Identities removed after a disconnect, tagged with the generation that
    /// was current at removal. Snapshots of that generation or older predate
    /// the removal and must not bring the client back.
    removed: Vec<(u64, ClientIdentity)>,
}

impl ConnectedServicesRuntime {
    pub fn spawn(
        initial: Vec<AttachedClient>,
        source: Arc<dyn AttachedClientSource>,
        gateway: Arc<dyn DisconnectGateway>,
        routing: ReasonRouting,
    ) -> (RuntimeHandle, JoinHandle<()>) {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let services = ConnectedServices::from_snapshot(&initial);
        let mut controller = DisconnectController::new(routing);
        controller.observe(Arc::new(BroadcastObserver {
            events: events.clone(),
        }));
        let view = Arc::new(RwLock::new(Self::project(&services, &controller)));

        let runtime = Self {
            services,
            controller,
            source,
            gateway,
            view: Arc::clone(&view),
            events: events.clone(),
            internal: internal_tx,
            issued_generation: 0,
            applied_generation: 0,
            removed: Vec::new(),
        };
        let task = tokio::spawn(runtime.run(commands_rx, internal_rx));

        (
            RuntimeHandle {
                commands: commands_tx,
                view,
                events,
            },
            task,
        )
    }

    fn project(services: &ConnectedServices, controller: &DisconnectController) -> ServicesView {
        ServicesView {
            clients: services.clients().to_vec(),
            has_mobile_device: services.has_mobile_device(),
            disconnect: controller.view(),
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<RuntimeCommand>,
        mut internal: mpsc::UnboundedReceiver<InternalEvent>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(RuntimeCommand::Controller(event)) => self.dispatch(event).await,
                    Some(RuntimeCommand::Refresh) => self.spawn_refresh(),
                    Some(RuntimeCommand::ReplaceSnapshot(snapshot)) => {
                        self.issued_generation += 1;
                        self.apply_snapshot(self.issued_generation, snapshot).await;
                    }
                    Some(RuntimeCommand::Teardown) | None => break,
                },
                Some(event) = internal.recv() => match event {
                    InternalEvent::GatewayResolved { ticket, outcome } => {
                        self.dispatch(ControllerEvent::GatewayResolved { ticket, outcome })
                            .await;
                    }
                    InternalEvent::SnapshotFetched { generation, result: Ok(snapshot) } => {
                        self.apply_snapshot(generation, snapshot).await;
                    }
                    InternalEvent::SnapshotFetched { result: Err(message), .. } => {
                        warn!("connected services: refresh failed: {message}");
                        let _ = self.events.send(ServicesEvent::RefreshFailed(message));
                    }
                },
            }
        }

        self.dispatch(ControllerEvent::Teardown).await;
        info!("connected services: runtime stopped");
    }

    async fn dispatch(&mut self, event: ControllerEvent) {
        let event_name = event.name();
        match self.controller.handle(event) {
            Ok(effects) => {
                for effect in effects {
                    self.apply_effect(effect);
                }
                self.publish_view().await;
            }
            Err(reason) => {
                let _ = self.events.send(ServicesEvent::Rejected {
                    event: event_name,
                    reason,
                });
            }
        }
    }

    fn apply_effect(&mut self, effect: ControllerEffect) {
        match effect {
            ControllerEffect::CallGateway { ticket, input } => {
                let gateway = Arc::clone(&self.gateway);
                let internal = self.internal.clone();
                debug!(
                    "disconnect: calling gateway session={} attempt={}",
                    ticket.session_id, ticket.attempt
                );
                tokio::spawn(async move {
                    let outcome = gateway.disconnect(&input).await.map_err(|err| {
                        warn!(
                            "disconnect: gateway failed session={} attempt={}: {err:#}",
                            ticket.session_id, ticket.attempt
                        );
                        DisconnectFailure::new(err.to_string())
                    });
                    let _ = internal.send(InternalEvent::GatewayResolved { ticket, outcome });
                });
            }
            ControllerEffect::RemoveClient(identity) => {
                if self.services.remove(&identity) {
                    info!("disconnect: removed client {identity}");
                } else {
                    debug!("disconnect: client {identity} already absent from working set");
                }
                self.removed.push((self.issued_generation, identity));
            }
        }
    }

    fn spawn_refresh(&mut self) {
        self.issued_generation += 1;
        let generation = self.issued_generation;
        let source = Arc::clone(&self.source);
        let internal = self.internal.clone();
        tokio::spawn(async move {
            let result = source
                .fetch_attached_clients()
                .await
                .map_err(|err| format!("{err:#}"));
            let _ = internal.send(InternalEvent::SnapshotFetched { generation, result });
        });
    }

    async fn apply_snapshot(&mut self, generation: u64, mut snapshot: Vec<AttachedClient>) {
        if generation <= self.applied_generation {
            debug!(
                "connected services: dropped stale snapshot generation={generation} applied={}",
                self.applied_generation
            );
            return;
        }

        let raw = snapshot.len();
        snapshot.retain(|client| {
            let identity = client.identity();
            !self
                .removed
                .iter()
                .any(|(after, removed)| generation <= *after && *removed == identity)
        });
        if snapshot.len() != raw {
            debug!(
                "connected services: filtered {} disconnected client(s) from generation={generation}",
                raw - snapshot.len()
            );
        }

        self.applied_generation = generation;
        self.removed.retain(|(after, _)| *after > generation);
        self.services.replace_snapshot(&snapshot);
        debug!(
            "connected services: snapshot applied generation={generation} raw={raw} shown={}",
            self.services.len()
        );
        self.publish_view().await;
    }

    async fn publish_view(&self) {
        let view = Self::project(&self.services, &self.controller);
        *self.view.write().await = view.clone();
        let _ = self.events.send(ServicesEvent::ViewUpdated(view));
    }
}

#[cfg(test)]
#[path = "tests/runtime_tests.rs"]
mod tests;
