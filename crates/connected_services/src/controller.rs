//! Single-flight state machine behind the "sign out of a connected service" flow.
//!
//! The controller never performs I/O. Each accepted event returns the effects the
//! caller must run; the only external effect is [`ControllerEffect::CallGateway`],
//! whose result comes back as [`ControllerEvent::GatewayResolved`].

use std::{collections::HashSet, fmt, sync::Arc};

use shared::{
    domain::{AttachedClient, ClientIdentity, DisconnectReason},
    protocol::AttachedClientDisconnectInput,
};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DisconnectStage {
    #[default]
    Idle,
    Confirming,
    SurveyReasonSelection,
    Finalizing,
}

impl DisconnectStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Confirming => "confirming",
            Self::SurveyReasonSelection => "survey_reason_selection",
            Self::Finalizing => "finalizing",
        }
    }
}

impl fmt::Display for DisconnectStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies one gateway call. Responses carrying any other ticket are stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DisconnectTicket {
    pub session_id: Uuid,
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct DisconnectFailure {
    pub message: String,
}

impl DisconnectFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectSession {
    id: Uuid,
    target: AttachedClient,
    reason: DisconnectReason,
    attempt: u32,
    error: Option<DisconnectFailure>,
}

impl DisconnectSession {
    fn new(target: AttachedClient) -> Self {
        Self {
            id: Uuid::new_v4(),
            target,
            reason: DisconnectReason::NoneSelected,
            attempt: 0,
            error: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn target(&self) -> &AttachedClient {
        &self.target
    }

    pub fn reason(&self) -> DisconnectReason {
        self.reason
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn error(&self) -> Option<&DisconnectFailure> {
        self.error.as_ref()
    }

    fn ticket(&self) -> DisconnectTicket {
        DisconnectTicket {
            session_id: self.id,
            attempt: self.attempt,
        }
    }
}

/// Informational panel shown after a successful disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectAdvice {
    LostDevice,
    SuspiciousDevice,
}

impl DisconnectAdvice {
    pub fn for_reason(reason: DisconnectReason) -> Option<Self> {
        match reason {
            DisconnectReason::LostOrStolen => Some(Self::LostDevice),
            DisconnectReason::Suspicious => Some(Self::SuspiciousDevice),
            _ => None,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            Self::LostDevice => {
                "Since your device was lost or stolen, change your account password \
                 to keep your information safe. Check with your device manufacturer \
                 about erasing your data remotely."
            }
            Self::SuspiciousDevice => {
                "If the device really is suspicious, change your account password \
                 to keep your information safe. Review your other connected \
                 services for anything you don't recognize."
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedDisconnect {
    pub session_id: Uuid,
    pub target: AttachedClient,
    pub reason: DisconnectReason,
    pub advice: Option<DisconnectAdvice>,
}

/// Which reasons detour through the survey stage before confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReasonRouting {
    survey: HashSet<DisconnectReason>,
}

impl ReasonRouting {
    pub fn new(survey: impl IntoIterator<Item = DisconnectReason>) -> Self {
        Self {
            survey: survey
                .into_iter()
                .filter(|reason| *reason != DisconnectReason::NoneSelected)
                .collect(),
        }
    }

    pub fn routes_to_survey(&self, reason: DisconnectReason) -> bool {
        self.survey.contains(&reason)
    }
}

impl Default for ReasonRouting {
    fn default() -> Self {
        Self::new([DisconnectReason::LostOrStolen, DisconnectReason::Suspicious])
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerEvent {
    Initiate(AttachedClient),
    Cancel,
    SelectReason(DisconnectReason),
    Confirm,
    GatewayResolved {
        ticket: DisconnectTicket,
        outcome: Result<(), DisconnectFailure>,
    },
    DismissNotice,
    Teardown,
}

impl ControllerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Initiate(_) => "initiate",
            Self::Cancel => "cancel",
            Self::SelectReason(_) => "select_reason",
            Self::Confirm => "confirm",
            Self::GatewayResolved { .. } => "gateway_resolved",
            Self::DismissNotice => "dismiss_notice",
            Self::Teardown => "teardown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerEffect {
    CallGateway {
        ticket: DisconnectTicket,
        input: AttachedClientDisconnectInput,
    },
    RemoveClient(ClientIdentity),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionRejected {
    #[error("a disconnect session is already active (stage {stage})")]
    SessionActive { stage: DisconnectStage },
    #[error("no disconnect session is active")]
    NoSession,
    #[error("{event} is not accepted while {stage}")]
    InvalidInStage {
        event: &'static str,
        stage: DisconnectStage,
    },
    #[error("client '{name}' carries no revocation handle")]
    UnaddressableTarget { name: String },
    #[error("stale gateway response for session {session_id} attempt {attempt}")]
    StaleResponse { session_id: Uuid, attempt: u32 },
    #[error("no completion notice to dismiss")]
    NothingToDismiss,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionRecord {
    pub event: &'static str,
    pub session_id: Option<Uuid>,
    pub from: DisconnectStage,
    pub to: DisconnectStage,
    pub reason: Option<DisconnectReason>,
}

/// Notified after every applied transition. Implementations must not feed
/// events back into the controller.
pub trait TransitionObserver: Send + Sync {
    fn on_transition(&self, record: &TransitionRecord);
}

/// Read-only projection of the controller for rendering.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DisconnectView {
    pub stage: DisconnectStage,
    pub target: Option<AttachedClient>,
    pub reason: Option<DisconnectReason>,
    pub error: Option<DisconnectFailure>,
    pub notice: Option<CompletedDisconnect>,
}

#[derive(Default)]
pub struct DisconnectController {
    stage: DisconnectStage,
    session: Option<DisconnectSession>,
    notice: Option<CompletedDisconnect>,
    routing: ReasonRouting,
    observers: Vec<Arc<dyn TransitionObserver>>,
}

impl DisconnectController {
    pub fn new(routing: ReasonRouting) -> Self {
        Self {
            routing,
            ..Self::default()
        }
    }

    pub fn observe(&mut self, observer: Arc<dyn TransitionObserver>) {
        self.observers.push(observer);
    }

    pub fn stage(&self) -> DisconnectStage {
        self.stage
    }

    pub fn session(&self) -> Option<&DisconnectSession> {
        self.session.as_ref()
    }

    pub fn notice(&self) -> Option<&CompletedDisconnect> {
        self.notice.as_ref()
    }

    pub fn routing(&self) -> &ReasonRouting {
        &self.routing
    }

    pub fn view(&self) -> DisconnectView {
        DisconnectView {
            stage: self.stage,
            target: self.session.as_ref().map(|s| s.target.clone()),
            reason: self.session.as_ref().map(|s| s.reason),
            error: self.session.as_ref().and_then(|s| s.error.clone()),
            notice: self.notice.clone(),
        }
    }

    pub fn handle(
        &mut self,
        event: ControllerEvent,
    ) -> Result<Vec<ControllerEffect>, TransitionRejected> {
        let event_name = event.name();
        let from = self.stage;
        let before = self.session.as_ref().map(|s| (s.id, s.reason));

        let result = match event {
            ControllerEvent::Initiate(client) => self.initiate(client),
            ControllerEvent::Cancel => self.cancel(),
            ControllerEvent::SelectReason(reason) => self.select_reason(reason),
            ControllerEvent::Confirm => self.confirm(),
            ControllerEvent::GatewayResolved { ticket, outcome } => self.resolve(ticket, outcome),
            ControllerEvent::DismissNotice => self.dismiss_notice(),
            ControllerEvent::Teardown => Ok(self.teardown()),
        };

        match &result {
            Ok(_) => {
                let after = self.session.as_ref().map(|s| (s.id, s.reason));
                let (session_id, reason) = match after.or(before) {
                    Some((id, reason)) => (Some(id), Some(reason)),
                    None => (None, None),
                };
                let record = TransitionRecord {
                    event: event_name,
                    session_id,
                    from,
                    to: self.stage,
                    reason,
                };
                info!(
                    "disconnect: transition event={} from={} to={} session={}",
                    event_name,
                    from,
                    self.stage,
                    session_id.map(|id| id.to_string()).unwrap_or_default()
                );
                for observer in &self.observers {
                    observer.on_transition(&record);
                }
            }
            Err(rejected) => {
                debug!("disconnect: ignored event={event_name} stage={from}: {rejected}");
            }
        }

        result
    }

    fn initiate(
        &mut self,
        client: AttachedClient,
    ) -> Result<Vec<ControllerEffect>, TransitionRejected> {
        if self.stage != DisconnectStage::Idle {
            return Err(TransitionRejected::SessionActive { stage: self.stage });
        }
        if !client.has_identity() {
            return Err(TransitionRejected::UnaddressableTarget { name: client.name });
        }

        self.notice = None;
        self.session = Some(DisconnectSession::new(client));
        self.stage = DisconnectStage::Confirming;
        Ok(Vec::new())
    }

    fn cancel(&mut self) -> Result<Vec<ControllerEffect>, TransitionRejected> {
        match self.stage {
            DisconnectStage::Confirming | DisconnectStage::SurveyReasonSelection => {
                self.session = None;
                self.stage = DisconnectStage::Idle;
                Ok(Vec::new())
            }
            DisconnectStage::Idle => Err(TransitionRejected::NoSession),
            DisconnectStage::Finalizing => Err(TransitionRejected::InvalidInStage {
                event: "cancel",
                stage: self.stage,
            }),
        }
    }

    fn select_reason(
        &mut self,
        reason: DisconnectReason,
    ) -> Result<Vec<ControllerEffect>, TransitionRejected> {
        match self.stage {
            DisconnectStage::Confirming | DisconnectStage::SurveyReasonSelection => {
                let session = self.session.as_mut().ok_or(TransitionRejected::NoSession)?;
                session.reason = reason;
                self.stage = if self.routing.routes_to_survey(reason) {
                    DisconnectStage::SurveyReasonSelection
                } else {
                    DisconnectStage::Confirming
                };
                Ok(Vec::new())
            }
            DisconnectStage::Idle => Err(TransitionRejected::NoSession),
            DisconnectStage::Finalizing => Err(TransitionRejected::InvalidInStage {
                event: "select_reason",
                stage: self.stage,
            }),
        }
    }

    fn confirm(&mut self) -> Result<Vec<ControllerEffect>, TransitionRejected> {
        match self.stage {
            DisconnectStage::Confirming | DisconnectStage::SurveyReasonSelection => {
                let session = self.session.as_mut().ok_or(TransitionRejected::NoSession)?;
                session.attempt += 1;
                session.error = None;
                let effect = ControllerEffect::CallGateway {
                    ticket: session.ticket(),
                    input: AttachedClientDisconnectInput::from(&session.target),
                };
                self.stage = DisconnectStage::Finalizing;
                Ok(vec![effect])
            }
            DisconnectStage::Idle => Err(TransitionRejected::NoSession),
            DisconnectStage::Finalizing => Err(TransitionRejected::InvalidInStage {
                event: "confirm",
                stage: self.stage,
            }),
        }
    }

    fn resolve(
        &mut self,
        ticket: DisconnectTicket,
        outcome: Result<(), DisconnectFailure>,
    ) -> Result<Vec<ControllerEffect>, TransitionRejected> {
        let current = self
            .session
            .as_ref()
            .filter(|_| self.stage == DisconnectStage::Finalizing)
            .map(DisconnectSession::ticket);
        if current != Some(ticket) {
            return Err(TransitionRejected::StaleResponse {
                session_id: ticket.session_id,
                attempt: ticket.attempt,
            });
        }

        match outcome {
            Ok(()) => {
                let session = self.session.take().ok_or(TransitionRejected::NoSession)?;
                let identity = session.target.identity();
                self.notice = Some(CompletedDisconnect {
                    session_id: session.id,
                    advice: DisconnectAdvice::for_reason(session.reason),
                    reason: session.reason,
                    target: session.target,
                });
                self.stage = DisconnectStage::Idle;
                Ok(vec![ControllerEffect::RemoveClient(identity)])
            }
            Err(failure) => {
                let session = self.session.as_mut().ok_or(TransitionRejected::NoSession)?;
                session.error = Some(failure);
                self.stage = DisconnectStage::Confirming;
                Ok(Vec::new())
            }
        }
    }

    fn dismiss_notice(&mut self) -> Result<Vec<ControllerEffect>, TransitionRejected> {
        match self.notice.take() {
            Some(_) => Ok(Vec::new()),
            None => Err(TransitionRejected::NothingToDismiss),
        }
    }

    fn teardown(&mut self) -> Vec<ControllerEffect> {
        self.session = None;
        self.notice = None;
        self.stage = DisconnectStage::Idle;
        Vec::new()
    }
}

#[cfg(test)]
#[path = "tests/controller_tests.rs"]
mod tests;
