use super::*;
use std::{collections::VecDeque, time::Duration};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use shared::{
    domain::{ClientId, DeviceId, SessionTokenId},
    protocol::AttachedClientDisconnectInput,
};
use tokio::sync::{Mutex, Notify};

use crate::{controller::DisconnectStage, MissingAttachedClientSource, StaticClientSource};

const WAIT: Duration = Duration::from_secs(5);

struct ScriptedGateway {
    outcomes: Mutex<VecDeque<Result<(), String>>>,
    calls: Mutex<Vec<AttachedClientDisconnectInput>>,
    called: Notify,
    release: Option<Notify>,
}

impl ScriptedGateway {
    fn new(outcomes: impl IntoIterator<Item = Result<(), String>>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into_iter().collect()),
            calls: Mutex::new(Vec::new()),
            called: Notify::new(),
            release: None,
        }
    }

    fn held(mut self) -> Self {
        self.release = Some(Notify::new());
        self
    }
}

#[async_trait]
impl DisconnectGateway for ScriptedGateway {
    async fn disconnect(&self, input: &AttachedClientDisconnectInput) -> Result<()> {
        self.calls.lock().await.push(input.clone());
        self.called.notify_one();
        if let Some(release) = &self.release {
            release.notified().await;
        }
        match self.outcomes.lock().await.pop_front() {
            Some(Ok(())) | None => Ok(()),
            Some(Err(message)) => Err(anyhow!(message)),
        }
    }
}

fn client(name: &str, millis: i64) -> AttachedClient {
    AttachedClient {
        name: name.to_string(),
        client_id: Some(ClientId::from(format!("{name}-client").as_str())),
        device_id: Some(DeviceId::from(format!("{name}-device").as_str())),
        session_token_id: Some(SessionTokenId::from(format!("{name}-session").as_str())),
        last_access_time: Utc.timestamp_millis_opt(millis).single(),
        ..AttachedClient::default()
    }
}

fn spawn_with(
    initial: Vec<AttachedClient>,
    gateway: Arc<dyn DisconnectGateway>,
) -> (RuntimeHandle, JoinHandle<()>) {
    ConnectedServicesRuntime::spawn(
        initial,
        Arc::new(MissingAttachedClientSource),
        gateway,
        ReasonRouting::default(),
    )
}

async fn wait_for_view(
    events: &mut broadcast::Receiver<ServicesEvent>,
    predicate: impl Fn(&ServicesView) -> bool,
) -> ServicesView {
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(ServicesEvent::ViewUpdated(view)) if predicate(&view) => return view,
                Ok(_) => continue,
                Err(err) => panic!("event stream failed: {err}"),
            }
        }
    })
    .await
    .expect("timed out waiting for view")
}

fn names(view: &ServicesView) -> Vec<String> {
    view.clients.iter().map(|c| c.name.clone()).collect()
}

#[tokio::test]
async fn confirmed_disconnect_removes_client_from_view() {
    let gateway = Arc::new(ScriptedGateway::new([Ok(())]));
    let target = client("clientX", 20);
    let (handle, _task) = spawn_with(vec![client("other", 10), target.clone()], gateway.clone());
    let mut events = handle.subscribe_events();

    assert_eq!(names(&handle.view().await), vec!["clientX", "other"]);

    handle.initiate(target.clone()).await.expect("initiate");
    handle.confirm().await.expect("confirm");

    let view = wait_for_view(&mut events, |view| view.disconnect.notice.is_some()).await;
    assert_eq!(view.disconnect.stage, DisconnectStage::Idle);
    assert_eq!(names(&view), vec!["other"]);
    assert_eq!(
        gateway.calls.lock().await.as_slice(),
        &[AttachedClientDisconnectInput::from(&target)]
    );
}

#[tokio::test]
async fn failed_disconnect_keeps_session_for_retry() {
    let gateway = Arc::new(ScriptedGateway::new([Err("server said no".to_string()), Ok(())]));
    let target = client("clientY", 20);
    let (handle, _task) = spawn_with(vec![target.clone()], gateway.clone());
    let mut events = handle.subscribe_events();

    handle.initiate(target.clone()).await.expect("initiate");
    handle
        .select_reason(DisconnectReason::Suspicious)
        .await
        .expect("reason");
    handle.confirm().await.expect("confirm");

    let view = wait_for_view(&mut events, |view| view.disconnect.error.is_some()).await;
    assert_eq!(view.disconnect.stage, DisconnectStage::Confirming);
    assert_eq!(view.disconnect.target.as_ref(), Some(&target));
    assert!(view
        .disconnect
        .error
        .as_ref()
        .is_some_and(|err| err.message.contains("server said no")));
    assert_eq!(names(&view), vec!["clientY"]);

    handle.confirm().await.expect("retry");
    let view = wait_for_view(&mut events, |view| view.disconnect.notice.is_some()).await;
    let notice = view.disconnect.notice.expect("notice");
    assert_eq!(notice.advice, Some(crate::DisconnectAdvice::SuspiciousDevice));
    assert!(view.clients.is_empty());
    assert_eq!(gateway.calls.lock().await.len(), 2);
}

#[tokio::test]
async fn second_initiate_is_reported_as_rejected() {
    let gateway = Arc::new(ScriptedGateway::new([]));
    let first = client("first", 20);
    let second = client("second", 10);
    let (handle, _task) = spawn_with(vec![first.clone(), second.clone()], gateway);
    let mut events = handle.subscribe_events();

    handle.initiate(first).await.expect("initiate");
    handle.initiate(second).await.expect("queue second");

    let rejection = tokio::time::timeout(WAIT, async {
        loop {
            if let Ok(ServicesEvent::Rejected { event, reason }) = events.recv().await {
                return (event, reason);
            }
        }
    })
    .await
    .expect("rejection");
    assert_eq!(rejection.0, "initiate");
    assert!(matches!(
        rejection.1,
        TransitionRejected::SessionActive { .. }
    ));
    assert_eq!(
        handle.view().await.disconnect.target.map(|t| t.name),
        Some("first".to_string())
    );
}

#[tokio::test]
async fn teardown_ignores_late_gateway_response() {
    let gateway = Arc::new(ScriptedGateway::new([Ok(())]).held());
    let target = client("slow", 10);
    let (handle, task) = spawn_with(vec![target.clone()], gateway.clone());

    handle.initiate(target).await.expect("initiate");
    handle.confirm().await.expect("confirm");
    tokio::time::timeout(WAIT, gateway.called.notified())
        .await
        .expect("gateway called");

    handle.teardown().await.expect("teardown");
    tokio::time::timeout(WAIT, task)
        .await
        .expect("runtime stops")
        .expect("runtime task");

    if let Some(release) = &gateway.release {
        release.notify_one();
    }
    tokio::task::yield_now().await;

    let view = handle.view().await;
    assert_eq!(view.disconnect.stage, DisconnectStage::Idle);
    assert!(view.disconnect.notice.is_none());
    assert_eq!(names(&view), vec!["slow"]);
    assert!(handle.confirm().await.is_err());
}

#[tokio::test]
async fn dropping_every_handle_stops_runtime() {
    let (handle, task) = spawn_with(Vec::new(), Arc::new(ScriptedGateway::new([])));
    drop(handle);

    tokio::time::timeout(WAIT, task)
        .await
        .expect("runtime stops")
        .expect("runtime task");
}

#[tokio::test]
async fn refresh_pulls_snapshot_from_source() {
    let mut phone = client("phone", 30);
    phone.device_type = Some("mobile".to_string());
    let source = StaticClientSource::new(vec![client("laptop", 10), phone]);
    let (handle, _task) = ConnectedServicesRuntime::spawn(
        Vec::new(),
        Arc::new(source),
        Arc::new(ScriptedGateway::new([])),
        ReasonRouting::default(),
    );
    let mut events = handle.subscribe_events();

    handle.refresh().await.expect("refresh");

    let view = wait_for_view(&mut events, |view| !view.clients.is_empty()).await;
    assert_eq!(names(&view), vec!["phone", "laptop"]);
    assert!(view.has_mobile_device);
}

#[tokio::test]
async fn refresh_failure_is_reported_without_touching_view() {
    let (handle, _task) = spawn_with(
        vec![client("kept", 10)],
        Arc::new(ScriptedGateway::new([])),
    );
    let mut events = handle.subscribe_events();

    handle.refresh().await.expect("refresh");

    let message = tokio::time::timeout(WAIT, async {
        loop {
            if let Ok(ServicesEvent::RefreshFailed(message)) = events.recv().await {
                return message;
            }
        }
    })
    .await
    .expect("refresh failure");
    assert!(message.contains("unavailable"));
    assert_eq!(names(&handle.view().await), vec!["kept"]);
}

#[tokio::test]
async fn replace_snapshot_renormalizes_working_set() {
    let (handle, _task) = spawn_with(Vec::new(), Arc::new(ScriptedGateway::new([])));
    let mut events = handle.subscribe_events();

    handle
        .replace_snapshot(vec![
            client("old", 1),
            AttachedClient {
                name: "no handles".to_string(),
                ..AttachedClient::default()
            },
            client("new", 2),
        ])
        .await
        .expect("replace");

    let view = wait_for_view(&mut events, |view| !view.clients.is_empty()).await;
    assert_eq!(names(&view), vec!["new", "old"]);
    assert!(!view.has_mobile_device);
}

/// Hands out one queued snapshot per fetch, each held until its gate opens.
struct GatedSource {
    fetches: Mutex<VecDeque<(Arc<Notify>, Vec<AttachedClient>)>>,
    called: Notify,
}

impl GatedSource {
    fn new(fetches: Vec<(Arc<Notify>, Vec<AttachedClient>)>) -> Self {
        Self {
            fetches: Mutex::new(fetches.into_iter().collect()),
            called: Notify::new(),
        }
    }
}

#[async_trait]
impl AttachedClientSource for GatedSource {
    async fn fetch_attached_clients(&self) -> Result<Vec<AttachedClient>> {
        let next = self.fetches.lock().await.pop_front();
        self.called.notify_one();
        let (gate, snapshot) = next.ok_or_else(|| anyhow!("no snapshot queued"))?;
        gate.notified().await;
        Ok(snapshot)
    }
}

async fn assert_no_view_within(
    events: &mut broadcast::Receiver<ServicesEvent>,
    predicate: impl Fn(&ServicesView) -> bool,
) {
    let seen = tokio::time::timeout(Duration::from_millis(300), async {
        loop {
            match events.recv().await {
                Ok(ServicesEvent::ViewUpdated(view)) if predicate(&view) => return view,
                Ok(_) => continue,
                Err(err) => panic!("event stream failed: {err}"),
            }
        }
    })
    .await;
    if let Ok(view) = seen {
        panic!("unexpected view {:?}", names(&view));
    }
}

#[tokio::test]
async fn refresh_issued_before_disconnect_cannot_restore_client() {
    let laptop = client("laptop", 20);
    let gate = Arc::new(Notify::new());
    let source = Arc::new(GatedSource::new(vec![(
        Arc::clone(&gate),
        vec![laptop.clone(), client("tablet", 10)],
    )]));
    let (handle, _task) = ConnectedServicesRuntime::spawn(
        vec![laptop.clone()],
        source.clone(),
        Arc::new(ScriptedGateway::new([Ok(())])),
        ReasonRouting::default(),
    );
    let mut events = handle.subscribe_events();

    handle.refresh().await.expect("refresh");
    tokio::time::timeout(WAIT, source.called.notified())
        .await
        .expect("source called");

    handle.initiate(laptop).await.expect("initiate");
    handle.confirm().await.expect("confirm");
    let view = wait_for_view(&mut events, |view| view.disconnect.notice.is_some()).await;
    assert!(view.clients.is_empty());

    gate.notify_one();
    let view = wait_for_view(&mut events, |view| {
        names(view).contains(&"tablet".to_string())
    })
    .await;
    assert_eq!(names(&view), vec!["tablet"]);
    assert_eq!(names(&handle.view().await), vec!["tablet"]);
}

#[tokio::test]
async fn refresh_issued_after_disconnect_reflects_server_state() {
    let laptop = client("laptop", 20);
    let gate = Arc::new(Notify::new());
    let source = Arc::new(GatedSource::new(vec![(
        Arc::clone(&gate),
        vec![laptop.clone()],
    )]));
    let (handle, _task) = ConnectedServicesRuntime::spawn(
        vec![laptop.clone()],
        source,
        Arc::new(ScriptedGateway::new([Ok(())])),
        ReasonRouting::default(),
    );
    let mut events = handle.subscribe_events();

    handle.initiate(laptop).await.expect("initiate");
    handle.confirm().await.expect("confirm");
    wait_for_view(&mut events, |view| view.disconnect.notice.is_some()).await;

    gate.notify_one();
    handle.refresh().await.expect("refresh");
    let view = wait_for_view(&mut events, |view| !view.clients.is_empty()).await;
    assert_eq!(names(&view), vec!["laptop"]);
}

#[tokio::test]
async fn overlapping_refreshes_keep_the_newest_snapshot() {
    let first_gate = Arc::new(Notify::new());
    let second_gate = Arc::new(Notify::new());
    let source = Arc::new(GatedSource::new(vec![
        (Arc::clone(&first_gate), vec![client("older", 10)]),
        (Arc::clone(&second_gate), vec![client("newer", 20)]),
    ]));
    let (handle, _task) = ConnectedServicesRuntime::spawn(
        Vec::new(),
        source.clone(),
        Arc::new(ScriptedGateway::new([])),
        ReasonRouting::default(),
    );
    let mut events = handle.subscribe_events();

    handle.refresh().await.expect("first refresh");
    tokio::time::timeout(WAIT, source.called.notified())
        .await
        .expect("first fetch");
    handle.refresh().await.expect("second refresh");
    tokio::time::timeout(WAIT, source.called.notified())
        .await
        .expect("second fetch");

    second_gate.notify_one();
    let view = wait_for_view(&mut events, |view| !view.clients.is_empty()).await;
    assert_eq!(names(&view), vec!["newer"]);

    first_gate.notify_one();
    assert_no_view_within(&mut events, |view| {
        names(view).contains(&"older".to_string())
    })
    .await;
    assert_eq!(names(&handle.view().await), vec!["newer"]);
}

#[tokio::test]
async fn replaced_snapshot_supersedes_pending_refresh() {
    let gate = Arc::new(Notify::new());
    let source = Arc::new(GatedSource::new(vec![(
        Arc::clone(&gate),
        vec![client("fetched", 10)],
    )]));
    let (handle, _task) = ConnectedServicesRuntime::spawn(
        Vec::new(),
        source.clone(),
        Arc::new(ScriptedGateway::new([])),
        ReasonRouting::default(),
    );
    let mut events = handle.subscribe_events();

    handle.refresh().await.expect("refresh");
    tokio::time::timeout(WAIT, source.called.notified())
        .await
        .expect("fetch started");
    handle
        .replace_snapshot(vec![client("pushed", 20)])
        .await
        .expect("replace");
    let view = wait_for_view(&mut events, |view| !view.clients.is_empty()).await;
    assert_eq!(names(&view), vec!["pushed"]);

    gate.notify_one();
    assert_no_view_within(&mut events, |view| {
        names(view).contains(&"fetched".to_string())
    })
    .await;
    assert_eq!(names(&handle.view().await), vec!["pushed"]);
}
