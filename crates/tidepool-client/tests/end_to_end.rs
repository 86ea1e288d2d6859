use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tidepool_client::{
    ConnectionState, EndReason, Endpoint, EndpointConfig, EndpointEvent, EngineError, EngineEvent,
    EngineEvents, EngineFactory, LinkState, NegotiationEngine, Phase, ReconnectPolicy, SdpKind,
    SessionDescription,
};
use tidepool_proto::IceCandidate;
use tidepool_relay::{config::RelayConfig, AppState};
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{sleep, timeout, Instant};

/// Records what each engine was asked to do, per endpoint.
#[derive(Default)]
struct Script {
    calls: Mutex<Vec<String>>,
}

impl Script {
    fn log(&self, entry: String) {
        self.calls.lock().push(entry);
    }

    fn saw(&self, prefix: &str) -> bool {
        self.calls.lock().iter().any(|call| call.starts_with(prefix))
    }
}

/// Pretends ICE completes as soon as both descriptions are in place.
struct ScriptedEngine {
    name: String,
    script: Arc<Script>,
    events: EngineEvents,
}

impl ScriptedEngine {
    fn come_up(&self) {
        self.events.emit(EngineEvent::LocalCandidate(IceCandidate::new(
            format!("candidate:{} 1 udp 2122260223 10.0.0.1 50000 typ host", self.name),
            Some("0".into()),
            Some(0),
        )));
        self.events
            .emit(EngineEvent::ConnectionState(ConnectionState::Connected));
    }
}

#[async_trait]
impl NegotiationEngine for ScriptedEngine {
    async fn create_offer(&self) -> Result<SessionDescription, EngineError> {
        Ok(SessionDescription::offer(format!("offer from {}", self.name)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        Ok(SessionDescription::answer(format!("answer from {}", self.name)))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), EngineError> {
        self.script.log(format!("set_local:{}", description.sdp));
        if description.kind == SdpKind::Answer {
            self.come_up();
        }
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), EngineError> {
        self.script.log(format!("set_remote:{}", description.sdp));
        if description.kind == SdpKind::Answer {
            self.come_up();
        }
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        self.script.log(format!("add_candidate:{}", candidate.candidate));
        Ok(())
    }

    async fn close(&self) {
        self.script.log("close".into());
    }
}

struct ScriptedFactory {
    name: String,
    script: Arc<Script>,
}

#[async_trait]
impl EngineFactory for ScriptedFactory {
    async fn create(
        &self,
        _peer_id: &str,
        events: EngineEvents,
    ) -> Result<Arc<dyn NegotiationEngine>, EngineError> {
        Ok(Arc::new(ScriptedEngine {
            name: self.name.clone(),
            script: Arc::clone(&self.script),
            events,
        }))
    }
}

async fn spawn_relay() -> (SocketAddr, AppState) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let state = AppState::new(RelayConfig::default());
    let serve_state = state.clone();
    tokio::spawn(async move {
        let _ = tidepool_relay::serve(listener, serve_state, std::future::pending()).await;
    });
    (addr, state)
}

async fn join(
    addr: SocketAddr,
    state: &AppState,
    id: &str,
    auto_call_viewers: bool,
) -> (Endpoint, UnboundedReceiver<EndpointEvent>, Arc<Script>) {
    let script = Arc::new(Script::default());
    let config = EndpointConfig::new(&format!("ws://{addr}/ws"), id)
        .expect("config")
        .with_reconnect(ReconnectPolicy::fixed(Duration::from_millis(100)))
        .with_auto_call_viewers(auto_call_viewers);
    let factory = Arc::new(ScriptedFactory {
        name: id.to_string(),
        script: Arc::clone(&script),
    });
    let (endpoint, events) = Endpoint::connect(config, factory);
    endpoint.wait_connected().await.expect("relay link");

    let deadline = Instant::now() + Duration::from_secs(5);
    while state.relay.registry().lookup(id).is_none() {
        assert!(Instant::now() < deadline, "{id} never signed in");
        sleep(Duration::from_millis(10)).await;
    }
    (endpoint, events, script)
}

async fn expect_event(
    events: &mut UnboundedReceiver<EndpointEvent>,
    mut wanted: impl FnMut(&EndpointEvent) -> bool,
) -> EndpointEvent {
    let found = timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("event stream ended");
            if wanted(&event) {
                return event;
            }
        }
    })
    .await;
    found.expect("timed out waiting for endpoint event")
}

#[test_timeout::tokio_timeout_test]
async fn watching_a_stream_leads_to_an_established_session() {
    let (addr, state) = spawn_relay().await;
    let (_streamer, mut streamer_events, streamer_script) = join(addr, &state, "A", true).await;
    let (viewer, mut viewer_events, viewer_script) = join(addr, &state, "B", false).await;

    viewer.watch_stream("A").expect("watch");

    let joined = expect_event(&mut streamer_events, |event| {
        matches!(event, EndpointEvent::ViewerJoined { .. })
    })
    .await;
    assert_eq!(
        joined,
        EndpointEvent::ViewerJoined {
            stream_id: "A".into(),
            viewer_id: "B".into(),
        }
    );

    expect_event(&mut streamer_events, |event| {
        *event == EndpointEvent::SessionEstablished { peer_id: "B".into() }
    })
    .await;
    expect_event(&mut viewer_events, |event| {
        *event == EndpointEvent::SessionEstablished { peer_id: "A".into() }
    })
    .await;

    assert!(viewer_script.saw("set_remote:offer from A"));
    assert!(streamer_script.saw("set_remote:answer from B"));
    let session = viewer.session("A").expect("viewer session");
    let phase = timeout(
        Duration::from_secs(1),
        session.wait_for(|phase| phase == Phase::Connected),
    )
    .await
    .expect("viewer session phase");
    assert_eq!(phase, Phase::Connected);

    // The viewer's candidate is emitted before the streamer has the answer,
    // so it may still be in flight here.
    let deadline = Instant::now() + Duration::from_secs(5);
    while !(streamer_script.saw("add_candidate:candidate:B")
        && viewer_script.saw("add_candidate:candidate:A"))
    {
        assert!(Instant::now() < deadline, "candidates were not exchanged");
        sleep(Duration::from_millis(10)).await;
    }
}

#[test_timeout::tokio_timeout_test]
async fn hanging_up_ends_the_session_on_both_sides() {
    let (addr, state) = spawn_relay().await;
    let (caller, mut caller_events, caller_script) = join(addr, &state, "A", false).await;
    let (_callee, mut callee_events, _) = join(addr, &state, "B", false).await;

    caller.call("B");
    expect_event(&mut callee_events, |event| {
        matches!(event, EndpointEvent::SessionEstablished { .. })
    })
    .await;
    expect_event(&mut caller_events, |event| {
        matches!(event, EndpointEvent::SessionEstablished { .. })
    })
    .await;

    caller.hang_up("B");
    caller.hang_up("B");

    let ended = expect_event(&mut callee_events, |event| {
        matches!(event, EndpointEvent::SessionEnded { .. })
    })
    .await;
    assert_eq!(
        ended,
        EndpointEvent::SessionEnded {
            peer_id: "A".into(),
            reason: EndReason::Remote,
        }
    );
    let ended = expect_event(&mut caller_events, |event| {
        matches!(event, EndpointEvent::SessionEnded { .. })
    })
    .await;
    assert_eq!(
        ended,
        EndpointEvent::SessionEnded {
            peer_id: "B".into(),
            reason: EndReason::Local,
        }
    );

    assert!(caller.session("B").is_none());
    let closes = caller_script
        .calls
        .lock()
        .iter()
        .filter(|call| call.as_str() == "close")
        .count();
    assert_eq!(closes, 1);
}

#[test_timeout::tokio_timeout_test]
async fn start_streaming_is_announced_to_other_endpoints() {
    let (addr, state) = spawn_relay().await;
    let (streamer, mut streamer_events, _) = join(addr, &state, "A", false).await;
    let (_viewer, mut viewer_events, _) = join(addr, &state, "B", false).await;

    streamer.start_streaming().expect("start streaming");

    let started = expect_event(&mut viewer_events, |event| {
        matches!(event, EndpointEvent::StreamStarted { .. })
    })
    .await;
    assert_eq!(
        started,
        EndpointEvent::StreamStarted {
            stream_id: "A".into()
        }
    );

    let echoed = timeout(Duration::from_millis(200), async {
        loop {
            match streamer_events.recv().await {
                Some(EndpointEvent::StreamStarted { .. }) => return true,
                Some(_) => continue,
                None => return false,
            }
        }
    })
    .await;
    assert!(!matches!(echoed, Ok(true)), "announcer heard its own stream");
}

#[test_timeout::tokio_timeout_test]
async fn shutdown_tells_connected_peers() {
    let (addr, state) = spawn_relay().await;
    let (caller, mut caller_events, _) = join(addr, &state, "A", false).await;
    let (_callee, mut callee_events, _) = join(addr, &state, "B", false).await;

    caller.call("B");
    expect_event(&mut caller_events, |event| {
        matches!(event, EndpointEvent::SessionEstablished { .. })
    })
    .await;

    caller.shutdown().await;

    let ended = expect_event(&mut callee_events, |event| {
        matches!(event, EndpointEvent::SessionEnded { .. })
    })
    .await;
    assert_eq!(
        ended,
        EndpointEvent::SessionEnded {
            peer_id: "A".into(),
            reason: EndReason::Remote,
        }
    );
    assert_eq!(caller.link_state(), LinkState::Closed);
}

#[test_timeout::tokio_timeout_test]
async fn calling_again_right_after_hanging_up_starts_a_new_session() {
    let (addr, state) = spawn_relay().await;
    let (caller, mut caller_events, _) = join(addr, &state, "A", false).await;
    let (_callee, mut callee_events, _) = join(addr, &state, "B", false).await;

    let first = caller.call("B");
    expect_event(&mut caller_events, |event| {
        matches!(event, EndpointEvent::SessionEstablished { .. })
    })
    .await;
    expect_event(&mut callee_events, |event| {
        matches!(event, EndpointEvent::SessionEstablished { .. })
    })
    .await;

    caller.hang_up("B");
    let second = caller.call("B");
    assert_ne!(second.instance(), first.instance());

    let (mut ended, mut established) = (false, false);
    while !(ended && established) {
        match expect_event(&mut caller_events, |event| {
            matches!(
                event,
                EndpointEvent::SessionEnded { .. } | EndpointEvent::SessionEstablished { .. }
            )
        })
        .await
        {
            EndpointEvent::SessionEnded { reason, .. } => {
                assert_eq!(reason, EndReason::Local);
                ended = true;
            }
            _ => established = true,
        }
    }
    expect_event(&mut callee_events, |event| {
        *event == EndpointEvent::SessionEstablished { peer_id: "A".into() }
    })
    .await;

    // The ended session's report must not evict its replacement.
    let live = caller.session("B").expect("replacement session");
    assert_eq!(live.instance(), second.instance());
    let phase = timeout(
        Duration::from_secs(1),
        live.wait_for(|phase| phase == Phase::Connected),
    )
    .await
    .expect("replacement session phase");
    assert_eq!(phase, Phase::Connected);
}

#[test_timeout::tokio_timeout_test]
async fn dropping_an_endpoint_hangs_up_and_leaves_the_relay() {
    let (addr, state) = spawn_relay().await;
    let (caller, mut caller_events, _) = join(addr, &state, "A", false).await;
    let (_callee, mut callee_events, _) = join(addr, &state, "B", false).await;

    caller.call("B");
    expect_event(&mut caller_events, |event| {
        matches!(event, EndpointEvent::SessionEstablished { .. })
    })
    .await;

    drop(caller);

    let ended = expect_event(&mut callee_events, |event| {
        matches!(event, EndpointEvent::SessionEnded { .. })
    })
    .await;
    assert_eq!(
        ended,
        EndpointEvent::SessionEnded {
            peer_id: "A".into(),
            reason: EndReason::Remote,
        }
    );

    let deadline = Instant::now() + Duration::from_secs(5);
    while state.relay.registry().lookup("A").is_some() {
        assert!(Instant::now() < deadline, "A is still registered after drop");
        sleep(Duration::from_millis(10)).await;
    }
}
