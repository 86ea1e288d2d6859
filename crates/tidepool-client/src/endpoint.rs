use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tidepool_proto::{IceCandidate, MessageType, SignalingMessage};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::EndpointConfig;
use crate::engine::EngineFactory;
use crate::error::ClientError;
use crate::negotiation::{EndReason, Input, Phase, SessionEvent};
use crate::session::{spawn_session, SessionHandle, SessionParams, SessionReport};
use crate::transport::{Inbound, LinkEvent, LinkState, ReconnectingTransport, SendOutcome};

const HANGUP_GRACE: Duration = Duration::from_secs(1);

/// Notifications for the host application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointEvent {
    /// A viewer asked to watch this endpoint's stream.
    ViewerJoined { stream_id: String, viewer_id: String },
    /// Another endpoint announced a stream.
    StreamStarted { stream_id: String },
    SessionEstablished { peer_id: String },
    SessionEnded { peer_id: String, reason: EndReason },
    RelayConnected,
    RelayDisconnected,
    /// The reconnect policy ran out of attempts; the endpoint is offline for good.
    RelayGaveUp,
}

/// One addressable participant: a relay link plus the negotiation sessions
/// it carries, keyed by peer identifier.
///
/// Must be created inside a Tokio runtime.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<Inner>,
}

struct Inner {
    config: EndpointConfig,
    transport: Arc<ReconnectingTransport>,
    factory: Arc<dyn EngineFactory>,
    sessions: Mutex<HashMap<String, SessionHandle>>,
    reports: mpsc::UnboundedSender<SessionReport>,
    events: mpsc::UnboundedSender<EndpointEvent>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Endpoint {
    pub fn connect(
        config: EndpointConfig,
        factory: Arc<dyn EngineFactory>,
    ) -> (Self, mpsc::UnboundedReceiver<EndpointEvent>) {
        let (transport, inbound) = ReconnectingTransport::connect(
            config.endpoint_id.clone(),
            config.relay_url.clone(),
            config.reconnect.clone(),
            config.outbox_capacity,
        );
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            config,
            transport: Arc::new(transport),
            factory,
            sessions: Mutex::new(HashMap::new()),
            reports: reports_tx,
            events: events_tx,
            dispatcher: Mutex::new(None),
        });
        let dispatcher = tokio::spawn(dispatch_loop(Arc::downgrade(&inner), inbound, reports_rx));
        *inner.dispatcher.lock() = Some(dispatcher);

        (Self { inner }, events_rx)
    }

    pub fn local_id(&self) -> &str {
        &self.inner.config.endpoint_id
    }

    pub fn link_state(&self) -> LinkState {
        self.inner.transport.state()
    }

    pub async fn wait_connected(&self) -> Result<(), ClientError> {
        self.inner.transport.wait_connected().await
    }

    /// Announce this endpoint's stream to every other endpoint.
    pub fn start_streaming(&self) -> Result<SendOutcome, ClientError> {
        self.inner
            .transport
            .send(SignalingMessage::start_streaming(self.local_id()))
    }

    /// Ask the endpoint `stream_id` to call us.
    pub fn watch_stream(&self, stream_id: &str) -> Result<SendOutcome, ClientError> {
        self.inner
            .transport
            .send(SignalingMessage::watch_stream(stream_id, self.local_id()))
    }

    /// Start (or return the live) session with `peer_id`, as the offering side.
    pub fn call(&self, peer_id: &str) -> SessionHandle {
        self.inner.call(peer_id)
    }

    /// End the session with `peer_id`, telling the peer. Safe to repeat.
    ///
    /// The session leaves the table at once, so a following [`call`](Self::call)
    /// starts a fresh one instead of reviving the one being torn down.
    pub fn hang_up(&self, peer_id: &str) {
        let session = self.inner.sessions.lock().remove(peer_id);
        match session {
            Some(session) => {
                let _ = session.hang_up();
            }
            None => debug!(
                target = "tidepool::endpoint",
                peer_id = %peer_id,
                "hang up with no live session"
            ),
        }
    }

    /// Renegotiate with a fresh engine without ending the session.
    pub fn restart(&self, peer_id: &str) -> Result<(), ClientError> {
        let session = self
            .session(peer_id)
            .ok_or_else(|| ClientError::UnknownPeer(peer_id.to_string()))?;
        session.restart()
    }

    pub fn session(&self, peer_id: &str) -> Option<SessionHandle> {
        self.inner
            .sessions
            .lock()
            .get(peer_id)
            .filter(|session| !session.is_closed())
            .cloned()
    }

    pub fn peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self.inner.sessions.lock().keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Hang up every session, then close the relay link.
    pub async fn shutdown(&self) {
        let sessions: Vec<SessionHandle> = self
            .inner
            .sessions
            .lock()
            .values()
            .cloned()
            .collect();
        for session in &sessions {
            let _ = session.hang_up();
        }
        for session in &sessions {
            let closed = session.wait_for(|phase| phase == Phase::Closed);
            if tokio::time::timeout(HANGUP_GRACE, closed).await.is_err() {
                warn!(
                    target = "tidepool::endpoint",
                    peer_id = %session.peer_id(),
                    "session did not close in time"
                );
            }
        }
        self.inner.transport.shutdown().await;
        info!(
            target = "tidepool::endpoint",
            endpoint_id = %self.local_id(),
            "endpoint shut down"
        );
    }
}

impl Inner {
    fn call(&self, peer_id: &str) -> SessionHandle {
        let mut sessions = self.sessions.lock();
        if let Some(existing) = sessions.get(peer_id).filter(|session| !session.is_closed()) {
            let _ = existing.dispatch(Input::Call);
            return existing.clone();
        }
        let session = self.spawn(peer_id, Input::Call);
        sessions.insert(peer_id.to_string(), session.clone());
        session
    }

    fn spawn(&self, peer_id: &str, first: Input) -> SessionHandle {
        info!(
            target = "tidepool::endpoint",
            peer_id = %peer_id,
            "starting negotiation session"
        );
        spawn_session(
            SessionParams {
                local_id: self.config.endpoint_id.clone(),
                peer_id: peer_id.to_string(),
                factory: Arc::clone(&self.factory),
                outbox: self.transport.clone(),
                reports: self.reports.clone(),
                negotiation_timeout: self.config.negotiation_timeout,
            },
            first,
        )
    }

    /// Deliver to the live session with `peer_id`, if there is one.
    fn route(&self, peer_id: &str, input: Input) {
        let session = self
            .sessions
            .lock()
            .get(peer_id)
            .filter(|session| !session.is_closed())
            .cloned();
        match session {
            Some(session) => {
                if session.dispatch(input).is_err() {
                    debug!(target = "tidepool::endpoint", peer_id = %peer_id, "session already ended");
                }
            }
            None => debug!(
                target = "tidepool::endpoint",
                peer_id = %peer_id,
                "no session for inbound frame; dropping"
            ),
        }
    }

    fn emit(&self, event: EndpointEvent) {
        let _ = self.events.send(event);
    }

    fn on_inbound(&self, inbound: Inbound) {
        match inbound {
            Inbound::Message(message) => self.on_message(message),
            Inbound::Link(LinkEvent::Connected) => self.emit(EndpointEvent::RelayConnected),
            Inbound::Link(LinkEvent::Disconnected) => self.emit(EndpointEvent::RelayDisconnected),
            Inbound::Link(LinkEvent::GaveUp) => self.emit(EndpointEvent::RelayGaveUp),
        }
    }

    fn on_message(&self, message: SignalingMessage) {
        let kind = message.kind;
        let Some(from) = message.stream_id.clone() else {
            warn!(target = "tidepool::endpoint", kind = %kind, "frame without streamId; dropping");
            return;
        };

        match kind {
            MessageType::Offer => {
                let Some(sdp) = message.data else {
                    warn!(target = "tidepool::endpoint", peer_id = %from, "offer without sdp");
                    return;
                };
                let mut sessions = self.sessions.lock();
                let live = sessions.get(&from).filter(|session| !session.is_closed()).cloned();
                match live {
                    Some(session) => {
                        let _ = session.dispatch(Input::RemoteOffer(sdp));
                    }
                    None => {
                        let session = self.spawn(&from, Input::RemoteOffer(sdp));
                        sessions.insert(from, session);
                    }
                }
            }
            MessageType::Answer => match message.data {
                Some(sdp) => self.route(&from, Input::RemoteAnswer(sdp)),
                None => warn!(target = "tidepool::endpoint", peer_id = %from, "answer without sdp"),
            },
            MessageType::IceCandidates => {
                match message.data.as_deref().map(IceCandidate::decode) {
                    Some(Ok(candidate)) => self.route(&from, Input::RemoteCandidate(candidate)),
                    Some(Err(err)) => warn!(
                        target = "tidepool::endpoint",
                        peer_id = %from,
                        error = %err,
                        "undecodable candidate"
                    ),
                    None => warn!(target = "tidepool::endpoint", peer_id = %from, "empty candidate"),
                }
            }
            MessageType::EndCall => {
                let session = self.sessions.lock().remove(&from);
                match session {
                    Some(session) => {
                        let _ = session.dispatch(Input::RemoteEndCall);
                    }
                    None => debug!(
                        target = "tidepool::endpoint",
                        peer_id = %from,
                        "EndCall for no live session"
                    ),
                }
            }
            MessageType::ViewerJoined => {
                let Some(viewer_id) = message.target else {
                    warn!(target = "tidepool::endpoint", "ViewerJoined without a viewer");
                    return;
                };
                self.emit(EndpointEvent::ViewerJoined {
                    stream_id: from,
                    viewer_id: viewer_id.clone(),
                });
                if self.config.auto_call_viewers {
                    self.call(&viewer_id);
                }
            }
            MessageType::StreamStarted => {
                if from != self.config.endpoint_id {
                    self.emit(EndpointEvent::StreamStarted { stream_id: from });
                }
            }
            MessageType::SignIn | MessageType::WatchStream | MessageType::StartStreaming => {
                debug!(target = "tidepool::endpoint", kind = %kind, "ignoring endpoint-only frame");
            }
        }
    }

    fn on_report(&self, report: SessionReport) {
        match report.event {
            SessionEvent::Established => self.emit(EndpointEvent::SessionEstablished {
                peer_id: report.peer_id,
            }),
            SessionEvent::Ended(reason) => {
                {
                    let mut sessions = self.sessions.lock();
                    if sessions
                        .get(&report.peer_id)
                        .is_some_and(|session| session.instance() == report.instance)
                    {
                        sessions.remove(&report.peer_id);
                    }
                }
                self.emit(EndpointEvent::SessionEnded {
                    peer_id: report.peer_id,
                    reason,
                });
            }
        }
    }
}

/// The last `Endpoint` clone going away hangs up every session, which tells
/// each peer before the relay link winds down.
impl Drop for Inner {
    fn drop(&mut self) {
        for (_, session) in self.sessions.get_mut().drain() {
            let _ = session.hang_up();
        }
        if let Some(dispatcher) = self.dispatcher.get_mut().take() {
            dispatcher.abort();
        }
    }
}

async fn dispatch_loop(
    inner: Weak<Inner>,
    mut inbound: mpsc::UnboundedReceiver<Inbound>,
    mut reports: mpsc::UnboundedReceiver<SessionReport>,
) {
    loop {
        tokio::select! {
            Some(item) = inbound.recv() => {
                let Some(inner) = inner.upgrade() else { break };
                inner.on_inbound(item);
            }
            Some(report) = reports.recv() => {
                let Some(inner) = inner.upgrade() else { break };
                inner.on_report(report);
            }
            else => break,
        }
    }
}
