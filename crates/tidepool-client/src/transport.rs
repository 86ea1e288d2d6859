use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{FutureExt, SinkExt, StreamExt};
use parking_lot::Mutex;
use tidepool_proto::SignalingMessage;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::ReconnectPolicy;
use crate::error::ClientError;

type RelaySocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Connected,
    Disconnected,
    /// Shut down, or the reconnect policy ran out of attempts.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    Connected,
    Disconnected,
    GaveUp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Message(SignalingMessage),
    Link(LinkEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Handed to the live socket's writer.
    Sent,
    /// Held until the next successful (re)connect.
    Queued,
}

struct LinkSlot {
    writer: Option<mpsc::UnboundedSender<SignalingMessage>>,
    pending: VecDeque<SignalingMessage>,
    closed: bool,
}

struct Shared {
    endpoint_id: String,
    url: Url,
    policy: ReconnectPolicy,
    capacity: usize,
    slot: Mutex<LinkSlot>,
    wake: Notify,
    shutdown: Notify,
    state: watch::Sender<LinkState>,
    inbound: mpsc::UnboundedSender<Inbound>,
}

impl Shared {
    fn is_closed(&self) -> bool {
        self.slot.lock().closed
    }

    fn set_state(&self, state: LinkState) {
        self.state.send_replace(state);
    }

    fn emit(&self, event: LinkEvent) {
        let _ = self.inbound.send(Inbound::Link(event));
    }

    fn deliver(&self, text: &str) {
        match SignalingMessage::decode(text) {
            Ok(message) => {
                let _ = self.inbound.send(Inbound::Message(message));
            }
            Err(err) => warn!(
                target = "tidepool::transport",
                error = %err,
                "dropping undecodable frame from relay"
            ),
        }
    }
}

/// Where negotiation sessions put their outbound frames.
pub trait SignalSink: Send + Sync {
    fn send_signal(&self, message: SignalingMessage) -> Result<(), ClientError>;
}

impl SignalSink for mpsc::UnboundedSender<SignalingMessage> {
    fn send_signal(&self, message: SignalingMessage) -> Result<(), ClientError> {
        self.send(message).map_err(|_| ClientError::Closed)
    }
}

/// A relay connection that survives transport loss.
///
/// Every successful connect signs in under the endpoint's identifier before
/// anything else is written. Frames sent while the link is down are held in
/// order and flushed after the next sign-in; a send while disconnected also
/// cuts the current backoff short.
pub struct ReconnectingTransport {
    shared: Arc<Shared>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl ReconnectingTransport {
    pub fn connect(
        endpoint_id: impl Into<String>,
        url: Url,
        policy: ReconnectPolicy,
        capacity: usize,
    ) -> (Self, mpsc::UnboundedReceiver<Inbound>) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(LinkState::Connecting);
        let shared = Arc::new(Shared {
            endpoint_id: endpoint_id.into(),
            url,
            policy,
            capacity,
            slot: Mutex::new(LinkSlot {
                writer: None,
                pending: VecDeque::new(),
                closed: false,
            }),
            wake: Notify::new(),
            shutdown: Notify::new(),
            state: state_tx,
            inbound: inbound_tx,
        });
        let supervisor = tokio::spawn(supervise(Arc::clone(&shared)));
        let transport = Self {
            shared,
            supervisor: Mutex::new(Some(supervisor)),
        };
        (transport, inbound_rx)
    }

    pub fn endpoint_id(&self) -> &str {
        &self.shared.endpoint_id
    }

    pub fn send(&self, mut message: SignalingMessage) -> Result<SendOutcome, ClientError> {
        let mut slot = self.shared.slot.lock();
        if slot.closed {
            return Err(ClientError::Closed);
        }
        if let Some(writer) = slot.writer.take() {
            match writer.send(message) {
                Ok(()) => {
                    slot.writer = Some(writer);
                    return Ok(SendOutcome::Sent);
                }
                Err(returned) => message = returned.0,
            }
        }
        let queued = slot.pending.len();
        let outcome = if queued >= self.shared.capacity {
            Err(ClientError::OutboxFull(queued))
        } else {
            slot.pending.push_back(message);
            Ok(SendOutcome::Queued)
        };
        drop(slot);
        // Rejected or not, a send while the link is down cuts the backoff short.
        self.shared.wake.notify_one();
        outcome
    }

    pub fn state(&self) -> LinkState {
        *self.shared.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.shared.state.subscribe()
    }

    /// Frames waiting for the next connect.
    pub fn queued(&self) -> usize {
        self.shared.slot.lock().pending.len()
    }

    pub async fn wait_connected(&self) -> Result<(), ClientError> {
        let mut state = self.subscribe();
        let reached = state
            .wait_for(|state| matches!(state, LinkState::Connected | LinkState::Closed))
            .await
            .map(|state| *state);
        match reached {
            Ok(LinkState::Connected) => Ok(()),
            _ => Err(ClientError::Closed),
        }
    }

    /// Stop reconnecting and close the socket. Queued frames are discarded.
    pub async fn shutdown(&self) {
        self.close_slot();
        self.shared.shutdown.notify_one();
        let supervisor = self.supervisor.lock().take();
        if let Some(mut handle) = supervisor {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await.is_err() {
                handle.abort();
            }
        }
        self.shared.set_state(LinkState::Closed);
    }

    fn close_slot(&self) {
        let mut slot = self.shared.slot.lock();
        slot.closed = true;
        slot.writer = None;
        slot.pending.clear();
    }
}

impl SignalSink for ReconnectingTransport {
    fn send_signal(&self, message: SignalingMessage) -> Result<(), ClientError> {
        self.send(message).map(|_| ())
    }
}

/// Dropping the transport lets the live link write out what was already
/// handed to it, then close the socket; the supervisor exits on its own.
impl Drop for ReconnectingTransport {
    fn drop(&mut self) {
        self.close_slot();
        self.shared.shutdown.notify_one();
        drop(self.supervisor.lock().take());
    }
}

async fn supervise(shared: Arc<Shared>) {
    let mut attempt: u32 = 0;
    loop {
        if shared.is_closed() {
            break;
        }
        shared.set_state(LinkState::Connecting);
        match connect_async(shared.url.as_str()).await {
            Ok((socket, _)) => {
                attempt = 0;
                run_link(&shared, socket).await;
                if shared.is_closed() {
                    break;
                }
                shared.set_state(LinkState::Disconnected);
                shared.emit(LinkEvent::Disconnected);
            }
            Err(err) => {
                shared.set_state(LinkState::Disconnected);
                warn!(
                    target = "tidepool::transport",
                    url = %shared.url,
                    error = %err,
                    "relay connect failed"
                );
            }
        }

        attempt = attempt.saturating_add(1);
        if !shared.policy.allows(attempt) {
            warn!(
                target = "tidepool::transport",
                attempts = attempt - 1,
                "giving up on relay"
            );
            {
                let mut slot = shared.slot.lock();
                slot.closed = true;
                slot.pending.clear();
            }
            shared.set_state(LinkState::Closed);
            shared.emit(LinkEvent::GaveUp);
            break;
        }

        let delay = shared.policy.delay_for(attempt);
        debug!(
            target = "tidepool::transport",
            attempt,
            delay_ms = delay.as_millis() as u64,
            "scheduling relay reconnect"
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shared.wake.notified() => {
                debug!(target = "tidepool::transport", "send while disconnected; reconnecting now");
            }
            _ = shared.shutdown.notified() => break,
        }
    }
}

/// Drive one live socket until it drops or the transport shuts down.
async fn run_link(shared: &Arc<Shared>, socket: RelaySocket) {
    let (mut sink, mut stream) = socket.split();

    let sign_in = match SignalingMessage::sign_in(&shared.endpoint_id).encode() {
        Ok(text) => text,
        Err(err) => {
            warn!(target = "tidepool::transport", error = %err, "failed to encode sign-in");
            return;
        }
    };
    if let Err(err) = sink.send(Message::Text(sign_in)).await {
        debug!(target = "tidepool::transport", error = %err, "sign-in write failed");
        return;
    }

    let (writer_tx, mut writer_rx) = mpsc::unbounded_channel();
    let flushed = {
        let mut slot = shared.slot.lock();
        if slot.closed {
            return;
        }
        let flushed = slot.pending.len();
        for message in slot.pending.drain(..) {
            let _ = writer_tx.send(message);
        }
        slot.writer = Some(writer_tx);
        flushed
    };
    // A permit left by sends queued before this connect is stale now.
    let _ = shared.wake.notified().now_or_never();

    shared.set_state(LinkState::Connected);
    shared.emit(LinkEvent::Connected);
    info!(
        target = "tidepool::transport",
        endpoint_id = %shared.endpoint_id,
        url = %shared.url,
        flushed,
        "relay link up"
    );

    let mut unsent: Option<SignalingMessage> = None;
    loop {
        // Queued frames go out before a shutdown is honoured.
        tokio::select! {
            biased;
            outgoing = writer_rx.recv() => {
                let Some(message) = outgoing else {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                };
                let text = match message.encode() {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(target = "tidepool::transport", error = %err, "failed to encode frame");
                        continue;
                    }
                };
                if let Err(err) = sink.send(Message::Text(text)).await {
                    debug!(target = "tidepool::transport", error = %err, "relay write failed");
                    unsent = Some(message);
                    break;
                }
            }
            _ = shared.shutdown.notified() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => shared.deliver(&text),
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => shared.deliver(&text),
                    Err(_) => debug!(target = "tidepool::transport", "ignoring binary frame"),
                },
                Some(Ok(Message::Close(_))) | None => {
                    debug!(target = "tidepool::transport", "relay closed the link");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(target = "tidepool::transport", error = %err, "relay read failed");
                    break;
                }
            },
        }
    }

    // Anything handed to this writer but never written goes back to the
    // front of the outbox, ahead of frames queued since.
    let mut slot = shared.slot.lock();
    slot.writer = None;
    let mut returned: Vec<SignalingMessage> = unsent.into_iter().collect();
    while let Ok(message) = writer_rx.try_recv() {
        returned.push(message);
    }
    if !slot.closed {
        for message in returned.into_iter().rev() {
            slot.pending.push_front(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn unreachable_url() -> Url {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        Url::parse(&format!("ws://127.0.0.1:{port}/")).unwrap()
    }

    #[test_timeout::tokio_timeout_test]
    async fn sends_queue_while_relay_is_unreachable() {
        let (transport, _inbound) = ReconnectingTransport::connect(
            "A",
            unreachable_url(),
            ReconnectPolicy::fixed(Duration::from_secs(30)),
            2,
        );

        assert_eq!(
            transport.send(SignalingMessage::start_streaming("A")).unwrap(),
            SendOutcome::Queued
        );
        assert_eq!(
            transport.send(SignalingMessage::end_call("A", "B")).unwrap(),
            SendOutcome::Queued
        );
        assert!(matches!(
            transport.send(SignalingMessage::end_call("A", "C")),
            Err(ClientError::OutboxFull(2))
        ));
        assert_eq!(transport.queued(), 2);

        transport.shutdown().await;
        assert_eq!(transport.state(), LinkState::Closed);
        assert!(matches!(
            transport.send(SignalingMessage::end_call("A", "B")),
            Err(ClientError::Closed)
        ));
    }

    /// A relay that accepts TCP connections and hangs up straight away,
    /// counting every attempt.
    async fn refusing_relay() -> (Url, Arc<AtomicUsize>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = Url::parse(&format!("ws://{}/", listener.local_addr().unwrap())).unwrap();
        let accepts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepts);
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                drop(socket);
            }
        });
        (url, accepts)
    }

    async fn wait_for_attempts(accepts: &AtomicUsize, expected: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while accepts.load(Ordering::SeqCst) < expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("expected {expected} connect attempts"));
    }

    #[test_timeout::tokio_timeout_test]
    async fn overflowing_send_still_wakes_the_reconnect_loop() {
        let (url, accepts) = refusing_relay().await;
        let (transport, _inbound) = ReconnectingTransport::connect(
            "A",
            url,
            ReconnectPolicy::fixed(Duration::from_secs(30)),
            1,
        );
        wait_for_attempts(&accepts, 1).await;

        assert_eq!(
            transport.send(SignalingMessage::start_streaming("A")).unwrap(),
            SendOutcome::Queued
        );
        wait_for_attempts(&accepts, 2).await;

        assert!(matches!(
            transport.send(SignalingMessage::end_call("A", "B")),
            Err(ClientError::OutboxFull(1))
        ));
        // Without the wake the next attempt would be 30s away.
        wait_for_attempts(&accepts, 3).await;
        assert_eq!(transport.queued(), 1);

        transport.shutdown().await;
    }

    #[test_timeout::tokio_timeout_test]
    async fn bounded_policy_gives_up() {
        let (transport, mut inbound) = ReconnectingTransport::connect(
            "A",
            unreachable_url(),
            ReconnectPolicy::fixed(Duration::from_millis(10)).with_max_attempts(2),
            8,
        );

        loop {
            match inbound.recv().await {
                Some(Inbound::Link(LinkEvent::GaveUp)) => break,
                Some(_) => continue,
                None => panic!("transport dropped its event channel"),
            }
        }
        assert!(transport.wait_connected().await.is_err());
        assert_eq!(transport.state(), LinkState::Closed);
    }
}
