use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use metrics::{counter, decrement_gauge, increment_gauge};
use tidepool_proto::SignalingMessage;
use tokio::sync::mpsc;
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::registry::PeerHandle;
use crate::relay::{Relay, Routed};
use crate::AppState;

/// WebSocket upgrade handler, mounted at `/` and `/ws`.
pub async fn websocket_handler(
    connect_info: Option<ConnectInfo<SocketAddr>>,
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> Response {
    let remote_addr = connect_info.map(|ConnectInfo(addr)| addr);
    ws.max_message_size(state.config.max_frame_bytes)
        .on_upgrade(move |socket| handle_socket(socket, state, remote_addr))
}

/// One transport session: a writer task draining the connection's queue,
/// and a reader loop feeding the relay until the socket closes or idles out.
async fn handle_socket(socket: WebSocket, state: AppState, remote_addr: Option<SocketAddr>) {
    let (peer, rx) = PeerHandle::channel(remote_addr);
    let connection_id = peer.connection_id();
    let (sender, mut receiver) = socket.split();

    counter!("tidepool_relay_connections_total", 1);
    increment_gauge!("tidepool_relay_connections_active", 1.0);
    debug!(
        connection_id = %connection_id,
        remote_addr = ?remote_addr,
        "websocket connected"
    );

    let writer = tokio::spawn(write_loop(
        sender,
        rx,
        state.config.ping_interval,
        connection_id,
    ));

    let mut signed_in: Option<String> = None;
    loop {
        let frame = match timeout(state.config.idle_timeout, receiver.next()).await {
            Ok(Some(Ok(frame))) => frame,
            Ok(Some(Err(err))) => {
                debug!(connection_id = %connection_id, error = %err, "websocket receive failed");
                break;
            }
            Ok(None) => break,
            Err(_) => {
                info!(
                    connection_id = %connection_id,
                    idle_secs = state.config.idle_timeout.as_secs(),
                    "closing idle connection"
                );
                break;
            }
        };

        let text = match frame {
            Message::Text(text) => text,
            Message::Binary(bytes) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    counter!("tidepool_relay_frames_malformed_total", 1);
                    debug!(connection_id = %connection_id, "dropping non-UTF-8 binary frame");
                    continue;
                }
            },
            Message::Close(_) => {
                debug!(connection_id = %connection_id, "received close frame");
                break;
            }
            // Pings are answered by axum; either way the peer is alive.
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        handle_frame(&state.relay, &peer, &mut signed_in, &text);
    }

    writer.abort();
    let removed = state.relay.registry().remove(&peer);
    decrement_gauge!("tidepool_relay_connections_active", 1.0);
    info!(
        connection_id = %connection_id,
        remote_addr = ?peer.remote_addr(),
        endpoints = ?removed,
        "websocket disconnected"
    );
}

fn handle_frame(relay: &Relay, peer: &PeerHandle, signed_in: &mut Option<String>, text: &str) {
    let message = match SignalingMessage::decode(text) {
        Ok(message) => message,
        Err(err) => {
            counter!("tidepool_relay_frames_malformed_total", 1);
            warn!(
                connection_id = %peer.connection_id(),
                error = %err,
                "dropping malformed frame"
            );
            return;
        }
    };

    let kind = message.kind;
    match relay.route(peer, signed_in.as_deref(), message) {
        Ok(Routed::Registered { endpoint_id, .. }) => *signed_in = Some(endpoint_id),
        Ok(_) => {}
        Err(err) => warn!(
            connection_id = %peer.connection_id(),
            endpoint_id = signed_in.as_deref().unwrap_or("-"),
            kind = %kind,
            error = %err,
            "dropping unroutable frame"
        ),
    }
}

async fn write_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<SignalingMessage>,
    ping_interval: Duration,
    connection_id: Uuid,
) {
    let mut ticker = tokio::time::interval(ping_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            next = rx.recv() => {
                let Some(message) = next else { break };
                let text = match message.encode() {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(connection_id = %connection_id, error = %err, "failed to encode frame");
                        continue;
                    }
                };
                if sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            _ = ticker.tick() => {
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    let _ = sender.close().await;
    debug!(connection_id = %connection_id, "writer task ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;

    #[test_timeout::timeout]
    fn malformed_frames_leave_connection_state_untouched() {
        let relay = Relay::new(Registry::new());
        let (peer, _rx) = PeerHandle::channel(None);
        let mut signed_in = None;

        handle_frame(&relay, &peer, &mut signed_in, "not json");
        handle_frame(&relay, &peer, &mut signed_in, r#"{"type":"Teleport","streamId":"A"}"#);
        handle_frame(&relay, &peer, &mut signed_in, r#"{"streamId":"A"}"#);
        assert!(signed_in.is_none());
        assert!(relay.registry().is_empty());

        handle_frame(&relay, &peer, &mut signed_in, r#"{"type":"SignIn","streamId":"A"}"#);
        assert_eq!(signed_in.as_deref(), Some("A"));
        assert_eq!(relay.registry().lookup("A"), Some(peer));
    }
}
