use metrics::counter;
use tidepool_proto::{MessageType, SignalingMessage};
use tracing::{debug, info};

use crate::error::RouteError;
use crate::registry::{PeerHandle, Registry};

/// What the relay did with a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed {
    Registered {
        endpoint_id: String,
        superseded: bool,
    },
    Forwarded {
        to: String,
    },
    Broadcast {
        delivered: usize,
    },
}

/// Routes signaling frames between connections by endpoint identifier.
///
/// Holds no state of its own beyond the injected [`Registry`]; payloads
/// are forwarded verbatim and never inspected.
#[derive(Clone, Default)]
pub struct Relay {
    registry: Registry,
}

impl Relay {
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Route one frame received on `origin`. `signed_in` is the identifier
    /// the originating connection most recently signed in with.
    pub fn route(
        &self,
        origin: &PeerHandle,
        signed_in: Option<&str>,
        message: SignalingMessage,
    ) -> Result<Routed, RouteError> {
        let kind = message.kind;
        let outcome = match kind {
            MessageType::SignIn => self.sign_in(origin, &message),
            MessageType::WatchStream => self.watch_stream(signed_in, &message),
            MessageType::StartStreaming => self.start_streaming(origin, &message),
            _ if kind.is_directed() => self.forward(message),
            // Only the relay itself may send the remaining types.
            _ => Err(RouteError::NotRoutable(kind)),
        };

        match &outcome {
            Ok(_) => counter!("tidepool_relay_messages_routed_total", 1, "type" => kind.as_str()),
            Err(err) => counter!(
                "tidepool_relay_messages_dropped_total",
                1,
                "reason" => err.metric_label()
            ),
        }
        outcome
    }

    fn sign_in(&self, origin: &PeerHandle, message: &SignalingMessage) -> Result<Routed, RouteError> {
        let endpoint_id = message
            .stream_id()
            .ok_or(RouteError::MissingStreamId(message.kind))?
            .to_string();
        let previous = self.registry.register(endpoint_id.clone(), origin.clone());
        let superseded = previous.is_some_and(|prev| !prev.same_connection(origin));
        info!(
            endpoint_id = %endpoint_id,
            connection_id = %origin.connection_id(),
            remote_addr = ?origin.remote_addr(),
            superseded,
            "endpoint signed in"
        );
        Ok(Routed::Registered {
            endpoint_id,
            superseded,
        })
    }

    fn forward(&self, message: SignalingMessage) -> Result<Routed, RouteError> {
        let target = message
            .target()
            .ok_or(RouteError::MissingTarget(message.kind))?
            .to_string();
        let peer = self
            .registry
            .lookup(&target)
            .ok_or_else(|| RouteError::UnknownTarget(target.clone()))?;
        debug!(
            kind = %message.kind,
            from = message.stream_id().unwrap_or("-"),
            to = %target,
            "forwarding frame"
        );
        peer.send(message)
            .map_err(|_| RouteError::TargetClosed(target.clone()))?;
        Ok(Routed::Forwarded { to: target })
    }

    fn watch_stream(
        &self,
        signed_in: Option<&str>,
        message: &SignalingMessage,
    ) -> Result<Routed, RouteError> {
        let stream_id = message
            .stream_id()
            .ok_or(RouteError::MissingStreamId(message.kind))?;
        let watcher = message
            .target()
            .or(signed_in)
            .ok_or(RouteError::UnknownWatcher)?;
        let streamer = self
            .registry
            .lookup(stream_id)
            .ok_or_else(|| RouteError::UnknownTarget(stream_id.to_string()))?;
        debug!(stream_id = %stream_id, watcher = %watcher, "viewer joined");
        streamer
            .send(SignalingMessage::viewer_joined(stream_id, watcher))
            .map_err(|_| RouteError::TargetClosed(stream_id.to_string()))?;
        Ok(Routed::Forwarded {
            to: stream_id.to_string(),
        })
    }

    fn start_streaming(
        &self,
        origin: &PeerHandle,
        message: &SignalingMessage,
    ) -> Result<Routed, RouteError> {
        let stream_id = message
            .stream_id()
            .ok_or(RouteError::MissingStreamId(message.kind))?;
        let notice = SignalingMessage::stream_started(stream_id);
        let mut delivered = 0;
        for (endpoint_id, peer) in self.registry.broadcast_targets(origin, stream_id) {
            if peer.send(notice.clone()).is_ok() {
                delivered += 1;
            } else {
                debug!(endpoint_id = %endpoint_id, "skipping closed connection during broadcast");
            }
        }
        info!(stream_id = %stream_id, delivered, "stream started");
        Ok(Routed::Broadcast { delivered })
    }
}
