//! The seam between negotiation logic and a concrete peer-connection stack.
//!
//! A [`NegotiationEngine`] owns the media pipeline and ICE agent for one
//! remote peer. Commands are awaited by the session actor; notifications
//! the engine raises on its own (discovered candidates, connection state)
//! go through [`EngineEvents`] into the same session mailbox.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tidepool_proto::IceCandidate;
use tokio::sync::mpsc;

use crate::error::EngineError;
use crate::negotiation::Input;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::New => "new",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    LocalCandidate(IceCandidate),
    ConnectionState(ConnectionState),
    Failed(EngineError),
}

/// Notification sink handed to an engine at construction.
///
/// Every event is stamped with the generation the engine was built for, so
/// events from an engine that was since rebuilt are ignored.
#[derive(Clone)]
pub struct EngineEvents {
    generation: u64,
    tx: mpsc::UnboundedSender<Input>,
}

impl EngineEvents {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<Input>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns `false` once the owning session has gone away.
    pub fn emit(&self, event: EngineEvent) -> bool {
        self.tx
            .send(Input::Engine {
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

impl fmt::Debug for EngineEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineEvents")
            .field("generation", &self.generation)
            .finish()
    }
}

#[async_trait]
pub trait NegotiationEngine: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, EngineError>;

    async fn create_answer(&self) -> Result<SessionDescription, EngineError>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), EngineError>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), EngineError>;

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError>;

    /// Release capture, encoder and transport. Called at most once per engine.
    async fn close(&self);
}

/// Builds one engine per negotiation session (and per in-place restart).
#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn create(
        &self,
        peer_id: &str,
        events: EngineEvents,
    ) -> Result<Arc<dyn NegotiationEngine>, EngineError>;
}
