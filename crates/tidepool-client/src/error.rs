use thiserror::Error;

use crate::negotiation::Phase;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid relay url: {0}")]
    InvalidUrl(String),
    #[error("outbox full ({0} frames queued while the relay link is down)")]
    OutboxFull(usize),
    #[error("relay link closed")]
    Closed,
    #[error("no negotiation session with `{0}`")]
    UnknownPeer(String),
    #[error("negotiation session with `{0}` has already ended")]
    SessionClosed(String),
}

/// Failures that end one negotiation session and nothing else.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("failed to create local description: {0}")]
    CreateDescription(EngineError),
    #[error("failed to apply local description: {0}")]
    SetLocalDescription(EngineError),
    #[error("failed to apply remote description: {0}")]
    SetRemoteDescription(EngineError),
    #[error("negotiation timed out while {0}")]
    TimedOut(Phase),
    #[error("peer connection failed")]
    ConnectionFailed,
    #[error("negotiation engine error: {0}")]
    Engine(EngineError),
}

/// Opaque failure reported by a negotiation engine.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct EngineError(pub String);

impl EngineError {
    pub fn new(message: impl std::fmt::Display) -> Self {
        Self(message.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn every_client_error_names_what_the_caller_can_act_on() {
        let messages = [
            ClientError::InvalidUrl("http://relay".into()).to_string(),
            ClientError::OutboxFull(3).to_string(),
            ClientError::Closed.to_string(),
            ClientError::UnknownPeer("B".into()).to_string(),
            ClientError::SessionClosed("B".into()).to_string(),
        ];
        assert_eq!(messages[0], "invalid relay url: http://relay");
        assert!(messages[1].contains("3 frames"));
        assert_eq!(messages[2], "relay link closed");
        assert!(messages[3].contains("`B`"));
        assert!(messages[4].contains("already ended"));
    }

    #[test_timeout::timeout]
    fn negotiation_failures_stay_inside_the_session() {
        let err = NegotiationError::SetRemoteDescription(EngineError::new("bad sdp"));
        assert_eq!(err.to_string(), "failed to apply remote description: bad sdp");
        assert_eq!(
            NegotiationError::TimedOut(Phase::Offering).to_string(),
            format!("negotiation timed out while {}", Phase::Offering)
        );
    }
}
