//! [`NegotiationEngine`](tidepool_client::NegotiationEngine) backed by
//! webrtc-rs.
//!
//! Hand a [`WebRtcEngineFactory`] to
//! [`Endpoint::connect`](tidepool_client::Endpoint::connect); every
//! negotiation session then gets its own `RTCPeerConnection`.

mod config;
mod engine;

pub use config::{LocalTrack, MediaDirection, RemoteTrackHandler, WebRtcConfig};
pub use engine::{WebRtcEngine, WebRtcEngineFactory};
