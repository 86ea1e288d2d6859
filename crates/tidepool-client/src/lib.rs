//! Endpoint side of Tidepool signaling.
//!
//! An [`Endpoint`] keeps one [`ReconnectingTransport`] to the relay and runs a
//! negotiation session per remote peer. Sessions drive a
//! [`NegotiationEngine`] (see the `tidepool-webrtc` crate for the real one)
//! through offer, answer and candidate exchange; the state machine itself
//! lives in [`negotiation`] and performs no I/O.

pub mod config;
pub mod endpoint;
pub mod engine;
pub mod error;
pub mod negotiation;
pub mod session;
pub mod transport;

pub use config::{EndpointConfig, ReconnectPolicy};
pub use endpoint::{Endpoint, EndpointEvent};
pub use engine::{
    ConnectionState, EngineEvent, EngineEvents, EngineFactory, NegotiationEngine, SdpKind,
    SessionDescription,
};
pub use error::{ClientError, EngineError, NegotiationError};
pub use negotiation::{EndReason, Phase, Role};
pub use session::SessionHandle;
pub use transport::{Inbound, LinkEvent, LinkState, ReconnectingTransport, SendOutcome, SignalSink};
