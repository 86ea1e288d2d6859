//! Shared protocol definitions for relay ↔ endpoint signaling.
//! Kept in a dedicated crate so the relay, native endpoints and test
//! fixtures agree on one wire model without pulling in runtime code.
//!
//! Every frame is a single JSON object:
//!
//! ```json
//! { "type": "Offer", "streamId": "A", "target": "B", "data": "v=0..." }
//! ```

mod candidate;
mod message;

pub use candidate::IceCandidate;
pub use message::{DecodeError, MessageType, SignalingMessage};
