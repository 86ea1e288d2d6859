use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::candidate::IceCandidate;

/// Every message type the relay understands. `ViewerJoined` and
/// `StreamStarted` are only ever produced by the relay itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    SignIn,
    WatchStream,
    StartStreaming,
    Offer,
    Answer,
    IceCandidates,
    EndCall,
    ViewerJoined,
    StreamStarted,
}

impl MessageType {
    pub const ALL: [MessageType; 9] = [
        MessageType::SignIn,
        MessageType::WatchStream,
        MessageType::StartStreaming,
        MessageType::Offer,
        MessageType::Answer,
        MessageType::IceCandidates,
        MessageType::EndCall,
        MessageType::ViewerJoined,
        MessageType::StreamStarted,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::SignIn => "SignIn",
            MessageType::WatchStream => "WatchStream",
            MessageType::StartStreaming => "StartStreaming",
            MessageType::Offer => "Offer",
            MessageType::Answer => "Answer",
            MessageType::IceCandidates => "IceCandidates",
            MessageType::EndCall => "EndCall",
            MessageType::ViewerJoined => "ViewerJoined",
            MessageType::StreamStarted => "StreamStarted",
        }
    }

    /// Types forwarded point-to-point to the endpoint named in `target`.
    pub fn is_directed(self) -> bool {
        matches!(
            self,
            MessageType::Offer
                | MessageType::Answer
                | MessageType::IceCandidates
                | MessageType::EndCall
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = DecodeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        MessageType::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == value)
            .ok_or_else(|| DecodeError::UnknownType(value.to_string()))
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed signaling frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("signaling frame has no type")]
    MissingType,
    #[error("unknown signaling message type `{0}`")]
    UnknownType(String),
}

/// One signaling frame.
///
/// `stream_id` names the originating endpoint, `target` the recipient
/// (absent for broadcast types) and `data` carries an opaque payload: an
/// SDP blob for offers and answers, a serialized [`IceCandidate`] for
/// candidates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub stream_id: Option<String>,
    pub target: Option<String>,
    pub data: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFrame {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    stream_id: Option<String>,
    #[serde(default)]
    target: Option<String>,
    #[serde(default, deserialize_with = "payload_as_text")]
    data: Option<String>,
}

// Browsers post candidates as objects; keep every payload opaque text.
fn payload_as_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => None,
        Some(Value::String(text)) => Some(text),
        Some(other) => Some(other.to_string()),
    })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|text| !text.is_empty())
}

impl SignalingMessage {
    pub fn new(kind: MessageType) -> Self {
        Self {
            kind,
            stream_id: None,
            target: None,
            data: None,
        }
    }

    pub fn with_stream_id(mut self, stream_id: impl Into<String>) -> Self {
        self.stream_id = Some(stream_id.into());
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_data(mut self, data: impl Into<String>) -> Self {
        self.data = Some(data.into());
        self
    }

    pub fn sign_in(endpoint_id: &str) -> Self {
        Self::new(MessageType::SignIn).with_stream_id(endpoint_id)
    }

    pub fn watch_stream(stream_id: &str, viewer_id: &str) -> Self {
        Self::new(MessageType::WatchStream)
            .with_stream_id(stream_id)
            .with_target(viewer_id)
    }

    pub fn start_streaming(stream_id: &str) -> Self {
        Self::new(MessageType::StartStreaming).with_stream_id(stream_id)
    }

    pub fn offer(from: &str, to: &str, sdp: impl Into<String>) -> Self {
        Self::new(MessageType::Offer)
            .with_stream_id(from)
            .with_target(to)
            .with_data(sdp)
    }

    pub fn answer(from: &str, to: &str, sdp: impl Into<String>) -> Self {
        Self::new(MessageType::Answer)
            .with_stream_id(from)
            .with_target(to)
            .with_data(sdp)
    }

    pub fn ice_candidate(
        from: &str,
        to: &str,
        candidate: &IceCandidate,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(MessageType::IceCandidates)
            .with_stream_id(from)
            .with_target(to)
            .with_data(candidate.encode()?))
    }

    pub fn end_call(from: &str, to: &str) -> Self {
        Self::new(MessageType::EndCall)
            .with_stream_id(from)
            .with_target(to)
    }

    pub fn viewer_joined(stream_id: &str, viewer_id: &str) -> Self {
        Self::new(MessageType::ViewerJoined)
            .with_stream_id(stream_id)
            .with_target(viewer_id)
    }

    pub fn stream_started(stream_id: &str) -> Self {
        Self::new(MessageType::StreamStarted).with_stream_id(stream_id)
    }

    pub fn stream_id(&self) -> Option<&str> {
        self.stream_id.as_deref()
    }

    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    pub fn data(&self) -> Option<&str> {
        self.data.as_deref()
    }

    /// Parse one text frame. Empty identifiers are treated as absent.
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        let raw: RawFrame = serde_json::from_str(text)?;
        let kind = raw.kind.ok_or(DecodeError::MissingType)?.parse()?;
        Ok(Self {
            kind,
            stream_id: non_empty(raw.stream_id),
            target: non_empty(raw.target),
            data: raw.data,
        })
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
