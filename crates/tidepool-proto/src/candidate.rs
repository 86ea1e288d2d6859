use serde::{Deserialize, Serialize};

/// One discovered connectivity candidate, shaped like the browser's
/// `RTCIceCandidateInit`. Android peers name the candidate line `sdp`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    #[serde(alias = "sdp")]
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(
        candidate: impl Into<String>,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<u16>,
    ) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid,
            sdp_mline_index,
            username_fragment: None,
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn accepts_android_field_names() {
        let text = r#"{"sdpMid":"video","sdpMLineIndex":1,"sdp":"candidate:42 1 udp 2122260223 192.168.1.4 51234 typ host","serverUrl":"","adapterType":"WIFI"}"#;
        let candidate = IceCandidate::decode(text).unwrap();
        assert_eq!(candidate.sdp_mid.as_deref(), Some("video"));
        assert_eq!(candidate.sdp_mline_index, Some(1));
        assert!(candidate.candidate.starts_with("candidate:42"));
    }

    #[test_timeout::timeout]
    fn encodes_browser_shape() {
        let candidate = IceCandidate::new("candidate:1", Some("0".into()), Some(0));
        assert_eq!(
            candidate.encode().unwrap(),
            r#"{"candidate":"candidate:1","sdpMid":"0","sdpMLineIndex":0}"#
        );
    }
}
