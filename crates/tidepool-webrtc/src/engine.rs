use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tidepool_client::{
    ConnectionState, EngineError, EngineEvent, EngineEvents, EngineFactory, NegotiationEngine,
    SdpKind, SessionDescription,
};
use tidepool_proto::IceCandidate;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice::mdns::MulticastDnsMode;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_remote::TrackRemote;

use crate::config::{MediaDirection, WebRtcConfig};

fn engine_error(err: impl std::fmt::Display) -> EngineError {
    EngineError::new(err)
}

fn build_api(multicast_dns: bool) -> Result<API, EngineError> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs().map_err(engine_error)?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine).map_err(engine_error)?;

    let mut setting = SettingEngine::default();
    if !multicast_dns {
        setting.set_ice_multicast_dns_mode(MulticastDnsMode::Disabled);
    }

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

/// Builds one peer connection per negotiation session.
pub struct WebRtcEngineFactory {
    api: API,
    config: WebRtcConfig,
}

impl WebRtcEngineFactory {
    pub fn new(config: WebRtcConfig) -> Result<Self, EngineError> {
        Ok(Self {
            api: build_api(config.multicast_dns)?,
            config,
        })
    }

    pub fn config(&self) -> &WebRtcConfig {
        &self.config
    }

    pub async fn create_engine(
        &self,
        peer_id: &str,
        events: EngineEvents,
    ) -> Result<WebRtcEngine, EngineError> {
        let rtc_config = RTCConfiguration {
            ice_servers: self.config.ice_servers.clone(),
            ..Default::default()
        };
        let pc = Arc::new(
            self.api
                .new_peer_connection(rtc_config)
                .await
                .map_err(engine_error)?,
        );

        match &self.config.direction {
            MediaDirection::Send(tracks) => {
                for track in tracks {
                    pc.add_track(Arc::clone(track)).await.map_err(engine_error)?;
                }
            }
            MediaDirection::Receive => {
                for kind in [RTPCodecType::Video, RTPCodecType::Audio] {
                    pc.add_transceiver_from_kind(
                        kind,
                        Some(RTCRtpTransceiverInit {
                            direction: RTCRtpTransceiverDirection::Recvonly,
                            send_encodings: Vec::new(),
                        }),
                    )
                    .await
                    .map_err(engine_error)?;
                }
            }
        }

        install_callbacks(&pc, peer_id, events, &self.config);

        debug!(
            target = "tidepool::webrtc",
            peer_id = %peer_id,
            direction = ?self.config.direction,
            "peer connection created"
        );
        Ok(WebRtcEngine {
            peer_id: peer_id.to_string(),
            pc,
            closed: AtomicBool::new(false),
        })
    }
}

fn install_callbacks(
    pc: &Arc<RTCPeerConnection>,
    peer_id: &str,
    events: EngineEvents,
    config: &WebRtcConfig,
) {
    let candidate_events = events.clone();
    let candidate_peer = peer_id.to_string();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let events = candidate_events.clone();
        let peer_id = candidate_peer.clone();
        Box::pin(async move {
            // `None` marks the end of gathering; nothing to send.
            let Some(candidate) = candidate else { return };
            match candidate.to_json() {
                Ok(init) => {
                    events.emit(EngineEvent::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    }));
                }
                Err(err) => warn!(
                    target = "tidepool::webrtc",
                    peer_id = %peer_id,
                    error = %err,
                    "failed to serialize local candidate"
                ),
            }
        })
    }));

    let state_peer = peer_id.to_string();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let events = events.clone();
        let peer_id = state_peer.clone();
        Box::pin(async move {
            debug!(
                target = "tidepool::webrtc",
                peer_id = %peer_id,
                state = %state,
                "peer connection state changed"
            );
            if let Some(state) = map_state(state) {
                events.emit(EngineEvent::ConnectionState(state));
            }
        })
    }));

    if let Some(handler) = config.on_remote_track.clone() {
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                handler(track);
                Box::pin(async {})
            },
        ));
    }
}

fn map_state(state: RTCPeerConnectionState) -> Option<ConnectionState> {
    match state {
        RTCPeerConnectionState::New => Some(ConnectionState::New),
        RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
        RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
        RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription, EngineError> {
    match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
    }
    .map_err(engine_error)
}

fn from_rtc(description: RTCSessionDescription) -> Result<SessionDescription, EngineError> {
    match description.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(description.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(description.sdp)),
        other => Err(EngineError::new(format!("unexpected sdp type {other}"))),
    }
}

#[async_trait]
impl EngineFactory for WebRtcEngineFactory {
    async fn create(
        &self,
        peer_id: &str,
        events: EngineEvents,
    ) -> Result<Arc<dyn NegotiationEngine>, EngineError> {
        Ok(Arc::new(self.create_engine(peer_id, events).await?))
    }
}

/// One `RTCPeerConnection` driven through the negotiation engine seam.
pub struct WebRtcEngine {
    peer_id: String,
    pc: Arc<RTCPeerConnection>,
    closed: AtomicBool,
}

impl WebRtcEngine {
    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }
}

#[async_trait]
impl NegotiationEngine for WebRtcEngine {
    async fn create_offer(&self) -> Result<SessionDescription, EngineError> {
        let offer = self.pc.create_offer(None).await.map_err(engine_error)?;
        from_rtc(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        let answer = self.pc.create_answer(None).await.map_err(engine_error)?;
        from_rtc(answer)
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), EngineError> {
        self.pc
            .set_local_description(to_rtc(description)?)
            .await
            .map_err(engine_error)
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), EngineError> {
        self.pc
            .set_remote_description(to_rtc(description)?)
            .await
            .map_err(engine_error)
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc.add_ice_candidate(init).await.map_err(engine_error)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(err) = self.pc.close().await {
            warn!(
                target = "tidepool::webrtc",
                peer_id = %self.peer_id,
                error = %err,
                "error closing peer connection"
            );
        }
    }
}
