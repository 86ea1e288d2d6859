use std::fmt;
use std::sync::Arc;

use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

pub type LocalTrack = Arc<dyn TrackLocal + Send + Sync>;

/// Called once per incoming remote media track.
pub type RemoteTrackHandler = Arc<dyn Fn(Arc<TrackRemote>) + Send + Sync>;

#[derive(Clone)]
pub enum MediaDirection {
    /// Publish the given capture tracks.
    Send(Vec<LocalTrack>),
    /// Receive-only video and audio.
    Receive,
}

impl fmt::Debug for MediaDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaDirection::Send(tracks) => f
                .debug_tuple("Send")
                .field(&tracks.iter().map(|track| track.id().to_string()).collect::<Vec<_>>())
                .finish(),
            MediaDirection::Receive => f.write_str("Receive"),
        }
    }
}

#[derive(Clone)]
pub struct WebRtcConfig {
    pub ice_servers: Vec<RTCIceServer>,
    pub direction: MediaDirection,
    /// Gather `.local` mDNS candidates. Off by default: peers on other
    /// networks cannot resolve them.
    pub multicast_dns: bool,
    pub on_remote_track: Option<RemoteTrackHandler>,
}

impl WebRtcConfig {
    pub fn receive_only() -> Self {
        Self {
            direction: MediaDirection::Receive,
            ..Self::default()
        }
    }

    pub fn sending(tracks: Vec<LocalTrack>) -> Self {
        Self {
            direction: MediaDirection::Send(tracks),
            ..Self::default()
        }
    }

    pub fn with_stun(mut self, url: impl Into<String>) -> Self {
        self.ice_servers.push(RTCIceServer {
            urls: vec![url.into()],
            ..Default::default()
        });
        self
    }

    pub fn with_ice_server(mut self, server: RTCIceServer) -> Self {
        self.ice_servers.push(server);
        self
    }

    pub fn with_multicast_dns(mut self, enabled: bool) -> Self {
        self.multicast_dns = enabled;
        self
    }

    pub fn on_remote_track(mut self, handler: impl Fn(Arc<TrackRemote>) + Send + Sync + 'static) -> Self {
        self.on_remote_track = Some(Arc::new(handler));
        self
    }
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: Vec::new(),
            direction: MediaDirection::Receive,
            multicast_dns: false,
            on_remote_track: None,
        }
    }
}

impl fmt::Debug for WebRtcConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebRtcConfig")
            .field(
                "ice_servers",
                &self.ice_servers.iter().map(|server| &server.urls).collect::<Vec<_>>(),
            )
            .field("direction", &self.direction)
            .field("multicast_dns", &self.multicast_dns)
            .field("on_remote_track", &self.on_remote_track.is_some())
            .finish()
    }
}
