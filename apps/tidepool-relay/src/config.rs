use std::env;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub host: IpAddr,
    pub port: u16,
    /// Interval between server-initiated WebSocket pings.
    pub ping_interval: Duration,
    /// A session that sends nothing (not even a pong) for this long is closed.
    pub idle_timeout: Duration,
    pub max_frame_bytes: usize,
}

impl RelayConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: env::var("TIDEPOOL_RELAY_HOST")
                .ok()
                .and_then(|h| h.parse().ok())
                .unwrap_or(defaults.host),
            port: env::var("TIDEPOOL_RELAY_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            ping_interval: env_secs("TIDEPOOL_RELAY_PING_INTERVAL_SECS")
                .unwrap_or(defaults.ping_interval),
            idle_timeout: env_secs("TIDEPOOL_RELAY_IDLE_TIMEOUT_SECS")
                .unwrap_or(defaults.idle_timeout),
            max_frame_bytes: env::var("TIDEPOOL_RELAY_MAX_FRAME_BYTES")
                .ok()
                .and_then(|b| b.parse().ok())
                .unwrap_or(defaults.max_frame_bytes),
        }
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 3000,
            ping_interval: Duration::from_secs(15),
            idle_timeout: Duration::from_secs(45),
            max_frame_bytes: 1 << 20,
        }
    }
}

fn env_secs(key: &str) -> Option<Duration> {
    env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
}
