use std::time::Duration;

use rand::Rng;
use url::Url;

use crate::error::ClientError;

/// How the relay link backs off between reconnect attempts.
///
/// Attempt `n` (1-based) waits `initial_delay * multiplier^(n-1)`, capped at
/// `max_delay`, then spread by up to `±jitter` of itself so a fleet of
/// endpoints does not reconnect in lockstep after a relay restart.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Fraction in `[0, 1]`.
    pub jitter: f64,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl ReconnectPolicy {
    /// Constant delay, no jitter, unbounded attempts.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
            jitter: 0.0,
            max_attempts: None,
        }
    }

    pub fn exponential(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt <= max)
    }

    /// Un-jittered delay before `attempt`.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let scaled = self.initial_delay.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        let capped = scaled.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay_for(attempt);
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        base.mul_f64((1.0 + spread).max(0.0))
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.2,
            max_attempts: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub relay_url: Url,
    pub endpoint_id: String,
    pub reconnect: ReconnectPolicy,
    /// Bound on how long a session may sit between starting a negotiation
    /// and reaching `Negotiating`.
    pub negotiation_timeout: Option<Duration>,
    /// Frames held while the relay link is down.
    pub outbox_capacity: usize,
    /// Place a call to every viewer that announces itself with `ViewerJoined`.
    pub auto_call_viewers: bool,
}

impl EndpointConfig {
    pub fn new(relay_url: &str, endpoint_id: impl Into<String>) -> Result<Self, ClientError> {
        let relay_url = Url::parse(relay_url)
            .map_err(|err| ClientError::InvalidUrl(format!("{relay_url}: {err}")))?;
        match relay_url.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(ClientError::InvalidUrl(format!(
                    "unsupported scheme `{other}` (expected ws or wss)"
                )))
            }
        }
        Ok(Self {
            relay_url,
            endpoint_id: endpoint_id.into(),
            reconnect: ReconnectPolicy::default(),
            negotiation_timeout: Some(Duration::from_secs(30)),
            outbox_capacity: 256,
            auto_call_viewers: false,
        })
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn with_negotiation_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.negotiation_timeout = timeout;
        self
    }

    pub fn with_outbox_capacity(mut self, capacity: usize) -> Self {
        self.outbox_capacity = capacity;
        self
    }

    pub fn with_auto_call_viewers(mut self, enabled: bool) -> Self {
        self.auto_call_viewers = enabled;
        self
    }
}
