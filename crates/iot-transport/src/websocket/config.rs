//! WebSocket connection configuration.

use std::time::Duration;

use rand::Rng;

use crate::{auth::Credentials, pending::DEFAULT_MAX_PENDING, reconnect::BackoffConfig};

/// Configuration for WebSocket connections.
#[derive(Clone, Debug)]
pub struct WsConfig {
    // URL
    /// WebSocket endpoint URL, e.g. `ws://192.168.1.20/rpc`.
    pub url: String,
    /// Identifier sent as `src` so the device knows where to reply.
    pub client_id: String,
    /// Basic credentials sent with the handshake.
    pub credentials: Option<Credentials>,
    /// Accept invalid TLS certificates for `wss://` endpoints.
    pub insecure_tls: bool,

    // Reconnection settings
    /// Reconnect automatically after the connection drops.
    pub auto_reconnect: bool,
    /// Initial delay before first reconnection attempt.
    pub reconnect_initial_delay: Duration,
    /// Maximum delay between reconnection attempts.
    pub reconnect_max_delay: Duration,
    /// Backoff multiplier for reconnection delays.
    pub reconnect_backoff_factor: f64,
    /// Random jitter factor (0.0-1.0) for reconnection delays.
    pub reconnect_jitter: f64,
    /// Attempts before the reconnect loop gives up.
    pub reconnect_max_attempts: u32,

    // Heartbeat settings
    /// Interval between ping frames. Zero disables keepalive.
    pub ping_interval: Duration,
    /// Bound on sending a single ping.
    pub pong_timeout: Duration,

    // Request handling
    /// Default timeout for request-response operations.
    pub request_timeout: Duration,
    /// Maximum number of pending requests.
    pub max_pending_requests: usize,

    // Connection
    /// Timeout for the handshake.
    pub connect_timeout: Duration,
    /// Inbound frames above this size are dropped.
    pub max_message_size: usize,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            client_id: default_client_id(),
            credentials: None,
            insecure_tls: false,
            auto_reconnect: true,
            reconnect_initial_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(60),
            reconnect_backoff_factor: 2.0,
            reconnect_jitter: 0.1,
            reconnect_max_attempts: 10,
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            max_pending_requests: DEFAULT_MAX_PENDING,
            connect_timeout: Duration::from_secs(10),
            max_message_size: 16 * 1024 * 1024, // 16 MB
        }
    }
}

fn default_client_id() -> String {
    format!("iot-transport-{:08x}", rand::rng().random::<u32>())
}

impl WsConfig {
    /// Create a new configuration with the given URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    #[must_use]
    pub fn basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some(Credentials::new(username, password));
        self
    }

    #[must_use]
    pub fn insecure_tls(mut self, insecure: bool) -> Self {
        self.insecure_tls = insecure;
        self
    }

    #[must_use]
    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    /// Set the reconnection initial delay.
    #[must_use]
    pub fn reconnect_initial_delay(mut self, delay: Duration) -> Self {
        self.reconnect_initial_delay = delay;
        self
    }

    /// Set the maximum reconnection delay.
    #[must_use]
    pub fn reconnect_max_delay(mut self, delay: Duration) -> Self {
        self.reconnect_max_delay = delay;
        self
    }

    /// Set the reconnection backoff factor.
    #[must_use]
    pub fn reconnect_backoff_factor(mut self, factor: f64) -> Self {
        self.reconnect_backoff_factor = factor;
        self
    }

    #[must_use]
    pub fn reconnect_jitter(mut self, jitter: f64) -> Self {
        self.reconnect_jitter = jitter;
        self
    }

    /// Set the maximum reconnection attempts.
    #[must_use]
    pub fn reconnect_max_attempts(mut self, attempts: u32) -> Self {
        self.reconnect_max_attempts = attempts;
        self
    }

    /// Set the ping interval.
    #[must_use]
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Set the pong timeout.
    #[must_use]
    pub fn pong_timeout(mut self, timeout: Duration) -> Self {
        self.pong_timeout = timeout;
        self
    }

    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    #[must_use]
    pub fn max_pending_requests(mut self, max: usize) -> Self {
        self.max_pending_requests = max;
        self
    }

    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    pub fn reconnect_backoff(&self) -> BackoffConfig {
        BackoffConfig {
            initial_delay: self.reconnect_initial_delay,
            max_delay: self.reconnect_max_delay,
            factor: self.reconnect_backoff_factor,
            jitter: self.reconnect_jitter,
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.url.is_empty() {
            return Err("URL cannot be empty".to_string());
        }
        let url = url::Url::parse(&self.url).map_err(|e| format!("Invalid URL: {e}"))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(format!("Unsupported URL scheme: {}", url.scheme()));
        }
        if self.client_id.is_empty() {
            return Err("Client id cannot be empty".to_string());
        }
        if self.request_timeout.is_zero() {
            return Err("Request timeout must be > 0".to_string());
        }
        if self.connect_timeout.is_zero() {
            return Err("Connect timeout must be > 0".to_string());
        }
        if !self.ping_interval.is_zero() && self.pong_timeout.is_zero() {
            return Err("Pong timeout must be > 0 when keepalive is enabled".to_string());
        }
        if self.max_pending_requests == 0 {
            return Err("Max pending requests must be > 0".to_string());
        }
        if self.auto_reconnect {
            self.reconnect_backoff().validate()?;
        }
        Ok(())
    }
}
