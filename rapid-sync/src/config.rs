//! Client configuration.

use std::time::Duration;

use log::LevelFilter;

/// Fallback timeout for requests that must always time out.
pub const DEFAULT_ALWAYS_TIMEOUT: Duration = Duration::from_secs(300);

/// Idle interval after which a `nop` keeps the connection alive.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// How long `connect` waits for the transport to open
    pub connection_timeout: Duration,
    /// Default timeout for every request (None = requests wait indefinitely)
    pub request_timeout: Option<Duration>,
    /// Timeout for `always_timeout` requests when no default is configured
    pub always_timeout: Duration,
    /// Idle time before a heartbeat frame is sent
    pub heartbeat_interval: Duration,
    /// Conflict retries allowed per optimistic execution
    pub optimistic_max_retries: u32,
    /// Keep result sets of torn-down subscriptions in memory
    pub cache_enabled: bool,
    /// Maximum log level applied when the client is created
    pub log_level: LevelFilter,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(10),
            request_timeout: None,
            always_timeout: DEFAULT_ALWAYS_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            optimistic_max_retries: 10,
            cache_enabled: false,
            log_level: LevelFilter::Info,
        }
    }
}

impl ClientConfig {
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_optimistic_max_retries(mut self, retries: u32) -> Self {
        self.optimistic_max_retries = retries;
        self
    }

    pub fn with_cache(mut self, enabled: bool) -> Self {
        self.cache_enabled = enabled;
        self
    }

    pub fn with_log_level(mut self, level: LevelFilter) -> Self {
        self.log_level = level;
        self
    }

    /// Effective timeout for a request.
    ///
    /// The configured default wins; otherwise only `always_timeout`
    /// requests get one.
    pub fn timeout_for(&self, always_timeout: bool) -> Option<Duration> {
        match (self.request_timeout, always_timeout) {
            (Some(timeout), _) => Some(timeout),
            (None, true) => Some(self.always_timeout),
            (None, false) => None,
        }
    }
}
