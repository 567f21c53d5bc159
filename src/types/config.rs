//! Client configuration
//!
//! [`ClientConfig`] carries the endpoint, credentials, timeouts, heartbeat and
//! reconnection policy shared by every connection a client opens. It can be
//! assembled with [`ClientConfig::builder`], deserialized (durations are
//! milliseconds) or read from `CHATFLOW_*` environment variables.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::options::ChatOptions;
use crate::error::{ChatFlowError, Result};

/// Default time to wait for the first or next response chunk
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default WebSocket handshake timeout
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default heartbeat interval
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Prefix of the environment variables read by [`ClientConfig::from_env`]
pub const ENV_PREFIX: &str = "CHATFLOW_";

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

// ============================================================================
// Reconnect Policy
// ============================================================================

/// Backoff policy for re-establishing a dropped connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Whether dropped connections are re-established automatically
    pub enabled: bool,
    /// Delay before the first attempt
    #[serde(with = "duration_ms")]
    pub base_interval: Duration,
    /// Upper bound for the doubled delay
    #[serde(with = "duration_ms")]
    pub max_interval: Duration,
    /// Attempts before giving up; `None` retries forever
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            base_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(30),
            max_attempts: Some(10),
        }
    }
}

impl ReconnectPolicy {
    /// Policy that never reconnects
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Delay before the given 1-based attempt: `min(base * 2^(attempt-1), max)`
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base_interval
            .checked_mul(factor)
            .map_or(self.max_interval, |d| d.min(self.max_interval))
    }

    /// Whether another attempt is allowed after `attempts` have been made
    #[must_use]
    pub fn allows(&self, attempts: u32) -> bool {
        self.enabled && self.max_attempts.is_none_or(|max| attempts < max)
    }
}

// ============================================================================
// Client Configuration
// ============================================================================

/// Configuration shared by every connection of a client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// WebSocket endpoint (`ws://` or `wss://`)
    pub url: String,
    /// API key sent with every request
    pub key: Option<String>,
    /// Access token sent with every request
    pub token: Option<String>,
    /// User name sent with every request
    pub username: Option<String>,
    /// Time allowed between request and first chunk, and between chunks
    #[serde(with = "duration_ms")]
    pub response_timeout: Duration,
    /// WebSocket handshake timeout
    #[serde(with = "duration_ms")]
    pub handshake_timeout: Duration,
    /// Heartbeat period; zero disables heartbeats
    #[serde(with = "duration_ms")]
    pub heartbeat_interval: Duration,
    /// Reconnection policy
    pub reconnect: ReconnectPolicy,
    /// Options applied beneath session and request options
    pub default_options: ChatOptions,
    /// Endpoint of the history lookup call
    pub history_url: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            key: None,
            token: None,
            username: None,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            reconnect: ReconnectPolicy::default(),
            default_options: ChatOptions::default(),
            history_url: None,
        }
    }
}

impl ClientConfig {
    /// Create a new builder for `ClientConfig`
    #[must_use]
    pub fn builder(url: impl Into<String>) -> ClientConfigBuilder {
        ClientConfigBuilder {
            config: Self {
                url: url.into(),
                ..Self::default()
            },
        }
    }

    /// Check that the configuration can be used to open connections
    ///
    /// # Errors
    /// Returns `InvalidConfig` for a missing or non-WebSocket URL and for
    /// zero response or handshake timeouts
    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(ChatFlowError::invalid_config("url is required"));
        }
        let parsed = url::Url::parse(&self.url)?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(ChatFlowError::invalid_config(format!(
                "url scheme must be ws or wss, got {}",
                parsed.scheme()
            )));
        }
        if self.response_timeout.is_zero() {
            return Err(ChatFlowError::invalid_config("response_timeout must be > 0"));
        }
        if self.handshake_timeout.is_zero() {
            return Err(ChatFlowError::invalid_config("handshake_timeout must be > 0"));
        }
        if self.reconnect.enabled && self.reconnect.base_interval.is_zero() {
            return Err(ChatFlowError::invalid_config(
                "reconnect.base_interval must be > 0",
            ));
        }
        Ok(())
    }

    /// Read the configuration from `CHATFLOW_*` environment variables
    ///
    /// Recognised: `URL`, `KEY`, `TOKEN`, `USERNAME`, `RESPONSE_TIMEOUT_MS`,
    /// `HANDSHAKE_TIMEOUT_MS`, `HEARTBEAT_MS`, `RECONNECT`,
    /// `RECONNECT_MAX_ATTEMPTS`, `HISTORY_URL`.
    ///
    /// # Errors
    /// Returns `InvalidConfig` if a numeric or boolean variable cannot be
    /// parsed or the result fails [`validate`](Self::validate)
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(format!("{ENV_PREFIX}{name}")).ok())
    }

    /// Build a configuration from an arbitrary variable lookup
    ///
    /// # Errors
    /// Same as [`from_env`](Self::from_env)
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self {
            url: lookup("URL").unwrap_or_default(),
            key: lookup("KEY"),
            token: lookup("TOKEN"),
            username: lookup("USERNAME"),
            history_url: lookup("HISTORY_URL"),
            ..Self::default()
        };
        if let Some(ms) = parse_var::<u64>(&lookup, "RESPONSE_TIMEOUT_MS")? {
            config.response_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "HANDSHAKE_TIMEOUT_MS")? {
            config.handshake_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "HEARTBEAT_MS")? {
            config.heartbeat_interval = Duration::from_millis(ms);
        }
        if let Some(enabled) = parse_var::<bool>(&lookup, "RECONNECT")? {
            config.reconnect.enabled = enabled;
        }
        if let Some(max) = parse_var::<u32>(&lookup, "RECONNECT_MAX_ATTEMPTS")? {
            config.reconnect.max_attempts = if max == 0 { None } else { Some(max) };
        }
        config.validate()?;
        Ok(config)
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<T>> {
    lookup(name)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|_| {
                ChatFlowError::invalid_config(format!("{ENV_PREFIX}{name} has invalid value {raw:?}"))
            })
        })
        .transpose()
}

// ============================================================================
// Builder for ClientConfig
// ============================================================================

/// Builder for `ClientConfig`
#[derive(Debug)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    /// Set the API key
    #[must_use]
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.config.key = Some(key.into());
        self
    }

    /// Set the access token
    #[must_use]
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.config.token = Some(token.into());
        self
    }

    /// Set the user name
    #[must_use]
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.config.username = Some(username.into());
        self
    }

    /// Set the response timeout
    #[must_use]
    pub const fn response_timeout(mut self, timeout: Duration) -> Self {
        self.config.response_timeout = timeout;
        self
    }

    /// Set the handshake timeout
    #[must_use]
    pub const fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    /// Set the heartbeat interval (zero disables heartbeats)
    #[must_use]
    pub const fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    /// Set the reconnection policy
    #[must_use]
    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.config.reconnect = policy;
        self
    }

    /// Set the default chat options
    #[must_use]
    pub fn default_options(mut self, options: ChatOptions) -> Self {
        self.config.default_options = options;
        self
    }

    /// Set the history lookup endpoint
    #[must_use]
    pub fn history_url(mut self, url: impl Into<String>) -> Self {
        self.config.history_url = Some(url.into());
        self
    }

    /// Validate and build the configuration
    ///
    /// # Errors
    /// Returns `InvalidConfig` if [`ClientConfig::validate`] fails
    pub fn build(self) -> Result<ClientConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
