use crate::connection::DEFAULT_MAX_LINE_LEN;
use crate::error::{Result, RotelError};
use crate::profile::DEFAULT_PORT;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Connection settings for one amplifier
///
/// Durations are (de)serialized as milliseconds under `*_ms` keys.
///
/// # Example
///
/// ```
/// use rotel_ip::SessionConfig;
///
/// let config = SessionConfig::from_json(r#"{ "host": "192.168.1.50", "profile": "rotel_ascii_v1" }"#).unwrap();
/// assert_eq!(config.port, 9590);
/// assert_eq!(config.profile.as_deref(), Some("rotel_ascii_v1"));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Host name or IP address
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Profile key to use instead of model auto-detection
    #[serde(default)]
    pub profile: Option<String>,

    #[serde(rename = "connect_timeout_ms", with = "duration_ms", default = "default_connect_timeout")]
    pub connect_timeout: Duration,

    /// How long to wait for the model query answer
    #[serde(rename = "handshake_timeout_ms", with = "duration_ms", default = "default_handshake_timeout")]
    pub handshake_timeout: Duration,

    /// Unterminated bytes tolerated before the connection is dropped
    #[serde(default = "default_max_line_len")]
    pub max_line_len: usize,

    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_handshake_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_max_line_len() -> usize {
    DEFAULT_MAX_LINE_LEN
}

impl SessionConfig {
    /// Config for `host` with every other setting at its default
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            profile: None,
            connect_timeout: default_connect_timeout(),
            handshake_timeout: default_handshake_timeout(),
            max_line_len: default_max_line_len(),
            reconnect: ReconnectConfig::default(),
        }
    }

    /// Parse and validate a JSON config
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Force a profile instead of detecting it from the model string
    pub fn with_profile(mut self, key: impl Into<String>) -> Self {
        self.profile = Some(key.into());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_max_line_len(mut self, len: usize) -> Self {
        self.max_line_len = len;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Check the settings for values the session cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(RotelError::InvalidConfig("host is empty".to_string()));
        }
        if self.port == 0 {
            return Err(RotelError::InvalidConfig("port must be non-zero".to_string()));
        }
        if self.max_line_len == 0 {
            return Err(RotelError::InvalidConfig("max_line_len must be non-zero".to_string()));
        }
        self.reconnect.validate()
    }
}

/// Exponential backoff configuration for reconnection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt. Default: 1s.
    #[serde(rename = "initial_delay_ms", with = "duration_ms")]
    pub initial_delay: Duration,

    /// Upper bound on backoff delay. Default: 30s.
    #[serde(rename = "max_delay_ms", with = "duration_ms")]
    pub max_delay: Duration,

    /// Growth factor between attempts. Default: 2.0.
    pub multiplier: f64,

    /// Random extra delay as a fraction of the current delay. Default: 0.1.
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl ReconnectConfig {
    pub fn validate(&self) -> Result<()> {
        if self.initial_delay > self.max_delay {
            return Err(RotelError::InvalidConfig(format!(
                "initial delay {:?} exceeds max delay {:?}",
                self.initial_delay, self.max_delay
            )));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(RotelError::InvalidConfig(format!(
                "multiplier {} must be at least 1",
                self.multiplier
            )));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(RotelError::InvalidConfig(format!("jitter {} outside [0, 1)", self.jitter)));
        }
        Ok(())
    }
}

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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = SessionConfig::new("10.0.0.5");
        assert_eq!(config.port, 9590);
        assert_eq!(config.profile, None);
        assert_eq!(config.handshake_timeout, Duration::from_secs(2));
        assert_eq!(config.max_line_len, 1024);
        assert_eq!(config.reconnect.initial_delay, Duration::from_secs(1));
        assert_eq!(config.reconnect.max_delay, Duration::from_secs(30));
        assert_eq!(config.reconnect.multiplier, 2.0);
        config.validate().unwrap();
    }

    #[test]
    fn from_json_fills_defaults() {
        let config = SessionConfig::from_json(
            r#"{
                "host": "amp.local",
                "port": 9591,
                "reconnect": { "initial_delay_ms": 250, "max_delay_ms": 4000 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.host, "amp.local");
        assert_eq!(config.port, 9591);
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.reconnect.initial_delay, Duration::from_millis(250));
        assert_eq!(config.reconnect.max_delay, Duration::from_secs(4));
        assert_eq!(config.reconnect.multiplier, 2.0);
    }

    #[test]
    fn json_round_trip_uses_millis() {
        let config = SessionConfig::new("amp").with_handshake_timeout(Duration::from_millis(750));
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["handshake_timeout_ms"], 750);
        assert_eq!(json["reconnect"]["max_delay_ms"], 30_000);
    }

    #[test]
    fn validate_rejects_bad_values() {
        assert!(SessionConfig::new("").validate().is_err());
        assert!(SessionConfig::new("amp").with_port(0).validate().is_err());
        assert!(SessionConfig::new("amp").with_max_line_len(0).validate().is_err());

        let inverted = ReconnectConfig {
            initial_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(1),
            ..ReconnectConfig::default()
        };
        assert!(inverted.validate().is_err());

        let shrinking = ReconnectConfig {
            multiplier: 0.5,
            ..ReconnectConfig::default()
        };
        assert!(shrinking.validate().is_err());

        let noisy = ReconnectConfig {
            jitter: 1.5,
            ..ReconnectConfig::default()
        };
        assert!(noisy.validate().is_err());
    }

    #[test]
    fn from_json_rejects_invalid_config() {
        let err = SessionConfig::from_json(r#"{ "host": "amp", "port": 0 }"#).unwrap_err();
        assert!(matches!(err, RotelError::InvalidConfig(_)));

        let err = SessionConfig::from_json(r#"{ "port": 9590 }"#).unwrap_err();
        assert!(matches!(err, RotelError::Json(_)));
    }
}
