use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::AppError;
use crate::stream::connection::DEFAULT_SEND_BUFFER;

/// Environment variable prefix for every setting
pub const ENV_PREFIX: &str = "NOTIFICATION_STREAM_";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub app: AppConfig,
    pub stream: StreamSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
}

/// Timer constants and limits for the stream engine
///
/// Set once at construction; the heartbeat timer never re-reads them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSettings {
    /// How often every connection is pinged
    pub ping_interval: Duration,
    /// Connections without liveness evidence for this long are evicted
    pub liveness_timeout: Duration,
    /// Reconnect hint sent with the `connected` event
    pub retry_ms: Option<u64>,
    /// Upper bound on concurrently open connections
    pub max_connections: Option<usize>,
    /// Unread frames buffered per client before writes to it fail
    pub send_buffer: usize,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            liveness_timeout: Duration::from_secs(60),
            retry_ms: Some(3000),
            max_connections: None,
            send_buffer: DEFAULT_SEND_BUFFER,
        }
    }
}

impl StreamSettings {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.ping_interval.is_zero() {
            return Err(AppError::Config("ping interval must be positive".into()));
        }
        if self.liveness_timeout <= self.ping_interval {
            return Err(AppError::Config(format!(
                "liveness timeout ({}s) must exceed ping interval ({}s)",
                self.liveness_timeout.as_secs(),
                self.ping_interval.as_secs()
            )));
        }
        if self.max_connections == Some(0) {
            return Err(AppError::Config("max connections must be positive".into()));
        }
        if self.send_buffer == 0 {
            return Err(AppError::Config("send buffer must be positive".into()));
        }
        Ok(())
    }
}

/// Flat view of the prefixed environment variables
#[derive(Debug, Deserialize)]
struct EnvSettings {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_ping_interval_secs")]
    ping_interval_secs: u64,
    #[serde(default = "default_liveness_timeout_secs")]
    liveness_timeout_secs: u64,
    #[serde(default = "default_retry_ms")]
    retry_ms: u64,
    max_connections: Option<usize>,
    #[serde(default = "default_send_buffer")]
    send_buffer: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_ping_interval_secs() -> u64 {
    30
}

fn default_liveness_timeout_secs() -> u64 {
    60
}

fn default_retry_ms() -> u64 {
    3000
}

fn default_send_buffer() -> usize {
    DEFAULT_SEND_BUFFER
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        dotenvy::dotenv().ok();
        let env: EnvSettings = envy::prefixed(ENV_PREFIX).from_env()?;
        Self::from_settings(env)
    }

    /// Build from an explicit set of `(KEY, value)` pairs, without prefix
    pub fn from_vars<I>(vars: I) -> Result<Self, AppError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let env: EnvSettings = envy::from_iter(vars)?;
        Self::from_settings(env)
    }

    fn from_settings(env: EnvSettings) -> Result<Self, AppError> {
        let stream = StreamSettings {
            ping_interval: Duration::from_secs(env.ping_interval_secs),
            liveness_timeout: Duration::from_secs(env.liveness_timeout_secs),
            // 0 disables the hint
            retry_ms: (env.retry_ms > 0).then_some(env.retry_ms),
            max_connections: env.max_connections,
            send_buffer: env.send_buffer,
        };
        stream.validate()?;

        Ok(Config {
            app: AppConfig {
                host: env.host,
                port: env.port,
            },
            stream,
        })
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.app.host, self.app.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_vars(Vec::new()).unwrap();
        assert_eq!(config.bind_address(), "0.0.0.0:8000");
        assert_eq!(config.stream, StreamSettings::default());
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_vars(vars(&[
            ("PORT", "9100"),
            ("PING_INTERVAL_SECS", "10"),
            ("LIVENESS_TIMEOUT_SECS", "25"),
            ("RETRY_MS", "0"),
            ("MAX_CONNECTIONS", "500"),
            ("SEND_BUFFER", "16"),
        ]))
        .unwrap();

        assert_eq!(config.app.port, 9100);
        assert_eq!(config.stream.ping_interval, Duration::from_secs(10));
        assert_eq!(config.stream.liveness_timeout, Duration::from_secs(25));
        assert_eq!(config.stream.retry_ms, None);
        assert_eq!(config.stream.max_connections, Some(500));
        assert_eq!(config.stream.send_buffer, 16);
    }

    #[test]
    fn test_timeout_must_exceed_interval() {
        let result = Config::from_vars(vars(&[
            ("PING_INTERVAL_SECS", "30"),
            ("LIVENESS_TIMEOUT_SECS", "30"),
        ]));
        assert!(matches!(result, Err(AppError::Config(_))));
    }

    #[test]
    fn test_invalid_number_is_config_error() {
        let result = Config::from_vars(vars(&[("PORT", "not-a-port")]));
        assert!(matches!(result, Err(AppError::Config(_))));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let settings = StreamSettings {
            max_connections: Some(0),
            ..StreamSettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_zero_send_buffer_rejected() {
        let result = Config::from_vars(vars(&[("SEND_BUFFER", "0")]));
        assert!(matches!(result, Err(AppError::Config(_))));
    }
}
