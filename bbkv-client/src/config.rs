//! # Client Configuration
//!
//! Purpose: Carry address, credentials, pool bounds, per-call timeout, and
//! watch retry policy in one serde-friendly struct that an application's
//! config loader can fill from JSON, or from a `redis://` URL.
//!
//! Durations are plain millisecond integers so the JSON stays flat.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ClientError, ClientResult};
use crate::pool::PoolConfig;
use crate::watch::{Backoff, RetryPolicy};

const DEFAULT_PORT: u16 = 6379;

/// Backoff policy in config form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum BackoffConfig {
    None,
    Fixed { delay_ms: u64 },
    Exponential { base_ms: u64, max_ms: u64 },
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig::Exponential { base_ms: 8, max_ms: 256 }
    }
}

impl From<BackoffConfig> for Backoff {
    fn from(config: BackoffConfig) -> Self {
        match config {
            BackoffConfig::None => Backoff::None,
            BackoffConfig::Fixed { delay_ms } => Backoff::Fixed(Duration::from_millis(delay_ms)),
            BackoffConfig::Exponential { base_ms, max_ms } => Backoff::Exponential {
                base: Duration::from_millis(base_ms),
                max: Duration::from_millis(max_ms),
            },
        }
    }
}

/// Configuration for the synchronous client and its pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server address, e.g. "127.0.0.1:6379".
    pub addr: String,
    /// Sent with `AUTH` on every new connection when set.
    pub password: Option<String>,
    /// Logical database; non-zero values are sent with `SELECT`.
    pub db: u32,
    /// Maximum total connections (idle + in-use).
    pub max_open: usize,
    /// Maximum idle connections kept in the pool.
    pub max_idle: usize,
    /// Idle connections older than this are closed; 0 keeps them forever.
    pub idle_timeout_ms: u64,
    /// TCP connect timeout; 0 leaves only the call deadline.
    pub connect_timeout_ms: u64,
    /// Deadline applied to each facade call.
    pub call_timeout_ms: u64,
    /// Attempts a watch session may use, including the first.
    pub max_watch_attempts: u32,
    /// Pause between conflicted watch attempts.
    pub backoff: BackoffConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            addr: "127.0.0.1:6379".to_string(),
            password: None,
            db: 0,
            max_open: 20,
            max_idle: 10,
            idle_timeout_ms: 5 * 60 * 1000,
            connect_timeout_ms: 0,
            call_timeout_ms: 500,
            max_watch_attempts: RetryPolicy::default().max_attempts,
            backoff: BackoffConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Parses and validates a JSON document; missing fields take defaults.
    pub fn from_json_str(json: &str) -> ClientResult<Self> {
        let config: ClientConfig =
            serde_json::from_str(json).map_err(|err| ClientError::InvalidConfig(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> ClientResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|err| ClientError::InvalidConfig(format!("{}: {}", path.display(), err)))?;
        Self::from_json_str(&text)
    }

    /// Parses `redis://[[user]:password@]host[:port][/db]`; other fields take defaults.
    pub fn from_url(url: &str) -> ClientResult<Self> {
        let rest = url
            .strip_prefix("redis://")
            .ok_or_else(|| ClientError::InvalidConfig(format!("unsupported url scheme: {}", url)))?;

        let mut config = ClientConfig::default();
        let host_part = match rest.rsplit_once('@') {
            Some((userinfo, host)) => {
                let password = match userinfo.split_once(':') {
                    Some((_, password)) => password,
                    None => userinfo,
                };
                if !password.is_empty() {
                    config.password = Some(password.to_string());
                }
                host
            }
            None => rest,
        };

        let (host, db) = match host_part.split_once('/') {
            Some((host, "")) => (host, 0),
            Some((host, db)) => {
                let db = db
                    .parse()
                    .map_err(|_| ClientError::InvalidConfig(format!("invalid db index: {}", db)))?;
                (host, db)
            }
            None => (host_part, 0),
        };
        if host.is_empty() {
            return Err(ClientError::InvalidConfig("url has no host".into()));
        }
        config.addr = if host.contains(':') {
            host.to_string()
        } else {
            format!("{}:{}", host, DEFAULT_PORT)
        };
        config.db = db;
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the pool or watch sessions cannot honour.
    pub fn validate(&self) -> ClientResult<()> {
        if self.addr.is_empty() {
            return Err(ClientError::InvalidConfig("addr must not be empty".into()));
        }
        if self.max_idle > self.max_open {
            return Err(ClientError::InvalidConfig(format!(
                "max_idle ({}) exceeds max_open ({})",
                self.max_idle, self.max_open
            )));
        }
        if self.call_timeout_ms == 0 {
            return Err(ClientError::InvalidConfig("call_timeout_ms must be positive".into()));
        }
        if self.max_watch_attempts == 0 {
            return Err(ClientError::InvalidConfig("max_watch_attempts must be at least 1".into()));
        }
        Ok(())
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_watch_attempts,
            backoff: self.backoff.into(),
        }
    }

    pub(crate) fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            addr: self.addr.clone(),
            password: self.password.clone(),
            db: self.db,
            max_open: self.max_open,
            max_idle: self.max_idle,
            idle_timeout: non_zero_ms(self.idle_timeout_ms),
            connect_timeout: non_zero_ms(self.connect_timeout_ms),
        }
    }
}

fn non_zero_ms(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_fills_missing_fields_with_defaults() {
        let config = ClientConfig::from_json_str(
            r#"{"addr": "10.0.0.5:6380", "max_open": 4, "max_idle": 2,
                "backoff": {"kind": "fixed", "delay_ms": 20}}"#,
        )
        .unwrap();
        assert_eq!(config.addr, "10.0.0.5:6380");
        assert_eq!(config.max_open, 4);
        assert_eq!(config.call_timeout(), Duration::from_millis(500));
        assert_eq!(config.retry_policy().backoff, Backoff::Fixed(Duration::from_millis(20)));
    }

    #[test]
    fn json_validation_errors_surface() {
        let err = ClientConfig::from_json_str(r#"{"max_open": 1, "max_idle": 5}"#).unwrap_err();
        assert!(matches!(err, ClientError::InvalidConfig(_)));
        let err = ClientConfig::from_json_str("{not json").unwrap_err();
        assert!(matches!(err, ClientError::InvalidConfig(_)));
    }

    #[test]
    fn url_with_password_and_db() {
        let config = ClientConfig::from_url("redis://:s3cret@cache.local:6390/2").unwrap();
        assert_eq!(config.addr, "cache.local:6390");
        assert_eq!(config.password.as_deref(), Some("s3cret"));
        assert_eq!(config.db, 2);
    }

    #[test]
    fn url_defaults_port() {
        let config = ClientConfig::from_url("redis://localhost").unwrap();
        assert_eq!(config.addr, "localhost:6379");
        assert_eq!(config.password, None);
        assert_eq!(config.db, 0);
    }

    #[test]
    fn url_rejects_other_schemes() {
        assert!(ClientConfig::from_url("http://localhost").is_err());
        assert!(ClientConfig::from_url("redis://localhost/abc").is_err());
        assert!(ClientConfig::from_url("redis://").is_err());
    }

    #[test]
    fn pool_config_maps_zero_to_none() {
        let mut config = ClientConfig::default();
        config.idle_timeout_ms = 0;
        let pool = config.pool_config();
        assert_eq!(pool.idle_timeout, None);
        assert_eq!(pool.connect_timeout, None);
        assert_eq!(pool.max_open, 20);
    }
}
