//! Connector timing configuration.
//!
//! Defaults match the behaviour of a typical bus client: one-second poll and
//! block windows, one-second reconnect backoff and 100ms idle sleeps. Each
//! value can be overridden from the environment:
//!
//! | variable                        | field                 |
//! |---------------------------------|-----------------------|
//! | `BUSLINE_POLL_TIMEOUT_MS`       | `poll_timeout_ms`     |
//! | `BUSLINE_RECONNECT_BACKOFF_MS`  | `reconnect_backoff_ms`|
//! | `BUSLINE_STREAM_BLOCK_MS`       | `stream_block_ms`     |
//! | `BUSLINE_DIRECT_IDLE_MS`        | `direct_idle_ms`      |
//! | `BUSLINE_STREAM_IDLE_MS`        | `stream_idle_ms`      |

use std::time::Duration;

use serde::Deserialize;

use crate::error::ConnectorError;

pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 1000;
pub const DEFAULT_RECONNECT_BACKOFF_MS: u64 = 1000;
pub const DEFAULT_STREAM_BLOCK_MS: u64 = 1000;
pub const DEFAULT_DIRECT_IDLE_MS: u64 = 100;
pub const DEFAULT_STREAM_IDLE_MS: u64 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConnectorConfig {
    /// How long the pub/sub listener waits in each `poll_next`.
    pub poll_timeout_ms: u64,
    /// Sleep after a connectivity failure before retrying.
    pub reconnect_backoff_ms: u64,
    /// How long stream listeners block in each `stream_read`.
    pub stream_block_ms: u64,
    /// Sleep of a newest-only listener after an empty read.
    pub direct_idle_ms: u64,
    /// Sleep of the queued stream listener while no topic is registered.
    pub stream_idle_ms: u64,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: DEFAULT_POLL_TIMEOUT_MS,
            reconnect_backoff_ms: DEFAULT_RECONNECT_BACKOFF_MS,
            stream_block_ms: DEFAULT_STREAM_BLOCK_MS,
            direct_idle_ms: DEFAULT_DIRECT_IDLE_MS,
            stream_idle_ms: DEFAULT_STREAM_IDLE_MS,
        }
    }
}

impl ConnectorConfig {
    /// Defaults overridden by `BUSLINE_*` environment variables.
    pub fn from_env() -> Result<Self, ConnectorError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConnectorError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let overrides: [(&str, &mut u64); 5] = [
            ("BUSLINE_POLL_TIMEOUT_MS", &mut config.poll_timeout_ms),
            ("BUSLINE_RECONNECT_BACKOFF_MS", &mut config.reconnect_backoff_ms),
            ("BUSLINE_STREAM_BLOCK_MS", &mut config.stream_block_ms),
            ("BUSLINE_DIRECT_IDLE_MS", &mut config.direct_idle_ms),
            ("BUSLINE_STREAM_IDLE_MS", &mut config.stream_idle_ms),
        ];
        for (key, field) in overrides {
            if let Some(raw) = lookup(key) {
                *field = raw.trim().parse().map_err(|_| {
                    ConnectorError::InvalidArgument(format!("{key} must be milliseconds, got `{raw}`"))
                })?;
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Every interval must be non-zero; a zero wait turns a loop into a spin.
    pub fn validate(&self) -> Result<(), ConnectorError> {
        let fields = [
            ("poll_timeout_ms", self.poll_timeout_ms),
            ("reconnect_backoff_ms", self.reconnect_backoff_ms),
            ("stream_block_ms", self.stream_block_ms),
            ("direct_idle_ms", self.direct_idle_ms),
            ("stream_idle_ms", self.stream_idle_ms),
        ];
        match fields.iter().find(|(_, value)| *value == 0) {
            Some((name, _)) => Err(ConnectorError::InvalidArgument(format!(
                "{name} must be greater than zero"
            ))),
            None => Ok(()),
        }
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn stream_block(&self) -> Duration {
        Duration::from_millis(self.stream_block_ms)
    }

    pub fn direct_idle(&self) -> Duration {
        Duration::from_millis(self.direct_idle_ms)
    }

    pub fn stream_idle(&self) -> Duration {
        Duration::from_millis(self.stream_idle_ms)
    }
}
