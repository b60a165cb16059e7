//! Peer configuration.
//!
//! Parsed by the binary from flags and `PEERBOARD_*` environment variables;
//! library code only sees the typed struct.

use std::time::Duration;

use crate::board::PeerAddr;
use crate::session::SessionLimits;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 4000;
pub const DEFAULT_INDEX_PORT: u16 = 3999;
pub const DEFAULT_SNAPSHOT_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 3_000;
pub const DEFAULT_SEND_QUEUE: usize = 256;
pub const DEFAULT_MAX_FRAME_BYTES: usize = frames::MAX_FRAME_BYTES;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("invalid host: {0:?}")]
    InvalidHost(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    /// Host other peers use to reach this one. Also the host part of every
    /// board id minted here.
    pub host: String,
    pub port: u16,
    /// Directory service `host:port`, if any.
    pub index: Option<PeerAddr>,
    pub snapshot_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub send_queue: usize,
    pub max_frame_bytes: usize,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_owned(),
            port: DEFAULT_PORT,
            index: None,
            snapshot_timeout_ms: DEFAULT_SNAPSHOT_TIMEOUT_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            send_queue: DEFAULT_SEND_QUEUE,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl PeerConfig {
    /// Reject values that would make the peer unusable.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() || self.host.contains([':', '%']) {
            return Err(ConfigError::InvalidHost(self.host.clone()));
        }
        if self.snapshot_timeout_ms == 0 {
            return Err(ConfigError::Zero("snapshot timeout"));
        }
        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::Zero("connect timeout"));
        }
        if self.send_queue == 0 {
            return Err(ConfigError::Zero("send queue"));
        }
        if self.max_frame_bytes == 0 {
            return Err(ConfigError::Zero("max frame bytes"));
        }
        Ok(())
    }

    /// This peer's own `host:port`; boards whose owner matches it are local.
    #[must_use]
    pub fn local_peer(&self) -> PeerAddr {
        PeerAddr::new(self.host.clone(), self.port)
    }

    #[must_use]
    pub fn session_limits(&self) -> SessionLimits {
        SessionLimits { send_queue: self.send_queue, max_frame_bytes: self.max_frame_bytes }
    }

    #[must_use]
    pub fn snapshot_timeout(&self) -> Duration {
        Duration::from_millis(self.snapshot_timeout_ms)
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
