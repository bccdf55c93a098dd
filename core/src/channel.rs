//! Channel configuration for master/worker communication

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default port the master listens on
pub const DEFAULT_PORT: u16 = 2103;

/// Default time the master waits for the whole fleet to connect
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(300);

/// Default upper bound for one length-prefixed frame
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Socket configuration shared by master and workers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Interface the master binds to
    pub host: String,

    /// Port the master binds to
    pub port: u16,

    /// Time the master waits for all workers to connect
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Largest accepted frame; larger frames fail the connection
    pub max_frame_len: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl ChannelConfig {
    /// Set the bind host
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the bind port; 0 picks an ephemeral port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the fleet connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the maximum frame length
    pub fn with_max_frame_len(mut self, len: usize) -> Self {
        self.max_frame_len = len;
        self
    }

    /// `host:port` string suitable for binding
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
