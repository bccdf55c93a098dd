//! Error types for gridbench-core

use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;
use crate::protocol::ProtocolError;
use crate::stage::StageError;

/// Core error type
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Required builder field was never set
    #[error("missing configuration: {0}")]
    MissingConfig(String),

    /// Wire protocol error; fatal for the affected connection
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Stage resolution or execution error
    #[error("stage error: {0}")]
    Stage(#[from] StageError),

    /// A stress test did not finish within its timeout budget
    #[error("test did not finish within {0:?}")]
    Timeout(Duration),

    /// A stress test was terminated by one of its threads
    #[error("stress test terminated: {0}")]
    Terminated(String),

    /// Orchestration error
    #[error("orchestration error: {0}")]
    Orchestration(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Shorthand for a builder field that was never set
    pub fn missing_config(field: &str) -> Self {
        Self::MissingConfig(field.to_string())
    }

    /// Shorthand for an orchestration failure
    pub fn orchestration(msg: impl Into<String>) -> Self {
        Self::Orchestration(msg.into())
    }

    /// Whether the error means a peer is gone and the run cannot continue
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::Io(_))
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
