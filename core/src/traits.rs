//! Capability traits a service under test may implement
//!
//! Stages never talk to a concrete service type. A service publishes the
//! capabilities it supports into a [`crate::capability::Capabilities`] map
//! and stages declare which of them they need.

use std::sync::Arc;

use async_trait::async_trait;

// ============================================================================
// Errors
// ============================================================================

/// Error returned by a capability call or an operation invocation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OperationError {
    /// The operation failed; the test keeps running and counts an error
    #[error("operation failed: {0}")]
    Failed(String),

    /// A transaction could not be started, committed or rolled back
    #[error("transaction failed: {0}")]
    Transaction(String),

    /// The engine cannot continue; the whole test is terminated
    #[error("unrecoverable: {0}")]
    Unrecoverable(String),
}

impl OperationError {
    /// Shorthand for a recoverable failure
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }

    /// Shorthand for an unrecoverable failure
    pub fn unrecoverable(msg: impl Into<String>) -> Self {
        Self::Unrecoverable(msg.into())
    }

    /// Whether this error terminates the whole test
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unrecoverable(_))
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

/// Service that can be started and stopped between topologies
#[async_trait]
pub trait Lifecycle: Send + Sync {
    /// Start the service
    async fn start(&self) -> Result<(), OperationError>;

    /// Stop the service
    async fn stop(&self) -> Result<(), OperationError>;

    /// Whether the service is running
    fn is_running(&self) -> bool;
}

// ============================================================================
// Data access
// ============================================================================

/// Key/value access to the service
#[async_trait]
pub trait BasicOperations: Send + Sync {
    /// Read a value
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, OperationError>;

    /// Write a value
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), OperationError>;

    /// Remove a value, returning whether it existed
    async fn remove(&self, key: &str) -> Result<bool, OperationError>;
}

// ============================================================================
// Transactions
// ============================================================================

/// Service supporting transactions
pub trait Transactional: Send + Sync {
    /// Whether the named resource participates in transactions
    fn is_transactional(&self, resource: &str) -> bool;

    /// Create a new, not yet started transaction
    fn transaction(&self) -> Box<dyn Transaction>;
}

/// One transaction
///
/// Operations reach the transaction through the views returned by
/// [`Transaction::wrap_basic`], which the operation logic installs when a
/// batch opens.
#[async_trait]
pub trait Transaction: Send + Sync {
    /// View of `operations` bound to this transaction
    fn wrap_basic(&self, operations: Arc<dyn BasicOperations>) -> Arc<dyn BasicOperations> {
        operations
    }

    /// Start the transaction
    async fn begin(&mut self) -> Result<(), OperationError>;

    /// Make the transaction's writes visible
    async fn commit(&mut self) -> Result<(), OperationError>;

    /// Discard the transaction's writes
    async fn rollback(&mut self) -> Result<(), OperationError>;
}

// ============================================================================
// Cluster membership
// ============================================================================

/// Service that forms a cluster of its own
pub trait Clustered: Send + Sync {
    /// Whether this node coordinates the service cluster
    fn is_coordinator(&self) -> bool;

    /// Names of the current members
    fn members(&self) -> Vec<String>;
}
