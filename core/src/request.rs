//! Operation kinds and timed request records

use std::borrow::Cow;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Suffix distinguishing an operation that ran as a whole transaction
const TX_SUFFIX: &str = ".TX";

/// Named kind of operation, e.g. `BasicOperations.Get`
///
/// Statistics are kept per operation kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Operation(Cow<'static, str>);

impl Operation {
    /// Operation from a static name
    pub const fn from_static(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    /// Operation from an owned name
    pub fn new(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into()))
    }

    /// Operation name
    pub fn name(&self) -> &str {
        &self.0
    }

    /// Kind used when this operation was the only one in its transaction
    pub fn tx_variant(&self) -> Operation {
        Operation::new(format!("{}{}", self.0, TX_SUFFIX))
    }

    /// Whether this is one of the synthetic transaction kinds
    pub fn is_transactional(&self) -> bool {
        self.0.starts_with("Transactional.") || self.0.ends_with(TX_SUFFIX)
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&'static str> for Operation {
    fn from(name: &'static str) -> Self {
        Self::from_static(name)
    }
}

/// Synthetic kinds recorded around transaction batches
pub mod transactional {
    use super::Operation;

    /// Opening a batch
    pub const BEGIN: Operation = Operation::from_static("Transactional.Begin");
    /// Committing a batch
    pub const COMMIT: Operation = Operation::from_static("Transactional.Commit");
    /// Rolling back a batch
    pub const ROLLBACK: Operation = Operation::from_static("Transactional.Rollback");
    /// Whole batch, from begin to the end of commit or rollback
    pub const DURATION: Operation = Operation::from_static("Transactional.Duration");
}

/// Result of a timed request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Not yet finished
    Pending,
    /// Finished successfully
    Succeeded,
    /// Finished with an error
    Failed,
}

/// One timed invocation
///
/// The request is always created so an operation executes identically
/// whether or not it ends up in the statistics.
#[derive(Debug, Clone)]
pub struct Request {
    started: Instant,
    started_at: DateTime<Utc>,
    operation: Option<Operation>,
    outcome: Outcome,
    duration: Duration,
}

impl Request {
    /// Start timing now
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
            started_at: Utc::now(),
            operation: None,
            outcome: Outcome::Pending,
            duration: Duration::ZERO,
        }
    }

    /// Stop timing and mark as successful
    pub fn succeeded(&mut self, operation: Operation) {
        self.finish(operation, Outcome::Succeeded);
    }

    /// Stop timing and mark as failed
    pub fn failed(&mut self, operation: Operation) {
        self.finish(operation, Outcome::Failed);
    }

    fn finish(&mut self, operation: Operation, outcome: Outcome) {
        self.duration = self.started.elapsed();
        self.operation = Some(operation);
        self.outcome = outcome;
    }

    /// Operation kind, once finished
    pub fn operation(&self) -> Option<&Operation> {
        self.operation.as_ref()
    }

    /// Outcome so far
    pub fn outcome(&self) -> &Outcome {
        &self.outcome
    }

    /// Whether the request finished successfully
    pub fn is_successful(&self) -> bool {
        self.outcome == Outcome::Succeeded
    }

    /// Wall-clock start time
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Time between start and finish
    pub fn duration(&self) -> Duration {
        self.duration
    }
}

#[cfg(test)]
mod tests {
    use super::transactional::*;
    use super::*;

    #[test]
    fn test_tx_variant() {
        let op = Operation::from_static("BasicOperations.Get");
        assert_eq!(op.tx_variant().name(), "BasicOperations.Get.TX");
        assert!(op.tx_variant().is_transactional());
        assert!(!op.is_transactional());
        assert!(COMMIT.is_transactional());
    }

    #[test]
    fn test_owned_and_static_names_compare_equal() {
        assert_eq!(Operation::new("Transactional.Begin"), BEGIN);
    }

    #[test]
    fn test_operation_serializes_as_string() {
        let json = serde_json::to_string(&ROLLBACK).unwrap();
        assert_eq!(json, "\"Transactional.Rollback\"");
    }

    #[test]
    fn test_request_outcomes() {
        let mut ok = Request::start();
        assert_eq!(ok.outcome(), &Outcome::Pending);
        ok.succeeded(BEGIN);
        assert!(ok.is_successful());
        assert_eq!(ok.operation(), Some(&BEGIN));

        let mut failed = Request::start();
        std::thread::sleep(Duration::from_millis(2));
        failed.failed(COMMIT);
        assert!(!failed.is_successful());
        assert!(failed.duration() >= Duration::from_millis(2));
    }
}
