//! Built-in stages
//!
//! | Type                    | Kind        | Purpose                                  |
//! |-------------------------|-------------|------------------------------------------|
//! | `basic-operations-test` | distributed | get/put/remove stress test               |
//! | `sleep`                 | distributed | wait for a fixed duration                |
//! | `analyze-test`          | master      | gate the run on a recorded test result   |

use crate::config::StressTestConfig;
use crate::scenario::Properties;
use crate::stage::{Stage, StageError, StageRegistry};

mod analyze_test;
mod basic_operations;
mod sleep;

pub use analyze_test::{AnalyzeTest, Metric, ANALYZE_TEST};
pub use basic_operations::{ops, BasicOperationsTest, BASIC_OPERATIONS_TEST};
pub use sleep::{SleepStage, SLEEP};

/// Test name used when a stress stage does not set one
pub const DEFAULT_TEST_NAME: &str = "default";

/// Test name whose results are never added to the report
pub const WARMUP_TEST_NAME: &str = "warmup";

/// Stress stage property names
pub mod props {
    /// Threads split across all executing workers
    pub const TOTAL_THREADS: &str = "total-threads";
    /// Threads on every executing worker
    pub const THREADS_PER_NODE: &str = "num-threads-per-node";
    /// Measured duration
    pub const DURATION: &str = "duration";
    /// Measured operations per worker when no duration is set
    pub const NUM_REQUESTS: &str = "num-requests";
    /// Warmup before measurement
    pub const RAMP_UP: &str = "ramp-up";
    /// Upper bound on the whole test
    pub const TIMEOUT: &str = "timeout";
    /// Pause after every operation
    pub const THINK_TIME: &str = "think-time";
    /// Minimum interval between operations of one thread
    pub const REQUEST_PERIOD: &str = "request-period";
    /// `never`, `always` or `if-transactional`
    pub const TRANSACTION_MODE: &str = "transaction-mode";
    /// Operations per transaction
    pub const TRANSACTION_SIZE: &str = "transaction-size";
    /// Commit (true) or roll back (false) batches
    pub const COMMIT_TRANSACTIONS: &str = "commit-transactions";
    /// Log commit and rollback failures
    pub const LOG_TRANSACTION_EXCEPTIONS: &str = "log-transaction-exceptions";
    /// Lockstep threads
    pub const SYNCHRONOUS_REQUESTS: &str = "synchronous-requests";
    /// Terminate on the first failed operation
    pub const EXIT_ON_FAILURE: &str = "exit-on-failure";
    /// One statistics entry per worker instead of per thread
    pub const MERGE_THREAD_STATS: &str = "merge-thread-stats";
    /// Count progress logging period
    pub const LOG_PERIOD: &str = "log-period";
    /// Name results are reported under
    pub const TEST_NAME: &str = "test-name";
    /// Append an iteration to an existing test
    pub const AMEND_TEST: &str = "amend-test";
    /// Deterministic seed for the engine's random generators
    pub const SEED: &str = "seed";
}

/// Register every built-in stage
pub fn register_builtin(registry: &mut StageRegistry) {
    registry.register(BASIC_OPERATIONS_TEST, |properties: &Properties| {
        Ok(Stage::Distributed(Box::new(BasicOperationsTest::from_properties(
            properties,
        )?)))
    });
    registry.register(SLEEP, |properties: &Properties| {
        Ok(Stage::Distributed(Box::new(SleepStage::from_properties(
            properties,
        )?)))
    });
    registry.register(ANALYZE_TEST, |properties: &Properties| {
        Ok(Stage::Master(Box::new(AnalyzeTest::from_properties(
            properties,
        )?)))
    });
}

/// Read and validate stress settings from stage properties
///
/// Misconfiguration is reported here, before any engine thread exists.
pub fn stress_config(properties: &Properties) -> Result<StressTestConfig, StageError> {
    let defaults = StressTestConfig::default();
    let config = StressTestConfig {
        total_threads: properties.parse(props::TOTAL_THREADS)?,
        threads_per_node: properties.parse(props::THREADS_PER_NODE)?,
        duration: properties.duration(props::DURATION)?,
        num_requests: properties.parse_or(props::NUM_REQUESTS, defaults.num_requests)?,
        ramp_up: properties
            .duration(props::RAMP_UP)?
            .unwrap_or(defaults.ramp_up),
        timeout: properties.duration(props::TIMEOUT)?,
        think_time: properties
            .duration(props::THINK_TIME)?
            .unwrap_or(defaults.think_time),
        request_period: properties.duration(props::REQUEST_PERIOD)?,
        transaction_mode: properties
            .parse_or(props::TRANSACTION_MODE, defaults.transaction_mode)?,
        transaction_size: properties
            .parse_or(props::TRANSACTION_SIZE, defaults.transaction_size)?,
        commit_transactions: properties
            .parse_or(props::COMMIT_TRANSACTIONS, defaults.commit_transactions)?,
        log_transaction_exceptions: properties.parse_or(
            props::LOG_TRANSACTION_EXCEPTIONS,
            defaults.log_transaction_exceptions,
        )?,
        synchronous_requests: properties
            .parse_or(props::SYNCHRONOUS_REQUESTS, defaults.synchronous_requests)?,
        exit_on_failure: properties.parse_or(props::EXIT_ON_FAILURE, defaults.exit_on_failure)?,
        merge_thread_stats: properties
            .parse_or(props::MERGE_THREAD_STATS, defaults.merge_thread_stats)?,
        log_period: properties.parse_or(props::LOG_PERIOD, defaults.log_period)?,
    };
    config.validate()?;
    config.allocation()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigError, TransactionMode};
    use std::time::Duration;

    #[test]
    fn test_stress_config_from_properties() {
        let properties = Properties::new()
            .with("total-threads", "4")
            .with("duration", "2s")
            .with("ramp-up", "500ms")
            .with("transaction-mode", "always")
            .with("transaction-size", "3")
            .with("commit-transactions", "false")
            .with("merge-thread-stats", "true");

        let config = stress_config(&properties).unwrap();
        assert_eq!(config.total_threads, Some(4));
        assert_eq!(config.threads_per_node, None);
        assert_eq!(config.duration, Some(Duration::from_secs(2)));
        assert_eq!(config.ramp_up, Duration::from_millis(500));
        assert_eq!(config.transaction_mode, TransactionMode::Always);
        assert_eq!(config.transaction_size, 3);
        assert!(!config.commit_transactions);
        assert!(config.merge_thread_stats);
    }

    #[test]
    fn test_stress_config_rejects_both_allocations() {
        let properties = Properties::new()
            .with("total-threads", "4")
            .with("num-threads-per-node", "2");
        assert!(matches!(
            stress_config(&properties),
            Err(StageError::Config(ConfigError::ThreadAllocation(_)))
        ));
    }

    #[test]
    fn test_stress_config_rejects_neither_allocation() {
        assert!(matches!(
            stress_config(&Properties::new().with("duration", "1s")),
            Err(StageError::Config(ConfigError::ThreadAllocation(_)))
        ));
    }

    #[test]
    fn test_stress_config_rejects_bad_values() {
        let properties = Properties::new()
            .with("num-threads-per-node", "2")
            .with("transaction-mode", "sometimes");
        assert!(matches!(
            stress_config(&properties),
            Err(StageError::InvalidProperty { .. })
        ));
    }
}
