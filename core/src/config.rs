//! Stress test configuration types

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default number of measured operations when no duration is set
pub const DEFAULT_NUM_REQUESTS: u64 = 50_000;

/// How engine threads are distributed across the participating workers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadAllocation {
    /// Every participating worker runs this many threads
    PerNode(usize),
    /// This many threads are split fairly across participating workers
    Total(usize),
}

/// When operations are grouped into transaction batches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransactionMode {
    /// Never use transactions
    Never,
    /// Always use transactions; the service must be transactional
    Always,
    /// Use transactions when the target resource is transactional
    #[default]
    IfTransactional,
}

impl FromStr for TransactionMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "never" => Ok(Self::Never),
            "always" => Ok(Self::Always),
            "if-transactional" => Ok(Self::IfTransactional),
            other => Err(ConfigError::InvalidTransaction(format!(
                "unknown transaction mode '{other}'"
            ))),
        }
    }
}

/// Configuration of one stress test run on one worker
///
/// Exactly one of `total_threads` and `threads_per_node` must be set, and
/// the run is bounded either by `duration` or by `num_requests`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StressTestConfig {
    /// Threads split across all participating workers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_threads: Option<usize>,

    /// Threads started on every participating worker
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threads_per_node: Option<usize>,

    /// Measured duration; takes precedence over `num_requests`
    #[serde(with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub duration: Option<Duration>,

    /// Measured operations across all threads of this worker
    pub num_requests: u64,

    /// Warmup period before measurement starts
    #[serde(with = "humantime_serde")]
    pub ramp_up: Duration,

    /// Upper bound on ramp-up, measurement and drain together
    #[serde(with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,

    /// Pause after every operation
    #[serde(with = "humantime_serde")]
    pub think_time: Duration,

    /// Minimum interval between operations of one thread
    #[serde(with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub request_period: Option<Duration>,

    /// Transaction usage
    pub transaction_mode: TransactionMode,

    /// Operations per transaction batch
    pub transaction_size: usize,

    /// Commit batches when true, roll them back otherwise
    pub commit_transactions: bool,

    /// Log failures to commit or roll back
    pub log_transaction_exceptions: bool,

    /// Run all threads of the worker in lockstep
    pub synchronous_requests: bool,

    /// Terminate the whole test on the first failed operation
    pub exit_on_failure: bool,

    /// Collapse per-thread statistics into one aggregate
    pub merge_thread_stats: bool,

    /// Progress is logged every this many operations
    pub log_period: u64,
}

impl Default for StressTestConfig {
    fn default() -> Self {
        Self {
            total_threads: None,
            threads_per_node: None,
            duration: None,
            num_requests: DEFAULT_NUM_REQUESTS,
            ramp_up: Duration::ZERO,
            timeout: None,
            think_time: Duration::ZERO,
            request_period: None,
            transaction_mode: TransactionMode::default(),
            transaction_size: 1,
            commit_transactions: true,
            log_transaction_exceptions: true,
            synchronous_requests: false,
            exit_on_failure: false,
            merge_thread_stats: false,
            log_period: 10_000,
        }
    }
}

impl StressTestConfig {
    /// Config running `threads` threads in total across participating workers
    pub fn total_threads(threads: usize) -> Self {
        Self {
            total_threads: Some(threads),
            ..Default::default()
        }
    }

    /// Config running `threads` threads on each participating worker
    pub fn threads_per_node(threads: usize) -> Self {
        Self {
            threads_per_node: Some(threads),
            ..Default::default()
        }
    }

    /// Bound the measurement by wall-clock time
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    /// Bound the measurement by operation count
    pub fn with_num_requests(mut self, num_requests: u64) -> Self {
        self.duration = None;
        self.num_requests = num_requests;
        self
    }

    /// Set the warmup period
    pub fn with_ramp_up(mut self, ramp_up: Duration) -> Self {
        self.ramp_up = ramp_up;
        self
    }

    /// Set the overall timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the pause after every operation
    pub fn with_think_time(mut self, think_time: Duration) -> Self {
        self.think_time = think_time;
        self
    }

    /// Set the minimum interval between operations of one thread
    pub fn with_request_period(mut self, period: Duration) -> Self {
        self.request_period = Some(period);
        self
    }

    /// Set the transaction mode and batch size
    pub fn with_transactions(mut self, mode: TransactionMode, size: usize) -> Self {
        self.transaction_mode = mode;
        self.transaction_size = size;
        self
    }

    /// Roll back batches instead of committing them
    pub fn with_rollback(mut self) -> Self {
        self.commit_transactions = false;
        self
    }

    /// Run threads in lockstep
    pub fn with_synchronous_requests(mut self, enabled: bool) -> Self {
        self.synchronous_requests = enabled;
        self
    }

    /// Stop the whole test on the first failure
    pub fn with_exit_on_failure(mut self, enabled: bool) -> Self {
        self.exit_on_failure = enabled;
        self
    }

    /// Merge per-thread statistics before reporting
    pub fn with_merge_thread_stats(mut self, enabled: bool) -> Self {
        self.merge_thread_stats = enabled;
        self
    }

    /// Resolve the thread allocation, rejecting both-set and neither-set
    pub fn allocation(&self) -> Result<ThreadAllocation, ConfigError> {
        match (self.total_threads, self.threads_per_node) {
            (Some(_), Some(_)) => Err(ConfigError::ThreadAllocation(
                "only one of total-threads and num-threads-per-node may be set".into(),
            )),
            (None, None) => Err(ConfigError::ThreadAllocation(
                "one of total-threads and num-threads-per-node must be set".into(),
            )),
            (Some(0), None) | (None, Some(0)) => Err(ConfigError::ThreadAllocation(
                "thread count must be at least 1".into(),
            )),
            (Some(total), None) => Ok(ThreadAllocation::Total(total)),
            (None, Some(per_node)) => Ok(ThreadAllocation::PerNode(per_node)),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.allocation()?;

        match self.duration {
            Some(d) if d.is_zero() => {
                return Err(ConfigError::InvalidCompletion(
                    "duration must be positive".into(),
                ))
            }
            None if self.num_requests == 0 => {
                return Err(ConfigError::InvalidCompletion(
                    "num-requests must be at least 1".into(),
                ))
            }
            _ => {}
        }

        if self.transaction_mode != TransactionMode::Never && self.transaction_size == 0 {
            return Err(ConfigError::InvalidTransaction(
                "transaction-size must be at least 1".into(),
            ));
        }

        if let Some(period) = self.request_period {
            if period.is_zero() {
                return Err(ConfigError::InvalidRate(
                    "request-period must be positive".into(),
                ));
            }
        }

        if let Some(timeout) = self.timeout {
            if timeout <= self.ramp_up {
                return Err(ConfigError::InvalidCompletion(
                    "timeout must exceed ramp-up".into(),
                ));
            }
        }

        if self.log_period == 0 {
            return Err(ConfigError::InvalidCompletion(
                "log-period must be at least 1".into(),
            ));
        }

        Ok(())
    }
}

/// Configuration validation errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Bad thread allocation
    #[error("Invalid thread allocation: {0}")]
    ThreadAllocation(String),

    /// Bad completion bound
    #[error("Invalid completion: {0}")]
    InvalidCompletion(String),

    /// Bad transaction settings
    #[error("Invalid transaction settings: {0}")]
    InvalidTransaction(String),

    /// Bad request rate
    #[error("Invalid request rate: {0}")]
    InvalidRate(String),

    /// Bad operation mix
    #[error("Invalid operation mix: {0}")]
    InvalidRatio(String),

    /// Bad benchmark descriptor
    #[error("Invalid benchmark: {0}")]
    InvalidBenchmark(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = StressTestConfig::default();
        assert_eq!(config.num_requests, DEFAULT_NUM_REQUESTS);
        assert_eq!(config.transaction_mode, TransactionMode::IfTransactional);
        assert_eq!(config.transaction_size, 1);
        assert!(config.commit_transactions);
        assert!(config.duration.is_none());
    }

    #[test]
    fn test_config_builder_pattern() {
        let config = StressTestConfig::total_threads(4)
            .with_duration(Duration::from_secs(2))
            .with_ramp_up(Duration::from_millis(500))
            .with_transactions(TransactionMode::Always, 10)
            .with_rollback();

        assert_eq!(config.allocation().unwrap(), ThreadAllocation::Total(4));
        assert_eq!(config.duration, Some(Duration::from_secs(2)));
        assert_eq!(config.transaction_size, 10);
        assert!(!config.commit_transactions);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_both_allocations_rejected() {
        let mut config = StressTestConfig::total_threads(4);
        config.threads_per_node = Some(2);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ThreadAllocation(_))
        ));
    }

    #[test]
    fn test_no_allocation_rejected() {
        let config = StressTestConfig::default();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ThreadAllocation(_))
        ));
    }

    #[test]
    fn test_zero_threads_rejected() {
        assert!(StressTestConfig::threads_per_node(0).validate().is_err());
    }

    #[test]
    fn test_zero_duration_rejected() {
        let config = StressTestConfig::threads_per_node(1).with_duration(Duration::ZERO);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidCompletion(_))
        ));
    }

    #[test]
    fn test_zero_transaction_size_rejected() {
        let config =
            StressTestConfig::threads_per_node(1).with_transactions(TransactionMode::Always, 0);
        assert!(config.validate().is_err());

        let never =
            StressTestConfig::threads_per_node(1).with_transactions(TransactionMode::Never, 0);
        assert!(never.validate().is_ok());
    }

    #[test]
    fn test_timeout_must_exceed_ramp_up() {
        let config = StressTestConfig::threads_per_node(1)
            .with_ramp_up(Duration::from_secs(5))
            .with_timeout(Duration::from_secs(5));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_transaction_mode_parsing() {
        assert_eq!(
            "if-transactional".parse::<TransactionMode>().unwrap(),
            TransactionMode::IfTransactional
        );
        assert_eq!(
            "ALWAYS".parse::<TransactionMode>().unwrap(),
            TransactionMode::Always
        );
        assert_eq!(
            "if_transactional".parse::<TransactionMode>().unwrap(),
            TransactionMode::IfTransactional
        );
        assert!("sometimes".parse::<TransactionMode>().is_err());
    }

    #[test]
    fn test_config_deserializes_humantime() {
        let json = r#"{"total_threads": 8, "duration": "2s", "ramp_up": "500ms"}"#;
        let config: StressTestConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.total_threads, Some(8));
        assert_eq!(config.duration, Some(Duration::from_secs(2)));
        assert_eq!(config.ramp_up, Duration::from_millis(500));
        assert_eq!(config.num_requests, DEFAULT_NUM_REQUESTS);
    }
}
