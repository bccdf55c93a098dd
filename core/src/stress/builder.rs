//! Builder pattern for StressTest construction

use std::sync::Arc;

use crate::config::{ConfigError, StressTestConfig, TransactionMode};
use crate::error::{Error, Result};
use crate::selector::{OperationSelector, SynchronousOperationSelector};
use crate::traits::Transactional;

use super::executor::StressTest;
use super::partition::thread_slice;
use super::stressor::TxSettings;
use super::LogicFactory;

/// Resource name used when a stage does not name one
pub const DEFAULT_RESOURCE: &str = "default";

/// Builder for creating a [`StressTest`] with validated configuration
///
/// # Example
///
/// ```ignore
/// let test = StressTestBuilder::new(StressTestConfig::total_threads(4).with_duration(d))
///     .logic(factory)
///     .selector(selector)
///     .transactional(service.get::<dyn Transactional>())
///     .participants(position, executing_workers)
///     .build()?;
/// ```
pub struct StressTestBuilder {
    config: StressTestConfig,
    logic: Option<Arc<dyn LogicFactory>>,
    selector: Option<Arc<dyn OperationSelector>>,
    transactional: Option<Arc<dyn Transactional>>,
    resource: String,
    position: usize,
    participants: usize,
    seed: Option<u64>,
}

impl StressTestBuilder {
    /// Create a new builder for the given configuration
    pub fn new(config: StressTestConfig) -> Self {
        Self {
            config,
            logic: None,
            selector: None,
            transactional: None,
            resource: DEFAULT_RESOURCE.to_string(),
            position: 0,
            participants: 1,
            seed: None,
        }
    }

    /// Set the per-thread logic factory
    pub fn logic(mut self, logic: Arc<dyn LogicFactory>) -> Self {
        self.logic = Some(logic);
        self
    }

    /// Set the operation selector
    pub fn selector(mut self, selector: Arc<dyn OperationSelector>) -> Self {
        self.selector = Some(selector);
        self
    }

    /// Set the transactional capability of the service, if it has one
    pub fn transactional(mut self, transactional: Option<Arc<dyn Transactional>>) -> Self {
        self.transactional = transactional;
        self
    }

    /// Set the resource the test targets
    pub fn resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = resource.into();
        self
    }

    /// Position of this worker among `participants` executing workers
    pub fn participants(mut self, position: usize, participants: usize) -> Self {
        self.position = position;
        self.participants = participants;
        self
    }

    /// Seed per-thread random generators deterministically
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    fn resolve_transactions(&self) -> Result<Option<TxSettings>> {
        let transactional = match self.config.transaction_mode {
            TransactionMode::Never => None,
            TransactionMode::Always => Some(self.transactional.clone().ok_or_else(|| {
                ConfigError::InvalidTransaction(
                    "transaction-mode always requires a transactional service".into(),
                )
            })?),
            TransactionMode::IfTransactional => self
                .transactional
                .clone()
                .filter(|t| t.is_transactional(&self.resource)),
        };
        Ok(transactional.map(|transactional| TxSettings {
            transactional,
            size: self.config.transaction_size,
            commit: self.config.commit_transactions,
            log_exceptions: self.config.log_transaction_exceptions,
        }))
    }

    /// Build the stress test
    ///
    /// # Errors
    ///
    /// Returns an error if logic or selector are not set, if configuration
    /// validation fails, or if transactions are required but unavailable.
    pub fn build(self) -> Result<StressTest> {
        self.config.validate()?;
        if self.position >= self.participants {
            return Err(Error::Config(ConfigError::ThreadAllocation(format!(
                "position {} outside of {} participants",
                self.position, self.participants
            ))));
        }

        let logic = self
            .logic
            .clone()
            .ok_or_else(|| Error::missing_config("logic"))?;
        let mut selector = self
            .selector
            .clone()
            .ok_or_else(|| Error::missing_config("selector"))?;

        let transactions = self.resolve_transactions()?;
        let slice = thread_slice(self.config.allocation()?, self.position, self.participants);

        if self.config.synchronous_requests {
            selector = Arc::new(SynchronousOperationSelector::new(selector, slice.count));
        }

        Ok(StressTest {
            config: self.config,
            logic,
            selector,
            transactions,
            slice,
            seed: self.seed,
        })
    }
}
