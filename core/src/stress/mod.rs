//! Concurrent stress engine run by a worker during a test stage
//!
//! A stress test spawns one tokio task per engine thread. Every task runs
//! the same loop: **select -> (open batch) -> invoke -> record -> repeat**.
//!
//! 1. Until the shared `started` flag flips, operations run as warmup and
//!    are never recorded
//! 2. Once measurement starts, a [`crate::completion::Completion`] admits
//!    operations until the time or count bound is reached
//! 3. Requests are kept for every operation the completion admitted, even
//!    when another thread reaches the bound while it is still running
//! 4. With transactions enabled, operations are grouped into batches that
//!    are committed or rolled back as a whole
//!
//! # Example
//!
//! ```ignore
//! use gridbench_core::stress::StressTestBuilder;
//!
//! let test = StressTestBuilder::new(config)
//!     .logic(factory)
//!     .selector(selector)
//!     .participants(0, 2)
//!     .build()?;
//!
//! let outcome = test.run().await?;
//! println!("threads: {}", outcome.threads);
//! ```

use async_trait::async_trait;
use rand::rngs::SmallRng;

use crate::request::Operation;
use crate::traits::{OperationError, Transaction};

mod batch;
mod builder;
mod executor;
mod partition;
mod rate_limiter;
mod stressor;

pub use builder::StressTestBuilder;
pub use executor::{StressOutcome, StressTest};
pub use partition::{thread_slice, ThreadSlice};
pub use rate_limiter::RequestRateLimiter;

/// Identity of one engine thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StressorContext {
    /// Index among the threads of this worker
    pub thread_index: usize,
    /// Index among the threads of all participating workers
    pub global_thread_index: usize,
    /// Threads running on this worker
    pub local_threads: usize,
}

/// Executes operations on behalf of one engine thread
///
/// One instance is created per thread, so implementations may keep
/// per-thread state without synchronisation.
#[async_trait]
pub trait OperationLogic: Send {
    /// Prepare the thread before its first operation
    async fn init(&mut self, _context: &StressorContext) -> Result<(), OperationError> {
        Ok(())
    }

    /// A transaction batch opened; operations should go through `transaction`
    fn transaction_started(&mut self, _transaction: &dyn Transaction) {}

    /// The current transaction batch closed
    fn transaction_ended(&mut self) {}

    /// Run one operation
    async fn invoke(
        &mut self,
        operation: &Operation,
        rng: &mut SmallRng,
    ) -> Result<(), OperationError>;
}

/// Creates the [`OperationLogic`] of every engine thread
pub trait LogicFactory: Send + Sync {
    /// Logic for the given thread
    fn create(&self, context: &StressorContext) -> Box<dyn OperationLogic>;
}

impl<F> LogicFactory for F
where
    F: Fn(&StressorContext) -> Box<dyn OperationLogic> + Send + Sync,
{
    fn create(&self, context: &StressorContext) -> Box<dyn OperationLogic> {
        self(context)
    }
}
