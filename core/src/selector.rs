//! Operation selectors: which operation a thread issues next

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rand::rngs::SmallRng;
use rand::Rng;
use tokio::sync::Notify;

use crate::config::ConfigError;
use crate::request::Operation;

/// Picks the next operation for an engine thread
#[async_trait]
pub trait OperationSelector: Send + Sync {
    /// Next operation to invoke
    async fn next(&self, rng: &mut SmallRng) -> Operation;

    /// The calling thread will not ask for further operations
    fn thread_finished(&self) {}
}

/// Always returns the same operation
#[derive(Debug, Clone)]
pub struct FixedOperationSelector {
    operation: Operation,
}

impl FixedOperationSelector {
    /// Selector returning `operation`
    pub fn new(operation: Operation) -> Self {
        Self { operation }
    }
}

#[async_trait]
impl OperationSelector for FixedOperationSelector {
    async fn next(&self, _rng: &mut SmallRng) -> Operation {
        self.operation.clone()
    }
}

/// Draws operations with probability proportional to integer ratios
#[derive(Debug, Clone)]
pub struct RatioOperationSelector {
    operations: Vec<Operation>,
    cumulative: Vec<u32>,
    total: u32,
}

impl RatioOperationSelector {
    /// Start building a selector
    pub fn builder() -> RatioSelectorBuilder {
        RatioSelectorBuilder::default()
    }

    /// Operation for a draw in `0..total`
    fn pick(&self, draw: u32) -> &Operation {
        let index = self.cumulative.partition_point(|&upper| upper <= draw);
        &self.operations[index.min(self.operations.len() - 1)]
    }

    /// Sum of all ratios
    pub fn total(&self) -> u32 {
        self.total
    }
}

#[async_trait]
impl OperationSelector for RatioOperationSelector {
    async fn next(&self, rng: &mut SmallRng) -> Operation {
        let draw = rng.gen_range(0..self.total);
        self.pick(draw).clone()
    }
}

/// Builder for [`RatioOperationSelector`]
#[derive(Debug, Default)]
pub struct RatioSelectorBuilder {
    entries: Vec<(Operation, u32)>,
}

impl RatioSelectorBuilder {
    /// Add an operation with its ratio; zero ratios are ignored
    pub fn add(mut self, operation: Operation, ratio: u32) -> Self {
        if ratio > 0 {
            self.entries.push((operation, ratio));
        }
        self
    }

    /// Add every operation with ratio 1
    pub fn uniform(mut self, operations: impl IntoIterator<Item = Operation>) -> Self {
        self.entries
            .extend(operations.into_iter().map(|operation| (operation, 1)));
        self
    }

    /// Build the cumulative table
    pub fn build(self) -> Result<RatioOperationSelector, ConfigError> {
        let mut operations = Vec::with_capacity(self.entries.len());
        let mut cumulative = Vec::with_capacity(self.entries.len());
        let mut total: u32 = 0;
        for (operation, ratio) in self.entries {
            total = total
                .checked_add(ratio)
                .ok_or_else(|| ConfigError::InvalidRatio("ratios overflow".into()))?;
            operations.push(operation);
            cumulative.push(total);
        }
        if total == 0 {
            return Err(ConfigError::InvalidRatio(
                "at least one operation needs a positive ratio".into(),
            ));
        }
        Ok(RatioOperationSelector {
            operations,
            cumulative,
            total,
        })
    }
}

/// Runs every thread in lockstep around an inner selector
///
/// No call for round k+1 returns before every participating thread has
/// asked for round k+1, so all threads finished round k first. A thread
/// that stops calls [`OperationSelector::thread_finished`] so the others
/// are not held back by it.
pub struct SynchronousOperationSelector {
    inner: Arc<dyn OperationSelector>,
    barrier: RoundBarrier,
}

impl SynchronousOperationSelector {
    /// Wrap `inner` for `participants` threads
    pub fn new(inner: Arc<dyn OperationSelector>, participants: usize) -> Self {
        Self {
            inner,
            barrier: RoundBarrier::new(participants),
        }
    }
}

#[async_trait]
impl OperationSelector for SynchronousOperationSelector {
    async fn next(&self, rng: &mut SmallRng) -> Operation {
        self.barrier.wait().await;
        self.inner.next(rng).await
    }

    fn thread_finished(&self) {
        self.barrier.leave();
        self.inner.thread_finished();
    }
}

impl std::fmt::Debug for SynchronousOperationSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SynchronousOperationSelector")
            .field("barrier", &self.barrier)
            .finish()
    }
}

#[derive(Debug)]
struct BarrierState {
    participants: usize,
    arrived: usize,
    round: u64,
}

impl BarrierState {
    fn advance(&mut self) {
        self.arrived = 0;
        self.round += 1;
    }
}

/// Reusable async barrier whose participant count can shrink
#[derive(Debug)]
pub struct RoundBarrier {
    state: Mutex<BarrierState>,
    notify: Notify,
}

impl RoundBarrier {
    /// Barrier for `participants` tasks
    pub fn new(participants: usize) -> Self {
        Self {
            state: Mutex::new(BarrierState {
                participants,
                arrived: 0,
                round: 0,
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BarrierState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wait until every remaining participant arrived in this round
    pub async fn wait(&self) {
        let round = {
            let mut state = self.lock();
            state.arrived += 1;
            if state.arrived >= state.participants {
                state.advance();
                drop(state);
                self.notify.notify_waiters();
                return;
            }
            state.round
        };

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.lock().round != round {
                return;
            }
            notified.await;
        }
    }

    /// Leave the barrier for good, releasing a round it was holding up
    pub fn leave(&self) {
        let mut state = self.lock();
        state.participants = state.participants.saturating_sub(1);
        if state.arrived > 0 && state.arrived >= state.participants {
            state.advance();
            drop(state);
            self.notify.notify_waiters();
        }
    }

    /// Current round number
    pub fn round(&self) -> u64 {
        self.lock().round
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    const GET: Operation = Operation::from_static("BasicOperations.Get");
    const PUT: Operation = Operation::from_static("BasicOperations.Put");

    #[test]
    fn test_ratio_pick_boundaries() {
        let selector = RatioOperationSelector::builder()
            .add(GET, 3)
            .add(PUT, 1)
            .build()
            .unwrap();
        assert_eq!(selector.total(), 4);
        assert_eq!(selector.pick(0), &GET);
        assert_eq!(selector.pick(2), &GET);
        assert_eq!(selector.pick(3), &PUT);
    }

    #[test]
    fn test_ratio_zero_entries_skipped() {
        let selector = RatioOperationSelector::builder()
            .add(GET, 0)
            .add(PUT, 2)
            .build()
            .unwrap();
        assert_eq!(selector.pick(0), &PUT);
        assert_eq!(selector.pick(1), &PUT);
    }

    #[test]
    fn test_ratio_all_zero_rejected() {
        let result = RatioOperationSelector::builder().add(GET, 0).build();
        assert!(matches!(result, Err(ConfigError::InvalidRatio(_))));
    }

    #[tokio::test]
    async fn test_ratio_distribution() {
        let selector = RatioOperationSelector::builder()
            .add(GET, 3)
            .add(PUT, 1)
            .build()
            .unwrap();
        let mut rng = SmallRng::seed_from_u64(7);
        let mut counts: HashMap<Operation, usize> = HashMap::new();
        for _ in 0..10_000 {
            *counts.entry(selector.next(&mut rng).await).or_default() += 1;
        }
        let gets = counts[&GET] as f64 / 10_000.0;
        assert!((gets - 0.75).abs() < 0.03, "get share was {gets}");
    }

    #[tokio::test]
    async fn test_fixed_selector() {
        let selector = FixedOperationSelector::new(PUT);
        let mut rng = SmallRng::seed_from_u64(1);
        assert_eq!(selector.next(&mut rng).await, PUT);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_synchronous_selector_lockstep() {
        const THREADS: usize = 4;
        const ROUNDS: u64 = 50;
        let selector = Arc::new(SynchronousOperationSelector::new(
            Arc::new(FixedOperationSelector::new(GET)),
            THREADS,
        ));
        let completed = Arc::new(AtomicU64::new(0));

        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let selector = Arc::clone(&selector);
                let completed = Arc::clone(&completed);
                tokio::spawn(async move {
                    let mut rng = SmallRng::seed_from_u64(t as u64);
                    for round in 0..ROUNDS {
                        selector.next(&mut rng).await;
                        // Every thread has finished the previous round
                        assert!(completed.load(Ordering::SeqCst) >= round * THREADS as u64);
                        if t == 0 {
                            tokio::time::sleep(Duration::from_micros(200)).await;
                        }
                        completed.fetch_add(1, Ordering::SeqCst);
                    }
                    selector.thread_finished();
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(completed.load(Ordering::SeqCst), ROUNDS * THREADS as u64);
    }

    #[tokio::test]
    async fn test_barrier_leave_releases_waiters() {
        let barrier = Arc::new(RoundBarrier::new(2));
        let waiter = {
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move { barrier.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(barrier.round(), 0);

        barrier.leave();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter released")
            .unwrap();
        assert_eq!(barrier.round(), 1);
    }
}
