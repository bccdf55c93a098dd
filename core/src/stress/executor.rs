//! Stress test execution: spawn threads, ramp up, wait, collect

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use tokio::task::{AbortHandle, JoinHandle};

use crate::completion::{Completion, OperationCountCompletion, TimeCompletion};
use crate::config::StressTestConfig;
use crate::error::{Error, Result};
use crate::metrics::Statistics;
use crate::selector::OperationSelector;

use super::partition::ThreadSlice;
use super::rate_limiter::RequestRateLimiter;
use super::stressor::{Stressor, StressorOptions, StressorReport, TestState, TxSettings};
use super::{LogicFactory, StressorContext};

/// How long timed-out threads get to drain before they are aborted
const TERMINATION_GRACE: Duration = Duration::from_secs(5);

/// Result of a stress test on one worker
#[derive(Debug, Clone, Default)]
pub struct StressOutcome {
    /// Threads this worker ran
    pub threads: usize,
    /// One entry per thread in thread order, or a single merged entry
    pub statistics: Vec<Statistics>,
}

impl StressOutcome {
    /// All statistics folded into one
    pub fn merged(&self) -> Statistics {
        self.statistics
            .iter()
            .fold(Statistics::new(), |mut acc, s| {
                acc.merge(s);
                acc
            })
    }
}

/// A configured stress test, ready to run once
///
/// Use [`super::StressTestBuilder`] to construct one.
pub struct StressTest {
    pub(crate) config: StressTestConfig,
    pub(crate) logic: Arc<dyn LogicFactory>,
    pub(crate) selector: Arc<dyn OperationSelector>,
    pub(crate) transactions: Option<TxSettings>,
    pub(crate) slice: ThreadSlice,
    pub(crate) seed: Option<u64>,
}

impl StressTest {
    /// Get the test configuration
    pub fn config(&self) -> &StressTestConfig {
        &self.config
    }

    /// Threads this worker will run
    pub fn threads(&self) -> usize {
        self.slice.count
    }

    /// Whether operations will be grouped into transactions
    pub fn uses_transactions(&self) -> bool {
        self.transactions.is_some()
    }

    fn completion(&self) -> Arc<dyn Completion> {
        match self.config.duration {
            Some(duration) => Arc::new(TimeCompletion::new(duration)),
            None => Arc::new(OperationCountCompletion::new(
                self.config.num_requests,
                self.config.log_period,
            )),
        }
    }

    fn rng_for(&self, global_thread_index: usize) -> SmallRng {
        match self.seed {
            Some(seed) => SmallRng::seed_from_u64(
                seed.wrapping_add((global_thread_index as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)),
            ),
            None => SmallRng::from_entropy(),
        }
    }

    /// Terminate the threads and wait a short grace for them to drain
    ///
    /// Threads still busy after the grace are aborted.
    async fn timed_out(
        state: &TestState,
        timeout: Duration,
        handles: Vec<JoinHandle<StressorReport>>,
    ) -> Error {
        state.terminate("timed out");
        tracing::error!(
            timeout_secs = timeout.as_secs_f64(),
            "Stress test did not finish in time, terminating threads"
        );

        let aborts: Vec<AbortHandle> = handles.iter().map(JoinHandle::abort_handle).collect();
        if tokio::time::timeout(TERMINATION_GRACE, join_all(handles))
            .await
            .is_err()
        {
            let stuck = aborts.iter().filter(|a| !a.is_finished()).count();
            tracing::warn!(
                stuck,
                grace_secs = TERMINATION_GRACE.as_secs_f64(),
                "Stressor threads ignored termination, aborting them"
            );
            for abort in &aborts {
                abort.abort();
            }
        }
        Error::Timeout(timeout)
    }

    /// Run the test
    ///
    /// Spawns the threads, waits out the ramp-up, then waits for completion
    /// and joins every thread within the remaining timeout budget.
    pub async fn run(self) -> Result<StressOutcome> {
        let threads = self.slice.count;
        if threads == 0 {
            tracing::info!("No stress threads allocated to this worker");
            return Ok(StressOutcome::default());
        }

        let start = Instant::now();
        let timeout = self.config.timeout;
        let deadline = timeout.map(|t| start + t);

        let state = Arc::new(TestState::new());
        let completion = self.completion();
        {
            let state = Arc::clone(&state);
            completion.set_handler(Box::new(move || state.finish()));
        }
        if self.config.ramp_up.is_zero() {
            state.start();
        }

        tracing::info!(
            threads,
            first_global_thread = self.slice.first_global_index,
            duration = ?self.config.duration,
            num_requests = self.config.num_requests,
            ramp_up = ?self.config.ramp_up,
            transactions = self.uses_transactions(),
            "Starting stress test"
        );

        let options = StressorOptions {
            think_time: self.config.think_time,
            exit_on_failure: self.config.exit_on_failure,
        };
        let mut handles = Vec::with_capacity(threads);
        for thread_index in 0..threads {
            let context = StressorContext {
                thread_index,
                global_thread_index: self.slice.first_global_index + thread_index,
                local_threads: threads,
            };
            let stressor = Stressor::new(
                context,
                self.logic.create(&context),
                Arc::clone(&self.selector),
                Arc::clone(&completion),
                Arc::clone(&state),
                self.transactions.clone(),
                RequestRateLimiter::new(self.config.request_period),
                options,
                self.rng_for(context.global_thread_index),
            );
            handles.push(tokio::spawn(stressor.run()));
        }

        let mut finish_rx = state.subscribe();
        if !self.config.ramp_up.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(self.config.ramp_up) => {}
                _ = finish_rx.wait_for(|done| *done) => {}
            }
            state.start();
            tracing::info!("Ramp-up finished, measurement started");
        }

        let finished = finish_rx.wait_for(|done| *done);
        match (deadline, timeout) {
            (Some(deadline), Some(timeout)) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero()
                    || tokio::time::timeout(remaining, finished).await.is_err()
                {
                    return Err(Self::timed_out(&state, timeout, handles).await);
                }
            }
            _ => {
                let _ = finished.await;
            }
        }

        let mut statistics = Vec::with_capacity(threads);
        let mut pending = handles.into_iter().enumerate();
        while let Some((idx, mut handle)) = pending.next() {
            let joined = match (deadline, timeout) {
                (Some(deadline), Some(timeout)) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    match tokio::time::timeout(remaining, &mut handle).await {
                        Ok(joined) => joined,
                        Err(_) => {
                            let rest = std::iter::once(handle)
                                .chain(pending.map(|(_, h)| h))
                                .collect();
                            return Err(Self::timed_out(&state, timeout, rest).await);
                        }
                    }
                }
                _ => handle.await,
            };
            match joined {
                Ok(report) => {
                    tracing::debug!(
                        thread = report.thread_index,
                        requests = report.statistics.total_requests(),
                        "Stressor joined"
                    );
                    statistics.push(report.statistics);
                }
                Err(e) => {
                    tracing::error!(thread = idx, error = %e, "Stressor task panicked");
                    state.terminate(format!("thread {idx} task failed: {e}"));
                }
            }
        }
        state.finish();

        if let Some(reason) = state.termination_reason() {
            return Err(Error::Terminated(reason));
        }

        let outcome = StressOutcome {
            threads,
            statistics,
        };
        let merged = outcome.merged();
        let summary = merged.summary();
        tracing::info!(
            elapsed_secs = start.elapsed().as_secs_f64(),
            total_requests = summary.total_requests,
            total_errors = summary.total_errors,
            rps = summary.requests_per_second,
            "Stress test completed"
        );

        if self.config.merge_thread_stats {
            return Ok(StressOutcome {
                threads,
                statistics: vec![merged],
            });
        }
        Ok(outcome)
    }
}

impl std::fmt::Debug for StressTest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StressTest")
            .field("config", &self.config)
            .field("slice", &self.slice)
            .field("transactions", &self.uses_transactions())
            .finish()
    }
}
