//! One engine thread and the state shared by all threads of a test

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use rand::rngs::SmallRng;
use tokio::sync::watch;

use crate::completion::Completion;
use crate::metrics::Statistics;
use crate::request::{transactional, Operation, Request};
use crate::selector::OperationSelector;
use crate::traits::{OperationError, Transactional};

use super::batch::TxBatch;
use super::rate_limiter::RequestRateLimiter;
use super::{OperationLogic, StressorContext};

// ============================================================================
// Shared test state
// ============================================================================

/// Flags shared by every thread of one stress test
pub(crate) struct TestState {
    started: AtomicBool,
    finished: AtomicBool,
    terminated: AtomicBool,
    reason: Mutex<Option<String>>,
    finish_tx: watch::Sender<bool>,
}

impl TestState {
    pub(crate) fn new() -> Self {
        let (finish_tx, _) = watch::channel(false);
        Self {
            started: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            reason: Mutex::new(None),
            finish_tx,
        }
    }

    pub(crate) fn start(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Completion reached; releases whoever waits for the finish latch
    pub(crate) fn finish(&self) {
        self.finished.store(true, Ordering::SeqCst);
        self.finish_tx.send_replace(true);
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Stop every thread; the first reason given is kept
    pub(crate) fn terminate(&self, reason: impl Into<String>) {
        {
            let mut slot = self.reason.lock().unwrap_or_else(|e| e.into_inner());
            if slot.is_none() {
                *slot = Some(reason.into());
            }
        }
        self.terminated.store(true, Ordering::SeqCst);
        self.finish_tx.send_replace(true);
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    pub(crate) fn termination_reason(&self) -> Option<String> {
        self.reason.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<bool> {
        self.finish_tx.subscribe()
    }
}

// ============================================================================
// Stressor
// ============================================================================

/// Transaction settings resolved for the test
#[derive(Clone)]
pub(crate) struct TxSettings {
    pub(crate) transactional: Arc<dyn Transactional>,
    pub(crate) size: usize,
    pub(crate) commit: bool,
    pub(crate) log_exceptions: bool,
}

/// Stressor knobs copied from the test configuration
#[derive(Debug, Clone, Copy)]
pub(crate) struct StressorOptions {
    pub(crate) think_time: Duration,
    pub(crate) exit_on_failure: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Init,
    Warmup,
    Measuring,
    Draining,
}

/// What a thread hands back when it stops
#[derive(Debug)]
pub(crate) struct StressorReport {
    pub(crate) thread_index: usize,
    pub(crate) statistics: Statistics,
}

/// One engine thread
pub(crate) struct Stressor {
    context: StressorContext,
    logic: Box<dyn OperationLogic>,
    selector: Arc<dyn OperationSelector>,
    completion: Arc<dyn Completion>,
    state: Arc<TestState>,
    transactions: Option<TxSettings>,
    rate_limiter: RequestRateLimiter,
    options: StressorOptions,
    rng: SmallRng,
    phase: Phase,
    statistics: Statistics,
    batch: Option<TxBatch>,
}

impl Stressor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        context: StressorContext,
        logic: Box<dyn OperationLogic>,
        selector: Arc<dyn OperationSelector>,
        completion: Arc<dyn Completion>,
        state: Arc<TestState>,
        transactions: Option<TxSettings>,
        rate_limiter: RequestRateLimiter,
        options: StressorOptions,
        rng: SmallRng,
    ) -> Self {
        Self {
            context,
            logic,
            selector,
            completion,
            state,
            transactions,
            rate_limiter,
            options,
            rng,
            phase: Phase::Init,
            statistics: Statistics::new(),
            batch: None,
        }
    }

    /// Run the thread to completion
    ///
    /// Unexpected errors and panics terminate the whole test instead of
    /// silently losing one thread.
    pub(crate) async fn run(mut self) -> StressorReport {
        let thread = self.context.thread_index;
        match AssertUnwindSafe(self.run_phases()).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!(thread, error = %e, "Stressor stopped with an error");
                self.state.terminate(format!("thread {thread}: {e}"));
            }
            Err(_) => {
                tracing::error!(thread, "Stressor panicked");
                self.state.terminate(format!("thread {thread} panicked"));
            }
        }
        self.selector.thread_finished();
        self.statistics.end();

        tracing::debug!(
            thread,
            requests = self.statistics.total_requests(),
            errors = self.statistics.total_errors(),
            "Stressor finished"
        );
        StressorReport {
            thread_index: thread,
            statistics: self.statistics,
        }
    }

    async fn run_phases(&mut self) -> Result<(), OperationError> {
        self.logic.init(&self.context).await?;
        let result = self.run_loops().await;

        self.phase = Phase::Draining;
        if let Some(batch) = self.batch.take() {
            self.close_batch(batch).await;
        }
        result
    }

    async fn run_loops(&mut self) -> Result<(), OperationError> {
        self.phase = Phase::Warmup;
        while !self.state.is_started() {
            if self.state.is_terminated() {
                return Ok(());
            }
            let operation = self.selector.next(&mut self.rng).await;
            self.execute(&operation).await?;
        }
        // A batch left over from warmup is closed without being recorded
        if let Some(batch) = self.batch.take() {
            self.close_batch(batch).await;
        }

        self.phase = Phase::Measuring;
        self.statistics.begin();
        self.completion.start();
        let mut executed = 0u64;
        while !self.state.is_terminated() && !self.state.is_finished() {
            let operation = self.selector.next(&mut self.rng).await;
            if !self.completion.more_to_run() {
                break;
            }
            self.execute(&operation).await?;
            executed += 1;
            self.completion.log_progress(executed);
        }
        Ok(())
    }

    /// Operations run in the measuring loop were admitted by the completion
    /// and are recorded even when another thread finishes the test meanwhile
    fn is_recording(&self) -> bool {
        self.phase == Phase::Measuring
    }

    fn record(&mut self, request: Request) {
        let recording = self.is_recording();
        match self.batch.as_mut() {
            Some(batch) => batch.push(request),
            None if recording => self.statistics.record(&request),
            None => {}
        }
    }

    async fn execute(&mut self, operation: &Operation) -> Result<(), OperationError> {
        self.rate_limiter.wait().await;

        if self.batch.is_none() {
            if let Some(settings) = self.transactions.clone() {
                if let Err(e) = self.open_batch(&settings).await {
                    if e.is_fatal() {
                        return Err(e);
                    }
                    return self.after_failure(operation, &e);
                }
            }
        }

        let mut request = Request::start();
        let result = self.logic.invoke(operation, &mut self.rng).await;
        let failure = match result {
            Ok(()) => {
                request.succeeded(operation.clone());
                None
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                request.failed(operation.clone());
                tracing::warn!(
                    thread = self.context.thread_index,
                    operation = %operation,
                    error = %e,
                    "Operation failed"
                );
                Some(e)
            }
        };

        let successful = failure.is_none();
        self.record(request);
        if let Some(batch) = self.batch.as_mut() {
            batch.operation_done(operation, successful);
        }
        if self.batch.as_ref().is_some_and(TxBatch::is_full) {
            if let Some(batch) = self.batch.take() {
                self.close_batch(batch).await;
            }
        }

        if !self.options.think_time.is_zero() {
            tokio::time::sleep(self.options.think_time).await;
        }

        match failure {
            Some(e) => self.after_failure(operation, &e),
            None => Ok(()),
        }
    }

    fn after_failure(&self, operation: &Operation, error: &OperationError) -> Result<(), OperationError> {
        if self.options.exit_on_failure {
            Err(OperationError::unrecoverable(format!(
                "exit-on-failure after {operation}: {error}"
            )))
        } else {
            Ok(())
        }
    }

    /// Open a batch; a failed begin is recorded and the operation skipped
    async fn open_batch(&mut self, settings: &TxSettings) -> Result<(), OperationError> {
        let mut transaction = settings.transactional.transaction();
        self.logic.transaction_started(transaction.as_ref());

        let opened = Instant::now();
        let opened_at = Utc::now();
        let mut begin = Request::start();
        if let Err(e) = transaction.begin().await {
            begin.failed(transactional::BEGIN);
            self.record(begin);
            self.logic.transaction_ended();
            tracing::error!(
                thread = self.context.thread_index,
                error = %e,
                "Failed to begin transaction"
            );
            return Err(e);
        }

        begin.succeeded(transactional::BEGIN);
        let mut batch =
            TxBatch::open(transaction, settings.size, opened, opened_at, self.is_recording());
        batch.push(begin);
        self.batch = Some(batch);
        Ok(())
    }

    /// Commit or roll back, then flush or discard the buffered requests
    async fn close_batch(&mut self, mut batch: TxBatch) {
        let Some(settings) = self.transactions.as_ref() else {
            return;
        };
        let commit = settings.commit;
        let log_exceptions = settings.log_exceptions;

        let mut end = Request::start();
        let (end_operation, result) = if commit {
            (transactional::COMMIT, batch.transaction.commit().await)
        } else {
            (transactional::ROLLBACK, batch.transaction.rollback().await)
        };
        let successful = match result {
            Ok(()) => {
                end.succeeded(end_operation);
                true
            }
            Err(e) => {
                end.failed(end_operation);
                if log_exceptions {
                    tracing::error!(
                        thread = self.context.thread_index,
                        commit,
                        error = %e,
                        "Failed to end transaction"
                    );
                }
                false
            }
        };
        let elapsed = batch.elapsed();

        // A batch opened while measuring is flushed even when it closes on the drain path
        if let Some(requests) = batch.take_requests() {
            for request in &requests {
                self.statistics.record(request);
            }
            self.statistics.record(&end);
            self.statistics.record_operation(
                &transactional::DURATION,
                elapsed,
                successful,
                batch.opened_at(),
            );
            if let Some(operation) = batch.single_operation() {
                self.statistics.record_operation(
                    &operation.tx_variant(),
                    elapsed,
                    successful,
                    batch.opened_at(),
                );
            }
        }
        self.logic.transaction_ended();
    }
}
