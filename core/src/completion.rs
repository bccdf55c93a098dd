//! Completion policies deciding when measurement stops

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

/// Callback run exactly once when a completion first reports the end
pub type CompletionHandler = Box<dyn FnOnce() + Send>;

/// Minimum interval between two time-based progress lines
const PROGRESS_INTERVAL: Duration = Duration::from_secs(20);

/// Decides whether engine threads keep issuing measured operations
///
/// `more_to_run` is called concurrently by every thread before each
/// measured operation. The first call returning `false` runs the handler.
pub trait Completion: Send + Sync {
    /// Mark the start of measurement; only the first call counts
    fn start(&self);

    /// Whether another operation should be issued
    fn more_to_run(&self) -> bool;

    /// Called after each measured operation of a thread
    fn log_progress(&self, executed: u64);

    /// Install the handler fired on completion
    fn set_handler(&self, handler: CompletionHandler);
}

#[derive(Default)]
struct FireOnce(Mutex<Option<CompletionHandler>>);

impl FireOnce {
    fn set(&self, handler: CompletionHandler) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    fn fire(&self) {
        let handler = self.0.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handler) = handler {
            handler();
        }
    }
}

/// Stops once a fixed duration has elapsed since [`Completion::start`]
pub struct TimeCompletion {
    duration: Duration,
    started: OnceLock<Instant>,
    last_log: Mutex<Option<Instant>>,
    handler: FireOnce,
}

impl TimeCompletion {
    /// Completion measuring for `duration`
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            started: OnceLock::new(),
            last_log: Mutex::new(None),
            handler: FireOnce::default(),
        }
    }

    /// Instant measurement started, if it has
    pub fn started_at(&self) -> Option<Instant> {
        self.started.get().copied()
    }
}

impl Completion for TimeCompletion {
    fn start(&self) {
        self.started.get_or_init(Instant::now);
    }

    fn more_to_run(&self) -> bool {
        let Some(started) = self.started.get() else {
            return true;
        };
        if started.elapsed() < self.duration {
            true
        } else {
            self.handler.fire();
            false
        }
    }

    fn log_progress(&self, executed: u64) {
        let Some(started) = self.started.get() else {
            return;
        };
        let now = Instant::now();
        let mut last_log = self.last_log.lock().unwrap_or_else(|e| e.into_inner());
        let since = last_log.unwrap_or(*started);
        if now.duration_since(since) < PROGRESS_INTERVAL {
            return;
        }
        *last_log = Some(now);
        let elapsed = now.duration_since(*started);
        tracing::info!(
            executed,
            elapsed_secs = elapsed.as_secs(),
            remaining_secs = self.duration.saturating_sub(elapsed).as_secs(),
            "Stress test progress"
        );
    }

    fn set_handler(&self, handler: CompletionHandler) {
        self.handler.set(handler);
    }
}

impl std::fmt::Debug for TimeCompletion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeCompletion")
            .field("duration", &self.duration)
            .field("started", &self.started.get().is_some())
            .finish()
    }
}

/// Stops once a fixed number of operations has been admitted
pub struct OperationCountCompletion {
    total: u64,
    admitted: AtomicU64,
    log_period: u64,
    handler: FireOnce,
}

impl OperationCountCompletion {
    /// Completion admitting `total` operations
    pub fn new(total: u64, log_period: u64) -> Self {
        Self {
            total,
            admitted: AtomicU64::new(0),
            log_period: log_period.max(1),
            handler: FireOnce::default(),
        }
    }
}

impl Completion for OperationCountCompletion {
    fn start(&self) {}

    fn more_to_run(&self) -> bool {
        if self.admitted.fetch_add(1, Ordering::SeqCst) < self.total {
            true
        } else {
            self.handler.fire();
            false
        }
    }

    fn log_progress(&self, executed: u64) {
        if executed % self.log_period == 0 {
            let admitted = self.admitted.load(Ordering::Relaxed).min(self.total);
            tracing::info!(
                executed,
                admitted,
                remaining = self.total - admitted,
                "Stress test progress"
            );
        }
    }

    fn set_handler(&self, handler: CompletionHandler) {
        self.handler.set(handler);
    }
}

impl std::fmt::Debug for OperationCountCompletion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationCountCompletion")
            .field("total", &self.total)
            .field("admitted", &self.admitted.load(Ordering::Relaxed))
            .finish()
    }
}
