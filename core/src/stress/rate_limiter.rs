//! Request pacing for engine threads

use std::time::Duration;

use governor::{clock::DefaultClock, state::InMemoryState, state::NotKeyed, Quota, RateLimiter};

/// Enforces a minimum period between two operations of one thread
///
/// Every engine thread owns its own limiter, so the period applies per
/// thread rather than to the worker as a whole.
pub struct RequestRateLimiter {
    limiter: Option<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
    period: Option<Duration>,
}

impl RequestRateLimiter {
    /// Create a limiter; `None` or a zero period disables pacing
    pub fn new(period: Option<Duration>) -> Self {
        let period = period.filter(|p| !p.is_zero());
        let limiter = period
            .and_then(Quota::with_period)
            .map(RateLimiter::direct);

        Self { limiter, period }
    }

    /// Create a limiter that never waits
    pub fn unlimited() -> Self {
        Self::new(None)
    }

    /// Wait until the next operation is allowed
    pub async fn wait(&self) {
        if let Some(ref limiter) = self.limiter {
            limiter.until_ready().await;
        }
    }

    /// Check if pacing is enabled
    pub fn is_enabled(&self) -> bool {
        self.limiter.is_some()
    }

    /// Configured period
    pub fn period(&self) -> Option<Duration> {
        self.period
    }
}

impl Default for RequestRateLimiter {
    fn default() -> Self {
        Self::unlimited()
    }
}

impl std::fmt::Debug for RequestRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestRateLimiter")
            .field("period", &self.period)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_rate_limiter_disabled() {
        let limiter = RequestRateLimiter::new(None);
        assert!(!limiter.is_enabled());
        assert!(limiter.period().is_none());
    }

    #[test]
    fn test_rate_limiter_zero_period() {
        let limiter = RequestRateLimiter::new(Some(Duration::ZERO));
        assert!(!limiter.is_enabled());
    }

    #[test]
    fn test_rate_limiter_enabled() {
        let limiter = RequestRateLimiter::new(Some(Duration::from_millis(10)));
        assert!(limiter.is_enabled());
        assert_eq!(limiter.period(), Some(Duration::from_millis(10)));
    }

    #[tokio::test]
    async fn test_rate_limiter_wait_disabled() {
        let limiter = RequestRateLimiter::unlimited();
        // Should return immediately
        limiter.wait().await;
    }

    #[tokio::test]
    async fn test_rate_limiter_spaces_requests() {
        let limiter = RequestRateLimiter::new(Some(Duration::from_millis(20)));
        let start = Instant::now();
        for _ in 0..4 {
            limiter.wait().await;
        }
        // The first permit is immediate, the next three wait one period each
        assert!(start.elapsed() >= Duration::from_millis(55));
    }

    #[test]
    fn test_rate_limiter_debug() {
        let limiter = RequestRateLimiter::new(Some(Duration::from_millis(5)));
        let debug = format!("{:?}", limiter);
        assert!(debug.contains("RequestRateLimiter"));
        assert!(debug.contains("true"));
    }
}
