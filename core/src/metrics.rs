//! Per-operation statistics with mergeable running moments
//!
//! Latency moments use Welford's online update, and two accumulators are
//! combined with the parallel variant of the same formula, so merging
//! per-thread and per-worker statistics is associative.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::request::{Operation, Request};

/// Running statistics of one operation kind
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationStats {
    requests: u64,
    errors: u64,
    max_nanos: u64,
    sum_nanos: u64,
    mean_nanos: f64,
    m2: f64,
}

impl OperationStats {
    /// Record one finished request
    pub fn record(&mut self, duration: Duration, successful: bool) {
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        self.requests += 1;
        if !successful {
            self.errors += 1;
        }
        self.max_nanos = self.max_nanos.max(nanos);
        self.sum_nanos = self.sum_nanos.saturating_add(nanos);

        let x = nanos as f64;
        let delta = x - self.mean_nanos;
        self.mean_nanos += delta / self.requests as f64;
        self.m2 += delta * (x - self.mean_nanos);
    }

    /// Fold another accumulator into this one
    pub fn merge(&mut self, other: &OperationStats) {
        if other.requests == 0 {
            return;
        }
        if self.requests == 0 {
            *self = other.clone();
            return;
        }
        let n1 = self.requests as f64;
        let n2 = other.requests as f64;
        let n = n1 + n2;
        let delta = other.mean_nanos - self.mean_nanos;

        self.m2 = self.m2 + other.m2 + delta * delta * n1 * n2 / n;
        self.mean_nanos = (n1 * self.mean_nanos + n2 * other.mean_nanos) / n;
        self.requests += other.requests;
        self.errors += other.errors;
        self.max_nanos = self.max_nanos.max(other.max_nanos);
        self.sum_nanos = self.sum_nanos.saturating_add(other.sum_nanos);
    }

    /// Requests recorded, failed ones included
    pub fn requests(&self) -> u64 {
        self.requests
    }

    /// Failed requests
    pub fn errors(&self) -> u64 {
        self.errors
    }

    /// Successful requests
    pub fn successes(&self) -> u64 {
        self.requests - self.errors
    }

    /// Mean response time
    pub fn mean(&self) -> Duration {
        Duration::from_nanos(self.mean_nanos.max(0.0).round() as u64)
    }

    /// Slowest response time
    pub fn max(&self) -> Duration {
        Duration::from_nanos(self.max_nanos)
    }

    /// Sum of all response times
    pub fn total_time(&self) -> Duration {
        Duration::from_nanos(self.sum_nanos)
    }

    /// Sample variance in squared nanoseconds
    pub fn variance(&self) -> f64 {
        if self.requests < 2 {
            0.0
        } else {
            self.m2 / (self.requests - 1) as f64
        }
    }

    /// Sample standard deviation
    pub fn std_dev(&self) -> Duration {
        Duration::from_nanos(self.variance().sqrt().round() as u64)
    }

    /// Fraction of failed requests (0.0 - 1.0)
    pub fn error_rate(&self) -> f64 {
        if self.requests > 0 {
            self.errors as f64 / self.requests as f64
        } else {
            0.0
        }
    }
}

/// Statistics of one engine thread, one worker or a whole test
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    #[serde(skip_serializing_if = "Option::is_none")]
    begin: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    end: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    first_request: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_request: Option<DateTime<Utc>>,
    operations: BTreeMap<Operation, OperationStats>,
}

impl Statistics {
    /// Empty statistics
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the start of measurement
    pub fn begin(&mut self) {
        self.begin = Some(Utc::now());
    }

    /// Mark the end of measurement
    pub fn end(&mut self) {
        self.end = Some(Utc::now());
    }

    /// Record a finished request; unfinished requests are ignored
    pub fn record(&mut self, request: &Request) {
        if let Some(operation) = request.operation() {
            self.record_operation(
                operation,
                request.duration(),
                request.is_successful(),
                request.started_at(),
            );
        }
    }

    /// Record a sample that was not timed through a [`Request`]
    pub fn record_operation(
        &mut self,
        operation: &Operation,
        duration: Duration,
        successful: bool,
        started_at: DateTime<Utc>,
    ) {
        self.operations
            .entry(operation.clone())
            .or_default()
            .record(duration, successful);
        self.first_request = Some(self.first_request.map_or(started_at, |t| t.min(started_at)));
        self.last_request = Some(self.last_request.map_or(started_at, |t| t.max(started_at)));
    }

    /// Fold another statistics instance into this one
    pub fn merge(&mut self, other: &Statistics) {
        self.begin = earliest(self.begin, other.begin);
        self.end = latest(self.end, other.end);
        self.first_request = earliest(self.first_request, other.first_request);
        self.last_request = latest(self.last_request, other.last_request);
        for (operation, stats) in &other.operations {
            self.operations
                .entry(operation.clone())
                .or_default()
                .merge(stats);
        }
    }

    /// Statistics of one operation kind
    pub fn operation(&self, operation: &Operation) -> Option<&OperationStats> {
        self.operations.get(operation)
    }

    /// All operation kinds in name order
    pub fn operations(&self) -> impl Iterator<Item = (&Operation, &OperationStats)> {
        self.operations.iter()
    }

    /// Start of measurement
    pub fn begin_time(&self) -> Option<DateTime<Utc>> {
        self.begin
    }

    /// End of measurement
    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end
    }

    /// Start time of the earliest recorded request
    pub fn first_request(&self) -> Option<DateTime<Utc>> {
        self.first_request
    }

    /// Start time of the latest recorded request
    pub fn last_request(&self) -> Option<DateTime<Utc>> {
        self.last_request
    }

    /// Measured wall-clock span
    pub fn duration(&self) -> Duration {
        match (self.begin, self.end) {
            (Some(begin), Some(end)) => (end - begin).to_std().unwrap_or_default(),
            _ => Duration::ZERO,
        }
    }

    /// Requests across all user operations
    ///
    /// Synthetic transaction kinds are excluded so a batch is not counted
    /// twice.
    pub fn total_requests(&self) -> u64 {
        self.user_operations().map(|(_, s)| s.requests()).sum()
    }

    /// Errors across all user operations
    pub fn total_errors(&self) -> u64 {
        self.user_operations().map(|(_, s)| s.errors()).sum()
    }

    fn user_operations(&self) -> impl Iterator<Item = (&Operation, &OperationStats)> {
        self.operations.iter().filter(|(op, _)| !op.is_transactional())
    }

    /// Condensed view for logs and reports
    pub fn summary(&self) -> Summary {
        let duration = self.duration();
        let throughput = |requests: u64| {
            if duration.is_zero() {
                0.0
            } else {
                requests as f64 / duration.as_secs_f64()
            }
        };
        let operations = self
            .operations
            .iter()
            .map(|(op, stats)| {
                (
                    op.name().to_string(),
                    OperationSummary {
                        requests: stats.requests(),
                        errors: stats.errors(),
                        throughput: throughput(stats.requests()),
                        mean: stats.mean(),
                        std_dev: stats.std_dev(),
                        max: stats.max(),
                    },
                )
            })
            .collect();

        Summary {
            total_requests: self.total_requests(),
            total_errors: self.total_errors(),
            duration,
            requests_per_second: throughput(self.total_requests()),
            operations,
        }
    }
}

fn earliest(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn latest(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

/// Aggregated view of one operation kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationSummary {
    /// Requests, failed ones included
    pub requests: u64,
    /// Failed requests
    pub errors: u64,
    /// Requests per second over the measured span
    pub throughput: f64,
    /// Mean response time
    #[serde(with = "humantime_serde")]
    pub mean: Duration,
    /// Response time standard deviation
    #[serde(with = "humantime_serde")]
    pub std_dev: Duration,
    /// Slowest response time
    #[serde(with = "humantime_serde")]
    pub max: Duration,
}

/// Aggregated view of a [`Statistics`] instance
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    /// User operations recorded
    pub total_requests: u64,
    /// User operations that failed
    pub total_errors: u64,
    /// Measured span
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    /// Overall user operations per second
    pub requests_per_second: f64,
    /// Per-kind breakdown, synthetic transaction kinds included
    pub operations: BTreeMap<String, OperationSummary>,
}

impl Summary {
    /// Get the success rate (0.0 - 1.0)
    pub fn success_rate(&self) -> f64 {
        if self.total_requests > 0 {
            (self.total_requests - self.total_errors) as f64 / self.total_requests as f64
        } else {
            0.0
        }
    }

    /// Get the error rate (0.0 - 1.0)
    pub fn error_rate(&self) -> f64 {
        if self.total_requests > 0 {
            1.0 - self.success_rate()
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::transactional::{BEGIN, COMMIT};

    const GET: Operation = Operation::from_static("BasicOperations.Get");

    fn stats_of(samples: &[u64]) -> OperationStats {
        let mut stats = OperationStats::default();
        for &ms in samples {
            stats.record(Duration::from_millis(ms), true);
        }
        stats
    }

    #[test]
    fn test_welford_moments() {
        let stats = stats_of(&[2, 4, 4, 4, 5, 5, 7, 9]);
        assert_eq!(stats.requests(), 8);
        assert_eq!(stats.mean(), Duration::from_millis(5));
        assert_eq!(stats.max(), Duration::from_millis(9));
        assert_eq!(stats.total_time(), Duration::from_millis(40));
        // Sample variance of the series is 32/7 ms^2
        let expected = 32.0 / 7.0 * 1e12;
        assert!((stats.variance() - expected).abs() / expected < 1e-9);
    }

    #[test]
    fn test_merge_matches_sequential_recording() {
        let mut merged = stats_of(&[2, 4, 4]);
        merged.merge(&stats_of(&[4, 5, 5, 7, 9]));
        let sequential = stats_of(&[2, 4, 4, 4, 5, 5, 7, 9]);

        assert_eq!(merged.requests(), sequential.requests());
        assert_eq!(merged.mean(), sequential.mean());
        assert_eq!(merged.max(), sequential.max());
        assert!((merged.variance() - sequential.variance()).abs() < 1e-3);
    }

    #[test]
    fn test_merge_is_associative() {
        let a = stats_of(&[1, 10]);
        let b = stats_of(&[3]);
        let c = stats_of(&[7, 7, 20]);

        let mut left = a.clone();
        left.merge(&b);
        left.merge(&c);

        let mut bc = b.clone();
        bc.merge(&c);
        let mut right = a.clone();
        right.merge(&bc);

        assert_eq!(left.requests(), right.requests());
        assert_eq!(left.mean(), right.mean());
        assert!((left.variance() - right.variance()).abs() < 1e-3);
    }

    #[test]
    fn test_merge_with_empty() {
        let mut empty = OperationStats::default();
        empty.merge(&stats_of(&[5]));
        assert_eq!(empty.requests(), 1);

        let mut one = stats_of(&[5]);
        one.merge(&OperationStats::default());
        assert_eq!(one.requests(), 1);
    }

    #[test]
    fn test_errors_counted() {
        let mut stats = OperationStats::default();
        stats.record(Duration::from_millis(1), true);
        stats.record(Duration::from_millis(1), false);
        assert_eq!(stats.requests(), 2);
        assert_eq!(stats.errors(), 1);
        assert_eq!(stats.successes(), 1);
        assert!((stats.error_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_statistics_record_and_totals() {
        let mut stats = Statistics::new();
        stats.begin();
        let mut get = Request::start();
        get.succeeded(GET);
        stats.record(&get);
        let mut begin = Request::start();
        begin.succeeded(BEGIN);
        stats.record(&begin);
        stats.record(&Request::start());
        stats.end();

        assert_eq!(stats.total_requests(), 1);
        assert_eq!(stats.operation(&BEGIN).unwrap().requests(), 1);
        assert!(stats.operation(&COMMIT).is_none());
        assert!(stats.first_request().unwrap() >= stats.begin_time().unwrap());
        assert_eq!(stats.summary().operations.len(), 2);
    }

    #[test]
    fn test_statistics_merge_widens_window() {
        let mut a = Statistics::new();
        a.begin();
        a.record_operation(&GET, Duration::from_millis(1), true, Utc::now());
        a.end();

        let mut b = Statistics::new();
        b.begin();
        b.record_operation(&GET, Duration::from_millis(3), false, Utc::now());
        b.end();

        let mut merged = a.clone();
        merged.merge(&b);
        assert_eq!(merged.begin_time(), a.begin_time());
        assert_eq!(merged.end_time(), b.end_time());
        assert_eq!(merged.operation(&GET).unwrap().requests(), 2);
        assert_eq!(merged.total_errors(), 1);
    }

    #[test]
    fn test_summary_rates() {
        let summary = Summary {
            total_requests: 100,
            total_errors: 5,
            ..Default::default()
        };
        assert!((summary.success_rate() - 0.95).abs() < 0.001);
        assert!((summary.error_rate() - 0.05).abs() < 0.001);
        assert_eq!(Summary::default().error_rate(), 0.0);
    }
}
