//! Result aggregation from multiple workers into run reports

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ack::Ack;
use crate::metrics::{Statistics, Summary};
use crate::scenario::Cluster;
use crate::stage::{StageError, StageResult};

/// One stress test iteration across all workers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestIteration {
    /// Statistics reported by each worker, keyed by worker index
    pub workers: BTreeMap<usize, Vec<Statistics>>,
    /// Everything merged
    pub aggregated: Statistics,
    /// Condensed view of `aggregated`
    pub summary: Summary,
}

impl TestIteration {
    /// Build an iteration from the acks of one stage execution
    pub fn from_acks(acks: &[Ack]) -> Self {
        let workers: BTreeMap<usize, Vec<Statistics>> = acks
            .iter()
            .filter(|ack| !ack.statistics().is_empty())
            .map(|ack| (ack.worker_index, ack.statistics().to_vec()))
            .collect();
        let aggregated = aggregate_statistics(workers.values().flatten());
        let summary = aggregated.summary();
        Self {
            workers,
            aggregated,
            summary,
        }
    }
}

/// Every iteration of a named test
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    /// Iterations in execution order
    pub iterations: Vec<TestIteration>,
}

impl TestResult {
    /// Most recent iteration
    pub fn last(&self) -> Option<&TestIteration> {
        self.iterations.last()
    }
}

/// Outcome of one stage on the master
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    /// Stage id in the scenario
    pub id: usize,
    /// Stage type
    pub stage: String,
    /// Master verdict
    pub result: StageResult,
    /// Slowest worker, for distributed stages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<Duration>,
    /// Workers that reported an error
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_workers: Vec<usize>,
}

/// Report of one configuration on one topology
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    /// Configuration name
    pub configuration: String,
    /// Topology
    pub cluster: Cluster,
    /// Stages that ran, in order
    pub stages: Vec<StageRecord>,
    /// Id of the stage that aborted the run, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aborted_at: Option<usize>,
    /// Stress test results keyed by test name
    pub tests: BTreeMap<String, TestResult>,
}

impl Report {
    /// Empty report
    pub fn new(configuration: impl Into<String>, cluster: Cluster) -> Self {
        Self {
            configuration: configuration.into(),
            cluster,
            stages: Vec::new(),
            aborted_at: None,
            tests: BTreeMap::new(),
        }
    }

    /// Record a distributed stage from its acks
    pub fn record_dist_stage(&mut self, id: usize, stage: &str, acks: &[Ack], result: StageResult) {
        self.stages.push(StageRecord {
            id,
            stage: stage.to_string(),
            result,
            duration: acks.iter().filter_map(|ack| ack.duration).max(),
            failed_workers: acks
                .iter()
                .filter(|ack| ack.is_error())
                .map(|ack| ack.worker_index)
                .collect(),
        });
        if result == StageResult::Abort {
            self.aborted_at = Some(id);
        }
    }

    /// Record a master stage
    pub fn record_master_stage(&mut self, id: usize, stage: &str, result: StageResult) {
        self.stages.push(StageRecord {
            id,
            stage: stage.to_string(),
            result,
            duration: None,
            failed_workers: Vec::new(),
        });
        if result == StageResult::Abort {
            self.aborted_at = Some(id);
        }
    }

    /// Mark the run as aborted at a stage that never produced a verdict
    pub fn abort_at(&mut self, id: usize) {
        self.aborted_at = Some(id);
    }

    /// Whether the run was cut short
    pub fn is_aborted(&self) -> bool {
        self.aborted_at.is_some()
    }

    /// Add a test iteration
    ///
    /// Without `amend`, a test name may only be used once per run.
    pub fn add_iteration(
        &mut self,
        test_name: &str,
        amend: bool,
        iteration: TestIteration,
    ) -> Result<(), StageError> {
        if !amend && self.tests.contains_key(test_name) {
            return Err(StageError::execution(format!(
                "test '{test_name}' already exists; set amend-test to add iterations"
            )));
        }
        self.tests
            .entry(test_name.to_string())
            .or_default()
            .iterations
            .push(iteration);
        Ok(())
    }

    /// Results of a named test
    pub fn test(&self, test_name: &str) -> Option<&TestResult> {
        self.tests.get(test_name)
    }
}

/// Merge any number of statistics into one
pub fn aggregate_statistics<'a>(stats: impl IntoIterator<Item = &'a Statistics>) -> Statistics {
    stats.into_iter().fold(Statistics::new(), |mut acc, s| {
        acc.merge(s);
        acc
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ack::AckPayload;
    use crate::request::Operation;
    use chrono::Utc;

    const GET: Operation = Operation::from_static("BasicOperations.Get");

    fn stats(samples: u64) -> Statistics {
        let mut stats = Statistics::new();
        stats.begin();
        for _ in 0..samples {
            stats.record_operation(&GET, Duration::from_millis(1), true, Utc::now());
        }
        stats.end();
        stats
    }

    fn ack_with(worker: usize, stats: Vec<Statistics>) -> Ack {
        Ack::success(worker).with_payload(AckPayload::Statistics(stats))
    }

    #[test]
    fn test_iteration_merges_workers() {
        let acks = vec![
            ack_with(0, vec![stats(3), stats(2)]),
            ack_with(1, vec![stats(5)]),
            Ack::success(2),
        ];
        let iteration = TestIteration::from_acks(&acks);
        assert_eq!(iteration.workers.len(), 2);
        assert_eq!(iteration.workers[&0].len(), 2);
        assert_eq!(iteration.aggregated.total_requests(), 10);
        assert_eq!(iteration.summary.total_requests, 10);
    }

    #[test]
    fn test_add_iteration_requires_amend() {
        let mut report = Report::new("local", Cluster::single(1));
        report
            .add_iteration("test", false, TestIteration::default())
            .unwrap();
        assert!(report
            .add_iteration("test", false, TestIteration::default())
            .is_err());
        report
            .add_iteration("test", true, TestIteration::default())
            .unwrap();
        assert_eq!(report.test("test").unwrap().iterations.len(), 2);
    }

    #[test]
    fn test_record_stage_tracks_failures_and_abort() {
        let mut report = Report::new("local", Cluster::single(2));
        let acks = vec![
            Ack::success(0).with_duration(Duration::from_millis(10)),
            Ack::error(1, "boom", None).with_duration(Duration::from_millis(30)),
        ];
        report.record_dist_stage(4, "sleep", &acks, StageResult::Abort);

        assert_eq!(report.aborted_at, Some(4));
        let record = &report.stages[0];
        assert_eq!(record.failed_workers, vec![1]);
        assert_eq!(record.duration, Some(Duration::from_millis(30)));
    }

    #[test]
    fn test_aggregate_empty() {
        let merged = aggregate_statistics(std::iter::empty());
        assert_eq!(merged.total_requests(), 0);
        assert!(merged.begin_time().is_none());
    }
}
