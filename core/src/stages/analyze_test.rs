//! Master stage checking a recorded test result against bounds

use std::str::FromStr;

use async_trait::async_trait;

use crate::metrics::Summary;
use crate::request::Operation;
use crate::scenario::Properties;
use crate::stage::{MasterStage, StageError, StageResult};
use crate::state::MasterState;

use super::props;

/// Registered stage type
pub const ANALYZE_TEST: &str = "analyze-test";

/// Value extracted from a test summary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    /// Requests per second
    Throughput,
    /// Mean response time in milliseconds
    MeanLatency,
    /// Failed requests
    Errors,
    /// All requests
    Requests,
}

impl FromStr for Metric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "throughput" => Ok(Self::Throughput),
            "mean-latency" => Ok(Self::MeanLatency),
            "errors" => Ok(Self::Errors),
            "requests" => Ok(Self::Requests),
            other => Err(format!(
                "unknown metric '{other}', expected throughput, mean-latency, errors or requests"
            )),
        }
    }
}

impl Metric {
    fn extract(self, summary: &Summary, operation: Option<&str>) -> Option<f64> {
        match operation {
            Some(operation) => {
                let op = summary.operations.get(operation)?;
                Some(match self {
                    Self::Throughput => op.throughput,
                    Self::MeanLatency => op.mean.as_secs_f64() * 1000.0,
                    Self::Errors => op.errors as f64,
                    Self::Requests => op.requests as f64,
                })
            }
            None => Some(match self {
                Self::Throughput => summary.requests_per_second,
                Self::MeanLatency => {
                    let (weighted, requests) = summary
                        .operations
                        .iter()
                        .filter(|(name, _)| !Operation::new(name.as_str()).is_transactional())
                        .fold((0.0, 0u64), |(sum, n), (_, op)| {
                            (sum + op.mean.as_secs_f64() * 1000.0 * op.requests as f64, n + op.requests)
                        });
                    if requests == 0 {
                        0.0
                    } else {
                        weighted / requests as f64
                    }
                }
                Self::Errors => summary.total_errors as f64,
                Self::Requests => summary.total_requests as f64,
            }),
        }
    }
}

/// Aborts the topology when the last iteration of a test is out of bounds
///
/// Properties: `test-name` (mandatory), `metric` (default `throughput`),
/// `operation` (default: all user operations), `min`, `max`.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalyzeTest {
    test_name: String,
    metric: Metric,
    operation: Option<String>,
    min: Option<f64>,
    max: Option<f64>,
}

impl AnalyzeTest {
    /// Build the stage from evaluated properties
    pub fn from_properties(properties: &Properties) -> Result<Self, StageError> {
        let test_name = properties
            .get(props::TEST_NAME)
            .ok_or_else(|| StageError::MissingProperty(props::TEST_NAME.into()))?
            .to_string();
        let min: Option<f64> = properties.parse("min")?;
        let max: Option<f64> = properties.parse("max")?;
        if let (Some(min), Some(max)) = (min, max) {
            if min > max {
                return Err(StageError::invalid_property(
                    "min",
                    &min.to_string(),
                    format!("greater than max {max}"),
                ));
            }
        }
        Ok(Self {
            test_name,
            metric: properties.parse_or("metric", Metric::Throughput)?,
            operation: properties.get("operation").map(str::to_string),
            min,
            max,
        })
    }
}

#[async_trait]
impl MasterStage for AnalyzeTest {
    fn name(&self) -> &str {
        ANALYZE_TEST
    }

    async fn execute(&self, state: &mut MasterState) -> Result<StageResult, StageError> {
        let summary = &state
            .report()
            .test(&self.test_name)
            .and_then(|test| test.last())
            .ok_or_else(|| StageError::execution(format!("no results for test '{}'", self.test_name)))?
            .summary;
        let value = self
            .metric
            .extract(summary, self.operation.as_deref())
            .ok_or_else(|| {
                StageError::execution(format!(
                    "test '{}' has no operation '{}'",
                    self.test_name,
                    self.operation.as_deref().unwrap_or_default()
                ))
            })?;

        let below = self.min.is_some_and(|min| value < min);
        let above = self.max.is_some_and(|max| value > max);
        if below || above {
            tracing::warn!(
                test = %self.test_name,
                metric = ?self.metric,
                value,
                min = ?self.min,
                max = ?self.max,
                "Test result out of bounds"
            );
            return Ok(StageResult::Abort);
        }
        tracing::info!(test = %self.test_name, metric = ?self.metric, value, "Test result within bounds");
        Ok(StageResult::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Statistics;
    use crate::orchestrator::TestIteration;
    use crate::scenario::Cluster;
    use chrono::Utc;
    use std::time::Duration;

    fn state_with_results(requests: u64, errors: u64) -> MasterState {
        let op = Operation::from_static("BasicOperations.Get");
        let mut stats = Statistics::new();
        for i in 0..requests {
            stats.record_operation(&op, Duration::from_millis(2), i >= errors, Utc::now());
        }
        let mut state = MasterState::new("local", Cluster::single(1), 1);
        let summary = stats.summary();
        state
            .report_mut()
            .add_iteration(
                "load",
                false,
                TestIteration {
                    aggregated: stats,
                    summary,
                    ..Default::default()
                },
            )
            .unwrap();
        state
    }

    fn analyze(pairs: &[(&str, &str)]) -> AnalyzeTest {
        let properties: Properties = pairs.iter().copied().collect();
        AnalyzeTest::from_properties(&properties).unwrap()
    }

    #[tokio::test]
    async fn test_within_bounds_continues() {
        let mut state = state_with_results(10, 0);
        let stage = analyze(&[("test-name", "load"), ("metric", "requests"), ("min", "10")]);
        assert_eq!(stage.execute(&mut state).await.unwrap(), StageResult::Continue);
    }

    #[tokio::test]
    async fn test_out_of_bounds_aborts() {
        let mut state = state_with_results(10, 3);
        let stage = analyze(&[("test-name", "load"), ("metric", "errors"), ("max", "0")]);
        assert_eq!(stage.execute(&mut state).await.unwrap(), StageResult::Abort);
    }

    #[tokio::test]
    async fn test_operation_latency() {
        let mut state = state_with_results(4, 0);
        let stage = analyze(&[
            ("test-name", "load"),
            ("metric", "mean-latency"),
            ("operation", "BasicOperations.Get"),
            ("max", "1"),
        ]);
        assert_eq!(stage.execute(&mut state).await.unwrap(), StageResult::Abort);

        let overall = analyze(&[("test-name", "load"), ("metric", "mean-latency"), ("max", "3")]);
        assert_eq!(overall.execute(&mut state).await.unwrap(), StageResult::Continue);
    }

    #[tokio::test]
    async fn test_missing_test_is_an_error() {
        let mut state = MasterState::new("local", Cluster::single(1), 1);
        let stage = analyze(&[("test-name", "load")]);
        assert!(stage.execute(&mut state).await.is_err());
    }

    #[test]
    fn test_invalid_properties() {
        assert!(AnalyzeTest::from_properties(&Properties::new()).is_err());
        let bad_metric: Properties = [("test-name", "t"), ("metric", "p99")].into_iter().collect();
        assert!(AnalyzeTest::from_properties(&bad_metric).is_err());
        let inverted: Properties = [("test-name", "t"), ("min", "5"), ("max", "1")]
            .into_iter()
            .collect();
        assert!(AnalyzeTest::from_properties(&inverted).is_err());
    }
}
