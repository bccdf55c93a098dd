//! Builder pattern for Master construction

use std::sync::Arc;

use crate::config::ConfigError;
use crate::error::{Error, Result};
use crate::scenario::Benchmark;
use crate::stage::StageRegistry;

use super::connection::WorkerConnection;
use super::executor::Master;

/// Builder for creating a [`Master`] with a validated benchmark
///
/// # Example
///
/// ```ignore
/// let mut connection = RemoteWorkerConnection::bind(channel).await?;
/// connection.establish(benchmark.max_cluster_size()).await?;
///
/// let master = MasterBuilder::new()
///     .benchmark(benchmark)
///     .connection(Box::new(connection))
///     .build()?;
///
/// let reports = master.run_with_signal_handling().await?;
/// ```
pub struct MasterBuilder {
    benchmark: Option<Benchmark>,
    stages: Option<Arc<StageRegistry>>,
    connection: Option<Box<dyn WorkerConnection>>,
}

impl MasterBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self {
            benchmark: None,
            stages: None,
            connection: None,
        }
    }

    /// Set the benchmark to run
    pub fn benchmark(mut self, benchmark: Benchmark) -> Self {
        self.benchmark = Some(benchmark);
        self
    }

    /// Set the stage registry; defaults to the built-in stages
    pub fn stages(mut self, stages: Arc<StageRegistry>) -> Self {
        self.stages = Some(stages);
        self
    }

    /// Set the connection to the worker fleet
    pub fn connection(mut self, connection: Box<dyn WorkerConnection>) -> Self {
        self.connection = Some(connection);
        self
    }

    /// Build the master
    ///
    /// # Errors
    ///
    /// Returns an error if benchmark or connection are not set, if the
    /// benchmark is invalid, if it uses unregistered stage types, or if
    /// fewer workers are connected than its largest topology needs.
    pub fn build(self) -> Result<Master> {
        let benchmark = self
            .benchmark
            .ok_or_else(|| Error::missing_config("benchmark"))?;
        let connection = self
            .connection
            .ok_or_else(|| Error::missing_config("connection"))?;
        let stages = self
            .stages
            .unwrap_or_else(|| Arc::new(StageRegistry::with_builtin()));

        benchmark.validate()?;
        if let Some(unknown) = benchmark
            .scenario
            .stages()
            .iter()
            .find(|description| !stages.contains(&description.stage_type))
        {
            return Err(ConfigError::InvalidBenchmark(format!(
                "unknown stage type '{}'",
                unknown.stage_type
            ))
            .into());
        }
        if connection.fleet_size() < benchmark.max_cluster_size() {
            return Err(Error::orchestration(format!(
                "benchmark needs {} workers, {} connected",
                benchmark.max_cluster_size(),
                connection.fleet_size()
            )));
        }

        Ok(Master::new(benchmark, stages, connection))
    }
}

impl Default for MasterBuilder {
    fn default() -> Self {
        Self::new()
    }
}
