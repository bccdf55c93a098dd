//! Master run loop

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;

use crate::ack::Ack;
use crate::error::{Error, Result};
use crate::protocol::{ControlObject, END_OF_RUN};
use crate::scenario::Benchmark;
use crate::stage::{Stage, StageRegistry, StageResult};
use crate::state::MasterState;

use super::aggregator::Report;
use super::connection::WorkerConnection;

/// Drives the worker fleet through every configuration and topology
///
/// Stages run strictly one after another: a stage is acknowledged by every
/// dispatched worker before the next one is sent. An aborted stage skips
/// the rest of its topology only.
pub struct Master {
    pub(crate) benchmark: Benchmark,
    pub(crate) stages: Arc<StageRegistry>,
    pub(crate) connection: Box<dyn WorkerConnection>,
    pub(crate) shutdown_tx: broadcast::Sender<()>,
    shutdown_rx: Option<broadcast::Receiver<()>>,
}

impl Master {
    /// Create a master over an established connection
    ///
    /// Use `MasterBuilder` for validated construction.
    pub fn new(
        benchmark: Benchmark,
        stages: Arc<StageRegistry>,
        connection: Box<dyn WorkerConnection>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        Self {
            benchmark,
            stages,
            connection,
            shutdown_tx,
            shutdown_rx: Some(shutdown_rx),
        }
    }

    /// The benchmark being run
    pub fn benchmark(&self) -> &Benchmark {
        &self.benchmark
    }

    /// Request a stop after the current stage
    ///
    /// The current topology is closed with the end-of-run sentinel and the
    /// workers are released.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Handle to request a stop from another task
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Run the benchmark, returning one report per configuration and topology
    ///
    /// # Errors
    ///
    /// Connection failures are fatal. Stage failures are not: they abort
    /// the current topology and are recorded in its report.
    pub async fn run(mut self) -> Result<Vec<Report>> {
        let started = Instant::now();
        let fleet_size = self.connection.fleet_size();
        let required = self.benchmark.max_cluster_size();
        if fleet_size < required {
            return Err(Error::orchestration(format!(
                "benchmark needs {required} workers, {fleet_size} connected"
            )));
        }
        let mut shutdown_rx = self
            .shutdown_rx
            .take()
            .unwrap_or_else(|| self.shutdown_tx.subscribe());

        tracing::info!(
            workers = fleet_size,
            stages = self.benchmark.scenario.stage_count(),
            configurations = self.benchmark.configurations.len(),
            clusters = self.benchmark.clusters.len(),
            "Starting benchmark"
        );
        self.connection
            .broadcast(&ControlObject::Scenario(self.benchmark.scenario.clone()))
            .await?;

        let mut state: Option<MasterState> = None;
        let mut stopping = false;
        let configurations = self.benchmark.configurations.clone();
        let clusters = self.benchmark.clusters.clone();

        'configurations: for configuration in &configurations {
            self.connection
                .broadcast(&ControlObject::Configuration(configuration.clone()))
                .await?;

            for cluster in &clusters {
                if let Some(existing) = state.as_mut() {
                    existing.next_run(configuration.name.clone(), cluster.clone());
                }
                let current = state.get_or_insert_with(|| {
                    MasterState::new(configuration.name.clone(), cluster.clone(), required)
                });
                tracing::info!(
                    configuration = %configuration.name,
                    cluster = %cluster,
                    "Starting run"
                );
                self.connection
                    .broadcast(&ControlObject::Cluster(cluster.clone()))
                    .await?;

                let outcome = self.run_stages(current, &mut shutdown_rx).await;

                // The sentinel goes out even when the stage loop failed, so
                // workers release run-scoped resources.
                let released = self.connection.run_stage(END_OF_RUN, fleet_size).await;
                let stopped = outcome?;
                log_release_failures(&released?);

                if stopped {
                    stopping = true;
                    break 'configurations;
                }
            }
        }

        if stopping {
            tracing::warn!("Benchmark stopped before completion");
        }
        self.connection.release().await?;

        let reports = state.map(MasterState::into_reports).unwrap_or_default();
        tracing::info!(
            elapsed_secs = started.elapsed().as_secs_f64(),
            runs = reports.len(),
            aborted = reports.iter().filter(|r| r.is_aborted()).count(),
            "Benchmark finished"
        );
        Ok(reports)
    }

    /// Run the scenario on the current topology; returns whether a stop was requested
    async fn run_stages(
        &mut self,
        state: &mut MasterState,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> Result<bool> {
        let fleet_size = self.connection.fleet_size();
        let scenario = self.benchmark.scenario.clone();

        for (id, description) in scenario.stages().iter().enumerate() {
            // a lagged receiver still means a stop was requested
            if !matches!(shutdown_rx.try_recv(), Err(TryRecvError::Empty)) {
                tracing::warn!(stage_id = id, "Stop requested, skipping remaining stages");
                state.report_mut().abort_at(id);
                return Ok(true);
            }

            let resolved = match self.stages.resolve(id, description, &state.property_context()) {
                Ok(resolved) => resolved,
                Err(e) => {
                    tracing::error!(stage_id = id, stage = %description.stage_type, error = %e, "Cannot resolve stage");
                    state.report_mut().abort_at(id);
                    break;
                }
            };

            let result = match &resolved.stage {
                Stage::Master(stage) => {
                    tracing::info!(stage_id = id, stage = stage.name(), "Executing master stage");
                    let result = stage.execute(state).await.unwrap_or_else(|e| {
                        tracing::error!(stage_id = id, stage = stage.name(), error = %e, "Master stage failed");
                        StageResult::Abort
                    });
                    state.report_mut().record_master_stage(id, stage.name(), result);
                    result
                }
                Stage::Distributed(stage) => {
                    let workers = if resolved.targeting.run_on_all_workers {
                        fleet_size
                    } else {
                        state.cluster_size()
                    };
                    let stage_id = i32::try_from(id)
                        .map_err(|_| Error::orchestration(format!("stage id {id} out of range")))?;
                    tracing::info!(stage_id = id, stage = stage.name(), workers, "Dispatching stage");

                    let mut acks = self.connection.run_stage(stage_id, workers).await?;
                    sort_acks(&mut acks);
                    let result = stage.process_acks_on_master(&acks, state);
                    state.report_mut().record_dist_stage(id, stage.name(), &acks, result);
                    result
                }
            };

            if result == StageResult::Abort {
                tracing::warn!(
                    stage_id = id,
                    stage = resolved.stage.name(),
                    cluster = %state.cluster(),
                    "Stage aborted, skipping remaining stages of this run"
                );
                break;
            }
        }
        Ok(false)
    }

    /// Run with Ctrl+C handling
    ///
    /// Ctrl+C stops the benchmark after the current stage.
    pub async fn run_with_signal_handling(self) -> Result<Vec<Report>> {
        let shutdown_tx = self.shutdown_tx.clone();
        let signal_handle = tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    tracing::info!("Received Ctrl+C, stopping after the current stage...");
                    let _ = shutdown_tx.send(());
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to listen for Ctrl+C");
                }
            }
        });

        let result = self.run().await;
        signal_handle.abort();
        result
    }
}

/// Order acks by worker index
pub(crate) fn sort_acks(acks: &mut [Ack]) {
    acks.sort_by_key(|ack| ack.worker_index);
}

fn log_release_failures(acks: &[Ack]) {
    for ack in acks.iter().filter(|ack| ack.is_error()) {
        tracing::warn!(worker = ack.worker_index, ack = %ack, "Worker failed to release run resources");
    }
}

impl std::fmt::Debug for Master {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Master")
            .field("workers", &self.connection.fleet_size())
            .field("stages", &self.benchmark.scenario.stage_count())
            .field("configurations", &self.benchmark.configurations.len())
            .field("clusters", &self.benchmark.clusters.len())
            .finish()
    }
}
