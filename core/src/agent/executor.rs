//! Stage execution on a worker

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;

use crate::ack::{Ack, AckPayload};
use crate::capability::{inject, Capabilities, InjectResult};
use crate::error::{Error, Result};
use crate::protocol::{ControlObject, END_OF_RUN};
use crate::scenario::{Cluster, Configuration, Scenario};
use crate::service::{ServiceContext, ServiceRegistry};
use crate::stage::{Stage, StageError, StageRegistry, WorkerContext};
use crate::state::WorkerState;
use crate::traits::Lifecycle;

/// Executes stages on behalf of one worker
pub struct WorkerAgent {
    state: WorkerState,
    scenario: Option<Scenario>,
    stages: Arc<StageRegistry>,
    services: Arc<ServiceRegistry>,
    capabilities: Capabilities,
    lifecycle: Option<Arc<dyn Lifecycle>>,
    setup_error: Option<String>,
}

impl WorkerAgent {
    /// Agent for the index and fleet size agreed in the handshake
    pub fn new(
        worker_index: usize,
        fleet_size: usize,
        stages: Arc<StageRegistry>,
        services: Arc<ServiceRegistry>,
    ) -> Self {
        Self {
            state: WorkerState::new(worker_index, fleet_size),
            scenario: None,
            stages,
            services,
            capabilities: Capabilities::new(),
            lifecycle: None,
            setup_error: None,
        }
    }

    /// Index of this worker
    pub fn worker_index(&self) -> usize {
        self.state.worker_index()
    }

    /// Current run state
    pub fn state(&self) -> &WorkerState {
        &self.state
    }

    /// Capabilities of the service started for the current topology
    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// Apply a control object; returns `false` on shutdown
    pub async fn handle_object(&mut self, object: ControlObject) -> bool {
        tracing::debug!(worker_index = self.worker_index(), kind = object.kind(), "Received object");
        match object {
            ControlObject::Scenario(scenario) => self.set_scenario(scenario),
            ControlObject::Configuration(configuration) => self.set_configuration(configuration),
            ControlObject::Cluster(cluster) => self.begin_run(cluster).await,
            ControlObject::Shutdown => {
                if let Err(e) = self.release().await {
                    tracing::warn!(worker_index = self.worker_index(), error = %e, "Service stop failed");
                }
                return false;
            }
        }
        true
    }

    /// Install the scenario
    pub fn set_scenario(&mut self, scenario: Scenario) {
        tracing::info!(
            worker_index = self.worker_index(),
            stages = scenario.stage_count(),
            "Scenario received"
        );
        self.scenario = Some(scenario);
    }

    /// Install the configuration for the following topologies
    pub fn set_configuration(&mut self, configuration: Configuration) {
        tracing::info!(
            worker_index = self.worker_index(),
            configuration = %configuration.name,
            "Configuration received"
        );
        self.state.set_configuration(configuration);
    }

    /// Enter a topology and start this worker's service in it
    ///
    /// A failure to start the service is remembered and reported in the ack
    /// of every stage of this topology.
    pub async fn begin_run(&mut self, cluster: Cluster) {
        if let Err(e) = self.release().await {
            tracing::warn!(worker_index = self.worker_index(), error = %e, "Service stop failed");
        }
        self.setup_error = None;

        let group = cluster.group_of(self.worker_index()).map(|g| g.name.clone());
        let Some(group) = group else {
            tracing::info!(
                worker_index = self.worker_index(),
                cluster = %cluster,
                "Not part of this topology"
            );
            self.state.begin_run(cluster, None);
            return;
        };

        let setup = self
            .state
            .configuration()
            .and_then(|configuration| configuration.setup(&group))
            .cloned();
        let Some(setup) = setup else {
            self.state.begin_run(cluster, None);
            self.setup_error = Some(format!("no service setup for group '{group}'"));
            return;
        };

        self.state.begin_run(cluster, Some(setup.service.clone()));
        if let Err(e) = self.start_service(&setup.service, &group, &setup.properties).await {
            tracing::error!(
                worker_index = self.worker_index(),
                service = %setup.service,
                error = %e,
                "Failed to start service"
            );
            self.setup_error = Some(e.to_string());
        }
    }

    async fn start_service(
        &mut self,
        service: &str,
        group: &str,
        properties: &crate::scenario::Properties,
    ) -> Result<()> {
        let properties = properties.evaluate(&self.state.property_context())?;
        let cluster = self
            .state
            .cluster()
            .ok_or_else(|| Error::orchestration("no active topology"))?;
        let context = ServiceContext {
            worker_index: self.state.worker_index(),
            cluster,
            group,
            properties: &properties,
        };
        let capabilities = self.services.create(service, &context)?;
        let lifecycle = capabilities.get::<dyn Lifecycle>();
        if let Some(lifecycle) = &lifecycle {
            lifecycle
                .start()
                .await
                .map_err(|e| Error::orchestration(format!("service start failed: {e}")))?;
        }
        tracing::info!(
            worker_index = self.worker_index(),
            service,
            capabilities = ?capabilities,
            "Service ready"
        );
        self.capabilities = capabilities;
        self.lifecycle = lifecycle;
        Ok(())
    }

    /// Answer a stage id, including the end-of-run sentinel
    pub async fn handle_stage(&mut self, stage_id: i32) -> Ack {
        if stage_id == END_OF_RUN {
            return self.end_run().await;
        }
        match usize::try_from(stage_id) {
            Ok(id) => self.run_stage(id).await,
            Err(_) => Ack::error(
                self.worker_index(),
                format!("invalid stage id {stage_id}"),
                None,
            ),
        }
    }

    /// Run one stage; failures and panics become error acks
    pub async fn run_stage(&mut self, stage_id: usize) -> Ack {
        let started = Instant::now();
        let worker_index = self.worker_index();
        let result = AssertUnwindSafe(self.execute_stage(stage_id))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".into());
                Err(StageError::execution(format!("stage panicked: {message}")))
            });

        let ack = match result {
            Ok(payload) => Ack::success(worker_index).with_payload(payload),
            Err(e) => {
                tracing::warn!(worker_index, stage_id, error = %e, "Stage failed");
                Ack::error(worker_index, format!("stage {stage_id} failed"), Some(&e))
            }
        };
        ack.with_duration(started.elapsed())
    }

    async fn execute_stage(&self, stage_id: usize) -> std::result::Result<AckPayload, StageError> {
        if let Some(error) = &self.setup_error {
            return Err(StageError::execution(format!("service unavailable: {error}")));
        }
        let scenario = self
            .scenario
            .as_ref()
            .ok_or_else(|| StageError::execution("no scenario received"))?;
        let description = scenario
            .stage(stage_id)
            .ok_or(StageError::UnknownStageId(stage_id))?;
        let cluster = self
            .state
            .cluster()
            .ok_or_else(|| StageError::execution("no active topology"))?;

        let resolved = self
            .stages
            .resolve(stage_id, description, &self.state.property_context())?;
        let stage = match &resolved.stage {
            Stage::Distributed(stage) => stage,
            Stage::Master(stage) => {
                return Err(StageError::execution(format!(
                    "master stage '{}' dispatched to a worker",
                    stage.name()
                )))
            }
        };

        let worker_index = self.worker_index();
        let dispatched = if resolved.targeting.run_on_all_workers {
            self.state.fleet_size()
        } else {
            self.state.cluster_size()
        };
        if worker_index >= dispatched || !resolved.targeting.includes(worker_index, cluster) {
            tracing::debug!(worker_index, stage = stage.name(), "Stage not targeted at this worker");
            return Ok(AckPayload::None);
        }

        let (verdict, injected) = inject(&stage.requirements(), &self.capabilities);
        match verdict {
            InjectResult::Failure(missing) => {
                return Err(StageError::execution(format!(
                    "missing mandatory capabilities: {}",
                    missing.join(", ")
                )))
            }
            InjectResult::Skip(missing) => {
                tracing::info!(
                    worker_index,
                    stage = stage.name(),
                    missing = %missing.join(", "),
                    "Skipping stage"
                );
                return Ok(AckPayload::None);
            }
            InjectResult::Success => {}
        }

        let executing_workers = resolved.targeting.executing_workers(dispatched, cluster);
        let context = WorkerContext {
            state: &self.state,
            capabilities: &injected,
            executing_workers: &executing_workers,
        };
        tracing::info!(worker_index, stage_id, stage = stage.name(), "Executing stage");
        stage.execute_on_worker(&context).await
    }

    /// Leave the current topology and stop its service
    pub async fn end_run(&mut self) -> Ack {
        let worker_index = self.worker_index();
        let stopped = self.release().await;
        self.state.end_run();
        self.setup_error = None;
        match stopped {
            Ok(()) => Ack::success(worker_index),
            Err(e) => Ack::error(worker_index, "failed to stop service", Some(&e)),
        }
    }

    async fn release(&mut self) -> Result<()> {
        self.capabilities = Capabilities::new();
        let Some(lifecycle) = self.lifecycle.take() else {
            return Ok(());
        };
        if !lifecycle.is_running() {
            return Ok(());
        }
        lifecycle
            .stop()
            .await
            .map_err(|e| Error::orchestration(format!("service stop failed: {e}")))
    }
}

impl std::fmt::Debug for WorkerAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerAgent")
            .field("state", &self.state)
            .field("scenario", &self.scenario.as_ref().map(Scenario::stage_count))
            .field("capabilities", &self.capabilities)
            .finish()
    }
}
