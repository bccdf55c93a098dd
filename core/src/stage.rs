//! Stage abstractions and the registry resolving stage descriptions
//!
//! A distributed stage runs on workers and is judged on the master from the
//! collected acks. A master stage runs only on the master and gates the
//! rest of the scenario.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ack::{Ack, AckPayload};
use crate::capability::{Capabilities, Requirement};
use crate::config::ConfigError;
use crate::scenario::{Cluster, Properties, PropertyContext, StageDescription};
use crate::state::{MasterState, WorkerState};

/// Property selecting the workers a stage runs on
pub const PROP_WORKERS: &str = "workers";
/// Property selecting the groups a stage runs on
pub const PROP_GROUPS: &str = "groups";
/// Property dispatching a stage to the whole fleet
pub const PROP_RUN_ON_ALL_WORKERS: &str = "run-on-all-workers";

/// Stage failures
#[derive(Debug, Error)]
pub enum StageError {
    /// No stage registered under this type
    #[error("unknown stage type '{0}'")]
    UnknownStage(String),

    /// Stage id outside of the scenario
    #[error("no stage with id {0}")]
    UnknownStageId(usize),

    /// A placeholder could not be resolved
    #[error("unresolved property placeholder '${{{0}}}'")]
    UnresolvedProperty(String),

    /// A mandatory property is missing
    #[error("missing property '{0}'")]
    MissingProperty(String),

    /// A property value does not parse
    #[error("invalid value '{value}' for property '{name}': {reason}")]
    InvalidProperty {
        /// Property name
        name: String,
        /// Raw value
        value: String,
        /// Parse failure
        reason: String,
    },

    /// Stage configuration rejected
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Stage ran and failed
    #[error("{0}")]
    Execution(String),
}

impl StageError {
    /// Shorthand for an unparsable property
    pub fn invalid_property(name: &str, value: &str, reason: impl std::fmt::Display) -> Self {
        Self::InvalidProperty {
            name: name.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Shorthand for an execution failure
    pub fn execution(msg: impl Into<String>) -> Self {
        Self::Execution(msg.into())
    }
}

impl From<crate::error::Error> for StageError {
    fn from(error: crate::error::Error) -> Self {
        match error {
            crate::error::Error::Stage(inner) => inner,
            crate::error::Error::Config(inner) => Self::Config(inner),
            other => Self::Execution(other.to_string()),
        }
    }
}

/// Master-side verdict after a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageResult {
    /// Run the next stage
    Continue,
    /// Skip the remaining stages of this topology
    Abort,
}

/// Which workers of a topology execute a stage
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Targeting {
    /// Explicit worker indexes, if restricted
    pub workers: Option<BTreeSet<usize>>,
    /// Group names, if restricted
    pub groups: Option<BTreeSet<String>>,
    /// Dispatch to the whole fleet rather than the current topology
    pub run_on_all_workers: bool,
}

impl Targeting {
    /// Read targeting from evaluated stage properties
    pub fn from_properties(properties: &Properties) -> Result<Self, StageError> {
        let workers = properties
            .list(PROP_WORKERS)
            .map(|entries| {
                entries
                    .iter()
                    .map(|entry| {
                        entry
                            .parse::<usize>()
                            .map_err(|e| StageError::invalid_property(PROP_WORKERS, entry, e))
                    })
                    .collect::<Result<BTreeSet<_>, _>>()
            })
            .transpose()?;
        let groups = properties
            .list(PROP_GROUPS)
            .map(|entries| entries.into_iter().collect());
        Ok(Self {
            workers,
            groups,
            run_on_all_workers: properties.parse_or(PROP_RUN_ON_ALL_WORKERS, false)?,
        })
    }

    /// Whether the worker at `worker_index` executes the stage
    pub fn includes(&self, worker_index: usize, cluster: &Cluster) -> bool {
        if let Some(workers) = &self.workers {
            if !workers.contains(&worker_index) {
                return false;
            }
        }
        if let Some(groups) = &self.groups {
            match cluster.group_of(worker_index) {
                Some(group) if groups.contains(&group.name) => {}
                _ => return false,
            }
        }
        true
    }

    /// Sorted indexes of the executing workers among `dispatched`
    pub fn executing_workers(&self, dispatched: usize, cluster: &Cluster) -> Vec<usize> {
        (0..dispatched)
            .filter(|&index| self.includes(index, cluster))
            .collect()
    }
}

/// What a distributed stage sees on a worker
pub struct WorkerContext<'a> {
    /// Worker state for the current topology
    pub state: &'a WorkerState,
    /// Capabilities injected for this stage
    pub capabilities: &'a Capabilities,
    /// Sorted indexes of all workers executing this stage
    pub executing_workers: &'a [usize],
}

impl WorkerContext<'_> {
    /// Position of this worker among the executing workers
    pub fn position(&self) -> Option<usize> {
        self.executing_workers
            .iter()
            .position(|&index| index == self.state.worker_index())
    }
}

/// Stage executed on workers
#[async_trait]
pub trait DistStage: Send + Sync {
    /// Stage type name for logs
    fn name(&self) -> &str;

    /// Capabilities the stage needs on a worker
    fn requirements(&self) -> Vec<Requirement> {
        Vec::new()
    }

    /// Run the stage on this worker
    async fn execute_on_worker(&self, context: &WorkerContext<'_>) -> Result<AckPayload, StageError>;

    /// Judge the acks of all dispatched workers, sorted by worker index
    fn process_acks_on_master(&self, acks: &[Ack], _state: &mut MasterState) -> StageResult {
        check_acks(self.name(), acks)
    }
}

/// Stage executed only on the master
#[async_trait]
pub trait MasterStage: Send + Sync {
    /// Stage type name for logs
    fn name(&self) -> &str;

    /// Run the stage; an abort skips the rest of the topology
    async fn execute(&self, state: &mut MasterState) -> Result<StageResult, StageError>;
}

/// Default ack judgement: log timings, abort on any error
pub fn check_acks(stage: &str, acks: &[Ack]) -> StageResult {
    let mut result = StageResult::Continue;
    for ack in acks {
        match &ack.error {
            Some(error) => {
                tracing::warn!(
                    stage,
                    worker = ack.worker_index,
                    error = %error.message,
                    cause = error.cause.as_deref().unwrap_or(""),
                    "Stage failed on worker"
                );
                result = StageResult::Abort;
            }
            None => tracing::debug!(
                stage,
                worker = ack.worker_index,
                duration_ms = ack.duration.map(|d| d.as_millis() as u64),
                "Stage finished on worker"
            ),
        }
    }
    result
}

/// Constructed stage of either kind
pub enum Stage {
    /// Runs on workers
    Distributed(Box<dyn DistStage>),
    /// Runs on the master
    Master(Box<dyn MasterStage>),
}

impl Stage {
    /// Stage type name
    pub fn name(&self) -> &str {
        match self {
            Self::Distributed(stage) => stage.name(),
            Self::Master(stage) => stage.name(),
        }
    }
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Distributed(stage) => write!(f, "Distributed({})", stage.name()),
            Self::Master(stage) => write!(f, "Master({})", stage.name()),
        }
    }
}

/// Stage ready to execute, with its targeting
#[derive(Debug)]
pub struct ResolvedStage {
    /// Stage id in the scenario
    pub id: usize,
    /// Who executes it
    pub targeting: Targeting,
    /// The stage itself
    pub stage: Stage,
}

/// Builds a stage from evaluated properties
pub type StageConstructor = Box<dyn Fn(&Properties) -> Result<Stage, StageError> + Send + Sync>;

/// Maps stage type names to constructors
#[derive(Default)]
pub struct StageRegistry {
    constructors: HashMap<String, StageConstructor>,
}

impl StageRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in stage
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        crate::stages::register_builtin(&mut registry);
        registry
    }

    /// Register a constructor under a stage type name
    pub fn register<F>(&mut self, stage_type: impl Into<String>, constructor: F)
    where
        F: Fn(&Properties) -> Result<Stage, StageError> + Send + Sync + 'static,
    {
        self.constructors
            .insert(stage_type.into(), Box::new(constructor));
    }

    /// Whether a stage type is registered
    pub fn contains(&self, stage_type: &str) -> bool {
        self.constructors.contains_key(stage_type)
    }

    /// Evaluate and construct a stage
    pub fn resolve(
        &self,
        id: usize,
        description: &StageDescription,
        context: &PropertyContext,
    ) -> Result<ResolvedStage, StageError> {
        let constructor = self
            .constructors
            .get(&description.stage_type)
            .ok_or_else(|| StageError::UnknownStage(description.stage_type.clone()))?;
        let properties = description.properties.evaluate(context)?;
        let targeting = Targeting::from_properties(&properties)?;
        let stage = constructor(&properties)?;
        Ok(ResolvedStage {
            id,
            targeting,
            stage,
        })
    }
}

impl std::fmt::Debug for StageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<&String> = self.constructors.keys().collect();
        types.sort();
        f.debug_struct("StageRegistry")
            .field("types", &types)
            .finish()
    }
}
