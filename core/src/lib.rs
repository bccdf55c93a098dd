//! gridbench-core: Distributed benchmarking of cache and data-grid services
//!
//! A master drives a fleet of workers through a scenario, stage by stage,
//! for every configuration and topology of a benchmark. This crate provides:
//!
//! - Benchmark descriptors and property evaluation ([`scenario`])
//! - The master/worker wire protocol ([`protocol`])
//! - Stage contracts and the built-in stages ([`stage`], [`stages`])
//! - Service capabilities and the in-memory reference service ([`traits`], [`service`])
//! - The per-worker concurrent stress engine ([`stress`])
//! - Statistics collection and aggregation ([`metrics`])
//! - Master and worker drivers ([`orchestrator`], [`agent`])

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod ack;
pub mod agent;
pub mod capability;
pub mod channel;
pub mod completion;
pub mod config;
pub mod error;
pub mod metrics;
pub mod orchestrator;
pub mod protocol;
pub mod request;
pub mod scenario;
pub mod selector;
pub mod service;
pub mod stage;
pub mod stages;
pub mod state;
pub mod stress;
pub mod traits;

pub use ack::{Ack, AckError, AckPayload};
pub use agent::{RemoteWorker, WorkerAgent};
pub use channel::ChannelConfig;
pub use config::{ConfigError, StressTestConfig, TransactionMode};
pub use error::{Error, Result};
pub use metrics::{Statistics, Summary};
pub use orchestrator::{
    LocalWorkerConnection, Master, MasterBuilder, RemoteWorkerConnection, Report, WorkerConnection,
};
pub use request::Operation;
pub use scenario::{Benchmark, Cluster, Configuration, Properties, Scenario};
pub use service::{ServiceRegistry, INMEMORY};
pub use stage::{DistStage, MasterStage, Stage, StageRegistry, StageResult};
pub use stress::{StressTest, StressTestBuilder};
