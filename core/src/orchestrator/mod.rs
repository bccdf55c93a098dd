//! Master side of a benchmark
//!
//! The [`Master`] walks every configuration and topology of a
//! [`crate::scenario::Benchmark`]:
//! - Broadcasting the scenario, configurations and topologies
//! - Dispatching stage ids and waiting for the acks of every dispatched worker
//! - Judging acks in worker index order and aborting the topology on failure
//! - Closing every topology with the end-of-run sentinel
//!
//! # Example
//!
//! ```ignore
//! use gridbench_core::orchestrator::{LocalWorkerConnection, MasterBuilder};
//!
//! let connection = LocalWorkerConnection::new(2, stages.clone(), services);
//! let master = MasterBuilder::new()
//!     .benchmark(benchmark)
//!     .stages(stages)
//!     .connection(Box::new(connection))
//!     .build()?;
//!
//! let reports = master.run().await?;
//! ```

mod aggregator;
mod builder;
mod connection;
mod executor;

pub use aggregator::{aggregate_statistics, Report, StageRecord, TestIteration, TestResult};
pub use builder::MasterBuilder;
pub use connection::{LocalWorkerConnection, RemoteWorkerConnection, WorkerConnection};
pub use executor::Master;
