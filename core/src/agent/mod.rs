//! Worker side of a benchmark
//!
//! A [`WorkerAgent`] owns everything a worker knows about the run: the
//! scenario, the current configuration and topology, and the service it
//! started for that topology. It turns every stage id into exactly one
//! [`crate::ack::Ack`]; stage failures never escape as errors.
//!
//! [`RemoteWorker`] drives an agent from a master connection:
//!
//! ```ignore
//! use gridbench_core::agent::RemoteWorker;
//!
//! let worker = RemoteWorker::connect("10.0.0.1:2103", None, &channel).await?;
//! worker.serve(stages, services).await?;
//! ```

mod executor;
mod remote;

pub use executor::WorkerAgent;
pub use remote::RemoteWorker;
