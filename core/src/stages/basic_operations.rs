//! Key/value stress test over [`BasicOperations`]

use std::sync::Arc;

use async_trait::async_trait;
use rand::rngs::SmallRng;
use rand::Rng;

use super::{props, stress_config, DEFAULT_TEST_NAME, WARMUP_TEST_NAME};
use crate::ack::{Ack, AckPayload};
use crate::capability::Requirement;
use crate::config::StressTestConfig;
use crate::orchestrator::TestIteration;
use crate::request::Operation;
use crate::scenario::Properties;
use crate::selector::{OperationSelector, RatioOperationSelector};
use crate::stage::{check_acks, DistStage, StageError, StageResult, WorkerContext};
use crate::state::MasterState;
use crate::stress::{LogicFactory, OperationLogic, StressTestBuilder, StressorContext};
use crate::traits::{BasicOperations, Lifecycle, OperationError, Transaction, Transactional};

/// Registered stage type
pub const BASIC_OPERATIONS_TEST: &str = "basic-operations-test";

/// Operations of this test
pub mod ops {
    use crate::request::Operation;

    /// Read a key
    pub const GET: Operation = Operation::from_static("BasicOperations.Get");
    /// Write a key
    pub const PUT: Operation = Operation::from_static("BasicOperations.Put");
    /// Remove a key
    pub const REMOVE: Operation = Operation::from_static("BasicOperations.Remove");
}

const DEFAULT_GET_RATIO: u32 = 4;
const DEFAULT_PUT_RATIO: u32 = 1;
const DEFAULT_NUM_ENTRIES: usize = 100;
const DEFAULT_ENTRY_SIZE: usize = 1000;

/// Stress test issuing get, put and remove calls in a configured mix
///
/// Properties, besides the stress settings read by [`stress_config`]:
/// `get-ratio` (4), `put-ratio` (1), `remove-ratio` (0), `num-entries`
/// (100), `entry-size` (1000).
pub struct BasicOperationsTest {
    config: StressTestConfig,
    selector: Arc<dyn OperationSelector>,
    num_entries: usize,
    entry_size: usize,
    test_name: String,
    amend_test: bool,
    seed: Option<u64>,
}

impl BasicOperationsTest {
    /// Build the stage from evaluated properties
    pub fn from_properties(properties: &Properties) -> Result<Self, StageError> {
        let config = stress_config(properties)?;
        let selector = RatioOperationSelector::builder()
            .add(ops::GET, properties.parse_or("get-ratio", DEFAULT_GET_RATIO)?)
            .add(ops::PUT, properties.parse_or("put-ratio", DEFAULT_PUT_RATIO)?)
            .add(ops::REMOVE, properties.parse_or("remove-ratio", 0)?)
            .build()?;
        let num_entries: usize = properties.parse_or("num-entries", DEFAULT_NUM_ENTRIES)?;
        if num_entries == 0 {
            return Err(StageError::invalid_property(
                "num-entries",
                "0",
                "at least one entry is required",
            ));
        }
        Ok(Self {
            config,
            selector: Arc::new(selector),
            num_entries,
            entry_size: properties.parse_or("entry-size", DEFAULT_ENTRY_SIZE)?,
            test_name: properties
                .get(props::TEST_NAME)
                .unwrap_or(DEFAULT_TEST_NAME)
                .to_string(),
            amend_test: properties.parse_or(props::AMEND_TEST, false)?,
            seed: properties.parse(props::SEED)?,
        })
    }

    /// Stress settings of this stage
    pub fn config(&self) -> &StressTestConfig {
        &self.config
    }

    /// Name results are reported under
    pub fn test_name(&self) -> &str {
        &self.test_name
    }
}

impl std::fmt::Debug for BasicOperationsTest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicOperationsTest")
            .field("config", &self.config)
            .field("num_entries", &self.num_entries)
            .field("entry_size", &self.entry_size)
            .field("test_name", &self.test_name)
            .finish()
    }
}

#[async_trait]
impl DistStage for BasicOperationsTest {
    fn name(&self) -> &str {
        BASIC_OPERATIONS_TEST
    }

    fn requirements(&self) -> Vec<Requirement> {
        vec![
            Requirement::mandatory::<dyn BasicOperations>(),
            Requirement::optional::<dyn Transactional>(),
            Requirement::optional::<dyn Lifecycle>(),
        ]
    }

    async fn execute_on_worker(&self, context: &WorkerContext<'_>) -> Result<AckPayload, StageError> {
        if let Some(lifecycle) = context.capabilities.get::<dyn Lifecycle>() {
            if !lifecycle.is_running() {
                tracing::info!(
                    worker_index = context.state.worker_index(),
                    "Service is not running, skipping test"
                );
                return Ok(AckPayload::None);
            }
        }
        let position = context.position().ok_or_else(|| {
            StageError::execution("worker is not among the executing workers")
        })?;
        let basic = context
            .capabilities
            .get::<dyn BasicOperations>()
            .ok_or_else(|| StageError::execution("BasicOperations capability not injected"))?;

        let factory = KeyValueFactory {
            basic,
            num_entries: self.num_entries,
            entry_size: self.entry_size,
        };
        let mut builder = StressTestBuilder::new(self.config.clone())
            .logic(Arc::new(factory))
            .selector(Arc::clone(&self.selector))
            .transactional(context.capabilities.get::<dyn Transactional>())
            .participants(position, context.executing_workers.len());
        if let Some(seed) = self.seed {
            builder = builder.seed(seed);
        }
        let test = builder.build()?;

        tracing::info!(
            test = %self.test_name,
            worker_index = context.state.worker_index(),
            threads = test.threads(),
            transactions = test.uses_transactions(),
            "Starting basic operations test"
        );
        let outcome = test.run().await?;
        Ok(AckPayload::Statistics(outcome.statistics))
    }

    fn process_acks_on_master(&self, acks: &[Ack], state: &mut MasterState) -> StageResult {
        if check_acks(self.name(), acks) == StageResult::Abort {
            return StageResult::Abort;
        }
        if self.test_name == WARMUP_TEST_NAME {
            return StageResult::Continue;
        }
        let iteration = TestIteration::from_acks(acks);
        tracing::info!(
            test = %self.test_name,
            requests = iteration.summary.total_requests,
            errors = iteration.summary.total_errors,
            throughput = iteration.summary.requests_per_second,
            "Test finished"
        );
        match state
            .report_mut()
            .add_iteration(&self.test_name, self.amend_test, iteration)
        {
            Ok(()) => StageResult::Continue,
            Err(e) => {
                tracing::error!(test = %self.test_name, error = %e, "Cannot record test results");
                StageResult::Abort
            }
        }
    }
}

struct KeyValueFactory {
    basic: Arc<dyn BasicOperations>,
    num_entries: usize,
    entry_size: usize,
}

impl LogicFactory for KeyValueFactory {
    fn create(&self, context: &StressorContext) -> Box<dyn OperationLogic> {
        Box::new(KeyValueLogic {
            basic: Arc::clone(&self.basic),
            current: Arc::clone(&self.basic),
            num_entries: self.num_entries,
            value: vec![(context.global_thread_index % 256) as u8; self.entry_size],
        })
    }
}

/// Per-thread logic; `current` is the transactional view while a batch is open
struct KeyValueLogic {
    basic: Arc<dyn BasicOperations>,
    current: Arc<dyn BasicOperations>,
    num_entries: usize,
    value: Vec<u8>,
}

#[async_trait]
impl OperationLogic for KeyValueLogic {
    fn transaction_started(&mut self, transaction: &dyn Transaction) {
        self.current = transaction.wrap_basic(Arc::clone(&self.basic));
    }

    fn transaction_ended(&mut self) {
        self.current = Arc::clone(&self.basic);
    }

    async fn invoke(&mut self, operation: &Operation, rng: &mut SmallRng) -> Result<(), OperationError> {
        let key = format!("key{}", rng.gen_range(0..self.num_entries));
        if *operation == ops::GET {
            self.current.get(&key).await.map(|_| ())
        } else if *operation == ops::PUT {
            self.current.put(&key, self.value.clone()).await
        } else if *operation == ops::REMOVE {
            self.current.remove(&key).await.map(|_| ())
        } else {
            Err(OperationError::unrecoverable(format!(
                "unsupported operation {operation}"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::Capabilities;
    use crate::scenario::{Cluster, Configuration};
    use crate::service::InMemoryService;
    use crate::state::WorkerState;

    fn worker_state(index: usize, size: usize) -> WorkerState {
        let mut state = WorkerState::new(index, size);
        state.set_configuration(Configuration::single("local", "inmemory"));
        state.begin_run(Cluster::single(size), Some("inmemory".into()));
        state
    }

    fn stage(extra: &[(&str, &str)]) -> BasicOperationsTest {
        let mut properties = Properties::new()
            .with("num-threads-per-node", "2")
            .with("num-requests", "40")
            .with("num-entries", "10")
            .with("entry-size", "8")
            .with("seed", "7");
        for (k, v) in extra {
            properties.insert(*k, *v);
        }
        BasicOperationsTest::from_properties(&properties).unwrap()
    }

    #[test]
    fn test_from_properties_validates_eagerly() {
        let missing_threads = Properties::new().with("duration", "1s");
        assert!(BasicOperationsTest::from_properties(&missing_threads).is_err());

        let no_operations = Properties::new()
            .with("total-threads", "1")
            .with("get-ratio", "0")
            .with("put-ratio", "0");
        assert!(BasicOperationsTest::from_properties(&no_operations).is_err());

        let stage = stage(&[("test-name", "load")]);
        assert_eq!(stage.test_name(), "load");
        assert_eq!(stage.config().threads_per_node, Some(2));
    }

    #[tokio::test]
    async fn test_runs_against_inmemory_service() {
        let service = InMemoryService::new(0, 1);
        service.start().await.unwrap();
        let capabilities = service.capabilities(true);
        let state = worker_state(0, 1);
        let context = WorkerContext {
            state: &state,
            capabilities: &capabilities,
            executing_workers: &[0],
        };

        let payload = stage(&[("put-ratio", "1"), ("get-ratio", "1")])
            .execute_on_worker(&context)
            .await
            .unwrap();
        let AckPayload::Statistics(stats) = payload else {
            panic!("expected statistics");
        };
        assert_eq!(stats.len(), 2);
        let total: u64 = stats.iter().map(|s| s.total_requests()).sum();
        assert_eq!(total, 40);
        assert!(!service.is_empty());
    }

    #[tokio::test]
    async fn test_skips_when_service_stopped() {
        let service = InMemoryService::new(0, 1);
        let capabilities = service.capabilities(false);
        let state = worker_state(0, 1);
        let context = WorkerContext {
            state: &state,
            capabilities: &capabilities,
            executing_workers: &[0],
        };
        let payload = stage(&[]).execute_on_worker(&context).await.unwrap();
        assert_eq!(payload, AckPayload::None);
    }

    #[tokio::test]
    async fn test_fails_outside_executing_workers() {
        let capabilities = Capabilities::new();
        let state = worker_state(1, 2);
        let context = WorkerContext {
            state: &state,
            capabilities: &capabilities,
            executing_workers: &[0],
        };
        assert!(stage(&[]).execute_on_worker(&context).await.is_err());
    }

    #[test]
    fn test_master_records_iterations() {
        let mut state = MasterState::new("local", Cluster::single(1), 1);
        let acks = vec![Ack::success(0).with_payload(AckPayload::Statistics(vec![]))];

        let named = stage(&[("test-name", "load")]);
        assert_eq!(named.process_acks_on_master(&acks, &mut state), StageResult::Continue);
        assert!(state.report().test("load").is_some());
        assert_eq!(named.process_acks_on_master(&acks, &mut state), StageResult::Abort);

        let warmup = stage(&[("test-name", "warmup")]);
        assert_eq!(warmup.process_acks_on_master(&acks, &mut state), StageResult::Continue);
        assert!(state.report().test("warmup").is_none());

        let failed = vec![Ack::error(0, "boom", None)];
        assert_eq!(named.process_acks_on_master(&failed, &mut state), StageResult::Abort);
    }
}
