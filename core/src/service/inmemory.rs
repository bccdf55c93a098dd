//! In-process key/value service
//!
//! Backed by a [`DashMap`]. Useful for local runs and for exercising stages
//! without a real product under test. Setup properties:
//!
//! - `transactional` (bool, default `true`): publish [`Transactional`]
//! - `latency` (duration, default none): delay added to every operation

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;

use super::ServiceContext;
use crate::capability::Capabilities;
use crate::error::Result;
use crate::traits::{
    BasicOperations, Clustered, Lifecycle, OperationError, Transaction, Transactional,
};

/// Registered name of the in-memory service
pub const INMEMORY: &str = "inmemory";

struct Inner {
    store: DashMap<String, Vec<u8>>,
    running: AtomicBool,
    latency: Option<Duration>,
    member: String,
    members: Vec<String>,
}

/// Key/value service living inside the worker process
#[derive(Clone)]
pub struct InMemoryService {
    inner: Arc<Inner>,
}

impl InMemoryService {
    /// Stopped service for `worker_index` in a cluster of `cluster_size`
    pub fn new(worker_index: usize, cluster_size: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                store: DashMap::new(),
                running: AtomicBool::new(false),
                latency: None,
                member: member_name(worker_index),
                members: (0..cluster_size.max(1)).map(member_name).collect(),
            }),
        }
    }

    /// Add a fixed delay to every operation
    ///
    /// Only meaningful before the service is shared.
    pub fn with_latency(self, latency: Duration) -> Self {
        match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                inner.latency = Some(latency);
                Self {
                    inner: Arc::new(inner),
                }
            }
            Err(inner) => Self { inner },
        }
    }

    /// Capabilities of this instance
    pub fn capabilities(&self, transactional: bool) -> Capabilities {
        let lifecycle: Arc<dyn Lifecycle> = Arc::new(self.clone());
        let basic: Arc<dyn BasicOperations> = Arc::new(self.clone());
        let clustered: Arc<dyn Clustered> = Arc::new(self.clone());
        let mut capabilities = Capabilities::new()
            .with(lifecycle)
            .with(basic)
            .with(clustered);
        if transactional {
            let tx: Arc<dyn Transactional> = Arc::new(self.clone());
            capabilities.register(tx);
        }
        capabilities
    }

    /// [`super::ServiceFactory`] entry point
    pub fn factory(context: &ServiceContext<'_>) -> Result<Capabilities> {
        let transactional = context.properties.parse_or("transactional", true)?;
        let mut service = Self::new(context.worker_index, context.cluster.size());
        if let Some(latency) = context.properties.duration("latency")? {
            service = service.with_latency(latency);
        }
        tracing::debug!(
            worker_index = context.worker_index,
            group = context.group,
            transactional,
            "Created in-memory service"
        );
        Ok(service.capabilities(transactional))
    }

    /// Number of stored entries
    pub fn len(&self) -> usize {
        self.inner.store.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.inner.store.is_empty()
    }

    async fn before_operation(&self) -> std::result::Result<(), OperationError> {
        if !self.is_running() {
            return Err(OperationError::failed("service is not running"));
        }
        if let Some(latency) = self.inner.latency {
            tokio::time::sleep(latency).await;
        }
        Ok(())
    }

    fn apply(&self, writes: BTreeMap<String, Option<Vec<u8>>>) {
        for (key, value) in writes {
            match value {
                Some(value) => {
                    self.inner.store.insert(key, value);
                }
                None => {
                    self.inner.store.remove(&key);
                }
            }
        }
    }
}

fn member_name(index: usize) -> String {
    format!("{INMEMORY}-{index}")
}

impl std::fmt::Debug for InMemoryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryService")
            .field("member", &self.inner.member)
            .field("entries", &self.inner.store.len())
            .field("running", &self.is_running())
            .finish()
    }
}

#[async_trait]
impl Lifecycle for InMemoryService {
    async fn start(&self) -> std::result::Result<(), OperationError> {
        self.inner.running.store(true, Ordering::SeqCst);
        tracing::info!(member = %self.inner.member, "In-memory service started");
        Ok(())
    }

    async fn stop(&self) -> std::result::Result<(), OperationError> {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.store.clear();
        tracing::info!(member = %self.inner.member, "In-memory service stopped");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BasicOperations for InMemoryService {
    async fn get(&self, key: &str) -> std::result::Result<Option<Vec<u8>>, OperationError> {
        self.before_operation().await?;
        Ok(self.inner.store.get(key).map(|entry| entry.value().clone()))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> std::result::Result<(), OperationError> {
        self.before_operation().await?;
        self.inner.store.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> std::result::Result<bool, OperationError> {
        self.before_operation().await?;
        Ok(self.inner.store.remove(key).is_some())
    }
}

impl Transactional for InMemoryService {
    fn is_transactional(&self, _resource: &str) -> bool {
        true
    }

    fn transaction(&self) -> Box<dyn Transaction> {
        Box::new(InMemoryTransaction {
            service: self.clone(),
            writes: Arc::new(Mutex::new(BTreeMap::new())),
            active: false,
        })
    }
}

impl Clustered for InMemoryService {
    fn is_coordinator(&self) -> bool {
        self.inner.members.first() == Some(&self.inner.member)
    }

    fn members(&self) -> Vec<String> {
        self.inner.members.clone()
    }
}

type WriteSet = Arc<Mutex<BTreeMap<String, Option<Vec<u8>>>>>;

fn lock_writes(
    writes: &WriteSet,
) -> std::result::Result<std::sync::MutexGuard<'_, BTreeMap<String, Option<Vec<u8>>>>, OperationError>
{
    writes
        .lock()
        .map_err(|_| OperationError::unrecoverable("transaction write set poisoned"))
}

/// Transaction buffering writes until commit
struct InMemoryTransaction {
    service: InMemoryService,
    writes: WriteSet,
    active: bool,
}

#[async_trait]
impl Transaction for InMemoryTransaction {
    fn wrap_basic(&self, operations: Arc<dyn BasicOperations>) -> Arc<dyn BasicOperations> {
        Arc::new(TransactionView {
            base: operations,
            writes: Arc::clone(&self.writes),
        })
    }

    async fn begin(&mut self) -> std::result::Result<(), OperationError> {
        if self.active {
            return Err(OperationError::Transaction("transaction already active".into()));
        }
        if !self.service.is_running() {
            return Err(OperationError::Transaction("service is not running".into()));
        }
        lock_writes(&self.writes)?.clear();
        self.active = true;
        Ok(())
    }

    async fn commit(&mut self) -> std::result::Result<(), OperationError> {
        if !self.active {
            return Err(OperationError::Transaction("no active transaction".into()));
        }
        self.active = false;
        let writes = std::mem::take(&mut *lock_writes(&self.writes)?);
        self.service.apply(writes);
        Ok(())
    }

    async fn rollback(&mut self) -> std::result::Result<(), OperationError> {
        if !self.active {
            return Err(OperationError::Transaction("no active transaction".into()));
        }
        self.active = false;
        lock_writes(&self.writes)?.clear();
        Ok(())
    }
}

/// Reads see the transaction's own writes first
struct TransactionView {
    base: Arc<dyn BasicOperations>,
    writes: WriteSet,
}

impl TransactionView {
    fn pending(&self, key: &str) -> std::result::Result<Option<Option<Vec<u8>>>, OperationError> {
        Ok(lock_writes(&self.writes)?.get(key).cloned())
    }
}

#[async_trait]
impl BasicOperations for TransactionView {
    async fn get(&self, key: &str) -> std::result::Result<Option<Vec<u8>>, OperationError> {
        match self.pending(key)? {
            Some(pending) => Ok(pending),
            None => self.base.get(key).await,
        }
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> std::result::Result<(), OperationError> {
        lock_writes(&self.writes)?.insert(key.to_string(), Some(value));
        Ok(())
    }

    async fn remove(&self, key: &str) -> std::result::Result<bool, OperationError> {
        let existed = self.get(key).await?.is_some();
        lock_writes(&self.writes)?.insert(key.to_string(), None);
        Ok(existed)
    }
}
