//! Master-side transport to the worker fleet

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::net::{TcpListener, TcpStream};

use crate::ack::Ack;
use crate::agent::WorkerAgent;
use crate::channel::ChannelConfig;
use crate::error::{Error, Result};
use crate::protocol::{self, ControlObject, ProtocolError, ANY_INDEX};
use crate::service::ServiceRegistry;
use crate::stage::StageRegistry;

/// Sends control objects and stage ids to workers and collects their acks
#[async_trait]
pub trait WorkerConnection: Send {
    /// Number of connected workers
    fn fleet_size(&self) -> usize;

    /// Send an object to every worker
    async fn broadcast(&mut self, object: &ControlObject) -> Result<()>;

    /// Dispatch a stage id to workers `0..workers` and wait for all acks
    ///
    /// Acks are returned in arrival order.
    async fn run_stage(&mut self, stage_id: i32, workers: usize) -> Result<Vec<Ack>>;

    /// Tell every worker to exit and drop the connections
    async fn release(&mut self) -> Result<()> {
        self.broadcast(&ControlObject::Shutdown).await
    }
}

fn check_dispatch(workers: usize, fleet_size: usize) -> Result<()> {
    if workers > fleet_size {
        return Err(Error::orchestration(format!(
            "cannot dispatch to {workers} workers, only {fleet_size} connected"
        )));
    }
    Ok(())
}

fn check_acks_complete(acks: &[Ack], workers: usize) -> Result<()> {
    let mut seen = BTreeSet::new();
    for ack in acks {
        if ack.worker_index >= workers || !seen.insert(ack.worker_index) {
            return Err(ProtocolError::Unexpected(format!(
                "unexpected ack from worker {}",
                ack.worker_index
            ))
            .into());
        }
    }
    Ok(())
}

// ============================================================================
// Remote fleet
// ============================================================================

/// Workers connected over TCP
pub struct RemoteWorkerConnection {
    listener: TcpListener,
    channel: ChannelConfig,
    workers: Vec<TcpStream>,
}

impl RemoteWorkerConnection {
    /// Listen on the configured address
    pub async fn bind(channel: ChannelConfig) -> Result<Self> {
        let listener = TcpListener::bind(channel.bind_address()).await?;
        tracing::info!(address = %listener.local_addr()?, "Master listening");
        Ok(Self {
            listener,
            channel,
            workers: Vec::new(),
        })
    }

    /// Address workers connect to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept workers until the fleet is complete
    ///
    /// Workers proposing an index that is out of range or already taken are
    /// disconnected. Fails when the fleet is not complete within the connect
    /// timeout.
    pub async fn establish(&mut self, fleet_size: usize) -> Result<()> {
        let fleet = i32::try_from(fleet_size)
            .map_err(|_| Error::orchestration(format!("fleet size {fleet_size} too large")))?;
        let timeout = self.channel.connect_timeout;
        let mut slots: Vec<Option<TcpStream>> = (0..fleet_size).map(|_| None).collect();

        let accepted = tokio::time::timeout(timeout, async {
            while slots.iter().any(Option::is_none) {
                let (mut stream, peer) = self.listener.accept().await?;
                stream.set_nodelay(true)?;
                let proposed = match protocol::read_int(&mut stream).await {
                    Ok(proposed) => proposed,
                    Err(e) => {
                        tracing::warn!(%peer, error = %e, "Handshake failed");
                        continue;
                    }
                };
                let Some(index) = assign_index(&slots, proposed) else {
                    tracing::warn!(%peer, proposed, "Rejecting worker with unavailable index");
                    continue;
                };
                let assigned = i32::try_from(index).unwrap_or(ANY_INDEX);
                if let Err(e) = reply(&mut stream, assigned, fleet).await {
                    tracing::warn!(%peer, error = %e, "Handshake failed");
                    continue;
                }
                tracing::info!(%peer, worker_index = index, fleet_size, "Worker connected");
                slots[index] = Some(stream);
            }
            Ok::<_, Error>(())
        })
        .await;

        match accepted {
            Ok(result) => result?,
            Err(_) => {
                let connected = slots.iter().filter(|slot| slot.is_some()).count();
                return Err(Error::orchestration(format!(
                    "only {connected} of {fleet_size} workers connected within {}",
                    humantime::format_duration(timeout)
                )));
            }
        }
        self.workers = slots.into_iter().flatten().collect();
        Ok(())
    }
}

fn assign_index(slots: &[Option<TcpStream>], proposed: i32) -> Option<usize> {
    if proposed == ANY_INDEX {
        return slots.iter().position(Option::is_none);
    }
    let index = usize::try_from(proposed).ok()?;
    match slots.get(index) {
        Some(None) => Some(index),
        _ => None,
    }
}

async fn reply(stream: &mut TcpStream, index: i32, fleet: i32) -> Result<()> {
    protocol::write_int(stream, index).await?;
    protocol::write_int(stream, fleet).await?;
    Ok(())
}

#[async_trait]
impl WorkerConnection for RemoteWorkerConnection {
    fn fleet_size(&self) -> usize {
        self.workers.len()
    }

    async fn broadcast(&mut self, object: &ControlObject) -> Result<()> {
        for stream in &mut self.workers {
            protocol::write_object(stream, object).await?;
        }
        Ok(())
    }

    async fn run_stage(&mut self, stage_id: i32, workers: usize) -> Result<Vec<Ack>> {
        check_dispatch(workers, self.workers.len())?;
        for stream in &mut self.workers[..workers] {
            protocol::write_stage(stream, stage_id).await?;
        }

        let max_frame_len = self.channel.max_frame_len;
        let mut pending: FuturesUnordered<_> = self.workers[..workers]
            .iter_mut()
            .map(|stream| protocol::read_message::<_, Ack>(stream, max_frame_len))
            .collect();
        let mut acks = Vec::with_capacity(workers);
        while let Some(ack) = pending.next().await {
            acks.push(ack?);
        }
        drop(pending);

        check_acks_complete(&acks, workers)?;
        Ok(acks)
    }

    async fn release(&mut self) -> Result<()> {
        let result = self.broadcast(&ControlObject::Shutdown).await;
        self.workers.clear();
        result
    }
}

impl std::fmt::Debug for RemoteWorkerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteWorkerConnection")
            .field("address", &self.listener.local_addr().ok())
            .field("workers", &self.workers.len())
            .finish()
    }
}

// ============================================================================
// Local fleet
// ============================================================================

/// Workers running inside the master process
pub struct LocalWorkerConnection {
    agents: Vec<WorkerAgent>,
}

impl LocalWorkerConnection {
    /// Start `fleet_size` in-process workers
    pub fn new(
        fleet_size: usize,
        stages: Arc<StageRegistry>,
        services: Arc<ServiceRegistry>,
    ) -> Self {
        let agents = (0..fleet_size)
            .map(|index| {
                WorkerAgent::new(index, fleet_size, Arc::clone(&stages), Arc::clone(&services))
            })
            .collect();
        Self { agents }
    }

    /// Agents of the local fleet
    pub fn agents(&self) -> &[WorkerAgent] {
        &self.agents
    }
}

#[async_trait]
impl WorkerConnection for LocalWorkerConnection {
    fn fleet_size(&self) -> usize {
        self.agents.len()
    }

    async fn broadcast(&mut self, object: &ControlObject) -> Result<()> {
        for agent in &mut self.agents {
            agent.handle_object(object.clone()).await;
        }
        Ok(())
    }

    async fn run_stage(&mut self, stage_id: i32, workers: usize) -> Result<Vec<Ack>> {
        check_dispatch(workers, self.agents.len())?;
        let acks: Vec<Ack> = self.agents[..workers]
            .iter_mut()
            .map(|agent| agent.handle_stage(stage_id))
            .collect::<FuturesUnordered<_>>()
            .collect()
            .await;
        check_acks_complete(&acks, workers)?;
        Ok(acks)
    }
}

impl std::fmt::Debug for LocalWorkerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalWorkerConnection")
            .field("workers", &self.agents.len())
            .finish()
    }
}
