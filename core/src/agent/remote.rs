//! Worker process connected to a remote master

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;

use crate::channel::ChannelConfig;
use crate::error::{Error, Result};
use crate::protocol::{self, MasterMessage, ProtocolError, ANY_INDEX};
use crate::service::ServiceRegistry;
use crate::stage::StageRegistry;

use super::executor::WorkerAgent;

const RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Worker connection after a successful handshake
pub struct RemoteWorker {
    stream: TcpStream,
    worker_index: usize,
    fleet_size: usize,
    max_frame_len: usize,
}

impl RemoteWorker {
    /// Connect to the master and perform the handshake
    ///
    /// Connection attempts are retried until `channel.connect_timeout`
    /// elapses, so workers may be started before the master.
    pub async fn connect(
        master: &str,
        proposed_index: Option<usize>,
        channel: &ChannelConfig,
    ) -> Result<Self> {
        let deadline = Instant::now() + channel.connect_timeout;
        let mut stream = loop {
            match TcpStream::connect(master).await {
                Ok(stream) => break stream,
                Err(e) if Instant::now() + RETRY_INTERVAL < deadline => {
                    tracing::debug!(master, error = %e, "Master not reachable yet, retrying");
                    tokio::time::sleep(RETRY_INTERVAL).await;
                }
                Err(e) => return Err(Error::Io(e)),
            }
        };
        stream.set_nodelay(true)?;

        let proposed = match proposed_index {
            Some(index) => i32::try_from(index).map_err(|_| {
                ProtocolError::Handshake(format!("worker index {index} out of range"))
            })?,
            None => ANY_INDEX,
        };
        protocol::write_int(&mut stream, proposed).await?;
        let worker_index = read_non_negative(&mut stream, "worker index").await?;
        let fleet_size = read_non_negative(&mut stream, "fleet size").await?;
        if worker_index >= fleet_size {
            return Err(ProtocolError::Handshake(format!(
                "assigned index {worker_index} outside fleet of {fleet_size}"
            ))
            .into());
        }

        tracing::info!(master, worker_index, fleet_size, "Connected to master");
        Ok(Self {
            stream,
            worker_index,
            fleet_size,
            max_frame_len: channel.max_frame_len,
        })
    }

    /// Index confirmed by the master
    pub fn worker_index(&self) -> usize {
        self.worker_index
    }

    /// Number of workers in the fleet
    pub fn fleet_size(&self) -> usize {
        self.fleet_size
    }

    /// Serve the master until it sends a shutdown
    ///
    /// Any connection or framing error ends the worker.
    pub async fn serve(
        mut self,
        stages: Arc<StageRegistry>,
        services: Arc<ServiceRegistry>,
    ) -> Result<()> {
        let mut agent = WorkerAgent::new(self.worker_index, self.fleet_size, stages, services);
        loop {
            match protocol::read_master_message(&mut self.stream, self.max_frame_len).await? {
                MasterMessage::Object(object) => {
                    if !agent.handle_object(object).await {
                        tracing::info!(worker_index = self.worker_index, "Shutdown requested");
                        return Ok(());
                    }
                }
                MasterMessage::Stage(stage_id) => {
                    let ack = agent.handle_stage(stage_id).await;
                    tracing::debug!(worker_index = self.worker_index, stage_id, ack = %ack, "Sending ack");
                    protocol::write_message(&mut self.stream, &ack).await?;
                }
            }
        }
    }
}

async fn read_non_negative(stream: &mut TcpStream, what: &str) -> Result<usize> {
    let value = protocol::read_int(stream).await?;
    usize::try_from(value).map_err(|_| {
        Error::Protocol(ProtocolError::Handshake(format!(
            "master sent negative {what} {value}"
        )))
    })
}

impl std::fmt::Debug for RemoteWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteWorker")
            .field("peer", &self.stream.peer_addr().ok())
            .field("worker_index", &self.worker_index)
            .field("fleet_size", &self.fleet_size)
            .finish()
    }
}
