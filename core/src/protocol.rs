//! Master/worker wire protocol
//!
//! Framing on a single TCP stream per worker:
//!
//! - Handshake: the worker sends its proposed index as a big-endian `i32`
//!   (`-1` for any); the master replies with the assigned index and the
//!   fleet size, both big-endian `i32`
//! - Master messages: a one byte tag, then either an object frame
//!   ([`TAG_OBJECT`]) or a big-endian `i32` stage id ([`TAG_STAGE`]);
//!   [`END_OF_RUN`] ends the current topology
//! - Object frames: a big-endian `u32` length followed by a JSON envelope
//!   `{"version": .., "body": ..}`
//!
//! After a cluster object, the worker answers every stage id, the
//! end-of-run sentinel included, with exactly one [`crate::ack::Ack`]
//! object frame.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::scenario::{Cluster, Configuration, Scenario};

/// Version written into every envelope
pub const PROTOCOL_VERSION: u16 = 1;

/// Stage id closing the current topology
pub const END_OF_RUN: i32 = -1;

/// Proposed index meaning "assign me any free index"
pub const ANY_INDEX: i32 = -1;

/// Tag of a master message carrying a [`ControlObject`]
pub const TAG_OBJECT: u8 = 0;

/// Tag of a master message carrying a stage id
pub const TAG_STAGE: u8 = 1;

/// Wire protocol failures; all of them are fatal for the connection
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Socket failure or unexpected end of stream
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),

    /// Envelope or body does not (de)serialize
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Peer announced a frame above the configured limit
    #[error("frame of {len} bytes exceeds limit of {max} bytes")]
    FrameTooLarge {
        /// Announced length
        len: usize,
        /// Configured limit
        max: usize,
    },

    /// Peer speaks another protocol version
    #[error("unsupported protocol version {0}, expected {PROTOCOL_VERSION}")]
    UnsupportedVersion(u16),

    /// Handshake rejected
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Message valid but not expected at this point
    #[error("unexpected message: {0}")]
    Unexpected(String),
}

/// Control object sent from the master to workers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum ControlObject {
    /// Stage list for the whole benchmark
    Scenario(Scenario),
    /// Configuration for the following topologies
    Configuration(Configuration),
    /// Start of a topology; stage ids follow
    Cluster(Cluster),
    /// Benchmark finished; the worker exits
    Shutdown,
}

impl ControlObject {
    /// Variant name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Scenario(_) => "scenario",
            Self::Configuration(_) => "configuration",
            Self::Cluster(_) => "cluster",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Message read by a worker from the master
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MasterMessage {
    /// Descriptor or control object
    Object(ControlObject),
    /// Stage to run, or [`END_OF_RUN`]
    Stage(i32),
}

#[derive(Serialize)]
struct EnvelopeRef<'a, T> {
    version: u16,
    body: &'a T,
}

#[derive(Deserialize)]
struct Header {
    version: u16,
}

#[derive(Deserialize)]
struct Envelope<T> {
    body: T,
}

/// Encode a value into a versioned envelope
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    Ok(serde_json::to_vec(&EnvelopeRef {
        version: PROTOCOL_VERSION,
        body: value,
    })?)
}

/// Decode a versioned envelope, rejecting other versions
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let header: Header = serde_json::from_slice(bytes)?;
    if header.version != PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion(header.version));
    }
    let envelope: Envelope<T> = serde_json::from_slice(bytes)?;
    Ok(envelope.body)
}

/// Write one length-prefixed frame
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(payload.len()).map_err(|_| ProtocolError::FrameTooLarge {
        len: payload.len(),
        max: u32::MAX as usize,
    })?;
    writer.write_u32(len).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame of at most `max_len` bytes
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> Result<Vec<u8>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32().await? as usize;
    if len > max_len {
        return Err(ProtocolError::FrameTooLarge { len, max: max_len });
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Encode and write one message
pub async fn write_message<W, T>(writer: &mut W, value: &T) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    write_frame(writer, &encode(value)?).await
}

/// Read and decode one message
pub async fn read_message<R, T>(reader: &mut R, max_len: usize) -> Result<T, ProtocolError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    decode(&read_frame(reader, max_len).await?)
}

/// Write a bare big-endian `i32` (handshake values and stage ids)
pub async fn write_int<W>(writer: &mut W, value: i32) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_i32(value).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a bare big-endian `i32`
pub async fn read_int<R>(reader: &mut R) -> Result<i32, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    Ok(reader.read_i32().await?)
}

/// Send a control object to a worker
pub async fn write_object<W>(writer: &mut W, object: &ControlObject) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_u8(TAG_OBJECT).await?;
    write_message(writer, object).await
}

/// Send a stage id to a worker
pub async fn write_stage<W>(writer: &mut W, stage_id: i32) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_u8(TAG_STAGE).await?;
    write_int(writer, stage_id).await
}

/// Read the next message sent by the master
pub async fn read_master_message<R>(
    reader: &mut R,
    max_len: usize,
) -> Result<MasterMessage, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    match reader.read_u8().await? {
        TAG_OBJECT => Ok(MasterMessage::Object(read_message(reader, max_len).await?)),
        TAG_STAGE => Ok(MasterMessage::Stage(read_int(reader).await?)),
        tag => Err(ProtocolError::Unexpected(format!("unknown message tag {tag}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ack::{Ack, AckPayload};
    use crate::metrics::Statistics;
    use crate::request::Operation;
    use crate::scenario::{Group, Properties};
    use std::time::Duration;

    fn round_trip<T: Serialize + DeserializeOwned>(value: &T) -> T {
        decode(&encode(value).unwrap()).unwrap()
    }

    fn thread_statistics(seed: u64) -> Statistics {
        let get = Operation::from_static("BasicOperations.Get");
        let put = Operation::from_static("BasicOperations.Put");
        let mut stats = Statistics::new();
        stats.begin();
        let mut nanos = 1_234_567 + seed;
        for i in 0..500u64 {
            nanos = nanos.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1_442_695_040_888_963_407);
            let duration = Duration::from_nanos(nanos % 987_654_321 + 1);
            let operation = if i % 3 == 0 { &put } else { &get };
            stats.record_operation(operation, duration, i % 17 != 0, chrono::Utc::now());
        }
        stats.end();
        stats
    }

    #[test]
    fn test_envelope_carries_version() {
        let bytes = encode(&ControlObject::Shutdown).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["version"], 1);
        assert_eq!(json["body"]["kind"], "shutdown");
    }

    #[test]
    fn test_ack_round_trips_exactly() {
        let cause = std::io::Error::other("disk full");
        let failed = Ack::error(3, "stage failed", Some(&cause))
            .with_duration(Duration::from_nanos(1_500_000_123));
        assert_eq!(round_trip(&failed), failed);

        let mut merged = thread_statistics(1);
        merged.merge(&thread_statistics(2));
        let stats = Ack::success(1)
            .with_duration(Duration::from_millis(2_750))
            .with_payload(AckPayload::Statistics(vec![
                thread_statistics(7),
                thread_statistics(8),
                merged,
            ]));
        let decoded = round_trip(&stats);
        assert_eq!(decoded, stats);
        assert_eq!(
            decoded.statistics()[2].summary().operations,
            stats.statistics()[2].summary().operations
        );
    }

    #[test]
    fn test_configuration_and_cluster_round_trip() {
        let configuration = Configuration::single("replicated", "inmemory").with_properties(
            "default",
            Properties::new()
                .with("transactional", "true")
                .with("capacity", "${worker.index:0}"),
        );
        assert_eq!(round_trip(&configuration), configuration);

        let cluster = Cluster::with_groups(vec![
            Group {
                name: "servers".into(),
                size: 3,
            },
            Group {
                name: "clients".into(),
                size: 2,
            },
        ]);
        assert_eq!(round_trip(&cluster), cluster);
        assert_eq!(
            round_trip(&ControlObject::Configuration(configuration.clone())),
            ControlObject::Configuration(configuration)
        );
    }

    #[test]
    fn test_decode_rejects_other_version() {
        let bytes = br#"{"version": 2, "body": {"kind": "shutdown"}}"#;
        let result = decode::<ControlObject>(bytes);
        assert!(matches!(result, Err(ProtocolError::UnsupportedVersion(2))));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            decode::<ControlObject>(b"not json"),
            Err(ProtocolError::Codec(_))
        ));
    }

    #[tokio::test]
    async fn test_message_stream_over_duplex() {
        let (mut master, mut worker) = tokio::io::duplex(64 * 1024);
        let scenario = Scenario::default().with_stage("sleep", Properties::new().with("duration", "1ms"));

        write_object(&mut master, &ControlObject::Scenario(scenario.clone()))
            .await
            .unwrap();
        write_stage(&mut master, 0).await.unwrap();
        write_stage(&mut master, END_OF_RUN).await.unwrap();

        assert_eq!(
            read_master_message(&mut worker, 1024).await.unwrap(),
            MasterMessage::Object(ControlObject::Scenario(scenario))
        );
        assert_eq!(
            read_master_message(&mut worker, 1024).await.unwrap(),
            MasterMessage::Stage(0)
        );
        assert_eq!(
            read_master_message(&mut worker, 1024).await.unwrap(),
            MasterMessage::Stage(END_OF_RUN)
        );

        write_message(&mut worker, &Ack::success(0)).await.unwrap();
        let ack: Ack = read_message(&mut master, 1024).await.unwrap();
        assert_eq!(ack.worker_index, 0);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, &[b'x'; 100]).await.unwrap();
        let result = read_frame(&mut b, 10).await;
        assert!(matches!(
            result,
            Err(ProtocolError::FrameTooLarge { len: 100, max: 10 })
        ));
    }

    #[tokio::test]
    async fn test_unknown_tag_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_u8(7).await.unwrap();
        assert!(matches!(
            read_master_message(&mut b, 64).await,
            Err(ProtocolError::Unexpected(_))
        ));
    }

    #[tokio::test]
    async fn test_closed_stream_is_io_error() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        assert!(matches!(read_int(&mut b).await, Err(ProtocolError::Io(_))));
    }
}
