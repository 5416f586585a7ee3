pub mod destination;
pub mod packet;
pub mod stream;

use crate::gzip::{deflate_gzip, inflate_gzip};
use crate::i2np::Reader;
use crate::identity::{IdentHash, PrivateIdentity};
use crate::netdb::NetdbHandle;
use crate::netdb::store::NetdbStore;
use crate::streaming::destination::StreamingDestination;
use crate::streaming::packet::{MAX_PACKET_SIZE, Packet};
use crate::streaming::stream::StreamStatus;
use crate::tunnel::{RoutingSessionFactory, TunnelPool};
use anyhow::{Result, bail};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Protocol byte carried in data messages for stream traffic.
pub const PROTOCOL_STREAMING: u8 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamError {
    /// The stream is closed; no further sends are possible.
    Closed,
    /// The streaming engine is gone.
    Engine,
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "stream closed"),
            Self::Engine => write!(f, "streaming engine unavailable"),
        }
    }
}

impl std::error::Error for StreamError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    Ok,
    TimedOut,
    Closed,
}

/// Result of a read: whatever was drained off the receive queue by the
/// time the read completed, plus how it completed.
#[derive(Debug)]
pub struct ReadResult {
    pub outcome: ReadOutcome,
    pub data: Vec<u8>,
}

/// Commands processed serially per stream on the engine task.
#[derive(Debug)]
pub enum StreamCommand {
    HandleIncoming {
        packet: Box<Packet>,
    },
    SendBuffer {
        data: Vec<u8>,
        reply: oneshot::Sender<Result<usize, StreamError>>,
    },
    Receive {
        max_len: usize,
        timeout_secs: u64,
        reply: oneshot::Sender<ReadResult>,
    },
    Close {
        reply: Option<oneshot::Sender<()>>,
    },
    ResendTimerFired {
        epoch: u64,
    },
    ReceiveTimerFired {
        epoch: u64,
    },
    Status {
        reply: oneshot::Sender<Option<StreamStatus>>,
    },
}

#[derive(Debug)]
pub enum EngineCommand {
    /// Payload of an I2NP Data message addressed to a local destination.
    DataMessage {
        dest: IdentHash,
        payload: Vec<u8>,
    },
    RegisterDestination {
        keys: PrivateIdentity,
        is_public: bool,
        pool: Arc<dyn TunnelPool>,
        reply: oneshot::Sender<DestinationHandle>,
    },
    CreateStream {
        dest: IdentHash,
        remote: IdentHash,
        reply: oneshot::Sender<Result<StreamHandle, StreamError>>,
    },
    SetAcceptor {
        dest: IdentHash,
        acceptor: mpsc::UnboundedSender<StreamHandle>,
    },
    LeaseSetUpdated {
        dest: IdentHash,
    },
    DeleteStream {
        dest: IdentHash,
        stream_id: u32,
    },
    Stream {
        dest: IdentHash,
        stream_id: u32,
        cmd: StreamCommand,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable entry point into the streaming engine.
#[derive(Clone)]
pub struct StreamingHandle {
    tx: mpsc::UnboundedSender<EngineCommand>,
}

impl StreamingHandle {
    /// Transport callback for inbound Data messages.
    pub fn post_data_message(&self, dest: IdentHash, payload: Vec<u8>) {
        let _ = self.tx.send(EngineCommand::DataMessage { dest, payload });
    }

    pub async fn register_destination(
        &self,
        keys: PrivateIdentity,
        is_public: bool,
        pool: Arc<dyn TunnelPool>,
    ) -> Result<DestinationHandle, StreamError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineCommand::RegisterDestination {
                keys,
                is_public,
                pool,
                reply,
            })
            .map_err(|_| StreamError::Engine)?;
        rx.await.map_err(|_| StreamError::Engine)
    }

    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(EngineCommand::Shutdown { reply }).is_ok() {
            let _ = rx.await;
        }
    }
}

/// One registered local destination, as seen from outside the engine.
#[derive(Clone, Debug)]
pub struct DestinationHandle {
    tx: mpsc::UnboundedSender<EngineCommand>,
    hash: IdentHash,
}

impl DestinationHandle {
    pub fn hash(&self) -> IdentHash {
        self.hash
    }

    /// Open a stream toward a remote destination known to the netdb.
    pub async fn create_stream(&self, remote: IdentHash) -> Result<StreamHandle, StreamError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineCommand::CreateStream {
                dest: self.hash,
                remote,
                reply,
            })
            .map_err(|_| StreamError::Engine)?;
        rx.await.map_err(|_| StreamError::Engine)?
    }

    /// Register to accept inbound streams; handles arrive on the returned
    /// channel.
    pub fn accept(&self) -> mpsc::UnboundedReceiver<StreamHandle> {
        let (acceptor, rx) = mpsc::unbounded_channel();
        let _ = self.tx.send(EngineCommand::SetAcceptor {
            dest: self.hash,
            acceptor,
        });
        rx
    }

    /// Signal that the tunnel pool changed and the lease set must be
    /// rebuilt (and republished when public).
    pub fn leaseset_updated(&self) {
        let _ = self
            .tx
            .send(EngineCommand::LeaseSetUpdated { dest: self.hash });
    }
}

/// One stream, as seen from outside the engine. All operations are posted
/// onto the engine task; stream state is never touched directly.
#[derive(Clone, Debug)]
pub struct StreamHandle {
    pub(crate) tx: mpsc::UnboundedSender<EngineCommand>,
    pub(crate) dest: IdentHash,
    pub(crate) stream_id: u32,
}

impl StreamHandle {
    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    pub async fn send(&self, data: &[u8]) -> Result<usize, StreamError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineCommand::Stream {
                dest: self.dest,
                stream_id: self.stream_id,
                cmd: StreamCommand::SendBuffer {
                    data: data.to_vec(),
                    reply,
                },
            })
            .map_err(|_| StreamError::Engine)?;
        rx.await.map_err(|_| StreamError::Engine)?
    }

    /// Read up to `max_len` bytes; waits at most `timeout_secs` when
    /// nothing is queued.
    pub async fn receive(&self, max_len: usize, timeout_secs: u64) -> ReadResult {
        let (reply, rx) = oneshot::channel();
        let sent = self.tx.send(EngineCommand::Stream {
            dest: self.dest,
            stream_id: self.stream_id,
            cmd: StreamCommand::Receive {
                max_len,
                timeout_secs,
                reply,
            },
        });
        if sent.is_err() {
            return ReadResult {
                outcome: ReadOutcome::Closed,
                data: Vec::new(),
            };
        }
        rx.await.unwrap_or(ReadResult {
            outcome: ReadOutcome::Closed,
            data: Vec::new(),
        })
    }

    pub async fn close(&self) {
        let (reply, rx) = oneshot::channel();
        let sent = self.tx.send(EngineCommand::Stream {
            dest: self.dest,
            stream_id: self.stream_id,
            cmd: StreamCommand::Close { reply: Some(reply) },
        });
        if sent.is_ok() {
            let _ = rx.await;
        }
    }

    /// Remove the stream from its destination once done with it.
    pub fn delete(&self) {
        let _ = self.tx.send(EngineCommand::DeleteStream {
            dest: self.dest,
            stream_id: self.stream_id,
        });
    }

    pub async fn status(&self) -> Option<StreamStatus> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineCommand::Stream {
                dest: self.dest,
                stream_id: self.stream_id,
                cmd: StreamCommand::Status { reply },
            })
            .ok()?;
        rx.await.ok().flatten()
    }
}

/// Process-wide streaming worker: owns every local destination and runs
/// all stream state transitions on one task.
pub struct StreamingEngine {
    destinations: HashMap<IdentHash, StreamingDestination>,
    netdb_store: Arc<NetdbStore>,
    netdb: Option<NetdbHandle>,
    garlic: Arc<dyn RoutingSessionFactory>,
    tx: mpsc::UnboundedSender<EngineCommand>,
    cmd_rx: mpsc::UnboundedReceiver<EngineCommand>,
}

impl StreamingEngine {
    pub fn new(
        netdb_store: Arc<NetdbStore>,
        netdb: Option<NetdbHandle>,
        garlic: Arc<dyn RoutingSessionFactory>,
    ) -> (Self, StreamingHandle) {
        let (tx, cmd_rx) = mpsc::unbounded_channel();
        let handle = StreamingHandle { tx: tx.clone() };
        (
            Self {
                destinations: HashMap::new(),
                netdb_store,
                netdb,
                garlic,
                tx,
                cmd_rx,
            },
            handle,
        )
    }

    pub async fn run(mut self) {
        tracing::info!("streaming engine started");
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                EngineCommand::DataMessage { dest, payload } => {
                    self.handle_data_message(dest, &payload);
                }
                EngineCommand::RegisterDestination {
                    keys,
                    is_public,
                    pool,
                    reply,
                } => {
                    let destination = StreamingDestination::new(
                        keys,
                        is_public,
                        self.netdb_store.clone(),
                        self.netdb.clone(),
                        pool,
                        self.garlic.clone(),
                        self.tx.clone(),
                    );
                    let hash = destination.hash();
                    self.destinations.insert(hash, destination);
                    let _ = reply.send(DestinationHandle {
                        tx: self.tx.clone(),
                        hash,
                    });
                }
                EngineCommand::CreateStream {
                    dest,
                    remote,
                    reply,
                } => match self.destinations.get_mut(&dest) {
                    Some(destination) => {
                        let stream_id = destination.create_outgoing_stream(remote);
                        let _ = reply.send(Ok(StreamHandle {
                            tx: self.tx.clone(),
                            dest,
                            stream_id,
                        }));
                    }
                    None => {
                        let _ = reply.send(Err(StreamError::Engine));
                    }
                },
                EngineCommand::SetAcceptor { dest, acceptor } => {
                    if let Some(destination) = self.destinations.get_mut(&dest) {
                        destination.set_acceptor(acceptor);
                    }
                }
                EngineCommand::LeaseSetUpdated { dest } => {
                    if let Some(destination) = self.destinations.get_mut(&dest) {
                        destination.on_leaseset_updated();
                    }
                }
                EngineCommand::DeleteStream { dest, stream_id } => {
                    if let Some(destination) = self.destinations.get_mut(&dest) {
                        destination.delete_stream(stream_id);
                    }
                }
                EngineCommand::Stream {
                    dest,
                    stream_id,
                    cmd,
                } => match self.destinations.get_mut(&dest) {
                    Some(destination) => destination.stream_command(stream_id, cmd),
                    None => tracing::debug!(destination = %dest, "command for unknown destination"),
                },
                EngineCommand::Shutdown { reply } => {
                    let _ = reply.send(());
                    break;
                }
            }
        }
        tracing::info!("streaming engine stopped");
    }

    fn handle_data_message(&mut self, dest: IdentHash, payload: &[u8]) {
        let packet_bytes = match unwrap_data_message(payload) {
            Ok(b) => b,
            Err(err) => {
                tracing::warn!(error = %err, "bad data message dropped");
                return;
            }
        };
        let packet = match Packet::from_bytes(&packet_bytes) {
            Ok(p) => p,
            Err(err) => {
                tracing::warn!(error = %err, "bad stream packet dropped");
                return;
            }
        };
        match self.destinations.get_mut(&dest) {
            Some(destination) => destination.handle_next_packet(packet),
            None => tracing::debug!(destination = %dest, "data message for unknown destination"),
        }
    }
}

/// Frame one stream packet as an I2NP Data payload:
/// `len:be32 | src_port:be16 | dst_port:be16 | proto:u8 | gzip(packet)`.
/// `len` counts everything after itself. Ports stay zero until the port
/// extension is wired up.
pub fn create_data_message(packet: &[u8]) -> Result<Vec<u8>> {
    let zipped = deflate_gzip(packet)?;
    let mut out = Vec::with_capacity(9 + zipped.len());
    out.extend_from_slice(&((5 + zipped.len()) as u32).to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
    out.push(PROTOCOL_STREAMING);
    out.extend_from_slice(&zipped);
    Ok(out)
}

/// Inverse of `create_data_message`; rejects foreign protocols and packets
/// that inflate past the packet size cap.
pub fn unwrap_data_message(payload: &[u8]) -> Result<Vec<u8>> {
    let mut r = Reader::new(payload);
    let len = r.read_u32_be()? as usize;
    if len < 5 {
        bail!("data message length {len} too short");
    }
    let _src_port = r.read_u16_be()?;
    let _dst_port = r.read_u16_be()?;
    let proto = r.read_u8()?;
    if proto != PROTOCOL_STREAMING {
        bail!("data message protocol {proto} is not supported");
    }
    let zipped = r.read_bytes(len - 5)?;
    inflate_gzip(zipped, MAX_PACKET_SIZE)
}
