use crate::identity::{IdentHash, PrivateIdentity};
use crate::netdb::NetdbHandle;
use crate::netdb::store::NetdbStore;
use crate::netdb::types::{Lease, LeaseSet};
use crate::streaming::packet::Packet;
use crate::streaming::stream::Stream;
use crate::streaming::{EngineCommand, ReadOutcome, ReadResult, StreamCommand, StreamError, StreamHandle};
use crate::tunnel::{RoutingSessionFactory, TunnelPool};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Destination state shared by its streams: keys, tunnel pool, the lazily
/// built local lease set and the seams into netdb and garlic. Split from
/// the stream map so a stream can borrow it mutably while being driven.
pub(crate) struct DestinationShared {
    pub keys: Arc<PrivateIdentity>,
    pub hash: IdentHash,
    pub is_public: bool,
    pub netdb_store: Arc<NetdbStore>,
    pub netdb: Option<NetdbHandle>,
    pub pool: Arc<dyn TunnelPool>,
    pub garlic: Arc<dyn RoutingSessionFactory>,
    pub engine_tx: mpsc::UnboundedSender<EngineCommand>,
    lease_set: Option<LeaseSet>,
}

impl DestinationShared {
    /// The local lease set, materialized from the tunnel pool on first
    /// access and after `rebuild_lease_set`.
    pub fn lease_set(&mut self) -> Option<&LeaseSet> {
        if self.lease_set.is_none() {
            self.lease_set = Some(self.build_from_pool());
        }
        self.lease_set.as_ref()
    }

    pub fn rebuild_lease_set(&mut self) {
        self.lease_set = Some(self.build_from_pool());
    }

    fn build_from_pool(&self) -> LeaseSet {
        let leases: Vec<Lease> = self
            .pool
            .inbound_tunnels()
            .into_iter()
            .map(|t| Lease {
                tunnel_gateway: t.gateway,
                tunnel_id: t.tunnel_id,
                end_date_ms: t.expires_ms,
            })
            .collect();
        LeaseSet::build(*self.keys.identity(), leases)
    }
}

/// One local endpoint: its identity, tunnel pool and the streams bound to
/// it. Owned and driven exclusively by the streaming engine task.
pub struct StreamingDestination {
    pub(crate) shared: DestinationShared,
    streams: HashMap<u32, Stream>,
    acceptor: Option<mpsc::UnboundedSender<StreamHandle>>,
}

impl StreamingDestination {
    pub(crate) fn new(
        keys: PrivateIdentity,
        is_public: bool,
        netdb_store: Arc<NetdbStore>,
        netdb: Option<NetdbHandle>,
        pool: Arc<dyn TunnelPool>,
        garlic: Arc<dyn RoutingSessionFactory>,
        engine_tx: mpsc::UnboundedSender<EngineCommand>,
    ) -> Self {
        let hash = keys.hash();
        tracing::info!(destination = %hash, is_public, "local destination created");
        Self {
            shared: DestinationShared {
                keys: Arc::new(keys),
                hash,
                is_public,
                netdb_store,
                netdb,
                pool,
                garlic,
                engine_tx,
                lease_set: None,
            },
            streams: HashMap::new(),
            acceptor: None,
        }
    }

    pub fn hash(&self) -> IdentHash {
        self.shared.hash
    }

    pub fn set_acceptor(&mut self, acceptor: mpsc::UnboundedSender<StreamHandle>) {
        self.acceptor = Some(acceptor);
    }

    /// Route an inbound packet: a non-zero send stream id addresses an
    /// existing stream, zero announces a new inbound one.
    pub fn handle_next_packet(&mut self, p: Box<Packet>) {
        let send_stream_id = p.send_stream_id();
        if send_stream_id != 0 {
            match self.streams.get_mut(&send_stream_id) {
                Some(stream) => stream
                    .handle_command(&mut self.shared, StreamCommand::HandleIncoming { packet: p }),
                None => {
                    tracing::debug!(stream = send_stream_id, "packet for unknown stream dropped")
                }
            }
            return;
        }

        let mut stream = Stream::new_incoming();
        let stream_id = stream.recv_stream_id();
        stream.handle_next_packet(&mut self.shared, p);
        match &self.acceptor {
            Some(acceptor) => {
                let handle = StreamHandle {
                    tx: self.shared.engine_tx.clone(),
                    dest: self.shared.hash,
                    stream_id,
                };
                if acceptor.send(handle).is_ok() {
                    self.streams.insert(stream_id, stream);
                } else {
                    tracing::debug!("acceptor receiver dropped, inbound stream discarded");
                }
            }
            None => {
                tracing::debug!("no acceptor registered, inbound stream discarded");
            }
        }
    }

    /// Open a stream toward `remote`; the first `send` on it emits the SYN.
    pub fn create_outgoing_stream(&mut self, remote: IdentHash) -> u32 {
        let stream = Stream::new_outgoing(&mut self.shared, remote);
        let stream_id = stream.recv_stream_id();
        self.streams.insert(stream_id, stream);
        tracing::debug!(stream = stream_id, remote = %remote, "outgoing stream created");
        stream_id
    }

    pub fn stream_command(&mut self, stream_id: u32, cmd: StreamCommand) {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            // Answer what can be answered for a stream that no longer
            // exists; timers for it are simply stale.
            match cmd {
                StreamCommand::Status { reply } => {
                    let _ = reply.send(None);
                }
                StreamCommand::SendBuffer { reply, .. } => {
                    let _ = reply.send(Err(StreamError::Closed));
                }
                StreamCommand::Receive { reply, .. } => {
                    let _ = reply.send(ReadResult {
                        outcome: ReadOutcome::Closed,
                        data: Vec::new(),
                    });
                }
                StreamCommand::Close { reply } => {
                    if let Some(reply) = reply {
                        let _ = reply.send(());
                    }
                }
                _ => {}
            }
            return;
        };
        stream.handle_command(&mut self.shared, cmd);
    }

    /// Drop a stream and everything it owns.
    pub fn delete_stream(&mut self, stream_id: u32) {
        self.streams.remove(&stream_id);
    }

    /// Our tunnel pool changed: rebuild the lease set, make every stream
    /// attach it on its next send, and republish when public.
    pub fn on_leaseset_updated(&mut self) {
        self.shared.rebuild_lease_set();
        for stream in self.streams.values_mut() {
            stream.set_leaseset_updated();
        }
        if self.shared.is_public
            && let Some(netdb) = &self.shared.netdb
            && let Some(ls) = self.shared.lease_set.as_ref()
        {
            netdb.publish_leaseset(self.shared.hash, ls.buffer().to_vec());
        }
    }
}
