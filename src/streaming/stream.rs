use crate::identity::{IDENTITY_LEN, Identity, IdentHash, SIGNATURE_LEN};
use crate::logging::warn_throttled;
use crate::streaming::destination::DestinationShared;
use crate::streaming::packet::{
    FLAG_CLOSE, FLAG_DELAY_REQUESTED, FLAG_FROM_INCLUDED, FLAG_MAX_PACKET_SIZE_INCLUDED,
    FLAG_NO_ACK, FLAG_SIGNATURE_INCLUDED, FLAG_SYNCHRONIZE, Packet, PacketWriter, STREAMING_MTU,
};
use crate::streaming::{
    EngineCommand, ReadOutcome, ReadResult, StreamCommand, StreamError, create_data_message,
};
use crate::tunnel::TunnelMessageBlock;
use crate::util::now_ms;
use rand::Rng;
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;
use tokio::sync::oneshot;

pub const RESEND_TIMEOUT: Duration = Duration::from_secs(10);
pub const MAX_RESEND_ATTEMPTS: u32 = 5;

/// Snapshot of a stream's state, served over the engine channel for
/// console and test introspection.
#[derive(Debug, Clone)]
pub struct StreamStatus {
    pub recv_stream_id: u32,
    pub send_stream_id: u32,
    pub next_seqn: u32,
    pub last_received_seqn: i64,
    pub is_open: bool,
    pub saved_seqns: Vec<u32>,
    pub sent_seqns: Vec<u32>,
    pub resend_timer_armed: bool,
    pub receive_timer_armed: bool,
    pub current_outbound_tunnel: Option<u32>,
    pub remote_hash: Option<IdentHash>,
}

struct PendingRead {
    max_len: usize,
    reply: oneshot::Sender<ReadResult>,
}

/// Per-connection state machine. All methods run on the streaming engine
/// task; nothing here is touched from another thread.
pub struct Stream {
    recv_stream_id: u32,
    send_stream_id: u32,
    next_seqn: u32,
    /// -1 until the first in-sequence packet arrives.
    last_received_seqn: i64,
    is_open: bool,
    /// Set once the stream has been closed either way; a closed stream
    /// never reopens through `send`.
    closed: bool,
    leaseset_updated: bool,
    remote_identity: Option<Identity>,
    remote_hash: Option<IdentHash>,
    routing_session: Option<std::sync::Arc<dyn crate::tunnel::RoutingSession>>,
    current_remote_lease: Option<crate::netdb::types::Lease>,
    /// Only the tunnel id is held; the tunnel itself is re-fetched from the
    /// pool on every send so a torn-down tunnel is never used.
    current_outbound_tunnel: Option<u32>,
    receive_queue: VecDeque<Box<Packet>>,
    saved_packets: BTreeMap<u32, Box<Packet>>,
    sent_packets: BTreeMap<u32, Box<Packet>>,
    pending_read: Option<PendingRead>,
    receive_epoch: u64,
    receive_timer_armed: bool,
    resend_epoch: u64,
    resend_timer_armed: bool,
}

fn random_stream_id() -> u32 {
    loop {
        let mut b = [0u8; 4];
        if getrandom::getrandom(&mut b).is_err() {
            continue;
        }
        let id = u32::from_be_bytes(b);
        if id != 0 {
            return id;
        }
    }
}

impl Stream {
    fn new() -> Self {
        Self {
            recv_stream_id: random_stream_id(),
            send_stream_id: 0,
            next_seqn: 0,
            last_received_seqn: -1,
            is_open: false,
            closed: false,
            leaseset_updated: true,
            remote_identity: None,
            remote_hash: None,
            routing_session: None,
            current_remote_lease: None,
            current_outbound_tunnel: None,
            receive_queue: VecDeque::new(),
            saved_packets: BTreeMap::new(),
            sent_packets: BTreeMap::new(),
            pending_read: None,
            receive_epoch: 0,
            receive_timer_armed: false,
            resend_epoch: 0,
            resend_timer_armed: false,
        }
    }

    /// Stream we initiate toward a known remote destination.
    pub fn new_outgoing(shared: &mut DestinationShared, remote: IdentHash) -> Self {
        let mut s = Self::new();
        s.remote_hash = Some(remote);
        s.update_current_remote_lease(shared);
        s
    }

    /// Stream created for an unknown peer; its identity arrives in the SYN.
    pub fn new_incoming() -> Self {
        Self::new()
    }

    pub fn recv_stream_id(&self) -> u32 {
        self.recv_stream_id
    }

    pub fn is_open(&self) -> bool {
        self.is_open
    }

    pub fn is_established(&self) -> bool {
        self.send_stream_id != 0
    }

    pub fn remote_hash(&self) -> Option<IdentHash> {
        self.remote_hash
    }

    pub fn set_leaseset_updated(&mut self) {
        self.leaseset_updated = true;
    }

    pub fn status(&self) -> StreamStatus {
        StreamStatus {
            recv_stream_id: self.recv_stream_id,
            send_stream_id: self.send_stream_id,
            next_seqn: self.next_seqn,
            last_received_seqn: self.last_received_seqn,
            is_open: self.is_open,
            saved_seqns: self.saved_packets.keys().copied().collect(),
            sent_seqns: self.sent_packets.keys().copied().collect(),
            resend_timer_armed: self.resend_timer_armed,
            receive_timer_armed: self.receive_timer_armed,
            current_outbound_tunnel: self.current_outbound_tunnel,
            remote_hash: self.remote_hash,
        }
    }

    pub fn handle_command(&mut self, shared: &mut DestinationShared, cmd: StreamCommand) {
        match cmd {
            StreamCommand::HandleIncoming { packet } => self.handle_next_packet(shared, packet),
            StreamCommand::SendBuffer { data, reply } => {
                let result = self.send(shared, &data);
                let _ = reply.send(result);
            }
            StreamCommand::Receive {
                max_len,
                timeout_secs,
                reply,
            } => self.receive(shared, max_len, timeout_secs, reply),
            StreamCommand::Close { reply } => {
                self.close(shared);
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
            }
            StreamCommand::ResendTimerFired { epoch } => self.resend_timer_fired(shared, epoch),
            StreamCommand::ReceiveTimerFired { epoch } => self.receive_timer_fired(epoch),
            StreamCommand::Status { reply } => {
                let _ = reply.send(Some(self.status()));
            }
        }
    }

    // ---- receive path ----

    pub fn handle_next_packet(&mut self, shared: &mut DestinationShared, p: Box<Packet>) {
        if self.send_stream_id == 0 {
            // First contact tells us the peer's receive id.
            self.send_stream_id = p.recv_stream_id();
        }

        if !p.is_no_ack() {
            self.process_ack(&p);
        }

        let seqn = p.seqn();
        let is_syn = p.is_syn();
        if seqn == 0 && !is_syn {
            tracing::trace!(stream = self.recv_stream_id, "plain ack");
            return;
        }

        if is_syn || seqn as i64 == self.last_received_seqn + 1 {
            self.process_packet(shared, p);

            // Gap-filled packets may now be in sequence.
            while let Some((&next, _)) = self.saved_packets.first_key_value() {
                if next as i64 != self.last_received_seqn + 1 {
                    break;
                }
                let saved = self.saved_packets.remove(&next).expect("first key");
                self.process_packet(shared, saved);
            }

            if self.is_open {
                self.send_quick_ack(shared);
            } else if is_syn {
                // Inbound handshake: answer with our own SYN.
                let _ = self.send(shared, &[]);
            }
        } else if seqn as i64 <= self.last_received_seqn {
            // Duplicate; most likely our ack never made it because the
            // outbound path died. Rotate tunnel and lease, re-ack.
            tracing::debug!(stream = self.recv_stream_id, seqn, "duplicate packet");
            self.current_outbound_tunnel = None;
            self.update_current_remote_lease(shared);
            self.send_quick_ack(shared);
        } else {
            tracing::debug!(
                stream = self.recv_stream_id,
                missing_from = self.last_received_seqn + 1,
                received = seqn,
                "out of order, saving"
            );
            self.saved_packets.insert(seqn, p);
        }
    }

    fn process_packet(&mut self, shared: &mut DestinationShared, mut p: Box<Packet>) {
        let seqn = p.seqn();
        let mut flags = p.flags();
        let options = p.option_data().to_vec();
        let option_base = p.option_data_offset();
        let mut cur = 0usize;

        if flags & FLAG_DELAY_REQUESTED != 0 {
            cur += 2;
        }

        if flags & FLAG_FROM_INCLUDED != 0 {
            let Some(identity) = options
                .get(cur..cur + IDENTITY_LEN)
                .and_then(Identity::from_bytes)
            else {
                tracing::warn!(stream = self.recv_stream_id, "malformed FROM option, packet dropped");
                return;
            };
            cur += IDENTITY_LEN;
            if self.remote_hash.is_none() {
                tracing::debug!(
                    stream = self.recv_stream_id,
                    remote = %identity.hash(),
                    "incoming stream identity"
                );
            }
            self.remote_hash = Some(identity.hash());
            self.remote_identity = Some(identity);
        }

        if flags & FLAG_MAX_PACKET_SIZE_INCLUDED != 0 {
            cur += 2;
        }

        if flags & FLAG_SIGNATURE_INCLUDED != 0 {
            if options.len() < cur + SIGNATURE_LEN {
                tracing::warn!(stream = self.recv_stream_id, "malformed signature option, packet dropped");
                return;
            }
            let sig = &options[cur..cur + SIGNATURE_LEN];
            // Verify over the packet with the signature field zeroed.
            let verified = self.remote_identity.as_ref().is_some_and(|identity| {
                let mut unsigned = p.bytes().to_vec();
                unsigned[option_base + cur..option_base + cur + SIGNATURE_LEN].fill(0);
                identity.verify(&unsigned, sig)
            });
            if !verified {
                tracing::warn!(stream = self.recv_stream_id, "signature verification failed");
                self.close(shared);
                flags |= FLAG_CLOSE;
            }
        }

        p.set_offset(p.payload_offset());
        if !p.remaining().is_empty() {
            self.receive_queue.push_back(p);
            self.cancel_receive_timer();
            self.complete_pending_read(ReadOutcome::Ok);
        }
        self.last_received_seqn = seqn as i64;

        if flags & FLAG_CLOSE != 0 {
            tracing::debug!(stream = self.recv_stream_id, "remote close");
            self.send_quick_ack(shared);
            self.is_open = false;
            self.closed = true;
            self.cancel_receive_timer();
            self.complete_pending_read(ReadOutcome::Ok);
            self.cancel_resend_timer();
        }
    }

    fn process_ack(&mut self, p: &Packet) {
        let ack_through = p.ack_through();
        let nacks: Vec<u32> = (0..p.nack_count() as usize).map(|i| p.nack(i)).collect();
        let acked: Vec<u32> = self
            .sent_packets
            .keys()
            .copied()
            .take_while(|seqn| *seqn <= ack_through)
            .filter(|seqn| !nacks.contains(seqn))
            .collect();
        for seqn in acked {
            tracing::trace!(stream = self.recv_stream_id, seqn, "acknowledged");
            self.sent_packets.remove(&seqn);
        }
        if self.sent_packets.is_empty() {
            self.cancel_resend_timer();
        }
    }

    // ---- send path ----

    /// Split `buf` into MTU-sized packets and hand them to the wire. The
    /// first-ever packet of a stream carries the handshake options and a
    /// signature over the whole packet. Returns the bytes written.
    pub fn send(
        &mut self,
        shared: &mut DestinationShared,
        buf: &[u8],
    ) -> Result<usize, StreamError> {
        if self.closed {
            return Err(StreamError::Closed);
        }
        // No ack field is meaningful before we have received anything.
        let is_no_ack = self.last_received_seqn < 0;
        let total = buf.len();
        let mut rest = buf;

        while !self.is_open || !rest.is_empty() {
            let ack_through = if is_no_ack {
                self.last_received_seqn as u32
            } else {
                0
            };
            let seqn = self.next_seqn;
            self.next_seqn += 1;
            let mut w =
                PacketWriter::new(self.send_stream_id, self.recv_stream_id, seqn, ack_through);

            let take;
            if !self.is_open {
                self.is_open = true;
                let mut flags = FLAG_SYNCHRONIZE
                    | FLAG_FROM_INCLUDED
                    | FLAG_SIGNATURE_INCLUDED
                    | FLAG_MAX_PACKET_SIZE_INCLUDED;
                if is_no_ack {
                    flags |= FLAG_NO_ACK;
                }
                w.flags(flags);
                w.option_size((IDENTITY_LEN + 2 + SIGNATURE_LEN) as u16);
                w.bytes(shared.keys.identity().as_bytes());
                w.u16(STREAMING_MTU as u16);
                let sig_at = w.len();
                w.bytes(&[0u8; SIGNATURE_LEN]);
                take = rest.len().min(STREAMING_MTU - w.len());
                w.bytes(&rest[..take]);
                let sig = shared.keys.sign(w.as_slice());
                w.patch(sig_at, &sig);
            } else {
                w.flags(0);
                w.option_size(0);
                take = rest.len().min(STREAMING_MTU - w.len());
                w.bytes(&rest[..take]);
            }
            rest = &rest[take..];

            match w.build() {
                Ok(p) => self.send_packet(shared, p),
                Err(err) => {
                    tracing::warn!(error = %err, "dropping unsendable packet");
                    break;
                }
            }
        }
        Ok(total - rest.len())
    }

    fn send_packet(&mut self, shared: &mut DestinationShared, p: Box<Packet>) {
        self.send_frames(shared, vec![p.bytes().to_vec()]);
        let was_empty = self.sent_packets.is_empty();
        self.sent_packets.insert(p.seqn(), p);
        if was_empty {
            self.schedule_resend(shared);
        }
    }

    /// Wrap raw packet frames into data messages and enqueue them on the
    /// next outbound tunnel toward the current remote lease. Our own lease
    /// set rides along on the first message after a change.
    fn send_frames(&mut self, shared: &mut DestinationShared, frames: Vec<Vec<u8>>) {
        if self.routing_session.is_none() || self.current_remote_lease.is_none() {
            self.update_current_remote_lease(shared);
        }
        let Some(session) = self.routing_session.clone() else {
            if warn_throttled("stream_no_remote_leaseset", Duration::from_secs(10)) {
                tracing::warn!(
                    stream = self.recv_stream_id,
                    "cannot send, missing remote lease set"
                );
            }
            return;
        };

        let mut local_leaseset: Option<Vec<u8>> = None;
        if self.leaseset_updated {
            local_leaseset = shared.lease_set().map(|ls| ls.buffer().to_vec());
            self.leaseset_updated = false;
        }

        let Some(tunnel) = shared.pool.next_outbound_tunnel(self.current_outbound_tunnel) else {
            if warn_throttled("stream_no_outbound_tunnel", Duration::from_secs(10)) {
                tracing::warn!(stream = self.recv_stream_id, "no outbound tunnels in the pool");
            }
            return;
        };
        self.current_outbound_tunnel = Some(tunnel.tunnel_id());

        let ts = now_ms();
        if self.current_remote_lease.is_none_or(|l| l.is_expired(ts)) {
            self.update_current_remote_lease(shared);
        }
        let Some(lease) = self.current_remote_lease.filter(|l| !l.is_expired(ts)) else {
            if warn_throttled("stream_leases_expired", Duration::from_secs(10)) {
                tracing::warn!(stream = self.recv_stream_id, "all remote leases expired");
            }
            return;
        };

        let mut blocks = Vec::with_capacity(frames.len());
        for frame in frames {
            let data_msg = match create_data_message(&frame) {
                Ok(m) => m,
                Err(err) => {
                    tracing::warn!(error = %err, "data message build failed");
                    continue;
                }
            };
            let wrapped = session.wrap_single_message(data_msg, local_leaseset.as_deref());
            local_leaseset = None; // attach only once
            blocks.push(TunnelMessageBlock::to_tunnel(
                lease.tunnel_gateway,
                lease.tunnel_id,
                wrapped,
            ));
        }
        if !blocks.is_empty() {
            tunnel.send_tunnel_data(blocks);
        }
    }

    /// Re-resolve the remote lease set through the netdb and pick a fresh
    /// non-expired lease uniformly at random.
    fn update_current_remote_lease(&mut self, shared: &mut DestinationShared) {
        let Some(remote) = self.remote_hash else {
            self.current_remote_lease = None;
            return;
        };
        let Some(leaseset) = shared.netdb_store.find_leaseset(&remote) else {
            tracing::debug!(
                remote = %crate::logging::redact_hash(&remote.to_base64()),
                "lease set not found"
            );
            self.current_remote_lease = None;
            return;
        };
        if self.routing_session.is_none() {
            self.routing_session = Some(shared.garlic.session_for(&remote));
        }
        let leases = leaseset.non_expired_leases(now_ms());
        self.current_remote_lease = if leases.is_empty() {
            None
        } else {
            Some(leases[rand::thread_rng().gen_range(0..leases.len())])
        };
    }

    /// Minimal packet acknowledging everything received so far. Never
    /// tracked for retransmission.
    fn send_quick_ack(&mut self, shared: &mut DestinationShared) {
        let mut w = PacketWriter::new(
            self.send_stream_id,
            self.recv_stream_id,
            0,
            self.last_received_seqn as u32,
        );
        w.flags(0);
        w.option_size(0);
        let frame = w.as_slice().to_vec();
        self.send_frames(shared, vec![frame]);
        tracing::trace!(stream = self.recv_stream_id, "quick ack sent");
    }

    /// Signal our end of the stream with a signed CLOSE. No retry
    /// obligation is kept for it.
    pub fn close(&mut self, shared: &mut DestinationShared) {
        if !self.is_open {
            self.closed = true;
            return;
        }
        self.is_open = false;
        self.closed = true;

        let seqn = self.next_seqn;
        self.next_seqn += 1;
        let mut w = PacketWriter::new(
            self.send_stream_id,
            self.recv_stream_id,
            seqn,
            self.last_received_seqn as u32,
        );
        w.flags(FLAG_CLOSE | FLAG_SIGNATURE_INCLUDED);
        w.option_size(SIGNATURE_LEN as u16);
        let sig_at = w.len();
        w.bytes(&[0u8; SIGNATURE_LEN]);
        let sig = shared.keys.sign(w.as_slice());
        w.patch(sig_at, &sig);
        let frame = w.as_slice().to_vec();
        self.send_frames(shared, vec![frame]);
        tracing::debug!(stream = self.recv_stream_id, "close sent");
    }

    // ---- reads ----

    /// Deliver queued data immediately when available; otherwise arm the
    /// receive timer and answer on data arrival, close or timeout.
    fn receive(
        &mut self,
        shared: &mut DestinationShared,
        max_len: usize,
        timeout_secs: u64,
        reply: oneshot::Sender<ReadResult>,
    ) {
        if !self.receive_queue.is_empty() {
            let data = self.concatenate_packets(max_len);
            if !data.is_empty() {
                let _ = reply.send(ReadResult {
                    outcome: ReadOutcome::Ok,
                    data,
                });
                return;
            }
        }
        if !self.is_open {
            let _ = reply.send(ReadResult {
                outcome: ReadOutcome::Closed,
                data: Vec::new(),
            });
            return;
        }
        // A newer read supersedes a forgotten one.
        self.complete_pending_read(ReadOutcome::Ok);
        self.pending_read = Some(PendingRead { max_len, reply });

        self.receive_epoch += 1;
        self.receive_timer_armed = true;
        let epoch = self.receive_epoch;
        let tx = shared.engine_tx.clone();
        let dest = shared.hash;
        let stream_id = self.recv_stream_id;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(timeout_secs)).await;
            let _ = tx.send(EngineCommand::Stream {
                dest,
                stream_id,
                cmd: StreamCommand::ReceiveTimerFired { epoch },
            });
        });
    }

    fn receive_timer_fired(&mut self, epoch: u64) {
        if !self.receive_timer_armed || epoch != self.receive_epoch {
            return; // cancelled or superseded
        }
        self.receive_timer_armed = false;
        self.complete_pending_read(ReadOutcome::TimedOut);
    }

    fn cancel_receive_timer(&mut self) {
        self.receive_epoch += 1;
        self.receive_timer_armed = false;
    }

    fn complete_pending_read(&mut self, outcome: ReadOutcome) {
        if let Some(read) = self.pending_read.take() {
            let data = self.concatenate_packets(read.max_len);
            let _ = read.reply.send(ReadResult { outcome, data });
        }
    }

    /// Drain up to `max_len` bytes off the receive queue, honoring the
    /// consumption cursor of a partially read packet.
    fn concatenate_packets(&mut self, max_len: usize) -> Vec<u8> {
        let mut out = Vec::new();
        while out.len() < max_len {
            let Some(front) = self.receive_queue.front_mut() else {
                break;
            };
            let take = front.remaining().len().min(max_len - out.len());
            out.extend_from_slice(&front.remaining()[..take]);
            front.advance(take);
            if front.remaining().is_empty() {
                self.receive_queue.pop_front();
            }
        }
        out
    }

    // ---- resend timer ----

    fn schedule_resend(&mut self, shared: &mut DestinationShared) {
        self.resend_epoch += 1;
        self.resend_timer_armed = true;
        let epoch = self.resend_epoch;
        let tx = shared.engine_tx.clone();
        let dest = shared.hash;
        let stream_id = self.recv_stream_id;
        tokio::spawn(async move {
            tokio::time::sleep(RESEND_TIMEOUT).await;
            let _ = tx.send(EngineCommand::Stream {
                dest,
                stream_id,
                cmd: StreamCommand::ResendTimerFired { epoch },
            });
        });
    }

    fn cancel_resend_timer(&mut self) {
        self.resend_epoch += 1;
        self.resend_timer_armed = false;
    }

    fn resend_timer_fired(&mut self, shared: &mut DestinationShared, epoch: u64) {
        if !self.resend_timer_armed || epoch != self.resend_epoch {
            return;
        }
        self.resend_timer_armed = false;

        let mut exhausted = false;
        for p in self.sent_packets.values_mut() {
            p.num_resend_attempts += 1;
            if p.num_resend_attempts >= MAX_RESEND_ATTEMPTS {
                exhausted = true;
            }
        }
        if exhausted {
            tracing::debug!(stream = self.recv_stream_id, "resend attempts exhausted");
            self.close(shared);
            self.cancel_receive_timer();
            self.complete_pending_read(ReadOutcome::Ok);
            return;
        }

        if !self.sent_packets.is_empty() {
            // Assume a dead path: rotate both the tunnel and the lease
            // before retransmitting everything outstanding.
            self.current_outbound_tunnel = None;
            self.update_current_remote_lease(shared);
            let frames: Vec<Vec<u8>> = self
                .sent_packets
                .values()
                .map(|p| p.bytes().to_vec())
                .collect();
            tracing::debug!(
                stream = self.recv_stream_id,
                packets = frames.len(),
                "retransmitting"
            );
            self.send_frames(shared, frames);
        }
        self.schedule_resend(shared);
    }
}
