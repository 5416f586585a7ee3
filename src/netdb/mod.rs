pub mod persist;
pub mod requests;
pub mod routing_key;
pub mod store;
pub mod types;

use crate::config::NetdbConfig;
use crate::gzip::{deflate_gzip, inflate_gzip};
use crate::i2np::{
    self, I2NP_DATABASE_LOOKUP, I2NP_DATABASE_SEARCH_REPLY, I2NP_DATABASE_STORE, Message,
    StoreContent,
};
use crate::identity::{IdentHash, Identity, PrivateIdentity};
use crate::queue::{MessageQueue, MessageQueueSender};
use crate::tunnel::{RoutingSessionFactory, Transport, TunnelMessageBlock, TunnelPool};
use crate::util::{now_ms, now_secs};
use anyhow::Result;
use requests::{LookupReply, PendingLookups};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use store::NetdbStore;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior, interval, interval_at};
use types::{ROUTER_FLAG_FLOODFILL, RouterRecord, build_router_record};

/// Our own router record is re-stamped when older than this.
pub const ROUTER_INFO_UPDATE_INTERVAL_SECS: u64 = 1800;

const SAVE_INTERVAL: Duration = Duration::from_secs(60);
/// How long the engine blocks on its message queue before treating the
/// pass as idle and managing pending lookups.
const QUEUE_IDLE_TIMEOUT: Duration = Duration::from_secs(15);
/// Candidate records older than this are re-requested when a search reply
/// offers them.
const STALE_RECORD_MS: u64 = 3600 * 1000;
/// Explore rounds are stretched to this interval past 2500 known routers.
const EXPLORE_BACKOFF: Duration = Duration::from_secs(90);
const EXPLORE_ROUTER_THRESHOLD: usize = 2500;

/// The local router's identity and its published descriptor.
pub struct LocalRouter {
    keys: PrivateIdentity,
    is_floodfill: bool,
    record: Mutex<(Vec<u8>, u64)>,
}

impl LocalRouter {
    pub fn new(keys: PrivateIdentity, is_floodfill: bool) -> Self {
        let flags = if is_floodfill { ROUTER_FLAG_FLOODFILL } else { 0 };
        let built = now_ms();
        let record = build_router_record(keys.identity(), built, flags);
        Self {
            keys,
            is_floodfill,
            record: Mutex::new((record, built)),
        }
    }

    pub fn hash(&self) -> IdentHash {
        self.keys.hash()
    }

    pub fn identity(&self) -> &Identity {
        self.keys.identity()
    }

    /// Current record bytes, re-stamped when stale.
    pub fn record_bytes(&self, now_ms: u64) -> Vec<u8> {
        let mut slot = self.record.lock().expect("local record");
        if now_ms >= slot.1 + ROUTER_INFO_UPDATE_INTERVAL_SECS * 1000 {
            let flags = if self.is_floodfill {
                ROUTER_FLAG_FLOODFILL
            } else {
                0
            };
            *slot = (build_router_record(self.keys.identity(), now_ms, flags), now_ms);
        }
        slot.0.clone()
    }
}

#[derive(Debug)]
pub enum NetdbCommand {
    RequestDestination {
        destination: IdentHash,
        reply: Option<LookupReply>,
    },
    PublishLeaseSet {
        leaseset: Vec<u8>,
        key: IdentHash,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable entry point into the netdb worker plus shared read access to
/// the store.
#[derive(Clone)]
pub struct NetdbHandle {
    tx: mpsc::UnboundedSender<NetdbCommand>,
    queue: MessageQueueSender<Message>,
    store: Arc<NetdbStore>,
}

impl NetdbHandle {
    pub fn store(&self) -> &Arc<NetdbStore> {
        &self.store
    }

    /// Transport callback: hand one inbound message to the worker.
    pub fn post_message(&self, msg: Message) {
        self.queue.put(msg);
    }

    /// Look up a router record, resolving when the lookup succeeds, fails
    /// or expires.
    pub async fn request_destination(&self, destination: IdentHash) -> Option<Arc<RouterRecord>> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(NetdbCommand::RequestDestination {
                destination,
                reply: Some(tx),
            })
            .ok()?;
        rx.await.ok().flatten()
    }

    /// Publish a local destination's lease set: stored here, pushed to the
    /// closest floodfill.
    pub fn publish_leaseset(&self, key: IdentHash, leaseset: Vec<u8>) {
        let _ = self.tx.send(NetdbCommand::PublishLeaseSet { leaseset, key });
    }

    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(NetdbCommand::Shutdown { reply: tx }).is_ok() {
            // A worker parked on its queue gets kicked awake so it can see
            // the shutdown command.
            self.queue.wake_up();
            let _ = rx.await;
        }
    }
}

pub struct NetdbEngine {
    store: Arc<NetdbStore>,
    pending: PendingLookups,
    local: Arc<LocalRouter>,
    transport: Arc<dyn Transport>,
    exploratory_pool: Arc<dyn TunnelPool>,
    garlic: Arc<dyn RoutingSessionFactory>,
    netdb_dir: PathBuf,
    cfg: NetdbConfig,
    queue: MessageQueue<Message>,
    cmd_rx: mpsc::UnboundedReceiver<NetdbCommand>,
    /// Messages of types the netdb does not own are forwarded here.
    i2np_sink: Option<mpsc::UnboundedSender<Message>>,
}

impl NetdbEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<NetdbStore>,
        local: Arc<LocalRouter>,
        transport: Arc<dyn Transport>,
        exploratory_pool: Arc<dyn TunnelPool>,
        garlic: Arc<dyn RoutingSessionFactory>,
        netdb_dir: PathBuf,
        cfg: NetdbConfig,
        i2np_sink: Option<mpsc::UnboundedSender<Message>>,
    ) -> (Self, NetdbHandle) {
        let (tx, cmd_rx) = mpsc::unbounded_channel();
        let (queue_tx, queue) = MessageQueue::channel();
        let handle = NetdbHandle {
            tx,
            queue: queue_tx,
            store: store.clone(),
        };
        (
            Self {
                store,
                pending: PendingLookups::new(),
                local,
                transport,
                exploratory_pool,
                garlic,
                netdb_dir,
                cfg,
                queue,
                cmd_rx,
                i2np_sink,
            },
            handle,
        )
    }

    /// Worker loop. Loads persisted records, then serves messages and the
    /// periodic maintenance schedule until shutdown.
    pub async fn run(mut self) {
        if let Err(err) = persist::load(&self.netdb_dir, &self.store, now_ms()).await {
            tracing::warn!(error = %err, "netdb load failed");
        }
        tracing::info!(
            routers = self.store.router_count(),
            floodfills = self.store.floodfill_count(),
            "netdb started"
        );

        // First save fires one minute in; publish and explore run right
        // away so a fresh router announces itself and fills its view.
        let mut save_tick = interval_at(Instant::now() + SAVE_INTERVAL, SAVE_INTERVAL);
        let mut publish_tick = interval(Duration::from_secs(self.cfg.publish_interval_secs.max(60)));
        let mut explore_tick =
            interval(Duration::from_secs(self.cfg.exploratory_interval_secs.max(1)));
        for tick in [&mut save_tick, &mut publish_tick, &mut explore_tick] {
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        }

        let mut last_explore: Option<Instant> = None;

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        None => break,
                        Some(NetdbCommand::Shutdown { reply }) => {
                            if let Err(err) =
                                persist::save_updated(&self.netdb_dir, &self.store, now_ms()).await
                            {
                                tracing::warn!(error = %err, "final netdb save failed");
                            }
                            let _ = reply.send(());
                            break;
                        }
                        Some(cmd) => self.handle_command(cmd).await,
                    }
                }

                msg = self.queue.get_with_timeout(QUEUE_IDLE_TIMEOUT) => {
                    match msg {
                        Some(first) => {
                            self.dispatch_message(first).await;
                            while let Some(next) = self.queue.try_get() {
                                self.dispatch_message(next).await;
                            }
                        }
                        // Nothing inbound for a while: tend to lookups.
                        None => self.manage_requests(),
                    }
                }

                _ = save_tick.tick() => {
                    if let Err(err) =
                        persist::save_updated(&self.netdb_dir, &self.store, now_ms()).await
                    {
                        tracing::warn!(error = %err, "netdb save failed");
                    }
                    self.store.manage_leasesets(now_ms());
                }

                _ = publish_tick.tick() => self.publish(),

                _ = explore_tick.tick() => {
                    let count = self.store.router_count();
                    let backed_off = count >= EXPLORE_ROUTER_THRESHOLD
                        && last_explore.is_some_and(|t| t.elapsed() < EXPLORE_BACKOFF);
                    if !backed_off {
                        let num = (800 / count.max(1)).clamp(1, 9);
                        self.explore(num);
                        last_explore = Some(Instant::now());
                    }
                }
            }
        }
        tracing::info!("netdb stopped");
    }

    async fn handle_command(&mut self, cmd: NetdbCommand) {
        match cmd {
            NetdbCommand::RequestDestination { destination, reply } => {
                self.request_destination(destination, false, reply);
            }
            NetdbCommand::PublishLeaseSet { leaseset, key } => {
                if let Err(err) = self.store.add_leaseset(key, &leaseset, None) {
                    tracing::warn!(error = %err, "rejected own lease set");
                    return;
                }
                let excluded = HashSet::new();
                if let Some(floodfill) = self.store.closest_floodfill(&key, &excluded) {
                    let msg = Message::direct(
                        I2NP_DATABASE_STORE,
                        i2np::encode_database_store_leaseset(&key, &leaseset),
                    );
                    self.transport.send_message(&floodfill.hash(), msg);
                }
            }
            NetdbCommand::Shutdown { .. } => unreachable!("handled in run loop"),
        }
    }

    async fn dispatch_message(&mut self, msg: Message) {
        match msg.msg_type {
            I2NP_DATABASE_STORE => {
                if let Err(err) = self.handle_store(&msg) {
                    tracing::warn!(error = %err, "bad DatabaseStore dropped");
                }
            }
            I2NP_DATABASE_SEARCH_REPLY => {
                if let Err(err) = self.handle_search_reply(&msg) {
                    tracing::warn!(error = %err, "bad DatabaseSearchReply dropped");
                }
            }
            I2NP_DATABASE_LOOKUP => {
                if let Err(err) = self.handle_lookup(&msg).await {
                    tracing::warn!(error = %err, "bad DatabaseLookup dropped");
                }
            }
            other => {
                tracing::debug!(msg_type = other, "forwarding non-netdb message");
                if let Some(sink) = &self.i2np_sink {
                    let _ = sink.send(msg);
                }
            }
        }
    }

    fn handle_store(&mut self, msg: &Message) -> Result<()> {
        let store_msg = i2np::decode_database_store(&msg.payload)?;
        match store_msg.content {
            StoreContent::LeaseSet { raw } => {
                self.store
                    .add_leaseset(store_msg.key, &raw, msg.from_tunnel)?;
            }
            StoreContent::Router { deflated } => {
                let buf = inflate_gzip(&deflated, i2np::MAX_ROUTER_RECORD_LEN)?;
                let outcome = self.store.add_router(&buf)?;
                self.pending
                    .complete_success(&store_msg.key, outcome.record);
            }
        }
        Ok(())
    }

    fn handle_search_reply(&mut self, msg: &Message) -> Result<()> {
        let reply = i2np::decode_database_search_reply(&msg.payload)?;

        if let Some(lookup) = self.pending.get_mut(&reply.key) {
            let worth_retrying =
                !lookup.is_exploratory && !reply.peers.is_empty() && !lookup.exhausted();
            let retried = worth_retrying && self.send_next_lookup(&reply.key, true);
            if !retried {
                self.pending.fail(&reply.key);
            }
        } else {
            tracing::debug!(key = %reply.key, "search reply for unknown lookup");
        }

        // Chase candidates we have never seen, or whose record has gone
        // stale.
        let now = now_ms();
        for peer in &reply.peers {
            let stale = match self.store.find_router(peer) {
                None => true,
                Some(r) => now > r.published_ms() + STALE_RECORD_MS,
            };
            if stale && !self.pending.contains(peer) {
                self.request_destination(*peer, true, None);
            }
        }
        Ok(())
    }

    async fn handle_lookup(&mut self, msg: &Message) -> Result<()> {
        let lookup = i2np::decode_database_lookup(&msg.payload)?;
        tracing::debug!(target = %lookup.target, from = %lookup.from, "lookup received");

        let reply = if let Some(router) = self.store.find_router(&lookup.target) {
            match persist::load_record_buffer(&self.netdb_dir, &router).await {
                Ok(buf) => Some(Message::direct(
                    I2NP_DATABASE_STORE,
                    i2np::encode_database_store_router(&lookup.target, &deflate_gzip(&buf)?),
                )),
                Err(err) => {
                    tracing::warn!(error = %err, "router record buffer unavailable");
                    None
                }
            }
        } else {
            None
        };

        let reply = match reply {
            Some(r) => r,
            None => {
                if let Some(ls) = self.store.find_leaseset(&lookup.target) {
                    Message::direct(
                        I2NP_DATABASE_STORE,
                        i2np::encode_database_store_leaseset(&lookup.target, ls.buffer()),
                    )
                } else {
                    // An all-zero entry marks an exploratory lookup, not a
                    // real peer.
                    let excluded: HashSet<IdentHash> = lookup
                        .excluded
                        .iter()
                        .copied()
                        .filter(|h| !h.is_zero())
                        .collect();
                    let closest = self.store.closest_floodfills(&lookup.target, &excluded, 3);
                    let peers: Vec<IdentHash> = closest.iter().map(|r| r.hash()).collect();
                    Message::direct(
                        I2NP_DATABASE_SEARCH_REPLY,
                        i2np::encode_database_search_reply(&lookup.target, &peers),
                    )
                }
            }
        };

        match lookup.reply_tunnel {
            Some(tunnel_id) => {
                let mut wire = Vec::with_capacity(1 + reply.payload.len());
                wire.push(reply.msg_type);
                wire.extend_from_slice(&reply.payload);
                // Encryption is only meaningful on the tunnel path; use the
                // first offered tag.
                if let Some((session_key, tags)) = &lookup.session
                    && let Some(tag) = tags.first()
                {
                    let session = self.garlic.session_from_key(session_key, tag);
                    wire = session.wrap_single_message(wire, None);
                }
                match self.exploratory_pool.next_outbound_tunnel(None) {
                    Some(outbound) => {
                        outbound.send_tunnel_data(vec![TunnelMessageBlock::to_tunnel(
                            lookup.from,
                            tunnel_id,
                            wire,
                        )]);
                    }
                    None => {
                        tracing::debug!("no exploratory outbound tunnel, replying direct");
                        self.transport.send_message(&lookup.from, reply);
                    }
                }
            }
            None => self.transport.send_message(&lookup.from, reply),
        }
        Ok(())
    }

    /// Begin (or join) a lookup for `destination` and fire the first
    /// request directly at the closest floodfill.
    fn request_destination(
        &mut self,
        destination: IdentHash,
        is_exploratory: bool,
        reply: Option<LookupReply>,
    ) {
        if let Some(record) = self.store.find_router(&destination) {
            if let Some(reply) = reply {
                let _ = reply.send(Some(record));
            }
            return;
        }

        let now = now_secs();
        self.pending.create(destination, is_exploratory, now, reply);
        let excluded = self
            .pending
            .get_mut(&destination)
            .map(|l| l.excluded.clone())
            .unwrap_or_default();
        let Some(floodfill) = self.store.closest_floodfill(&destination, &excluded) else {
            tracing::warn!(destination = %destination, "no floodfills for lookup");
            self.pending.fail(&destination);
            return;
        };
        if let Some(lookup) = self.pending.get_mut(&destination) {
            lookup.register_attempt(floodfill.hash(), now);
        }
        let msg = Message::direct(
            I2NP_DATABASE_LOOKUP,
            i2np::encode_database_lookup(&destination, &self.local.hash(), None, &[]),
        );
        self.transport.send_message(&floodfill.hash(), msg);
    }

    /// Send the next tunneled lookup for a pending destination, optionally
    /// introducing ourselves to the floodfill first. Returns false when a
    /// tunnel or floodfill is missing.
    fn send_next_lookup(&mut self, destination: &IdentHash, piggyback_store: bool) -> bool {
        let Some(outbound) = self.exploratory_pool.next_outbound_tunnel(None) else {
            tracing::debug!("no exploratory outbound tunnel");
            return false;
        };
        let Some(inbound) = self.exploratory_pool.next_inbound_tunnel() else {
            tracing::debug!("no exploratory inbound tunnel");
            return false;
        };
        let Some(lookup) = self.pending.get_mut(destination) else {
            return false;
        };
        let Some(floodfill) = self.store.closest_floodfill(destination, &lookup.excluded) else {
            tracing::debug!(destination = %destination, "no more floodfills");
            return false;
        };
        // The request excludes only the floodfills already tried; the new
        // one joins the set for the next retry.
        let excluded: Vec<IdentHash> = lookup.excluded.iter().copied().collect();
        lookup.register_attempt(floodfill.hash(), now_secs());

        let mut blocks = Vec::with_capacity(2);
        if piggyback_store {
            blocks.push(TunnelMessageBlock::to_router(
                floodfill.hash(),
                &self.our_store_message(),
            ));
        }
        let request = Message::direct(
            I2NP_DATABASE_LOOKUP,
            i2np::encode_database_lookup(
                destination,
                &inbound.gateway,
                Some(inbound.tunnel_id),
                &excluded,
            ),
        );
        blocks.push(TunnelMessageBlock::to_router(floodfill.hash(), &request));
        outbound.send_tunnel_data(blocks);
        true
    }

    /// DatabaseStore of our own router record.
    fn our_store_message(&self) -> Message {
        let record = self.local.record_bytes(now_ms());
        let deflated = deflate_gzip(&record).expect("deflate own record");
        Message::direct(
            I2NP_DATABASE_STORE,
            i2np::encode_database_store_router(&self.local.hash(), &deflated),
        )
    }

    /// Push our record to the three closest floodfills.
    fn publish(&mut self) {
        let our_hash = self.local.hash();
        let excluded = HashSet::new();
        let floodfills = self.store.closest_floodfills(&our_hash, &excluded, 3);
        if floodfills.is_empty() {
            return;
        }
        let msg = self.our_store_message();
        for floodfill in floodfills {
            tracing::debug!(floodfill = %floodfill.hash(), "publishing our record");
            self.transport.send_message(&floodfill.hash(), msg.clone());
        }
    }

    /// Exploratory round: look up `num_destinations` random keys, each at
    /// its closest not-yet-used floodfill, introducing ourselves alongside.
    fn explore(&mut self, num_destinations: usize) {
        let outbound = self.exploratory_pool.next_outbound_tunnel(None);
        let inbound = self.exploratory_pool.next_inbound_tunnel();
        let through_tunnels = outbound.is_some() && inbound.is_some();
        let now = now_secs();

        tracing::debug!(num_destinations, through_tunnels, "exploring");
        let mut used: HashSet<IdentHash> = HashSet::new();
        let mut blocks = Vec::new();
        for _ in 0..num_destinations {
            let mut random = [0u8; 32];
            if getrandom::getrandom(&mut random).is_err() {
                break;
            }
            let destination = IdentHash(random);

            self.pending.create(destination, true, now, None);
            let Some(floodfill) = self.store.closest_floodfill(&destination, &HashSet::new())
            else {
                self.pending.fail(&destination);
                continue;
            };
            if used.contains(&floodfill.hash()) {
                self.pending.fail(&destination);
                continue;
            }
            used.insert(floodfill.hash());
            if let Some(lookup) = self.pending.get_mut(&destination) {
                lookup.register_attempt(floodfill.hash(), now);
            }

            if through_tunnels {
                let inbound = inbound.as_ref().expect("inbound tunnel");
                blocks.push(TunnelMessageBlock::to_router(
                    floodfill.hash(),
                    &self.our_store_message(),
                ));
                let request = Message::direct(
                    I2NP_DATABASE_LOOKUP,
                    i2np::encode_database_lookup(
                        &destination,
                        &inbound.gateway,
                        Some(inbound.tunnel_id),
                        &[],
                    ),
                );
                blocks.push(TunnelMessageBlock::to_router(floodfill.hash(), &request));
            } else {
                let request = Message::direct(
                    I2NP_DATABASE_LOOKUP,
                    i2np::encode_database_lookup(&destination, &self.local.hash(), None, &[]),
                );
                self.transport.send_message(&floodfill.hash(), request);
            }
        }
        if let Some(outbound) = outbound
            && !blocks.is_empty()
        {
            outbound.send_tunnel_data(blocks);
        }
    }

    /// Retry silent targeted lookups against the next-closest floodfill;
    /// expire the hopeless ones.
    fn manage_requests(&mut self) {
        let retries = self.pending.manage(now_secs());
        for destination in retries {
            if !self.send_next_lookup(&destination, false) {
                self.pending.fail(&destination);
            }
        }
    }
}
