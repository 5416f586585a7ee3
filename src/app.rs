use crate::config::Config;
use crate::i2np::{I2NP_DATA, Message};
use crate::identity::{IdentHash, load_or_create_keys};
use crate::netdb::store::NetdbStore;
use crate::netdb::{LocalRouter, NetdbEngine};
use crate::streaming::StreamingEngine;
use crate::tunnel::{
    InboundTunnel, OutboundTunnel, RoutingSession, RoutingSessionFactory, Transport, TunnelPool,
};
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;

/// Boot the router core: load identities, wire the netdb and streaming
/// workers together and run until ctrl-c.
///
/// The link layer and the tunnel builder are separate subsystems; until
/// one is attached the placeholder seams below drop outbound traffic and
/// offer no tunnels, which keeps the core runnable (and testable) on its
/// own.
pub async fn run(config: Config) -> Result<()> {
    let data_dir = Path::new(&config.general.data_dir);
    let router_keys = load_or_create_keys(&data_dir.join("router.keys"))
        .await
        .context("loading router identity")?;
    let destination_keys = load_or_create_keys(&config.destination_keys_path())
        .await
        .context("loading destination identity")?;

    let store = Arc::new(NetdbStore::new());
    let local = Arc::new(LocalRouter::new(router_keys, false));
    let transport: Arc<dyn Transport> = Arc::new(UnwiredTransport);
    let pool: Arc<dyn TunnelPool> = Arc::new(UnwiredTunnelPool);
    let garlic: Arc<dyn RoutingSessionFactory> = Arc::new(PlaintextGarlic);

    let (netdb_engine, netdb) = NetdbEngine::new(
        store.clone(),
        local.clone(),
        transport,
        pool.clone(),
        garlic.clone(),
        config.netdb_dir(),
        config.netdb.clone(),
        None,
    );
    let (streaming_engine, streaming) =
        StreamingEngine::new(store.clone(), Some(netdb.clone()), garlic);

    let netdb_worker = tokio::spawn(netdb_engine.run());
    let streaming_worker = tokio::spawn(streaming_engine.run());

    let shared_destination = streaming
        .register_destination(destination_keys, config.streaming.is_public, pool)
        .await
        .map_err(|e| anyhow::anyhow!("registering shared destination: {e}"))?;
    tracing::info!(
        router = %local.hash(),
        destination = %shared_destination.hash(),
        "router core running"
    );

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("shutting down");

    streaming.shutdown().await;
    netdb.shutdown().await;
    let _ = netdb_worker.await;
    let _ = streaming_worker.await;
    Ok(())
}

/// Dispatch one message from the transport layer to the right worker.
/// Data messages go to the streaming engine, everything else to the netdb.
pub fn dispatch_inbound(
    netdb: &crate::netdb::NetdbHandle,
    streaming: &crate::streaming::StreamingHandle,
    local_destination: IdentHash,
    msg: Message,
) {
    if msg.msg_type == I2NP_DATA {
        streaming.post_data_message(local_destination, msg.payload);
    } else {
        netdb.post_message(msg);
    }
}

struct UnwiredTransport;

impl Transport for UnwiredTransport {
    fn send_message(&self, to: &IdentHash, msg: Message) {
        tracing::trace!(to = %to, msg_type = msg.msg_type, "no transport attached, message dropped");
    }
}

struct UnwiredTunnelPool;

impl TunnelPool for UnwiredTunnelPool {
    fn next_outbound_tunnel(&self, _skip: Option<u32>) -> Option<Arc<dyn OutboundTunnel>> {
        None
    }

    fn next_inbound_tunnel(&self) -> Option<InboundTunnel> {
        None
    }

    fn inbound_tunnels(&self) -> Vec<InboundTunnel> {
        Vec::new()
    }
}

/// Garlic stand-in that forwards payloads unencrypted. The wrap seam is
/// where the real end-to-end session layer plugs in.
struct PlaintextGarlic;

struct PlaintextSession;

impl RoutingSession for PlaintextSession {
    fn wrap_single_message(&self, payload: Vec<u8>, _leaseset: Option<&[u8]>) -> Vec<u8> {
        payload
    }
}

impl RoutingSessionFactory for PlaintextGarlic {
    fn session_for(&self, _remote: &IdentHash) -> Arc<dyn RoutingSession> {
        Arc::new(PlaintextSession)
    }

    fn session_from_key(&self, _session_key: &[u8; 32], _tag: &[u8; 32]) -> Arc<dyn RoutingSession> {
        Arc::new(PlaintextSession)
    }
}
