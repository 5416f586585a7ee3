#![allow(dead_code)]

use rust_garlic::i2np::Message;
use rust_garlic::identity::IdentHash;
use rust_garlic::tunnel::{
    InboundTunnel, OutboundTunnel, RoutingSession, RoutingSessionFactory, Transport,
    TunnelMessageBlock, TunnelPool,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

/// Transport stub: every message the engine sends lands on a channel for
/// the test to inspect.
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<(IdentHash, Message)>,
}

impl ChannelTransport {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<(IdentHash, Message)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl Transport for ChannelTransport {
    fn send_message(&self, to: &IdentHash, msg: Message) {
        let _ = self.tx.send((*to, msg));
    }
}

pub struct StubOutboundTunnel {
    id: u32,
    tx: mpsc::UnboundedSender<TunnelMessageBlock>,
    drop_all: Arc<AtomicBool>,
}

impl OutboundTunnel for StubOutboundTunnel {
    fn tunnel_id(&self) -> u32 {
        self.id
    }

    fn send_tunnel_data(&self, blocks: Vec<TunnelMessageBlock>) {
        if self.drop_all.load(Ordering::Relaxed) {
            return;
        }
        for block in blocks {
            let _ = self.tx.send(block);
        }
    }
}

/// Tunnel pool stub: fixed inbound tunnels and outbound tunnels that
/// deliver their blocks onto a channel. `drop_all` simulates a black-holed
/// outbound path.
pub struct StubTunnelPool {
    outbound: Vec<Arc<StubOutboundTunnel>>,
    inbound: Vec<InboundTunnel>,
}

impl StubTunnelPool {
    pub fn new(
        inbound: Vec<InboundTunnel>,
        outbound_ids: &[u32],
    ) -> (
        Arc<Self>,
        mpsc::UnboundedReceiver<TunnelMessageBlock>,
        Arc<AtomicBool>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let drop_all = Arc::new(AtomicBool::new(false));
        let outbound = outbound_ids
            .iter()
            .map(|id| {
                Arc::new(StubOutboundTunnel {
                    id: *id,
                    tx: tx.clone(),
                    drop_all: drop_all.clone(),
                })
            })
            .collect();
        (
            Arc::new(Self { outbound, inbound }),
            rx,
            drop_all,
        )
    }
}

impl TunnelPool for StubTunnelPool {
    fn next_outbound_tunnel(&self, skip: Option<u32>) -> Option<Arc<dyn OutboundTunnel>> {
        let preferred = self
            .outbound
            .iter()
            .find(|t| Some(t.id) != skip)
            .or_else(|| self.outbound.first());
        preferred.map(|t| t.clone() as Arc<dyn OutboundTunnel>)
    }

    fn next_inbound_tunnel(&self) -> Option<InboundTunnel> {
        self.inbound.first().copied()
    }

    fn inbound_tunnels(&self) -> Vec<InboundTunnel> {
        self.inbound.clone()
    }
}

pub fn inbound_tunnel(gateway: IdentHash, tunnel_id: u32) -> InboundTunnel {
    InboundTunnel {
        gateway,
        tunnel_id,
        expires_ms: u64::MAX,
    }
}

/// Garlic stub with a reversible framing so tests can unwrap what the
/// engine sent: `ls_len:be32 | leaseset | payload`.
pub struct StubGarlic;

pub struct StubSession;

impl RoutingSession for StubSession {
    fn wrap_single_message(&self, payload: Vec<u8>, leaseset: Option<&[u8]>) -> Vec<u8> {
        let ls = leaseset.unwrap_or(&[]);
        let mut out = Vec::with_capacity(4 + ls.len() + payload.len());
        out.extend_from_slice(&(ls.len() as u32).to_be_bytes());
        out.extend_from_slice(ls);
        out.extend_from_slice(&payload);
        out
    }
}

impl RoutingSessionFactory for StubGarlic {
    fn session_for(&self, _remote: &IdentHash) -> Arc<dyn RoutingSession> {
        Arc::new(StubSession)
    }

    fn session_from_key(&self, _session_key: &[u8; 32], _tag: &[u8; 32]) -> Arc<dyn RoutingSession> {
        Arc::new(StubSession)
    }
}

/// Split a stub-wrapped message back into bundled lease set and payload.
pub fn unwrap_garlic(wrapped: &[u8]) -> (Option<Vec<u8>>, Vec<u8>) {
    let ls_len = u32::from_be_bytes(wrapped[..4].try_into().unwrap()) as usize;
    let ls = if ls_len > 0 {
        Some(wrapped[4..4 + ls_len].to_vec())
    } else {
        None
    };
    (ls, wrapped[4 + ls_len..].to_vec())
}
