use crate::i2np::Message;
use crate::identity::IdentHash;
use std::sync::Arc;

/// One of our inbound tunnels, reduced to what the core needs: the entry
/// gateway a remote peer must address and the gateway-side tunnel id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InboundTunnel {
    pub gateway: IdentHash,
    pub tunnel_id: u32,
    pub expires_ms: u64,
}

#[derive(Debug, Clone)]
pub enum TunnelDelivery {
    /// Deliver to a router directly (floodfill messaging).
    Router { hash: IdentHash },
    /// Deliver into a remote inbound tunnel (stream traffic).
    Tunnel { gateway: IdentHash, tunnel_id: u32 },
}

/// One message handed to an outbound tunnel gateway for onion-wrapping and
/// delivery. `message` is serialized I2NP for router delivery, or an opaque
/// garlic blob for tunnel delivery.
#[derive(Debug, Clone)]
pub struct TunnelMessageBlock {
    pub delivery: TunnelDelivery,
    pub message: Vec<u8>,
}

impl TunnelMessageBlock {
    pub fn to_router(hash: IdentHash, msg: &Message) -> Self {
        let mut message = Vec::with_capacity(1 + msg.payload.len());
        message.push(msg.msg_type);
        message.extend_from_slice(&msg.payload);
        Self {
            delivery: TunnelDelivery::Router { hash },
            message,
        }
    }

    pub fn to_tunnel(gateway: IdentHash, tunnel_id: u32, wrapped: Vec<u8>) -> Self {
        Self {
            delivery: TunnelDelivery::Tunnel { gateway, tunnel_id },
            message: wrapped,
        }
    }
}

/// An outbound tunnel owned by the tunnel subsystem. The core only enqueues
/// message blocks; wrapping and hop-by-hop delivery happen elsewhere.
pub trait OutboundTunnel: Send + Sync {
    fn tunnel_id(&self) -> u32;
    fn send_tunnel_data(&self, blocks: Vec<TunnelMessageBlock>);
}

/// Pool of built tunnels. `next_outbound_tunnel` rotates round-robin,
/// skipping the previously used tunnel when another is available.
pub trait TunnelPool: Send + Sync {
    fn next_outbound_tunnel(&self, skip: Option<u32>) -> Option<Arc<dyn OutboundTunnel>>;
    fn next_inbound_tunnel(&self) -> Option<InboundTunnel>;
    /// All live inbound tunnels, for lease set construction.
    fn inbound_tunnels(&self) -> Vec<InboundTunnel>;
}

impl std::fmt::Debug for dyn TunnelPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TunnelPool")
    }
}

/// End-to-end encryption session toward one remote destination.
/// Consumed as an opaque wrap function.
pub trait RoutingSession: Send + Sync {
    /// Garlic-wrap one serialized message, optionally bundling our lease
    /// set so the remote can answer.
    fn wrap_single_message(&self, payload: Vec<u8>, leaseset: Option<&[u8]>) -> Vec<u8>;
}

pub trait RoutingSessionFactory: Send + Sync {
    /// Session toward a remote destination, keyed by its identity hash.
    fn session_for(&self, remote: &IdentHash) -> Arc<dyn RoutingSession>;

    /// One-shot session from a lookup-supplied session key and tag, used to
    /// encrypt a tunneled DatabaseLookup reply.
    fn session_from_key(&self, session_key: &[u8; 32], tag: &[u8; 32]) -> Arc<dyn RoutingSession>;
}

/// Authenticated router-to-router link layer, external to the core.
pub trait Transport: Send + Sync {
    fn send_message(&self, to: &IdentHash, msg: Message);
}
