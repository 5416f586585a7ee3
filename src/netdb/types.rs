use crate::i2np::Reader;
use crate::identity::{Identity, IdentHash};
use anyhow::{Result, bail};
use std::sync::Mutex;

pub const ROUTER_FLAG_FLOODFILL: u8 = 0x01;
pub const ROUTER_FLAG_INTRODUCER: u8 = 0x02;

pub const ROUTER_RECORD_LEN: usize = 32 + 8 + 1;

/// A router descriptor as stored in the netdb.
///
/// Shared via `Arc`; the mutable state sits behind a mutex so the engine
/// thread and concurrent readers can both touch it. Records age out through
/// the `unreachable` flag rather than immediate removal.
#[derive(Debug)]
pub struct RouterRecord {
    hash: IdentHash,
    state: Mutex<RecordState>,
}

#[derive(Debug)]
struct RecordState {
    /// Raw record bytes. Dropped after persisting to keep the resident set
    /// small; reloaded from disk when a lookup reply needs them.
    buffer: Option<Vec<u8>>,
    published_ms: u64,
    is_floodfill: bool,
    uses_introducer: bool,
    is_unreachable: bool,
    updated: bool,
}

impl RouterRecord {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let (identity, published_ms, flags) = parse_record_fields(buf)?;
        Ok(Self {
            hash: identity.hash(),
            state: Mutex::new(RecordState {
                buffer: Some(buf.to_vec()),
                published_ms,
                is_floodfill: flags & ROUTER_FLAG_FLOODFILL != 0,
                uses_introducer: flags & ROUTER_FLAG_INTRODUCER != 0,
                is_unreachable: false,
                updated: true,
            }),
        })
    }

    pub fn hash(&self) -> IdentHash {
        self.hash
    }

    /// Replace the record when the incoming buffer is strictly newer.
    /// Returns true when the update was applied.
    pub fn update_if_newer(&self, buf: &[u8]) -> Result<bool> {
        let (identity, published_ms, flags) = parse_record_fields(buf)?;
        if identity.hash() != self.hash {
            bail!("record identity does not match stored hash");
        }
        let mut state = self.state.lock().expect("record lock");
        if published_ms <= state.published_ms {
            return Ok(false);
        }
        state.buffer = Some(buf.to_vec());
        state.published_ms = published_ms;
        state.is_floodfill = flags & ROUTER_FLAG_FLOODFILL != 0;
        state.uses_introducer = flags & ROUTER_FLAG_INTRODUCER != 0;
        state.updated = true;
        Ok(true)
    }

    pub fn published_ms(&self) -> u64 {
        self.state.lock().expect("record lock").published_ms
    }

    pub fn is_floodfill(&self) -> bool {
        self.state.lock().expect("record lock").is_floodfill
    }

    pub fn uses_introducer(&self) -> bool {
        self.state.lock().expect("record lock").uses_introducer
    }

    pub fn is_unreachable(&self) -> bool {
        self.state.lock().expect("record lock").is_unreachable
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().expect("record lock").is_unreachable = unreachable;
    }

    pub fn is_updated(&self) -> bool {
        self.state.lock().expect("record lock").updated
    }

    pub fn set_updated(&self, updated: bool) {
        self.state.lock().expect("record lock").updated = updated;
    }

    pub fn buffer(&self) -> Option<Vec<u8>> {
        self.state.lock().expect("record lock").buffer.clone()
    }

    pub fn drop_buffer(&self) {
        self.state.lock().expect("record lock").buffer = None;
    }

    pub fn restore_buffer(&self, buf: Vec<u8>) {
        self.state.lock().expect("record lock").buffer = Some(buf);
    }
}

fn parse_record_fields(buf: &[u8]) -> Result<(Identity, u64, u8)> {
    if buf.len() < ROUTER_RECORD_LEN {
        bail!("router record too short: {} bytes", buf.len());
    }
    let mut r = Reader::new(buf);
    let identity = Identity::from_bytes(r.read_bytes(32)?)
        .ok_or_else(|| anyhow::anyhow!("bad identity key"))?;
    let published_ms = r.read_u64_be()?;
    let flags = r.read_u8()?;
    Ok((identity, published_ms, flags))
}

pub fn build_router_record(identity: &Identity, published_ms: u64, flags: u8) -> Vec<u8> {
    let mut out = Vec::with_capacity(ROUTER_RECORD_LEN);
    out.extend_from_slice(identity.as_bytes());
    out.extend_from_slice(&published_ms.to_be_bytes());
    out.push(flags);
    out
}

/// One tunnel entry point of a remote destination. Copied by value into
/// streams; never borrowed out of the netdb.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    pub tunnel_gateway: IdentHash,
    pub tunnel_id: u32,
    pub end_date_ms: u64,
}

impl Lease {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.end_date_ms
    }
}

/// The set of currently valid tunnel entry points for one destination,
/// together with its long-term identity. Replaceable in place when a newer
/// set arrives.
#[derive(Debug, Clone)]
pub struct LeaseSet {
    identity: Identity,
    hash: IdentHash,
    leases: Vec<Lease>,
    buffer: Vec<u8>,
}

impl LeaseSet {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let mut r = Reader::new(buf);
        let identity = Identity::from_bytes(r.read_bytes(32)?)
            .ok_or_else(|| anyhow::anyhow!("bad identity key"))?;
        let count = r.read_u8()? as usize;
        let mut leases = Vec::with_capacity(count);
        for _ in 0..count {
            leases.push(Lease {
                tunnel_gateway: r.read_hash()?,
                tunnel_id: r.read_u32_be()?,
                end_date_ms: r.read_u64_be()?,
            });
        }
        Ok(Self {
            identity,
            hash: identity.hash(),
            leases,
            buffer: buf.to_vec(),
        })
    }

    pub fn build(identity: Identity, leases: Vec<Lease>) -> Self {
        let mut buffer = Vec::with_capacity(33 + leases.len() * 44);
        buffer.extend_from_slice(identity.as_bytes());
        buffer.push(leases.len() as u8);
        for lease in &leases {
            buffer.extend_from_slice(&lease.tunnel_gateway.0);
            buffer.extend_from_slice(&lease.tunnel_id.to_be_bytes());
            buffer.extend_from_slice(&lease.end_date_ms.to_be_bytes());
        }
        Self {
            identity,
            hash: identity.hash(),
            leases,
            buffer,
        }
    }

    /// Replace contents from a newly received encoding. The identity must
    /// stay the same; a set published under a different key is rejected.
    pub fn update_from(&mut self, buf: &[u8]) -> Result<()> {
        let parsed = Self::parse(buf)?;
        if parsed.hash != self.hash {
            bail!("lease set identity changed");
        }
        *self = parsed;
        Ok(())
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn hash(&self) -> IdentHash {
        self.hash
    }

    pub fn leases(&self) -> &[Lease] {
        &self.leases
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    pub fn non_expired_leases(&self, now_ms: u64) -> Vec<Lease> {
        self.leases
            .iter()
            .copied()
            .filter(|l| !l.is_expired(now_ms))
            .collect()
    }

    pub fn has_non_expired_leases(&self, now_ms: u64) -> bool {
        self.leases.iter().any(|l| !l.is_expired(now_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::PrivateIdentity;

    #[test]
    fn router_record_round_trip() {
        let keys = PrivateIdentity::generate();
        let buf = build_router_record(keys.identity(), 1_000, ROUTER_FLAG_FLOODFILL);
        let record = RouterRecord::parse(&buf).unwrap();
        assert_eq!(record.hash(), keys.hash());
        assert!(record.is_floodfill());
        assert!(!record.uses_introducer());
        assert_eq!(record.published_ms(), 1_000);
        assert_eq!(record.buffer().unwrap(), buf);
    }

    #[test]
    fn update_if_newer_ignores_stale_buffers() {
        let keys = PrivateIdentity::generate();
        let v1 = build_router_record(keys.identity(), 1_000, 0);
        let v2 = build_router_record(keys.identity(), 2_000, ROUTER_FLAG_INTRODUCER);
        let record = RouterRecord::parse(&v2).unwrap();
        assert!(!record.update_if_newer(&v1).unwrap());
        assert_eq!(record.published_ms(), 2_000);
        assert!(record.uses_introducer());

        let v3 = build_router_record(keys.identity(), 3_000, 0);
        assert!(record.update_if_newer(&v3).unwrap());
        assert_eq!(record.published_ms(), 3_000);
        assert!(!record.uses_introducer());
    }

    #[test]
    fn update_rejects_foreign_identity() {
        let a = PrivateIdentity::generate();
        let b = PrivateIdentity::generate();
        let record =
            RouterRecord::parse(&build_router_record(a.identity(), 1_000, 0)).unwrap();
        let foreign = build_router_record(b.identity(), 9_000, 0);
        assert!(record.update_if_newer(&foreign).is_err());
    }

    #[test]
    fn leaseset_round_trip_and_expiry() {
        let keys = PrivateIdentity::generate();
        let leases = vec![
            Lease {
                tunnel_gateway: IdentHash([1; 32]),
                tunnel_id: 10,
                end_date_ms: 500,
            },
            Lease {
                tunnel_gateway: IdentHash([2; 32]),
                tunnel_id: 20,
                end_date_ms: 2_000,
            },
        ];
        let ls = LeaseSet::build(*keys.identity(), leases.clone());
        let parsed = LeaseSet::parse(ls.buffer()).unwrap();
        assert_eq!(parsed.hash(), keys.hash());
        assert_eq!(parsed.leases(), leases.as_slice());

        let live = parsed.non_expired_leases(1_000);
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].tunnel_id, 20);
        assert!(parsed.has_non_expired_leases(1_000));
        assert!(!parsed.has_non_expired_leases(3_000));
    }

    #[test]
    fn leaseset_update_keeps_identity_pinned() {
        let a = PrivateIdentity::generate();
        let b = PrivateIdentity::generate();
        let mut ls = LeaseSet::build(*a.identity(), vec![]);
        let foreign = LeaseSet::build(*b.identity(), vec![]);
        assert!(ls.update_from(foreign.buffer()).is_err());

        let refreshed = LeaseSet::build(
            *a.identity(),
            vec![Lease {
                tunnel_gateway: IdentHash([9; 32]),
                tunnel_id: 77,
                end_date_ms: 123,
            }],
        );
        ls.update_from(refreshed.buffer()).unwrap();
        assert_eq!(ls.leases().len(), 1);
    }
}
