use crate::identity::IdentHash;
use anyhow::{Result, bail};

// I2NP message type IDs, as issued by the wire layer.
pub const I2NP_DATABASE_STORE: u8 = 1;
pub const I2NP_DATABASE_LOOKUP: u8 = 2;
pub const I2NP_DATABASE_SEARCH_REPLY: u8 = 3;
pub const I2NP_DATA: u8 = 18;

pub const MAX_ROUTER_RECORD_LEN: usize = 2048;
pub const MAX_EXCLUDED_PEERS: usize = 512;
pub const MAX_SEARCH_REPLY_PEERS: usize = 16;

/// One message handed up by the transport layer.
///
/// `from_tunnel` is set when the message arrived through one of our inbound
/// tunnels; the netdb uses it to reject unsolicited tunnel-delivered lease
/// sets.
#[derive(Debug, Clone)]
pub struct Message {
    pub msg_type: u8,
    pub payload: Vec<u8>,
    pub from_tunnel: Option<u32>,
}

impl Message {
    pub fn direct(msg_type: u8, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            payload,
            from_tunnel: None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum StoreContent {
    /// Gzip-deflated router record, still compressed; the netdb inflates it
    /// under the 2048-byte cap.
    Router { deflated: Vec<u8> },
    LeaseSet { raw: Vec<u8> },
}

#[derive(Debug, Clone)]
pub struct DatabaseStore {
    pub key: IdentHash,
    pub reply_token: u32,
    pub content: StoreContent,
}

pub fn decode_database_store(payload: &[u8]) -> Result<DatabaseStore> {
    let mut r = Reader::new(payload);
    let key = r.read_hash()?;
    let store_type = r.read_u8()?;
    let reply_token = r.read_u32_be()?;
    if reply_token != 0 {
        // Reply gateway + tunnel id block; we never act on it.
        r.skip(36)?;
    }
    let content = if store_type != 0 {
        StoreContent::LeaseSet {
            raw: r.rest().to_vec(),
        }
    } else {
        let len = r.read_u16_be()? as usize;
        if len > MAX_ROUTER_RECORD_LEN {
            bail!("router record length {len} exceeds {MAX_ROUTER_RECORD_LEN}");
        }
        StoreContent::Router {
            deflated: r.read_bytes(len)?.to_vec(),
        }
    };
    Ok(DatabaseStore {
        key,
        reply_token,
        content,
    })
}

pub fn encode_database_store_router(key: &IdentHash, deflated_record: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(39 + deflated_record.len());
    out.extend_from_slice(&key.0);
    out.push(0); // type: router record
    out.extend_from_slice(&0u32.to_be_bytes()); // reply token
    out.extend_from_slice(&(deflated_record.len() as u16).to_be_bytes());
    out.extend_from_slice(deflated_record);
    out
}

pub fn encode_database_store_leaseset(key: &IdentHash, leaseset: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(37 + leaseset.len());
    out.extend_from_slice(&key.0);
    out.push(1); // type: lease set
    out.extend_from_slice(&0u32.to_be_bytes());
    out.extend_from_slice(leaseset);
    out
}

#[derive(Debug, Clone)]
pub struct DatabaseLookup {
    pub target: IdentHash,
    pub from: IdentHash,
    pub reply_tunnel: Option<u32>,
    pub excluded: Vec<IdentHash>,
    /// Session key plus tags for an encrypted tunnel reply.
    pub session: Option<(
        [u8; 32],
        Vec<[u8; 32]>,
    )>,
}

const LOOKUP_FLAG_TUNNEL_REPLY: u8 = 0x01;
const LOOKUP_FLAG_ENCRYPTED_REPLY: u8 = 0x02;

pub fn decode_database_lookup(payload: &[u8]) -> Result<DatabaseLookup> {
    let mut r = Reader::new(payload);
    let target = r.read_hash()?;
    let from = r.read_hash()?;
    let flags = r.read_u8()?;
    let reply_tunnel = if flags & LOOKUP_FLAG_TUNNEL_REPLY != 0 {
        Some(r.read_u32_be()?)
    } else {
        None
    };
    let num_excluded = r.read_u16_be()? as usize;
    if num_excluded > MAX_EXCLUDED_PEERS {
        bail!("excluded peer count {num_excluded} exceeds {MAX_EXCLUDED_PEERS}");
    }
    let mut excluded = Vec::with_capacity(num_excluded);
    for _ in 0..num_excluded {
        excluded.push(r.read_hash()?);
    }
    let session = if flags & LOOKUP_FLAG_ENCRYPTED_REPLY != 0 {
        let key: [u8; 32] = r.read_bytes(32)?.try_into().unwrap();
        let num_tags = r.read_u8()? as usize;
        let mut tags = Vec::with_capacity(num_tags);
        for _ in 0..num_tags {
            tags.push(r.read_bytes(32)?.try_into().unwrap());
        }
        Some((key, tags))
    } else {
        None
    };
    Ok(DatabaseLookup {
        target,
        from,
        reply_tunnel,
        excluded,
        session,
    })
}

pub fn encode_database_lookup(
    target: &IdentHash,
    from: &IdentHash,
    reply_tunnel: Option<u32>,
    excluded: &[IdentHash],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(69 + excluded.len() * 32 + 4);
    out.extend_from_slice(&target.0);
    out.extend_from_slice(&from.0);
    out.push(if reply_tunnel.is_some() {
        LOOKUP_FLAG_TUNNEL_REPLY
    } else {
        0
    });
    if let Some(tunnel_id) = reply_tunnel {
        out.extend_from_slice(&tunnel_id.to_be_bytes());
    }
    out.extend_from_slice(&(excluded.len() as u16).to_be_bytes());
    for hash in excluded {
        out.extend_from_slice(&hash.0);
    }
    out
}

#[derive(Debug, Clone)]
pub struct DatabaseSearchReply {
    pub key: IdentHash,
    pub peers: Vec<IdentHash>,
}

pub fn decode_database_search_reply(payload: &[u8]) -> Result<DatabaseSearchReply> {
    let mut r = Reader::new(payload);
    let key = r.read_hash()?;
    let num = r.read_u8()? as usize;
    if num > MAX_SEARCH_REPLY_PEERS {
        bail!("search reply peer count {num} exceeds {MAX_SEARCH_REPLY_PEERS}");
    }
    let mut peers = Vec::with_capacity(num);
    for _ in 0..num {
        peers.push(r.read_hash()?);
    }
    Ok(DatabaseSearchReply { key, peers })
}

pub fn encode_database_search_reply(key: &IdentHash, peers: &[IdentHash]) -> Vec<u8> {
    let mut out = Vec::with_capacity(33 + peers.len() * 32);
    out.extend_from_slice(&key.0);
    out.push(peers.len() as u8);
    for peer in peers {
        out.extend_from_slice(&peer.0);
    }
    out
}

pub(crate) struct Reader<'a> {
    b: &'a [u8],
    i: usize,
}

impl<'a> Reader<'a> {
    pub fn new(b: &'a [u8]) -> Self {
        Self { b, i: 0 }
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let v = *self
            .b
            .get(self.i)
            .ok_or_else(|| anyhow::anyhow!("unexpected EOF at {}", self.i))?;
        self.i += 1;
        Ok(v)
    }

    pub fn read_u16_be(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.read_bytes(2)?.try_into().unwrap()))
    }

    pub fn read_u32_be(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.read_bytes(4)?.try_into().unwrap()))
    }

    pub fn read_u64_be(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.read_bytes(8)?.try_into().unwrap()))
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        let s = self
            .b
            .get(self.i..self.i + n)
            .ok_or_else(|| anyhow::anyhow!("unexpected EOF at {}", self.i))?;
        self.i += n;
        Ok(s)
    }

    pub fn read_hash(&mut self) -> Result<IdentHash> {
        Ok(IdentHash(self.read_bytes(32)?.try_into().unwrap()))
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.read_bytes(n).map(|_| ())
    }

    pub fn rest(&self) -> &'a [u8] {
        &self.b[self.i..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(fill: u8) -> IdentHash {
        IdentHash([fill; 32])
    }

    #[test]
    fn database_store_router_round_trip() {
        let encoded = encode_database_store_router(&hash(0x11), &[1, 2, 3, 4]);
        let decoded = decode_database_store(&encoded).unwrap();
        assert_eq!(decoded.key, hash(0x11));
        assert_eq!(decoded.reply_token, 0);
        match decoded.content {
            StoreContent::Router { deflated } => assert_eq!(deflated, vec![1, 2, 3, 4]),
            other => panic!("unexpected content: {other:?}"),
        }
    }

    #[test]
    fn database_store_skips_reply_block() {
        let mut encoded = Vec::new();
        encoded.extend_from_slice(&hash(0x22).0);
        encoded.push(1); // lease set
        encoded.extend_from_slice(&7u32.to_be_bytes()); // reply token
        encoded.extend_from_slice(&[0u8; 36]); // reply gateway block
        encoded.extend_from_slice(b"leaseset-bytes");
        let decoded = decode_database_store(&encoded).unwrap();
        assert_eq!(decoded.reply_token, 7);
        match decoded.content {
            StoreContent::LeaseSet { raw } => assert_eq!(raw, b"leaseset-bytes"),
            other => panic!("unexpected content: {other:?}"),
        }
    }

    #[test]
    fn database_store_rejects_oversized_router_record() {
        let mut encoded = Vec::new();
        encoded.extend_from_slice(&hash(0x33).0);
        encoded.push(0);
        encoded.extend_from_slice(&0u32.to_be_bytes());
        encoded.extend_from_slice(&4000u16.to_be_bytes());
        encoded.extend_from_slice(&vec![0u8; 4000]);
        assert!(decode_database_store(&encoded).is_err());
    }

    #[test]
    fn database_lookup_round_trip() {
        let excluded = vec![hash(0xA0), hash(0xA1)];
        let encoded = encode_database_lookup(&hash(0x44), &hash(0x55), Some(99), &excluded);
        let decoded = decode_database_lookup(&encoded).unwrap();
        assert_eq!(decoded.target, hash(0x44));
        assert_eq!(decoded.from, hash(0x55));
        assert_eq!(decoded.reply_tunnel, Some(99));
        assert_eq!(decoded.excluded, excluded);
        assert!(decoded.session.is_none());
    }

    #[test]
    fn database_lookup_parses_session_block() {
        let mut encoded = encode_database_lookup(&hash(0x44), &hash(0x55), None, &[]);
        encoded[64] |= LOOKUP_FLAG_ENCRYPTED_REPLY;
        encoded.extend_from_slice(&[0xEE; 32]); // session key
        encoded.push(2); // tag count
        encoded.extend_from_slice(&[0x01; 32]);
        encoded.extend_from_slice(&[0x02; 32]);
        let decoded = decode_database_lookup(&encoded).unwrap();
        let (key, tags) = decoded.session.unwrap();
        assert_eq!(key, [0xEE; 32]);
        assert_eq!(tags, vec![[0x01; 32], [0x02; 32]]);
    }

    #[test]
    fn database_lookup_rejects_excess_excluded() {
        let mut encoded = Vec::new();
        encoded.extend_from_slice(&hash(0x44).0);
        encoded.extend_from_slice(&hash(0x55).0);
        encoded.push(0);
        encoded.extend_from_slice(&513u16.to_be_bytes());
        assert!(decode_database_lookup(&encoded).is_err());
    }

    #[test]
    fn search_reply_round_trip() {
        let peers = vec![hash(1), hash(2), hash(3)];
        let encoded = encode_database_search_reply(&hash(0x66), &peers);
        let decoded = decode_database_search_reply(&encoded).unwrap();
        assert_eq!(decoded.key, hash(0x66));
        assert_eq!(decoded.peers, peers);
    }

    #[test]
    fn search_reply_rejects_excess_peers() {
        let mut encoded = Vec::new();
        encoded.extend_from_slice(&hash(0x66).0);
        encoded.push(17);
        encoded.extend_from_slice(&[0u8; 17 * 32]);
        assert!(decode_database_search_reply(&encoded).is_err());
    }
}
