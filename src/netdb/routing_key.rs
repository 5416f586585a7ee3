use crate::identity::IdentHash;
use sha2::{Digest, Sha256};

/// 256-bit XOR distance between a routing key and a router hash. Ordered
/// lexicographically on the XOR bytes; smaller is closer.
pub type XorMetric = [u8; 32];

/// Routing key of an identity hash for the current UTC day:
/// `SHA256(hash || yyyymmdd)`. The daily rotation makes the closest-peer
/// set unpredictable ahead of time.
pub fn routing_key(hash: &IdentHash) -> IdentHash {
    routing_key_for_date(hash, &current_date_utc())
}

pub fn routing_key_for_date(hash: &IdentHash, yyyymmdd: &str) -> IdentHash {
    let mut hasher = Sha256::new();
    hasher.update(hash.0);
    hasher.update(yyyymmdd.as_bytes());
    IdentHash(hasher.finalize().into())
}

pub fn distance(routing_key: &IdentHash, peer: &IdentHash) -> XorMetric {
    routing_key.xor(peer)
}

fn current_date_utc() -> String {
    let date = time::OffsetDateTime::now_utc().date();
    format!(
        "{:04}{:02}{:02}",
        date.year(),
        u8::from(date.month()),
        date.day()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_depends_on_date() {
        let h = IdentHash([0x42; 32]);
        let a = routing_key_for_date(&h, "20260801");
        let b = routing_key_for_date(&h, "20260802");
        assert_ne!(a, b);
        assert_eq!(a, routing_key_for_date(&h, "20260801"));
    }

    #[test]
    fn distance_orders_lexicographically() {
        let key = IdentHash([0u8; 32]);
        let mut near = IdentHash([0u8; 32]);
        near.0[31] = 1;
        let mut far = IdentHash([0u8; 32]);
        far.0[0] = 1;
        assert!(distance(&key, &near) < distance(&key, &far));
        assert_eq!(distance(&key, &key), [0u8; 32]);
    }

    #[test]
    fn current_date_renders_eight_digits() {
        let d = current_date_utc();
        assert_eq!(d.len(), 8);
        assert!(d.bytes().all(|b| b.is_ascii_digit()));
    }
}
