use crate::identity::IdentHash;
use crate::netdb::routing_key::{distance, routing_key};
use crate::netdb::types::{LeaseSet, RouterRecord};
use anyhow::{Result, bail};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

/// In-memory netdb indexes. The two maps and the floodfill list are guarded
/// independently so readers on one never contend with writers on another;
/// everything else is single-writer (the netdb engine).
#[derive(Default)]
pub struct NetdbStore {
    routers: RwLock<HashMap<IdentHash, Arc<RouterRecord>>>,
    lease_sets: RwLock<HashMap<IdentHash, LeaseSet>>,
    floodfills: RwLock<Vec<Arc<RouterRecord>>>,
}

pub struct AddRouterOutcome {
    pub record: Arc<RouterRecord>,
    pub inserted: bool,
}

impl NetdbStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a router record, or refresh the stored one when the buffer is
    /// strictly newer. A record that is (or became) a floodfill is entered
    /// into the floodfill list.
    pub fn add_router(&self, buf: &[u8]) -> Result<AddRouterOutcome> {
        let parsed = RouterRecord::parse(buf)?;
        let hash = parsed.hash();

        if let Some(existing) = self.find_router(&hash) {
            if existing.update_if_newer(buf)? {
                tracing::debug!(router = %existing.hash(), "router record updated");
            }
            self.sync_floodfill_membership(&existing);
            return Ok(AddRouterOutcome {
                record: existing,
                inserted: false,
            });
        }

        let record = Arc::new(parsed);
        {
            let mut routers = self.routers.write().expect("router index");
            routers.insert(hash, record.clone());
        }
        if record.is_floodfill() {
            let mut floodfills = self.floodfills.write().expect("floodfill list");
            floodfills.push(record.clone());
        }
        tracing::debug!(router = %hash, floodfill = record.is_floodfill(), "router record added");
        Ok(AddRouterOutcome {
            record,
            inserted: true,
        })
    }

    /// Store a lease set. Unsolicited sets that travelled through one of
    /// our tunnels are rejected: a forged publication cannot replace a set
    /// we obtained directly.
    pub fn add_leaseset(&self, key: IdentHash, buf: &[u8], from_tunnel: Option<u32>) -> Result<()> {
        if from_tunnel.is_some() {
            bail!("unsolicited lease set received through a tunnel");
        }
        let mut lease_sets = self.lease_sets.write().expect("lease set index");
        if let Some(existing) = lease_sets.get_mut(&key) {
            existing.update_from(buf)?;
            tracing::debug!(destination = %key, "lease set updated");
        } else {
            let parsed = LeaseSet::parse(buf)?;
            if parsed.hash() != key {
                bail!("lease set identity does not match store key");
            }
            tracing::debug!(destination = %key, leases = parsed.leases().len(), "lease set added");
            lease_sets.insert(key, parsed);
        }
        Ok(())
    }

    pub fn find_router(&self, hash: &IdentHash) -> Option<Arc<RouterRecord>> {
        self.routers.read().expect("router index").get(hash).cloned()
    }

    pub fn find_leaseset(&self, hash: &IdentHash) -> Option<LeaseSet> {
        self.lease_sets
            .read()
            .expect("lease set index")
            .get(hash)
            .cloned()
    }

    pub fn router_count(&self) -> usize {
        self.routers.read().expect("router index").len()
    }

    pub fn floodfill_count(&self) -> usize {
        self.floodfills.read().expect("floodfill list").len()
    }

    pub fn set_unreachable(&self, hash: &IdentHash, unreachable: bool) {
        if let Some(record) = self.find_router(hash) {
            record.set_unreachable(unreachable);
        }
    }

    /// The floodfill closest to `routing_key(target)` by XOR distance,
    /// skipping unreachable and excluded entries.
    pub fn closest_floodfill(
        &self,
        target: &IdentHash,
        excluded: &HashSet<IdentHash>,
    ) -> Option<Arc<RouterRecord>> {
        let key = routing_key(target);
        let floodfills = self.floodfills.read().expect("floodfill list");
        let mut best: Option<(super::routing_key::XorMetric, &Arc<RouterRecord>)> = None;
        for record in floodfills.iter() {
            if record.is_unreachable() || excluded.contains(&record.hash()) {
                continue;
            }
            let metric = distance(&key, &record.hash());
            match &best {
                Some((min, _)) if *min <= metric => {}
                _ => best = Some((metric, record)),
            }
        }
        best.map(|(_, r)| r.clone())
    }

    /// Up to `limit` closest floodfills, disjoint, closest first.
    pub fn closest_floodfills(
        &self,
        target: &IdentHash,
        excluded: &HashSet<IdentHash>,
        limit: usize,
    ) -> Vec<Arc<RouterRecord>> {
        let mut excluded = excluded.clone();
        let mut out = Vec::with_capacity(limit);
        while out.len() < limit {
            let Some(next) = self.closest_floodfill(target, &excluded) else {
                break;
            };
            excluded.insert(next.hash());
            out.push(next);
        }
        out
    }

    /// Uniformly pick an index into the router map and scan forward for the
    /// first reachable entry satisfying the predicate, wrapping to the start
    /// once.
    pub fn random_router<F>(&self, filter: F) -> Option<Arc<RouterRecord>>
    where
        F: Fn(&RouterRecord) -> bool,
    {
        let routers = self.routers.read().expect("router index");
        if routers.is_empty() {
            return None;
        }
        let start = rand::thread_rng().gen_range(0..routers.len());
        routers
            .values()
            .skip(start)
            .chain(routers.values().take(start))
            .find(|r| !r.is_unreachable() && filter(r))
            .cloned()
    }

    pub fn routers_snapshot(&self) -> Vec<Arc<RouterRecord>> {
        self.routers
            .read()
            .expect("router index")
            .values()
            .cloned()
            .collect()
    }

    /// Drop a router from both indexes (persistence eviction path).
    pub fn remove_router(&self, hash: &IdentHash) {
        {
            let mut routers = self.routers.write().expect("router index");
            routers.remove(hash);
        }
        let mut floodfills = self.floodfills.write().expect("floodfill list");
        floodfills.retain(|r| r.hash() != *hash);
    }

    /// Evict lease sets whose leases have all expired.
    pub fn manage_leasesets(&self, now_ms: u64) {
        let mut lease_sets = self.lease_sets.write().expect("lease set index");
        lease_sets.retain(|hash, ls| {
            let keep = ls.has_non_expired_leases(now_ms);
            if !keep {
                tracing::debug!(destination = %hash, "lease set expired");
            }
            keep
        });
    }

    /// Keep the floodfill list in step with a record whose flags may have
    /// changed on update.
    fn sync_floodfill_membership(&self, record: &Arc<RouterRecord>) {
        let mut floodfills = self.floodfills.write().expect("floodfill list");
        let listed = floodfills.iter().any(|r| r.hash() == record.hash());
        if record.is_floodfill() && !listed {
            floodfills.push(record.clone());
        } else if !record.is_floodfill() && listed {
            floodfills.retain(|r| r.hash() != record.hash());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::PrivateIdentity;
    use crate::netdb::types::{Lease, ROUTER_FLAG_FLOODFILL, build_router_record};

    fn floodfill_record(published_ms: u64) -> (PrivateIdentity, Vec<u8>) {
        let keys = PrivateIdentity::generate();
        let buf = build_router_record(keys.identity(), published_ms, ROUTER_FLAG_FLOODFILL);
        (keys, buf)
    }

    #[test]
    fn add_router_twice_is_idempotent() {
        let store = NetdbStore::new();
        let (_, buf) = floodfill_record(1_000);

        let first = store.add_router(&buf).unwrap();
        assert!(first.inserted);
        let ts = first.record.published_ms();

        let second = store.add_router(&buf).unwrap();
        assert!(!second.inserted);
        assert_eq!(store.router_count(), 1);
        assert_eq!(store.floodfill_count(), 1);
        assert_eq!(second.record.published_ms(), ts);
    }

    #[test]
    fn floodfill_list_tracks_flag() {
        let store = NetdbStore::new();
        let keys = PrivateIdentity::generate();
        let plain = build_router_record(keys.identity(), 1_000, 0);
        store.add_router(&plain).unwrap();
        assert_eq!(store.floodfill_count(), 0);

        let promoted = build_router_record(keys.identity(), 2_000, ROUTER_FLAG_FLOODFILL);
        store.add_router(&promoted).unwrap();
        assert_eq!(store.floodfill_count(), 1);
    }

    #[test]
    fn closest_floodfill_minimizes_xor_distance() {
        let store = NetdbStore::new();
        let mut hashes = Vec::new();
        for _ in 0..8 {
            let (keys, buf) = floodfill_record(1_000);
            store.add_router(&buf).unwrap();
            hashes.push(keys.hash());
        }

        let target = IdentHash([0x5A; 32]);
        let key = routing_key(&target);
        let excluded = HashSet::new();
        let picked = store.closest_floodfill(&target, &excluded).unwrap();

        let best = hashes
            .iter()
            .map(|h| distance(&key, h))
            .min()
            .unwrap();
        assert_eq!(distance(&key, &picked.hash()), best);

        // Excluding the winner moves to the next-closest candidate.
        let mut excluded = HashSet::new();
        excluded.insert(picked.hash());
        let second = store.closest_floodfill(&target, &excluded).unwrap();
        assert_ne!(second.hash(), picked.hash());
        assert!(distance(&key, &second.hash()) >= best);
    }

    #[test]
    fn closest_floodfill_skips_unreachable() {
        let store = NetdbStore::new();
        let (keys, buf) = floodfill_record(1_000);
        store.add_router(&buf).unwrap();
        store.set_unreachable(&keys.hash(), true);
        assert!(store
            .closest_floodfill(&IdentHash([0; 32]), &HashSet::new())
            .is_none());
    }

    #[test]
    fn closest_floodfills_are_disjoint_and_ordered() {
        let store = NetdbStore::new();
        for _ in 0..5 {
            let (_, buf) = floodfill_record(1_000);
            store.add_router(&buf).unwrap();
        }
        let target = IdentHash([0x11; 32]);
        let picked = store.closest_floodfills(&target, &HashSet::new(), 3);
        assert_eq!(picked.len(), 3);
        let key = routing_key(&target);
        for pair in picked.windows(2) {
            assert!(distance(&key, &pair[0].hash()) < distance(&key, &pair[1].hash()));
        }
    }

    #[test]
    fn leaseset_over_tunnel_is_rejected() {
        let store = NetdbStore::new();
        let keys = PrivateIdentity::generate();
        let ls = LeaseSet::build(*keys.identity(), vec![]);

        assert!(store
            .add_leaseset(keys.hash(), ls.buffer(), Some(42))
            .is_err());
        assert!(store.find_leaseset(&keys.hash()).is_none());

        store.add_leaseset(keys.hash(), ls.buffer(), None).unwrap();
        assert!(store.find_leaseset(&keys.hash()).is_some());
    }

    #[test]
    fn manage_leasesets_evicts_fully_expired() {
        let store = NetdbStore::new();
        let keys = PrivateIdentity::generate();
        let lease = |end_date_ms| Lease {
            tunnel_gateway: IdentHash([7; 32]),
            tunnel_id: 1,
            end_date_ms,
        };
        let ls = LeaseSet::build(*keys.identity(), vec![lease(100), lease(200)]);
        store.add_leaseset(keys.hash(), ls.buffer(), None).unwrap();

        store.manage_leasesets(150);
        assert!(store.find_leaseset(&keys.hash()).is_some());

        store.manage_leasesets(250);
        assert!(store.find_leaseset(&keys.hash()).is_none());
    }

    #[test]
    fn random_router_honors_filter() {
        let store = NetdbStore::new();
        let mut floodfill_hash = None;
        for i in 0..6 {
            let keys = PrivateIdentity::generate();
            let flags = if i == 0 { ROUTER_FLAG_FLOODFILL } else { 0 };
            store
                .add_router(&build_router_record(keys.identity(), 1_000, flags))
                .unwrap();
            if i == 0 {
                floodfill_hash = Some(keys.hash());
            }
        }
        for _ in 0..32 {
            let r = store.random_router(|r| r.is_floodfill()).unwrap();
            assert_eq!(Some(r.hash()), floodfill_hash);
        }
        assert!(store.random_router(|_| false).is_none());
    }
}
