use crate::identity::IdentHash;
use crate::netdb::types::RouterRecord;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::oneshot;

/// A lookup gives up after failing on this many floodfills.
pub const MAX_LOOKUP_FLOODFILLS: usize = 7;
/// Seconds without a response before retrying against the next floodfill.
pub const LOOKUP_RETRY_SECS: u64 = 5;
/// A targeted lookup is worthless after this long.
pub const LOOKUP_LIFETIME_SECS: u64 = 60;

pub type LookupReply = oneshot::Sender<Option<Arc<RouterRecord>>>;

/// One in-flight netdb lookup: the target, the floodfills already tried,
/// and an optional completion channel. Lives in the engine's pending map
/// from first request until success, failure or expiry.
pub struct PendingLookup {
    pub destination: IdentHash,
    pub is_exploratory: bool,
    pub excluded: HashSet<IdentHash>,
    pub created_at_s: u64,
    on_complete: Option<LookupReply>,
}

impl PendingLookup {
    /// Record an attempt against `floodfill`: excluded from future retries,
    /// retry clock restarted.
    pub fn register_attempt(&mut self, floodfill: IdentHash, now_s: u64) {
        self.excluded.insert(floodfill);
        self.created_at_s = now_s;
    }

    pub fn exhausted(&self) -> bool {
        self.excluded.len() >= MAX_LOOKUP_FLOODFILLS
    }

    fn resolve(mut self, result: Option<Arc<RouterRecord>>) {
        if let Some(reply) = self.on_complete.take() {
            let _ = reply.send(result);
        }
    }
}

impl Drop for PendingLookup {
    fn drop(&mut self) {
        // A lookup dropped without resolution (engine shutdown) still
        // answers its waiter.
        if let Some(reply) = self.on_complete.take() {
            let _ = reply.send(None);
        }
    }
}

/// Map of in-flight lookups keyed by target. Owned by the netdb engine;
/// no internal locking.
#[derive(Default)]
pub struct PendingLookups {
    lookups: HashMap<IdentHash, PendingLookup>,
}

impl PendingLookups {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lookups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lookups.is_empty()
    }

    /// Get or create the pending lookup for `destination`. An existing
    /// entry keeps its excluded set; a late `on_complete` is attached only
    /// when none is registered yet.
    pub fn create(
        &mut self,
        destination: IdentHash,
        is_exploratory: bool,
        now_s: u64,
        on_complete: Option<LookupReply>,
    ) -> &mut PendingLookup {
        let entry = self
            .lookups
            .entry(destination)
            .or_insert_with(|| PendingLookup {
                destination,
                is_exploratory,
                excluded: HashSet::new(),
                created_at_s: now_s,
                on_complete: None,
            });
        if entry.on_complete.is_none() {
            entry.on_complete = on_complete;
        }
        entry
    }

    pub fn get_mut(&mut self, destination: &IdentHash) -> Option<&mut PendingLookup> {
        self.lookups.get_mut(destination)
    }

    pub fn contains(&self, destination: &IdentHash) -> bool {
        self.lookups.contains_key(destination)
    }

    /// Resolve a lookup with the found record.
    pub fn complete_success(&mut self, destination: &IdentHash, record: Arc<RouterRecord>) {
        if let Some(lookup) = self.lookups.remove(destination) {
            tracing::debug!(destination = %destination, "lookup succeeded");
            lookup.resolve(Some(record));
        }
    }

    /// Fail and remove a lookup; the waiter receives `None`.
    pub fn fail(&mut self, destination: &IdentHash) {
        if let Some(lookup) = self.lookups.remove(destination) {
            tracing::debug!(
                destination = %destination,
                tried = lookup.excluded.len(),
                "lookup failed"
            );
            lookup.resolve(None);
        }
    }

    /// Drain lookups that should retry now, and fail those past their
    /// lifetime or exhaustion. Exploratory lookups never retry; any
    /// revisit drops them.
    pub fn manage(&mut self, now_s: u64) -> Vec<IdentHash> {
        let mut retry = Vec::new();
        let mut failed = Vec::new();
        for (destination, lookup) in &self.lookups {
            if lookup.is_exploratory {
                failed.push(*destination);
                continue;
            }
            if now_s >= lookup.created_at_s + LOOKUP_LIFETIME_SECS || lookup.exhausted() {
                failed.push(*destination);
                continue;
            }
            if now_s >= lookup.created_at_s + LOOKUP_RETRY_SECS {
                retry.push(*destination);
            }
        }
        for destination in failed {
            self.fail(&destination);
        }
        retry
    }
}
