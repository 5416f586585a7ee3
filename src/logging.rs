use std::{
    collections::HashMap,
    sync::{Mutex, OnceLock},
    time::{Duration, Instant},
};

/// Shorten a base64 identity hash for log output.
pub fn redact_hash(value: &str) -> String {
    if value.len() <= 12 {
        return value.to_string();
    }
    format!("{}..{}", &value[..6], &value[value.len() - 6..])
}

#[derive(Debug, Clone, Copy)]
struct WarnThrottleState {
    last: Instant,
    suppressed: u64,
}

/// Rate-limit a recurring warning. Returns true when the caller should log
/// now; suppressed repeats are summarized on the next pass.
///
/// Used on per-packet failure paths (no outbound tunnel, expired leases)
/// that would otherwise flood the log.
pub fn warn_throttled(key: &'static str, interval: Duration) -> bool {
    static LAST_WARN: OnceLock<Mutex<HashMap<&'static str, WarnThrottleState>>> = OnceLock::new();
    let map = LAST_WARN.get_or_init(|| Mutex::new(HashMap::new()));
    let mut guard = match map.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    };
    let now = Instant::now();
    let Some(state) = guard.get_mut(key) else {
        guard.insert(
            key,
            WarnThrottleState {
                last: now,
                suppressed: 0,
            },
        );
        return true;
    };
    if now.saturating_duration_since(state.last) < interval {
        state.suppressed = state.suppressed.saturating_add(1);
        return false;
    }
    if state.suppressed > 0 {
        tracing::warn!(key, suppressed = state.suppressed, "warnings suppressed");
    }
    state.last = now;
    state.suppressed = 0;
    true
}
