use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

const REJECTED_PEER_TTL: Duration = Duration::from_secs(10);

/// Short-TTL set of peer keys previously rejected with `block=true`
/// (spec.md §3 "Rejected-peer cache", §4.4 "Rejection sink").
///
/// A lazy arena: entries are swept on access rather than on a per-entry
/// timer, per the design note in spec.md §9.
#[derive(Default)]
pub struct RejectedPeerCache {
    entries: Mutex<HashMap<String, Instant>>,
}

impl RejectedPeerCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Memoizes `peer_key` for `REJECTED_PEER_TTL`.
    pub fn insert(&self, peer_key: String) {
        let deadline = Instant::now() + REJECTED_PEER_TTL;
        let mut entries = self.entries.lock().expect("rejected cache poisoned");
        entries.insert(peer_key, deadline);
    }

    /// True if `peer_key` is still within its rejection window. Expired
    /// entries are swept as a side effect.
    pub fn is_rejected(&self, peer_key: &str) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("rejected cache poisoned");
        entries.retain(|_, deadline| *deadline > now);
        entries.contains_key(peer_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn rejected_peer_expires_after_ttl() {
        let cache = RejectedPeerCache::new();
        cache.insert("peer-a".to_string());
        assert!(cache.is_rejected("peer-a"));

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(cache.is_rejected("peer-a"));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!cache.is_rejected("peer-a"));
    }

    #[test]
    fn unknown_peer_is_not_rejected() {
        let cache = RejectedPeerCache::new();
        assert!(!cache.is_rejected("peer-z"));
    }
}
