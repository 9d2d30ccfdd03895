use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use super::claim_key;

/// Expired claims are swept this often.
const GC_INTERVAL_SECS: u64 = 60;

/// Per-process claim cache: key → claim expiry.
#[derive(Clone)]
pub struct MemoryDedup {
    claims: Arc<DashMap<String, Instant>>,
    namespace: String,
    ttl: Duration,
}

impl MemoryDedup {
    pub fn new(namespace: &str, ttl: Duration) -> Self {
        Self {
            claims: Arc::new(DashMap::new()),
            namespace: namespace.to_string(),
            ttl,
        }
    }

    pub fn try_claim(&self, id: &str) -> bool {
        self.try_claim_at(id, Instant::now())
    }

    fn try_claim_at(&self, id: &str, now: Instant) -> bool {
        match self.claims.entry(claim_key(&self.namespace, id)) {
            Entry::Occupied(mut e) => {
                if *e.get() > now {
                    return false;
                }
                e.insert(now + self.ttl);
                true
            }
            Entry::Vacant(e) => {
                e.insert(now + self.ttl);
                true
            }
        }
    }

    /// Spawn a task that evicts expired claims until `cancel` fires.
    pub fn start_gc(&self, cancel: CancellationToken) {
        let dedup = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(GC_INTERVAL_SECS));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = interval.tick() => dedup.evict_expired(Instant::now()),
                }
            }
        });
    }

    fn evict_expired(&self, now: Instant) {
        self.claims.retain(|_, expiry| *expiry > now);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.claims.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_is_exclusive_within_ttl() {
        let d = MemoryDedup::new("ns", Duration::from_secs(300));
        let now = Instant::now();
        assert!(d.try_claim_at("a", now));
        assert!(!d.try_claim_at("a", now + Duration::from_secs(299)));
    }

    #[test]
    fn test_claim_reopens_after_ttl() {
        let d = MemoryDedup::new("ns", Duration::from_secs(1));
        let now = Instant::now();
        assert!(d.try_claim_at("a", now));
        assert!(d.try_claim_at("a", now + Duration::from_secs(2)));
    }

    #[test]
    fn test_clones_share_claims() {
        let a = MemoryDedup::new("ns", Duration::from_secs(60));
        let b = a.clone();
        assert!(a.try_claim("x"));
        assert!(!b.try_claim("x"));
    }

    #[test]
    fn test_concurrent_claims_have_one_winner() {
        let d = MemoryDedup::new("ns", Duration::from_secs(60));
        let winners: usize = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8).map(|_| s.spawn(|| d.try_claim("same"))).collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap() as usize)
                .sum()
        });
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_evict_expired() {
        let d = MemoryDedup::new("ns", Duration::from_secs(1));
        let now = Instant::now();
        d.try_claim_at("a", now);
        d.try_claim_at("b", now + Duration::from_secs(5));
        d.evict_expired(now + Duration::from_secs(2));
        assert_eq!(d.len(), 1);
    }
}
