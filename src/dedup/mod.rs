//! Claim cache that keeps one record from being processed twice.
//!
//! `try_claim` is "set if absent with TTL". The memory backend only excludes
//! duplicates inside one consumer process; the etcd backend is shared by all
//! consumer replicas using the same store.

mod etcd;
mod memory;

pub use etcd::EtcdDedup;
pub use memory::MemoryDedup;

use tracing::warn;

#[derive(Clone)]
pub enum DedupCache {
    Memory(MemoryDedup),
    Etcd(EtcdDedup),
}

impl DedupCache {
    /// `true` when this caller now owns `id`. Backend failures fail open.
    pub async fn try_claim(&self, id: &str) -> bool {
        let result = match self {
            DedupCache::Memory(d) => Ok(d.try_claim(id)),
            DedupCache::Etcd(d) => d.try_claim(id).await,
        };
        fail_open(id, result)
    }

    pub fn backend_name(&self) -> &'static str {
        match self {
            DedupCache::Memory(_) => "memory",
            DedupCache::Etcd(_) => "etcd",
        }
    }
}

fn fail_open(id: &str, result: anyhow::Result<bool>) -> bool {
    match result {
        Ok(claimed) => claimed,
        Err(e) => {
            metrics::counter!("relay_dedup_errors_total").increment(1);
            warn!("dedup: claim failed, processing anyway, id={}, error={}", id, e);
            true
        }
    }
}

/// Cache key for a record id.
pub(crate) fn claim_key(namespace: &str, id: &str) -> String {
    format!("{}:doc:{}", namespace, id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_fail_open() {
        assert!(fail_open("a", Ok(true)));
        assert!(!fail_open("a", Ok(false)));
        assert!(fail_open("a", Err(anyhow::anyhow!("etcd down"))));
    }

    #[test]
    fn test_claim_key() {
        assert_eq!(claim_key("relay-consumer", "abc"), "relay-consumer:doc:abc");
    }

    #[tokio::test]
    async fn test_try_claim_twice() {
        let cache = DedupCache::Memory(MemoryDedup::new("ns", Duration::from_secs(60)));
        assert!(cache.try_claim("r1").await);
        assert!(!cache.try_claim("r1").await);
        assert!(cache.try_claim("r2").await);
    }
}
