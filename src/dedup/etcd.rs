use std::time::Duration;

use super::claim_key;
use crate::etcd::client::{b64_encode, Compare, PutRequest, RequestOp, TxnRequest};
use crate::etcd::EtcdClient;

/// Claim cache shared by every consumer replica on the same etcd cluster.
///
/// A claim is a key created under a fresh lease; the lease TTL expires it.
#[derive(Clone)]
pub struct EtcdDedup {
    client: EtcdClient,
    key_prefix: String,
    namespace: String,
    ttl: Duration,
}

impl EtcdDedup {
    pub fn new(client: EtcdClient, key_prefix: &str, namespace: &str, ttl: Duration) -> Self {
        Self {
            client,
            key_prefix: key_prefix.trim_end_matches('/').to_string(),
            namespace: namespace.to_string(),
            ttl,
        }
    }

    fn key(&self, id: &str) -> String {
        format!("{}/dedup/{}", self.key_prefix, claim_key(&self.namespace, id))
    }

    pub async fn try_claim(&self, id: &str) -> anyhow::Result<bool> {
        let lease = self.client.lease_grant(self.ttl.as_secs().max(1)).await?;
        let key = b64_encode(&self.key(id));
        self.client
            .txn(&TxnRequest {
                compare: vec![Compare::key_absent(key.clone())],
                success: vec![RequestOp {
                    request_put: PutRequest {
                        key,
                        value: b64_encode("1"),
                        lease: Some(lease),
                    },
                }],
                failure: vec![],
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EtcdConfig;

    #[test]
    fn test_key_layout() {
        let d = EtcdDedup::new(
            EtcdClient::unconnected(&EtcdConfig::default()),
            "/relay/",
            "relay-consumer",
            Duration::from_secs(300),
        );
        assert_eq!(d.key("abc"), "/relay/dedup/relay-consumer:doc:abc");
    }
}
