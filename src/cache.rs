//! Named KV buckets with per-bucket TTL, backed by the bus's KV facility.
//!
//! Buckets and their TTLs are declared once at startup; expiry is enforced
//! broker-side. The heartbeat presence map, ephemeral handshake state, OAuth
//! nonces and the rate-limit counters all live here.

use crate::config::BucketTtls;
use crate::error::AgentError;
use crate::messaging::BusClient;
use async_nats::jetstream::kv;
use bytes::Bytes;
use futures::StreamExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use tracing::{debug, warn};

/// The buckets the runtime declares at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheBucket {
    Heartbeat,
    Ephemeral,
    OauthNonce,
    RateLimitKey,
    RateLimitIp,
}

impl CacheBucket {
    pub const ALL: [CacheBucket; 5] = [
        CacheBucket::Heartbeat,
        CacheBucket::Ephemeral,
        CacheBucket::OauthNonce,
        CacheBucket::RateLimitKey,
        CacheBucket::RateLimitIp,
    ];

    /// Broker-side bucket name.
    pub fn bucket_name(&self) -> &'static str {
        match self {
            CacheBucket::Heartbeat => "HEARTBEAT",
            CacheBucket::Ephemeral => "EPHEMERAL",
            CacheBucket::OauthNonce => "OAUTH_NONCE",
            CacheBucket::RateLimitKey => "RATE_LIMIT_KEY",
            CacheBucket::RateLimitIp => "RATE_LIMIT_IP",
        }
    }

    fn ttl(&self, ttls: &BucketTtls) -> std::time::Duration {
        match self {
            CacheBucket::Heartbeat => ttls.heartbeat,
            CacheBucket::Ephemeral => ttls.ephemeral,
            CacheBucket::OauthNonce => ttls.oauth_nonce,
            CacheBucket::RateLimitKey => ttls.rate_limit_key,
            CacheBucket::RateLimitIp => ttls.rate_limit_ip,
        }
    }
}

/// Thin wrapper over the bus KV facility.
pub struct CacheService {
    stores: HashMap<CacheBucket, kv::Store>,
}

impl CacheService {
    /// Declare every bucket. Called once during startup, after the bus is
    /// connected.
    pub async fn new(bus: &BusClient, ttls: &BucketTtls) -> Result<Self, AgentError> {
        let mut stores = HashMap::new();
        for bucket in CacheBucket::ALL {
            let store = bus.kv_bucket(bucket.bucket_name(), bucket.ttl(ttls)).await?;
            debug!(bucket = bucket.bucket_name(), ttl = ?bucket.ttl(ttls), "cache bucket ready");
            stores.insert(bucket, store);
        }
        Ok(Self { stores })
    }

    fn store(&self, bucket: CacheBucket) -> &kv::Store {
        // Every bucket is declared in new(); the map is total.
        &self.stores[&bucket]
    }

    pub async fn put<T: Serialize>(
        &self,
        bucket: CacheBucket,
        key: &str,
        value: &T,
    ) -> Result<(), AgentError> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| AgentError::BusUnavailable(format!("cache encode failed: {e}")))?;
        self.store(bucket)
            .put(key, Bytes::from(bytes))
            .await
            .map(|_| ())
            .map_err(|e| {
                AgentError::BusUnavailable(format!(
                    "cache put {}[{key}] failed: {e}",
                    bucket.bucket_name()
                ))
            })
    }

    pub async fn get<T: DeserializeOwned>(
        &self,
        bucket: CacheBucket,
        key: &str,
    ) -> Result<Option<T>, AgentError> {
        let bytes = self.store(bucket).get(key.to_string()).await.map_err(|e| {
            AgentError::BusUnavailable(format!(
                "cache get {}[{key}] failed: {e}",
                bucket.bucket_name()
            ))
        })?;
        match bytes {
            None => Ok(None),
            Some(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|e| {
                AgentError::BusUnavailable(format!(
                    "cache decode {}[{key}] failed: {e}",
                    bucket.bucket_name()
                ))
            }),
        }
    }

    pub async fn delete(&self, bucket: CacheBucket, key: &str) -> Result<(), AgentError> {
        self.store(bucket).delete(key).await.map_err(|e| {
            AgentError::BusUnavailable(format!(
                "cache delete {}[{key}] failed: {e}",
                bucket.bucket_name()
            ))
        })
    }

    /// Watch every key in a bucket.
    pub async fn watch(&self, bucket: CacheBucket) -> Result<BucketWatch, AgentError> {
        let watch = self.store(bucket).watch_all().await.map_err(|e| {
            AgentError::BusUnavailable(format!("cache watch {} failed: {e}", bucket.bucket_name()))
        })?;
        Ok(BucketWatch { bucket, inner: watch })
    }
}

/// One observed mutation in a watched bucket. `value` is `None` for deletes
/// and purges.
pub struct BucketEvent {
    pub key: String,
    pub value: Option<serde_json::Value>,
}

pub struct BucketWatch {
    bucket: CacheBucket,
    inner: kv::Watch,
}

impl BucketWatch {
    pub async fn next(&mut self) -> Option<BucketEvent> {
        loop {
            let entry = match self.inner.next().await? {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(bucket = self.bucket.bucket_name(), error = %e, "kv watch error");
                    continue;
                }
            };
            let value = match entry.operation {
                kv::Operation::Put => match serde_json::from_slice(&entry.value) {
                    Ok(value) => Some(value),
                    Err(e) => {
                        warn!(
                            bucket = self.bucket.bucket_name(),
                            key = %entry.key,
                            error = %e,
                            "skipping undecodable kv entry"
                        );
                        continue;
                    }
                },
                kv::Operation::Delete | kv::Operation::Purge => None,
            };
            return Some(BucketEvent {
                key: entry.key,
                value,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_names() {
        assert_eq!(CacheBucket::Heartbeat.bucket_name(), "HEARTBEAT");
        assert_eq!(CacheBucket::RateLimitIp.bucket_name(), "RATE_LIMIT_IP");
    }

    #[test]
    fn test_bucket_ttl_selection() {
        let ttls = BucketTtls::default();
        assert_eq!(CacheBucket::Heartbeat.ttl(&ttls), ttls.heartbeat);
        assert_eq!(CacheBucket::OauthNonce.ttl(&ttls), ttls.oauth_nonce);
    }

    #[test]
    fn test_all_buckets_distinct() {
        use std::collections::HashSet;
        let names: HashSet<_> = CacheBucket::ALL.iter().map(|b| b.bucket_name()).collect();
        assert_eq!(names.len(), CacheBucket::ALL.len());
    }
}
