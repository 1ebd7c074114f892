//! Heartbeat presence.
//!
//! After authentication the runtime writes its presence entry into the
//! heartbeat bucket immediately, then on every interval tick. The entry is
//! deleted on shutdown. Staleness policy (who treats a peer as gone) belongs
//! to the control plane; the runtime never evicts anyone, itself included.

use crate::auth::Identity;
use crate::cache::{CacheBucket, CacheService};
use crate::error::AgentError;
use crate::types::IdentityId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Presence entry: `{i: identity id, t: unix millis}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatEntry {
    #[serde(rename = "i")]
    pub id: IdentityId,
    #[serde(rename = "t")]
    pub at_ms: i64,
}

impl HeartbeatEntry {
    pub fn now(id: IdentityId) -> Self {
        Self {
            id,
            at_ms: chrono::Utc::now().timestamp_millis(),
        }
    }
}

pub struct HealthService {
    cache: Arc<CacheService>,
    identity: Arc<Identity>,
    interval: Duration,
    beat_task: Option<JoinHandle<()>>,
}

impl HealthService {
    pub fn new(cache: Arc<CacheService>, identity: Arc<Identity>, interval: Duration) -> Self {
        Self {
            cache,
            identity,
            interval,
            beat_task: None,
        }
    }

    /// Write the first presence entry, then keep beating in the background.
    pub async fn start(&mut self) -> Result<(), AgentError> {
        beat(&self.cache, &self.identity).await?;

        let cache = self.cache.clone();
        let identity = self.identity.clone();
        let period = self.interval;
        self.beat_task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately and would double the initial
            // write.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = beat(&cache, &identity).await {
                    warn!(error = %e, "heartbeat write failed");
                }
            }
        }));
        debug!(interval = ?self.interval, "heartbeat started");
        Ok(())
    }

    /// Stop beating and clear the presence entry.
    pub async fn stop(&mut self) {
        if let Some(task) = self.beat_task.take() {
            task.abort();
        }
        if let Err(e) = self
            .cache
            .delete(CacheBucket::Heartbeat, self.identity.id.as_str())
            .await
        {
            warn!(error = %e, "could not clear heartbeat entry");
        }
        debug!("heartbeat stopped");
    }
}

async fn beat(cache: &CacheService, identity: &Identity) -> Result<(), AgentError> {
    let entry = HeartbeatEntry::now(identity.id.clone());
    cache
        .put(CacheBucket::Heartbeat, identity.id.as_str(), &entry)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_wire_format_is_compact() {
        let entry = HeartbeatEntry {
            id: IdentityId::new("rt-1"),
            at_ms: 1_700_000_000_000,
        };
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["i"], "rt-1");
        assert_eq!(value["t"], 1_700_000_000_000i64);
        assert_eq!(value.as_object().unwrap().len(), 2);
    }

    #[test]
    fn test_entry_now_uses_current_clock() {
        let before = chrono::Utc::now().timestamp_millis();
        let entry = HeartbeatEntry::now(IdentityId::new("rt-1"));
        let after = chrono::Utc::now().timestamp_millis();
        assert!(entry.at_ms >= before && entry.at_ms <= after);
    }
}
