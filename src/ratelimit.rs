//! Windowed rate limiting over the cache buckets.
//!
//! Counters are consumed by the control plane as well, so they live in the
//! shared `RATE_LIMIT_KEY` / `RATE_LIMIT_IP` buckets rather than in process
//! memory. Expired windows are reclaimed by the bucket TTL; the limiter
//! itself is an owned component created and dropped by the coordinator, not
//! a process-wide singleton.

use crate::cache::{CacheBucket, CacheService};
use crate::error::AgentError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Default ceiling: 5 calls per 5-minute window.
pub const DEFAULT_MAX_CALLS: u32 = 5;
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(300);

/// Counter state for one key's current window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowState {
    pub count: u32,
    pub window_started_ms: i64,
}

/// Pure window arithmetic: given the previous state, decide whether this
/// call is admitted and what the next state is.
pub fn decide(
    prev: Option<WindowState>,
    now_ms: i64,
    max_calls: u32,
    window_ms: i64,
) -> (WindowState, bool) {
    match prev {
        Some(state) if now_ms - state.window_started_ms < window_ms => {
            if state.count < max_calls {
                (
                    WindowState {
                        count: state.count + 1,
                        window_started_ms: state.window_started_ms,
                    },
                    true,
                )
            } else {
                (state, false)
            }
        }
        // No prior window, or the prior window expired: start fresh.
        _ => (
            WindowState {
                count: 1,
                window_started_ms: now_ms,
            },
            true,
        ),
    }
}

pub struct RateLimiter {
    cache: Arc<CacheService>,
    max_calls: u32,
    window: Duration,
}

impl RateLimiter {
    pub fn new(cache: Arc<CacheService>) -> Self {
        Self {
            cache,
            max_calls: DEFAULT_MAX_CALLS,
            window: DEFAULT_WINDOW,
        }
    }

    pub fn with_limits(cache: Arc<CacheService>, max_calls: u32, window: Duration) -> Self {
        Self {
            cache,
            max_calls,
            window,
        }
    }

    /// Per-credential admission check.
    pub async fn check_key(&self, key: &str) -> Result<bool, AgentError> {
        self.check(CacheBucket::RateLimitKey, key).await
    }

    /// Per-source-address admission check.
    pub async fn check_ip(&self, ip: &str) -> Result<bool, AgentError> {
        self.check(CacheBucket::RateLimitIp, ip).await
    }

    async fn check(&self, bucket: CacheBucket, key: &str) -> Result<bool, AgentError> {
        let prev: Option<WindowState> = self.cache.get(bucket, key).await?;
        let now_ms = chrono::Utc::now().timestamp_millis();
        let (next, allowed) = decide(prev, now_ms, self.max_calls, self.window.as_millis() as i64);
        if allowed {
            self.cache.put(bucket, key, &next).await?;
        } else {
            debug!(key, bucket = bucket.bucket_name(), "rate limit exceeded");
        }
        Ok(allowed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW_MS: i64 = 300_000;

    #[test]
    fn test_cold_start_admits_first_five() {
        let mut prev = None;
        for n in 1..=5u32 {
            let (next, allowed) = decide(prev, 1_000, DEFAULT_MAX_CALLS, WINDOW_MS);
            assert!(allowed, "call {n} should be admitted");
            assert_eq!(next.count, n);
            prev = Some(next);
        }
    }

    #[test]
    fn test_sixth_call_rejected_until_window_expires() {
        let mut prev = None;
        for _ in 0..5 {
            let (next, _) = decide(prev, 1_000, DEFAULT_MAX_CALLS, WINDOW_MS);
            prev = Some(next);
        }

        let (state, allowed) = decide(prev, 2_000, DEFAULT_MAX_CALLS, WINDOW_MS);
        assert!(!allowed);
        assert_eq!(state.count, 5);

        // Still inside the window.
        let (_, allowed) = decide(Some(state), 1_000 + WINDOW_MS - 1, DEFAULT_MAX_CALLS, WINDOW_MS);
        assert!(!allowed);

        // Window expired: counter resets.
        let (next, allowed) = decide(Some(state), 1_000 + WINDOW_MS, DEFAULT_MAX_CALLS, WINDOW_MS);
        assert!(allowed);
        assert_eq!(next.count, 1);
        assert_eq!(next.window_started_ms, 1_000 + WINDOW_MS);
    }

    #[test]
    fn test_window_start_pins_to_first_call() {
        let (first, _) = decide(None, 5_000, DEFAULT_MAX_CALLS, WINDOW_MS);
        let (second, _) = decide(Some(first), 9_000, DEFAULT_MAX_CALLS, WINDOW_MS);
        assert_eq!(second.window_started_ms, 5_000);
        assert_eq!(second.count, 2);
    }
}
