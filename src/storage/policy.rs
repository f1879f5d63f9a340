//! Cache policy layer: size caps, eviction targets, TTL defaults.
//!
//! Both backends consult the policy on every write. Eviction pulls batches
//! of oldest keys from the backend's LRU index until the post-write total is
//! at or below the eviction target.

use std::time::Duration;

use crate::config::CacheLimitsConfig;

use super::CacheType;

/// Number of oldest keys pulled from the LRU index per eviction round.
pub const EVICTION_BATCH: usize = 100;

/// Eviction target as a fraction of the size cap, in percent.
const EVICTION_TARGET_PERCENT: u64 = 80;

#[derive(Debug, Clone)]
pub struct CachePolicy {
    limits: CacheLimitsConfig,
}

impl CachePolicy {
    pub fn new(limits: CacheLimitsConfig) -> Self {
        Self { limits }
    }

    /// Size cap in bytes for a cache type.
    pub fn size_limit(&self, cache_type: CacheType) -> u64 {
        self.limits.size_limit(cache_type)
    }

    /// Post-eviction target for a cache type (80% of the cap).
    pub fn eviction_target(&self, cache_type: CacheType) -> u64 {
        self.size_limit(cache_type) * EVICTION_TARGET_PERCENT / 100
    }

    /// TTL to apply when the caller does not supply one.
    pub fn default_ttl(&self, cache_type: CacheType) -> Option<Duration> {
        self.limits.default_ttl(cache_type)
    }

    /// Resolve the effective TTL for a write.
    pub fn effective_ttl(&self, cache_type: CacheType, ttl: Option<Duration>) -> Option<Duration> {
        ttl.or_else(|| self.default_ttl(cache_type))
    }

    /// Bytes that must be freed before a write of `incoming` bytes lands,
    /// given `current` bytes already stored. Zero when the write fits.
    pub fn bytes_to_free(&self, cache_type: CacheType, current: u64, incoming: u64) -> u64 {
        let limit = self.size_limit(cache_type);
        if current.saturating_add(incoming) <= limit {
            return 0;
        }
        current
            .saturating_add(incoming)
            .saturating_sub(self.eviction_target(cache_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy_with_cap(cap: u64) -> CachePolicy {
        CachePolicy::new(CacheLimitsConfig {
            subtitle_bytes: cap,
            ..Default::default()
        })
    }

    #[test]
    fn no_eviction_under_cap() {
        let policy = policy_with_cap(1_000);
        assert_eq!(policy.bytes_to_free(CacheType::Subtitle, 500, 200), 0);
        assert_eq!(policy.bytes_to_free(CacheType::Subtitle, 800, 200), 0);
    }

    #[test]
    fn eviction_frees_down_to_target() {
        let policy = policy_with_cap(1_000);
        // 900 + 200 = 1100 over the cap; target is 800, so free 300.
        assert_eq!(policy.bytes_to_free(CacheType::Subtitle, 900, 200), 300);
    }

    #[test]
    fn caller_ttl_wins_over_default() {
        let policy = policy_with_cap(1_000);
        let ttl = policy.effective_ttl(CacheType::Subtitle, Some(Duration::from_secs(60)));
        assert_eq!(ttl, Some(Duration::from_secs(60)));
        assert!(policy.effective_ttl(CacheType::Subtitle, None).is_some());
        assert!(policy.effective_ttl(CacheType::Translation, None).is_none());
    }
}
