//! Round-robin selection over an AI-provider rotation key pool.
//!
//! Users with several API keys spread rate-limit load by rotating through
//! them per request. The rotation counter is keyed by a hash of the pool so
//! editing the pool restarts rotation cleanly. In Redis mode the counter is
//! shared across pods (`keyrotation:<poolHash>`, 24 h TTL); otherwise it is
//! process-local.

use std::{sync::Arc, time::Duration};

use dashmap::DashMap;
use sha2::{Digest, Sha256};

use crate::{model::UserConfig, storage::StorageAdapter};

const ROTATION_COUNTER_TTL: Duration = Duration::from_secs(24 * 60 * 60);

pub struct KeyRotator {
    storage: Arc<dyn StorageAdapter>,
    counters: DashMap<String, u64>,
}

impl KeyRotator {
    pub fn new(storage: Arc<dyn StorageAdapter>) -> Self {
        Self {
            storage,
            counters: DashMap::new(),
        }
    }

    /// Pick the API key for the next request.
    ///
    /// With rotation disabled or a pool of one, this is just the configured
    /// key. Otherwise keys are handed out round-robin: over R requests each
    /// of N keys is selected either ⌊R/N⌋ or ⌈R/N⌉ times.
    pub async fn select_api_key(&self, config: &UserConfig) -> Option<String> {
        let pool = &config.gemini_api_keys;
        if !config.key_rotation_enabled || pool.is_empty() {
            return config
                .gemini_api_key
                .clone()
                .or_else(|| pool.first().cloned());
        }
        if pool.len() == 1 {
            return pool.first().cloned();
        }

        let pool_id = pool_hash(pool);
        let counter = match self.storage.as_redis() {
            Some(redis) => {
                match redis
                    .incr_counter(&format!("keyrotation:{pool_id}"), ROTATION_COUNTER_TTL)
                    .await
                {
                    Ok(value) => value.max(1) as u64,
                    Err(e) => {
                        // Shared fairness degrades to per-pod fairness; a
                        // stalled rotation would be worse than a skewed one.
                        tracing::warn!(error = %e, "Rotation counter unavailable; using local counter");
                        self.local_incr(&pool_id)
                    }
                }
            }
            None => self.local_incr(&pool_id),
        };

        let index = ((counter - 1) as usize) % pool.len();
        pool.get(index).cloned()
    }

    fn local_incr(&self, pool_id: &str) -> u64 {
        let mut entry = self.counters.entry(pool_id.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Drop all process-local counters, restarting every rotation from the
    /// first key. Exposed for tests.
    pub fn reset(&self) {
        self.counters.clear();
    }
}

fn pool_hash(pool: &[String]) -> String {
    let joined = pool.join("|");
    hex::encode(Sha256::digest(joined.as_bytes()))[..16].to_string()
}
