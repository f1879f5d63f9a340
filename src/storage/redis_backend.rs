//! Redis backend.
//!
//! Key naming under the tenant prefix:
//!
//! ```text
//! <prefix><cacheType>:<key>        content
//! <prefix><cacheType>:<key>:meta   metadata hash (size, createdAt, expiresAt)
//! <prefix>lru:<cacheType>          sorted set, score = last-access millis
//! <prefix>size:<cacheType>         total-bytes counter
//! ```
//!
//! The prefix is applied in exactly one place ([`RedisBackend::full_key`]);
//! nothing above this module ever prepends it, which is what keeps
//! double-prefix bugs out. Initialization runs a self-healing sweep that
//! migrates keys written under a doubled prefix or a legacy prefix variant
//! back to their canonical form.
//!
//! Writes pipeline content, metadata, LRU position, and the size delta in a
//! single round trip. Listing uses SCAN with a page size of 100, never KEYS.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{
    aio::{ConnectionManager, ConnectionManagerConfig, MultiplexedConnection},
    sentinel::{Sentinel, SentinelNodeConnectionInfo},
    FromRedisValue, IntoConnectionInfo, ProtocolVersion, RedisConnectionInfo, TlsMode,
};
use tokio::sync::Mutex;

use crate::config::RedisStorageConfig;

use super::{
    error::{StorageError, StorageResult},
    key_matches_pattern,
    keys::sanitize_key,
    policy::{CachePolicy, EVICTION_BATCH},
    CacheType, CleanupReport, EntryMetadata, StorageAdapter,
};

const META_SUFFIX: &str = ":meta";
const SCAN_COUNT: usize = 100;

/// Upper bound on keys migrated per self-healing run.
const MIGRATION_CAP: usize = 500;

/// Atomic increment that only stamps a TTL when the key has none, so the
/// rotation window is fixed rather than sliding.
const INCR_PRESERVE_TTL_SCRIPT: &str = r#"
local key = KEYS[1]
local delta = tonumber(ARGV[1])
local ttl = tonumber(ARGV[2])

local new_value = redis.call('INCRBY', key, delta)
if ttl > 0 and redis.call('TTL', key) < 0 then
    redis.call('EXPIRE', key, ttl)
end
return new_value
"#;

enum ConnectionStrategy {
    Standalone(ConnectionManager),
    Sentinel {
        sentinel: Mutex<Sentinel>,
        master_name: String,
        node_info: SentinelNodeConnectionInfo,
        /// Resolved master connection, reused across commands like the
        /// Standalone `ConnectionManager`. Dropped on connection-class
        /// errors so the next command re-resolves the master (failover).
        cached: Mutex<Option<MultiplexedConnection>>,
    },
}

enum Conn {
    Manager(ConnectionManager),
    Multiplexed(MultiplexedConnection),
}

pub struct RedisBackend {
    strategy: ConnectionStrategy,
    config: RedisStorageConfig,
    policy: CachePolicy,
}

impl RedisBackend {
    /// Connect according to the configuration: a managed multiplexed
    /// connection in standalone mode, master resolution through the
    /// sentinels otherwise.
    pub async fn connect(config: RedisStorageConfig, policy: CachePolicy) -> StorageResult<Self> {
        let strategy = match &config.sentinel {
            None => {
                let client = redis::Client::open(config.url())?;
                let manager_config = ConnectionManagerConfig::new()
                    .set_connection_timeout(Duration::from_secs(config.connect_timeout_secs))
                    .set_number_of_retries(config.retries as usize)
                    .set_factor(config.retry_base_delay_ms)
                    .set_max_delay(config.retry_max_delay_ms);
                let manager = ConnectionManager::new_with_config(client, manager_config).await?;
                ConnectionStrategy::Standalone(manager)
            }
            Some(sentinel_config) => {
                let nodes: Vec<_> = sentinel_config
                    .nodes
                    .iter()
                    .map(|node| format!("redis://{}", node).into_connection_info())
                    .collect::<Result<_, _>>()?;
                let sentinel = Sentinel::build(nodes)?;
                let node_info = SentinelNodeConnectionInfo {
                    tls_mode: None::<TlsMode>,
                    redis_connection_info: Some(RedisConnectionInfo {
                        db: config.db,
                        username: None,
                        password: config.password.clone(),
                        protocol: ProtocolVersion::RESP2,
                    }),
                };
                ConnectionStrategy::Sentinel {
                    sentinel: Mutex::new(sentinel),
                    master_name: sentinel_config.master_name.clone(),
                    node_info,
                    cached: Mutex::new(None),
                }
            }
        };

        Ok(Self {
            strategy,
            config,
            policy,
        })
    }

    // ─────────────────────────────────────────────────────────────────────
    // Key naming. `full_key` is the single place the tenant prefix lands.
    // ─────────────────────────────────────────────────────────────────────

    fn full_key(&self, cache_type: CacheType, key: &str) -> String {
        format!("{}{}:{}", self.config.key_prefix, cache_type.as_str(), key)
    }

    fn meta_key(&self, cache_type: CacheType, key: &str) -> String {
        format!("{}{}", self.full_key(cache_type, key), META_SUFFIX)
    }

    fn lru_key(&self, cache_type: CacheType) -> String {
        format!("{}lru:{}", self.config.key_prefix, cache_type.as_str())
    }

    fn size_key(&self, cache_type: CacheType) -> String {
        format!("{}size:{}", self.config.key_prefix, cache_type.as_str())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Command execution with retry
    // ─────────────────────────────────────────────────────────────────────

    async fn connection(&self) -> StorageResult<Conn> {
        match &self.strategy {
            ConnectionStrategy::Standalone(manager) => Ok(Conn::Manager(manager.clone())),
            ConnectionStrategy::Sentinel {
                sentinel,
                master_name,
                node_info,
                cached,
            } => {
                if let Some(conn) = cached.lock().await.as_ref() {
                    return Ok(Conn::Multiplexed(conn.clone()));
                }

                let client = {
                    let mut guard = sentinel.lock().await;
                    guard.async_master_for(master_name, Some(node_info)).await?
                };
                let conn = client.get_multiplexed_async_connection().await?;
                *cached.lock().await = Some(conn.clone());
                Ok(Conn::Multiplexed(conn))
            }
        }
    }

    /// Drop the cached Sentinel master connection. The next command
    /// re-resolves the master through the sentinels. No-op in standalone
    /// mode, where the `ConnectionManager` reconnects on its own.
    async fn invalidate_connection(&self) {
        if let ConnectionStrategy::Sentinel { cached, .. } = &self.strategy {
            *cached.lock().await = None;
        }
    }

    fn retriable(err: &redis::RedisError) -> bool {
        err.is_io_error()
            || err.is_timeout()
            || err.is_connection_refusal()
            || err.is_connection_dropped()
            || err.is_cluster_error()
            // A demoted master answers writes with READONLY after failover.
            || err.kind() == redis::ErrorKind::ReadOnly
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let delay = self
            .config
            .retry_base_delay_ms
            .saturating_mul(1u64 << attempt.min(16))
            .min(self.config.retry_max_delay_ms);
        Duration::from_millis(delay)
    }

    async fn run_cmd<T: FromRedisValue>(&self, cmd: &redis::Cmd) -> StorageResult<T> {
        let mut attempt = 0u32;
        loop {
            let result = match self.connection().await {
                Ok(Conn::Manager(mut conn)) => cmd.query_async::<T>(&mut conn).await,
                Ok(Conn::Multiplexed(mut conn)) => cmd.query_async::<T>(&mut conn).await,
                Err(StorageError::Redis(e)) => Err(e),
                Err(other) => return Err(other),
            };
            match result {
                Ok(value) => return Ok(value),
                Err(e) if Self::retriable(&e) && attempt < self.config.retries => {
                    tracing::debug!(error = %e, attempt, "Redis command failed; retrying");
                    self.invalidate_connection().await;
                    tokio::time::sleep(self.backoff_delay(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn run_pipe<T: FromRedisValue>(&self, pipe: &redis::Pipeline) -> StorageResult<T> {
        let mut attempt = 0u32;
        loop {
            let result = match self.connection().await {
                Ok(Conn::Manager(mut conn)) => pipe.query_async::<T>(&mut conn).await,
                Ok(Conn::Multiplexed(mut conn)) => pipe.query_async::<T>(&mut conn).await,
                Err(StorageError::Redis(e)) => Err(e),
                Err(other) => return Err(other),
            };
            match result {
                Ok(value) => return Ok(value),
                Err(e) if Self::retriable(&e) && attempt < self.config.retries => {
                    tracing::debug!(error = %e, attempt, "Redis pipeline failed; retrying");
                    self.invalidate_connection().await;
                    tokio::time::sleep(self.backoff_delay(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Raw helpers used by the invalidation bus and the rotation counter
    // ─────────────────────────────────────────────────────────────────────

    /// Publish a message. Returns the number of receiving subscribers.
    pub async fn publish(&self, channel: &str, payload: &str) -> StorageResult<i64> {
        self.run_cmd(redis::cmd("PUBLISH").arg(channel).arg(payload))
            .await
    }

    /// Dedicated pub/sub connection for the invalidation subscriber.
    /// Subscriber-mode connections cannot issue ordinary commands, so this
    /// never shares the command connection.
    pub async fn pubsub(&self) -> StorageResult<redis::aio::PubSub> {
        let client = match &self.strategy {
            ConnectionStrategy::Standalone(_) => redis::Client::open(self.config.url())?,
            ConnectionStrategy::Sentinel {
                sentinel,
                master_name,
                node_info,
                ..
            } => {
                let mut guard = sentinel.lock().await;
                guard.async_master_for(master_name, Some(node_info)).await?
            }
        };
        Ok(client.get_async_pubsub().await?)
    }

    /// Increment a tenant-scoped counter, stamping `ttl` only on first use.
    pub async fn incr_counter(&self, name: &str, ttl: Duration) -> StorageResult<i64> {
        let full = format!("{}{}", self.config.key_prefix, name);
        let mut attempt = 0u32;
        let script = redis::Script::new(INCR_PRESERVE_TTL_SCRIPT);
        loop {
            let mut invocation = script.key(&full);
            let invocation = invocation.arg(1i64).arg(ttl.as_secs() as i64);
            let result = match self.connection().await {
                Ok(Conn::Manager(mut conn)) => invocation.invoke_async::<i64>(&mut conn).await,
                Ok(Conn::Multiplexed(mut conn)) => invocation.invoke_async::<i64>(&mut conn).await,
                Err(StorageError::Redis(e)) => Err(e),
                Err(other) => return Err(other),
            };
            match result {
                Ok(value) => return Ok(value),
                Err(e) if Self::retriable(&e) && attempt < self.config.retries => {
                    self.invalidate_connection().await;
                    tokio::time::sleep(self.backoff_delay(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Channel names the invalidation bus publishes and subscribes under:
    /// the canonical prefix plus every known variant, for interop across
    /// mixed deployments.
    pub fn channel_variants(&self, channel: &str) -> Vec<String> {
        let mut channels = vec![format!("{}{}", self.config.key_prefix, channel)];
        for variant in self.config.all_prefix_variants() {
            let candidate = format!("{}{}", variant, channel);
            if !channels.contains(&candidate) {
                channels.push(candidate);
            }
        }
        channels
    }

    // ─────────────────────────────────────────────────────────────────────
    // Scanning
    // ─────────────────────────────────────────────────────────────────────

    async fn scan_keys(&self, match_pattern: &str, cap: Option<usize>) -> StorageResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, page): (u64, Vec<String>) = self
                .run_cmd(
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(match_pattern)
                        .arg("COUNT")
                        .arg(SCAN_COUNT),
                )
                .await?;
            keys.extend(page);
            if let Some(cap) = cap {
                if keys.len() >= cap {
                    keys.truncate(cap);
                    break;
                }
            }
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(keys)
    }

    async fn read_meta(&self, meta_key: &str) -> StorageResult<Option<EntryMetadata>> {
        let fields: Vec<Option<String>> = self
            .run_cmd(
                redis::cmd("HMGET")
                    .arg(meta_key)
                    .arg("size")
                    .arg("createdAt")
                    .arg("expiresAt"),
            )
            .await?;

        let size = match fields.first().and_then(|f| f.as_ref()) {
            Some(raw) => raw.parse::<u64>().unwrap_or(0),
            None => return Ok(None),
        };
        let created_at = fields
            .get(1)
            .and_then(|f| f.as_ref())
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        let expires_at = fields
            .get(2)
            .and_then(|f| f.as_ref())
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.with_timezone(&Utc));

        Ok(Some(EntryMetadata {
            size,
            created_at,
            expires_at,
        }))
    }

    /// Evict oldest entries of a type until `need` bytes are freed or the
    /// LRU set is exhausted.
    async fn evict(&self, cache_type: CacheType, mut need: u64) -> StorageResult<CleanupReport> {
        let lru_key = self.lru_key(cache_type);
        let mut report = CleanupReport::default();

        while need > 0 {
            let batch: Vec<String> = self
                .run_cmd(
                    redis::cmd("ZRANGE")
                        .arg(&lru_key)
                        .arg(0)
                        .arg((EVICTION_BATCH - 1) as isize),
                )
                .await?;
            if batch.is_empty() {
                break;
            }

            for key in &batch {
                let meta_key = self.meta_key(cache_type, key);
                let size = self
                    .read_meta(&meta_key)
                    .await?
                    .map(|m| m.size)
                    .unwrap_or(0);

                let mut pipe = redis::pipe();
                pipe.cmd("DEL").arg(self.full_key(cache_type, key)).ignore();
                pipe.cmd("DEL").arg(&meta_key).ignore();
                pipe.cmd("ZREM").arg(&lru_key).arg(key).ignore();
                pipe.cmd("DECRBY")
                    .arg(self.size_key(cache_type))
                    .arg(size as i64)
                    .ignore();
                self.run_pipe::<()>(&pipe).await?;

                report.deleted += 1;
                report.bytes_freed += size;
                need = need.saturating_sub(size);
                if need == 0 {
                    break;
                }
            }
        }

        if report.deleted > 0 {
            tracing::debug!(
                cache_type = %cache_type,
                deleted = report.deleted,
                bytes_freed = report.bytes_freed,
                "Evicted oldest entries to satisfy size cap"
            );
        }
        Ok(report)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Prefix self-healing
    // ─────────────────────────────────────────────────────────────────────

    /// Migrate keys written under a doubled prefix (a legacy bug signature)
    /// or an alternative prefix variant to the canonical prefix. Capped at
    /// 500 keys per run; the next restart continues where this one stopped.
    ///
    /// Migration commands bypass `full_key` entirely: they operate on raw
    /// key names, so nothing here can be prefixed a second time.
    async fn heal_prefixes(&self) -> StorageResult<()> {
        let prefix = &self.config.key_prefix;
        let mut budget = MIGRATION_CAP;

        // Sweep 1: doubled canonical prefix.
        let doubled = format!("{prefix}{prefix}");
        let doubled_keys = self
            .scan_keys(&format!("{}*", glob_escape(&doubled)), Some(budget))
            .await?;
        for key in &doubled_keys {
            let target = key[prefix.len()..].to_string();
            self.migrate_key(key, &target).await?;
        }
        budget = budget.saturating_sub(doubled_keys.len());
        if !doubled_keys.is_empty() {
            tracing::info!(
                migrated = doubled_keys.len(),
                "Healed keys written under a doubled prefix"
            );
        }

        // Sweep 2: alternative prefix variants.
        for variant in self.config.all_prefix_variants() {
            if budget == 0 {
                tracing::warn!(
                    cap = MIGRATION_CAP,
                    "Prefix migration cap reached; remaining keys migrate on next run"
                );
                break;
            }
            let candidates = self
                .scan_keys(&format!("{}*", glob_escape(&variant)), Some(budget))
                .await?;
            let mut migrated = 0usize;
            for key in &candidates {
                // A no-colon variant's scan also matches canonical keys.
                if key.starts_with(prefix.as_str()) {
                    continue;
                }
                let remainder = &key[variant.len()..];
                let remainder = remainder.strip_prefix(':').unwrap_or(remainder);
                if !Self::belongs_to_core(remainder) {
                    continue;
                }
                let target = format!("{prefix}{remainder}");
                self.migrate_key(key, &target).await?;
                migrated += 1;
            }
            budget = budget.saturating_sub(migrated);
            if migrated > 0 {
                tracing::info!(variant = %variant, migrated, "Migrated keys from prefix variant");
            }
        }

        Ok(())
    }

    /// Whether an unprefixed key name belongs to this core's keyspace.
    fn belongs_to_core(remainder: &str) -> bool {
        CacheType::ALL
            .iter()
            .any(|t| remainder.starts_with(&format!("{}:", t.as_str())))
            || remainder.starts_with("lru:")
            || remainder.starts_with("size:")
            || remainder.starts_with("keyrotation:")
    }

    /// Rename `from` to `to` unless the target already exists, in which case
    /// the duplicate is dropped.
    async fn migrate_key(&self, from: &str, to: &str) -> StorageResult<()> {
        let exists: i64 = self.run_cmd(redis::cmd("EXISTS").arg(to)).await?;
        if exists > 0 {
            let _: () = self.run_cmd(redis::cmd("DEL").arg(from)).await?;
        } else {
            let _: () = self.run_cmd(redis::cmd("RENAME").arg(from).arg(to)).await?;
        }
        Ok(())
    }
}

/// Escape glob metacharacters so a prefix is matched literally by SCAN.
fn glob_escape(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[async_trait]
impl StorageAdapter for RedisBackend {
    async fn initialize(&self) -> StorageResult<()> {
        let pong: String = self.run_cmd(&redis::cmd("PING")).await?;
        if pong != "PONG" {
            return Err(StorageError::Unavailable(format!(
                "unexpected PING reply: {pong}"
            )));
        }

        if self.config.migration_enabled() {
            self.heal_prefixes().await?;
        } else {
            tracing::debug!("Prefix migration disabled for this tenant");
        }
        Ok(())
    }

    async fn get(&self, key: &str, cache_type: CacheType) -> StorageResult<Option<Vec<u8>>> {
        let key = sanitize_key(key)?;
        let full = self.full_key(cache_type, &key);

        let value: Option<Vec<u8>> = self.run_cmd(redis::cmd("GET").arg(&full)).await?;
        let Some(value) = value else {
            return Ok(None);
        };

        // LRU bump rides on the hit; failures here must not fail the read.
        let now = Utc::now().timestamp_millis();
        let bump: StorageResult<()> = self
            .run_cmd(
                redis::cmd("ZADD")
                    .arg(self.lru_key(cache_type))
                    .arg(now)
                    .arg(&key),
            )
            .await;
        if let Err(e) = bump {
            tracing::debug!(error = %e, "LRU bump failed on read");
        }

        Ok(Some(value))
    }

    async fn set(
        &self,
        key: &str,
        value: &[u8],
        cache_type: CacheType,
        ttl: Option<Duration>,
    ) -> StorageResult<()> {
        let key = sanitize_key(key)?;
        let full = self.full_key(cache_type, &key);
        let meta_key = self.meta_key(cache_type, &key);
        let ttl = self.policy.effective_ttl(cache_type, ttl);
        let new_size = value.len() as u64;

        let existing = self.read_meta(&meta_key).await?;
        let old_size = existing.as_ref().map(|m| m.size).unwrap_or(0);

        let current: Option<i64> = self
            .run_cmd(redis::cmd("GET").arg(self.size_key(cache_type)))
            .await?;
        let current = current.unwrap_or(0).max(0) as u64;
        let need = self
            .policy
            .bytes_to_free(cache_type, current.saturating_sub(old_size), new_size);
        if need > 0 {
            self.evict(cache_type, need).await?;
        }

        let now = Utc::now();
        let created_at = existing.map(|m| m.created_at).unwrap_or(now);
        let expires_at =
            ttl.map(|d| now + chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero()));
        let delta = new_size as i64 - old_size as i64;

        let mut pipe = redis::pipe();
        match ttl {
            Some(ttl) if ttl.as_secs() > 0 => {
                pipe.cmd("SETEX")
                    .arg(&full)
                    .arg(ttl.as_secs())
                    .arg(value)
                    .ignore();
            }
            _ => {
                pipe.cmd("SET").arg(&full).arg(value).ignore();
            }
        }
        {
            let mut hset = pipe.cmd("HSET");
            hset.arg(&meta_key)
                .arg("size")
                .arg(new_size)
                .arg("createdAt")
                .arg(created_at.to_rfc3339());
            if let Some(expires_at) = expires_at {
                hset.arg("expiresAt").arg(expires_at.to_rfc3339());
            }
            hset.ignore();
        }
        if let Some(ttl) = ttl {
            if ttl.as_secs() > 0 {
                pipe.cmd("EXPIRE").arg(&meta_key).arg(ttl.as_secs()).ignore();
            }
        }
        pipe.cmd("ZADD")
            .arg(self.lru_key(cache_type))
            .arg(now.timestamp_millis())
            .arg(&key)
            .ignore();
        pipe.cmd("INCRBY")
            .arg(self.size_key(cache_type))
            .arg(delta)
            .ignore();

        self.run_pipe::<()>(&pipe).await
    }

    async fn delete(&self, key: &str, cache_type: CacheType) -> StorageResult<bool> {
        let key = sanitize_key(key)?;
        let full = self.full_key(cache_type, &key);
        let meta_key = self.meta_key(cache_type, &key);

        let old_size = self
            .read_meta(&meta_key)
            .await?
            .map(|m| m.size)
            .unwrap_or(0);

        let mut pipe = redis::pipe();
        pipe.cmd("DEL").arg(&full);
        pipe.cmd("DEL").arg(&meta_key).ignore();
        pipe.cmd("ZREM")
            .arg(self.lru_key(cache_type))
            .arg(&key)
            .ignore();
        pipe.cmd("DECRBY")
            .arg(self.size_key(cache_type))
            .arg(old_size as i64)
            .ignore();

        let (deleted,): (i64,) = self.run_pipe(&pipe).await?;
        Ok(deleted > 0)
    }

    async fn exists(&self, key: &str, cache_type: CacheType) -> StorageResult<bool> {
        let key = sanitize_key(key)?;
        let exists: i64 = self
            .run_cmd(redis::cmd("EXISTS").arg(self.full_key(cache_type, &key)))
            .await?;
        Ok(exists > 0)
    }

    async fn list(&self, cache_type: CacheType, pattern: &str) -> StorageResult<Vec<String>> {
        let type_prefix = format!("{}{}:", self.config.key_prefix, cache_type.as_str());
        let scanned = self
            .scan_keys(&format!("{}*", glob_escape(&type_prefix)), None)
            .await?;

        let mut keys: Vec<String> = scanned
            .into_iter()
            .filter(|k| !k.ends_with(META_SUFFIX))
            .map(|k| k[type_prefix.len()..].to_string())
            .filter(|k| key_matches_pattern(k, pattern))
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn size(&self, cache_type: CacheType) -> StorageResult<u64> {
        let size: Option<i64> = self
            .run_cmd(redis::cmd("GET").arg(self.size_key(cache_type)))
            .await?;
        Ok(size.unwrap_or(0).max(0) as u64)
    }

    async fn metadata(
        &self,
        key: &str,
        cache_type: CacheType,
    ) -> StorageResult<Option<EntryMetadata>> {
        let key = sanitize_key(key)?;
        match self.read_meta(&self.meta_key(cache_type, &key)).await? {
            Some(meta) if meta.is_expired() => Ok(None),
            other => Ok(other),
        }
    }

    async fn cleanup(&self, cache_type: CacheType) -> StorageResult<CleanupReport> {
        let mut report = CleanupReport::default();
        let type_prefix = format!("{}{}:", self.config.key_prefix, cache_type.as_str());
        let scanned = self
            .scan_keys(&format!("{}*", glob_escape(&type_prefix)), None)
            .await?;

        let mut content_keys: Vec<String> = Vec::new();
        let mut meta_keys: Vec<String> = Vec::new();
        for key in scanned {
            match key.strip_suffix(META_SUFFIX) {
                Some(base) => meta_keys.push(base.to_string()),
                None => content_keys.push(key),
            }
        }

        // Metadata hashes whose content expired out from under them.
        for base in &meta_keys {
            if !content_keys.contains(base) {
                let _: () = self
                    .run_cmd(redis::cmd("DEL").arg(format!("{base}{META_SUFFIX}")))
                    .await?;
                report.deleted += 1;
            }
        }

        // Content without metadata is an orphan from an interrupted write.
        let mut live_total = 0u64;
        let lru_key = self.lru_key(cache_type);
        for full in &content_keys {
            let raw_key = full[type_prefix.len()..].to_string();
            let meta = self.read_meta(&self.meta_key(cache_type, &raw_key)).await?;
            match meta {
                Some(meta) => live_total += meta.size,
                None => {
                    let size: i64 = self.run_cmd(redis::cmd("STRLEN").arg(full)).await?;
                    let mut pipe = redis::pipe();
                    pipe.cmd("DEL").arg(full).ignore();
                    pipe.cmd("ZREM").arg(&lru_key).arg(&raw_key).ignore();
                    self.run_pipe::<()>(&pipe).await?;
                    report.deleted += 1;
                    report.bytes_freed += size.max(0) as u64;
                }
            }
        }

        // LRU members pointing at vanished content.
        let members: Vec<String> = self
            .run_cmd(redis::cmd("ZRANGE").arg(&lru_key).arg(0).arg(-1))
            .await?;
        for member in members {
            let full = self.full_key(cache_type, &member);
            if !content_keys.contains(&full) {
                let _: () = self
                    .run_cmd(redis::cmd("ZREM").arg(&lru_key).arg(&member))
                    .await?;
            }
        }

        // Resync the counter to the surviving entries, then re-enforce the cap.
        let _: () = self
            .run_cmd(
                redis::cmd("SET")
                    .arg(self.size_key(cache_type))
                    .arg(live_total),
            )
            .await?;
        let limit = self.policy.size_limit(cache_type);
        if live_total > limit {
            let evicted = self
                .evict(cache_type, live_total - self.policy.eviction_target(cache_type))
                .await?;
            report.deleted += evicted.deleted;
            report.bytes_freed += evicted.bytes_freed;
        }

        Ok(report)
    }

    async fn health_check(&self) -> bool {
        matches!(
            self.run_cmd::<String>(&redis::cmd("PING")).await,
            Ok(ref pong) if pong == "PONG"
        )
    }

    async fn close(&self) -> StorageResult<()> {
        // Multiplexed connections close when dropped; nothing to flush.
        Ok(())
    }

    fn as_redis(&self) -> Option<&RedisBackend> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use testcontainers_modules::{
        redis::Redis,
        testcontainers::{runners::AsyncRunner, ContainerAsync},
    };

    use super::*;
    use crate::config::CacheLimitsConfig;

    #[test]
    fn glob_escaping_neutralizes_metacharacters() {
        assert_eq!(glob_escape("a*b?c[d]e\\f"), "a\\*b\\?c\\[d\\]e\\\\f");
        assert_eq!(glob_escape("submaker:"), "submaker:");
    }

    #[test]
    fn core_keyspace_detection() {
        assert!(RedisBackend::belongs_to_core("session:abcd"));
        assert!(RedisBackend::belongs_to_core("lru:subtitle"));
        assert!(RedisBackend::belongs_to_core("size:smdb"));
        assert!(RedisBackend::belongs_to_core("keyrotation:deadbeef"));
        assert!(!RedisBackend::belongs_to_core("other-app:counter"));
    }

    // Integration tests use testcontainers for Redis
    // Run with: cargo test -- --ignored

    /// Start a Redis container. The container stays alive as long as the
    /// returned handle is held.
    async fn start_redis() -> (String, u16, ContainerAsync<Redis>) {
        let container = Redis::default()
            .start()
            .await
            .expect("Failed to start Redis container");

        let host = container
            .get_host()
            .await
            .expect("Failed to get host")
            .to_string();
        let port = container
            .get_host_port_ipv4(6379)
            .await
            .expect("Failed to get port");

        (host, port, container)
    }

    fn test_config(host: &str, port: u16, prefix: &str) -> RedisStorageConfig {
        RedisStorageConfig {
            host: host.to_string(),
            port,
            key_prefix: prefix.to_string(),
            prefix_migration: Some(true),
            ..Default::default()
        }
    }

    async fn connect_backend(config: RedisStorageConfig, subtitle_cap: u64) -> RedisBackend {
        let policy = CachePolicy::new(CacheLimitsConfig {
            subtitle_bytes: subtitle_cap,
            subtitle_ttl_secs: None,
            ..Default::default()
        });
        RedisBackend::connect(config, policy)
            .await
            .expect("Failed to connect to Redis container")
    }

    /// Unprefixed client for planting and inspecting raw keys.
    async fn raw_conn(host: &str, port: u16) -> MultiplexedConnection {
        redis::Client::open(format!("redis://{host}:{port}"))
            .expect("Failed to build raw client")
            .get_multiplexed_async_connection()
            .await
            .expect("Failed to open raw connection")
    }

    #[tokio::test]
    #[ignore = "Requires Docker - run with `cargo test -- --ignored`"]
    async fn write_pipeline_roundtrip_and_accounting() {
        let (host, port, _container) = start_redis().await;
        let backend = connect_backend(test_config(&host, port, "t1:"), 1_000_000).await;
        backend.initialize().await.unwrap();

        backend
            .set("tt0111161:eng", b"WEBVTT payload", CacheType::Subtitle, None)
            .await
            .unwrap();

        let value = backend
            .get("tt0111161:eng", CacheType::Subtitle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(value, b"WEBVTT payload");
        assert!(backend.exists("tt0111161:eng", CacheType::Subtitle).await.unwrap());

        let meta = backend
            .metadata("tt0111161:eng", CacheType::Subtitle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(meta.size, 14);
        assert_eq!(backend.size(CacheType::Subtitle).await.unwrap(), 14);

        // Update shrinks the entry: createdAt preserved, counter follows
        // the delta.
        backend
            .set("tt0111161:eng", b"01234", CacheType::Subtitle, None)
            .await
            .unwrap();
        let updated = backend
            .metadata("tt0111161:eng", CacheType::Subtitle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.created_at, meta.created_at);
        assert_eq!(updated.size, 5);
        assert_eq!(backend.size(CacheType::Subtitle).await.unwrap(), 5);

        // Listing strips the prefix and cache type, and hides the sidecar.
        let keys = backend.list(CacheType::Subtitle, "*").await.unwrap();
        assert_eq!(keys, vec!["tt0111161:eng".to_string()]);

        assert!(backend.delete("tt0111161:eng", CacheType::Subtitle).await.unwrap());
        assert!(!backend.delete("tt0111161:eng", CacheType::Subtitle).await.unwrap());
        assert_eq!(backend.size(CacheType::Subtitle).await.unwrap(), 0);
        assert!(backend
            .get("tt0111161:eng", CacheType::Subtitle)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    #[ignore = "Requires Docker - run with `cargo test -- --ignored`"]
    async fn eviction_brings_total_under_target() {
        let (host, port, _container) = start_redis().await;
        let backend = connect_backend(test_config(&host, port, "t2:"), 1_000).await;
        backend.initialize().await.unwrap();

        for i in 0..10 {
            backend
                .set(&format!("k{i}"), &[0u8; 200], CacheType::Subtitle, None)
                .await
                .unwrap();
        }

        // Cap 1000, target 800: the counter settles at or below the target
        // and the oldest keys are the ones that went.
        let total = backend.size(CacheType::Subtitle).await.unwrap();
        assert!(total <= 800, "size {total} exceeds eviction target");
        assert!(backend.get("k0", CacheType::Subtitle).await.unwrap().is_none());
        assert!(backend.get("k9", CacheType::Subtitle).await.unwrap().is_some());
    }

    #[tokio::test]
    #[ignore = "Requires Docker - run with `cargo test -- --ignored`"]
    async fn cleanup_sweeps_orphans_and_resyncs_counter() {
        let (host, port, _container) = start_redis().await;
        let backend = connect_backend(test_config(&host, port, "t3:"), 1_000_000).await;
        backend.initialize().await.unwrap();

        backend
            .set("kept", b"data", CacheType::Subtitle, None)
            .await
            .unwrap();

        let mut raw = raw_conn(&host, port).await;
        // Content with no metadata: the residue of an interrupted write.
        let _: () = redis::cmd("SET")
            .arg("t3:subtitle:ghost")
            .arg("zzzz")
            .query_async(&mut raw)
            .await
            .unwrap();
        // A sidecar whose content expired out from under it.
        let _: () = redis::cmd("HSET")
            .arg("t3:subtitle:phantom:meta")
            .arg("size")
            .arg(4)
            .arg("createdAt")
            .arg("2024-01-01T00:00:00+00:00")
            .query_async(&mut raw)
            .await
            .unwrap();

        let report = backend.cleanup(CacheType::Subtitle).await.unwrap();
        assert!(report.deleted >= 2);

        assert!(!backend.exists("ghost", CacheType::Subtitle).await.unwrap());
        let phantom_meta: i64 = redis::cmd("EXISTS")
            .arg("t3:subtitle:phantom:meta")
            .query_async(&mut raw)
            .await
            .unwrap();
        assert_eq!(phantom_meta, 0);

        // Counter resynced to the surviving entry.
        assert!(backend.get("kept", CacheType::Subtitle).await.unwrap().is_some());
        assert_eq!(backend.size(CacheType::Subtitle).await.unwrap(), 4);
    }

    #[tokio::test]
    #[ignore = "Requires Docker - run with `cargo test -- --ignored`"]
    async fn doubled_prefix_keys_are_healed_on_initialize() {
        let (host, port, _container) = start_redis().await;
        let mut raw = raw_conn(&host, port).await;

        // Doubled prefix with no canonical counterpart: must be renamed.
        let _: () = redis::cmd("SET")
            .arg("pfx:pfx:session:aaaa")
            .arg("legacy-a")
            .query_async(&mut raw)
            .await
            .unwrap();
        // Doubled prefix where the canonical key already exists: the
        // duplicate must be dropped and the canonical value kept.
        let _: () = redis::cmd("SET")
            .arg("pfx:pfx:session:bbbb")
            .arg("stale")
            .query_async(&mut raw)
            .await
            .unwrap();
        let _: () = redis::cmd("SET")
            .arg("pfx:session:bbbb")
            .arg("canonical")
            .query_async(&mut raw)
            .await
            .unwrap();

        let backend = connect_backend(test_config(&host, port, "pfx:"), 1_000_000).await;
        backend.initialize().await.unwrap();

        // Rename branch.
        let migrated: Option<String> = redis::cmd("GET")
            .arg("pfx:session:aaaa")
            .query_async(&mut raw)
            .await
            .unwrap();
        assert_eq!(migrated.as_deref(), Some("legacy-a"));
        let doubled_a: i64 = redis::cmd("EXISTS")
            .arg("pfx:pfx:session:aaaa")
            .query_async(&mut raw)
            .await
            .unwrap();
        assert_eq!(doubled_a, 0);

        // Delete-duplicate branch.
        let kept: Option<String> = redis::cmd("GET")
            .arg("pfx:session:bbbb")
            .query_async(&mut raw)
            .await
            .unwrap();
        assert_eq!(kept.as_deref(), Some("canonical"));
        let doubled_b: i64 = redis::cmd("EXISTS")
            .arg("pfx:pfx:session:bbbb")
            .query_async(&mut raw)
            .await
            .unwrap();
        assert_eq!(doubled_b, 0);
    }

    #[tokio::test]
    #[ignore = "Requires Docker - run with `cargo test -- --ignored`"]
    async fn variant_prefix_keys_migrate_and_foreign_keys_survive() {
        let (host, port, _container) = start_redis().await;
        let mut raw = raw_conn(&host, port).await;

        let _: () = redis::cmd("SET")
            .arg("legacy:session:cccc")
            .arg("from-variant")
            .query_async(&mut raw)
            .await
            .unwrap();
        // Under the variant prefix but outside this core's keyspace.
        let _: () = redis::cmd("SET")
            .arg("legacy:other-app:thing")
            .arg("foreign")
            .query_async(&mut raw)
            .await
            .unwrap();

        let config = RedisStorageConfig {
            prefix_variants: vec!["legacy:".to_string()],
            ..test_config(&host, port, "tenant:")
        };
        let backend = connect_backend(config, 1_000_000).await;
        backend.initialize().await.unwrap();

        let migrated: Option<String> = redis::cmd("GET")
            .arg("tenant:session:cccc")
            .query_async(&mut raw)
            .await
            .unwrap();
        assert_eq!(migrated.as_deref(), Some("from-variant"));
        let old: i64 = redis::cmd("EXISTS")
            .arg("legacy:session:cccc")
            .query_async(&mut raw)
            .await
            .unwrap();
        assert_eq!(old, 0);

        let foreign: i64 = redis::cmd("EXISTS")
            .arg("legacy:other-app:thing")
            .query_async(&mut raw)
            .await
            .unwrap();
        assert_eq!(foreign, 1);
    }
}
