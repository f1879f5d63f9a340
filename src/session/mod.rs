//! Session management: token issuance, envelope lifecycle, per-pod caches,
//! and cross-instance coherence.
//!
//! The manager owns the token-to-envelope binding. Envelopes live in the
//! configured storage backend; each pod additionally keeps a bounded LRU of
//! envelopes and a short-lived LRU of decrypted configs. Reads hand out
//! fresh clones so caller mutation can never leak across requests, and
//! every fire-and-forget persistence call is tracked so shutdown can await
//! it.

pub mod envelope;
mod invalidation;
mod rotation;
mod snapshot;

use std::{
    collections::HashMap,
    num::NonZeroUsize,
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::Utc;
pub use envelope::{generate_token, is_valid_token, SessionEnvelope};
pub use invalidation::{
    InvalidationAction, InvalidationBus, InvalidationMessage, INVALIDATION_CHANNEL,
};
use lru::LruCache;
use parking_lot::Mutex;
pub use rotation::KeyRotator;
pub use snapshot::SessionSnapshot;
use tokio::{sync::watch, task::JoinHandle};

use crate::{
    config::SessionConfig,
    crypto::CryptoService,
    events::{CoreEvent, EventBus},
    model::UserConfig,
    storage::{CacheType, StorageAdapter, StorageError, StorageExt},
};

use envelope::{config_fingerprint, integrity_hash, token_fingerprint};

/// Memory-cache hits older than this still refresh `lastAccessedAt` in
/// storage, keeping the sliding window honest without a write per read.
const ACCESS_REFRESH: Duration = Duration::from_secs(300);

const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(15 * 60);
const SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);
const SHUTDOWN_FLUSH_ATTEMPTS: u32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Crypto(#[from] crate::crypto::CryptoError),
}

pub type SessionResult<T> = Result<T, SessionError>;

struct CachedConfig {
    config: UserConfig,
    cached_at: Instant,
}

/// Tracks fire-and-forget persistence so shutdown can await it. Fire and
/// forget is never truly forget: a write that dies with the process is a
/// write peers already believe happened.
#[derive(Default)]
struct PendingWrites {
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl PendingWrites {
    fn track(&self, handle: JoinHandle<()>) {
        let mut handles = self.handles.lock();
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    fn take(&self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut *self.handles.lock())
    }
}

pub struct SessionManager {
    storage: Arc<dyn StorageAdapter>,
    crypto: Arc<CryptoService>,
    config: SessionConfig,
    events: EventBus,
    bus: Arc<InvalidationBus>,
    envelopes: Mutex<LruCache<String, SessionEnvelope>>,
    decrypted: Mutex<LruCache<String, CachedConfig>>,
    pending: PendingWrites,
    ready: watch::Sender<bool>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionManager {
    pub fn new(
        storage: Arc<dyn StorageAdapter>,
        crypto: Arc<CryptoService>,
        config: SessionConfig,
        events: EventBus,
        bus: Arc<InvalidationBus>,
    ) -> Arc<Self> {
        let envelope_cap = NonZeroUsize::new(config.memory_cache_entries)
            .unwrap_or(NonZeroUsize::MIN);
        let config_cap = NonZeroUsize::new(config.config_cache_entries)
            .unwrap_or(NonZeroUsize::MIN);
        let (ready, _) = watch::channel(false);

        Arc::new(Self {
            storage,
            crypto,
            config,
            events,
            bus,
            envelopes: Mutex::new(LruCache::new(envelope_cap)),
            decrypted: Mutex::new(LruCache::new(config_cap)),
            pending: PendingWrites::default(),
            ready,
            background: Mutex::new(Vec::new()),
        })
    }

    /// Restore from snapshot if the primary store is empty, preload when
    /// configured, start the invalidation listener, then open for business.
    pub async fn initialize(self: &Arc<Self>) -> SessionResult<()> {
        if self.config.snapshot_enabled {
            self.restore_snapshot_if_empty().await;
        }

        // Redis deployments default to lazy loading; sessions materialize
        // on first access. Filesystem mode always scans.
        if self.config.preload || self.storage.as_redis().is_none() {
            self.preload().await;
        }

        let weak = Arc::downgrade(self);
        self.bus
            .start(move |message| {
                if let Some(manager) = weak.upgrade() {
                    manager.handle_invalidation(&message);
                }
            })
            .await?;

        if self.config.snapshot_enabled {
            let manager = Arc::clone(self);
            let handle = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(SNAPSHOT_INTERVAL);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                ticker.tick().await; // immediate first tick
                loop {
                    ticker.tick().await;
                    if let Err(e) = manager.save_snapshot().await {
                        tracing::warn!(error = %e, "Periodic session snapshot failed");
                    }
                }
            });
            self.background.lock().push(handle);
        }

        let _ = self.ready.send(true);
        Ok(())
    }

    /// Await initialization. Every caller must pass through this before
    /// using the manager.
    pub async fn wait_until_ready(&self) {
        let mut rx = self.ready.subscribe();
        let _ = rx.wait_for(|ready| *ready).await;
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Session operations
    // ─────────────────────────────────────────────────────────────────────

    /// Issue a new session bound to `config`. The token only leaves this
    /// method after the envelope is durably stored; a persistence failure
    /// must not leave a token that exists in one pod's memory alone.
    pub async fn create(self: &Arc<Self>, config: UserConfig) -> SessionResult<String> {
        let mut config = config;
        config.normalize(self.config.max_api_keys);

        let token = generate_token();
        let tfp = token_fingerprint(&token);
        let fingerprint = config_fingerprint(&config);
        config.session_token = Some(token.clone());
        config.session_fingerprint = Some(tfp.clone());

        let sealed = self.crypto.encrypt_user_config(&config)?;
        let now = Utc::now();
        let envelope = SessionEnvelope {
            token: token.clone(),
            token_fingerprint: Some(tfp.clone()),
            config: sealed,
            fingerprint: Some(fingerprint.clone()),
            integrity: Some(integrity_hash(&token, &fingerprint)),
            created_at: now,
            last_accessed_at: now,
        };

        self.envelopes.lock().put(token.clone(), envelope.clone());
        if let Err(e) = self.persist_envelope(&envelope).await {
            self.envelopes.lock().pop(&token);
            self.decrypted.lock().pop(&token);
            return Err(e);
        }

        self.decrypted.lock().put(
            token.clone(),
            CachedConfig {
                config,
                cached_at: Instant::now(),
            },
        );
        self.events.publish(CoreEvent::SessionCreated {
            token_fingerprint: tfp.clone(),
            timestamp: now,
        });
        tracing::info!(session = %tfp, "Session created");
        Ok(token)
    }

    /// Resolve a token to its decrypted config. Returns a fresh clone per
    /// call. Any integrity violation discards the session outright.
    pub async fn get(self: &Arc<Self>, token: &str) -> SessionResult<Option<UserConfig>> {
        if !is_valid_token(token) {
            return Ok(None);
        }

        let config_ttl = Duration::from_secs(self.config.config_cache_ttl_secs);
        {
            let mut cache = self.decrypted.lock();
            if let Some(entry) = cache.get(token) {
                if entry.cached_at.elapsed() < config_ttl {
                    return Ok(Some(entry.config.clone()));
                }
                cache.pop(token);
            }
        }

        Ok(self
            .load_and_validate(token)
            .await?
            .map(|(_, config)| config))
    }

    /// Replace a session's config. Requires the session to exist. The
    /// refreshed envelope is persisted before either cache serves it, and
    /// peers are told to drop their copies.
    pub async fn update(self: &Arc<Self>, token: &str, config: UserConfig) -> SessionResult<bool> {
        if !is_valid_token(token) {
            return Ok(false);
        }
        let Some((existing, _)) = self.load_and_validate(token).await? else {
            return Ok(false);
        };

        let mut config = config;
        config.normalize(self.config.max_api_keys);
        let tfp = token_fingerprint(token);
        let fingerprint = config_fingerprint(&config);
        config.session_token = Some(token.to_string());
        config.session_fingerprint = Some(tfp.clone());

        let sealed = self.crypto.encrypt_user_config(&config)?;
        let now = Utc::now();
        let envelope = SessionEnvelope {
            token: token.to_string(),
            token_fingerprint: Some(tfp.clone()),
            config: sealed,
            fingerprint: Some(fingerprint.clone()),
            integrity: Some(integrity_hash(token, &fingerprint)),
            created_at: existing.created_at,
            last_accessed_at: now,
        };

        if let Err(e) = self.persist_envelope(&envelope).await {
            // This pod must not serve a write no peer can see.
            self.envelopes.lock().pop(token);
            self.decrypted.lock().pop(token);
            return Err(e);
        }

        self.envelopes.lock().put(token.to_string(), envelope);
        self.decrypted.lock().put(
            token.to_string(),
            CachedConfig {
                config,
                cached_at: Instant::now(),
            },
        );

        let bus = Arc::clone(&self.bus);
        let owned = token.to_string();
        self.pending.track(tokio::spawn(async move {
            bus.publish(InvalidationAction::Update, &owned).await;
        }));

        self.events.publish(CoreEvent::SessionUpdated {
            token_fingerprint: tfp,
            timestamp: now,
        });
        Ok(true)
    }

    /// Drop a session from both caches and schedule the storage delete and
    /// peer invalidation.
    pub async fn delete(self: &Arc<Self>, token: &str) -> SessionResult<()> {
        if !is_valid_token(token) {
            return Ok(());
        }
        self.envelopes.lock().pop(token);
        self.decrypted.lock().pop(token);

        let storage = Arc::clone(&self.storage);
        let bus = Arc::clone(&self.bus);
        let owned = token.to_string();
        self.pending.track(tokio::spawn(async move {
            if let Err(e) = storage.delete(&owned, CacheType::Session).await {
                tracing::warn!(error = %e, "Session delete did not reach storage");
            }
            bus.publish(InvalidationAction::Delete, &owned).await;
        }));

        self.events.publish(CoreEvent::SessionDeleted {
            token_fingerprint: token_fingerprint(token),
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Peer event: another pod rewrote or deleted this session. Drop local
    /// copies; the next read repopulates from storage.
    pub fn handle_invalidation(&self, message: &InvalidationMessage) {
        self.envelopes.lock().pop(&message.token);
        self.decrypted.lock().pop(&message.token);
        tracing::debug!(
            action = message.action.as_str(),
            instance = message.instance_id,
            "Dropped session caches on peer invalidation"
        );
    }

    // ─────────────────────────────────────────────────────────────────────
    // Load path
    // ─────────────────────────────────────────────────────────────────────

    /// Load an envelope from cache or storage and run the full validation
    /// chain. Backfillable gaps (legacy entries) are repaired and persisted;
    /// semantic mismatches discard the session.
    async fn load_and_validate(
        self: &Arc<Self>,
        token: &str,
    ) -> SessionResult<Option<(SessionEnvelope, UserConfig)>> {
        let cached = self.envelopes.lock().get(token).cloned();
        let from_memory = cached.is_some();
        let mut envelope = match cached {
            Some(envelope) => envelope,
            None => {
                match self
                    .storage
                    .get_json::<SessionEnvelope>(token, CacheType::Session)
                    .await
                {
                    Ok(Some(envelope)) => envelope,
                    Ok(None) => return Ok(None),
                    Err(StorageError::Deserialization(e)) => {
                        tracing::warn!(error = %e, "Malformed session payload; discarding");
                        self.discard(token).await;
                        return Ok(None);
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        };
        let mut needs_persist = false;

        // Outer identity first: the wrapper must name the requested token.
        if envelope.token != token {
            tracing::warn!("Stored session names a different token; discarding");
            self.discard(token).await;
            return Ok(None);
        }
        let expected_tfp = token_fingerprint(token);
        match &envelope.token_fingerprint {
            Some(tfp) if *tfp != expected_tfp => {
                tracing::warn!("Token fingerprint mismatch; discarding session");
                self.discard(token).await;
                return Ok(None);
            }
            Some(_) => {}
            None => {
                envelope.token_fingerprint = Some(expected_tfp.clone());
                needs_persist = true;
            }
        }

        let max_age = Duration::from_secs(self.config.max_age_secs);
        let skew = Duration::from_secs(self.config.clock_skew_tolerance_secs);
        if envelope.is_expired(max_age, skew) {
            tracing::debug!(session = %expected_tfp, "Session expired by inactivity");
            self.discard(token).await;
            return Ok(None);
        }

        // Decrypt-of-encrypted must succeed wholesale; a partially readable
        // config means a key mismatch or contamination, not a usable session.
        let was_encrypted = envelope.config.encrypted;
        let outcome = self.crypto.decrypt_user_config(&envelope.config);
        if !outcome.clean() {
            tracing::warn!(
                session = %expected_tfp,
                fields = ?outcome.warnings,
                "Session config failed decryption; discarding session"
            );
            self.discard(token).await;
            return Ok(None);
        }
        let mut config = outcome.config;
        if !was_encrypted {
            // Legacy plaintext entry; migrate it to the encrypted form.
            needs_persist = true;
        }

        // Inner identity: the payload must agree it belongs to this token.
        match &config.session_token {
            Some(embedded) if embedded != token => {
                tracing::warn!(
                    session = %expected_tfp,
                    "Embedded session token disagrees with storage key; discarding both layers"
                );
                self.discard(token).await;
                return Ok(None);
            }
            Some(_) => {}
            None => {
                config.session_token = Some(token.to_string());
                needs_persist = true;
            }
        }
        match &config.session_fingerprint {
            Some(embedded) if *embedded != expected_tfp => {
                tracing::warn!(session = %expected_tfp, "Embedded fingerprint mismatch; discarding");
                self.discard(token).await;
                return Ok(None);
            }
            Some(_) => {}
            None => {
                config.session_fingerprint = Some(expected_tfp.clone());
                needs_persist = true;
            }
        }

        let computed_fp = config_fingerprint(&config);
        match &envelope.fingerprint {
            Some(fp) if *fp != computed_fp => {
                tracing::warn!(session = %expected_tfp, "Config fingerprint drift; discarding");
                self.discard(token).await;
                return Ok(None);
            }
            Some(_) => {}
            None => {
                envelope.fingerprint = Some(computed_fp.clone());
                needs_persist = true;
            }
        }

        let expected_integrity = integrity_hash(token, &computed_fp);
        match &envelope.integrity {
            Some(integrity) if *integrity != expected_integrity => {
                tracing::warn!(session = %expected_tfp, "Integrity hash mismatch; discarding");
                self.discard(token).await;
                return Ok(None);
            }
            Some(_) => {}
            None => {
                envelope.integrity = Some(expected_integrity);
                needs_persist = true;
            }
        }

        // Sliding window: reads refresh lastAccessedAt. Memory hits debounce
        // the storage write.
        let now = Utc::now();
        let stale_access = now.signed_duration_since(envelope.last_accessed_at)
            > chrono::Duration::from_std(ACCESS_REFRESH).unwrap_or_else(|_| chrono::Duration::zero());
        let touch = !from_memory || stale_access;
        envelope.last_accessed_at = now;

        if needs_persist {
            // Upgrades must be written back, or every load pays this cost.
            envelope.config = self.crypto.encrypt_user_config(&config)?;
        }

        self.envelopes.lock().put(token.to_string(), envelope.clone());
        self.decrypted.lock().put(
            token.to_string(),
            CachedConfig {
                config: config.clone(),
                cached_at: Instant::now(),
            },
        );

        if needs_persist {
            self.spawn_persist(envelope.clone());
        } else if touch {
            // A pure access refresh merges into whatever is currently
            // stored, so it can never roll back a peer's newer write.
            self.spawn_touch(token.to_string());
        }

        Ok(Some((envelope, config)))
    }

    /// Remove an invalid session everywhere. Integrity failures translate
    /// to misses, never to errors.
    async fn discard(&self, token: &str) {
        self.envelopes.lock().pop(token);
        self.decrypted.lock().pop(token);
        if let Err(e) = self.storage.delete(token, CacheType::Session).await {
            tracing::warn!(error = %e, "Failed to delete discarded session from storage");
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Persistence
    // ─────────────────────────────────────────────────────────────────────

    fn storage_ttl(&self) -> Option<Duration> {
        if self.storage.as_redis().is_some() && !self.config.redis_ttl_enabled {
            return None;
        }
        Some(Duration::from_secs(self.config.max_age_secs))
    }

    async fn persist_envelope(&self, envelope: &SessionEnvelope) -> SessionResult<()> {
        self.storage
            .set_json(
                &envelope.token,
                envelope,
                CacheType::Session,
                self.storage_ttl(),
            )
            .await?;
        Ok(())
    }

    fn spawn_persist(self: &Arc<Self>, envelope: SessionEnvelope) {
        let manager = Arc::clone(self);
        self.pending.track(tokio::spawn(async move {
            if let Err(e) = manager.persist_envelope(&envelope).await {
                tracing::warn!(error = %e, "Deferred session persist failed");
            }
        }));
    }

    /// Refresh `lastAccessedAt` on the stored copy, whatever that currently
    /// is, and re-stamp the storage TTL.
    fn spawn_touch(self: &Arc<Self>, token: String) {
        let manager = Arc::clone(self);
        self.pending.track(tokio::spawn(async move {
            let stored = manager
                .storage
                .get_json::<SessionEnvelope>(&token, CacheType::Session)
                .await;
            match stored {
                Ok(Some(mut envelope)) => {
                    envelope.last_accessed_at = Utc::now();
                    if let Err(e) = manager.persist_envelope(&envelope).await {
                        tracing::warn!(error = %e, "Session access refresh failed");
                    }
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "Session access refresh read failed"),
            }
        }));
    }

    // ─────────────────────────────────────────────────────────────────────
    // Preload, snapshot, shutdown
    // ─────────────────────────────────────────────────────────────────────

    /// Scan stored sessions: purge expired ones, migrate legacy entries.
    /// Read errors are logged per key and never stop the scan.
    async fn preload(self: &Arc<Self>) {
        let keys = match self.storage.list(CacheType::Session, "*").await {
            Ok(keys) => keys,
            Err(e) => {
                tracing::warn!(error = %e, "Session preload listing failed");
                return;
            }
        };

        let total = keys.len();
        let mut loaded = 0usize;
        let mut dropped = 0usize;
        for key in keys {
            if !is_valid_token(&key) {
                tracing::debug!("Skipping non-token key in session namespace");
                continue;
            }
            match self.load_and_validate(&key).await {
                Ok(Some(_)) => loaded += 1,
                Ok(None) => dropped += 1,
                Err(e) => tracing::warn!(error = %e, "Preload read failed; skipping key"),
            }
        }
        tracing::info!(total, loaded, dropped, "Session preload complete");
    }

    async fn restore_snapshot_if_empty(self: &Arc<Self>) {
        let existing = match self.storage.list(CacheType::Session, "*").await {
            Ok(keys) => keys.len(),
            Err(e) => {
                tracing::warn!(error = %e, "Could not count sessions; skipping snapshot restore");
                return;
            }
        };
        if existing > 0 {
            return;
        }
        let Some(snapshot) = snapshot::load_snapshot(&self.config.snapshot_path).await else {
            return;
        };

        let mut restored = 0usize;
        for (token, envelope) in snapshot.sessions {
            if !is_valid_token(&token) || envelope.token != token {
                continue;
            }
            match self.persist_envelope(&envelope).await {
                Ok(()) => restored += 1,
                Err(e) => tracing::warn!(error = %e, "Snapshot session restore failed; skipping"),
            }
        }
        if restored > 0 {
            tracing::info!(restored, "Restored sessions from snapshot");
            self.events.publish(CoreEvent::SnapshotRestored {
                sessions: restored,
                timestamp: Utc::now(),
            });
        }
    }

    /// Write all stored envelopes to the snapshot file.
    pub async fn save_snapshot(&self) -> SessionResult<usize> {
        let keys = self.storage.list(CacheType::Session, "*").await?;
        let mut sessions = HashMap::new();
        for key in keys {
            if !is_valid_token(&key) {
                continue;
            }
            match self
                .storage
                .get_json::<SessionEnvelope>(&key, CacheType::Session)
                .await
            {
                Ok(Some(envelope)) => {
                    sessions.insert(key, envelope);
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "Snapshot read failed for a session; skipping"),
            }
        }

        let count = snapshot::save_snapshot(&self.config.snapshot_path, sessions)
            .await
            .map_err(|e| SessionError::Storage(StorageError::Io(e)))?;
        tracing::debug!(sessions = count, "Session snapshot written");
        Ok(count)
    }

    /// Orderly teardown: stop timers, await pending persistence, flush the
    /// in-memory envelopes, snapshot, close the bus.
    pub async fn shutdown(&self) {
        for handle in self.background.lock().drain(..) {
            handle.abort();
        }

        for mut handle in self.pending.take() {
            let mut finished = false;
            for attempt in 0..SHUTDOWN_FLUSH_ATTEMPTS {
                match tokio::time::timeout(SHUTDOWN_FLUSH_TIMEOUT, &mut handle).await {
                    Ok(_) => {
                        finished = true;
                        break;
                    }
                    Err(_) => {
                        tracing::warn!(attempt, "Pending persistence still running at shutdown")
                    }
                }
            }
            if !finished {
                handle.abort();
            }
        }

        // Envelopes touched in memory may carry a newer lastAccessedAt than
        // storage does.
        let envelopes: Vec<SessionEnvelope> = self
            .envelopes
            .lock()
            .iter()
            .map(|(_, envelope)| envelope.clone())
            .collect();
        for envelope in envelopes {
            if let Err(e) = self.persist_envelope(&envelope).await {
                tracing::warn!(error = %e, "Session flush failed at shutdown");
            }
        }

        if self.config.snapshot_enabled {
            if let Err(e) = self.save_snapshot().await {
                tracing::warn!(error = %e, "Shutdown snapshot failed");
            }
        }

        self.bus.close().await;
        let _ = self.ready.send(false);
    }
}
