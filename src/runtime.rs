//! Core façade: wiring, readiness, periodic maintenance, and shutdown.
//!
//! Embedding crates construct a [`Core`] once at startup and reach every
//! subsystem through it. Teardown order on shutdown: stop timers, let the
//! session manager await its pending persistence and snapshot, then close
//! the storage backend.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::{
    config::{ConfigError, CoreConfig},
    crypto::{CryptoError, CryptoService},
    embedded::EmbeddedTrackStore,
    events::{CoreEvent, EventBus},
    session::{InvalidationBus, KeyRotator, SessionError, SessionManager},
    smdb::SmdbStore,
    storage::{create_storage, CacheType, StorageAdapter, StorageError},
};

const CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Session(#[from] SessionError),
}

pub struct Core {
    config: CoreConfig,
    crypto: Arc<CryptoService>,
    storage: Arc<dyn StorageAdapter>,
    events: EventBus,
    sessions: Arc<SessionManager>,
    smdb: Arc<SmdbStore>,
    embedded: Arc<EmbeddedTrackStore>,
    rotator: Arc<KeyRotator>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl Core {
    /// Build from process environment variables.
    pub async fn bootstrap() -> Result<Self, CoreError> {
        let config = CoreConfig::from_env()?;
        Self::with_config(config).await
    }

    /// Build from an explicit configuration. Key acquisition failures and
    /// an unreachable backend abort startup here, before any caller can
    /// observe a half-initialized core.
    pub async fn with_config(config: CoreConfig) -> Result<Self, CoreError> {
        let crypto = Arc::new(CryptoService::initialize(&config.encryption)?);
        let storage = create_storage(&config).await?;
        let events = EventBus::new();

        let bus = Arc::new(InvalidationBus::new(
            Arc::clone(&storage),
            events.clone(),
        ));
        let sessions = SessionManager::new(
            Arc::clone(&storage),
            Arc::clone(&crypto),
            config.session.clone(),
            events.clone(),
            bus,
        );
        sessions.initialize().await?;

        let core = Self {
            smdb: Arc::new(SmdbStore::new(Arc::clone(&storage))),
            embedded: Arc::new(EmbeddedTrackStore::new(Arc::clone(&storage))),
            rotator: Arc::new(KeyRotator::new(Arc::clone(&storage))),
            config,
            crypto,
            storage,
            events,
            sessions,
            maintenance: Mutex::new(None),
        };
        core.spawn_maintenance();
        Ok(core)
    }

    /// Hourly orphan sweep and cap re-enforcement across all cache types.
    fn spawn_maintenance(&self) {
        let storage = Arc::clone(&self.storage);
        let events = self.events.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // immediate first tick
            loop {
                ticker.tick().await;
                for cache_type in CacheType::ALL {
                    match storage.cleanup(cache_type).await {
                        Ok(report) if report.deleted > 0 => {
                            tracing::debug!(
                                cache_type = %cache_type,
                                deleted = report.deleted,
                                bytes_freed = report.bytes_freed,
                                "Cache cleanup pass"
                            );
                            events.publish(CoreEvent::CacheEvicted {
                                cache_type: cache_type.as_str().to_string(),
                                deleted: report.deleted,
                                bytes_freed: report.bytes_freed,
                                timestamp: Utc::now(),
                            });
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::warn!(cache_type = %cache_type, error = %e, "Cleanup failed")
                        }
                    }
                }
            }
        });
        *self.maintenance.lock() = Some(handle);
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn crypto(&self) -> &Arc<CryptoService> {
        &self.crypto
    }

    pub fn storage(&self) -> &Arc<dyn StorageAdapter> {
        &self.storage
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn smdb(&self) -> &Arc<SmdbStore> {
        &self.smdb
    }

    pub fn embedded(&self) -> &Arc<EmbeddedTrackStore> {
        &self.embedded
    }

    pub fn rotator(&self) -> &Arc<KeyRotator> {
        &self.rotator
    }

    pub async fn health_check(&self) -> bool {
        self.storage.health_check().await
    }

    /// Block until SIGTERM/SIGINT, then run the orderly shutdown path.
    pub async fn run_until_signal(&self) {
        wait_for_shutdown_signal().await;
        tracing::info!("Shutdown signal received");
        self.shutdown().await;
    }

    /// Orderly teardown. Safe to call more than once.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.maintenance.lock().take() {
            handle.abort();
        }
        self.sessions.shutdown().await;
        if let Err(e) = self.storage.close().await {
            tracing::warn!(error = %e, "Storage close reported an error");
        }
        tracing::info!("Session and cache core stopped");
    }
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable; watching SIGINT only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{EncryptionConfig, FilesystemStorageConfig, SessionConfig, StorageConfig},
        model::UserConfig,
    };

    fn test_config(dir: &std::path::Path) -> CoreConfig {
        CoreConfig {
            storage: StorageConfig::Filesystem(FilesystemStorageConfig {
                base_dir: dir.join("cache"),
            }),
            encryption: EncryptionConfig {
                key: Some("cd".repeat(32)),
                key_file: dir.join("unused.key"),
            },
            session: SessionConfig::default(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn full_stack_create_get_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let core = Core::with_config(test_config(dir.path())).await.unwrap();

        core.sessions().wait_until_ready().await;
        assert!(core.health_check().await);

        let token = core
            .sessions()
            .create(UserConfig {
                gemini_api_key: Some("AIza-XYZ".into()),
                targets: vec!["spa".into()],
                ..Default::default()
            })
            .await
            .unwrap();

        let config = core.sessions().get(&token).await.unwrap().unwrap();
        assert_eq!(config.gemini_api_key.as_deref(), Some("AIza-XYZ"));

        core.shutdown().await;
    }

    #[tokio::test]
    async fn sessions_survive_a_restart() {
        let dir = tempfile::tempdir().unwrap();

        let token = {
            let core = Core::with_config(test_config(dir.path())).await.unwrap();
            let token = core
                .sessions()
                .create(UserConfig {
                    gemini_api_key: Some("persistent".into()),
                    ..Default::default()
                })
                .await
                .unwrap();
            core.shutdown().await;
            token
        };

        let core = Core::with_config(test_config(dir.path())).await.unwrap();
        let config = core.sessions().get(&token).await.unwrap().unwrap();
        assert_eq!(config.gemini_api_key.as_deref(), Some("persistent"));
        core.shutdown().await;
    }
}
