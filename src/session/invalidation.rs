//! Cross-instance invalidation bus.
//!
//! Horizontally scaled deployments keep per-pod session caches coherent over
//! Redis pub/sub. Two connections are involved: the shared command path
//! publishes, and a dedicated subscriber connection listens (subscriber-mode
//! connections cannot issue other commands). Messages are published under
//! every known prefix variant of the channel so mixed-prefix deployments
//! interoperate.
//!
//! Each instance carries a random 64-bit id and ignores its own messages; a
//! pod must not invalidate the cache entry it just refreshed. Publishing
//! retries connection errors up to three times with 100-500 ms backoff, and
//! a permanent failure emits [`CoreEvent::InvalidationFailed`] rather than
//! failing the write that triggered it.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::{sync::Mutex, task::JoinHandle};

use crate::{
    events::{CoreEvent, EventBus},
    storage::{StorageAdapter, StorageResult},
};

use super::envelope::token_fingerprint;

/// Base channel name; deployed channels are this under each prefix variant.
pub const INVALIDATION_CHANNEL: &str = "session:invalidate";

const PUBLISH_ATTEMPTS: u32 = 3;
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvalidationAction {
    Update,
    Delete,
}

impl InvalidationAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvalidationAction::Update => "update",
            InvalidationAction::Delete => "delete",
        }
    }
}

/// Wire payload on the invalidation channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidationMessage {
    pub token: String,
    pub action: InvalidationAction,
    pub instance_id: u64,
    pub timestamp: i64,
}

pub struct InvalidationBus {
    storage: Arc<dyn StorageAdapter>,
    channels: Vec<String>,
    instance_id: u64,
    events: EventBus,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl InvalidationBus {
    pub fn new(storage: Arc<dyn StorageAdapter>, events: EventBus) -> Self {
        let channels = storage
            .as_redis()
            .map(|redis| redis.channel_variants(INVALIDATION_CHANNEL))
            .unwrap_or_default();
        Self {
            storage,
            channels,
            instance_id: rand::random::<u64>(),
            events,
            listener: Mutex::new(None),
        }
    }

    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }

    /// Whether a message originated from this instance. Own events are
    /// dropped by the subscriber loop.
    pub fn is_own(&self, message: &InvalidationMessage) -> bool {
        message.instance_id == self.instance_id
    }

    /// Start the subscriber loop. `on_invalidate` runs for every peer
    /// message; this instance's own messages are filtered out before it is
    /// called. A no-op without a Redis backend (no peers to hear from).
    pub async fn start<F>(&self, on_invalidate: F) -> StorageResult<()>
    where
        F: Fn(InvalidationMessage) + Send + Sync + 'static,
    {
        if self.storage.as_redis().is_none() {
            tracing::debug!("No shared backend; invalidation bus runs local-only");
            return Ok(());
        }

        let storage = self.storage.clone();
        let channels = self.channels.clone();
        let instance_id = self.instance_id;

        let handle = tokio::spawn(async move {
            loop {
                let Some(redis) = storage.as_redis() else {
                    break;
                };
                match redis.pubsub().await {
                    Ok(mut pubsub) => {
                        let mut subscribed = true;
                        for channel in &channels {
                            if let Err(e) = pubsub.subscribe(channel).await {
                                tracing::warn!(channel, error = %e, "Subscribe failed");
                                subscribed = false;
                                break;
                            }
                        }
                        if subscribed {
                            tracing::debug!(channels = channels.len(), "Invalidation subscriber online");
                            let mut stream = pubsub.on_message();
                            while let Some(message) = stream.next().await {
                                let payload: String = match message.get_payload() {
                                    Ok(p) => p,
                                    Err(_) => continue,
                                };
                                match serde_json::from_str::<InvalidationMessage>(&payload) {
                                    Ok(msg) if msg.instance_id == instance_id => {
                                        // Own event; self-invalidation would
                                        // throw away the freshest copy.
                                    }
                                    Ok(msg) => on_invalidate(msg),
                                    Err(e) => {
                                        tracing::debug!(error = %e, "Undecodable invalidation payload")
                                    }
                                }
                            }
                            tracing::warn!("Invalidation subscriber disconnected; reconnecting");
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Invalidation subscriber connect failed");
                    }
                }
                tokio::time::sleep(RESUBSCRIBE_DELAY).await;
            }
        });

        *self.listener.lock().await = Some(handle);
        Ok(())
    }

    /// Publish an invalidation to peers. Never fails the caller: after
    /// exhausted retries the failure is logged and surfaced as an event so
    /// operators can detect the stale-cache window.
    pub async fn publish(&self, action: InvalidationAction, token: &str) {
        let Some(redis) = self.storage.as_redis() else {
            return;
        };

        let message = InvalidationMessage {
            token: token.to_string(),
            action,
            instance_id: self.instance_id,
            timestamp: Utc::now().timestamp_millis(),
        };
        let payload = match serde_json::to_string(&message) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(error = %e, "Invalidation payload serialization failed");
                return;
            }
        };

        let mut last_error: Option<String> = None;
        for attempt in 0..PUBLISH_ATTEMPTS {
            match self.publish_all(redis, &payload).await {
                Ok(()) => return,
                Err(e) if e.is_unavailable() && attempt + 1 < PUBLISH_ATTEMPTS => {
                    let delay = Duration::from_millis(100 * (attempt as u64 + 1)).min(
                        Duration::from_millis(500),
                    );
                    tracing::debug!(error = %e, attempt, "Invalidation publish failed; retrying");
                    tokio::time::sleep(delay).await;
                    last_error = Some(e.to_string());
                }
                Err(e) => {
                    last_error = Some(e.to_string());
                    break;
                }
            }
        }

        let error = last_error.unwrap_or_else(|| "unknown".to_string());
        tracing::warn!(
            action = action.as_str(),
            error = %error,
            "Peer invalidation could not be published; peers may serve stale \
             session data until their caches repopulate"
        );
        self.events.publish(CoreEvent::InvalidationFailed {
            token_fingerprint: token_fingerprint(token),
            action: action.as_str().to_string(),
            error,
            timestamp: Utc::now(),
        });
    }

    async fn publish_all(
        &self,
        redis: &crate::storage::RedisBackend,
        payload: &str,
    ) -> StorageResult<()> {
        for channel in &self.channels {
            redis.publish(channel, payload).await?;
        }
        Ok(())
    }

    pub async fn close(&self) {
        if let Some(handle) = self.listener.lock().await.take() {
            handle.abort();
        }
    }
}
