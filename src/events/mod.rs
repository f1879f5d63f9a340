//! Event broadcasting for session and cache lifecycle notifications.
//!
//! Services publish typed events that monitoring consumers (an operator
//! dashboard, a log shipper, tests) receive over a broadcast channel. The
//! bus is also the metric surface for conditions that must be visible to
//! operators without failing the triggering operation, most importantly
//! `InvalidationFailed`: a pod that could not tell its peers about a session
//! write has a stale-cache window peers can only discover here.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// How many events can buffer before slow receivers start lagging.
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Core lifecycle events.
///
/// Tokens never appear in events; the 16-character token fingerprint is
/// carried instead so event consumers cannot hijack sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum CoreEvent {
    SessionCreated {
        token_fingerprint: String,
        timestamp: DateTime<Utc>,
    },

    SessionUpdated {
        token_fingerprint: String,
        timestamp: DateTime<Utc>,
    },

    SessionDeleted {
        token_fingerprint: String,
        timestamp: DateTime<Utc>,
    },

    /// Peer invalidation could not be published after retries. The write
    /// itself succeeded; peers may serve stale config until their next
    /// cache-population path.
    InvalidationFailed {
        token_fingerprint: String,
        action: String,
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// A size-cap eviction round completed.
    CacheEvicted {
        cache_type: String,
        deleted: u64,
        bytes_freed: u64,
        timestamp: DateTime<Utc>,
    },

    /// Sessions were restored from the disk snapshot after the primary
    /// store came up empty.
    SnapshotRestored {
        sessions: usize,
        timestamp: DateTime<Utc>,
    },
}

impl CoreEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            CoreEvent::SessionCreated { .. } => "session_created",
            CoreEvent::SessionUpdated { .. } => "session_updated",
            CoreEvent::SessionDeleted { .. } => "session_deleted",
            CoreEvent::InvalidationFailed { .. } => "invalidation_failed",
            CoreEvent::CacheEvicted { .. } => "cache_evicted",
            CoreEvent::SnapshotRestored { .. } => "snapshot_restored",
        }
    }
}

/// Broadcast bus for [`CoreEvent`]s. Cheap to clone; all clones share the
/// same channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
    events_published: Arc<AtomicU64>,
    events_dropped: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            events_published: Arc::new(AtomicU64::new(0)),
            events_dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publish an event to all subscribers. Returns the number of receivers;
    /// an event with no subscribers is counted as dropped, not an error.
    pub fn publish(&self, event: CoreEvent) -> usize {
        self.events_published.fetch_add(1, Ordering::Relaxed);
        match self.sender.send(event) {
            Ok(count) => count,
            Err(_) => {
                self.events_dropped.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    pub fn published_count(&self) -> u64 {
        self.events_published.load(Ordering::Relaxed)
    }

    pub fn dropped_count(&self) -> u64 {
        self.events_dropped.load(Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        let receivers = bus.publish(CoreEvent::SessionCreated {
            token_fingerprint: "ab".repeat(8),
            timestamp: Utc::now(),
        });
        assert_eq!(receivers, 1);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type(), "session_created");
    }

    #[test]
    fn publishing_without_subscribers_counts_drops() {
        let bus = EventBus::new();
        let receivers = bus.publish(CoreEvent::SnapshotRestored {
            sessions: 3,
            timestamp: Utc::now(),
        });
        assert_eq!(receivers, 0);
        assert_eq!(bus.dropped_count(), 1);
        assert_eq!(bus.published_count(), 1);
    }
}
