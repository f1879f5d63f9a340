//! Session and cache core for the SubMaker subtitle-translation addon.
//!
//! This crate owns the storage abstractions the rest of the addon depends on:
//! opaque session tokens bound to encrypted user configuration, a pluggable
//! key/value storage layer (local filesystem or Redis with optional Sentinel
//! failover), per-cache-type size caps with LRU eviction, cross-instance
//! cache invalidation over pub/sub, the community subtitle index, and the
//! embedded-track cache.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐    ┌─────────────────┐    ┌──────────────────┐
//! │ SessionManager│──>│  StorageAdapter  │──>│ Filesystem / Redis│
//! │ SmdbStore     │    │ (policy + keys) │    │     backend      │
//! │ EmbeddedStore │    └─────────────────┘    └──────────────────┘
//! └──────┬───────┘
//!        │ secrets transit the CryptoService on every store/load
//!        ▼
//! ┌──────────────┐    ┌─────────────────┐
//! │ CryptoService │    │ InvalidationBus │──> peers (session:invalidate)
//! └──────────────┘    └─────────────────┘
//! ```
//!
//! HTTP routing, subtitle-provider clients, AI translation clients, and
//! subtitle parsing live in sibling crates; they call the typed operations
//! exposed here and never reach past the [`storage::StorageAdapter`] trait.

pub mod config;
pub mod crypto;
pub mod embedded;
pub mod events;
pub mod model;
pub mod observability;
pub mod runtime;
pub mod session;
pub mod smdb;
pub mod storage;

pub use config::{ConfigError, CoreConfig};
pub use crypto::CryptoService;
pub use events::{CoreEvent, EventBus};
pub use model::UserConfig;
pub use runtime::Core;
pub use session::SessionManager;
pub use storage::{CacheType, StorageAdapter, StorageError};
