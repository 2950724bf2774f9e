//! Layered caching for service code.
//!
//! ## Architecture
//!
//! - **L1 ([`MemoryStore`])**: in-process, microsecond latency, per instance
//! - **L2 ([`DistributedStore`])**: Redis, millisecond latency, shared
//! - **[`Backplane`]**: pub/sub invalidation keeping peer L1 caches coherent
//!
//! [`HybridCache`] composes the tiers with fail-safe staleness, soft/hard
//! factory timeouts, background refresh, and per-key stampede coalescing.
//!
//! ## Graceful Degradation
//!
//! Every layer beyond L1 is optional: no L2 means single-tier caching, no
//! backplane means no cross-instance invalidation. Failures in optional
//! layers degrade (with a log line) instead of failing cache operations.

pub mod backplane;
pub mod cache;
pub mod config;
pub mod metrics;
pub mod refresh;
pub mod stampede;
pub mod store;

pub use backplane::{
    Backplane, BackplaneTransport, Invalidation, InvalidationMessage, LocalTransport,
    RedisTransport, WIRE_VERSION,
};
pub use cache::{CacheStats, GetOutcome, HybridCache, HybridCacheBuilder};
pub use config::{BackplaneConfig, CacheConfig, RedisConfig};
pub use metrics::{init_metrics, render_metrics};
pub use stampede::StampedeGuard;
pub use store::{CacheStore, DistributedStore, MemoryStore};

pub use cachify_core::{
    CacheError, Clock, EntryMetadata, EntryOptions, EntryState, ManualClock, ResilienceOptions,
    Result, SharedClock, StaleReason, SystemClock,
};
