//! Composite cache orchestrator.
//!
//! [`HybridCache`] fronts an L1 memory tier and an optional L2 distributed
//! tier with fail-safe staleness, soft/hard factory timeouts, background
//! refresh, per-key stampede coalescing, and backplane invalidation.
//!
//! ## Read Path
//!
//! ```text
//! get(key) -> L1 -> L2 -> (stale fallback) -> miss
//!              |     |
//!          fresh?  fresh? -> refill L1 with the remaining fail-safe window
//! ```
//!
//! ## Graceful Degradation
//!
//! Without an L2 store the cache runs in single-tier mode; without a
//! backplane no invalidations are published. Neither is an error.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rand::Rng;

use cachify_core::{
    CacheError, EntryMetadata, EntryOptions, EntryState, ResilienceOptions, Result, SharedClock,
    StaleReason, SystemClock, build_key, meta_key,
};

use crate::backplane::{Backplane, Invalidation};
use crate::config::CacheConfig;
use crate::metrics;
use crate::refresh::{RefreshHandle, RefreshOutcome, RefreshRegistry};
use crate::stampede::StampedeGuard;
use crate::store::{CacheStore, MemoryStore};

/// Result of a state-aware read.
#[derive(Debug, Clone)]
pub enum GetOutcome {
    /// A fresh value.
    Hit(Bytes),
    /// A value past its logical expiration but inside the fail-safe window.
    Stale { value: Bytes, reason: StaleReason },
    Miss,
}

impl GetOutcome {
    pub fn value(&self) -> Option<&Bytes> {
        match self {
            Self::Hit(value) | Self::Stale { value, .. } => Some(value),
            Self::Miss => None,
        }
    }

    pub fn into_value(self) -> Option<Bytes> {
        match self {
            Self::Hit(value) | Self::Stale { value, .. } => Some(value),
            Self::Miss => None,
        }
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, Self::Stale { .. })
    }

    pub fn is_miss(&self) -> bool {
        matches!(self, Self::Miss)
    }
}

/// Cache statistics.
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub mode: &'static str,
    pub l1_entries: Option<usize>,
}

struct CacheInner {
    l1: Arc<dyn CacheStore>,
    l2: Option<Arc<dyn CacheStore>>,
    clock: SharedClock,
    config: CacheConfig,
    stampede: StampedeGuard,
    refresh: RefreshRegistry,
    backplane: Option<Backplane>,
}

/// The cache facade. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct HybridCache {
    inner: Arc<CacheInner>,
}

impl HybridCache {
    pub fn builder() -> HybridCacheBuilder {
        HybridCacheBuilder::new()
    }

    /// Look up `key`, returning a fresh or stale value transparently.
    ///
    /// Staleness is not distinguishable here; use [`get_with_state`]
    /// when the caller needs to know.
    ///
    /// [`get_with_state`]: Self::get_with_state
    pub async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        Ok(self.get_with_state(key).await?.into_value())
    }

    /// Look up `key` with full state information.
    pub async fn get_with_state(&self, key: &str) -> Result<GetOutcome> {
        let started = Instant::now();
        let resolved = self.resolve_key(key, None);
        let outcome = self.read(&resolved).await;
        metrics::record_get_duration(started.elapsed());

        if let Ok(GetOutcome::Stale { reason, .. }) = &outcome {
            metrics::record_stale_served(reason.as_str());
            metrics::record_failsafe_used();
            tracing::debug!(
                key = %resolved,
                cachify.stale = true,
                cachify.stale_reason = reason.as_str(),
                "serving stale value"
            );
        }
        outcome
    }

    /// Write `value` under `key`.
    ///
    /// Ordering per write: L2 payload, L2 metadata, L1 payload, L1 metadata,
    /// then the backplane invalidation.
    pub async fn set(
        &self,
        key: &str,
        value: impl Into<Bytes>,
        options: Option<&EntryOptions>,
    ) -> Result<()> {
        let resolved = self.resolve_key(key, options);
        self.write(&resolved, value.into(), options).await
    }

    /// Delete `key` and its metadata from both tiers.
    pub async fn remove(&self, key: &str) -> Result<()> {
        let resolved = self.resolve_key(key, None);
        let meta = meta_key(&resolved);

        if let Some(l2) = &self.inner.l2 {
            let result = async {
                l2.remove(&resolved).await?;
                l2.remove(&meta).await
            }
            .await;
            if let Err(e) = result {
                tracing::warn!(error = %e, key = %resolved, "L2 remove failed");
                if self.inner.config.fail_fast_on_l2_errors {
                    return Err(e);
                }
            }
        }

        if let Err(e) = self.inner.l1.remove(&resolved).await {
            tracing::warn!(error = %e, key = %resolved, "L1 remove failed");
        }
        let _ = self.inner.l1.remove(&meta).await;

        metrics::record_cache_remove();
        self.publish_invalidation(&resolved).await;
        Ok(())
    }

    /// Read `key`, running `factory` to produce the value on a miss.
    ///
    /// Concurrent callers for the same key share one factory execution. A
    /// configured soft timeout lets callers holding a stale candidate return
    /// it while the refresh keeps running; the hard timeout cancels the
    /// factory outright.
    pub async fn get_or_set<F, Fut, E>(
        &self,
        key: &str,
        factory: F,
        options: Option<&EntryOptions>,
    ) -> Result<Bytes>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Bytes, E>> + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        let resolved = self.resolve_key(key, options);
        let resilience = self.resolve_resilience(options);

        let mut stale = None;
        match self.read(&resolved).await? {
            GetOutcome::Hit(value) => return Ok(value),
            GetOutcome::Stale { value, reason } => stale = Some((value, reason)),
            GetOutcome::Miss => {}
        }

        let factory = Arc::new(factory);
        let handle = match self.inner.refresh.get(&resolved) {
            Some(handle) => handle,
            None => {
                let _slot = self.inner.stampede.acquire(&resolved).await;
                // Re-read under the lock: an earlier caller may have already
                // stored the value between our miss and the acquisition.
                match self.read(&resolved).await? {
                    GetOutcome::Hit(value) => return Ok(value),
                    GetOutcome::Stale { value, reason } => stale = Some((value, reason)),
                    GetOutcome::Miss => {}
                }
                match self.inner.refresh.get(&resolved) {
                    Some(handle) => handle,
                    None => self.spawn_refresh(
                        &resolved,
                        Arc::clone(&factory),
                        options.cloned(),
                        &resilience,
                    ),
                }
            }
        };

        match (&stale, resilience.soft_timeout) {
            (Some(_), Some(soft)) => {
                match tokio::time::timeout(soft, handle.clone().outcome()).await {
                    Ok(outcome) => {
                        self.conclude(&resolved, outcome, stale, factory, options, &resilience)
                    }
                    Err(_) => {
                        let (value, _) = stale.expect("stale candidate checked above");
                        metrics::record_soft_timeout();
                        metrics::record_stale_served(StaleReason::SoftTimeout.as_str());
                        metrics::record_failsafe_used();
                        tracing::debug!(
                            key = %resolved,
                            cachify.stale = true,
                            cachify.stale_reason = StaleReason::SoftTimeout.as_str(),
                            cachify.timeout_type = "soft",
                            cachify.refresh_scheduled = true,
                            "soft timeout; serving stale while refresh continues"
                        );
                        Ok(value)
                    }
                }
            }
            _ => {
                let outcome = handle.outcome().await;
                self.conclude(&resolved, outcome, stale, factory, options, &resilience)
            }
        }
    }

    /// Cache statistics (L1 only).
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            mode: if self.inner.l2.is_some() {
                "layered"
            } else {
                "l1-only"
            },
            l1_entries: self.inner.l1.entry_count(),
        }
    }

    /// Whether the L2 tier is configured and reachable.
    pub async fn is_l2_available(&self) -> bool {
        match &self.inner.l2 {
            Some(l2) => l2.is_available().await,
            None => false,
        }
    }

    /// The backplane identity this instance publishes under, if any.
    pub fn instance_id(&self) -> Option<&str> {
        self.inner.backplane.as_ref().map(Backplane::instance_id)
    }

    fn resolve_key(&self, key: &str, options: Option<&EntryOptions>) -> String {
        let prefix = options
            .and_then(|o| o.key_prefix.as_deref())
            .or(self.inner.config.key_prefix.as_deref());
        build_key(prefix, None, key)
    }

    fn resolve_resilience(&self, options: Option<&EntryOptions>) -> ResilienceOptions {
        options
            .and_then(|o| o.resilience.clone())
            .unwrap_or_else(|| self.inner.config.resilience.clone())
    }

    /// The layered read: L1, then L2 with refill, with stale fallback.
    async fn read(&self, resolved: &str) -> Result<GetOutcome> {
        let now = self.inner.clock.now();
        let mut stale: Option<(Bytes, StaleReason)> = None;

        // L1 errors are treated as a miss and never surface.
        match self.load_tier(self.inner.l1.as_ref(), resolved).await {
            Ok(Some((value, meta))) => match EntryState::derive(true, meta.as_ref(), now) {
                EntryState::Fresh => {
                    metrics::record_cache_hit("L1");
                    tracing::debug!(key = %resolved, "cache hit (L1)");
                    return Ok(GetOutcome::Hit(value));
                }
                EntryState::Stale => stale = Some((value, StaleReason::Expired)),
                EntryState::Miss => {}
            },
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(error = %e, key = %resolved, "L1 read failed; treating as miss");
            }
        }

        if let Some(l2) = &self.inner.l2 {
            match self.load_tier(l2.as_ref(), resolved).await {
                Ok(Some((value, meta))) => {
                    match EntryState::derive(true, meta.as_ref(), now) {
                        EntryState::Fresh => {
                            self.refill_l1(resolved, &value, meta.as_ref(), now).await;
                            metrics::record_cache_hit("L2");
                            tracing::debug!(key = %resolved, "cache hit (L2)");
                            return Ok(GetOutcome::Hit(value));
                        }
                        EntryState::Stale => {
                            if stale.is_none() {
                                stale = Some((value, StaleReason::Expired));
                            }
                        }
                        EntryState::Miss => {}
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(error = %e, key = %resolved, "L2 read failed");
                    // A stale candidate from either tier beats the error;
                    // only a totally empty hand propagates it.
                    if let Some((value, _)) = stale.take() {
                        metrics::record_cache_hit("stale");
                        return Ok(GetOutcome::Stale {
                            value,
                            reason: StaleReason::L2Failure,
                        });
                    }
                    if self.inner.config.fail_fast_on_l2_errors {
                        return Err(e);
                    }
                }
            }
        }

        if let Some((value, reason)) = stale.take() {
            metrics::record_cache_hit("stale");
            return Ok(GetOutcome::Stale { value, reason });
        }

        metrics::record_cache_miss();
        Ok(GetOutcome::Miss)
    }

    /// Fetch payload and metadata from one tier.
    async fn load_tier(
        &self,
        store: &dyn CacheStore,
        resolved: &str,
    ) -> Result<Option<(Bytes, Option<EntryMetadata>)>> {
        let Some(payload) = store.get(resolved).await? else {
            return Ok(None);
        };
        let meta = match store.get(&meta_key(resolved)).await? {
            Some(raw) => match serde_json::from_slice::<EntryMetadata>(&raw) {
                Ok(meta) => Some(meta),
                Err(e) => {
                    // Swallowed: a payload without readable metadata is
                    // served as fresh for backward compatibility.
                    tracing::warn!(error = %e, key = %resolved, "unreadable entry metadata");
                    None
                }
            },
            None => None,
        };
        Ok(Some((payload, meta)))
    }

    /// Copy an L2 hit into L1, using the remaining fail-safe window as TTL.
    async fn refill_l1(
        &self,
        resolved: &str,
        value: &Bytes,
        meta: Option<&EntryMetadata>,
        now: time::OffsetDateTime,
    ) {
        let ttl = match meta {
            Some(meta) => match meta.remaining_fail_safe(now) {
                Some(remaining) => remaining,
                None => return,
            },
            // Compatibility entries carry no metadata; fall back to the
            // configured default.
            None => self.inner.config.default_ttl,
        };

        if let Err(e) = self
            .inner
            .l1
            .set(resolved, value.clone(), Some(ttl), None)
            .await
        {
            tracing::warn!(error = %e, key = %resolved, "L1 refill failed");
            return;
        }
        if let Some(meta) = meta {
            match serde_json::to_vec(meta) {
                Ok(raw) => {
                    let _ = self
                        .inner
                        .l1
                        .set(&meta_key(resolved), Bytes::from(raw), Some(ttl), None)
                        .await;
                }
                Err(e) => tracing::warn!(error = %e, "failed to encode metadata for refill"),
            }
        }
    }

    /// Write payload + metadata to L2 then L1, then publish the invalidation.
    async fn write(
        &self,
        resolved: &str,
        value: Bytes,
        options: Option<&EntryOptions>,
    ) -> Result<()> {
        let now = self.inner.clock.now();
        let resilience = self.resolve_resilience(options);

        let mut base_ttl = options
            .and_then(|o| o.ttl)
            .unwrap_or(self.inner.config.default_ttl);
        if value.is_empty() {
            if let Some(negative) = options.and_then(|o| o.negative_cache_ttl) {
                base_ttl = negative;
            }
        }
        let jitter_ratio = options
            .and_then(|o| o.jitter_ratio)
            .unwrap_or(self.inner.config.jitter_ratio);
        let ttl = apply_jitter(base_ttl, jitter_ratio);

        let metadata = EntryMetadata::new(now, ttl, resilience.fail_safe_max_duration);
        let meta_bytes = Bytes::from(serde_json::to_vec(&metadata)?);
        let storage_ttl = ttl + resilience.fail_safe_max_duration;
        let sliding = options.and_then(|o| o.sliding_expiration);
        let meta = meta_key(resolved);

        if let Some(l2) = &self.inner.l2 {
            let result = async {
                l2.set(resolved, value.clone(), Some(storage_ttl), None)
                    .await?;
                l2.set(&meta, meta_bytes.clone(), Some(storage_ttl), None)
                    .await
            }
            .await;
            if let Err(e) = result {
                tracing::warn!(error = %e, key = %resolved, "L2 write failed");
                if self.inner.config.fail_fast_on_l2_errors {
                    return Err(e);
                }
            }
        }

        if let Err(e) = self
            .inner
            .l1
            .set(resolved, value, Some(storage_ttl), sliding)
            .await
        {
            tracing::warn!(error = %e, key = %resolved, "L1 write failed");
        }
        let _ = self
            .inner
            .l1
            .set(&meta, meta_bytes, Some(storage_ttl), sliding)
            .await;

        metrics::record_cache_set();
        tracing::debug!(key = %resolved, ttl_ms = ttl.as_millis() as u64, "cache set");
        self.publish_invalidation(resolved).await;
        Ok(())
    }

    /// Publish a key invalidation; failures are logged, never surfaced.
    async fn publish_invalidation(&self, resolved: &str) {
        if let Some(backplane) = &self.inner.backplane {
            if let Err(e) = backplane.publish_key(resolved).await {
                tracing::warn!(error = %e, key = %resolved, "backplane publish failed");
            }
        }
    }

    /// Spawn the single refresh task for `resolved`.
    ///
    /// The caller must hold the key's stampede lock. The task runs detached
    /// so a caller giving up (soft timeout, cancellation) never aborts it.
    fn spawn_refresh<F, Fut, E>(
        &self,
        resolved: &str,
        factory: Arc<F>,
        options: Option<EntryOptions>,
        resilience: &ResilienceOptions,
    ) -> RefreshHandle
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Bytes, E>> + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        let (completion, handle) = self.inner.refresh.begin(resolved);
        let cache = self.clone();
        let resolved = resolved.to_string();
        let hard_timeout = resilience.hard_timeout;

        tokio::spawn(async move {
            let fut = (factory)();
            let result: RefreshOutcome = match hard_timeout {
                Some(limit) => match tokio::time::timeout(limit, fut).await {
                    Ok(produced) => produced.map_err(|e| Arc::new(CacheError::factory(e))),
                    Err(_) => {
                        metrics::record_hard_timeout();
                        tracing::warn!(
                            key = %resolved,
                            cachify.timeout_type = "hard",
                            "factory cancelled by hard timeout"
                        );
                        Err(Arc::new(CacheError::hard_timeout(resolved.clone(), limit)))
                    }
                },
                None => fut.await.map_err(|e| Arc::new(CacheError::factory(e))),
            };

            match result {
                Ok(value) => {
                    if let Err(e) = cache.write(&resolved, value.clone(), options.as_ref()).await {
                        tracing::warn!(error = %e, key = %resolved, "failed to store refreshed value");
                    }
                    completion.complete(Ok(value));
                }
                Err(e) => {
                    tracing::warn!(error = %e, key = %resolved, "refresh failed");
                    completion.complete(Err(e));
                }
            }
        });

        handle
    }

    /// Map a refresh outcome to the caller's result, falling back to stale.
    fn conclude<F, Fut, E>(
        &self,
        resolved: &str,
        outcome: RefreshOutcome,
        stale: Option<(Bytes, StaleReason)>,
        factory: Arc<F>,
        options: Option<&EntryOptions>,
        resilience: &ResilienceOptions,
    ) -> Result<Bytes>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Bytes, E>> + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        match outcome {
            Ok(value) => Ok(value),
            Err(shared) => {
                let reason = if shared.is_timeout() {
                    StaleReason::HardTimeout
                } else {
                    StaleReason::FactoryFailure
                };
                match stale {
                    Some((value, _)) => {
                        metrics::record_stale_served(reason.as_str());
                        metrics::record_failsafe_used();
                        let refresh_scheduled = resilience.enable_background_refresh;
                        tracing::debug!(
                            key = %resolved,
                            cachify.stale = true,
                            cachify.stale_reason = reason.as_str(),
                            cachify.refresh_scheduled = refresh_scheduled,
                            "refresh failed; serving stale value"
                        );
                        if refresh_scheduled {
                            self.schedule_background_refresh(
                                resolved.to_string(),
                                factory,
                                options.cloned(),
                                resilience.clone(),
                            );
                        }
                        Ok(value)
                    }
                    None => Err(share_error(&shared)),
                }
            }
        }
    }

    /// Retry the factory on a detached task with no caller to cancel it.
    fn schedule_background_refresh<F, Fut, E>(
        &self,
        resolved: String,
        factory: Arc<F>,
        options: Option<EntryOptions>,
        resilience: ResilienceOptions,
    ) where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Bytes, E>> + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        let cache = self.clone();
        tokio::spawn(async move {
            if cache.inner.refresh.in_flight(&resolved) {
                return;
            }
            let _slot = cache.inner.stampede.acquire(&resolved).await;
            if cache.inner.refresh.get(&resolved).is_some() {
                return;
            }
            let handle = cache.spawn_refresh(&resolved, factory, options, &resilience);
            let _ = handle.outcome().await;
        });
    }
}

/// Perturb `ttl` by a uniform factor in `[1 - ratio, 1 + ratio]`, floored
/// at one millisecond.
fn apply_jitter(ttl: Duration, ratio: f64) -> Duration {
    let jittered = if ratio > 0.0 {
        let perturbation: f64 = rand::thread_rng().gen_range(-ratio..=ratio);
        ttl.mul_f64(1.0 + perturbation)
    } else {
        ttl
    };
    jittered.max(Duration::from_millis(1))
}

/// Clone a shared refresh error into an owned one for the caller.
fn share_error(error: &CacheError) -> CacheError {
    match error {
        CacheError::HardTimeout { key, timeout } => CacheError::HardTimeout {
            key: key.clone(),
            timeout: *timeout,
        },
        CacheError::Factory(source) => CacheError::Factory(Arc::clone(source)),
        CacheError::Store(message) => CacheError::Store(message.clone()),
        other => CacheError::store(other.to_string()),
    }
}

/// Builder for [`HybridCache`].
pub struct HybridCacheBuilder {
    l1: Option<Arc<dyn CacheStore>>,
    l2: Option<Arc<dyn CacheStore>>,
    clock: Option<SharedClock>,
    config: CacheConfig,
    backplane: Option<Backplane>,
}

impl HybridCacheBuilder {
    pub fn new() -> Self {
        Self {
            l1: None,
            l2: None,
            clock: None,
            config: CacheConfig::default(),
            backplane: None,
        }
    }

    /// The in-process tier. Defaults to a fresh [`MemoryStore`].
    pub fn l1(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.l1 = Some(store);
        self
    }

    /// The distributed tier. Absent means single-tier operation.
    pub fn l2(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.l2 = Some(store);
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    pub fn backplane(mut self, backplane: Backplane) -> Self {
        self.backplane = Some(backplane);
        self
    }

    /// Assemble the cache.
    ///
    /// Registers the L1 eviction handler on the backplane, so this must run
    /// inside a tokio runtime when a backplane is configured.
    pub fn build(self) -> Result<HybridCache> {
        self.config
            .validate()
            .map_err(CacheError::configuration)?;

        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock) as SharedClock);
        let l1 = self
            .l1
            .unwrap_or_else(|| Arc::new(MemoryStore::with_clock(Arc::clone(&clock))));

        if let Some(backplane) = &self.backplane {
            let l1_for_evictions = Arc::clone(&l1);
            backplane.register_handler(Arc::new(move |invalidation| {
                let l1 = Arc::clone(&l1_for_evictions);
                Box::pin(async move {
                    if let Invalidation::Key(key) = invalidation {
                        l1.remove(&key).await?;
                        l1.remove(&meta_key(&key)).await?;
                        tracing::debug!(key = %key, "evicted L1 entry on backplane invalidation");
                    }
                    // Tag events are counted by the backplane; tag indexing
                    // is out of scope here.
                    Ok(())
                })
            }));
        }

        if self.l2.is_none() {
            tracing::info!("no L2 store configured; running in single-tier mode");
        }

        Ok(HybridCache {
            inner: Arc::new(CacheInner {
                l1,
                l2: self.l2,
                clock,
                config: self.config,
                stampede: StampedeGuard::new(),
                refresh: RefreshRegistry::new(),
                backplane: self.backplane,
            }),
        })
    }
}

impl Default for HybridCacheBuilder {
    fn default() -> Self {
        Self::new()
    }
}
