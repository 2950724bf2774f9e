//! Per-entry and resilience options.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Fail-safe and timeout behavior for reads and refreshes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResilienceOptions {
    /// How long past its logical expiration a payload stays eligible as a
    /// stale fallback. Also extends the storage TTL written to the stores.
    #[serde(default)]
    pub fail_safe_max_duration: Duration,
    /// Deadline after which a caller may take a stale value while the
    /// refresh keeps running.
    #[serde(default)]
    pub soft_timeout: Option<Duration>,
    /// Deadline that cancels the factory outright.
    #[serde(default)]
    pub hard_timeout: Option<Duration>,
    /// Keep refreshing in the background after serving stale.
    #[serde(default = "default_true")]
    pub enable_background_refresh: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ResilienceOptions {
    fn default() -> Self {
        Self {
            fail_safe_max_duration: Duration::ZERO,
            soft_timeout: None,
            hard_timeout: None,
            enable_background_refresh: true,
        }
    }
}

impl ResilienceOptions {
    pub fn fail_safe_max_duration(mut self, d: Duration) -> Self {
        self.fail_safe_max_duration = d;
        self
    }

    pub fn soft_timeout(mut self, d: Duration) -> Self {
        self.soft_timeout = Some(d);
        self
    }

    pub fn hard_timeout(mut self, d: Duration) -> Self {
        self.hard_timeout = Some(d);
        self
    }

    pub fn enable_background_refresh(mut self, enabled: bool) -> Self {
        self.enable_background_refresh = enabled;
        self
    }
}

/// Options for a single cache entry. Unset fields fall back to the cache
/// defaults at the call site.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntryOptions {
    #[serde(default)]
    pub ttl: Option<Duration>,
    /// Reset the L1 expiry on every hit.
    #[serde(default)]
    pub sliding_expiration: Option<Duration>,
    /// Multiplicative TTL perturbation ratio in `[0, 1)`.
    #[serde(default)]
    pub jitter_ratio: Option<f64>,
    /// TTL applied when a factory produces an empty value.
    #[serde(default)]
    pub negative_cache_ttl: Option<Duration>,
    #[serde(default)]
    pub key_prefix: Option<String>,
    #[serde(default)]
    pub resilience: Option<ResilienceOptions>,
}

impl EntryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ttl(mut self, d: Duration) -> Self {
        self.ttl = Some(d);
        self
    }

    pub fn sliding_expiration(mut self, d: Duration) -> Self {
        self.sliding_expiration = Some(d);
        self
    }

    pub fn jitter_ratio(mut self, ratio: f64) -> Self {
        self.jitter_ratio = Some(ratio);
        self
    }

    pub fn negative_cache_ttl(mut self, d: Duration) -> Self {
        self.negative_cache_ttl = Some(d);
        self
    }

    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    pub fn resilience(mut self, resilience: ResilienceOptions) -> Self {
        self.resilience = Some(resilience);
        self
    }
}
