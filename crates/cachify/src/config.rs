//! Configuration for the cache orchestrator and backplane.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use cachify_core::ResilienceOptions;

/// Top-level cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Prepended to every cache key.
    #[serde(default)]
    pub key_prefix: Option<String>,
    /// Used when a per-entry TTL is absent.
    #[serde(default = "default_ttl")]
    pub default_ttl: Duration,
    /// Multiplicative TTL perturbation ratio in `[0, 1)`.
    #[serde(default)]
    pub jitter_ratio: f64,
    /// Surface L2 errors when no stale candidate is available.
    #[serde(default)]
    pub fail_fast_on_l2_errors: bool,
    #[serde(default)]
    pub resilience: ResilienceOptions,
    #[serde(default)]
    pub backplane: BackplaneConfig,
}

fn default_ttl() -> Duration {
    Duration::from_secs(60)
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            key_prefix: None,
            default_ttl: default_ttl(),
            jitter_ratio: 0.0,
            fail_fast_on_l2_errors: false,
            resilience: ResilienceOptions::default(),
            backplane: BackplaneConfig::default(),
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..1.0).contains(&self.jitter_ratio) {
            return Err("jitter_ratio must be in [0, 1)".into());
        }
        if self.default_ttl.is_zero() {
            return Err("default_ttl must be > 0".into());
        }
        self.backplane.validate()
    }
}

/// Backplane configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackplaneConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_channel_name")]
    pub channel_name: String,
    /// Stable publisher identity; a fresh UUID when absent.
    #[serde(default)]
    pub instance_id: Option<String>,
    /// Items per batched message; `0` publishes immediately.
    #[serde(default)]
    pub batch_size: usize,
    /// Max time an enqueued invalidation waits before a flush.
    #[serde(default = "default_batch_window")]
    pub batch_window: Duration,
}

fn default_channel_name() -> String {
    "cachify:invalidate".to_string()
}

fn default_batch_window() -> Duration {
    Duration::from_millis(25)
}

impl Default for BackplaneConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            channel_name: default_channel_name(),
            instance_id: None,
            batch_size: 0,
            batch_window: default_batch_window(),
        }
    }
}

impl BackplaneConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.enabled && self.channel_name.is_empty() {
            return Err("backplane.channel_name must not be empty".into());
        }
        if self.batch_size > 0 && self.batch_window.is_zero() {
            return Err("backplane.batch_window must be > 0 when batching".into());
        }
        if let Some(id) = &self.instance_id {
            if id.is_empty() {
                return Err("backplane.instance_id must not be empty when set".into());
            }
        }
        Ok(())
    }
}

/// Redis connection settings shared by the L2 store and the backplane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_redis_url")]
    pub url: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_pool_size() -> usize {
    8
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: default_redis_url(),
            pool_size: default_pool_size(),
        }
    }
}

impl RedisConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.enabled && self.url.is_empty() {
            return Err("redis.url must not be empty".into());
        }
        if self.enabled && self.pool_size == 0 {
            return Err("redis.pool_size must be > 0".into());
        }
        Ok(())
    }
}
