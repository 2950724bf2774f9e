//! Request-cache and similarity configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How request keys are matched against cached entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CacheMode {
    /// Byte-exact canonical key match.
    #[default]
    Exact,
    /// Exact probe first, then SimHash nearest-neighbor lookup.
    Similarity,
}

/// Global request-cache configuration. Per-route policies override
/// individual fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestCacheConfig {
    #[serde(default)]
    pub mode: CacheMode,
    #[serde(default = "default_duration")]
    pub default_duration: Duration,
    #[serde(default = "default_methods")]
    pub cacheable_methods: Vec<String>,
    #[serde(default = "default_status_codes")]
    pub cacheable_status_codes: Vec<u16>,
    /// Empty means any request content type.
    #[serde(default)]
    pub allowed_request_content_types: Vec<String>,
    /// Empty means any response content type.
    #[serde(default)]
    pub allowed_response_content_types: Vec<String>,
    /// Path prefixes eligible for caching; empty means all paths.
    #[serde(default)]
    pub included_paths: Vec<String>,
    /// Path prefixes never cached.
    #[serde(default)]
    pub excluded_paths: Vec<String>,
    /// Header names folded into the cache key.
    #[serde(default)]
    pub vary_by_headers: Vec<String>,
    #[serde(default = "default_true")]
    pub include_body: bool,
    #[serde(default = "default_max_request_body")]
    pub max_request_body_size_bytes: usize,
    #[serde(default = "default_max_response_body")]
    pub max_response_body_size_bytes: usize,
    #[serde(default)]
    pub cache_authenticated_responses: bool,
    #[serde(default = "default_true")]
    pub respect_request_cache_control: bool,
    #[serde(default = "default_true")]
    pub respect_response_cache_control: bool,
    #[serde(default)]
    pub allow_set_cookie_responses: bool,
    #[serde(default = "default_true")]
    pub enable_response_buffering: bool,
    #[serde(default)]
    pub response_headers: ResponseHeadersConfig,
    #[serde(default)]
    pub similarity: SimilarityConfig,
}

fn default_duration() -> Duration {
    Duration::from_secs(60)
}

fn default_methods() -> Vec<String> {
    vec!["GET".to_string(), "HEAD".to_string()]
}

fn default_status_codes() -> Vec<u16> {
    vec![200]
}

fn default_max_request_body() -> usize {
    256 * 1024
}

fn default_max_response_body() -> usize {
    1024 * 1024
}

fn default_true() -> bool {
    true
}

impl Default for RequestCacheConfig {
    fn default() -> Self {
        Self {
            mode: CacheMode::Exact,
            default_duration: default_duration(),
            cacheable_methods: default_methods(),
            cacheable_status_codes: default_status_codes(),
            allowed_request_content_types: Vec::new(),
            allowed_response_content_types: Vec::new(),
            included_paths: Vec::new(),
            excluded_paths: Vec::new(),
            vary_by_headers: Vec::new(),
            include_body: true,
            max_request_body_size_bytes: default_max_request_body(),
            max_response_body_size_bytes: default_max_response_body(),
            cache_authenticated_responses: false,
            respect_request_cache_control: true,
            respect_response_cache_control: true,
            allow_set_cookie_responses: false,
            enable_response_buffering: true,
            response_headers: ResponseHeadersConfig::default(),
            similarity: SimilarityConfig::default(),
        }
    }
}

impl RequestCacheConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.default_duration.is_zero() {
            return Err("default_duration must be > 0".into());
        }
        if self.cacheable_methods.is_empty() {
            return Err("cacheable_methods must not be empty".into());
        }
        if self.cacheable_status_codes.is_empty() {
            return Err("cacheable_status_codes must not be empty".into());
        }
        if self.mode == CacheMode::Similarity && !self.similarity.enabled {
            return Err("similarity mode requires similarity.enabled".into());
        }
        self.similarity.validate()
    }
}

/// Which metadata headers the middleware emits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseHeadersConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cache_status_header")]
    pub cache_status_header: String,
    #[serde(default = "default_cache_stale_header")]
    pub cache_stale_header: String,
    #[serde(default = "default_similarity_header")]
    pub similarity_header: String,
    #[serde(default = "default_cache_key_header")]
    pub cache_key_header: String,
    /// Off by default: cache keys can leak key-derivation details.
    #[serde(default)]
    pub include_cache_key: bool,
}

fn default_cache_status_header() -> String {
    "X-Cachify-Cache".to_string()
}

fn default_cache_stale_header() -> String {
    "X-Cachify-Cache-Stale".to_string()
}

fn default_similarity_header() -> String {
    "X-Cachify-Cache-Similarity".to_string()
}

fn default_cache_key_header() -> String {
    "X-Cachify-Cache-Key".to_string()
}

impl Default for ResponseHeadersConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cache_status_header: default_cache_status_header(),
            cache_stale_header: default_cache_stale_header(),
            similarity_header: default_similarity_header(),
            cache_key_header: default_cache_key_header(),
            include_cache_key: false,
        }
    }
}

/// Similarity subsystem configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimilarityConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Minimum score for a candidate to count as a hit.
    #[serde(default = "default_min_similarity")]
    pub min_similarity: f64,
    /// Candidates older than this are evicted on sight.
    #[serde(default = "default_max_entry_age")]
    pub max_entry_age: Duration,
    #[serde(default = "default_max_index_entries")]
    pub max_index_entries: usize,
    #[serde(default = "default_max_candidates")]
    pub max_candidates: usize,
    #[serde(default = "default_max_canonical_length")]
    pub max_canonical_length: usize,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_ignored_json_fields")]
    pub ignored_json_fields: Vec<String>,
    /// Headers that must be present for the similarity probe to run.
    #[serde(default)]
    pub required_headers: Vec<String>,
    #[serde(default)]
    pub use_embedding_scorer: bool,
    #[serde(default = "default_max_embedding_length")]
    pub max_embedding_length: usize,
}

fn default_min_similarity() -> f64 {
    0.95
}

fn default_max_entry_age() -> Duration {
    Duration::from_secs(600)
}

fn default_max_index_entries() -> usize {
    1024
}

fn default_max_candidates() -> usize {
    64
}

fn default_max_canonical_length() -> usize {
    16 * 1024
}

fn default_max_tokens() -> usize {
    512
}

fn default_ignored_json_fields() -> Vec<String> {
    ["id", "timestamp", "created_at", "updated_at"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_max_embedding_length() -> usize {
    512
}

impl Default for SimilarityConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_similarity: default_min_similarity(),
            max_entry_age: default_max_entry_age(),
            max_index_entries: default_max_index_entries(),
            max_candidates: default_max_candidates(),
            max_canonical_length: default_max_canonical_length(),
            max_tokens: default_max_tokens(),
            ignored_json_fields: default_ignored_json_fields(),
            required_headers: Vec::new(),
            use_embedding_scorer: false,
            max_embedding_length: default_max_embedding_length(),
        }
    }
}

impl SimilarityConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.min_similarity) {
            return Err("similarity.min_similarity must be in [0, 1]".into());
        }
        if self.enabled && self.max_index_entries == 0 {
            return Err("similarity.max_index_entries must be > 0".into());
        }
        if self.enabled && self.max_candidates == 0 {
            return Err("similarity.max_candidates must be > 0".into());
        }
        if self.enabled && self.max_tokens == 0 {
            return Err("similarity.max_tokens must be > 0".into());
        }
        Ok(())
    }
}
