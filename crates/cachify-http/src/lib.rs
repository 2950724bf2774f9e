//! HTTP request caching for axum services.
//!
//! A middleware that fronts expensive handlers (LLM calls, costly queries)
//! with the cachify facade. Two matching modes:
//!
//! - **Exact**: requests are keyed by a canonical SHA-256 of method, path,
//!   query, vary-by headers, and body hash.
//! - **Similarity**: near-duplicate request payloads (SimHash over the
//!   canonicalized body) are served from cache above a score threshold.
//!
//! ```ignore
//! let cache = HybridCache::builder().build()?;
//! let state = RequestCacheState::new(cache, RequestCacheConfig::default())?;
//! let app = Router::new()
//!     .route("/data", post(handler))
//!     .layer(middleware::from_fn_with_state(state, request_cache_middleware));
//! ```

pub mod config;
pub mod entry;
pub mod key;
pub mod metrics;
pub mod middleware;
pub mod policy;
pub mod similarity;

pub use config::{CacheMode, RequestCacheConfig, ResponseHeadersConfig, SimilarityConfig};
pub use entry::{CachedHttpResponse, HEADER_DENYLIST};
pub use key::{EXACT_KEY_PREFIX, SIMILARITY_KEY_PREFIX};
pub use middleware::{RequestCacheState, request_cache_middleware};
pub use policy::{CachePolicy, CachePolicyOverride};
pub use similarity::{
    CosineScorer, Embedder, EmbeddingScorer, Fingerprint, SimilarityIndex, SimilarityLayer,
    SimilarityLookup, SimilarityRequest,
};
