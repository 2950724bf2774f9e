//! Metrics for the request-cache workflow.

use metrics::{counter, histogram};

/// Metric names as constants for consistency.
pub mod names {
    pub const SIMILARITY_CACHE_HIT: &str = "similarity_cache_hit";
    pub const SIMILARITY_CACHE_MISS: &str = "similarity_cache_miss";
    pub const SIMILARITY_CANDIDATES_COUNT: &str = "similarity_candidates_count";
    pub const SIMILARITY_BEST_SCORE_HISTOGRAM: &str = "similarity_best_score_histogram";
}

/// Record a similarity-mode cache hit (exact or scored).
pub fn record_similarity_hit() {
    counter!(names::SIMILARITY_CACHE_HIT).increment(1);
}

/// Record a similarity-mode cache miss.
pub fn record_similarity_miss() {
    counter!(names::SIMILARITY_CACHE_MISS).increment(1);
}

/// Record how many candidates a probe scanned.
pub fn record_similarity_candidates(count: usize) {
    counter!(names::SIMILARITY_CANDIDATES_COUNT).increment(count as u64);
}

/// Record the best score a probe observed.
pub fn record_similarity_best_score(score: f64) {
    histogram!(names::SIMILARITY_BEST_SCORE_HISTOGRAM).record(score);
}
