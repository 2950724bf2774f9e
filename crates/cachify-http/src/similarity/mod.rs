//! Similarity-based request caching.
//!
//! Requests are canonicalized, fingerprinted with SimHash, and indexed by
//! LSH bands. A lookup probes the exact canonical key first, then scans
//! banded candidates and serves the best-scoring one above the threshold.

pub mod canonical;
pub mod index;
pub mod scorer;
pub mod simhash;

pub use canonical::{canonicalize, is_json_content_type};
pub use index::{IndexEntry, SimilarityIndex};
pub use scorer::{CosineScorer, Embedder, EmbeddingScorer, score_candidate};
pub use simhash::{Fingerprint, bands, fingerprint, signature_score};

use std::collections::HashSet;
use std::sync::Arc;

use axum::http::request::Parts;
use bytes::Bytes;
use time::OffsetDateTime;

use cachify::HybridCache;
use cachify_core::SharedClock;

use crate::config::SimilarityConfig;
use crate::entry::CachedHttpResponse;
use crate::key;
use crate::metrics;
use crate::policy::CachePolicy;

/// Predicate deciding whether a request is expensive enough to warrant the
/// candidate scan.
pub type CostPredicate = Arc<dyn Fn(&Parts) -> bool + Send + Sync>;

/// Everything derived from one request needed for lookup and write-back.
#[derive(Debug, Clone)]
pub struct SimilarityRequest {
    /// `http:req:sim:<hex>` exact canonical key.
    pub cache_key: String,
    pub fingerprint: Fingerprint,
    pub hash_prefix: u64,
    pub embedding: Option<Vec<f32>>,
}

/// Outcome of a similarity lookup.
#[derive(Debug)]
pub enum SimilarityLookup {
    Hit {
        cache_key: String,
        score: f64,
        entry: CachedHttpResponse,
    },
    Miss,
}

/// The similarity subsystem: canonicalizer, signer, index, and scorer glue.
pub struct SimilarityLayer {
    config: SimilarityConfig,
    index: SimilarityIndex,
    clock: SharedClock,
    ignored_fields: HashSet<String>,
    max_entry_age: time::Duration,
    only_if_costly: Option<CostPredicate>,
    embedder: Option<Arc<dyn Embedder>>,
    embedding_scorer: Option<Arc<dyn EmbeddingScorer>>,
}

impl SimilarityLayer {
    pub fn new(config: SimilarityConfig, clock: SharedClock) -> Self {
        let ignored_fields = config.ignored_json_fields.iter().cloned().collect();
        let max_entry_age =
            time::Duration::try_from(config.max_entry_age).unwrap_or(time::Duration::MAX);
        let embedding_scorer: Option<Arc<dyn EmbeddingScorer>> = if config.use_embedding_scorer {
            Some(Arc::new(CosineScorer))
        } else {
            None
        };
        Self {
            index: SimilarityIndex::new(config.max_index_entries),
            ignored_fields,
            max_entry_age,
            config,
            clock,
            only_if_costly: None,
            embedder: None,
            embedding_scorer,
        }
    }

    /// Gate the candidate scan on a cost heuristic.
    pub fn with_cost_predicate(mut self, predicate: CostPredicate) -> Self {
        self.only_if_costly = Some(predicate);
        self
    }

    /// Plug in an embedding source for embedding-based scoring.
    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Replace the default cosine scorer.
    pub fn with_embedding_scorer(mut self, scorer: Arc<dyn EmbeddingScorer>) -> Self {
        self.embedding_scorer = Some(scorer);
        self
    }

    pub fn index_len(&self) -> usize {
        self.index.len()
    }

    /// Canonicalize and fingerprint a request.
    ///
    /// `None` disables similarity handling for this request: the body failed
    /// to canonicalize or the canonical payload exceeds the configured cap.
    pub fn prepare(
        &self,
        parts: &Parts,
        body: &Bytes,
        policy: &CachePolicy,
    ) -> Option<SimilarityRequest> {
        let content_type = parts
            .headers
            .get(axum::http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok());
        let canonical_body = canonicalize(content_type, body, &self.ignored_fields)?;

        let payload = key::canonical_string(
            &parts.method,
            &parts.uri,
            &parts.headers,
            &policy.vary_by_headers,
            Some(&canonical_body),
        );
        if payload.len() > self.config.max_canonical_length {
            tracing::debug!(
                length = payload.len(),
                limit = self.config.max_canonical_length,
                "canonical payload too long; similarity disabled for request"
            );
            return None;
        }

        let fingerprint = fingerprint(&canonical_body, self.config.max_tokens);
        let embedding = self.embed(&canonical_body);

        Some(SimilarityRequest {
            cache_key: key::similarity_key(&payload),
            fingerprint,
            hash_prefix: key::hash_prefix(&payload),
            embedding,
        })
    }

    fn embed(&self, canonical_body: &str) -> Option<Vec<f32>> {
        if !self.config.use_embedding_scorer {
            return None;
        }
        let embedder = self.embedder.as_ref()?;
        let mut embedding = embedder.embed(canonical_body)?;
        embedding.truncate(self.config.max_embedding_length);
        Some(embedding)
    }

    /// Exact probe, then the banded candidate scan.
    pub async fn lookup(
        &self,
        cache: &HybridCache,
        request: &SimilarityRequest,
        parts: &Parts,
    ) -> SimilarityLookup {
        // 1. Exact probe: identical canonical payloads share a key.
        if let Ok(Some(raw)) = cache.get(&request.cache_key).await {
            match CachedHttpResponse::decode(&raw) {
                Ok(entry) => {
                    metrics::record_similarity_hit();
                    tracing::debug!(
                        key = %request.cache_key,
                        mode = "similarity",
                        served_from_cache = true,
                        best_score = 1.0,
                        "similarity exact hit"
                    );
                    return SimilarityLookup::Hit {
                        cache_key: request.cache_key.clone(),
                        score: 1.0,
                        entry,
                    };
                }
                Err(e) => {
                    tracing::warn!(error = %e, key = %request.cache_key, "unreadable cached response");
                }
            }
        }

        if !self.probe_permitted(parts) {
            metrics::record_similarity_miss();
            return SimilarityLookup::Miss;
        }

        // 2. Candidate scan.
        let candidates = self
            .index
            .candidates(request.fingerprint.signature, self.config.max_candidates);
        metrics::record_similarity_candidates(candidates.len());

        let now = self.clock.now();
        let mut best: Option<(IndexEntry, f64)> = None;
        for candidate in candidates {
            if now - candidate.cached_at > self.max_entry_age {
                self.index.remove(&candidate.cache_key);
                continue;
            }
            let score = score_candidate(
                request.fingerprint.signature,
                request.embedding.as_deref(),
                &candidate,
                self.embedding_scorer.as_deref(),
            );
            let better = match &best {
                None => true,
                Some((current, current_score)) => {
                    score > *current_score
                        || (score == *current_score
                            && candidate.hash_prefix == request.hash_prefix
                            && current.hash_prefix != request.hash_prefix)
                }
            };
            if better {
                best = Some((candidate, score));
            }
        }

        let Some((winner, score)) = best else {
            metrics::record_similarity_miss();
            return SimilarityLookup::Miss;
        };
        metrics::record_similarity_best_score(score);

        if score < self.config.min_similarity {
            metrics::record_similarity_miss();
            tracing::debug!(
                mode = "similarity",
                served_from_cache = false,
                best_score = score,
                "best candidate below threshold"
            );
            return SimilarityLookup::Miss;
        }

        // 3. The candidate's backing entry may have expired out from under
        // the index.
        match cache.get(&winner.cache_key).await {
            Ok(Some(raw)) => match CachedHttpResponse::decode(&raw) {
                Ok(entry) => {
                    metrics::record_similarity_hit();
                    tracing::debug!(
                        key = %winner.cache_key,
                        mode = "similarity",
                        served_from_cache = true,
                        best_score = score,
                        "similarity candidate hit"
                    );
                    SimilarityLookup::Hit {
                        cache_key: winner.cache_key,
                        score,
                        entry,
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, key = %winner.cache_key, "unreadable cached response");
                    self.index.remove(&winner.cache_key);
                    metrics::record_similarity_miss();
                    SimilarityLookup::Miss
                }
            },
            _ => {
                self.index.remove(&winner.cache_key);
                metrics::record_similarity_miss();
                SimilarityLookup::Miss
            }
        }
    }

    fn probe_permitted(&self, parts: &Parts) -> bool {
        if !self.config.enabled {
            return false;
        }
        if let Some(predicate) = &self.only_if_costly {
            if !predicate(parts) {
                return false;
            }
        }
        self.config
            .required_headers
            .iter()
            .all(|name| parts.headers.contains_key(name.as_str()))
    }

    /// Index a stored response for future candidate scans.
    pub fn record(&self, request: &SimilarityRequest, cached_at: OffsetDateTime) {
        self.index.add_or_update(IndexEntry {
            cache_key: request.cache_key.clone(),
            signature: request.fingerprint.signature,
            token_count: request.fingerprint.token_count,
            hash_prefix: request.hash_prefix,
            cached_at,
            embedding: request.embedding.clone(),
        });
    }
}
