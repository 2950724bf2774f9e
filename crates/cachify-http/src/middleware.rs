//! The request-cache middleware.
//!
//! Sits in the axum pipeline in front of expensive handlers. Eligible
//! requests are keyed (exact or similarity mode), looked up through the
//! cache facade, and served from cache on a hit; on a miss the downstream
//! response is buffered, stored when cacheable, and passed through.
//!
//! Cache failures never fail a request: every error path degrades to
//! running the pipeline as if uncached.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode, header};
use axum::middleware::Next;
use axum::response::Response;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use futures_util::stream;

use cachify::HybridCache;
use cachify_core::{CacheError, EntryOptions, SharedClock, SystemClock};

use crate::config::{CacheMode, RequestCacheConfig, ResponseHeadersConfig};
use crate::entry::CachedHttpResponse;
use crate::key;
use crate::policy::{CachePolicy, CachePolicyOverride};
use crate::similarity::{SimilarityLayer, SimilarityLookup, SimilarityRequest};

/// Marker ensuring the workflow runs at most once per request, even when
/// the middleware is nested.
#[derive(Clone, Copy)]
struct CacheWorkflowRan;

/// Shared state for [`request_cache_middleware`].
#[derive(Clone)]
pub struct RequestCacheState {
    inner: Arc<RequestCacheInner>,
}

struct RequestCacheInner {
    cache: HybridCache,
    config: RequestCacheConfig,
    clock: SharedClock,
    similarity: Option<Arc<SimilarityLayer>>,
}

impl RequestCacheState {
    /// Build middleware state over a cache facade.
    pub fn new(cache: HybridCache, config: RequestCacheConfig) -> cachify_core::Result<Self> {
        Self::with_clock(cache, config, Arc::new(SystemClock))
    }

    /// Build with an injected clock (tests drive staleness deterministically).
    pub fn with_clock(
        cache: HybridCache,
        config: RequestCacheConfig,
        clock: SharedClock,
    ) -> cachify_core::Result<Self> {
        config.validate().map_err(CacheError::configuration)?;
        let similarity = if config.similarity.enabled {
            Some(Arc::new(SimilarityLayer::new(
                config.similarity.clone(),
                Arc::clone(&clock),
            )))
        } else {
            None
        };
        Ok(Self {
            inner: Arc::new(RequestCacheInner {
                cache,
                config,
                clock,
                similarity,
            }),
        })
    }

    /// Build with a pre-configured similarity layer (cost predicates,
    /// embedders).
    pub fn with_similarity_layer(
        cache: HybridCache,
        config: RequestCacheConfig,
        clock: SharedClock,
        layer: Arc<SimilarityLayer>,
    ) -> cachify_core::Result<Self> {
        config.validate().map_err(CacheError::configuration)?;
        Ok(Self {
            inner: Arc::new(RequestCacheInner {
                cache,
                config,
                clock,
                similarity: Some(layer),
            }),
        })
    }

    pub fn cache(&self) -> &HybridCache {
        &self.inner.cache
    }

    pub fn similarity(&self) -> Option<&Arc<SimilarityLayer>> {
        self.inner.similarity.as_ref()
    }
}

/// The middleware entry point, for `axum::middleware::from_fn_with_state`.
pub async fn request_cache_middleware(
    State(state): State<RequestCacheState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    if req.extensions().get::<CacheWorkflowRan>().is_some() {
        return next.run(req).await;
    }
    req.extensions_mut().insert(CacheWorkflowRan);

    let route_policy = req.extensions().get::<CachePolicyOverride>().cloned();
    let policy = CachePolicy::resolve(&state.inner.config, route_policy.as_ref());

    if !policy.request_eligible(req.method(), req.uri().path(), req.headers()) {
        return next.run(req).await;
    }

    let needs_body = policy.include_body || policy.mode == CacheMode::Similarity;
    let (parts, body) = req.into_parts();
    let (body_bytes, passthrough_body) = if needs_body {
        match buffer_body(body, policy.max_request_body_size_bytes).await {
            BufferedBody::Complete(bytes) => (Some(bytes.clone()), Body::from(bytes)),
            BufferedBody::Exceeded(rebuilt) => {
                tracing::debug!(
                    limit = policy.max_request_body_size_bytes,
                    "request body exceeds hash limit; caching disabled for request"
                );
                return next.run(Request::from_parts(parts, rebuilt)).await;
            }
        }
    } else {
        (None, body)
    };

    match policy.mode {
        CacheMode::Exact => {
            handle_exact(state, policy, parts, body_bytes, passthrough_body, next).await
        }
        CacheMode::Similarity => {
            handle_similarity(state, policy, parts, body_bytes, passthrough_body, next).await
        }
    }
}

async fn handle_exact(
    state: RequestCacheState,
    policy: CachePolicy,
    parts: Parts,
    body_bytes: Option<Bytes>,
    passthrough_body: Body,
    next: Next,
) -> Response {
    let body_hash = body_bytes
        .as_ref()
        .filter(|_| policy.include_body)
        .map(|bytes| key::sha256_hex(bytes));
    let canonical = key::canonical_string(
        &parts.method,
        &parts.uri,
        &parts.headers,
        &policy.vary_by_headers,
        body_hash.as_deref(),
    );
    let cache_key = key::exact_key(&canonical);
    let is_head = parts.method == Method::HEAD;

    match state.inner.cache.get(&cache_key).await {
        Ok(Some(raw)) => match CachedHttpResponse::decode(&raw) {
            Ok(entry) => return render_hit(&state, entry, is_head, None, &cache_key),
            Err(e) => {
                tracing::warn!(error = %e, key = %cache_key, "unreadable cached response");
            }
        },
        Ok(None) => {}
        Err(e) => {
            tracing::warn!(error = %e, key = %cache_key, "cache lookup failed; proceeding uncached");
        }
    }

    let response = next.run(Request::from_parts(parts, passthrough_body)).await;
    finalize_miss(&state, &policy, response, &cache_key, None).await
}

async fn handle_similarity(
    state: RequestCacheState,
    policy: CachePolicy,
    parts: Parts,
    body_bytes: Option<Bytes>,
    passthrough_body: Body,
    next: Next,
) -> Response {
    let Some(layer) = state.similarity().cloned() else {
        // Similarity mode without a layer: validation prevents this wiring.
        return next.run(Request::from_parts(parts, passthrough_body)).await;
    };
    let body_bytes = body_bytes.unwrap_or_default();

    let Some(sim_request) = layer.prepare(&parts, &body_bytes, &policy) else {
        // Canonicalization failure disables caching, never the request.
        return next.run(Request::from_parts(parts, passthrough_body)).await;
    };
    let is_head = parts.method == Method::HEAD;

    match layer.lookup(&state.inner.cache, &sim_request, &parts).await {
        SimilarityLookup::Hit {
            cache_key,
            score,
            entry,
        } => render_hit(&state, entry, is_head, Some(score), &cache_key),
        SimilarityLookup::Miss => {
            let response = next.run(Request::from_parts(parts, passthrough_body)).await;
            finalize_miss(
                &state,
                &policy,
                response,
                &sim_request.cache_key,
                Some(&sim_request),
            )
            .await
        }
    }
}

/// Buffer the downstream response, store it when cacheable, and emit the
/// miss metadata headers.
async fn finalize_miss(
    state: &RequestCacheState,
    policy: &CachePolicy,
    response: Response,
    cache_key: &str,
    similarity: Option<&SimilarityRequest>,
) -> Response {
    let headers_config = &state.inner.config.response_headers;

    if !policy.enable_response_buffering {
        let mut response = response;
        apply_cache_headers(response.headers_mut(), headers_config, false, false, None, None);
        return response;
    }

    let (parts, body) = response.into_parts();
    let buffered = match buffer_body(body, policy.max_response_body_size_bytes).await {
        BufferedBody::Complete(bytes) => bytes,
        BufferedBody::Exceeded(rebuilt) => {
            tracing::debug!(
                key = %cache_key,
                limit = policy.max_response_body_size_bytes,
                "response body exceeds buffer cap; not cached"
            );
            let mut response = Response::from_parts(parts, rebuilt);
            apply_cache_headers(response.headers_mut(), headers_config, false, false, None, None);
            return response;
        }
    };

    if policy.response_cacheable(parts.status, &parts.headers) {
        let now = state.inner.clock.now();
        let entry =
            CachedHttpResponse::capture(parts.status, &parts.headers, &buffered, now, policy.duration);
        match entry.encode() {
            Ok(raw) => {
                let options = EntryOptions::new().ttl(policy.duration);
                if let Err(e) = state.inner.cache.set(cache_key, raw, Some(&options)).await {
                    tracing::warn!(error = %e, key = %cache_key, "failed to store response");
                } else if let (Some(layer), Some(sim_request)) = (state.similarity(), similarity) {
                    layer.record(sim_request, now);
                }
            }
            Err(e) => tracing::warn!(error = %e, key = %cache_key, "failed to encode response"),
        }
    }

    let mut response = Response::from_parts(parts, Body::from(buffered));
    apply_cache_headers(
        response.headers_mut(),
        headers_config,
        false,
        false,
        None,
        Some(cache_key),
    );
    response
}

/// Rebuild a response from a cached entry.
fn render_hit(
    state: &RequestCacheState,
    entry: CachedHttpResponse,
    is_head: bool,
    similarity_score: Option<f64>,
    cache_key: &str,
) -> Response {
    let stale = entry.is_stale(state.inner.clock.now());
    let status = StatusCode::from_u16(entry.status_code).unwrap_or(StatusCode::OK);

    let mut headers = HeaderMap::new();
    for (name, values) in &entry.headers {
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            continue;
        };
        for value in values {
            if let Ok(value) = HeaderValue::from_str(value) {
                headers.append(name.clone(), value);
            }
        }
    }
    if let Some(content_type) = &entry.content_type {
        if let Ok(value) = HeaderValue::from_str(content_type) {
            headers.insert(header::CONTENT_TYPE, value);
        }
    }
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(entry.body.len()));

    apply_cache_headers(
        &mut headers,
        &state.inner.config.response_headers,
        true,
        stale,
        similarity_score,
        Some(cache_key),
    );

    let body = if is_head {
        Body::empty()
    } else {
        Body::from(entry.body)
    };

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

/// Emit the `X-Cachify-*` metadata headers.
fn apply_cache_headers(
    headers: &mut HeaderMap,
    config: &ResponseHeadersConfig,
    hit: bool,
    stale: bool,
    similarity_score: Option<f64>,
    cache_key: Option<&str>,
) {
    if !config.enabled {
        return;
    }
    insert_header(
        headers,
        &config.cache_status_header,
        if hit { "HIT" } else { "MISS" },
    );
    insert_header(
        headers,
        &config.cache_stale_header,
        if stale { "true" } else { "false" },
    );
    if let Some(score) = similarity_score {
        insert_header(headers, &config.similarity_header, &format!("{score:.3}"));
    }
    if config.include_cache_key {
        if let Some(cache_key) = cache_key {
            insert_header(headers, &config.cache_key_header, cache_key);
        }
    }
}

fn insert_header(headers: &mut HeaderMap, name: &str, value: &str) {
    let (Ok(name), Ok(value)) = (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
    ) else {
        tracing::warn!(header = %name, "invalid cache metadata header");
        return;
    };
    headers.insert(name, value);
}

enum BufferedBody {
    /// The whole body, within the cap.
    Complete(Bytes),
    /// Over the cap: a body that replays the consumed chunks and continues
    /// with the rest of the stream.
    Exceeded(Body),
}

/// Mirror a body into a bounded buffer.
///
/// A body at exactly `limit` bytes buffers; one byte over falls back to
/// streaming. Stream errors are replayed downstream untouched.
async fn buffer_body(body: Body, limit: usize) -> BufferedBody {
    let mut data_stream = body.into_data_stream();
    let mut collected = BytesMut::new();

    while let Some(chunk) = data_stream.next().await {
        match chunk {
            Ok(bytes) => {
                if collected.len() + bytes.len() > limit {
                    let replay = stream::iter(vec![Ok(collected.freeze()), Ok(bytes)])
                        .chain(data_stream);
                    return BufferedBody::Exceeded(Body::from_stream(replay));
                }
                collected.extend_from_slice(&bytes);
            }
            Err(e) => {
                let replay = stream::iter(vec![Ok(collected.freeze()), Err(e)])
                    .chain(data_stream);
                return BufferedBody::Exceeded(Body::from_stream(replay));
            }
        }
    }

    BufferedBody::Complete(collected.freeze())
}
