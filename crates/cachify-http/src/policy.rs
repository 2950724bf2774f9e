//! Policy resolution and the request/response eligibility pipeline.

use std::time::Duration;

use axum::http::{HeaderMap, Method, StatusCode, header};
use serde::{Deserialize, Serialize};

use crate::config::{CacheMode, RequestCacheConfig};

/// Per-route policy override, attached to a route via
/// `axum::Extension(CachePolicyOverride { .. })`. Unset fields inherit the
/// global configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CachePolicyOverride {
    #[serde(default)]
    pub mode: Option<CacheMode>,
    #[serde(default)]
    pub duration: Option<Duration>,
    #[serde(default)]
    pub cacheable_methods: Option<Vec<String>>,
    #[serde(default)]
    pub cacheable_status_codes: Option<Vec<u16>>,
    #[serde(default)]
    pub vary_by_headers: Option<Vec<String>>,
    #[serde(default)]
    pub include_body: Option<bool>,
    #[serde(default)]
    pub cache_authenticated_responses: Option<bool>,
}

/// The policy in effect for one request after merging global configuration
/// with any per-route override.
#[derive(Debug, Clone)]
pub struct CachePolicy {
    pub mode: CacheMode,
    pub duration: Duration,
    pub cacheable_methods: Vec<String>,
    pub cacheable_status_codes: Vec<u16>,
    pub allowed_request_content_types: Vec<String>,
    pub allowed_response_content_types: Vec<String>,
    pub included_paths: Vec<String>,
    pub excluded_paths: Vec<String>,
    pub vary_by_headers: Vec<String>,
    pub include_body: bool,
    pub max_request_body_size_bytes: usize,
    pub max_response_body_size_bytes: usize,
    pub cache_authenticated_responses: bool,
    pub respect_request_cache_control: bool,
    pub respect_response_cache_control: bool,
    pub allow_set_cookie_responses: bool,
    pub enable_response_buffering: bool,
}

impl CachePolicy {
    /// Merge the global configuration with an optional per-route override.
    pub fn resolve(config: &RequestCacheConfig, route: Option<&CachePolicyOverride>) -> Self {
        Self {
            mode: route.and_then(|r| r.mode).unwrap_or(config.mode),
            duration: route
                .and_then(|r| r.duration)
                .unwrap_or(config.default_duration),
            cacheable_methods: route
                .and_then(|r| r.cacheable_methods.clone())
                .unwrap_or_else(|| config.cacheable_methods.clone()),
            cacheable_status_codes: route
                .and_then(|r| r.cacheable_status_codes.clone())
                .unwrap_or_else(|| config.cacheable_status_codes.clone()),
            allowed_request_content_types: config.allowed_request_content_types.clone(),
            allowed_response_content_types: config.allowed_response_content_types.clone(),
            included_paths: config.included_paths.clone(),
            excluded_paths: config.excluded_paths.clone(),
            vary_by_headers: route
                .and_then(|r| r.vary_by_headers.clone())
                .unwrap_or_else(|| config.vary_by_headers.clone()),
            include_body: route
                .and_then(|r| r.include_body)
                .unwrap_or(config.include_body),
            max_request_body_size_bytes: config.max_request_body_size_bytes,
            max_response_body_size_bytes: config.max_response_body_size_bytes,
            cache_authenticated_responses: route
                .and_then(|r| r.cache_authenticated_responses)
                .unwrap_or(config.cache_authenticated_responses),
            respect_request_cache_control: config.respect_request_cache_control,
            respect_response_cache_control: config.respect_response_cache_control,
            allow_set_cookie_responses: config.allow_set_cookie_responses,
            enable_response_buffering: config.enable_response_buffering,
        }
    }

    /// Whether the request method participates in caching.
    pub fn method_cacheable(&self, method: &Method) -> bool {
        self.cacheable_methods
            .iter()
            .any(|m| m.eq_ignore_ascii_case(method.as_str()))
    }

    /// Include/exclude prefix rules for the request path.
    pub fn path_allowed(&self, path: &str) -> bool {
        if !self.included_paths.is_empty()
            && !self
                .included_paths
                .iter()
                .any(|prefix| path.starts_with(prefix))
        {
            return false;
        }
        !self
            .excluded_paths
            .iter()
            .any(|prefix| path.starts_with(prefix))
    }

    /// Request content-type allow-list; an empty list allows anything.
    pub fn request_content_type_allowed(&self, headers: &HeaderMap) -> bool {
        content_type_allowed(headers, &self.allowed_request_content_types)
    }

    /// Authenticated requests are skipped unless explicitly allowed.
    pub fn authorization_allowed(&self, headers: &HeaderMap) -> bool {
        self.cache_authenticated_responses || !headers.contains_key(header::AUTHORIZATION)
    }

    /// Request `Cache-Control` handling.
    ///
    /// `no-cache` and `private` are deliberately treated like `no-store`,
    /// which is stricter than the HTTP spec: any of the three opts the
    /// request out of caching entirely.
    pub fn request_cache_control_allows(&self, headers: &HeaderMap) -> bool {
        if !self.respect_request_cache_control {
            return true;
        }
        !cache_control_forbids(headers)
    }

    /// Every request-side eligibility rule in one place.
    pub fn request_eligible(&self, method: &Method, path: &str, headers: &HeaderMap) -> bool {
        self.method_cacheable(method)
            && self.path_allowed(path)
            && self.request_content_type_allowed(headers)
            && self.authorization_allowed(headers)
            && self.request_cache_control_allows(headers)
    }

    /// Whether a produced response may be stored.
    pub fn response_cacheable(&self, status: StatusCode, headers: &HeaderMap) -> bool {
        if !self.cacheable_status_codes.contains(&status.as_u16()) {
            return false;
        }
        if !self.allow_set_cookie_responses && headers.contains_key(header::SET_COOKIE) {
            return false;
        }
        if self.respect_response_cache_control && cache_control_forbids(headers) {
            return false;
        }
        content_type_allowed(headers, &self.allowed_response_content_types)
    }
}

fn content_type_allowed(headers: &HeaderMap, allowed: &[String]) -> bool {
    if allowed.is_empty() {
        return true;
    }
    let Some(content_type) = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };
    let content_type = content_type.to_ascii_lowercase();
    allowed
        .iter()
        .any(|candidate| content_type.starts_with(&candidate.to_ascii_lowercase()))
}

fn cache_control_forbids(headers: &HeaderMap) -> bool {
    let Some(cache_control) = headers
        .get(header::CACHE_CONTROL)
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };
    cache_control
        .split(',')
        .map(|directive| directive.trim().to_ascii_lowercase())
        .any(|directive| matches!(directive.as_str(), "no-store" | "no-cache" | "private"))
}
