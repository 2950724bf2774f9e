//! Canonical cache key derivation.
//!
//! The canonical string concatenates the selected request components with
//! `|` in a fixed order: method, path, sorted query pairs, sorted vary-by
//! headers, optional body hash. The cache key is the SHA-256 hex digest of
//! that string under the `http:req:` prefix (`http:req:sim:` for
//! similarity-mode keys).

use axum::http::{HeaderMap, Method, Uri};
use sha2::{Digest, Sha256};

/// Prefix for exact-mode request keys.
pub const EXACT_KEY_PREFIX: &str = "http:req:";
/// Prefix for similarity-mode request keys.
pub const SIMILARITY_KEY_PREFIX: &str = "http:req:sim:";

/// Build the canonical string for a request.
///
/// `body_component` is the hex SHA-256 of the request body in exact mode,
/// or the canonicalized body in similarity mode; absent when the policy
/// excludes the body.
pub fn canonical_string(
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    vary_by_headers: &[String],
    body_component: Option<&str>,
) -> String {
    let mut parts: Vec<String> = Vec::with_capacity(5);
    parts.push(method.as_str().to_string());
    parts.push(uri.path().to_ascii_lowercase());
    parts.push(sorted_query(uri));
    parts.push(sorted_vary_headers(headers, vary_by_headers));
    if let Some(body_component) = body_component {
        parts.push(body_component.to_string());
    }
    parts.join("|")
}

/// Query pairs sorted by key then value, re-joined as `k=v&k=v`.
fn sorted_query(uri: &Uri) -> String {
    let Some(query) = uri.query() else {
        return String::new();
    };
    let mut pairs: Vec<(String, String)> = url::form_urlencoded::parse(query.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.sort();
    pairs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// Vary-by headers sorted by lowercased name, each rendered as
/// `name:v1,v2` with values trimmed.
fn sorted_vary_headers(headers: &HeaderMap, vary_by: &[String]) -> String {
    let mut names: Vec<String> = vary_by.iter().map(|n| n.to_ascii_lowercase()).collect();
    names.sort();
    names.dedup();

    let mut rendered = Vec::with_capacity(names.len());
    for name in names {
        let values: Vec<&str> = headers
            .get_all(&name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(str::trim)
            .collect();
        if !values.is_empty() {
            rendered.push(format!("{name}:{}", values.join(",")));
        }
    }
    rendered.join("|")
}

/// Hex SHA-256 of arbitrary bytes.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex_encode(&hasher.finalize())
}

/// Exact-mode cache key for a canonical string.
pub fn exact_key(canonical: &str) -> String {
    format!("{EXACT_KEY_PREFIX}{}", sha256_hex(canonical.as_bytes()))
}

/// Similarity-mode cache key for a canonical payload.
pub fn similarity_key(canonical: &str) -> String {
    format!(
        "{SIMILARITY_KEY_PREFIX}{}",
        sha256_hex(canonical.as_bytes())
    )
}

/// First 8 bytes of the SHA-256 digest, little-endian, for tie-breaking.
pub fn hash_prefix(canonical: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let digest = hasher.finalize();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(prefix)
}

fn hex_encode(data: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(data.len() * 2);
    for byte in data {
        let _ = write!(out, "{byte:02x}");
    }
    out
}
