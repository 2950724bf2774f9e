//! The stored shape of a cached HTTP response.

use std::collections::BTreeMap;
use std::time::Duration;

use axum::http::{HeaderMap, StatusCode, header};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use cachify_core::Result;

/// Hop-by-hop and generated headers never persisted with a response.
pub const HEADER_DENYLIST: [&str; 6] = [
    "connection",
    "content-length",
    "date",
    "keep-alive",
    "server",
    "transfer-encoding",
];

/// A buffered response persisted through the cache facade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedHttpResponse {
    pub status_code: u16,
    pub body: Vec<u8>,
    /// Header name (lowercased) to its values, denylist already applied.
    pub headers: BTreeMap<String, Vec<String>>,
    pub content_type: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub cached_at: OffsetDateTime,
    /// The resolved cache duration the entry was stored with.
    pub duration: Duration,
}

impl CachedHttpResponse {
    /// Capture a buffered response, stripping denylisted headers.
    pub fn capture(
        status: StatusCode,
        headers: &HeaderMap,
        body: &Bytes,
        cached_at: OffsetDateTime,
        duration: Duration,
    ) -> Self {
        let mut stored: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in headers {
            let name = name.as_str().to_ascii_lowercase();
            if HEADER_DENYLIST.contains(&name.as_str()) {
                continue;
            }
            let Ok(value) = value.to_str() else {
                continue;
            };
            stored.entry(name).or_default().push(value.to_string());
        }

        let content_type = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(String::from);

        Self {
            status_code: status.as_u16(),
            body: body.to_vec(),
            headers: stored,
            content_type,
            cached_at,
            duration,
        }
    }

    /// Whether the entry has outlived its configured duration.
    pub fn is_stale(&self, now: OffsetDateTime) -> bool {
        now > self.cached_at + self.duration
    }

    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(raw)?)
    }
}
