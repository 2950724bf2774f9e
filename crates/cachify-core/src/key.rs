//! Cache key construction.
//!
//! Keys are opaque UTF-8 strings compared byte-exact. Namespaced keys join
//! the optional prefix, optional region, and user key with `:`. Every entry
//! has a sibling metadata record stored under `<key>:meta`; that suffix is
//! reserved and must not appear in caller keys.

/// Suffix under which entry metadata is stored.
pub const META_SUFFIX: &str = ":meta";

/// Separator between key components.
const SEPARATOR: char = ':';

/// Build a namespaced cache key from optional prefix, optional region, and
/// the user key.
pub fn build_key(prefix: Option<&str>, region: Option<&str>, key: &str) -> String {
    let mut out = String::with_capacity(
        prefix.map_or(0, |p| p.len() + 1) + region.map_or(0, |r| r.len() + 1) + key.len(),
    );
    if let Some(prefix) = prefix.filter(|p| !p.is_empty()) {
        out.push_str(prefix);
        out.push(SEPARATOR);
    }
    if let Some(region) = region.filter(|r| !r.is_empty()) {
        out.push_str(region);
        out.push(SEPARATOR);
    }
    out.push_str(key);
    out
}

/// The key under which metadata for `key` is stored.
pub fn meta_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + META_SUFFIX.len());
    out.push_str(key);
    out.push_str(META_SUFFIX);
    out
}

/// Whether `key` addresses a metadata record.
pub fn is_meta_key(key: &str) -> bool {
    key.ends_with(META_SUFFIX)
}
