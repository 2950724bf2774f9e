//! Versioned wire envelope for invalidation messages.
//!
//! JSON on the wire, keys exactly `v`, `src`, `key`, `tag`, `items`.
//! Null-valued optionals are omitted; unknown fields are ignored on receipt.
//! Messages whose version differs from [`WIRE_VERSION`] are dropped.

use serde::{Deserialize, Serialize};

use cachify_core::{CacheError, Result};

/// Current wire version.
pub const WIRE_VERSION: u32 = 1;

/// One invalidation to apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invalidation {
    Key(String),
    Tag(String),
}

/// A single `{key?, tag?}` element of a batched message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

impl From<&Invalidation> for InvalidationItem {
    fn from(inv: &Invalidation) -> Self {
        match inv {
            Invalidation::Key(key) => Self {
                key: Some(key.clone()),
                tag: None,
            },
            Invalidation::Tag(tag) => Self {
                key: None,
                tag: Some(tag.clone()),
            },
        }
    }
}

/// The envelope carried on the backplane channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationMessage {
    pub v: u32,
    pub src: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Vec<InvalidationItem>>,
}

impl InvalidationMessage {
    /// Single-item message.
    pub fn single(src: impl Into<String>, invalidation: &Invalidation) -> Self {
        let (key, tag) = match invalidation {
            Invalidation::Key(key) => (Some(key.clone()), None),
            Invalidation::Tag(tag) => (None, Some(tag.clone())),
        };
        Self {
            v: WIRE_VERSION,
            src: src.into(),
            key,
            tag,
            items: None,
        }
    }

    /// Batched message.
    pub fn batch(src: impl Into<String>, invalidations: &[Invalidation]) -> Self {
        Self {
            v: WIRE_VERSION,
            src: src.into(),
            key: None,
            tag: None,
            items: Some(invalidations.iter().map(InvalidationItem::from).collect()),
        }
    }

    /// Serialize for the wire.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse and validate a received payload.
    ///
    /// Rejects version mismatches, empty `src`, and content-free messages.
    pub fn parse(payload: &str) -> Result<Self> {
        let message: Self = serde_json::from_str(payload)?;
        if message.v != WIRE_VERSION {
            return Err(CacheError::WireVersion(message.v));
        }
        if message.src.is_empty() {
            return Err(CacheError::backplane("message is missing src"));
        }
        let has_items = message.items.as_ref().is_some_and(|items| !items.is_empty());
        if message.key.is_none() && message.tag.is_none() && !has_items {
            return Err(CacheError::backplane("message carries no invalidations"));
        }
        Ok(message)
    }

    /// Expand into individual invalidations, in wire order.
    pub fn invalidations(&self) -> Vec<Invalidation> {
        let mut out = Vec::new();
        if let Some(key) = &self.key {
            out.push(Invalidation::Key(key.clone()));
        }
        if let Some(tag) = &self.tag {
            out.push(Invalidation::Tag(tag.clone()));
        }
        if let Some(items) = &self.items {
            for item in items {
                if let Some(key) = &item.key {
                    out.push(Invalidation::Key(key.clone()));
                }
                if let Some(tag) = &item.tag {
                    out.push(Invalidation::Tag(tag.clone()));
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_key_roundtrip() {
        let msg = InvalidationMessage::single("node-a", &Invalidation::Key("user:1".into()));
        let wire = msg.encode().unwrap();
        let back = InvalidationMessage::parse(&wire).unwrap();
        assert_eq!(msg, back);
        assert_eq!(back.invalidations(), vec![Invalidation::Key("user:1".into())]);
    }

    #[test]
    fn test_single_tag_roundtrip() {
        let msg = InvalidationMessage::single("node-a", &Invalidation::Tag("users".into()));
        let back = InvalidationMessage::parse(&msg.encode().unwrap()).unwrap();
        assert_eq!(back.invalidations(), vec![Invalidation::Tag("users".into())]);
    }

    #[test]
    fn test_batch_roundtrip_preserves_order() {
        let invalidations = vec![
            Invalidation::Key("a".into()),
            Invalidation::Tag("t".into()),
            Invalidation::Key("b".into()),
        ];
        let msg = InvalidationMessage::batch("node-a", &invalidations);
        let back = InvalidationMessage::parse(&msg.encode().unwrap()).unwrap();
        assert_eq!(back.invalidations(), invalidations);
    }

    #[test]
    fn test_null_optionals_are_omitted() {
        let msg = InvalidationMessage::single("node-a", &Invalidation::Key("k".into()));
        let wire = msg.encode().unwrap();
        assert!(!wire.contains("tag"));
        assert!(!wire.contains("items"));
        assert!(!wire.contains("null"));
    }

    #[test]
    fn test_wire_version_mismatch_is_rejected() {
        let err =
            InvalidationMessage::parse(r#"{"v":2,"src":"node-a","key":"k"}"#).unwrap_err();
        assert!(matches!(err, CacheError::WireVersion(2)));
    }

    #[test]
    fn test_empty_src_is_rejected() {
        let err = InvalidationMessage::parse(r#"{"v":1,"src":"","key":"k"}"#).unwrap_err();
        assert!(err.to_string().contains("missing src"));
    }

    #[test]
    fn test_content_free_message_is_rejected() {
        assert!(InvalidationMessage::parse(r#"{"v":1,"src":"node-a"}"#).is_err());
        assert!(InvalidationMessage::parse(r#"{"v":1,"src":"node-a","items":[]}"#).is_err());
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        let msg =
            InvalidationMessage::parse(r#"{"v":1,"src":"node-a","key":"k","extra":42}"#).unwrap();
        assert_eq!(msg.key.as_deref(), Some("k"));
    }

    #[test]
    fn test_malformed_json_is_a_serialization_error() {
        let err = InvalidationMessage::parse("{ nope").unwrap_err();
        assert!(matches!(err, CacheError::Serialization(_)));
    }

    #[test]
    fn test_wire_field_names_are_exact() {
        let msg = InvalidationMessage::batch("node-a", &[Invalidation::Key("k".into())]);
        let wire = msg.encode().unwrap();
        assert_eq!(
            wire,
            r#"{"v":1,"src":"node-a","items":[{"key":"k"}]}"#
        );
    }
}
