//! Payload canonicalization.
//!
//! JSON bodies are rewritten with keys in ascending order and volatile
//! fields dropped, so cosmetically different payloads (key order, ignored
//! ids/timestamps) canonicalize identically. Non-JSON bodies are lowercased
//! with whitespace runs collapsed. A payload that cannot be canonicalized
//! opts the request out of similarity handling.

use std::collections::HashSet;

use serde_json::Value;

/// Whether a content type is treated as JSON.
pub fn is_json_content_type(content_type: Option<&str>) -> bool {
    let Some(content_type) = content_type else {
        return false;
    };
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    essence == "application/json" || essence.ends_with("+json")
}

/// Canonicalize a request body.
///
/// Returns `None` when the body is not valid UTF-8, or claims to be JSON
/// but does not parse.
pub fn canonicalize(
    content_type: Option<&str>,
    body: &[u8],
    ignored_json_fields: &HashSet<String>,
) -> Option<String> {
    let text = std::str::from_utf8(body).ok()?;
    if is_json_content_type(content_type) {
        let value: Value = serde_json::from_str(text).ok()?;
        let mut out = String::with_capacity(text.len());
        write_value(&value, ignored_json_fields, &mut out);
        Some(out)
    } else {
        Some(normalize_text(text))
    }
}

/// Recursive canonical JSON emission: sorted keys, ignored fields skipped,
/// scalars in raw text form.
fn write_value(value: &Value, ignored: &HashSet<String>, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => out.push_str(s),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(item, ignored, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            let mut first = true;
            for key in keys {
                if ignored.contains(key.as_str()) {
                    continue;
                }
                if !first {
                    out.push(',');
                }
                first = false;
                out.push_str(key);
                out.push(':');
                write_value(&map[key], ignored, out);
            }
            out.push('}');
        }
    }
}

/// Unicode-lowercase, collapse whitespace runs, trim.
fn normalize_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending_space = false;
    for c in text.chars() {
        if c.is_whitespace() {
            pending_space = !out.is_empty();
            continue;
        }
        if pending_space {
            out.push(' ');
            pending_space = false;
        }
        for lower in c.to_lowercase() {
            out.push(lower);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ignored(fields: &[&str]) -> HashSet<String> {
        fields.iter().map(|s| s.to_string()).collect()
    }

    const JSON: Option<&str> = Some("application/json");

    #[test]
    fn test_json_content_type_detection() {
        assert!(is_json_content_type(Some("application/json")));
        assert!(is_json_content_type(Some("application/json; charset=utf-8")));
        assert!(is_json_content_type(Some("application/fhir+json")));
        assert!(!is_json_content_type(Some("text/plain")));
        assert!(!is_json_content_type(None));
    }

    #[test]
    fn test_json_keys_are_sorted() {
        let a = canonicalize(JSON, br#"{"b":1,"a":2}"#, &ignored(&[])).unwrap();
        let b = canonicalize(JSON, br#"{"a":2,"b":1}"#, &ignored(&[])).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, "{a:2,b:1}");
    }

    #[test]
    fn test_ignored_fields_are_dropped_recursively() {
        let canonical = canonicalize(
            JSON,
            br#"{"prompt":"hi","id":"1","nested":{"id":"2","x":1}}"#,
            &ignored(&["id"]),
        )
        .unwrap();
        assert_eq!(canonical, "{nested:{x:1},prompt:hi}");
    }

    #[test]
    fn test_near_duplicates_differing_only_in_ignored_fields_match() {
        let fields = ignored(&["id"]);
        let a = canonicalize(JSON, br#"{"prompt":"hello world","id":"1"}"#, &fields).unwrap();
        let b = canonicalize(JSON, br#"{"prompt":"hello world","id":"2"}"#, &fields).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_scalars_render_as_raw_text() {
        let canonical = canonicalize(
            JSON,
            br#"{"n":1.5,"t":true,"f":false,"z":null,"s":"text"}"#,
            &ignored(&[]),
        )
        .unwrap();
        assert_eq!(canonical, "{f:false,n:1.5,s:text,t:true,z:null}");
    }

    #[test]
    fn test_arrays_preserve_order() {
        let canonical = canonicalize(JSON, br#"{"a":[3,1,2]}"#, &ignored(&[])).unwrap();
        assert_eq!(canonical, "{a:[3,1,2]}");
    }

    #[test]
    fn test_malformed_json_aborts() {
        assert!(canonicalize(JSON, br#"{"a":"#, &ignored(&[])).is_none());
    }

    #[test]
    fn test_invalid_utf8_aborts() {
        assert!(canonicalize(Some("text/plain"), &[0xff, 0xfe], &ignored(&[])).is_none());
    }

    #[test]
    fn test_text_normalization() {
        let canonical =
            canonicalize(Some("text/plain"), b"  Hello   WORLD\n\tagain  ", &ignored(&[]))
                .unwrap();
        assert_eq!(canonical, "hello world again");
    }

    #[test]
    fn test_canonicalize_then_reparse_is_stable() {
        let fields = ignored(&["id"]);
        let once = canonicalize(JSON, br#"{"b":{"d":2,"c":1},"a":[true,null]}"#, &fields).unwrap();
        // Re-canonicalizing the canonical form as text leaves it unchanged.
        let twice = canonicalize(Some("text/plain"), once.as_bytes(), &fields).unwrap();
        assert_eq!(once, twice);
    }
}
