//! Message envelope codec.
//!
//! The backend wraps every JSON payload as a quoted string argument inside
//! its remote-invocation envelope, so outbound documents are serialized and
//! then every double-quote is prefixed with a backslash. Inbound bodies get
//! the inverse treatment. Both directions must match the backend exactly;
//! this double-encoding is a protocol fact, not a choice made here.

use serde_json::{Map, Value};
use tracing::warn;

/// Serializes a document for the wire, injecting the device id.
///
/// Object documents get a `device_id` field inserted (overwriting any caller
/// value); non-object documents are passed through unchanged. Every `"` in
/// the serialized text is escaped with a backslash.
pub fn encode(doc: &Value, device_id: &str) -> String {
    let mut doc = doc.clone();
    if let Some(obj) = doc.as_object_mut() {
        obj.insert("device_id".to_string(), Value::String(device_id.to_string()));
    }

    let serialized = doc.to_string();
    let mut escaped = String::with_capacity(serialized.len() + 16);
    for ch in serialized.chars() {
        if ch == '"' {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

/// Parses an inbound body back into a document.
///
/// Trims surrounding whitespace and strips every backslash before parsing.
/// Stripping ALL backslashes (not just the ones escaping quotes) mirrors the
/// deployed firmware and is load-bearing for backend compatibility, even
/// though it mangles payloads that legitimately contain backslashes. Parse
/// failures are logged and yield an empty object; callers treat missing
/// fields as "use default".
pub fn decode(text: &str) -> Value {
    let stripped: String = text.trim().chars().filter(|&c| c != '\\').collect();

    match serde_json::from_str(&stripped) {
        Ok(value) => value,
        Err(e) => {
            warn!("Failed to parse inbound payload ({}): {}", e, stripped);
            Value::Object(Map::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn encode_injects_device_id_and_escapes_quotes() {
        let encoded = encode(&json!({"temp": 21.5}), "7");
        assert!(encoded.contains(r#"\"device_id\":\"7\""#));
        assert!(encoded.contains(r#"\"temp\":21.5"#));

        // every quote on the wire must carry its escape
        let bytes = encoded.as_bytes();
        for (i, &b) in bytes.iter().enumerate() {
            if b == b'"' {
                assert_eq!(bytes[i - 1], b'\\', "unescaped quote at {}", i);
            }
        }
    }

    #[test]
    fn round_trip_preserves_fields() {
        let doc = json!({
            "name": "probe",
            "count": 3,
            "nested": {"ok": true, "list": [1, 2, 3]}
        });

        let decoded = decode(&encode(&doc, "9"));
        assert_eq!(decoded["name"], "probe");
        assert_eq!(decoded["count"], 3);
        assert_eq!(decoded["nested"]["ok"], true);
        assert_eq!(decoded["nested"]["list"], json!([1, 2, 3]));
        assert_eq!(decoded["device_id"], "9");
    }

    #[test]
    fn decode_trims_whitespace() {
        let decoded = decode("  {\\\"a\\\": 1}\n");
        assert_eq!(decoded["a"], 1);
    }

    #[test]
    fn decode_failure_yields_empty_object() {
        let decoded = decode("not json at all");
        assert!(decoded.as_object().map(|o| o.is_empty()).unwrap_or(false));
    }

    #[test]
    fn decode_accepts_unescaped_json_too() {
        let decoded = decode(r#"{"id": "12", "updateInterval": 4000}"#);
        assert_eq!(decoded["id"], "12");
        assert_eq!(decoded["updateInterval"], 4000);
    }
}
