//! Deterministic hashing of spec fragments.

use sha2::{Digest, Sha256};

/// A spec hash for deterministic comparison.
///
/// Used to detect when a component's unit configuration has changed
/// independently of key order in the source document.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpecHash(String);

impl SpecHash {
    /// Compute a spec hash from canonical JSON.
    pub fn from_json(json: &serde_json::Value) -> Self {
        let canonical = canonical_json(json);
        let digest = Sha256::digest(canonical.as_bytes());
        Self(format!("sha256:{}", hex::encode(&digest[..16])))
    }

    /// Get the hash string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SpecHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Produce canonical JSON (sorted keys, no extra whitespace).
fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by_key(|(k, _)| *k);
            let inner: Vec<String> = pairs
                .iter()
                .map(|(k, v)| format!("{}:{}", quote(k), canonical_json(v)))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        serde_json::Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        serde_json::Value::String(s) => quote(s),
        other => other.to_string(),
    }
}

// serde_json already escapes strings correctly for a bare string value.
fn quote(s: &str) -> String {
    serde_json::Value::String(s.to_string()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_hash_ignores_key_order() {
        let a = serde_json::json!({"paths": ["/var/log/*.log"], "enabled": true});
        let b = serde_json::json!({"enabled": true, "paths": ["/var/log/*.log"]});
        assert_eq!(SpecHash::from_json(&a), SpecHash::from_json(&b));
    }

    #[test]
    fn test_spec_hash_detects_value_change() {
        let a = serde_json::json!({"period": "10s"});
        let b = serde_json::json!({"period": "30s"});
        assert_ne!(SpecHash::from_json(&a), SpecHash::from_json(&b));
    }

    #[test]
    fn test_spec_hash_nested_objects_sorted() {
        let a = serde_json::json!({"outer": {"z": 1, "a": {"y": "q\"uote", "b": null}}});
        let b = serde_json::json!({"outer": {"a": {"b": null, "y": "q\"uote"}, "z": 1}});
        let hash = SpecHash::from_json(&a);
        assert_eq!(hash, SpecHash::from_json(&b));
        assert!(hash.as_str().starts_with("sha256:"));
    }
}
