//! Layer merge
//!
//! - Tables merge key by key, recursively
//! - Arrays are replaced whole (a file's `copy_command` never appends)
//! - Scalars: the later layer wins

use serde_json::Value;

/// Merge `overlay` on top of `base`.
pub fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut merged), Value::Object(overlay)) => {
            for (key, value) in overlay {
                let value = match merged.remove(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value,
                };
                merged.insert(key, value);
            }
            Value::Object(merged)
        }
        (_, overlay) => overlay,
    }
}

/// Fold layers in precedence order (first is the base).
pub fn merge_layers(layers: Vec<Value>) -> Value {
    layers.into_iter().fold(Value::Null, deep_merge)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scalar_override() {
        let merged = deep_merge(json!({"debuggable": false}), json!({"debuggable": true}));
        assert_eq!(merged["debuggable"], true);
    }

    #[test]
    fn test_untouched_keys_survive() {
        let merged = deep_merge(
            json!({"data_root": "/data", "restricted_home_sdk": 24}),
            json!({"restricted_home_sdk": 28}),
        );
        assert_eq!(merged["data_root"], "/data");
        assert_eq!(merged["restricted_home_sdk"], 28);
    }

    #[test]
    fn test_copy_command_replaced() {
        let merged = deep_merge(
            json!({"copy_command": ["/system/bin/cp", "-F", "-p"]}),
            json!({"copy_command": ["cp", "-a"]}),
        );
        assert_eq!(merged["copy_command"], json!(["cp", "-a"]));
    }

    #[test]
    fn test_nested_tables() {
        let merged = deep_merge(
            json!({"outer": {"a": 1, "b": 2}}),
            json!({"outer": {"b": 3}}),
        );
        assert_eq!(merged["outer"], json!({"a": 1, "b": 3}));
    }

    #[test]
    fn test_merge_layers_order() {
        let merged = merge_layers(vec![
            json!({"data_root": "/data", "debuggable": false}),
            json!({"data_root": "/srv/data"}),
            json!({"debuggable": true}),
        ]);
        assert_eq!(merged["data_root"], "/srv/data");
        assert_eq!(merged["debuggable"], true);
    }
}
