//! Parameter extraction for UI display.
//!
//! The snapshot shown in a permission prompt is sanitized: framework
//! plumbing is stripped, long strings are truncated, and positional
//! arguments are recovered under conventional names. The snapshot is for
//! display only and is never reused as the actual call arguments.

use serde_json::{Map, Value};

/// Keys injected by agent plumbing that mean nothing to an end user.
const INTERNAL_KEYS: &[&str] = &[
    "config",
    "callbacks",
    "run_manager",
    "run_id",
    "run_name",
    "metadata",
    "tags",
];

/// Conventional field names used to recover a lone positional argument.
const CONVENTIONAL_KEYS: &[&str] = &["input", "query", "text", "data", "params", "parameters"];

/// Display strings longer than this are cut with a visible marker.
const MAX_DISPLAY_STRING: usize = 200;

fn truncate_string(s: &str) -> Value {
    if s.chars().count() <= MAX_DISPLAY_STRING {
        return Value::String(s.to_string());
    }
    let head: String = s.chars().take(MAX_DISPLAY_STRING).collect();
    Value::String(format!("{}... [truncated]", head))
}

fn truncate_value(value: &Value) -> Value {
    match value {
        Value::String(s) => truncate_string(s),
        Value::Array(items) => Value::Array(items.iter().map(truncate_value).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), truncate_value(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Sanitize raw call arguments into a display snapshot.
pub fn sanitize_parameters(args: &Value) -> Value {
    match args {
        Value::Object(map) => {
            let cleaned: Map<String, Value> = map
                .iter()
                .filter(|(key, _)| !INTERNAL_KEYS.contains(&key.as_str()))
                .map(|(key, value)| (key.clone(), truncate_value(value)))
                .collect();

            // A single conventional wrapper around an object unwraps to it.
            if cleaned.len() == 1 {
                let (key, value) = cleaned.iter().next().unwrap();
                if CONVENTIONAL_KEYS.contains(&key.as_str()) && value.is_object() {
                    return value.clone();
                }
            }
            Value::Object(cleaned)
        }
        Value::Array(items) => {
            // One positional object argument is the argument map itself.
            if items.len() == 1 && items[0].is_object() {
                return sanitize_parameters(&items[0]);
            }
            let positional: Map<String, Value> = items
                .iter()
                .enumerate()
                .map(|(i, v)| (format!("arg{}", i), truncate_value(v)))
                .collect();
            Value::Object(positional)
        }
        Value::String(s) => {
            let mut map = Map::new();
            map.insert("input".to_string(), truncate_string(s));
            Value::Object(map)
        }
        Value::Null => Value::Object(Map::new()),
        other => {
            let mut map = Map::new();
            map.insert("input".to_string(), other.clone());
            Value::Object(map)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn internal_keys_are_stripped() {
        let args = json!({
            "path": "/tmp/a",
            "config": {"configurable": {"session_id": "s1"}},
            "run_manager": "handle",
            "callbacks": [],
        });
        let display = sanitize_parameters(&args);
        let map = display.as_object().unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map["path"], "/tmp/a");
    }

    #[test]
    fn long_strings_get_a_visible_marker() {
        let long = "x".repeat(500);
        let display = sanitize_parameters(&json!({ "content": long }));
        let shown = display["content"].as_str().unwrap();
        assert!(shown.ends_with("... [truncated]"));
        assert!(shown.chars().count() < 250);
    }

    #[test]
    fn short_strings_pass_through_unchanged() {
        let display = sanitize_parameters(&json!({"q": "weather in Tokyo"}));
        assert_eq!(display["q"], "weather in Tokyo");
    }

    #[test]
    fn nested_values_are_truncated_recursively() {
        let args = json!({"outer": {"inner": "y".repeat(300)}});
        let display = sanitize_parameters(&args);
        assert!(
            display["outer"]["inner"]
                .as_str()
                .unwrap()
                .ends_with("... [truncated]")
        );
    }

    #[test]
    fn bare_string_recovers_input_name() {
        let display = sanitize_parameters(&json!("look up rust"));
        assert_eq!(display["input"], "look up rust");
    }

    #[test]
    fn single_positional_object_unwraps() {
        let display = sanitize_parameters(&json!([{"query": "rust"}]));
        assert_eq!(display["query"], "rust");
    }

    #[test]
    fn multiple_positionals_fall_back_to_indexed_form() {
        let display = sanitize_parameters(&json!(["a", 2]));
        assert_eq!(display["arg0"], "a");
        assert_eq!(display["arg1"], 2);
    }

    #[test]
    fn conventional_wrapper_around_object_unwraps() {
        let display = sanitize_parameters(&json!({"params": {"a": 1, "b": 2}}));
        assert_eq!(display["a"], 1);
        assert_eq!(display["b"], 2);
    }

    #[test]
    fn null_becomes_empty_object() {
        assert_eq!(sanitize_parameters(&Value::Null), json!({}));
    }
}
