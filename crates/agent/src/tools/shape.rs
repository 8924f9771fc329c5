//! Result shaping for the LLM.
//!
//! Remote tools answer in several envelopes; the model wants plain text.
//! The raw structured result is preserved separately for event emission;
//! this module only produces the string fed back into the conversation.

use serde_json::Value;

/// Shape a raw tool result into the textual form the LLM consumes.
pub fn shape_for_llm(raw: &Value) -> String {
    match raw {
        Value::Object(map) => {
            // MCP standard envelope: {"content": [{"type":"text","text":...}, ...]}
            if let Some(Value::Array(items)) = map.get("content")
                && !items.is_empty()
            {
                let parts: Vec<String> = items
                    .iter()
                    .map(|item| match item {
                        Value::Object(obj) => obj
                            .get("text")
                            .and_then(Value::as_str)
                            .map(str::to_string)
                            .unwrap_or_else(|| compact(item)),
                        Value::String(s) => s.clone(),
                        other => compact(other),
                    })
                    .collect();
                return parts.join("\n");
            }

            // Wrapped results: {"success": ..., "result": ...}
            if map.contains_key("success")
                && let Some(result) = map.get("result")
            {
                return match result {
                    Value::Object(inner) => {
                        if let Some(text) = inner.get("processed_text").and_then(Value::as_str) {
                            text.to_string()
                        } else if let Some(raw_output) = inner.get("raw_output") {
                            shape_for_llm(raw_output)
                        } else {
                            pretty(result)
                        }
                    }
                    Value::String(s) => s.clone(),
                    other => compact(other),
                };
            }

            pretty(raw)
        }
        Value::String(s) => {
            // JSON-in-a-string gets re-rendered structurally.
            match serde_json::from_str::<Value>(s) {
                Ok(parsed @ Value::Object(_)) | Ok(parsed @ Value::Array(_)) => pretty(&parsed),
                _ => s.clone(),
            }
        }
        Value::Null => String::new(),
        other => compact(other),
    }
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

fn compact(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn mcp_content_list_concatenates_text_items() {
        let raw = json!({
            "content": [
                {"type": "text", "text": "line one"},
                {"type": "text", "text": "line two"},
            ],
            "is_error": false,
        });
        assert_eq!(shape_for_llm(&raw), "line one\nline two");
    }

    #[test]
    fn content_list_tolerates_bare_strings() {
        let raw = json!({"content": ["plain", {"type": "text", "text": "typed"}]});
        assert_eq!(shape_for_llm(&raw), "plain\ntyped");
    }

    #[test]
    fn success_envelope_unwraps_processed_text() {
        let raw = json!({"success": true, "result": {"processed_text": "the answer"}});
        assert_eq!(shape_for_llm(&raw), "the answer");
    }

    #[test]
    fn success_envelope_recurses_into_raw_output() {
        let raw = json!({
            "success": true,
            "result": {"raw_output": {"content": [{"type": "text", "text": "nested"}]}}
        });
        assert_eq!(shape_for_llm(&raw), "nested");
    }

    #[test]
    fn generic_object_renders_as_pretty_json() {
        let raw = json!({"temperature": 21, "unit": "C"});
        let shaped = shape_for_llm(&raw);
        assert!(shaped.contains("\"temperature\": 21"));
    }

    #[test]
    fn json_string_is_reparsed() {
        let raw = json!("{\"a\": 1}");
        let shaped = shape_for_llm(&raw);
        assert!(shaped.contains("\"a\": 1"));
    }

    #[test]
    fn plain_string_passes_through() {
        assert_eq!(shape_for_llm(&json!("14:32 UTC")), "14:32 UTC");
    }

    #[test]
    fn scalars_render_compactly() {
        assert_eq!(shape_for_llm(&json!(42)), "42");
        assert_eq!(shape_for_llm(&Value::Null), "");
    }
}
