//! Model metadata used for prompt budgeting.
//!
//! The context-window table is a best-effort snapshot; unknown models fall
//! back to [`DEFAULT_CONTEXT_WINDOW`]. The token estimator is deliberately
//! approximate (the runtime budgets with a safety fraction on top of it).

use crate::chat::{ChatMessage, MessageType};

/// Context window assumed for models the table does not know.
pub const DEFAULT_CONTEXT_WINDOW: u32 = 8_192;

/// Fixed per-message overhead (role tags, separators) in estimated tokens.
const MESSAGE_OVERHEAD_TOKENS: usize = 4;

/// Declared context window for a model id, by prefix match.
pub fn context_window(model_id: &str) -> u32 {
    const TABLE: &[(&str, u32)] = &[
        ("gpt-4o", 128_000),
        ("gpt-4.1", 1_000_000),
        ("gpt-4-turbo", 128_000),
        ("gpt-4", 8_192),
        ("gpt-3.5-turbo", 16_385),
        ("o1", 200_000),
        ("o3", 200_000),
        ("claude-3", 200_000),
        ("claude-sonnet", 200_000),
        ("claude-opus", 200_000),
        ("deepseek-chat", 64_000),
        ("deepseek-reasoner", 64_000),
        ("qwen", 32_768),
        ("llama-3", 128_000),
        ("llama3", 8_192),
        ("mistral", 32_768),
        ("gemini-1.5", 1_000_000),
        ("gemini-2", 1_000_000),
    ];

    let model = model_id.to_ascii_lowercase();
    TABLE
        .iter()
        .find(|(prefix, _)| model.starts_with(prefix))
        .map(|(_, window)| *window)
        .unwrap_or(DEFAULT_CONTEXT_WINDOW)
}

/// Best-effort token estimate for a text fragment (~4 chars per token).
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Best-effort token estimate for a whole message, including inline media
/// (images count as a flat block, mirroring provider-side accounting).
pub fn estimate_message_tokens(message: &ChatMessage) -> usize {
    let media = match &message.message_type {
        MessageType::Image(_) | MessageType::ImageURL(_) => 768,
        _ => 0,
    };
    estimate_tokens(&message.content) + media + MESSAGE_OVERHEAD_TOKENS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_models_resolve_by_prefix() {
        assert_eq!(context_window("gpt-4o-mini"), 128_000);
        assert_eq!(context_window("deepseek-chat"), 64_000);
        assert_eq!(context_window("claude-sonnet-4-20250514"), 200_000);
    }

    #[test]
    fn unknown_model_uses_default_window() {
        assert_eq!(context_window("my-local-model"), DEFAULT_CONTEXT_WINDOW);
    }

    #[test]
    fn estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn message_estimate_includes_overhead() {
        let msg = ChatMessage::user().content("abcd").build();
        assert_eq!(estimate_message_tokens(&msg), 1 + 4);
    }

    #[test]
    fn image_message_counts_flat_media_block() {
        let msg = ChatMessage::user()
            .content("")
            .image_url("http://example/img.png")
            .build();
        assert!(estimate_message_tokens(&msg) > 700);
    }
}
