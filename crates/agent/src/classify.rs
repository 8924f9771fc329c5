//! Assistant-content phase classification.
//!
//! Heuristic keyword matching over content fragments, distinguishing the
//! model's planning narration from answers grounded in tool results. The
//! keyword lists ship with English and Chinese defaults and are
//! configurable per deployment.

use crate::events::ContentPhase;

/// Classifies assistant content fragments into phases.
#[derive(Debug, Clone)]
pub struct ContentClassifier {
    thinking_patterns: Vec<String>,
    response_patterns: Vec<String>,
}

const THINKING_KEYWORDS_EN: &[&str] = &[
    "I need to",
    "Let me",
    "I should",
    "To answer",
    "In order to",
    "I'll",
    "I will",
    "I want to",
    "I'm going to",
    "Let's",
    "We need to",
    "We should",
    "First, I'll",
    "Now I'll",
];

const THINKING_KEYWORDS_ZH: &[&str] = &[
    "我需要",
    "让我",
    "首先",
    "我应该",
    "为了回答",
    "为了获取",
    "我来",
    "现在让我",
    "接下来我",
    "我想",
    "我会",
    "我将",
    "我要",
    "我先",
    "让我们",
    "我们需要",
    "我们来",
    "我们先",
    "我们应该",
];

const RESPONSE_KEYWORDS_EN: &[&str] = &[
    "Based on the results",
    "According to the search",
    "The results show",
    "From the search results",
    "The query returned",
    "Based on the data",
    "According to the analysis",
    "The search revealed",
    "Results indicate",
];

const RESPONSE_KEYWORDS_ZH: &[&str] = &[
    "根据查询结果",
    "基于搜索结果",
    "查询结果显示",
    "根据工具返回",
    "基于获取的信息",
    "从结果中可以看到",
    "搜索结果表明",
    "通过查询发现",
    "根据分析结果",
];

// ReAct-style scaffolding markers count as thinking regardless of language.
const REACT_MARKERS: &[&str] = &["Thought:", "Action:"];

impl Default for ContentClassifier {
    fn default() -> Self {
        let thinking_patterns = THINKING_KEYWORDS_EN
            .iter()
            .chain(THINKING_KEYWORDS_ZH)
            .chain(REACT_MARKERS)
            .map(|s| s.to_string())
            .collect();
        let response_patterns = RESPONSE_KEYWORDS_EN
            .iter()
            .chain(RESPONSE_KEYWORDS_ZH)
            .map(|s| s.to_string())
            .collect();
        Self {
            thinking_patterns,
            response_patterns,
        }
    }
}

impl ContentClassifier {
    pub fn new(thinking_patterns: Vec<String>, response_patterns: Vec<String>) -> Self {
        Self {
            thinking_patterns,
            response_patterns,
        }
    }

    /// Classify a content fragment. A fragment emitted alongside a tool-call
    /// announcement is always thinking.
    pub fn classify(&self, content: &str, has_tool_calls: bool) -> ContentPhase {
        if content.trim().is_empty() {
            return ContentPhase::Default;
        }
        if self
            .thinking_patterns
            .iter()
            .any(|p| content.contains(p.as_str()))
        {
            return ContentPhase::Thinking;
        }
        if self
            .response_patterns
            .iter()
            .any(|p| content.contains(p.as_str()))
        {
            return ContentPhase::Response;
        }
        if has_tool_calls {
            return ContentPhase::Thinking;
        }
        ContentPhase::Default
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn planning_lead_in_is_thinking() {
        let c = ContentClassifier::default();
        assert_eq!(
            c.classify("Let me check the weather for you.", false),
            ContentPhase::Thinking
        );
        assert_eq!(c.classify("我需要查询一下数据库。", false), ContentPhase::Thinking);
    }

    #[test]
    fn result_grounded_text_is_response() {
        let c = ContentClassifier::default();
        assert_eq!(
            c.classify("Based on the results, Tokyo is sunny today.", false),
            ContentPhase::Response
        );
        assert_eq!(
            c.classify("根据查询结果，今天有雨。", false),
            ContentPhase::Response
        );
    }

    #[test]
    fn tool_call_chunk_without_keywords_is_thinking() {
        let c = ContentClassifier::default();
        assert_eq!(c.classify("checking...", true), ContentPhase::Thinking);
    }

    #[test]
    fn plain_conversation_is_default() {
        let c = ContentClassifier::default();
        assert_eq!(c.classify("Hello there!", false), ContentPhase::Default);
    }

    #[test]
    fn empty_content_is_default_even_with_tool_calls() {
        let c = ContentClassifier::default();
        assert_eq!(c.classify("   ", true), ContentPhase::Default);
    }

    #[test]
    fn thinking_takes_precedence_over_response_keywords() {
        let c = ContentClassifier::default();
        // Contains both a planning lead-in and a response marker.
        assert_eq!(
            c.classify("Let me summarize. Based on the results, done.", false),
            ContentPhase::Thinking
        );
    }

    #[test]
    fn react_markers_classify_as_thinking() {
        let c = ContentClassifier::default();
        assert_eq!(
            c.classify("Thought: the user wants the time", false),
            ContentPhase::Thinking
        );
    }
}
