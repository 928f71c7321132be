//! Response post-processing
//!
//! Turns raw generated text into what the client sees: visible content,
//! validated tool calls, extracted JSON and the final finish reason.

pub mod json_extract;
pub mod tool_calls;

use thiserror::Error;

use crate::compose::tools::ToolPlan;
use crate::types::completion::{FinishReason, ToolCall};

pub use json_extract::{extract_structured_json, JsonExtractor, JsonExtractorChain};
pub use tool_calls::{
    default_formats, parse_tool_calls, ParsedToolCalls, ToolCallFormat, ToolCallHoldback,
};

/// Recoverable post-processing problems. Logged, never sent to clients.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PostProcessError {
    #[error("Malformed tool call: {0}")]
    MalformedToolCall(String),

    #[error("No JSON object could be extracted")]
    JsonExtractionFailure { cleaned: String },
}

/// Client-facing shape of one generation
#[derive(Debug, Clone, PartialEq)]
pub struct Processed {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: FinishReason,
}

/// Applies tool-call and JSON extraction to generated text
pub struct ResponsePostProcessor {
    formats: Vec<Box<dyn ToolCallFormat>>,
    json: JsonExtractorChain,
}

impl Default for ResponsePostProcessor {
    fn default() -> Self {
        Self::new(default_formats(), JsonExtractorChain::default())
    }
}

impl ResponsePostProcessor {
    pub fn new(formats: Vec<Box<dyn ToolCallFormat>>, json: JsonExtractorChain) -> Self {
        Self { formats, json }
    }

    /// Post-processes `text`.
    ///
    /// `finish_reason` is what the bridge reported. It is replaced by
    /// `tool_calls` when at least one valid call is found. Tool calls are only
    /// looked for when tools were offered.
    pub fn process(
        &self,
        text: &str,
        finish_reason: FinishReason,
        tools: Option<&ToolPlan>,
        requires_json: bool,
    ) -> Processed {
        let (mut content, calls) = match tools {
            Some(plan) => {
                let parsed = parse_tool_calls(text, &plan.declared, &self.formats);
                (parsed.content, parsed.calls)
            }
            None => (Some(text.to_string()), Vec::new()),
        };

        if requires_json {
            content = content.map(|c| self.extract_json(&c));
        }

        let finish_reason = if calls.is_empty() {
            finish_reason
        } else {
            FinishReason::ToolCalls
        };

        Processed {
            content,
            tool_calls: calls,
            finish_reason,
        }
    }

    fn extract_json(&self, text: &str) -> String {
        match self.json.extract(text) {
            Ok(json) => json,
            Err(PostProcessError::JsonExtractionFailure { cleaned }) => {
                tracing::warn!("No JSON object found in output, returning cleaned text");
                cleaned
            }
            Err(e) => {
                tracing::warn!("JSON extraction failed: {}", e);
                text.to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::tools::plan_tools;
    use crate::types::request::{ToolChoice, ToolDeclaration};
    use serde_json::json;

    fn plan() -> ToolPlan {
        let tools = vec![ToolDeclaration::new("get_rate", "Policy rate", json!({"type": "object"}))];
        plan_tools(&tools, None).unwrap()
    }

    #[test]
    fn test_plain_text_keeps_reason() {
        let out = ResponsePostProcessor::default().process("4.", FinishReason::Stop, None, false);
        assert_eq!(out.content.as_deref(), Some("4."));
        assert!(out.tool_calls.is_empty());
        assert_eq!(out.finish_reason, FinishReason::Stop);
    }

    #[test]
    fn test_tool_calls_take_precedence_over_length() {
        let text = "<tool_call>{\"name\": \"get_rate\", \"arguments\": {}}</tool_call>";
        let out = ResponsePostProcessor::default().process(text, FinishReason::Length, Some(&plan()), false);
        assert_eq!(out.finish_reason, FinishReason::ToolCalls);
        assert_eq!(out.tool_calls.len(), 1);
        assert!(out.content.is_none());
    }

    #[test]
    fn test_named_choice_still_accepts_other_declared_tools() {
        let tools = vec![
            ToolDeclaration::new("get_rate", "Policy rate", json!({"type": "object"})),
            ToolDeclaration::new("convert", "Currency conversion", json!({"type": "object"})),
        ];
        let plan = plan_tools(&tools, Some(&ToolChoice::Function("get_rate".into()))).unwrap();
        let text = "<tool_call>{\"name\": \"convert\", \"arguments\": {\"to\": \"EUR\"}}</tool_call>";
        let out = ResponsePostProcessor::default().process(text, FinishReason::Stop, Some(&plan), false);
        assert_eq!(out.tool_calls.len(), 1);
        assert_eq!(out.tool_calls[0].name, "convert");
        assert_eq!(out.finish_reason, FinishReason::ToolCalls);
    }

    #[test]
    fn test_undeclared_call_keeps_bridge_reason() {
        let text = "<tool_call>{\"name\": \"sell_all\", \"arguments\": {}}</tool_call>Done.";
        let out = ResponsePostProcessor::default().process(text, FinishReason::Stop, Some(&plan()), false);
        assert_eq!(out.finish_reason, FinishReason::Stop);
        assert!(out.tool_calls.is_empty());
        assert_eq!(out.content.as_deref(), Some("Done."));
    }

    #[test]
    fn test_tools_not_offered_leaves_text_alone() {
        let text = "<tool_call>{\"name\": \"get_rate\", \"arguments\": {}}</tool_call>";
        let out = ResponsePostProcessor::default().process(text, FinishReason::Stop, None, false);
        assert!(out.tool_calls.is_empty());
        assert_eq!(out.content.as_deref(), Some(text));
    }

    #[test]
    fn test_json_required() {
        let out = ResponsePostProcessor::default().process(
            "<think>ignore</think>{\"a\":1}",
            FinishReason::Stop,
            None,
            true,
        );
        assert_eq!(out.content.as_deref(), Some("{\"a\":1}"));
    }
}
