//! Completion result types

use std::fmt;

use serde::{Deserialize, Serialize};

/// Why generation stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Natural end of generation
    Stop,
    /// The token budget was exhausted
    Length,
    /// The output contains at least one valid tool call
    ToolCalls,
    /// The streaming worker failed
    Error,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
            FinishReason::ToolCalls => "tool_calls",
            FinishReason::Error => "error",
        }
    }

    /// `length` when the budget was reached, `stop` otherwise.
    pub fn from_budget(completion_tokens: usize, max_tokens: u32) -> Self {
        if completion_tokens >= max_tokens as usize {
            FinishReason::Length
        } else {
            FinishReason::Stop
        }
    }
}

impl fmt::Display for FinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token usage for one completion
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

impl Usage {
    pub fn new(prompt_tokens: usize, completion_tokens: usize) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// A validated function invocation found in generated text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Arguments serialized as a JSON string
    pub arguments: String,
}

impl ToolCall {
    /// Creates a call with a fresh `call_` id.
    pub fn new(name: impl Into<String>, arguments: impl Into<String>) -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string();
        Self {
            id: format!("call_{}", &id[..24]),
            name: name.into(),
            arguments: arguments.into(),
        }
    }
}

/// The assistant message of a completion
#[derive(Debug, Clone, PartialEq)]
pub struct AssistantMessage {
    pub content: Option<String>,
    pub tool_calls: Option<Vec<ToolCall>>,
}

/// A finished, non-streamed chat completion
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionResult {
    pub id: String,
    /// Unix timestamp (seconds)
    pub created: i64,
    pub model: String,
    pub message: AssistantMessage,
    pub finish_reason: FinishReason,
    pub usage: Usage,
}

/// Fresh `chatcmpl-` identifier
pub fn completion_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finish_reason_from_budget() {
        assert_eq!(FinishReason::from_budget(2, 50), FinishReason::Stop);
        assert_eq!(FinishReason::from_budget(5, 5), FinishReason::Length);
        assert_eq!(FinishReason::from_budget(7, 5), FinishReason::Length);
    }

    #[test]
    fn test_finish_reason_serde() {
        let json = serde_json::to_string(&FinishReason::ToolCalls).unwrap();
        assert_eq!(json, "\"tool_calls\"");
    }

    #[test]
    fn test_usage_totals() {
        let usage = Usage::new(12, 30);
        assert_eq!(usage.total_tokens, 42);
    }

    #[test]
    fn test_tool_call_ids_are_unique() {
        let a = ToolCall::new("f", "{}");
        let b = ToolCall::new("f", "{}");
        assert!(a.id.starts_with("call_"));
        assert_eq!(a.id.len(), "call_".len() + 24);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_completion_id_prefix() {
        assert!(completion_id().starts_with("chatcmpl-"));
    }
}
