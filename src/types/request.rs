//! Chat request domain types
//!
//! What a caller asks for, after the wire format has been decoded.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::inference::engine::SamplingParams;
use crate::types::message::{ChatTurn, Role};

/// A function the engine may call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDeclaration {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON schema of the arguments object
    #[serde(default = "empty_object_schema")]
    pub parameters: Value,
}

fn empty_object_schema() -> Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

impl ToolDeclaration {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// How the engine should choose among declared tools
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ToolChoice {
    /// Never call tools
    None,
    /// The engine decides
    #[default]
    Auto,
    /// The caller wants a call. There is no forced-call mode, so this
    /// behaves like `Auto`.
    Required,
    /// Call this specific function
    Function(String),
}

/// Directive requiring the answer to be a bare JSON object
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StructuredOutput {
    /// Optional schema name from `json_schema` response formats
    pub name: Option<String>,
    /// Optional JSON schema the object should follow
    pub schema: Option<Value>,
}

/// A chat completion request
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    /// Requested model id; the loaded model answers regardless
    pub model: Option<String>,
    pub turns: Vec<ChatTurn>,
    pub sampling: SamplingParams,
    pub tools: Vec<ToolDeclaration>,
    pub tool_choice: Option<ToolChoice>,
    pub structured_output: Option<StructuredOutput>,
}

impl ChatRequest {
    pub fn new(turns: Vec<ChatTurn>, sampling: SamplingParams) -> Self {
        Self {
            model: None,
            turns,
            sampling,
            tools: Vec::new(),
            tool_choice: None,
            structured_output: None,
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolDeclaration>, choice: Option<ToolChoice>) -> Self {
        self.tools = tools;
        self.tool_choice = choice;
        self
    }

    pub fn with_structured_output(mut self, directive: StructuredOutput) -> Self {
        self.structured_output = Some(directive);
        self
    }

    /// Iterates over user turns only
    pub fn user_turns(&self) -> impl Iterator<Item = &ChatTurn> {
        self.turns.iter().filter(|t| t.role == Role::User)
    }

    /// Whether the caller requires a bare JSON answer
    pub fn requires_json(&self) -> bool {
        self.structured_output.is_some()
    }
}
