//! OpenAI-compatible wire types
//!
//! Inbound requests are decoded here and converted into [`ChatRequest`];
//! results are converted back into the response and chunk objects clients
//! expect.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::inference::engine::SamplingParams;
use crate::types::completion::{CompletionResult, FinishReason, ToolCall, Usage};
use crate::types::message::{ChatTurn, Role};
use crate::types::request::{ChatRequest, StructuredOutput, ToolChoice, ToolDeclaration};

/// A request that cannot be turned into a [`ChatRequest`]
#[derive(Debug, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct RequestError(pub String);

#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub model: Option<String>,
    pub messages: Vec<InboundMessage>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub top_k: Option<u32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub max_completion_tokens: Option<u32>,
    #[serde(default)]
    pub repetition_penalty: Option<f32>,
    #[serde(default)]
    pub seed: Option<u32>,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub stream_options: Option<StreamOptions>,
    #[serde(default)]
    pub tools: Option<Vec<InboundTool>>,
    #[serde(default)]
    pub tool_choice: Option<InboundToolChoice>,
    #[serde(default)]
    pub response_format: Option<ResponseFormat>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamOptions {
    #[serde(default)]
    pub include_usage: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InboundMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<InboundContent>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum InboundContent {
    Text(String),
    Parts(Vec<InboundContentPart>),
}

#[derive(Debug, Clone, Deserialize)]
pub struct InboundContentPart {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InboundTool {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    pub function: ToolDeclaration,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum InboundToolChoice {
    Mode(String),
    Named { function: NamedFunction },
}

#[derive(Debug, Clone, Deserialize)]
pub struct NamedFunction {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseFormat {
    Text,
    JsonObject,
    JsonSchema { json_schema: JsonSchemaFormat },
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonSchemaFormat {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub schema: Option<Value>,
}

impl InboundContent {
    fn flatten(self) -> String {
        match self {
            InboundContent::Text(text) => text,
            InboundContent::Parts(parts) => parts
                .into_iter()
                .filter(|part| matches!(part.kind.as_deref(), None | Some("text")))
                .filter_map(|part| part.text)
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

impl InboundToolChoice {
    fn into_choice(self) -> Result<ToolChoice, RequestError> {
        match self {
            InboundToolChoice::Mode(mode) => match mode.as_str() {
                "none" => Ok(ToolChoice::None),
                "auto" => Ok(ToolChoice::Auto),
                "required" => Ok(ToolChoice::Required),
                other => Err(RequestError(format!("Unsupported tool_choice: {}", other))),
            },
            InboundToolChoice::Named { function } => Ok(ToolChoice::Function(function.name)),
        }
    }
}

impl ChatCompletionRequest {
    pub fn is_stream(&self) -> bool {
        self.stream.unwrap_or(false)
    }

    pub fn include_usage(&self) -> bool {
        self.stream_options
            .as_ref()
            .and_then(|opts| opts.include_usage)
            .unwrap_or(false)
    }

    /// Converts the wire request, filling unset sampling values from
    /// `defaults`.
    pub fn into_chat_request(self, defaults: &SamplingParams) -> Result<ChatRequest, RequestError> {
        if self.messages.is_empty() {
            return Err(RequestError(
                "Chat request must include at least one message".to_string(),
            ));
        }

        let turns = self
            .messages
            .into_iter()
            .map(|message| {
                let role = message.role.parse::<Role>().map_err(RequestError)?;
                let content = message.content.map(InboundContent::flatten).unwrap_or_default();
                Ok(ChatTurn::new(role, content))
            })
            .collect::<Result<Vec<_>, RequestError>>()?;

        let mut sampling = SamplingParams {
            max_tokens: self
                .max_completion_tokens
                .or(self.max_tokens)
                .unwrap_or(defaults.max_tokens),
            temperature: self.temperature.unwrap_or(defaults.temperature),
            top_k: self.top_k.unwrap_or(defaults.top_k),
            top_p: self.top_p.unwrap_or(defaults.top_p),
            repetition_penalty: self
                .repetition_penalty
                .unwrap_or(defaults.repetition_penalty),
            seed: self.seed.unwrap_or(defaults.seed),
        };
        sampling.validate();

        let tools = self
            .tools
            .unwrap_or_default()
            .into_iter()
            .filter(|tool| matches!(tool.kind.as_deref(), None | Some("function")))
            .map(|tool| tool.function)
            .collect::<Vec<_>>();

        let tool_choice = self
            .tool_choice
            .map(InboundToolChoice::into_choice)
            .transpose()?;

        let structured_output = match self.response_format {
            None | Some(ResponseFormat::Text) => None,
            Some(ResponseFormat::JsonObject) => Some(StructuredOutput::default()),
            Some(ResponseFormat::JsonSchema { json_schema }) => Some(StructuredOutput {
                name: json_schema.name,
                schema: json_schema.schema,
            }),
        };

        Ok(ChatRequest {
            model: self.model,
            turns,
            sampling,
            tools,
            tool_choice,
            structured_output,
        })
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FunctionPayload {
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ToolCallPayload {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub function: FunctionPayload,
}

impl From<&ToolCall> for ToolCallPayload {
    fn from(call: &ToolCall) -> Self {
        Self {
            id: call.id.clone(),
            kind: "function",
            function: FunctionPayload {
                name: call.name.clone(),
                arguments: call.arguments.clone(),
            },
        }
    }
}

/// Streaming variant carrying the index OpenAI clients key deltas on
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ToolCallDelta {
    pub index: usize,
    #[serde(flatten)]
    pub call: ToolCallPayload,
}

#[derive(Debug, Serialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<Choice>,
    pub usage: Usage,
}

#[derive(Debug, Serialize)]
pub struct Choice {
    pub index: usize,
    pub message: ResponseMessage,
    pub finish_reason: FinishReason,
}

#[derive(Debug, Serialize)]
pub struct ResponseMessage {
    pub role: &'static str,
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallPayload>>,
}

impl From<CompletionResult> for ChatCompletionResponse {
    fn from(result: CompletionResult) -> Self {
        let tool_calls = result
            .message
            .tool_calls
            .as_ref()
            .map(|calls| calls.iter().map(ToolCallPayload::from).collect());

        Self {
            id: result.id,
            object: "chat.completion",
            created: result.created,
            model: result.model,
            choices: vec![Choice {
                index: 0,
                message: ResponseMessage {
                    role: "assistant",
                    content: result.message.content,
                    tool_calls,
                },
                finish_reason: result.finish_reason,
            }],
            usage: result.usage,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    /// Set on the terminal chunk of a failed stream
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ChunkError>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChunkError {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkChoice {
    pub index: usize,
    pub delta: Delta,
    pub finish_reason: Option<FinishReason>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Delta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallDelta>>,
}

impl ChatCompletionChunk {
    pub fn new(id: &str, created: i64, model: &str, delta: Delta) -> Self {
        Self {
            id: id.to_string(),
            object: "chat.completion.chunk",
            created,
            model: model.to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason: None,
            }],
            usage: None,
            error: None,
        }
    }

    pub fn with_finish(mut self, reason: FinishReason, usage: Option<Usage>) -> Self {
        if let Some(choice) = self.choices.first_mut() {
            choice.finish_reason = Some(reason);
        }
        self.usage = usage;
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error = Some(ChunkError {
            message: message.into(),
            kind: "server_error",
        });
        self
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.choices.first().and_then(|c| c.finish_reason)
    }
}

#[derive(Debug, Serialize)]
pub struct ModelCard {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub owned_by: String,
}

#[derive(Debug, Serialize)]
pub struct ModelList {
    pub object: &'static str,
    pub data: Vec<ModelCard>,
}
