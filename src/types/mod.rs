//! Shared types
//!
//! Chat turns, requests, completion results and their OpenAI wire forms.

pub mod completion;
pub mod message;
pub mod openai;
pub mod request;

pub use completion::{AssistantMessage, CompletionResult, FinishReason, ToolCall, Usage};
pub use message::{ChatTurn, Role};
pub use request::{ChatRequest, StructuredOutput, ToolChoice, ToolDeclaration};
