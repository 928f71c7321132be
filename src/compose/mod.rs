//! Prompt composition
//!
//! Turns a chat request into the single prompt string the engine consumes:
//! locale directive, tool block and structured-output directive are folded
//! into the turns, then the codec's chat template (or a plain transcript)
//! renders them.

pub mod locale;
pub mod tools;

use std::sync::Arc;

use crate::inference::engine::TextCodec;
use crate::types::message::{ChatTurn, Role};
use crate::types::request::{ChatRequest, StructuredOutput, ToolChoice, ToolDeclaration};

pub use locale::{LexicalLocaleDetector, LocaleDetector, LocaleProfile, NoLocaleDetector};
pub use tools::{plan_tools, tool_directive, ToolPlan};

const JSON_DIRECTIVE: &str = "Respond with a single valid JSON object and nothing else. \
Do not wrap it in markdown code fences. Do not add explanations before or after it. \
Do not include <think> reasoning.";

/// Builds prompts for the engine
#[derive(Clone)]
pub struct PromptComposer {
    locale: Arc<dyn LocaleDetector>,
}

impl PromptComposer {
    pub fn new(locale: Arc<dyn LocaleDetector>) -> Self {
        Self { locale }
    }

    /// Composes the prompt for a request.
    pub fn compose(&self, request: &ChatRequest, codec: &dyn TextCodec) -> String {
        self.build_prompt(
            &request.turns,
            &request.tools,
            request.tool_choice.as_ref(),
            request.structured_output.as_ref(),
            codec,
        )
    }

    /// Renders turns plus directives into one prompt ending in an open
    /// assistant turn.
    pub fn build_prompt(
        &self,
        turns: &[ChatTurn],
        tools: &[ToolDeclaration],
        tool_choice: Option<&ToolChoice>,
        structured_output: Option<&StructuredOutput>,
        codec: &dyn TextCodec,
    ) -> String {
        let turns = self.directed_turns(turns, tools, tool_choice, structured_output);

        match codec.apply_chat_template(&turns) {
            Some(Ok(prompt)) => {
                tracing::debug!("Chat template applied to {} turn(s)", turns.len());
                prompt
            }
            Some(Err(e)) => {
                tracing::warn!("Chat template not applied: {}", e);
                render_transcript(&turns)
            }
            None => {
                tracing::warn!("No chat template available, using plain transcript");
                render_transcript(&turns)
            }
        }
    }

    /// Turns with every directive folded in, before templating.
    pub fn directed_turns(
        &self,
        turns: &[ChatTurn],
        tools: &[ToolDeclaration],
        tool_choice: Option<&ToolChoice>,
        structured_output: Option<&StructuredOutput>,
    ) -> Vec<ChatTurn> {
        let mut turns = turns.to_vec();

        if self.needs_locale_directive(&turns) {
            tracing::info!("Locale {} detected, adding system directive", self.locale.locale());
            turns.insert(0, ChatTurn::system(self.locale.directive()));
        }

        if let Some(plan) = plan_tools(tools, tool_choice) {
            append_to_system(&mut turns, &tool_directive(&plan));
        }

        if let Some(directive) = structured_output {
            append_to_system(&mut turns, &json_directive(directive));
        }

        turns
    }

    fn needs_locale_directive(&self, turns: &[ChatTurn]) -> bool {
        let detected = turns
            .iter()
            .filter(|t| t.role == Role::User)
            .any(|t| self.locale.detect(&t.content));
        if !detected {
            return false;
        }
        let marker = self.locale.marker();
        !turns
            .iter()
            .filter(|t| t.role == Role::System)
            .any(|t| t.content.to_lowercase().contains(marker))
    }
}

/// Appends a block to the first system turn, synthesizing one if needed.
fn append_to_system(turns: &mut Vec<ChatTurn>, block: &str) {
    match turns.iter_mut().find(|t| t.role == Role::System) {
        Some(system) => {
            if !system.content.is_empty() {
                system.content.push_str("\n\n");
            }
            system.content.push_str(block);
        }
        None => turns.insert(0, ChatTurn::system(block)),
    }
}

fn json_directive(directive: &StructuredOutput) -> String {
    let mut out = String::from(JSON_DIRECTIVE);
    if let Some(schema) = &directive.schema {
        let rendered = serde_json::to_string_pretty(schema).unwrap_or_else(|_| schema.to_string());
        match &directive.name {
            Some(name) => out.push_str(&format!(
                "\nThe JSON object must follow the `{}` schema:\n{}",
                name, rendered
            )),
            None => out.push_str(&format!("\nThe JSON object must follow this schema:\n{}", rendered)),
        }
    }
    out
}

/// Role-labelled transcript used when the codec cannot template.
pub fn render_transcript(turns: &[ChatTurn]) -> String {
    let mut prompt = String::new();
    for turn in turns {
        prompt.push_str(turn.role.label());
        prompt.push_str(": ");
        prompt.push_str(&turn.content);
        prompt.push('\n');
    }
    prompt.push_str("Assistant: ");
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::scripted::ScriptedCodec;
    use serde_json::json;

    fn composer() -> PromptComposer {
        PromptComposer::new(Arc::new(LexicalLocaleDetector::french().unwrap()))
    }

    fn templated_codec() -> ScriptedCodec {
        let mut codec = ScriptedCodec::default();
        codec.set_chat_template("chatml".to_string());
        codec
    }

    #[test]
    fn test_transcript_fallback() {
        let turns = vec![ChatTurn::system("Be brief."), ChatTurn::user("2+2?")];
        let prompt = composer().build_prompt(&turns, &[], None, None, &ScriptedCodec::default());
        assert_eq!(prompt, "System: Be brief.\nUser: 2+2?\nAssistant: ");
    }

    #[test]
    fn test_codec_template_is_used() {
        let prompt =
            composer().build_prompt(&[ChatTurn::user("hi")], &[], None, None, &templated_codec());
        assert!(prompt.starts_with("<|im_start|>user\nhi"));
        assert!(prompt.ends_with("<|im_start|>assistant\n"));
    }

    #[test]
    fn test_french_directive_prepended() {
        let turns = composer().directed_turns(
            &[ChatTurn::user("Qu'est-ce qu'une obligation ?")],
            &[],
            None,
            None,
        );
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].role, Role::System);
        assert!(turns[0].content.contains("Répondez TOUJOURS en français"));
    }

    #[test]
    fn test_french_directive_not_duplicated() {
        let turns = composer().directed_turns(
            &[
                ChatTurn::system("Répondez en Français."),
                ChatTurn::user("Pourquoi les taux montent ?"),
            ],
            &[],
            None,
            None,
        );
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].content, "Répondez en Français.");
    }

    #[test]
    fn test_english_request_untouched() {
        let input = vec![ChatTurn::user("What is a bond?")];
        assert_eq!(composer().directed_turns(&input, &[], None, None), input);
    }

    #[test]
    fn test_tool_block_goes_to_first_system_turn() {
        let tools = vec![ToolDeclaration::new("get_rate", "Policy rate", json!({"type": "object"}))];
        let turns = composer().directed_turns(
            &[ChatTurn::system("You are a finance bot."), ChatTurn::user("rate?")],
            &tools,
            None,
            None,
        );
        assert_eq!(turns.len(), 2);
        assert!(turns[0].content.starts_with("You are a finance bot.\n\n# Tools"));
        assert!(turns[0].content.contains("<tool_call>"));
    }

    #[test]
    fn test_tool_block_synthesizes_system_turn() {
        let tools = vec![ToolDeclaration::new("get_rate", "Policy rate", json!({"type": "object"}))];
        let turns = composer().directed_turns(&[ChatTurn::user("rate?")], &tools, None, None);
        assert_eq!(turns[0].role, Role::System);
        assert!(turns[0].content.starts_with("# Tools"));
    }

    #[test]
    fn test_tool_choice_none_skips_block() {
        let tools = vec![ToolDeclaration::new("get_rate", "Policy rate", json!({"type": "object"}))];
        let input = vec![ChatTurn::user("rate?")];
        let turns = composer().directed_turns(&input, &tools, Some(&ToolChoice::None), None);
        assert_eq!(turns, input);
    }

    #[test]
    fn test_json_directive_embeds_schema() {
        let directive = StructuredOutput {
            name: Some("kid".to_string()),
            schema: Some(json!({"type": "object", "required": ["isin"]})),
        };
        let turns =
            composer().directed_turns(&[ChatTurn::user("extract")], &[], None, Some(&directive));
        let system = &turns[0].content;
        assert!(system.starts_with(JSON_DIRECTIVE));
        assert!(system.contains("`kid` schema"));
        assert!(system.contains("\"isin\""));
    }
}
