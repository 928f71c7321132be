//! Tool-call extraction
//!
//! Finds function invocations in generated text. Candidates come from
//! pluggable [`ToolCallFormat`]s; each one is parsed, checked against the
//! declared tools and given a fresh id.

use serde_json::Value;

use crate::compose::tools::{TOOL_CALL_CLOSE, TOOL_CALL_OPEN};
use crate::postprocess::PostProcessError;
use crate::types::completion::ToolCall;
use crate::types::request::ToolDeclaration;

/// A possible tool call located in the text
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    /// Byte range to remove from the visible content when the call is valid
    pub span: std::ops::Range<usize>,
    /// JSON body of the call
    pub body: String,
    /// Whether the span is removed even when the call is rejected
    pub always_strip: bool,
}

/// A textual convention for emitting tool calls
pub trait ToolCallFormat: Send + Sync {
    fn name(&self) -> &str;

    /// Every candidate in `text`, in order of appearance.
    fn candidates(&self, text: &str) -> Vec<Candidate>;
}

/// `<tool_call>{...}</tool_call>` blocks
#[derive(Debug, Default, Clone, Copy)]
pub struct TaggedFormat;

impl ToolCallFormat for TaggedFormat {
    fn name(&self) -> &str {
        "tagged"
    }

    fn candidates(&self, text: &str) -> Vec<Candidate> {
        let mut found = Vec::new();
        let mut cursor = 0;
        while let Some(offset) = text[cursor..].find(TOOL_CALL_OPEN) {
            let start = cursor + offset;
            let body_start = start + TOOL_CALL_OPEN.len();
            // An unclosed block runs to the end of the text
            let (body_end, end) = match text[body_start..].find(TOOL_CALL_CLOSE) {
                Some(rel) => (body_start + rel, body_start + rel + TOOL_CALL_CLOSE.len()),
                None => (text.len(), text.len()),
            };
            found.push(Candidate {
                span: start..end,
                body: text[body_start..body_end].trim().to_string(),
                always_strip: true,
            });
            cursor = end;
        }
        found
    }
}

/// Bare `{"name": ..., "arguments": {...}}` objects
#[derive(Debug, Default, Clone, Copy)]
pub struct BareJsonFormat;

impl ToolCallFormat for BareJsonFormat {
    fn name(&self) -> &str {
        "bare_json"
    }

    fn candidates(&self, text: &str) -> Vec<Candidate> {
        let mut found = Vec::new();
        let mut cursor = 0;
        while let Some(offset) = text[cursor..].find('{') {
            let start = cursor + offset;
            match balanced_object_end(text, start) {
                Some(end) => {
                    let body = &text[start..end];
                    let looks_like_call = serde_json::from_str::<Value>(body)
                        .map(|v| v.get("name").is_some() && v.get("arguments").is_some())
                        .unwrap_or(false);
                    if looks_like_call {
                        found.push(Candidate {
                            span: start..end,
                            body: body.to_string(),
                            always_strip: false,
                        });
                        cursor = end;
                    } else {
                        cursor = start + 1;
                    }
                }
                // Unclosed brace; a call may still open further on
                None => cursor = start + 1,
            }
        }
        found
    }
}

/// End (exclusive) of the JSON object opening at `start`, string-aware.
pub(crate) fn balanced_object_end(text: &str, start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in text[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(start + i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

/// Tool calls found in one text plus the content left visible
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParsedToolCalls {
    pub calls: Vec<ToolCall>,
    /// Remaining text, `None` when nothing but whitespace is left
    pub content: Option<String>,
}

/// Validates one candidate body into a call.
pub fn parse_candidate(body: &str, declared: &[ToolDeclaration]) -> Result<ToolCall, PostProcessError> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| PostProcessError::MalformedToolCall(format!("invalid JSON: {}", e)))?;

    let name = value
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| PostProcessError::MalformedToolCall("missing function name".to_string()))?;

    if !declared.iter().any(|t| t.name == name) {
        return Err(PostProcessError::MalformedToolCall(format!(
            "undeclared function {}",
            name
        )));
    }

    // Arguments may arrive as an object or as an already-encoded string
    let arguments = match value.get("arguments") {
        None | Some(Value::Null) => "{}".to_string(),
        Some(Value::String(raw)) => match serde_json::from_str::<Value>(raw) {
            Ok(parsed) => parsed.to_string(),
            Err(_) => Value::String(raw.clone()).to_string(),
        },
        Some(other) => other.to_string(),
    };

    Ok(ToolCall::new(name, arguments))
}

/// Extracts declared tool calls from `text`.
///
/// Formats are tried in order; the first one yielding any candidate is
/// used exclusively.
pub fn parse_tool_calls(
    text: &str,
    declared: &[ToolDeclaration],
    formats: &[Box<dyn ToolCallFormat>],
) -> ParsedToolCalls {
    let Some((format, candidates)) = formats.iter().find_map(|format| {
        let found = format.candidates(text);
        (!found.is_empty()).then_some((format, found))
    }) else {
        return ParsedToolCalls {
            calls: Vec::new(),
            content: visible(text),
        };
    };

    let mut calls = Vec::new();
    let mut strip = Vec::new();
    for candidate in candidates {
        match parse_candidate(&candidate.body, declared) {
            Ok(call) => {
                tracing::debug!("Parsed {} tool call {}", format.name(), call.name);
                calls.push(call);
                strip.push(candidate.span);
            }
            Err(e) => {
                tracing::warn!("Dropping {} tool call: {}", format.name(), e);
                if candidate.always_strip {
                    strip.push(candidate.span);
                }
            }
        }
    }

    let mut remaining = String::with_capacity(text.len());
    let mut cursor = 0;
    for span in strip {
        remaining.push_str(&text[cursor..span.start]);
        cursor = span.end;
    }
    remaining.push_str(&text[cursor..]);

    ParsedToolCalls {
        calls,
        content: visible(&remaining),
    }
}

fn visible(text: &str) -> Option<String> {
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Separates streamed text that is safe to show from text that may still
/// turn out to be a tool call.
///
/// Everything from the first possible call opening (`<tool_call>` or `{`)
/// is held back until [`ToolCallHoldback::finish`]. A trailing partial
/// `<tool_call>` is held until the next delta decides it.
#[derive(Debug, Default)]
pub struct ToolCallHoldback {
    buffer: String,
    holding: bool,
}

impl ToolCallHoldback {
    /// Adds a delta and returns the text that can be shown now.
    pub fn push(&mut self, delta: &str) -> Option<String> {
        self.buffer.push_str(delta);
        if self.holding {
            return None;
        }

        let opening = [self.buffer.find(TOOL_CALL_OPEN), self.buffer.find('{')]
            .into_iter()
            .flatten()
            .min();
        let split = match opening {
            Some(at) => {
                self.holding = true;
                at
            }
            None => self.buffer.len() - partial_open_suffix(&self.buffer),
        };
        if split == 0 {
            return None;
        }

        let rest = self.buffer.split_off(split);
        Some(std::mem::replace(&mut self.buffer, rest))
    }

    /// Text held back so far
    pub fn finish(self) -> String {
        self.buffer
    }
}

/// Length of the longest suffix of `text` that could begin `<tool_call>`.
fn partial_open_suffix(text: &str) -> usize {
    (1..TOOL_CALL_OPEN.len())
        .rev()
        .find(|&n| text.ends_with(&TOOL_CALL_OPEN[..n]))
        .unwrap_or(0)
}

/// Formats in precedence order: tagged first, bare objects as fallback.
pub fn default_formats() -> Vec<Box<dyn ToolCallFormat>> {
    vec![Box::new(TaggedFormat), Box::new(BareJsonFormat)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn declared() -> Vec<ToolDeclaration> {
        vec![ToolDeclaration::new(
            "get_rate",
            "Policy rate",
            json!({"type": "object"}),
        )]
    }

    #[test]
    fn test_tagged_declared_and_undeclared() {
        let text = "Checking.\n<tool_call>{\"name\": \"get_rate\", \"arguments\": {\"bank\": \"ECB\"}}</tool_call>\n\
                    <tool_call>{\"name\": \"wire_money\", \"arguments\": {}}</tool_call>";
        let parsed = parse_tool_calls(text, &declared(), &default_formats());

        assert_eq!(parsed.calls.len(), 1);
        assert_eq!(parsed.calls[0].name, "get_rate");
        assert_eq!(parsed.calls[0].arguments, r#"{"bank":"ECB"}"#);
        assert!(parsed.calls[0].id.starts_with("call_"));
        // Both blocks leave the visible text
        assert_eq!(parsed.content.as_deref(), Some("Checking."));
    }

    #[test]
    fn test_only_call_gives_null_content() {
        let text = "<tool_call>\n{\"name\": \"get_rate\", \"arguments\": {}}\n</tool_call>";
        let parsed = parse_tool_calls(text, &declared(), &default_formats());
        assert_eq!(parsed.calls.len(), 1);
        assert_eq!(parsed.calls[0].arguments, "{}");
        assert!(parsed.content.is_none());
    }

    #[test]
    fn test_malformed_tagged_block_is_stripped() {
        let text = "Answer: 3%.<tool_call>{not json</tool_call>";
        let parsed = parse_tool_calls(text, &declared(), &default_formats());
        assert!(parsed.calls.is_empty());
        assert_eq!(parsed.content.as_deref(), Some("Answer: 3%."));
    }

    #[test]
    fn test_bare_json_fallback() {
        let text = "Sure {\"name\": \"get_rate\", \"arguments\": {\"bank\": \"Fed\"}} done";
        let parsed = parse_tool_calls(text, &declared(), &default_formats());
        assert_eq!(parsed.calls.len(), 1);
        assert_eq!(parsed.content.as_deref(), Some("Sure  done"));
    }

    #[test]
    fn test_bare_call_after_unclosed_brace() {
        let text = "Rates {roughly speaking: {\"name\": \"get_rate\", \"arguments\": {\"bank\": \"ECB\"}}";
        let parsed = parse_tool_calls(text, &declared(), &default_formats());
        assert_eq!(parsed.calls.len(), 1);
        assert_eq!(parsed.calls[0].arguments, r#"{"bank":"ECB"}"#);
        assert_eq!(parsed.content.as_deref(), Some("Rates {roughly speaking:"));
    }

    #[test]
    fn test_bare_undeclared_call_stays_visible() {
        let text = "{\"name\": \"wire_money\", \"arguments\": {}}";
        let parsed = parse_tool_calls(text, &declared(), &default_formats());
        assert!(parsed.calls.is_empty());
        assert_eq!(parsed.content.as_deref(), Some(text));
    }

    #[test]
    fn test_string_arguments_are_normalized() {
        let call = parse_candidate(
            r#"{"name": "get_rate", "arguments": "{\"bank\": \"BoE\"}"}"#,
            &declared(),
        )
        .unwrap();
        assert_eq!(call.arguments, r#"{"bank":"BoE"}"#);
    }

    #[test]
    fn test_plain_text_has_no_calls() {
        let parsed = parse_tool_calls("  The rate is 4%.  ", &declared(), &default_formats());
        assert!(parsed.calls.is_empty());
        assert_eq!(parsed.content.as_deref(), Some("The rate is 4%."));
    }

    #[test]
    fn test_holdback_releases_plain_text() {
        let mut hold = ToolCallHoldback::default();
        assert_eq!(hold.push("The rate").as_deref(), Some("The rate"));
        assert_eq!(hold.push(" is 4%.").as_deref(), Some(" is 4%."));
        assert_eq!(hold.finish(), "");
    }

    #[test]
    fn test_holdback_keeps_split_tag() {
        let mut hold = ToolCallHoldback::default();
        assert_eq!(hold.push("Checking.<tool").as_deref(), Some("Checking."));
        assert_eq!(hold.push("_call>{\"name\": ").as_deref(), None);
        assert_eq!(hold.push("\"get_rate\"}</tool_call>"), None);
        assert_eq!(hold.finish(), "<tool_call>{\"name\": \"get_rate\"}</tool_call>");
    }

    #[test]
    fn test_holdback_releases_false_tag_prefix() {
        let mut hold = ToolCallHoldback::default();
        assert_eq!(hold.push("a <to").as_deref(), Some("a "));
        assert_eq!(hold.push("p> b").as_deref(), Some("<top> b"));
    }

    #[test]
    fn test_holdback_holds_from_first_brace() {
        let mut hold = ToolCallHoldback::default();
        assert_eq!(hold.push("Sure {\"name\"").as_deref(), Some("Sure "));
        assert_eq!(hold.push(" tail"), None);
        assert_eq!(hold.finish(), "{\"name\" tail");
    }

    #[test]
    fn test_balanced_end_ignores_braces_in_strings() {
        let text = r#"{"a": "}{", "b": {"c": 1}} tail"#;
        let end = balanced_object_end(text, 0).unwrap();
        assert_eq!(&text[..end], r#"{"a": "}{", "b": {"c": 1}}"#);
    }
}
