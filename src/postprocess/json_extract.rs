//! Structured JSON extraction
//!
//! Best-effort recovery of a JSON object from generated text. Reasoning
//! markup is cleaned off first, then an ordered chain of extractors runs and
//! the first success wins. Nothing here checks a schema.

use serde_json::Value;

use crate::postprocess::tool_calls::balanced_object_end;
use crate::postprocess::PostProcessError;

const THINK_OPEN: &str = "<think>";
const THINK_CLOSE: &str = "</think>";

/// One strategy for locating a JSON object
pub trait JsonExtractor: Send + Sync {
    fn name(&self) -> &str;

    /// The JSON text found, if it parses.
    fn extract(&self, text: &str) -> Option<String>;
}

fn parses_as_object(candidate: &str) -> bool {
    matches!(serde_json::from_str::<Value>(candidate), Ok(Value::Object(_)))
}

/// Removes reasoning markup ahead of the answer.
pub fn strip_reasoning(text: &str) -> String {
    let mut cleaned = text.trim_start();

    if let Some(rest) = cleaned.strip_prefix(THINK_OPEN) {
        if let Some(close) = rest.find(THINK_CLOSE) {
            cleaned = &rest[close + THINK_CLOSE.len()..];
        }
    }

    // A close tag whose opening was cut off still marks where the answer starts
    if !cleaned.contains(THINK_OPEN) {
        if let Some(close) = cleaned.find(THINK_CLOSE) {
            cleaned = &cleaned[close + THINK_CLOSE.len()..];
        }
    }

    cleaned.trim().to_string()
}

/// The whole text is an object
#[derive(Debug, Default, Clone, Copy)]
pub struct WholeTextExtractor;

impl JsonExtractor for WholeTextExtractor {
    fn name(&self) -> &str {
        "whole_text"
    }

    fn extract(&self, text: &str) -> Option<String> {
        let trimmed = text.trim();
        parses_as_object(trimmed).then(|| trimmed.to_string())
    }
}

/// Markdown code fence around an object
#[derive(Debug, Default, Clone, Copy)]
pub struct FencedBlockExtractor;

impl JsonExtractor for FencedBlockExtractor {
    fn name(&self) -> &str {
        "fenced_block"
    }

    fn extract(&self, text: &str) -> Option<String> {
        let mut cursor = 0;
        while let Some(open) = text[cursor..].find("```") {
            let after_fence = cursor + open + 3;
            // Skip the info string (e.g. `json`) up to the end of the line
            let body_start = text[after_fence..]
                .find('\n')
                .map(|nl| after_fence + nl + 1)
                .unwrap_or(after_fence);
            let close = text[body_start..].find("```")?;
            let body = text[body_start..body_start + close].trim();
            if parses_as_object(body) {
                return Some(body.to_string());
            }
            cursor = body_start + close + 3;
        }
        None
    }
}

/// Longest balanced-brace substring that parses
#[derive(Debug, Default, Clone, Copy)]
pub struct BalancedBraceExtractor;

impl JsonExtractor for BalancedBraceExtractor {
    fn name(&self) -> &str {
        "balanced_braces"
    }

    fn extract(&self, text: &str) -> Option<String> {
        text.char_indices()
            .filter(|&(_, c)| c == '{')
            .filter_map(|(start, _)| {
                let end = balanced_object_end(text, start)?;
                let candidate = &text[start..end];
                parses_as_object(candidate).then_some(candidate)
            })
            .max_by_key(|candidate| candidate.len())
            .map(str::to_string)
    }
}

/// Plain brace counting from the first `{`, ignoring string contents
#[derive(Debug, Default, Clone, Copy)]
pub struct BraceMatchExtractor;

impl JsonExtractor for BraceMatchExtractor {
    fn name(&self) -> &str {
        "brace_match"
    }

    fn extract(&self, text: &str) -> Option<String> {
        let start = text.find('{')?;
        let mut depth = 0i32;
        for (i, c) in text[start..].char_indices() {
            match c {
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        let candidate = &text[start..start + i + 1];
                        if parses_as_object(candidate) {
                            return Some(candidate.to_string());
                        }
                        break;
                    }
                }
                _ => {}
            }
        }

        // Widest span as a last resort
        let end = text.rfind('}')?;
        let candidate = text.get(start..=end)?;
        parses_as_object(candidate).then(|| candidate.to_string())
    }
}

/// Ordered extractor chain
pub struct JsonExtractorChain {
    extractors: Vec<Box<dyn JsonExtractor>>,
}

impl Default for JsonExtractorChain {
    fn default() -> Self {
        Self::new(vec![
            Box::new(WholeTextExtractor),
            Box::new(FencedBlockExtractor),
            Box::new(BalancedBraceExtractor),
            Box::new(BraceMatchExtractor),
        ])
    }
}

impl JsonExtractorChain {
    pub fn new(extractors: Vec<Box<dyn JsonExtractor>>) -> Self {
        Self { extractors }
    }

    /// Extracts a JSON object from `text`.
    ///
    /// On failure the error carries the cleaned text, which callers return
    /// unchanged.
    pub fn extract(&self, text: &str) -> Result<String, PostProcessError> {
        let cleaned = strip_reasoning(text);
        for extractor in &self.extractors {
            if let Some(json) = extractor.extract(&cleaned) {
                tracing::debug!("Structured JSON extracted by {}", extractor.name());
                return Ok(json);
            }
        }
        Err(PostProcessError::JsonExtractionFailure { cleaned })
    }
}

/// Runs the default chain, falling back to the cleaned text.
pub fn extract_structured_json(text: &str) -> String {
    match JsonExtractorChain::default().extract(text) {
        Ok(json) => json,
        Err(PostProcessError::JsonExtractionFailure { cleaned }) => {
            tracing::warn!("No JSON object found in output, returning cleaned text");
            cleaned
        }
        Err(other) => {
            tracing::warn!("JSON extraction failed: {}", other);
            strip_reasoning(text)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leading_think_section_is_removed() {
        assert_eq!(extract_structured_json("<think>ignore</think>{\"a\":1}"), "{\"a\":1}");
    }

    #[test]
    fn test_orphan_think_close() {
        let text = "reasoning that lost its opening tag</think>\n{\"isin\": \"FR0000120271\"}";
        assert_eq!(extract_structured_json(text), "{\"isin\": \"FR0000120271\"}");
    }

    #[test]
    fn test_fenced_block() {
        let text = "Here you go:\n```json\n{\"risk\": 3}\n```\nAnything else?";
        assert_eq!(FencedBlockExtractor.extract(text).as_deref(), Some("{\"risk\": 3}"));
        assert_eq!(extract_structured_json(text), "{\"risk\": 3}");
    }

    #[test]
    fn test_longest_balanced_object_wins() {
        let text = "small {\"a\": 1} then {\"b\": {\"c\": [1, 2]}, \"d\": \"}\"} end";
        assert_eq!(
            BalancedBraceExtractor.extract(text).as_deref(),
            Some("{\"b\": {\"c\": [1, 2]}, \"d\": \"}\"}")
        );
    }

    #[test]
    fn test_brace_match_widest_span() {
        // Counting ignores strings, so the first match is cut short
        let text = "x {\"k\": \"{\", \"v\": 2} y";
        assert_eq!(
            BraceMatchExtractor.extract(text).as_deref(),
            Some("{\"k\": \"{\", \"v\": 2}")
        );
    }

    #[test]
    fn test_unrecoverable_returns_cleaned_text() {
        let text = "<think>hmm</think>  Sorry, no data.  ";
        let err = JsonExtractorChain::default().extract(text).unwrap_err();
        assert!(matches!(err, PostProcessError::JsonExtractionFailure { .. }));
        assert_eq!(extract_structured_json(text), "Sorry, no data.");
    }

    #[test]
    fn test_arrays_are_not_objects() {
        assert!(WholeTextExtractor.extract("[1, 2]").is_none());
    }
}
