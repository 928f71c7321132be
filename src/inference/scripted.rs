//! Deterministic scripted backend
//!
//! Stands in for a real runtime in tests and dry runs. The codec maps every
//! Unicode scalar to one token, so token counts are character counts and
//! stay identical between streamed and blocking runs.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use crate::inference::engine::{
    EngineBackend, EngineError, Generation, GenerationEngine, LoadSpec, SamplingParams,
    TextCodec,
};
use crate::types::message::ChatTurn;

const FILLER: &str = "lorem ipsum dolor sit amet consectetur adipiscing elit ";

/// What the scripted engine answers
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    /// Always this text, cut to the token budget
    Fixed(String),
    /// Filler text that uses the whole token budget
    FillBudget,
    /// Fails before producing anything
    Fail(String),
    /// Produces this text, then fails
    FailMidway(String),
}

impl ScriptedReply {
    fn text_for(&self, params: &SamplingParams) -> String {
        let budget = params.max_tokens as usize;
        match self {
            ScriptedReply::Fixed(text) | ScriptedReply::FailMidway(text) => {
                text.chars().take(budget).collect()
            }
            ScriptedReply::FillBudget => FILLER.chars().cycle().take(budget).collect(),
            ScriptedReply::Fail(_) => String::new(),
        }
    }
}

type EventLog = Arc<Mutex<Vec<String>>>;

fn record(events: &EventLog, event: &str) {
    events
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(event.to_string());
}

/// Backend producing [`ScriptedCodec`]s and [`ScriptedEngine`]s
pub struct ScriptedBackend {
    reply: ScriptedReply,
    chat_template: Option<String>,
    load_delay: Duration,
    step_delay: Duration,
    failing_loads: AtomicUsize,
    failure_message: String,
    panicking_loads: AtomicUsize,
    codec_loads: AtomicUsize,
    engine_loads: AtomicUsize,
    purges: AtomicUsize,
    events: EventLog,
}

impl ScriptedBackend {
    pub fn new(reply: ScriptedReply) -> Self {
        Self {
            reply,
            chat_template: None,
            load_delay: Duration::ZERO,
            step_delay: Duration::ZERO,
            failing_loads: AtomicUsize::new(0),
            failure_message: String::new(),
            panicking_loads: AtomicUsize::new(0),
            codec_loads: AtomicUsize::new(0),
            engine_loads: AtomicUsize::new(0),
            purges: AtomicUsize::new(0),
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Ships the codec with a built-in chat template.
    pub fn with_chat_template(mut self, template: impl Into<String>) -> Self {
        self.chat_template = Some(template.into());
        self
    }

    /// Sleeps this long inside every codec load.
    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    /// Sleeps this long between streamed increments.
    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    /// The next `count` codec loads fail with `message`.
    pub fn failing_loads(self, count: usize, message: impl Into<String>) -> Self {
        self.failing_loads.store(count, Ordering::SeqCst);
        Self {
            failure_message: message.into(),
            ..self
        }
    }

    /// The next `count` codec loads panic.
    pub fn panicking_loads(self, count: usize) -> Self {
        self.panicking_loads.store(count, Ordering::SeqCst);
        self
    }

    pub fn codec_loads(&self) -> usize {
        self.codec_loads.load(Ordering::SeqCst)
    }

    pub fn engine_loads(&self) -> usize {
        self.engine_loads.load(Ordering::SeqCst)
    }

    pub fn purges(&self) -> usize {
        self.purges.load(Ordering::SeqCst)
    }

    /// Ordered log of loads, purges, releases and engine drops.
    pub fn events(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl EngineBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    fn load_codec(&self, spec: &LoadSpec) -> Result<Box<dyn TextCodec>, EngineError> {
        self.codec_loads.fetch_add(1, Ordering::SeqCst);
        record(&self.events, "load_codec");
        if !self.load_delay.is_zero() {
            thread::sleep(self.load_delay);
        }
        if take_one(&self.panicking_loads) {
            panic!("scripted codec load panicked for {}", spec.model_id);
        }
        if take_one(&self.failing_loads) {
            return Err(EngineError::init_failure(self.failure_message.clone()));
        }
        Ok(Box::new(ScriptedCodec {
            chat_template: self.chat_template.clone(),
        }))
    }

    fn load_engine(
        &self,
        _spec: &LoadSpec,
        _codec: &dyn TextCodec,
    ) -> Result<Arc<dyn GenerationEngine>, EngineError> {
        self.engine_loads.fetch_add(1, Ordering::SeqCst);
        record(&self.events, "load_engine");
        Ok(Arc::new(ScriptedEngine {
            reply: self.reply.clone(),
            step_delay: self.step_delay,
            events: Arc::clone(&self.events),
        }))
    }

    fn purge_accelerator_cache(&self) {
        self.purges.fetch_add(1, Ordering::SeqCst);
        record(&self.events, "purge");
    }
}

/// One token per character
#[derive(Debug, Clone, Default)]
pub struct ScriptedCodec {
    chat_template: Option<String>,
}

impl TextCodec for ScriptedCodec {
    fn encode(&self, text: &str) -> Result<Vec<u32>, EngineError> {
        Ok(text.chars().map(u32::from).collect())
    }

    fn decode(&self, tokens: &[u32]) -> Result<String, EngineError> {
        tokens
            .iter()
            .map(|&t| char::from_u32(t).ok_or_else(|| EngineError::Codec(format!("invalid token {}", t))))
            .collect()
    }

    fn chat_template(&self) -> Option<&str> {
        self.chat_template.as_deref()
    }

    fn set_chat_template(&mut self, template: String) {
        self.chat_template = Some(template);
    }

    /// Renders the ChatML layout whenever a template is installed. The
    /// template text itself is not interpreted.
    fn apply_chat_template(&self, turns: &[ChatTurn]) -> Option<Result<String, EngineError>> {
        self.chat_template.as_ref()?;
        let mut prompt = String::new();
        for turn in turns {
            prompt.push_str("<|im_start|>");
            prompt.push_str(turn.role.as_str());
            prompt.push('\n');
            prompt.push_str(&turn.content);
            prompt.push_str("<|im_end|>\n");
        }
        prompt.push_str("<|im_start|>assistant\n");
        Some(Ok(prompt))
    }
}

/// Engine answering from a [`ScriptedReply`]
pub struct ScriptedEngine {
    reply: ScriptedReply,
    step_delay: Duration,
    events: EventLog,
}

impl GenerationEngine for ScriptedEngine {
    fn generate(&self, prompt: &str, params: &SamplingParams) -> Result<Generation, EngineError> {
        match &self.reply {
            ScriptedReply::Fail(message) => Err(EngineError::generation(message.clone())),
            ScriptedReply::FailMidway(_) => Err(EngineError::generation("scripted failure")),
            reply => Ok(Generation {
                text: reply.text_for(params),
                prompt_tokens: prompt.chars().count(),
            }),
        }
    }

    fn generate_streaming(
        &self,
        prompt: &str,
        params: &SamplingParams,
        sink: &mut dyn FnMut(&str),
    ) -> Result<Generation, EngineError> {
        if let ScriptedReply::Fail(message) = &self.reply {
            return Err(EngineError::generation(message.clone()));
        }

        let text = self.reply.text_for(params);
        for piece in text.split_inclusive(' ') {
            if !self.step_delay.is_zero() {
                thread::sleep(self.step_delay);
            }
            sink(piece);
        }

        if let ScriptedReply::FailMidway(_) = &self.reply {
            return Err(EngineError::generation("scripted failure after partial output"));
        }
        Ok(Generation {
            text,
            prompt_tokens: prompt.chars().count(),
        })
    }

    fn release_transient(&self) {
        record(&self.events, "release");
    }
}

impl Drop for ScriptedEngine {
    fn drop(&mut self) {
        record(&self.events, "drop_engine");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_roundtrip_counts_chars() {
        let codec = ScriptedCodec::default();
        let tokens = codec.encode("héllo").unwrap();
        assert_eq!(tokens.len(), 5);
        assert_eq!(codec.decode(&tokens).unwrap(), "héllo");
        assert!(codec.decode(&[0xD800]).is_err());
    }

    #[test]
    fn test_codec_templating_requires_template() {
        let mut codec = ScriptedCodec::default();
        assert!(codec.apply_chat_template(&[ChatTurn::user("hi")]).is_none());

        codec.set_chat_template("{{ chatml }}".to_string());
        let prompt = codec
            .apply_chat_template(&[ChatTurn::user("hi")])
            .unwrap()
            .unwrap();
        assert_eq!(prompt, "<|im_start|>user\nhi<|im_end|>\n<|im_start|>assistant\n");
    }

    #[test]
    fn test_fill_budget_uses_whole_budget() {
        let engine = ScriptedEngine {
            reply: ScriptedReply::FillBudget,
            step_delay: Duration::ZERO,
            events: Arc::default(),
        };
        let params = SamplingParams {
            max_tokens: 5,
            ..Default::default()
        };
        let out = engine.generate("p", &params).unwrap();
        assert_eq!(out.text.chars().count(), 5);
    }

    #[test]
    fn test_streaming_pieces_concatenate() {
        let engine = ScriptedEngine {
            reply: ScriptedReply::Fixed("one two three".to_string()),
            step_delay: Duration::ZERO,
            events: Arc::default(),
        };
        let mut pieces = Vec::new();
        let out = engine
            .generate_streaming("p", &SamplingParams::default(), &mut |s: &str| {
                pieces.push(s.to_string())
            })
            .unwrap();
        assert_eq!(pieces, vec!["one ", "two ", "three"]);
        assert_eq!(pieces.concat(), out.text);
    }

    #[test]
    fn test_failing_loads_count_down() {
        let backend = ScriptedBackend::new(ScriptedReply::FillBudget).failing_loads(1, "boom");
        let spec = LoadSpec {
            model_id: "m".to_string(),
            credential: None,
            cache_dir: std::env::temp_dir(),
        };
        assert!(backend.load_codec(&spec).is_err());
        assert!(backend.load_codec(&spec).is_ok());
        assert_eq!(backend.codec_loads(), 2);
    }
}
