//! Chat service
//!
//! Wires the lifecycle manager, prompt composer, streaming bridge and
//! post-processor into the operations the HTTP layer exposes.

use std::pin::Pin;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use serde::Serialize;

use crate::compose::{plan_tools, PromptComposer, ToolPlan};
use crate::inference::engine::{EngineError, SamplingParams};
use crate::inference::lifecycle::{EngineLease, EngineLifecycleManager, EngineSnapshot, EngineStatus};
use crate::inference::streaming::{GenerationJob, StreamChunk, StreamingBridge};
use crate::postprocess::{ResponsePostProcessor, ToolCallHoldback};
use crate::types::completion::{completion_id, AssistantMessage, CompletionResult, FinishReason};
use crate::types::openai::{ChatCompletionChunk, Delta, ModelCard, ModelList, ToolCallDelta};
use crate::types::request::ChatRequest;

/// OpenAI-shaped chunk frames for one streamed completion
pub type CompletionStream = Pin<Box<dyn Stream<Item = ChatCompletionChunk> + Send>>;

/// Composed prompt returned without generating
#[derive(Debug, Clone, Serialize)]
pub struct PromptPreview {
    pub prompt: String,
    pub prompt_tokens: usize,
    pub message_count: usize,
    pub has_chat_template: bool,
    pub template_length: usize,
}

/// Readiness report for probes
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub ready: bool,
    pub model: String,
    pub backend: String,
    pub engine: EngineSnapshot,
    pub generation_slots: usize,
    pub idle_generation_slots: usize,
}

/// Request orchestration over one shared engine
pub struct ChatService {
    manager: Arc<EngineLifecycleManager>,
    bridge: StreamingBridge,
    composer: PromptComposer,
    postprocessor: Arc<ResponsePostProcessor>,
    default_sampling: SamplingParams,
    started: i64,
}

impl ChatService {
    pub fn new(
        manager: Arc<EngineLifecycleManager>,
        bridge: StreamingBridge,
        composer: PromptComposer,
        postprocessor: ResponsePostProcessor,
        default_sampling: SamplingParams,
    ) -> Self {
        Self {
            manager,
            bridge,
            composer,
            postprocessor: Arc::new(postprocessor),
            default_sampling,
            started: chrono::Utc::now().timestamp(),
        }
    }

    pub fn model_id(&self) -> &str {
        self.manager.model_id()
    }

    pub fn backend_name(&self) -> &str {
        self.manager.backend_name()
    }

    /// Sampling values used for anything a request leaves out
    pub fn default_sampling(&self) -> &SamplingParams {
        &self.default_sampling
    }

    pub fn manager(&self) -> &Arc<EngineLifecycleManager> {
        &self.manager
    }

    async fn wait_ready(&self) -> Result<(), EngineError> {
        if self.manager.is_ready() {
            return Ok(());
        }
        let manager = Arc::clone(&self.manager);
        tokio::task::spawn_blocking(move || manager.ensure_ready())
            .await
            .map_err(|e| EngineError::init_failure(format!("initialization task failed: {}", e)))?
    }

    /// Initializes the engine if needed and leases its handles.
    async fn ready_lease(&self) -> Result<EngineLease, EngineError> {
        self.wait_ready().await?;
        match self.manager.lease() {
            // A forced reload can land between readiness and the lease
            Err(EngineError::NotReady) => {
                tracing::debug!("Engine reloading before lease, waiting again");
                self.wait_ready().await?;
                self.manager.lease()
            }
            other => other,
        }
    }

    /// Runs a request to completion.
    pub async fn complete(&self, request: ChatRequest) -> Result<CompletionResult, EngineError> {
        let lease = self.ready_lease().await?;
        let prompt = self.composer.compose(&request, lease.codec.as_ref());
        let plan = plan_tools(&request.tools, request.tool_choice.as_ref());
        let requires_json = request.requires_json();

        tracing::info!(
            "Chat completion: {} turn(s), max_tokens={}, tools={}",
            request.turns.len(),
            request.sampling.max_tokens,
            plan.as_ref().map_or(0, |p| p.tools.len())
        );

        tracing::debug!("Prompt: {}", crate::truncate_str(&prompt, 400));

        let job = GenerationJob::new(prompt, request.sampling);
        let created = job.created;
        let outcome = self.bridge.run_blocking(lease, job).await?;

        let processed = self.postprocessor.process(
            &outcome.text,
            outcome.finish_reason,
            plan.as_ref(),
            requires_json,
        );

        tracing::debug!(
            "Completion finished: reason={}, prompt_tokens={}, completion_tokens={}",
            processed.finish_reason,
            outcome.usage.prompt_tokens,
            outcome.usage.completion_tokens
        );

        Ok(CompletionResult {
            id: completion_id(),
            created,
            model: self.model_id().to_string(),
            message: AssistantMessage {
                content: processed.content,
                tool_calls: (!processed.tool_calls.is_empty()).then_some(processed.tool_calls),
            },
            finish_reason: processed.finish_reason,
            usage: outcome.usage,
        })
    }

    /// Streams a request as chunk frames.
    ///
    /// The first frame carries the assistant role, then one frame per text
    /// increment, then exactly one frame with a finish reason. When tools
    /// are offered, text from the first possible call opening is held back;
    /// what stays visible after call extraction is sent just before the last
    /// frame, and the calls ride on that frame. Initialization errors
    /// surface here, before any frame.
    pub async fn complete_stream(
        &self,
        request: ChatRequest,
        include_usage: bool,
    ) -> Result<CompletionStream, EngineError> {
        let lease = self.ready_lease().await?;
        let prompt = self.composer.compose(&request, lease.codec.as_ref());
        let plan = plan_tools(&request.tools, request.tool_choice.as_ref());

        tracing::info!(
            "Streaming chat completion: {} turn(s), max_tokens={}",
            request.turns.len(),
            request.sampling.max_tokens
        );

        let job = GenerationJob::new(prompt, request.sampling);
        let frame = FrameBuilder {
            id: completion_id(),
            created: job.created,
            model: self.model_id().to_string(),
        };
        let postprocessor = Arc::clone(&self.postprocessor);
        let mut chunks = self.bridge.run_streaming(lease, job);

        Ok(Box::pin(async_stream::stream! {
            yield frame.chunk(Delta {
                role: Some("assistant"),
                ..Default::default()
            });

            let mut holdback = plan.as_ref().map(|_| ToolCallHoldback::default());
            while let Some(chunk) = chunks.next().await {
                if chunk.is_terminal() {
                    let held = holdback.take().map(ToolCallHoldback::finish).unwrap_or_default();
                    let (tail, last) =
                        frame.terminal(chunk, plan.as_ref(), &held, &postprocessor, include_usage);
                    if let Some(tail) = tail {
                        yield frame.chunk(Delta {
                            content: Some(tail),
                            ..Default::default()
                        });
                    }
                    yield last;
                    break;
                }
                let visible = match holdback.as_mut() {
                    Some(holdback) => holdback.push(&chunk.delta),
                    None => (!chunk.delta.is_empty()).then_some(chunk.delta),
                };
                if let Some(content) = visible {
                    yield frame.chunk(Delta {
                        content: Some(content),
                        ..Default::default()
                    });
                }
            }
        }))
    }

    /// Composes the prompt a request would produce, without generating.
    pub async fn preview_prompt(&self, request: &ChatRequest) -> Result<PromptPreview, EngineError> {
        let lease = self.ready_lease().await?;
        let codec = lease.codec.as_ref();
        let prompt = self.composer.compose(request, codec);
        let prompt_tokens = codec.count_tokens(&prompt)?;

        Ok(PromptPreview {
            prompt_tokens,
            message_count: request.turns.len(),
            has_chat_template: codec.chat_template().is_some(),
            template_length: codec.chat_template().map_or(0, str::len),
            prompt,
        })
    }

    /// Initializes, or reloads when `force` is set.
    pub async fn reload(&self, force: bool) -> Result<EngineSnapshot, EngineError> {
        tracing::info!("Engine reload requested (force={})", force);
        let manager = Arc::clone(&self.manager);
        tokio::task::spawn_blocking(move || manager.init(force))
            .await
            .map_err(|e| EngineError::init_failure(format!("reload task failed: {}", e)))??;
        Ok(self.manager.snapshot())
    }

    pub fn is_ready(&self) -> bool {
        self.manager.is_ready()
    }

    pub fn health(&self) -> HealthReport {
        let engine = self.manager.snapshot();
        HealthReport {
            ready: engine.status == EngineStatus::Ready,
            model: self.model_id().to_string(),
            backend: self.backend_name().to_string(),
            engine,
            generation_slots: self.bridge.slots(),
            idle_generation_slots: self.bridge.idle_slots(),
        }
    }

    /// The single served model
    pub fn list_models(&self) -> ModelList {
        let model = self.model_id();
        let owned_by = model
            .split_once('/')
            .map(|(org, _)| org)
            .filter(|org| !org.is_empty() && !org.contains(|c: char| c == '.' || c == '\\'))
            .unwrap_or("finserve");

        ModelList {
            object: "list",
            data: vec![ModelCard {
                id: model.to_string(),
                object: "model",
                created: self.started,
                owned_by: owned_by.to_string(),
            }],
        }
    }
}

/// Shared identity of every frame of one stream
struct FrameBuilder {
    id: String,
    created: i64,
    model: String,
}

impl FrameBuilder {
    fn chunk(&self, delta: Delta) -> ChatCompletionChunk {
        ChatCompletionChunk::new(&self.id, self.created, &self.model, delta)
    }

    /// Builds the last frame, plus any held-back text left visible once
    /// tool calls are removed from it.
    fn terminal(
        &self,
        chunk: StreamChunk,
        plan: Option<&ToolPlan>,
        held: &str,
        postprocessor: &ResponsePostProcessor,
        include_usage: bool,
    ) -> (Option<String>, ChatCompletionChunk) {
        let reason = chunk.finish_reason.unwrap_or(FinishReason::Stop);
        if reason == FinishReason::Error {
            let message = chunk.error.unwrap_or_else(|| "an internal error occurred".to_string());
            let last = self
                .chunk(Delta::default())
                .with_finish(FinishReason::Error, None)
                .with_error(message);
            return (None, last);
        }

        let mut delta = Delta::default();
        let mut reason = reason;
        let mut tail = None;
        if let Some(plan) = plan {
            let processed = postprocessor.process(held, reason, Some(plan), false);
            if !processed.tool_calls.is_empty() {
                delta.tool_calls = Some(
                    processed
                        .tool_calls
                        .iter()
                        .enumerate()
                        .map(|(index, call)| ToolCallDelta {
                            index,
                            call: call.into(),
                        })
                        .collect(),
                );
            }
            reason = processed.finish_reason;
            tail = processed.content;
        }

        let usage = if include_usage { chunk.usage } else { None };
        (tail, self.chunk(delta).with_finish(reason, usage))
    }
}
