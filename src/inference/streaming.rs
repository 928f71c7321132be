//! Streaming bridge
//!
//! Runs blocking generation on tokio's blocking pool and exposes streamed
//! output as an async sequence of [`StreamChunk`]s fed through a bounded
//! channel.

use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use tokio::sync::{mpsc, Semaphore};

use crate::inference::engine::{EngineError, SamplingParams};
use crate::inference::lifecycle::EngineLease;
use crate::types::completion::{FinishReason, Usage};

/// Default capacity of the worker → consumer channel
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// One request's unit of generation work
#[derive(Debug, Clone)]
pub struct GenerationJob {
    pub prompt: String,
    pub params: SamplingParams,
    /// Unix timestamp (seconds)
    pub created: i64,
}

impl GenerationJob {
    pub fn new(prompt: impl Into<String>, params: SamplingParams) -> Self {
        Self {
            prompt: prompt.into(),
            params,
            created: chrono::Utc::now().timestamp(),
        }
    }
}

/// Represents one element of a streamed generation.
///
/// Intermediate chunks carry a text delta only. The terminal chunk carries
/// the finish reason, and with it the usage and full text, or a sanitized
/// error when the worker failed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamChunk {
    pub delta: String,
    pub finish_reason: Option<FinishReason>,
    pub usage: Option<Usage>,
    pub full_text: Option<String>,
    pub error: Option<String>,
}

impl StreamChunk {
    fn delta(text: String) -> Self {
        Self {
            delta: text,
            ..Default::default()
        }
    }

    fn finished(outcome: GenerationOutcome) -> Self {
        Self {
            finish_reason: Some(outcome.finish_reason),
            usage: Some(outcome.usage),
            full_text: Some(outcome.text),
            ..Default::default()
        }
    }

    fn failed(text: String, err: &EngineError) -> Self {
        Self {
            finish_reason: Some(FinishReason::Error),
            full_text: Some(text),
            error: Some(err.public_message().to_string()),
            ..Default::default()
        }
    }

    /// Returns true for the last chunk of a job
    pub fn is_terminal(&self) -> bool {
        self.finish_reason.is_some()
    }
}

/// Finite, single-pass sequence of chunks for one job
pub type ChunkStream = Pin<Box<dyn Stream<Item = StreamChunk> + Send>>;

/// Result of a completed generation
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOutcome {
    pub text: String,
    pub usage: Usage,
    /// `length` or `stop`
    pub finish_reason: FinishReason,
}

/// Moves generation off the async scheduler
///
/// A semaphore gates how many generations run against the shared engine at
/// once. The permit travels into the blocking worker and is released only
/// when the compute ends.
#[derive(Clone)]
pub struct StreamingBridge {
    channel_capacity: usize,
    gate: Arc<Semaphore>,
    slots: usize,
}

impl StreamingBridge {
    pub fn new(channel_capacity: usize, max_concurrent_generations: usize) -> Self {
        let slots = max_concurrent_generations.max(1);
        Self {
            channel_capacity: channel_capacity.max(1),
            gate: Arc::new(Semaphore::new(slots)),
            slots,
        }
    }

    /// Generation slots not currently held by a worker.
    pub fn idle_slots(&self) -> usize {
        self.gate.available_permits()
    }

    /// Total generation slots.
    pub fn slots(&self) -> usize {
        self.slots
    }

    /// Runs one generation to completion.
    pub async fn run_blocking(
        &self,
        lease: EngineLease,
        job: GenerationJob,
    ) -> Result<GenerationOutcome, EngineError> {
        let permit = Arc::clone(&self.gate)
            .acquire_owned()
            .await
            .map_err(|_| EngineError::generation("generation gate closed"))?;

        let worker = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let result = lease.engine.generate(&job.prompt, &job.params);
            lease.engine.release_transient();
            let generation = result?;
            summarize(&lease, &job, generation.text, generation.prompt_tokens)
        });

        match worker.await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!("Generation worker panicked: {}", e);
                Err(EngineError::generation(format!("generation worker failed: {}", e)))
            }
        }
    }

    /// Streams one generation.
    ///
    /// Always ends with exactly one terminal chunk. Dropping the stream does
    /// not stop the worker: it finishes, discards what it produces and
    /// releases transient resources on its own.
    pub fn run_streaming(&self, lease: EngineLease, job: GenerationJob) -> ChunkStream {
        let gate = Arc::clone(&self.gate);
        let capacity = self.channel_capacity;

        Box::pin(async_stream::stream! {
            let permit = match gate.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    let err = EngineError::generation("generation gate closed");
                    tracing::error!("{}", err);
                    yield StreamChunk::failed(String::new(), &err);
                    return;
                }
            };

            let (tx, mut rx) = mpsc::channel::<String>(capacity);
            let worker_lease = Arc::clone(&lease);
            let worker_job = job.clone();
            let worker = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                let mut consumer_gone = false;
                let result = worker_lease.engine.generate_streaming(
                    &worker_job.prompt,
                    &worker_job.params,
                    &mut |piece: &str| {
                        if consumer_gone {
                            return;
                        }
                        if tx.blocking_send(piece.to_string()).is_err() {
                            consumer_gone = true;
                            tracing::debug!("Stream consumer dropped, discarding remaining output");
                        }
                    },
                );
                worker_lease.engine.release_transient();
                result
            });

            let mut text = String::new();
            while let Some(piece) = rx.recv().await {
                text.push_str(&piece);
                yield StreamChunk::delta(piece);
            }

            let terminal = match worker.await {
                Ok(Ok(generation)) => {
                    match summarize(&lease, &job, text.clone(), generation.prompt_tokens) {
                        Ok(outcome) => StreamChunk::finished(outcome),
                        Err(e) => {
                            tracing::error!("Failed to finalize stream: {}", e);
                            StreamChunk::failed(text, &e)
                        }
                    }
                }
                Ok(Err(e)) => {
                    tracing::error!("Streaming generation failed: {}", e);
                    StreamChunk::failed(text, &e)
                }
                Err(e) => {
                    tracing::error!("Streaming worker panicked: {}", e);
                    let err = EngineError::generation(format!("generation worker failed: {}", e));
                    StreamChunk::failed(text, &err)
                }
            };
            yield terminal;
        })
    }
}

impl Default for StreamingBridge {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY, 1)
    }
}

/// Counts tokens with the lease's codec and picks the finish reason.
fn summarize(
    lease: &EngineLease,
    job: &GenerationJob,
    text: String,
    engine_prompt_tokens: usize,
) -> Result<GenerationOutcome, EngineError> {
    let prompt_tokens = match lease.codec.count_tokens(&job.prompt) {
        Ok(count) => count,
        Err(e) => {
            tracing::warn!("Could not count prompt tokens, using engine count: {}", e);
            engine_prompt_tokens
        }
    };
    let completion_tokens = lease.codec.count_tokens(&text)?;
    Ok(GenerationOutcome {
        finish_reason: FinishReason::from_budget(completion_tokens, job.params.max_tokens),
        usage: Usage::new(prompt_tokens, completion_tokens),
        text,
    })
}
