//! llama.cpp backend
//!
//! # Architecture
//!
//! Since llama-cpp-2 types (`LlamaBackend`, `LlamaModel`, `LlamaContext`) contain
//! raw pointers that are not `Send`, all llama.cpp work runs on one dedicated
//! worker thread that owns the runtime and every loaded model. Codecs and
//! engines are `Send + Sync` handles that talk to it over channels.
//!
//! Each load gets an id. The model stays resident until the last handle for
//! that id is dropped, so a reload can install a new model while a leased
//! old one finishes its generation.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaChatMessage, LlamaChatTemplate, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;

use crate::inference::engine::{
    EngineBackend, EngineError, Generation, GenerationEngine, LoadSpec, SamplingParams,
    TextCodec,
};
use crate::inference::model::resolve_model_file;
use crate::types::message::ChatTurn;

const BATCH_SIZE: usize = 512;
const MIN_CONTEXT: u32 = 2048;
const PENALTY_WINDOW: i32 = 64;

/// Messages emitted by the worker during one generation
enum StreamToken {
    Token(String),
    Done { prompt_tokens: usize },
    Error(String),
}

/// Commands sent to the worker thread
enum WorkerCommand {
    LoadModel {
        id: u64,
        path: PathBuf,
        gpu_layers: u32,
        response_tx: Sender<Result<Option<String>, String>>,
    },
    UnloadModel {
        id: u64,
    },
    Tokenize {
        id: u64,
        text: String,
        response_tx: Sender<Result<Vec<u32>, String>>,
    },
    Detokenize {
        id: u64,
        tokens: Vec<u32>,
        response_tx: Sender<Result<String, String>>,
    },
    ApplyTemplate {
        id: u64,
        template: String,
        turns: Vec<ChatTurn>,
        response_tx: Sender<Result<String, String>>,
    },
    Generate {
        id: u64,
        prompt: String,
        params: SamplingParams,
        context_size: u32,
        token_tx: Sender<StreamToken>,
    },
    Shutdown,
}

/// Backend running GGUF models through llama.cpp
pub struct LlamaCppBackend {
    gpu_layers: u32,
    context_size: u32,
    command_tx: Sender<WorkerCommand>,
    worker_handle: Mutex<Option<JoinHandle<()>>>,
    next_id: AtomicU64,
    /// Model loaded by `load_codec`, waiting for `load_engine`
    pending: Mutex<Option<Arc<ResidentModel>>>,
}

impl LlamaCppBackend {
    /// Starts the worker thread. The runtime itself initializes on it.
    pub fn new(gpu_layers: u32, context_size: u32) -> Self {
        let (command_tx, command_rx) = mpsc::channel::<WorkerCommand>();
        let handle = thread::spawn(move || {
            worker_thread_main(command_rx);
        });
        tracing::info!("llama.cpp worker thread started");

        Self {
            gpu_layers,
            context_size,
            command_tx,
            worker_handle: Mutex::new(Some(handle)),
            next_id: AtomicU64::new(1),
            pending: Mutex::new(None),
        }
    }
}

impl Drop for LlamaCppBackend {
    fn drop(&mut self) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let _ = self.command_tx.send(WorkerCommand::Shutdown);
        let handle = self
            .worker_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

fn worker_gone<T>(_: T) -> EngineError {
    EngineError::generation("llama.cpp worker thread is gone")
}

/// A model resident on the worker, unloaded when the last handle drops
struct ResidentModel {
    id: u64,
    command_tx: Sender<WorkerCommand>,
}

impl ResidentModel {
    fn request<T>(
        &self,
        build: impl FnOnce(Sender<Result<T, String>>) -> WorkerCommand,
    ) -> Result<Result<T, String>, EngineError> {
        let (response_tx, response_rx) = mpsc::channel();
        self.command_tx.send(build(response_tx)).map_err(worker_gone)?;
        response_rx.recv().map_err(worker_gone)
    }
}

impl Drop for ResidentModel {
    fn drop(&mut self) {
        let _ = self.command_tx.send(WorkerCommand::UnloadModel { id: self.id });
    }
}

impl EngineBackend for LlamaCppBackend {
    fn name(&self) -> &str {
        "llama"
    }

    fn load_codec(&self, spec: &LoadSpec) -> Result<Box<dyn TextCodec>, EngineError> {
        let path = resolve_model_file(&spec.model_id, &spec.cache_dir)
            .map_err(|e| EngineError::init_failure(e.to_string()))?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        let (response_tx, response_rx) = mpsc::channel();
        self.command_tx
            .send(WorkerCommand::LoadModel {
                id,
                path,
                gpu_layers: self.gpu_layers,
                response_tx,
            })
            .map_err(|e| EngineError::init_failure(e.to_string()))?;
        let chat_template = response_rx
            .recv()
            .map_err(|e| EngineError::init_failure(e.to_string()))?
            .map_err(EngineError::init_failure)?;

        let model = Arc::new(ResidentModel {
            id,
            command_tx: self.command_tx.clone(),
        });
        *self.pending.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&model));

        Ok(Box::new(LlamaCodec {
            model,
            chat_template,
        }))
    }

    fn load_engine(
        &self,
        _spec: &LoadSpec,
        _codec: &dyn TextCodec,
    ) -> Result<Arc<dyn GenerationEngine>, EngineError> {
        let model = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| EngineError::init_failure("engine requested before its codec"))?;
        Ok(Arc::new(LlamaEngine {
            model,
            context_size: self.context_size,
        }))
    }
}

/// Tokenizer half of a resident model
pub struct LlamaCodec {
    model: Arc<ResidentModel>,
    chat_template: Option<String>,
}

impl TextCodec for LlamaCodec {
    fn encode(&self, text: &str) -> Result<Vec<u32>, EngineError> {
        let text = text.to_string();
        self.model
            .request(|response_tx| WorkerCommand::Tokenize {
                id: self.model.id,
                text,
                response_tx,
            })?
            .map_err(EngineError::Codec)
    }

    fn decode(&self, tokens: &[u32]) -> Result<String, EngineError> {
        let tokens = tokens.to_vec();
        self.model
            .request(|response_tx| WorkerCommand::Detokenize {
                id: self.model.id,
                tokens,
                response_tx,
            })?
            .map_err(EngineError::Codec)
    }

    fn chat_template(&self) -> Option<&str> {
        self.chat_template.as_deref()
    }

    fn set_chat_template(&mut self, template: String) {
        self.chat_template = Some(template);
    }

    fn apply_chat_template(&self, turns: &[ChatTurn]) -> Option<Result<String, EngineError>> {
        let template = self.chat_template.clone()?;
        let turns = turns.to_vec();
        let result = self
            .model
            .request(|response_tx| WorkerCommand::ApplyTemplate {
                id: self.model.id,
                template,
                turns,
                response_tx,
            })
            .and_then(|r| r.map_err(EngineError::Codec));
        Some(result)
    }
}

/// Generation half of a resident model
pub struct LlamaEngine {
    model: Arc<ResidentModel>,
    context_size: u32,
}

impl GenerationEngine for LlamaEngine {
    fn generate(&self, prompt: &str, params: &SamplingParams) -> Result<Generation, EngineError> {
        let mut text = String::new();
        let generation = self.generate_streaming(prompt, params, &mut |piece| text.push_str(piece))?;
        Ok(Generation { text, ..generation })
    }

    fn generate_streaming(
        &self,
        prompt: &str,
        params: &SamplingParams,
        sink: &mut dyn FnMut(&str),
    ) -> Result<Generation, EngineError> {
        let (token_tx, token_rx) = mpsc::channel();
        self.model
            .command_tx
            .send(WorkerCommand::Generate {
                id: self.model.id,
                prompt: prompt.to_string(),
                params: params.clone(),
                context_size: self.context_size,
                token_tx,
            })
            .map_err(worker_gone)?;

        let mut text = String::new();
        loop {
            match token_rx.recv().map_err(worker_gone)? {
                StreamToken::Token(piece) => {
                    sink(&piece);
                    text.push_str(&piece);
                }
                StreamToken::Done { prompt_tokens } => {
                    return Ok(Generation {
                        text,
                        prompt_tokens,
                    })
                }
                StreamToken::Error(e) => return Err(EngineError::generation(e)),
            }
        }
    }
}

/// Worker thread main loop
///
/// Owns the LlamaBackend and every loaded LlamaModel, processes commands in
/// arrival order.
fn worker_thread_main(command_rx: Receiver<WorkerCommand>) {
    let backend = match LlamaBackend::init() {
        Ok(b) => {
            tracing::info!("LlamaBackend initialized in worker thread");
            Ok(b)
        }
        Err(e) => {
            tracing::error!("Failed to init backend: {}", e);
            Err(e.to_string())
        }
    };
    let mut models: HashMap<u64, LlamaModel> = HashMap::new();

    loop {
        match command_rx.recv() {
            Ok(WorkerCommand::LoadModel {
                id,
                path,
                gpu_layers,
                response_tx,
            }) => {
                let result = backend.as_ref().map_err(Clone::clone).and_then(|b| {
                    let model_params = LlamaModelParams::default().with_n_gpu_layers(gpu_layers);
                    LlamaModel::load_from_file(b, &path, &model_params)
                        .map_err(|e| format!("Failed to load model: {}", e))
                });
                let reply = result.map(|model| {
                    tracing::info!(
                        "Model loaded: {} ({} params, {} vocab, {} ctx)",
                        path.display(),
                        model.n_params(),
                        model.n_vocab(),
                        model.n_ctx_train()
                    );
                    let template = model
                        .chat_template(None)
                        .ok()
                        .and_then(|t| t.to_string().ok());
                    models.insert(id, model);
                    template
                });
                let _ = response_tx.send(reply);
            }
            Ok(WorkerCommand::UnloadModel { id }) => {
                if models.remove(&id).is_some() {
                    tracing::info!("Model {} unloaded in worker thread", id);
                }
            }
            Ok(WorkerCommand::Tokenize {
                id,
                text,
                response_tx,
            }) => {
                let result = resident(&models, id).and_then(|m| {
                    m.str_to_token(&text, AddBos::Never)
                        .map(|tokens| tokens.into_iter().map(|t| t.0 as u32).collect())
                        .map_err(|e| format!("Failed to tokenize: {}", e))
                });
                let _ = response_tx.send(result);
            }
            Ok(WorkerCommand::Detokenize {
                id,
                tokens,
                response_tx,
            }) => {
                let result = resident(&models, id).and_then(|m| detokenize(m, &tokens));
                let _ = response_tx.send(result);
            }
            Ok(WorkerCommand::ApplyTemplate {
                id,
                template,
                turns,
                response_tx,
            }) => {
                let result = resident(&models, id).and_then(|m| apply_template(m, &template, &turns));
                let _ = response_tx.send(result);
            }
            Ok(WorkerCommand::Generate {
                id,
                prompt,
                params,
                context_size,
                token_tx,
            }) => match (&backend, resident(&models, id)) {
                (Ok(b), Ok(m)) => {
                    match run_generation(b, m, &prompt, &params, context_size, &token_tx) {
                        Ok(prompt_tokens) => {
                            let _ = token_tx.send(StreamToken::Done { prompt_tokens });
                        }
                        Err(e) => {
                            let _ = token_tx.send(StreamToken::Error(e));
                        }
                    }
                }
                (Err(e), _) => {
                    let _ = token_tx.send(StreamToken::Error(e.clone()));
                }
                (_, Err(e)) => {
                    let _ = token_tx.send(StreamToken::Error(e));
                }
            },
            Ok(WorkerCommand::Shutdown) => {
                tracing::info!("Worker thread shutting down");
                break;
            }
            Err(_) => {
                tracing::debug!("Command channel closed, worker exiting");
                break;
            }
        }
    }
}

fn resident(models: &HashMap<u64, LlamaModel>, id: u64) -> Result<&LlamaModel, String> {
    models
        .get(&id)
        .ok_or_else(|| format!("model {} is not resident", id))
}

fn detokenize(model: &LlamaModel, tokens: &[u32]) -> Result<String, String> {
    let mut bytes = Vec::new();
    for &t in tokens {
        let piece = model
            .token_to_bytes(LlamaToken(t as i32), Special::Tokenize)
            .map_err(|e| format!("Failed to convert token to bytes: {}", e))?;
        bytes.extend_from_slice(&piece);
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn apply_template(model: &LlamaModel, template: &str, turns: &[ChatTurn]) -> Result<String, String> {
    let template =
        LlamaChatTemplate::new(template).map_err(|e| format!("Invalid chat template: {e}"))?;
    let messages = turns
        .iter()
        .map(|turn| LlamaChatMessage::new(turn.role.as_str().to_string(), turn.content.clone()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("Failed to build chat message: {e}"))?;
    model
        .apply_chat_template(&template, &messages, true)
        .map_err(|e| format!("Failed to apply chat template: {e}"))
}

/// Run one generation on the worker. Returns the prompt token count.
fn run_generation(
    backend: &LlamaBackend,
    model: &LlamaModel,
    prompt: &str,
    params: &SamplingParams,
    context_size: u32,
    tx: &Sender<StreamToken>,
) -> Result<usize, String> {
    let n_ctx = context_size.min(model.n_ctx_train()).max(MIN_CONTEXT);
    let ctx_params = LlamaContextParams::default()
        .with_n_ctx(NonZeroU32::new(n_ctx))
        .with_n_batch(BATCH_SIZE as u32);

    let mut ctx = model
        .new_context(backend, ctx_params)
        .map_err(|e| format!("Failed to create context: {}", e))?;

    let tokens = model
        .str_to_token(prompt, AddBos::Always)
        .map_err(|e| format!("Failed to tokenize: {}", e))?;
    if tokens.is_empty() {
        return Err("prompt tokenized to nothing".to_string());
    }
    tracing::debug!("Tokenized prompt into {} tokens", tokens.len());

    run_inference(&mut ctx, model, &tokens, params, tx)?;
    Ok(tokens.len())
}

fn run_inference(
    ctx: &mut LlamaContext,
    model: &LlamaModel,
    prompt_tokens: &[LlamaToken],
    params: &SamplingParams,
    tx: &Sender<StreamToken>,
) -> Result<(), String> {
    let mut batch = LlamaBatch::new(BATCH_SIZE, 1);

    // Prompt goes in batch-sized slices, logits only for its last token
    let last = prompt_tokens.len() - 1;
    for (chunk_index, chunk) in prompt_tokens.chunks(BATCH_SIZE).enumerate() {
        batch.clear();
        for (offset, token) in chunk.iter().enumerate() {
            let pos = chunk_index * BATCH_SIZE + offset;
            batch
                .add(*token, pos as i32, &[0], pos == last)
                .map_err(|e| format!("Failed to add token to batch: {}", e))?;
        }
        ctx.decode(&mut batch)
            .map_err(|e| format!("Failed to decode prompt: {}", e))?;
    }

    let mut sampler = build_sampler(params);
    let mut n_decoded = prompt_tokens.len() as i32;

    // Buffer for handling incomplete UTF-8 sequences
    let mut utf8_buffer: Vec<u8> = Vec::new();

    for _ in 0..params.max_tokens {
        let new_token = sampler.sample(ctx, -1);
        sampler.accept(new_token);

        if model.is_eog_token(new_token) {
            tracing::debug!("End of generation token encountered");
            break;
        }

        let token_bytes = model
            .token_to_bytes(new_token, Special::Tokenize)
            .map_err(|e| format!("Failed to convert token to bytes: {}", e))?;
        utf8_buffer.extend_from_slice(&token_bytes);

        // Emit the longest valid prefix, keep an incomplete tail
        let valid_len = match std::str::from_utf8(&utf8_buffer) {
            Ok(_) => utf8_buffer.len(),
            Err(e) => e.valid_up_to(),
        };
        if valid_len > 0 {
            let piece = String::from_utf8_lossy(&utf8_buffer[..valid_len]).into_owned();
            utf8_buffer.drain(..valid_len);
            if tx.send(StreamToken::Token(piece)).is_err() {
                tracing::debug!("Receiver dropped, stopping generation");
                return Ok(());
            }
        }

        batch.clear();
        batch
            .add(new_token, n_decoded, &[0], true)
            .map_err(|e| format!("Failed to add token to batch: {}", e))?;
        ctx.decode(&mut batch)
            .map_err(|e| format!("Failed to decode: {}", e))?;
        n_decoded += 1;
    }

    if !utf8_buffer.is_empty() {
        let _ = tx.send(StreamToken::Token(
            String::from_utf8_lossy(&utf8_buffer).into_owned(),
        ));
    }
    Ok(())
}

fn build_sampler(params: &SamplingParams) -> LlamaSampler {
    if params.is_greedy() {
        return LlamaSampler::greedy();
    }

    let seed = if params.seed == 0 {
        rand_seed()
    } else {
        params.seed
    };

    let mut chain = Vec::new();
    if params.repetition_penalty > 1.0 {
        chain.push(LlamaSampler::penalties(
            PENALTY_WINDOW,
            params.repetition_penalty,
            0.0,
            0.0,
        ));
    }
    if params.top_k > 0 {
        chain.push(LlamaSampler::top_k(params.top_k as i32));
    }
    chain.push(LlamaSampler::top_p(params.top_p, 1));
    chain.push(LlamaSampler::temp(params.temperature));
    chain.push(LlamaSampler::dist(seed));
    LlamaSampler::chain_simple(chain)
}

/// Generates a random seed using system entropy
fn rand_seed() -> u32 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    RandomState::new().build_hasher().finish() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_model_is_download_failure() {
        let backend = LlamaCppBackend::new(0, 4096);
        let spec = LoadSpec {
            model_id: "Org/absent-model".to_string(),
            credential: None,
            cache_dir: std::env::temp_dir().join("finserve-llama-test-empty"),
        };
        let err = backend.load_codec(&spec).err().unwrap();
        assert_eq!(err.public_message(), "model download failed");
    }

    #[test]
    fn test_engine_requires_codec_first() {
        use crate::inference::scripted::ScriptedCodec;

        let backend = LlamaCppBackend::new(0, 4096);
        let spec = LoadSpec {
            model_id: "Org/absent-model".to_string(),
            credential: None,
            cache_dir: std::env::temp_dir(),
        };
        assert!(backend.load_engine(&spec, &ScriptedCodec::default()).is_err());
    }
}
