//! Generation engine plumbing
//!
//! Lifecycle of the shared engine, the bridge that runs it off the async
//! scheduler, and the backends that load it.

pub mod engine;
pub mod lifecycle;
#[cfg(feature = "llama")]
pub mod llama;
pub mod model;
pub mod scripted;
pub mod streaming;
pub mod template;

// Re-export main types for convenience
pub use engine::{
    EngineBackend, EngineError, GenerationEngine, InitFailureKind, SamplingParams, TextCodec,
};
pub use lifecycle::{EngineLease, EngineLifecycleManager, EngineSnapshot, EngineStatus, LifecycleConfig};
pub use streaming::{ChunkStream, GenerationJob, GenerationOutcome, StreamChunk, StreamingBridge};
pub use template::HubTemplateSource;
