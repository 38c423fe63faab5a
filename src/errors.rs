use thiserror::Error;

use crate::backend::SeqId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("cache is not bound to a live context")]
    Unbound,
    #[error("no free cache cells: {requested} requested, {free} free")]
    Full { requested: usize, free: usize },
    #[error("invalid position range [{start}, {end})")]
    InvalidRange { start: i32, end: i32 },
    #[error("invalid sequence id {0}")]
    InvalidSequence(SeqId),
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("failed to load model from {path}: {reason}")]
    Load { path: String, reason: String },
    #[error("tokenizer error: {0}")]
    Tokenizer(String),
    #[error("token buffer too small: {required} slots required")]
    BufferTooSmall { required: usize },
    #[error("decode failed: {0}")]
    Decode(String),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl From<candle_core::Error> for RuntimeError {
    fn from(e: candle_core::Error) -> Self {
        RuntimeError::Decode(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no model loaded")]
    NotLoaded,
    #[error("admission denied: {requested} bytes requested, {available} bytes available")]
    AdmissionDenied { requested: u64, available: u64 },
    #[error("prompt produced no tokens")]
    EmptyPrompt,
    #[error("a streaming generation owns the context")]
    PipelineBusy,
    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

impl From<CacheError> for EngineError {
    fn from(e: CacheError) -> Self {
        EngineError::Runtime(RuntimeError::Cache(e))
    }
}
