//! On-device text generation: one model, one context window, a sampler
//! chain, and an optional two-thread streaming pipeline, behind a
//! memory-aware admission layer.

pub mod backend;
pub mod bridge;
pub mod cache;
pub mod commands;
pub mod config;
pub mod engine;
pub mod errors;
pub mod pipeline;
pub mod protocol;
pub mod resources;
pub mod runtime;
pub mod sampling;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use backend::{CandleLoader, ModelLoader, PieceState, TensorRuntime, Vocabulary};
pub use bridge::EngineBridge;
pub use config::{GenerationConfig, KernelConfig};
pub use engine::{GenerationStats, LlmEngine};
pub use errors::{CacheError, EngineError, RuntimeError};
pub use resources::{MemoryPressure, ResourceMonitor};
