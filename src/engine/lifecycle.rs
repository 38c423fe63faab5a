use std::path::Path;
use std::sync::PoisonError;

use tracing::{error, info, warn};

use crate::backend::ContextParams;
use crate::config::GenerationConfig;
use crate::errors::EngineError;
use crate::resources::MB;
use crate::sampling::SamplerChain;

use super::{EngineState, GenerationStats, LlmEngine, Registration};

/// Admission estimate when the model file size cannot be read.
const FALLBACK_MODEL_BYTES: u64 = 600 * MB;

/// Per-slot working memory reported for a context: keys and values as f32.
pub(crate) fn context_memory_bytes(n_ctx: usize, n_embd: usize) -> u64 {
    (n_ctx * n_embd * std::mem::size_of::<f32>() * 2) as u64
}

impl LlmEngine {
    /// Loads `path`, replacing any model already loaded. Admission is decided
    /// before anything is allocated; a refused or failed load leaves the
    /// engine unloaded and ready for another attempt.
    pub fn load_model(&self, path: &Path, config: &GenerationConfig) -> Result<(), EngineError> {
        if self.is_model_loaded() {
            info!("ENGINE: replacing loaded model");
            self.unload_model();
        }

        let requested = std::fs::metadata(path)
            .map(|m| m.len())
            .unwrap_or(FALLBACK_MODEL_BYTES);
        let available = self.monitor.available_memory();
        if requested > self.monitor.max_model_size() || !self.monitor.can_allocate(requested) {
            warn!(
                path = %path.display(),
                requested_mb = requested / MB,
                available_mb = available / MB,
                "ENGINE: load refused by admission control"
            );
            return Err(EngineError::AdmissionDenied { requested, available });
        }

        let recommended = self.monitor.recommended_context_size();
        let n_ctx = if config.context_length > recommended {
            info!(
                requested = config.context_length,
                recommended,
                "ENGINE: context length clamped to recommended size"
            );
            recommended
        } else {
            config.context_length
        };

        let params = ContextParams {
            n_ctx,
            n_batch: config.batch_size,
            n_threads: config.threads,
            tokenizer_hint: self.tokenizer_hint.clone(),
        };
        let runtime = self.loader.load(path, &params).map_err(|e| {
            error!(path = %path.display(), error = %e, "ENGINE: load failed");
            EngineError::from(e)
        })?;

        let description = runtime.description().clone();
        let registration = Registration {
            model_bytes: runtime.model_size_bytes(),
            context_bytes: context_memory_bytes(runtime.n_ctx(), description.n_embd),
        };

        {
            let mut state = self.shared.lock_state();
            state.cache.bind(runtime.n_ctx());
            state.vocab = Some(runtime.vocab());
            state.config = GenerationConfig {
                context_length: runtime.n_ctx(),
                ..config.clone()
            };
            state.sampler = Some(SamplerChain::from_config(&state.config));
            state.seq.reset();
            state.stats = GenerationStats::default();
            state.model_path = Some(path.to_path_buf());
            state.registration = registration;
            state.runtime = Some(runtime);
        }

        self.monitor.register_model_memory(registration.model_bytes);
        self.monitor.register_context_memory(registration.context_bytes);

        info!(
            path = %path.display(),
            architecture = %description.architecture,
            n_ctx = description.n_ctx,
            n_vocab = description.n_vocab,
            "ENGINE: model ready"
        );
        Ok(())
    }

    /// Stops any generation, waits for it to drain, then releases the
    /// context and the model.
    pub fn unload_model(&self) {
        self.quiesce();

        let registration = {
            let mut state = self.shared.lock_state();
            if state.runtime.is_none() {
                return;
            }
            release(&mut state)
        };

        self.monitor.unregister_model_memory(registration.model_bytes);
        self.monitor.unregister_context_memory(registration.context_bytes);
        info!("ENGINE: model unloaded");
        self.monitor.request_cleanup();
    }

    /// Brings the engine to rest: requests a stop, waits for the active flag
    /// to clear and reaps finished pipeline workers.
    pub(crate) fn quiesce(&self) {
        if self.shared.flags.is_generating() {
            warn!("ENGINE: generation still active, forcing stop");
            self.stop_generation();
            self.shared.flags.wait_idle();
        }
        self.join_pipeline();
    }

    /// Waits for both pipeline workers of the last threaded start to exit.
    pub fn join_pipeline(&self) {
        let workers = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(workers) = workers {
            workers.join();
        }
    }
}

fn release(state: &mut EngineState) -> Registration {
    state.cache.unbind();
    state.sampler = None;
    state.vocab = None;
    state.runtime = None;
    state.seq.reset();
    state.model_path = None;
    std::mem::take(&mut state.registration)
}
