mod generation;
mod lifecycle;
mod threaded;
pub(crate) mod tokenizer;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::backend::{ModelLoader, PieceState, TensorRuntime, TokenId, Vocabulary};
use crate::cache::{CacheConfig, CacheStats, KvCache};
use crate::config::GenerationConfig;
use crate::pipeline::{PipelineSettings, StreamEvent, TokenPipeline, TokenSink};
use crate::resources::ResourceMonitor;
use crate::sampling::SamplerChain;

pub(crate) use threaded::PipelineWorkers;

/// Upper bound on one sleep of the teardown wait.
const IDLE_WAIT_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GenerationStats {
    pub prompt_tokens: usize,
    pub generated_tokens: usize,
    pub total_tokens: usize,
    pub prompt_eval_time_ms: f64,
    pub eval_time_ms: f64,
    pub tokens_per_second: f64,
}

#[derive(Debug, Default)]
pub(crate) struct SequenceState {
    pub(crate) tokens: Vec<TokenId>,
    pub(crate) n_past: usize,
    pub(crate) current_pos: usize,
}

impl SequenceState {
    fn reset(&mut self) {
        self.tokens.clear();
        self.n_past = 0;
        self.current_pos = 0;
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Registration {
    pub(crate) model_bytes: u64,
    pub(crate) context_bytes: u64,
}

/// Everything guarded by the engine lock: model, context, cache and the
/// resident sequence.
pub(crate) struct EngineState {
    pub(crate) runtime: Option<Box<dyn TensorRuntime>>,
    pub(crate) vocab: Option<Arc<dyn Vocabulary>>,
    pub(crate) cache: KvCache,
    pub(crate) sampler: Option<SamplerChain>,
    pub(crate) seq: SequenceState,
    /// Detokenizer state of the pull-mode turn.
    pub(crate) pieces: PieceState,
    pub(crate) config: GenerationConfig,
    pub(crate) stats: GenerationStats,
    pub(crate) turn_started: Option<Instant>,
    pub(crate) model_path: Option<PathBuf>,
    pub(crate) registration: Registration,
}

impl EngineState {
    fn new(cache: CacheConfig) -> Self {
        Self {
            runtime: None,
            vocab: None,
            cache: KvCache::new(cache),
            sampler: None,
            seq: SequenceState::default(),
            pieces: PieceState::default(),
            config: GenerationConfig::default(),
            stats: GenerationStats::default(),
            turn_started: None,
            model_path: None,
            registration: Registration::default(),
        }
    }

    pub(crate) fn is_loaded(&self) -> bool {
        self.runtime.is_some() && self.cache.is_bound()
    }

    pub(crate) fn n_ctx(&self) -> usize {
        self.runtime.as_ref().map(|r| r.n_ctx()).unwrap_or(0)
    }
}

/// Lock-free coordination between the caller and the generation thread,
/// plus the condition variable teardown waits on.
#[derive(Default)]
pub(crate) struct EngineFlags {
    generating: AtomicBool,
    stop_requested: AtomicBool,
    threaded: AtomicBool,
    idle_lock: Mutex<()>,
    idle: Condvar,
}

impl EngineFlags {
    pub(crate) fn begin(&self, threaded: bool) {
        self.stop_requested.store(false, Ordering::SeqCst);
        self.threaded.store(threaded, Ordering::SeqCst);
        self.generating.store(true, Ordering::SeqCst);
    }

    pub(crate) fn finish(&self) {
        {
            let _guard = self.idle_lock.lock().unwrap_or_else(PoisonError::into_inner);
            self.generating.store(false, Ordering::SeqCst);
        }
        self.idle.notify_all();
    }

    pub(crate) fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_generating(&self) -> bool {
        self.generating.load(Ordering::SeqCst)
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    pub(crate) fn is_threaded(&self) -> bool {
        self.threaded.load(Ordering::SeqCst)
    }

    /// Blocks until `finish` runs. Sleeps in bounded slices so a missed
    /// notification costs at most one slice.
    pub(crate) fn wait_idle(&self) {
        let mut guard = self.idle_lock.lock().unwrap_or_else(PoisonError::into_inner);
        while self.generating.load(Ordering::SeqCst) {
            let (next, _) = self
                .idle
                .wait_timeout_while(guard, IDLE_WAIT_SLICE, |_| self.generating.load(Ordering::SeqCst))
                .unwrap_or_else(PoisonError::into_inner);
            guard = next;
        }
    }
}

pub(crate) struct EngineShared {
    pub(crate) state: Mutex<EngineState>,
    pub(crate) flags: EngineFlags,
    pub(crate) pipeline: Arc<TokenPipeline>,
}

impl EngineShared {
    pub(crate) fn lock_state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Owns one model and one context at a time and runs the sample-then-evaluate
/// loop over them. Every method takes `&self`; the engine can be shared
/// between a host thread and the pipeline workers it spawns.
pub struct LlmEngine {
    pub(crate) shared: Arc<EngineShared>,
    pub(crate) loader: Box<dyn ModelLoader>,
    pub(crate) monitor: Arc<ResourceMonitor>,
    pub(crate) workers: Mutex<Option<PipelineWorkers>>,
    pub(crate) tokenizer_hint: Option<PathBuf>,
}

impl LlmEngine {
    pub fn new(
        loader: Box<dyn ModelLoader>,
        monitor: Arc<ResourceMonitor>,
        pipeline: PipelineSettings,
        cache: CacheConfig,
    ) -> Self {
        Self {
            shared: Arc::new(EngineShared {
                state: Mutex::new(EngineState::new(cache)),
                flags: EngineFlags::default(),
                pipeline: Arc::new(TokenPipeline::new(pipeline)),
            }),
            loader,
            monitor,
            workers: Mutex::new(None),
            tokenizer_hint: None,
        }
    }

    pub fn with_tokenizer_hint(mut self, hint: Option<PathBuf>) -> Self {
        self.tokenizer_hint = hint;
        self
    }

    pub fn monitor(&self) -> &Arc<ResourceMonitor> {
        &self.monitor
    }

    pub fn is_model_loaded(&self) -> bool {
        self.shared.lock_state().is_loaded()
    }

    pub fn model_info(&self) -> String {
        let state = self.shared.lock_state();
        match state.runtime.as_ref() {
            Some(runtime) => {
                let d = runtime.description();
                format!(
                    "Model: {}\nArchitecture: {}\nContext: {}\nVocab: {}\nEmbedding: {}\nLayers: {}\nSize: {} MB",
                    d.path,
                    d.architecture,
                    d.n_ctx,
                    d.n_vocab,
                    d.n_embd,
                    d.n_layer,
                    runtime.model_size_bytes() / crate::resources::MB
                )
            }
            None => "No model loaded".to_string(),
        }
    }

    pub fn is_generating(&self) -> bool {
        self.shared.flags.is_generating()
    }

    pub fn n_past(&self) -> usize {
        self.shared.lock_state().seq.n_past
    }

    /// Mirror of the token ids resident in the cache, oldest first.
    pub fn sequence_tokens(&self) -> Vec<TokenId> {
        self.shared.lock_state().seq.tokens.clone()
    }

    pub fn cached_token_count(&self) -> usize {
        self.shared.lock_state().cache.used_cells()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.shared.lock_state().cache.stats()
    }

    pub fn needs_defragmentation(&self) -> bool {
        self.shared.lock_state().cache.needs_defragmentation()
    }

    pub fn stats(&self) -> GenerationStats {
        self.shared.lock_state().stats.clone()
    }

    pub fn reset_stats(&self) {
        self.shared.lock_state().stats = GenerationStats::default();
    }

    pub fn model_memory_usage(&self) -> u64 {
        self.shared.lock_state().registration.model_bytes
    }

    pub fn context_memory_usage(&self) -> u64 {
        self.shared.lock_state().registration.context_bytes
    }

    pub fn memory_usage(&self) -> u64 {
        let registration = self.shared.lock_state().registration;
        registration.model_bytes + registration.context_bytes
    }

    /// Drains text the pipeline flushed since the last call.
    pub fn buffered_tokens(&self) -> String {
        self.shared.pipeline.output.drain()
    }

    pub fn set_token_callback(&self, sink: TokenSink) {
        self.shared.pipeline.output.set_subscriber(Some(sink));
    }

    pub fn clear_token_callback(&self) {
        self.shared.pipeline.output.set_subscriber(None);
    }

    /// Replaces any installed callback with a channel of stream events.
    pub fn subscribe(&self) -> Receiver<StreamEvent> {
        self.shared.pipeline.output.subscribe()
    }
}

impl Drop for LlmEngine {
    fn drop(&mut self) {
        self.unload_model();
    }
}
