use std::path::Path;
use std::sync::mpsc::Receiver;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::config::{GenerationConfig, SamplingRequest};
use crate::engine::{GenerationStats, LlmEngine};
use crate::pipeline::StreamEvent;
use crate::resources::{MemoryPressure, MB};

#[derive(Debug, Serialize)]
struct StatsReport {
    prompt_tokens: usize,
    generated_tokens: usize,
    prompt_eval_time_ms: f64,
    eval_time_ms: f64,
    tokens_per_second: f64,
}

impl From<GenerationStats> for StatsReport {
    fn from(stats: GenerationStats) -> Self {
        Self {
            prompt_tokens: stats.prompt_tokens,
            generated_tokens: stats.generated_tokens,
            prompt_eval_time_ms: stats.prompt_eval_time_ms,
            eval_time_ms: stats.eval_time_ms,
            tokens_per_second: stats.tokens_per_second,
        }
    }
}

#[derive(Debug, Serialize)]
struct MemoryReport {
    total_mb: u64,
    available_mb: u64,
    used_mb: u64,
    model_mb: u64,
    context_mb: u64,
    pressure: MemoryPressure,
}

/// Host-facing surface of the engine. Failures fold into `false` or an empty
/// string; the reason is logged, never raised.
pub struct EngineBridge {
    engine: Arc<LlmEngine>,
}

/// Non-positive integers mean "keep the profile default".
fn request(temperature: f32, top_p: f32, top_k: i32, max_tokens: i32) -> SamplingRequest {
    SamplingRequest {
        temperature: Some(temperature),
        top_p: Some(top_p),
        top_k: (top_k > 0).then_some(top_k),
        max_tokens: (max_tokens > 0).then_some(max_tokens as usize),
    }
}

impl EngineBridge {
    pub fn new(engine: Arc<LlmEngine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<LlmEngine> {
        &self.engine
    }

    pub fn load_model(&self, path: &str) -> bool {
        match self.engine.load_model(Path::new(path), &GenerationConfig::mobile()) {
            Ok(()) => true,
            Err(e) => {
                warn!(path, error = %e, "BRIDGE: load failed");
                false
            }
        }
    }

    pub fn unload_model(&self) {
        self.engine.unload_model();
    }

    pub fn is_model_loaded(&self) -> bool {
        self.engine.is_model_loaded()
    }

    pub fn model_info(&self) -> String {
        self.engine.model_info()
    }

    pub fn start_inference(&self, prompt: &str, temperature: f32, top_p: f32, top_k: i32, max_tokens: i32) -> bool {
        let config = GenerationConfig::mobile().with_sampling(&request(temperature, top_p, top_k, max_tokens));
        self.engine.start_inference(prompt, &config).is_ok()
    }

    pub fn start_inference_incremental(
        &self,
        prompt: &str,
        temperature: f32,
        top_p: f32,
        top_k: i32,
        max_tokens: i32,
    ) -> bool {
        let config = GenerationConfig::mobile().with_sampling(&request(temperature, top_p, top_k, max_tokens));
        self.engine.start_inference_incremental(prompt, &config).is_ok()
    }

    pub fn start_inference_threaded(
        &self,
        prompt: &str,
        temperature: f32,
        top_p: f32,
        top_k: i32,
        max_tokens: i32,
    ) -> bool {
        let config = GenerationConfig::mobile().with_sampling(&request(temperature, top_p, top_k, max_tokens));
        self.engine.start_inference_threaded(prompt, &config).is_ok()
    }

    /// Incremental start with the fixed low-latency preset.
    pub fn start_turbo(&self, prompt: &str) -> bool {
        info!("BRIDGE: turbo start");
        self.engine
            .start_inference_incremental(prompt, &GenerationConfig::turbo())
            .is_ok()
    }

    /// Empty string once generation has ended.
    pub fn next_token(&self) -> String {
        self.engine.next_token().unwrap_or_default()
    }

    pub fn next_tokens(&self, count: usize) -> Vec<String> {
        self.engine.next_tokens(count)
    }

    pub fn next_tokens_joined(&self, count: usize) -> String {
        self.engine.next_tokens(count).concat()
    }

    pub fn buffered_tokens(&self) -> String {
        self.engine.buffered_tokens()
    }

    pub fn is_generating(&self) -> bool {
        self.engine.is_generating()
    }

    pub fn stop_generation(&self) {
        self.engine.stop_generation();
    }

    pub fn clear_cache(&self) {
        self.engine.clear_cache();
    }

    pub fn cached_token_count(&self) -> usize {
        self.engine.cached_token_count()
    }

    pub fn stats_json(&self) -> String {
        serde_json::to_string(&StatsReport::from(self.engine.stats())).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn reset_stats(&self) {
        self.engine.reset_stats();
    }

    pub fn memory_info_json(&self) -> String {
        let snapshot = self.engine.monitor().snapshot();
        let report = MemoryReport {
            total_mb: snapshot.total / MB,
            available_mb: snapshot.available / MB,
            used_mb: snapshot.used / MB,
            model_mb: snapshot.model / MB,
            context_mb: snapshot.context / MB,
            pressure: snapshot.pressure,
        };
        serde_json::to_string(&report).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn memory_usage(&self) -> u64 {
        self.engine.memory_usage()
    }

    /// Push channel for streamed generations: text chunks as the pipeline
    /// flushes them, then one `Finished`.
    pub fn subscribe(&self) -> Receiver<StreamEvent> {
        self.engine.subscribe()
    }
}
