use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cache::CacheConfig;
use crate::pipeline::PipelineSettings;

pub const CONFIG_ENV: &str = "POCKET_LLM_CONFIG";
const DEFAULT_CONFIG_FILE: &str = "pocket_llm.toml";

fn default_threads() -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    cores.saturating_sub(1).max(1)
}

/// Sampling and sizing for one generation call. Immutable while it runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub context_length: usize,
    pub batch_size: usize,
    pub max_tokens: usize,
    pub threads: usize,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: i32,
    pub repeat_penalty: f32,
    pub repeat_last_n: usize,
    pub seed: Option<u64>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            context_length: 4096,
            batch_size: 512,
            max_tokens: 2048,
            threads: default_threads(),
            temperature: 0.7,
            top_p: 0.9,
            top_k: 40,
            repeat_penalty: 1.1,
            repeat_last_n: 64,
            seed: None,
        }
    }
}

impl GenerationConfig {
    /// Small window and batch for phones and other constrained hosts.
    pub fn mobile() -> Self {
        Self {
            context_length: 256,
            batch_size: 32,
            max_tokens: 256,
            threads: default_threads().max(2),
            ..Self::default()
        }
    }

    /// Fixed preset for the low-latency incremental path.
    pub fn turbo() -> Self {
        Self {
            max_tokens: 256,
            ..Self::mobile()
        }
    }

    pub fn with_sampling(mut self, request: &SamplingRequest) -> Self {
        if let Some(temperature) = request.temperature {
            self.temperature = temperature;
        }
        if let Some(top_p) = request.top_p {
            self.top_p = top_p;
        }
        if let Some(top_k) = request.top_k {
            self.top_k = top_k;
        }
        if let Some(max_tokens) = request.max_tokens {
            self.max_tokens = max_tokens;
        }
        self
    }
}

/// Per-request overrides a host may send with a prompt.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SamplingRequest {
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<i32>,
    pub max_tokens: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:6380".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub path: Option<PathBuf>,
    pub tokenizer: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub server: ServerConfig,
    pub model: ModelConfig,
    pub generation: GenerationConfig,
    pub pipeline: PipelineSettings,
    pub cache: CacheConfig,
}

impl KernelConfig {
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn from_file(path: &Path) -> Result<Self, String> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read config {}: {}", path.display(), e))?;
        Self::from_toml(&text).map_err(|e| format!("invalid config {}: {}", path.display(), e))
    }

    /// `$POCKET_LLM_CONFIG`, then `./pocket_llm.toml`, then built-in defaults.
    pub fn load() -> Result<Self, String> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            info!(path = %path, "CONFIG: loading from environment override");
            return Self::from_file(Path::new(&path));
        }
        let local = Path::new(DEFAULT_CONFIG_FILE);
        if local.exists() {
            info!(path = DEFAULT_CONFIG_FILE, "CONFIG: loading local file");
            return Self::from_file(local);
        }
        Ok(Self::default())
    }
}
