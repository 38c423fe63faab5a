use std::path::{Path, PathBuf};
use std::sync::Arc;

use candle_core::quantized::gguf_file;
use candle_core::{DType, Device, Tensor};
use candle_transformers::models::quantized_llama;
use candle_transformers::models::quantized_qwen2;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::KvCells;
use crate::engine::tokenizer::{resolve_tokenizer_path, TokenizerVocab};
use crate::errors::RuntimeError;

pub type TokenId = u32;
pub type Pos = i32;
pub type SeqId = i32;

/// Rotary tables of candle's quantized llama are precomputed for this many positions.
const LLAMA_MAX_POSITIONS: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchEntry {
    pub token: TokenId,
    pub pos: Pos,
    pub seq: SeqId,
    pub logits: bool,
}

/// One decode call worth of tokens, each with its own position and sequence.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    entries: Vec<BatchEntry>,
}

impl Batch {
    pub fn with_capacity(n: usize) -> Self {
        Self {
            entries: Vec::with_capacity(n),
        }
    }

    pub fn single(token: TokenId, pos: Pos) -> Self {
        let mut batch = Self::with_capacity(1);
        batch.push(token, pos, 0, true);
        batch
    }

    pub fn push(&mut self, token: TokenId, pos: Pos, seq: SeqId, logits: bool) {
        self.entries.push(BatchEntry {
            token,
            pos,
            seq,
            logits,
        });
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BatchEntry> {
        self.entries.iter()
    }

    pub fn first_pos(&self) -> Option<Pos> {
        self.entries.first().map(|e| e.pos)
    }

    pub fn wants_logits(&self) -> bool {
        self.entries.iter().any(|e| e.logits)
    }
}

#[derive(Debug, Clone)]
pub struct ContextParams {
    pub n_ctx: usize,
    pub n_batch: usize,
    pub n_threads: usize,
    pub tokenizer_hint: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelDescription {
    pub path: String,
    pub architecture: String,
    pub n_ctx: usize,
    pub n_vocab: usize,
    pub n_embd: usize,
    pub n_layer: usize,
}

/// Streaming detokenizer state for one turn. A character split across
/// several byte-level tokens stays in `ids` until its last byte arrives.
#[derive(Debug, Clone, Default)]
pub struct PieceState {
    pub ids: Vec<TokenId>,
    pub prefix: String,
    pub prefix_index: usize,
}

impl PieceState {
    pub fn reset(&mut self) {
        self.ids.clear();
        self.prefix.clear();
        self.prefix_index = 0;
    }
}

pub trait Vocabulary: Send + Sync {
    /// Writes the ids for `text` into `out` and returns how many were written.
    /// Fails with `BufferTooSmall` when `out` cannot hold them all.
    fn tokenize_into(&self, text: &str, add_special: bool, out: &mut [TokenId]) -> Result<usize, RuntimeError>;
    /// Feeds one generated token to the turn's decode state. Returns the
    /// text it completes, or `None` while the pending ids do not yet form
    /// whole UTF-8 characters.
    fn step_piece(&self, state: &mut PieceState, token: TokenId) -> Result<Option<String>, RuntimeError>;
    fn is_end_of_generation(&self, token: TokenId) -> bool;
    fn n_tokens(&self) -> usize;
}

/// A loaded model bound to one context. Tensor math and the attention cache
/// tensors live behind this trait; `KvCells` carries the cache layout.
pub trait TensorRuntime: Send {
    fn description(&self) -> &ModelDescription;
    fn vocab(&self) -> Arc<dyn Vocabulary>;
    fn n_ctx(&self) -> usize;
    fn model_size_bytes(&self) -> u64;
    fn decode(&mut self, batch: &Batch, cells: &mut KvCells) -> Result<(), RuntimeError>;
    /// Logits of the last batch entry that requested them.
    fn logits(&self) -> Option<&[f32]>;
}

pub trait ModelLoader: Send + Sync {
    fn load(&self, path: &Path, params: &ContextParams) -> Result<Box<dyn TensorRuntime>, RuntimeError>;
}

enum RuntimeModel {
    Llama(quantized_llama::ModelWeights),
    Qwen2(quantized_qwen2::ModelWeights),
}

struct GgufDims {
    architecture: String,
    n_embd: usize,
    n_layer: usize,
    n_ctx_train: usize,
}

fn metadata_usize(content: &gguf_file::Content, key: &str) -> usize {
    content
        .metadata
        .get(key)
        .and_then(|v| v.to_u32().ok())
        .map(|v| v as usize)
        .unwrap_or(0)
}

impl RuntimeModel {
    fn load_from_gguf(path: &Path, device: &Device) -> Result<(Self, GgufDims), RuntimeError> {
        let load_err = |reason: String| RuntimeError::Load {
            path: path.display().to_string(),
            reason,
        };

        let mut file = std::fs::File::open(path).map_err(|e| load_err(format!("Failed to open model file: {}", e)))?;
        let content = gguf_file::Content::read(&mut file).map_err(|e| load_err(e.to_string()))?;

        let architecture = content
            .metadata
            .get("general.architecture")
            .and_then(|v| v.to_string().ok())
            .cloned()
            .unwrap_or_default();
        let dims = GgufDims {
            n_embd: metadata_usize(&content, &format!("{}.embedding_length", architecture)),
            n_layer: metadata_usize(&content, &format!("{}.block_count", architecture)),
            n_ctx_train: metadata_usize(&content, &format!("{}.context_length", architecture)),
            architecture,
        };

        let model = match dims.architecture.as_str() {
            "llama" => quantized_llama::ModelWeights::from_gguf(content, &mut file, device)
                .map(Self::Llama)
                .map_err(|e| load_err(e.to_string()))?,
            "qwen2" => match quantized_qwen2::ModelWeights::from_gguf(content, &mut file, device) {
                Ok(model) => Self::Qwen2(model),
                Err(e) => {
                    let msg = e.to_string();
                    if msg.contains("cannot find tensor info for output_norm.weight") {
                        return Err(load_err(
                            "Qwen load failed: missing 'output_norm.weight'. The GGUF is likely an incomplete split shard. Use a full single-file GGUF.".to_string(),
                        ));
                    }
                    return Err(load_err(msg));
                }
            },
            other => {
                return Err(load_err(format!(
                    "Unsupported architecture '{}': no runtime backend available.",
                    other
                )))
            }
        };

        Ok((model, dims))
    }

    fn forward(&mut self, input: &Tensor, position: usize) -> candle_core::Result<Tensor> {
        match self {
            Self::Llama(model) => model.forward(input, position),
            Self::Qwen2(model) => model.forward(input, position),
        }
    }

    fn max_positions(&self, n_ctx_train: usize) -> usize {
        match self {
            Self::Llama(_) => LLAMA_MAX_POSITIONS,
            Self::Qwen2(_) => n_ctx_train.max(1),
        }
    }
}

/// Candle-backed runtime. Candle keeps its own attention cache and can only
/// append to it, so after any layout edit in `KvCells` the primary sequence is
/// replayed from position zero before new tokens are evaluated.
pub struct CandleRuntime {
    model: RuntimeModel,
    vocab: Arc<TokenizerVocab>,
    device: Device,
    description: ModelDescription,
    model_bytes: u64,
    logits: Option<Vec<f32>>,
    synced_revision: u64,
    cached_len: usize,
}

impl CandleRuntime {
    pub fn load(path: &Path, params: &ContextParams) -> Result<Self, RuntimeError> {
        info!(path = %path.display(), "ENGINE: loading GGUF weights");

        let device = Device::Cpu;
        let (model, dims) = RuntimeModel::load_from_gguf(path, &device)?;
        let model_bytes = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);

        let path_text = path.to_string_lossy().to_string();
        let tokenizer_path = resolve_tokenizer_path(&path_text, params.tokenizer_hint.clone()).ok_or_else(|| {
            RuntimeError::Load {
                path: path_text.clone(),
                reason: "Tokenizer not found for selected model (fail-fast policy).".to_string(),
            }
        })?;
        info!(tokenizer = %tokenizer_path.display(), "ENGINE: using tokenizer");
        let vocab = Arc::new(TokenizerVocab::from_file(&tokenizer_path)?);

        let max_positions = model.max_positions(dims.n_ctx_train);
        let n_ctx = if params.n_ctx > max_positions {
            warn!(
                requested = params.n_ctx,
                limit = max_positions,
                "ENGINE: context length clamped to model position limit"
            );
            max_positions
        } else {
            params.n_ctx
        };
        if params.n_threads > 0 {
            debug!(threads = params.n_threads, "ENGINE: candle uses its own thread pool");
        }

        let description = ModelDescription {
            path: path_text,
            architecture: dims.architecture,
            n_ctx,
            n_vocab: vocab.n_tokens(),
            n_embd: dims.n_embd,
            n_layer: dims.n_layer,
        };

        Ok(Self {
            model,
            vocab,
            device,
            description,
            model_bytes,
            logits: None,
            synced_revision: 0,
            cached_len: 0,
        })
    }

    fn forward_tokens(&mut self, tokens: &[TokenId], position: usize) -> Result<Vec<f32>, RuntimeError> {
        let input = Tensor::new(tokens, &self.device)?.unsqueeze(0)?;
        let logits = self.model.forward(&input, position)?;
        let logits = logits.squeeze(0)?.to_dtype(DType::F32)?;
        Ok(logits.to_vec1::<f32>()?)
    }

    fn replay_primary(&mut self, cells: &KvCells, until: Pos) -> Result<(), RuntimeError> {
        let resident: Vec<TokenId> = cells
            .seq_tokens(0)
            .into_iter()
            .enumerate()
            .take_while(|(_, (pos, _))| *pos < until)
            .map(|(i, (pos, token))| {
                if pos as usize != i {
                    Err(RuntimeError::Decode(format!(
                        "primary sequence is not contiguous at position {}",
                        pos
                    )))
                } else {
                    Ok(token)
                }
            })
            .collect::<Result<_, _>>()?;

        if resident.len() != until as usize {
            return Err(RuntimeError::Decode(format!(
                "cannot evaluate at position {} with {} resident positions",
                until,
                resident.len()
            )));
        }

        debug!(positions = resident.len(), "ENGINE: replaying primary sequence after cache edit");
        self.forward_tokens(&resident, 0)?;
        self.cached_len = resident.len();
        Ok(())
    }
}

impl TensorRuntime for CandleRuntime {
    fn description(&self) -> &ModelDescription {
        &self.description
    }

    fn vocab(&self) -> Arc<dyn Vocabulary> {
        self.vocab.clone()
    }

    fn n_ctx(&self) -> usize {
        self.description.n_ctx
    }

    fn model_size_bytes(&self) -> u64 {
        self.model_bytes
    }

    fn decode(&mut self, batch: &Batch, cells: &mut KvCells) -> Result<(), RuntimeError> {
        let Some(first) = batch.first_pos() else {
            return Ok(());
        };
        if batch.iter().any(|e| e.seq != 0) {
            return Err(RuntimeError::Decode(
                "candle backend evaluates the primary sequence only".to_string(),
            ));
        }

        let layout_changed = cells.revision() != self.synced_revision;
        cells.store(batch)?;
        if first > 0 && (layout_changed || first as usize != self.cached_len) {
            self.replay_primary(cells, first)?;
        }
        self.synced_revision = cells.revision();

        let tokens: Vec<TokenId> = batch.iter().map(|e| e.token).collect();
        let last = if first == 0 {
            self.forward_tokens(&tokens, 0)?
        } else {
            // candle's quantized attention masks only whole prompts, so
            // continuation tokens go through one at a time
            let mut last = Vec::new();
            for entry in batch.iter() {
                last = self.forward_tokens(&[entry.token], entry.pos as usize)?;
            }
            last
        };
        self.cached_len = first as usize + tokens.len();

        if batch.wants_logits() {
            self.logits = Some(last);
        }
        Ok(())
    }

    fn logits(&self) -> Option<&[f32]> {
        self.logits.as_deref()
    }
}

pub struct CandleLoader;

impl ModelLoader for CandleLoader {
    fn load(&self, path: &Path, params: &ContextParams) -> Result<Box<dyn TensorRuntime>, RuntimeError> {
        Ok(Box::new(CandleRuntime::load(path, params)?))
    }
}
