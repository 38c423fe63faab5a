//! In-process stand-ins for the tensor runtime, used by unit tests.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::backend::{
    Batch, ContextParams, ModelDescription, ModelLoader, PieceState, Pos, TensorRuntime, TokenId, Vocabulary,
};
use crate::cache::{CacheConfig, KvCells};
use crate::engine::LlmEngine;
use crate::errors::RuntimeError;
use crate::pipeline::PipelineSettings;
use crate::resources::{FixedMemoryProbe, ResourceMonitor, MB};

pub(crate) const TOY_BOS: TokenId = 256;
pub(crate) const TOY_EOS: TokenId = 257;
const TOY_VOCAB_SIZE: usize = 258;

/// Byte-level vocabulary: every byte is its own token.
#[derive(Debug, Clone)]
pub(crate) struct ToyVocab {
    /// How many ids each byte expands to.
    pub(crate) expansion: usize,
}

impl Default for ToyVocab {
    fn default() -> Self {
        Self { expansion: 1 }
    }
}

impl Vocabulary for ToyVocab {
    fn tokenize_into(&self, text: &str, add_special: bool, out: &mut [TokenId]) -> Result<usize, RuntimeError> {
        let mut ids = Vec::with_capacity(text.len() * self.expansion + 1);
        if add_special {
            ids.push(TOY_BOS);
        }
        for b in text.bytes() {
            ids.extend(std::iter::repeat(b as TokenId).take(self.expansion));
        }
        if ids.len() > out.len() {
            return Err(RuntimeError::BufferTooSmall { required: ids.len() });
        }
        out[..ids.len()].copy_from_slice(&ids);
        Ok(ids.len())
    }

    /// Ids are raw UTF-8 bytes; a multi-byte character waits for its last byte.
    fn step_piece(&self, state: &mut PieceState, token: TokenId) -> Result<Option<String>, RuntimeError> {
        match token {
            TOY_BOS | TOY_EOS => return Ok(None),
            t if t >= 256 => return Err(RuntimeError::Tokenizer(format!("unknown token {}", t))),
            _ => {}
        }
        state.ids.push(token);
        let bytes: Vec<u8> = state.ids.iter().map(|&t| t as u8).collect();
        match String::from_utf8(bytes) {
            Ok(text) => {
                state.ids.clear();
                Ok(Some(text))
            }
            Err(e) if e.utf8_error().error_len().is_none() => Ok(None),
            Err(e) => {
                state.ids.clear();
                Ok(Some(String::from_utf8_lossy(e.as_bytes()).into_owned()))
            }
        }
    }

    fn is_end_of_generation(&self, token: TokenId) -> bool {
        token == TOY_EOS
    }

    fn n_tokens(&self) -> usize {
        TOY_VOCAB_SIZE
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ToyOptions {
    /// Sleep per evaluated token.
    pub(crate) delay: Option<Duration>,
    /// Position at which the model predicts end of generation.
    pub(crate) eos_at_pos: Option<Pos>,
    /// Any batch touching this position fails to decode.
    pub(crate) fail_decode_at_pos: Option<Pos>,
    /// Any batch touching this position panics inside decode.
    pub(crate) panic_at_pos: Option<Pos>,
    /// `(pos, token)`: the model predicts `token` for position `pos`.
    pub(crate) forced: Vec<(Pos, TokenId)>,
    /// Running count of evaluated tokens.
    pub(crate) evaluated: Arc<AtomicUsize>,
    pub(crate) model_bytes: u64,
}

impl Default for ToyOptions {
    fn default() -> Self {
        Self {
            delay: None,
            eos_at_pos: None,
            fail_decode_at_pos: None,
            panic_at_pos: None,
            forced: Vec::new(),
            evaluated: Arc::new(AtomicUsize::new(0)),
            model_bytes: 600 * MB,
        }
    }
}

struct ToyRuntime {
    description: ModelDescription,
    vocab: Arc<ToyVocab>,
    options: ToyOptions,
    logits: Option<Vec<f32>>,
}

impl ToyRuntime {
    /// Deterministic in (token, pos): one sharp peak on a lowercase letter.
    fn predict(&self, token: TokenId, pos: Pos) -> Vec<f32> {
        let mut logits = vec![0.0; TOY_VOCAB_SIZE];
        let forced = self.options.forced.iter().find(|(at, _)| *at == pos + 1);
        let next = if let Some(&(_, token)) = forced {
            token
        } else if self.options.eos_at_pos == Some(pos + 1) {
            TOY_EOS
        } else {
            b'a' as TokenId + (token + pos as TokenId) % 26
        };
        logits[next as usize] = 10.0;
        logits
    }
}

impl TensorRuntime for ToyRuntime {
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
        self.options.model_bytes
    }

    fn decode(&mut self, batch: &Batch, cells: &mut KvCells) -> Result<(), RuntimeError> {
        if let Some(fail) = self.options.fail_decode_at_pos {
            if batch.iter().any(|e| e.pos == fail) {
                return Err(RuntimeError::Decode(format!("injected failure at position {}", fail)));
            }
        }
        if let Some(at) = self.options.panic_at_pos {
            if batch.iter().any(|e| e.pos == at) {
                panic!("toy runtime: injected panic at position {}", at);
            }
        }
        if let Some(delay) = self.options.delay {
            std::thread::sleep(delay * batch.len() as u32);
        }
        cells.store(batch)?;
        self.options.evaluated.fetch_add(batch.len(), Ordering::SeqCst);

        if let Some(entry) = batch.iter().filter(|e| e.logits).last() {
            self.logits = Some(self.predict(entry.token, entry.pos));
        }
        Ok(())
    }

    fn logits(&self) -> Option<&[f32]> {
        self.logits.as_deref()
    }
}

pub(crate) struct ToyLoader {
    options: ToyOptions,
}

impl ModelLoader for ToyLoader {
    fn load(&self, path: &Path, params: &ContextParams) -> Result<Box<dyn TensorRuntime>, RuntimeError> {
        let path_text = path.display().to_string();
        if path_text.contains("missing") {
            return Err(RuntimeError::Load {
                path: path_text,
                reason: "Failed to open model file".to_string(),
            });
        }
        Ok(Box::new(ToyRuntime {
            description: ModelDescription {
                path: path_text,
                architecture: "toy".to_string(),
                n_ctx: params.n_ctx,
                n_vocab: TOY_VOCAB_SIZE,
                n_embd: 64,
                n_layer: 2,
            },
            vocab: Arc::new(ToyVocab::default()),
            options: self.options.clone(),
            logits: None,
        }))
    }
}

pub(crate) fn toy_engine(options: ToyOptions) -> (LlmEngine, Arc<FixedMemoryProbe>) {
    toy_engine_with_memory(options, 8192 * MB)
}

pub(crate) fn toy_engine_with_memory(options: ToyOptions, available: u64) -> (LlmEngine, Arc<FixedMemoryProbe>) {
    let probe = Arc::new(FixedMemoryProbe::new(16384 * MB, available));
    let monitor = Arc::new(ResourceMonitor::new(Box::new(probe.clone())));
    let engine = LlmEngine::new(
        Box::new(ToyLoader { options }),
        monitor,
        PipelineSettings::default(),
        CacheConfig::default(),
    );
    (engine, probe)
}
