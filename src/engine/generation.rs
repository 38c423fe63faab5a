use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::backend::{Batch, Pos, TokenId, Vocabulary};
use crate::config::GenerationConfig;
use crate::errors::EngineError;
use crate::sampling::SamplerChain;

use super::tokenizer::tokenize;
use super::{EngineFlags, EngineState, LlmEngine};

/// Positions kept when the window has to slide.
pub(crate) const SHIFT_KEEP: usize = 64;
/// Room left free when appending a prompt fragment to a resident sequence.
pub(crate) const INCREMENTAL_MARGIN: usize = 32;
/// Multi-token pulls slide the window this close to its end.
const NEAR_WINDOW_END: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EndReason {
    WindowFull,
    BudgetReached,
    EndOfGeneration,
    NoLogits,
    NotLoaded,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::WindowFull => "context window full",
            Self::BudgetReached => "token budget reached",
            Self::EndOfGeneration => "end of generation token",
            Self::NoLogits => "no logits available",
            Self::NotLoaded => "model not loaded",
        };
        f.write_str(text)
    }
}

pub(crate) enum Step {
    Token(TokenId),
    End(EndReason),
}

impl EngineState {
    /// Stores the turn's config and rebuilds the sampler from it.
    fn begin_turn(&mut self, config: &GenerationConfig) -> Result<Arc<dyn Vocabulary>, EngineError> {
        if !self.is_loaded() {
            return Err(EngineError::NotLoaded);
        }
        self.config = GenerationConfig {
            context_length: self.n_ctx(),
            ..config.clone()
        };
        self.sampler = Some(SamplerChain::from_config(&self.config));
        self.pieces.reset();
        self.vocab.clone().ok_or(EngineError::NotLoaded)
    }

    /// Decodes `tokens` at positions `start..` in batches of `batch_size`.
    /// Only the final token asks for logits.
    pub(crate) fn evaluate(&mut self, tokens: &[TokenId], start: usize) -> Result<(), EngineError> {
        let batch_size = self.config.batch_size.max(1);
        let last = start + tokens.len();
        let runtime = self.runtime.as_mut().ok_or(EngineError::NotLoaded)?;
        let cells = self.cache.cells_mut()?;

        let mut pos = start;
        for chunk in tokens.chunks(batch_size) {
            let mut batch = Batch::with_capacity(chunk.len());
            for &token in chunk {
                batch.push(token, pos as Pos, 0, pos + 1 == last);
                pos += 1;
            }
            runtime.decode(&batch, cells)?;
        }
        Ok(())
    }

    /// Drops the oldest `n_past - keep` positions and slides the rest down so
    /// relative order is preserved. Cache failures are logged and ignored.
    pub(crate) fn shift_window(&mut self, keep: usize) {
        let n_past = self.seq.n_past;
        if n_past <= keep {
            return;
        }
        let discard = n_past - keep;
        let edited = self
            .cache
            .remove_tokens(0, discard as Pos)
            .and_then(|_| self.cache.shift_tokens(discard as Pos, -(discard as Pos)));
        if let Err(e) = edited {
            warn!(error = %e, "ENGINE: cache shift failed, continuing with stale cache");
        }

        let len = self.seq.tokens.len();
        if len > keep {
            self.seq.tokens.drain(..len - keep);
        }
        self.seq.n_past = keep;
        self.seq.current_pos = self.seq.tokens.len();
        info!(discard, keep, "ENGINE: context window shifted");
    }

    pub(crate) fn prepare_one_shot(&mut self, prompt: &str, config: &GenerationConfig) -> Result<(), EngineError> {
        let vocab = self.begin_turn(config)?;
        let tokens = tokenize(vocab.as_ref(), prompt, true)?;
        if tokens.is_empty() {
            return Err(EngineError::EmptyPrompt);
        }

        self.seq.reset();
        self.cache.clear()?;

        self.turn_started = Some(Instant::now());
        self.stats.prompt_tokens = tokens.len();
        self.stats.generated_tokens = 0;

        if let Err(e) = self.evaluate(&tokens, 0) {
            let _ = self.cache.clear();
            return Err(e);
        }
        self.stats.prompt_eval_time_ms = self.elapsed_ms();

        self.seq.n_past = tokens.len();
        self.seq.tokens = tokens;
        self.seq.current_pos = self.seq.tokens.len();
        Ok(())
    }

    /// Evaluates only the new fragment at the current offset. The beginning
    /// marker is added only when nothing is resident yet.
    pub(crate) fn prepare_incremental(&mut self, prompt: &str, config: &GenerationConfig) -> Result<(), EngineError> {
        let vocab = self.begin_turn(config)?;
        let add_bos = self.seq.n_past == 0;
        let tokens = tokenize(vocab.as_ref(), prompt, add_bos)?;
        if tokens.is_empty() {
            return Err(EngineError::EmptyPrompt);
        }

        let room = self
            .n_ctx()
            .saturating_sub(self.seq.n_past + INCREMENTAL_MARGIN);
        if tokens.len() > room {
            self.shift_window(SHIFT_KEEP);
        }

        self.turn_started = Some(Instant::now());
        self.stats.prompt_tokens = tokens.len();
        self.stats.generated_tokens = 0;

        let start = self.seq.n_past;
        if let Err(e) = self.evaluate(&tokens, start) {
            let _ = self.cache.remove_tokens(start as Pos, -1);
            return Err(e);
        }
        self.stats.prompt_eval_time_ms = self.elapsed_ms();

        self.seq.tokens.extend_from_slice(&tokens);
        self.seq.n_past += tokens.len();
        self.seq.current_pos = self.seq.tokens.len();
        Ok(())
    }

    /// Checks the window and the budget, then samples. Does not evaluate.
    pub(crate) fn next_step(&mut self) -> Step {
        if self.seq.n_past + 1 >= self.n_ctx() {
            return Step::End(EndReason::WindowFull);
        }
        if self.stats.generated_tokens >= self.config.max_tokens {
            return Step::End(EndReason::BudgetReached);
        }
        let (Some(runtime), Some(sampler), Some(vocab)) =
            (self.runtime.as_ref(), self.sampler.as_mut(), self.vocab.as_ref())
        else {
            return Step::End(EndReason::NotLoaded);
        };
        let Some(token) = runtime.logits().and_then(|logits| sampler.sample(logits)) else {
            return Step::End(EndReason::NoLogits);
        };
        if vocab.is_end_of_generation(token) {
            return Step::End(EndReason::EndOfGeneration);
        }
        Step::Token(token)
    }

    /// Appends a sampled token and evaluates it at `n_past`.
    pub(crate) fn accept_token(&mut self, token: TokenId) -> Result<(), EngineError> {
        let pos = self.seq.n_past;
        self.seq.tokens.push(token);
        if let Err(e) = self.evaluate(&[token], pos) {
            self.seq.tokens.pop();
            let _ = self.cache.remove_tokens(pos as Pos, -1);
            return Err(e);
        }
        self.seq.n_past += 1;
        self.seq.current_pos = self.seq.tokens.len();
        self.stats.generated_tokens += 1;
        self.refresh_timing();
        Ok(())
    }

    /// Generates until the pending ids decode to text. A byte-level token
    /// that only starts a character is evaluated and the loop goes on.
    fn pull_token(&mut self, flags: &EngineFlags) -> Option<String> {
        loop {
            let token = match self.next_step() {
                Step::Token(token) => token,
                Step::End(reason) => {
                    debug!(%reason, "ENGINE: generation finished");
                    self.finalize_turn();
                    return None;
                }
            };
            let Some(vocab) = self.vocab.clone() else {
                return None;
            };
            let piece = match vocab.step_piece(&mut self.pieces, token) {
                Ok(piece) => piece,
                Err(e) => {
                    error!(token, error = %e, "ENGINE: detokenize failed, aborting generation");
                    self.finalize_turn();
                    return None;
                }
            };
            if flags.stop_requested() {
                self.finalize_turn();
                return None;
            }
            if let Err(e) = self.accept_token(token) {
                error!(error = %e, n_past = self.seq.n_past, "ENGINE: evaluation failed, aborting generation");
                self.finalize_turn();
                return None;
            }
            if let Some(piece) = piece {
                return Some(piece);
            }
        }
    }

    fn elapsed_ms(&self) -> f64 {
        self.turn_started
            .map(|t| t.elapsed().as_secs_f64() * 1000.0)
            .unwrap_or(0.0)
    }

    fn refresh_timing(&mut self) {
        let total = self.elapsed_ms();
        self.stats.eval_time_ms = (total - self.stats.prompt_eval_time_ms).max(0.0);
        if self.stats.eval_time_ms > 0.0 {
            self.stats.tokens_per_second = self.stats.generated_tokens as f64 * 1000.0 / self.stats.eval_time_ms;
        }
    }

    pub(crate) fn finalize_turn(&mut self) {
        self.refresh_timing();
        self.stats.total_tokens = self.stats.prompt_tokens + self.stats.generated_tokens;
        if self.cache.needs_defragmentation() {
            self.cache.defragment();
        }
    }
}

impl LlmEngine {
    /// Tokenizes the whole prompt, clears the cache and evaluates from
    /// position zero. Tokens are then pulled with `next_token`.
    pub fn start_inference(&self, prompt: &str, config: &GenerationConfig) -> Result<(), EngineError> {
        self.quiesce();
        let prepared = self.shared.lock_state().prepare_one_shot(prompt, config);
        match prepared {
            Ok(()) => {
                self.shared.flags.begin(false);
                info!(prompt_tokens = self.stats().prompt_tokens, "ENGINE: one-shot generation started");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "ENGINE: one-shot start failed");
                Err(e)
            }
        }
    }

    /// Appends `prompt` to what the cache already holds and evaluates only
    /// the new tokens.
    pub fn start_inference_incremental(&self, prompt: &str, config: &GenerationConfig) -> Result<(), EngineError> {
        self.quiesce();
        let prepared = self.shared.lock_state().prepare_incremental(prompt, config);
        match prepared {
            Ok(()) => {
                self.shared.flags.begin(false);
                info!(n_past = self.n_past(), "ENGINE: incremental generation started");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "ENGINE: incremental start failed");
                Err(e)
            }
        }
    }

    /// Samples, detokenizes and evaluates one token. `None` means the
    /// generation is over and the active flag has been cleared.
    pub fn next_token(&self) -> Option<String> {
        let flags = &self.shared.flags;
        if !flags.is_generating() {
            return None;
        }
        if flags.is_threaded() {
            warn!("ENGINE: tokens are streaming through the pipeline, pull them with buffered_tokens");
            return None;
        }
        if flags.stop_requested() {
            flags.finish();
            return None;
        }

        let piece = self.shared.lock_state().pull_token(flags);
        if piece.is_none() {
            flags.finish();
        }
        piece
    }

    /// Pulls up to `count` tokens, sliding the window when it nears its end.
    pub fn next_tokens(&self, count: usize) -> Vec<String> {
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            if !self.is_generating() || self.shared.flags.stop_requested() {
                break;
            }
            {
                let mut state = self.shared.lock_state();
                if state.seq.n_past + NEAR_WINDOW_END >= state.n_ctx() {
                    state.shift_window(SHIFT_KEEP);
                }
            }
            match self.next_token() {
                Some(piece) => out.push(piece),
                None => break,
            }
        }
        out
    }

    /// No further tokens are produced once this returns. A streaming
    /// generation clears the active flag after its in-flight evaluation.
    pub fn stop_generation(&self) {
        let flags = &self.shared.flags;
        flags.request_stop();
        if flags.is_generating() && !flags.is_threaded() {
            flags.finish();
        }
        debug!("ENGINE: stop requested");
    }

    pub fn shift_context(&self, keep: usize) {
        self.shared.lock_state().shift_window(keep);
    }

    pub fn clear_cache(&self) {
        self.quiesce();
        let mut state = self.shared.lock_state();
        if let Err(e) = state.cache.clear() {
            debug!(error = %e, "ENGINE: nothing to clear");
        }
        state.seq.reset();
        info!("ENGINE: cache cleared");
    }

    /// One-shot generation driven to completion on the caller's thread.
    /// `callback(text, is_final)` returning `false` stops early; a natural
    /// end is reported once as `("", true)`.
    pub fn generate_with_callback<F>(&self, prompt: &str, config: &GenerationConfig, mut callback: F) -> Result<(), EngineError>
    where
        F: FnMut(&str, bool) -> bool,
    {
        self.start_inference(prompt, config)?;
        while self.is_generating() {
            match self.next_token() {
                Some(piece) => {
                    if !callback(&piece, false) {
                        self.stop_generation();
                        self.shared.lock_state().finalize_turn();
                        break;
                    }
                }
                None => {
                    callback("", true);
                    break;
                }
            }
        }
        Ok(())
    }
}
