use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::backend::{PieceState, TokenId, Vocabulary};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Flush once this many tokens are pending.
    pub flush_tokens: usize,
    /// Flush a non-empty batch after this long without a flush.
    pub flush_interval_ms: u64,
    /// How long the processor sleeps on an empty queue.
    pub wait_timeout_ms: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            flush_tokens: 4,
            flush_interval_ms: 50,
            wait_timeout_ms: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Chunk(String),
    Finished,
}

pub type TokenSink = Box<dyn FnMut(StreamEvent) + Send>;

#[derive(Default)]
struct QueueState {
    tokens: VecDeque<TokenId>,
    complete: bool,
}

/// FIFO of raw token ids between the generation and processing threads.
#[derive(Default)]
pub struct TokenQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl TokenQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.tokens.clear();
        state.complete = false;
    }

    pub fn push(&self, token: TokenId) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .tokens
            .push_back(token);
        self.ready.notify_one();
    }

    /// Marks the producer as done. Tokens already queued are still delivered.
    pub fn complete(&self) {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).complete = true;
        self.ready.notify_all();
    }

    pub fn is_complete(&self) -> bool {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).complete
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits up to `timeout` for tokens and takes all of them. The flag is
    /// read under the same lock, so `true` means nothing more will arrive.
    pub fn pop_available(&self, timeout: Duration) -> (Vec<TokenId>, bool) {
        let guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut state, _) = self
            .ready
            .wait_timeout_while(guard, timeout, |s| s.tokens.is_empty() && !s.complete)
            .unwrap_or_else(PoisonError::into_inner);
        let tokens = state.tokens.drain(..).collect();
        (tokens, state.complete)
    }
}

/// Single flush path for streamed text. Every chunk lands in the pull buffer
/// and, when one is installed, in the subscriber sink, in the same order.
#[derive(Default)]
pub struct StreamOutput {
    buffer: Mutex<String>,
    subscriber: Mutex<Option<TokenSink>>,
}

impl StreamOutput {
    pub fn publish(&self, chunk: &str) {
        if chunk.is_empty() {
            return;
        }
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_str(chunk);
        let mut subscriber = self.subscriber.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(sink) = subscriber.as_mut() {
            sink(StreamEvent::Chunk(chunk.to_string()));
        }
    }

    pub fn finish(&self) {
        let mut subscriber = self.subscriber.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(sink) = subscriber.as_mut() {
            sink(StreamEvent::Finished);
        }
    }

    /// Returns and clears everything flushed since the last drain.
    pub fn drain(&self) -> String {
        std::mem::take(&mut *self.buffer.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn discard(&self) {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    pub fn set_subscriber(&self, sink: Option<TokenSink>) {
        *self.subscriber.lock().unwrap_or_else(PoisonError::into_inner) = sink;
    }

    pub fn has_subscriber(&self) -> bool {
        self.subscriber
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Installs a channel-backed subscriber and returns its receiving end.
    pub fn subscribe(&self) -> Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel();
        self.set_subscriber(Some(Box::new(move |event| {
            let _ = tx.send(event);
        })));
        rx
    }
}

pub struct TokenPipeline {
    pub queue: TokenQueue,
    pub output: StreamOutput,
    settings: PipelineSettings,
}

impl TokenPipeline {
    pub fn new(settings: PipelineSettings) -> Self {
        Self {
            queue: TokenQueue::new(),
            output: StreamOutput::default(),
            settings,
        }
    }

    pub fn settings(&self) -> PipelineSettings {
        self.settings
    }

    /// Fresh queue and empty pull buffer for the next stream. The subscriber stays.
    pub fn reset(&self) {
        self.queue.reset();
        self.output.discard();
    }
}

struct Batcher {
    text: String,
    tokens: usize,
    last_flush: Instant,
}

impl Batcher {
    fn flush(&mut self, output: &StreamOutput) {
        if !self.text.is_empty() {
            output.publish(&self.text);
            self.text.clear();
        }
        self.tokens = 0;
        self.last_flush = Instant::now();
    }
}

/// Consumer side: detokenizes queued ids in order and flushes them in
/// batches until the producer completes and the queue is empty.
pub fn run_processor(pipeline: Arc<TokenPipeline>, vocab: Arc<dyn Vocabulary>) {
    let settings = pipeline.settings();
    let wait = Duration::from_millis(settings.wait_timeout_ms);
    let interval = Duration::from_millis(settings.flush_interval_ms);
    let flush_tokens = settings.flush_tokens.max(1);

    let mut batch = Batcher {
        text: String::new(),
        tokens: 0,
        last_flush: Instant::now(),
    };
    let mut pieces = PieceState::default();
    let mut processed = 0usize;

    loop {
        let (tokens, complete) = pipeline.queue.pop_available(wait);
        for token in tokens {
            match vocab.step_piece(&mut pieces, token) {
                Ok(Some(piece)) => batch.text.push_str(&piece),
                Ok(None) => {}
                Err(e) => warn!(token, error = %e, "PIPELINE: detokenize failed, token dropped"),
            }
            batch.tokens += 1;
            processed += 1;
            if batch.tokens >= flush_tokens {
                batch.flush(&pipeline.output);
            }
        }

        if batch.tokens > 0 && batch.last_flush.elapsed() >= interval {
            batch.flush(&pipeline.output);
        }

        if complete {
            batch.flush(&pipeline.output);
            pipeline.output.finish();
            debug!(processed, "PIPELINE: processor drained");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ToyVocab;
    use std::thread;

    fn run_stream(settings: PipelineSettings, tokens: &[TokenId]) -> (Vec<StreamEvent>, String) {
        let pipeline = Arc::new(TokenPipeline::new(settings));
        let rx = pipeline.output.subscribe();
        let vocab: Arc<dyn Vocabulary> = Arc::new(ToyVocab::default());

        let worker = {
            let pipeline = pipeline.clone();
            thread::spawn(move || run_processor(pipeline, vocab))
        };
        for &t in tokens {
            pipeline.queue.push(t);
        }
        pipeline.queue.complete();
        worker.join().expect("processor thread");

        let events: Vec<StreamEvent> = rx.try_iter().collect();
        (events, pipeline.output.drain())
    }

    fn concat_chunks(events: &[StreamEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Chunk(text) => Some(text.as_str()),
                StreamEvent::Finished => None,
            })
            .collect()
    }

    #[test]
    fn queue_preserves_fifo_order() {
        let queue = TokenQueue::new();
        for t in [5, 1, 9, 2] {
            queue.push(t);
        }
        let (tokens, complete) = queue.pop_available(Duration::from_millis(1));
        assert_eq!(tokens, vec![5, 1, 9, 2]);
        assert!(!complete);
        assert!(queue.is_empty());
    }

    #[test]
    fn pop_times_out_on_empty_queue() {
        let queue = TokenQueue::new();
        let started = Instant::now();
        let (tokens, complete) = queue.pop_available(Duration::from_millis(15));
        assert!(tokens.is_empty());
        assert!(!complete);
        assert!(started.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn stream_is_complete_for_multiple_of_batch() {
        let tokens: Vec<TokenId> = b"abcdefgh".iter().map(|&b| b as TokenId).collect();
        let (events, pulled) = run_stream(PipelineSettings::default(), &tokens);
        assert_eq!(concat_chunks(&events), "abcdefgh");
        assert_eq!(pulled, "abcdefgh");
        assert_eq!(events.last(), Some(&StreamEvent::Finished));
    }

    #[test]
    fn stream_flushes_residual_tokens_on_completion() {
        let tokens: Vec<TokenId> = b"hello world".iter().map(|&b| b as TokenId).collect();
        let (events, pulled) = run_stream(PipelineSettings::default(), &tokens);
        assert_eq!(concat_chunks(&events), "hello world");
        assert_eq!(pulled, "hello world");
        let finished = events.iter().filter(|e| **e == StreamEvent::Finished).count();
        assert_eq!(finished, 1);
    }

    #[test]
    fn interval_flush_delivers_partial_batch() {
        let settings = PipelineSettings {
            flush_tokens: 64,
            flush_interval_ms: 5,
            wait_timeout_ms: 2,
        };
        let pipeline = Arc::new(TokenPipeline::new(settings));
        let vocab: Arc<dyn Vocabulary> = Arc::new(ToyVocab::default());
        let worker = {
            let pipeline = pipeline.clone();
            thread::spawn(move || run_processor(pipeline, vocab))
        };

        pipeline.queue.push(b'x' as TokenId);
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut seen = String::new();
        while seen.is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
            seen = pipeline.output.drain();
        }
        assert_eq!(seen, "x");

        pipeline.queue.complete();
        worker.join().expect("processor thread");
    }

    #[test]
    fn split_character_reaches_one_chunk_intact() {
        let settings = PipelineSettings {
            flush_tokens: 1,
            ..PipelineSettings::default()
        };
        let tokens: Vec<TokenId> = "aé".bytes().map(TokenId::from).collect();
        assert_eq!(tokens.len(), 3);

        let (events, pulled) = run_stream(settings, &tokens);
        assert_eq!(pulled, "aé");
        let chunks: Vec<&StreamEvent> = events.iter().filter(|e| **e != StreamEvent::Finished).collect();
        assert_eq!(
            chunks,
            vec![&StreamEvent::Chunk("a".to_string()), &StreamEvent::Chunk("é".to_string())]
        );
        assert!(!concat_chunks(&events).contains('\u{FFFD}'));
    }

    #[test]
    fn drain_is_idempotent() {
        let output = StreamOutput::default();
        output.publish("abc");
        assert_eq!(output.drain(), "abc");
        assert_eq!(output.drain(), "");
    }

    #[test]
    fn reset_keeps_subscriber() {
        let pipeline = TokenPipeline::new(PipelineSettings::default());
        let rx = pipeline.output.subscribe();
        pipeline.queue.push(1);
        pipeline.queue.complete();
        pipeline.reset();
        assert!(pipeline.queue.is_empty());
        assert!(!pipeline.queue.is_complete());
        assert!(pipeline.output.has_subscriber());
        pipeline.output.publish("z");
        assert_eq!(rx.try_recv(), Ok(StreamEvent::Chunk("z".to_string())));
    }
}
