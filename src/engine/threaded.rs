use std::sync::{Arc, PoisonError};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info};

use crate::backend::Pos;
use crate::config::GenerationConfig;
use crate::errors::EngineError;
use crate::pipeline::run_processor;

use super::generation::Step;
use super::{EngineShared, LlmEngine};

/// Handles of the producer and processor threads of one streamed turn.
pub(crate) struct PipelineWorkers {
    producer: JoinHandle<()>,
    processor: JoinHandle<()>,
}

impl PipelineWorkers {
    pub(crate) fn join(self) {
        if self.producer.join().is_err() {
            error!("PIPELINE: generation thread panicked");
        }
        if self.processor.join().is_err() {
            error!("PIPELINE: processing thread panicked");
        }
    }
}

impl LlmEngine {
    /// Evaluates `prompt` like `start_inference_incremental`, then hands
    /// sampling to a generation thread. Text is delivered through
    /// `buffered_tokens` and any installed token callback; `next_token`
    /// returns `None` while the stream runs.
    pub fn start_inference_threaded(&self, prompt: &str, config: &GenerationConfig) -> Result<(), EngineError> {
        self.quiesce();
        let pipeline = self.shared.pipeline.clone();
        pipeline.reset();

        let vocab = {
            let mut state = self.shared.lock_state();
            state.prepare_incremental(prompt, config).map_err(|e| {
                error!(error = %e, "PIPELINE: threaded start failed");
                e
            })?;
            state.vocab.clone().ok_or(EngineError::NotLoaded)?
        };

        self.shared.flags.begin(true);

        let processor = {
            let pipeline = pipeline.clone();
            thread::Builder::new()
                .name("pocket-llm-processor".to_string())
                .spawn(move || run_processor(pipeline, vocab))
        };
        let processor = match processor {
            Ok(handle) => handle,
            Err(source) => {
                self.shared.flags.finish();
                return Err(EngineError::Spawn {
                    name: "processor",
                    source,
                });
            }
        };

        let producer = {
            let shared = self.shared.clone();
            thread::Builder::new()
                .name("pocket-llm-generator".to_string())
                .spawn(move || run_producer(shared))
        };
        let producer = match producer {
            Ok(handle) => handle,
            Err(source) => {
                pipeline.queue.complete();
                if processor.join().is_err() {
                    error!("PIPELINE: processing thread panicked");
                }
                self.shared.flags.finish();
                return Err(EngineError::Spawn {
                    name: "generator",
                    source,
                });
            }
        };

        *self.workers.lock().unwrap_or_else(PoisonError::into_inner) = Some(PipelineWorkers { producer, processor });
        info!("PIPELINE: streaming generation started");
        Ok(())
    }
}

/// Closes the turn when the generation thread leaves `run_producer`, by
/// return or by unwinding: the processor drains and `wait_idle` returns.
struct ProducerExit<'a> {
    shared: &'a EngineShared,
}

impl Drop for ProducerExit<'_> {
    fn drop(&mut self) {
        let mut state = self.shared.lock_state();
        if thread::panicking() {
            let n_past = state.seq.n_past;
            error!(n_past, "PIPELINE: generation thread panicked, closing stream");
            state.seq.tokens.truncate(n_past);
            state.seq.current_pos = n_past;
            let _ = state.cache.remove_tokens(n_past as Pos, -1);
        }
        state.finalize_turn();
        drop(state);
        self.shared.pipeline.queue.complete();
        self.shared.flags.finish();
    }
}

/// Generation thread: sample, enqueue, evaluate, until an end condition or a
/// stop request. The engine lock is released between steps so callers can
/// query state while the stream runs.
fn run_producer(shared: Arc<EngineShared>) {
    let _exit = ProducerExit { shared: &shared };
    let flags = &shared.flags;
    let queue = &shared.pipeline.queue;
    let mut produced = 0usize;

    loop {
        if flags.stop_requested() {
            debug!("PIPELINE: stop observed");
            break;
        }
        let step = shared.lock_state().next_step();
        let token = match step {
            Step::Token(token) => token,
            Step::End(reason) => {
                debug!(%reason, "PIPELINE: generation finished");
                break;
            }
        };
        if flags.stop_requested() {
            break;
        }
        queue.push(token);
        produced += 1;

        if let Err(e) = shared.lock_state().accept_token(token) {
            error!(error = %e, "PIPELINE: evaluation failed, ending stream");
            break;
        }
    }

    debug!(produced, "PIPELINE: generation thread exiting");
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::{mpsc, Arc, Mutex};
    use std::time::{Duration, Instant};

    use crate::config::GenerationConfig;
    use crate::engine::LlmEngine;
    use crate::pipeline::StreamEvent;
    use crate::testing::{toy_engine, ToyOptions};

    fn greedy(max_tokens: usize) -> GenerationConfig {
        GenerationConfig {
            temperature: 0.0,
            max_tokens,
            seed: Some(7),
            ..GenerationConfig::default()
        }
    }

    fn pulled_text(prompt: &str, max_tokens: usize) -> String {
        let (engine, _probe) = toy_engine(ToyOptions::default());
        let config = greedy(max_tokens);
        engine.load_model(Path::new("toy.gguf"), &config).expect("load");
        engine.start_inference(prompt, &config).expect("start");
        let mut text = String::new();
        while let Some(piece) = engine.next_token() {
            text.push_str(&piece);
        }
        text
    }

    fn wait_until_idle(engine: &LlmEngine) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while engine.is_generating() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        engine.join_pipeline();
    }

    fn streamed_text(max_tokens: usize) -> (String, Vec<StreamEvent>) {
        let (engine, _probe) = toy_engine(ToyOptions::default());
        let config = greedy(max_tokens);
        engine.load_model(Path::new("toy.gguf"), &config).expect("load");
        let rx = engine.subscribe();
        engine
            .start_inference_threaded("stream this", &config)
            .expect("threaded start");
        wait_until_idle(&engine);
        (engine.buffered_tokens(), rx.try_iter().collect())
    }

    #[test]
    fn stream_matches_pulled_output() {
        for n in [10, 8] {
            let (streamed, events) = streamed_text(n);
            assert_eq!(streamed, pulled_text("stream this", n));
            assert_eq!(streamed.len(), n);

            let chunks: String = events
                .iter()
                .filter_map(|e| match e {
                    StreamEvent::Chunk(text) => Some(text.as_str()),
                    StreamEvent::Finished => None,
                })
                .collect();
            assert_eq!(chunks, streamed);
        }
    }

    #[test]
    fn finished_is_signalled_exactly_once() {
        let (_, events) = streamed_text(10);
        let finished = events.iter().filter(|e| **e == StreamEvent::Finished).count();
        assert_eq!(finished, 1);
        assert_eq!(events.last(), Some(&StreamEvent::Finished));
    }

    #[test]
    fn callback_receives_stream_in_order() {
        let (engine, _probe) = toy_engine(ToyOptions::default());
        let config = greedy(6);
        engine.load_model(Path::new("toy.gguf"), &config).expect("load");

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        engine.set_token_callback(Box::new(move |event| {
            sink.lock().expect("callback log").push(event);
        }));
        engine
            .start_inference_threaded("abc", &config)
            .expect("threaded start");
        wait_until_idle(&engine);

        let events = seen.lock().expect("callback log").clone();
        let text: String = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Chunk(text) => Some(text.as_str()),
                StreamEvent::Finished => None,
            })
            .collect();
        assert_eq!(text.len(), 6);
        assert_eq!(events.last(), Some(&StreamEvent::Finished));
    }

    #[test]
    fn pull_api_is_disabled_while_streaming() {
        let (engine, _probe) = toy_engine(ToyOptions {
            delay: Some(Duration::from_millis(20)),
            ..ToyOptions::default()
        });
        let config = greedy(50);
        engine.load_model(Path::new("toy.gguf"), &config).expect("load");
        engine
            .start_inference_threaded("abc", &config)
            .expect("threaded start");
        assert!(engine.is_generating());
        assert_eq!(engine.next_token(), None);
        engine.stop_generation();
        wait_until_idle(&engine);
        assert!(!engine.is_generating());
    }

    #[test]
    fn stop_ends_stream_early() {
        let (engine, _probe) = toy_engine(ToyOptions {
            delay: Some(Duration::from_millis(5)),
            ..ToyOptions::default()
        });
        let config = greedy(200);
        engine.load_model(Path::new("toy.gguf"), &config).expect("load");
        let rx = engine.subscribe();
        engine
            .start_inference_threaded("abc", &config)
            .expect("threaded start");
        std::thread::sleep(Duration::from_millis(30));
        engine.stop_generation();
        wait_until_idle(&engine);

        assert!(!engine.is_generating());
        assert!(engine.stats().generated_tokens < 200);
        let events: Vec<StreamEvent> = rx.try_iter().collect();
        assert_eq!(events.last(), Some(&StreamEvent::Finished));
    }

    #[test]
    fn unload_during_stream_waits_for_generation() {
        let (engine, _probe) = toy_engine(ToyOptions {
            delay: Some(Duration::from_millis(5)),
            ..ToyOptions::default()
        });
        let config = greedy(200);
        engine.load_model(Path::new("toy.gguf"), &config).expect("load");
        engine
            .start_inference_threaded("abc", &config)
            .expect("threaded start");
        std::thread::sleep(Duration::from_millis(20));

        engine.unload_model();
        assert!(!engine.is_generating());
        assert!(!engine.is_model_loaded());
        assert_eq!(engine.memory_usage(), 0);
    }

    #[test]
    fn generator_panic_ends_stream_and_releases_engine() {
        let (engine, _probe) = toy_engine(ToyOptions {
            panic_at_pos: Some(6),
            ..ToyOptions::default()
        });
        let config = greedy(20);
        engine.load_model(Path::new("toy.gguf"), &config).expect("load");
        let rx = engine.subscribe();
        engine
            .start_inference_threaded("abc", &config)
            .expect("threaded start");
        wait_until_idle(&engine);

        assert!(!engine.is_generating());
        // tokens for positions 4 and 5 were evaluated, the one for 6 was queued first
        assert_eq!(engine.buffered_tokens().len(), 3);
        assert_eq!(engine.n_past(), 6);
        let events: Vec<StreamEvent> = rx.try_iter().collect();
        assert_eq!(events.last(), Some(&StreamEvent::Finished));

        let engine = Arc::new(engine);
        let (done_tx, done_rx) = mpsc::channel();
        {
            let engine = engine.clone();
            std::thread::spawn(move || {
                engine.unload_model();
                let _ = done_tx.send(());
            });
        }
        assert!(done_rx.recv_timeout(Duration::from_secs(2)).is_ok());
        assert!(!engine.is_model_loaded());
    }

    #[test]
    fn threaded_turns_continue_the_same_sequence() {
        let (engine, _probe) = toy_engine(ToyOptions::default());
        let config = greedy(3);
        engine.load_model(Path::new("toy.gguf"), &config).expect("load");

        engine.start_inference_threaded("ab", &config).expect("first");
        wait_until_idle(&engine);
        let after_first = engine.n_past();
        assert_eq!(after_first, 3 + 3);

        engine.start_inference_threaded("cd", &config).expect("second");
        wait_until_idle(&engine);
        assert_eq!(engine.n_past(), after_first + 2 + 3);
    }
}
