mod metrics;
mod parsing;

use std::path::PathBuf;
use std::sync::atomic::Ordering;

use mio::Token;

use crate::config::GenerationConfig;
use crate::errors::EngineError;
use crate::protocol::{self, CommandHeader, OpCode};
use crate::runtime::{KernelState, StreamRoute};
use crate::transport::Client;

use self::metrics::{inc_streams_started, log_event, record_command, snapshot_metrics};
use self::parsing::{parse_count, parse_start_payload};

#[derive(Clone, Copy)]
enum StartMode {
    OneShot,
    Incremental,
    Threaded,
}

fn start(state: &mut KernelState, token: Token, payload: &[u8], mode: StartMode) -> Vec<u8> {
    let (request, prompt) = match parse_start_payload(payload) {
        Ok(parsed) => parsed,
        Err(e) => return protocol::response_err_code("START_INVALID", &e),
    };
    if !state.bridge.is_model_loaded() {
        return protocol::response_err_code("NO_MODEL", "No Model Loaded");
    }

    let config = GenerationConfig::mobile().with_sampling(&request);
    let engine = state.bridge.engine().clone();
    let (code, result) = match mode {
        StartMode::OneShot => ("START", engine.start_inference(&prompt, &config)),
        StartMode::Incremental => ("START_INC", engine.start_inference_incremental(&prompt, &config)),
        StartMode::Threaded => {
            // the previous stream must deliver its Finished before the new
            // subscriber is installed
            state.close_stream();
            engine.quiesce();
            let events = state.bridge.subscribe();
            let result = engine.start_inference_threaded(&prompt, &config);
            if result.is_ok() {
                state.stream = Some(StreamRoute { owner: token, events });
                inc_streams_started();
            } else {
                engine.clear_token_callback();
            }
            ("START_THREADED", result)
        }
    };

    match result {
        Ok(()) => protocol::response_ok_code(code, &format!("n_past={}", engine.n_past())),
        Err(e) => protocol::response_err_code("START_FAILED", &e.to_string()),
    }
}

pub fn execute_command(client: &mut Client, token: Token, header: CommandHeader, payload: Vec<u8>, state: &mut KernelState) {
    let client_id = token.0;
    let response = match header.opcode {
        OpCode::Ping => protocol::response_ok_code("PING", "PONG"),
        OpCode::Load => {
            let requested = String::from_utf8_lossy(&payload).trim().to_string();
            let path = if requested.is_empty() {
                state.default_model.clone()
            } else {
                Some(PathBuf::from(requested))
            };
            match path {
                Some(path) => {
                    let path_text = path.to_string_lossy().to_string();
                    if state.bridge.load_model(&path_text) {
                        log_event("model_load", client_id, &path_text);
                        protocol::response_ok_code("LOAD", &state.bridge.model_info())
                    } else {
                        protocol::response_err_code("LOAD_FAILED", &format!("Failed to load {}", path_text))
                    }
                }
                None => protocol::response_err_code("MISSING_PATH", "LOAD requires a model path"),
            }
        }
        OpCode::Unload => {
            state.close_stream();
            state.bridge.unload_model();
            log_event("model_unload", client_id, "");
            protocol::response_ok_code("UNLOAD", "Model unloaded")
        }
        OpCode::Loaded => protocol::response_ok_code("LOADED", &state.bridge.is_model_loaded().to_string()),
        OpCode::Info => protocol::response_ok_code("INFO", &state.bridge.model_info()),
        OpCode::Start => start(state, token, &payload, StartMode::OneShot),
        OpCode::StartIncremental => start(state, token, &payload, StartMode::Incremental),
        OpCode::StartThreaded => start(state, token, &payload, StartMode::Threaded),
        OpCode::Next => {
            if state.is_streaming() {
                protocol::response_err_code("PIPELINE_BUSY", &EngineError::PipelineBusy.to_string())
            } else {
                protocol::response_ok_code("NEXT", &state.bridge.next_token())
            }
        }
        OpCode::NextN => match parse_count(&payload) {
            Ok(_) if state.is_streaming() => {
                protocol::response_err_code("PIPELINE_BUSY", &EngineError::PipelineBusy.to_string())
            }
            Ok(count) => protocol::response_ok_code("NEXTN", &state.bridge.next_tokens_joined(count)),
            Err(e) => protocol::response_err_code("NEXTN_INVALID", &e),
        },
        OpCode::Buffered => protocol::response_ok_code("BUFFERED", &state.bridge.buffered_tokens()),
        OpCode::Generating => protocol::response_ok_code("GENERATING", &state.bridge.is_generating().to_string()),
        OpCode::Stop => {
            state.bridge.stop_generation();
            protocol::response_ok_code("STOP", "Stop requested")
        }
        OpCode::Clear => {
            state.bridge.clear_cache();
            protocol::response_ok_code("CLEAR", "Cache cleared")
        }
        OpCode::Cached => protocol::response_ok_code("CACHED", &state.bridge.cached_token_count().to_string()),
        OpCode::Stats => protocol::response_ok_code("STATS", &state.bridge.stats_json()),
        OpCode::ResetStats => {
            state.bridge.reset_stats();
            protocol::response_ok_code("RESET_STATS", "Stats reset")
        }
        OpCode::MemInfo => protocol::response_ok_code("MEMINFO", &state.bridge.memory_info_json()),
        OpCode::MemUsage => protocol::response_ok_code("MEMUSAGE", &state.bridge.memory_usage().to_string()),
        OpCode::Status => {
            let m = snapshot_metrics();
            let engine = state.bridge.engine();
            protocol::response_ok_code(
                "STATUS",
                &format!(
                    "uptime_s={} total_commands={} total_errors={} total_streams={} model_loaded={} generating={} streaming={} n_past={} cached_tokens={} pressure={}",
                    m.uptime_s,
                    m.total_commands,
                    m.total_errors,
                    m.total_streams,
                    engine.is_model_loaded(),
                    engine.is_generating(),
                    state.is_streaming(),
                    engine.n_past(),
                    engine.cached_token_count(),
                    engine.monitor().pressure().as_str()
                ),
            )
        }
        OpCode::Shutdown => {
            state.shutdown_requested.store(true, Ordering::SeqCst);
            log_event("kernel_shutdown", client_id, "shutdown_requested=true");
            protocol::response_ok_code("SHUTDOWN", "Kernel shutdown requested")
        }
    };

    record_command(response.starts_with(b"+OK"));
    client.output_buffer.extend(response);
}
