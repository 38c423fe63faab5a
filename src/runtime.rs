use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::Arc;

use mio::Token;
use tracing::{debug, info};

use crate::bridge::EngineBridge;
use crate::pipeline::StreamEvent;
use crate::protocol;
use crate::transport::Client;

/// Where the chunks of the running streamed generation go.
pub struct StreamRoute {
    pub owner: Token,
    pub events: Receiver<StreamEvent>,
}

/// Everything the command handlers act on, owned by the poll thread.
pub struct KernelState {
    pub bridge: EngineBridge,
    pub default_model: Option<PathBuf>,
    pub stream: Option<StreamRoute>,
    /// Frames of retired streams waiting for the next tick.
    pub outbox: Vec<(Token, Vec<u8>)>,
    pub shutdown_requested: Arc<AtomicBool>,
}

impl KernelState {
    pub fn new(bridge: EngineBridge, default_model: Option<PathBuf>) -> Self {
        Self {
            bridge,
            default_model,
            stream: None,
            outbox: Vec::new(),
            shutdown_requested: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.stream.is_some()
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    /// Stops the running stream and queues its remaining chunks and the
    /// end frame for its owner.
    pub fn close_stream(&mut self) {
        let Some(route) = self.stream.take() else {
            return;
        };
        self.bridge.engine().quiesce();
        let (mut frames, finished) = drain_events(&route.events);
        if !finished {
            frames.extend(protocol::response_stream_end());
        }
        info!(client_id = route.owner.0, "KERNEL: stream closed");
        self.outbox.push((route.owner, frames));
    }
}

/// Turns every pending event into frames. The flag reports whether the
/// stream has ended.
fn drain_events(events: &Receiver<StreamEvent>) -> (Vec<u8>, bool) {
    let mut out = Vec::new();
    loop {
        match events.try_recv() {
            Ok(StreamEvent::Chunk(text)) => out.extend(protocol::response_data(text.as_bytes())),
            Ok(StreamEvent::Finished) | Err(TryRecvError::Disconnected) => {
                out.extend(protocol::response_stream_end());
                return (out, true);
            }
            Err(TryRecvError::Empty) => return (out, false),
        }
    }
}

/// Moves flushed stream chunks into the owning client's output buffer.
/// Returns the clients that now have something to write.
pub fn run_stream_tick(state: &mut KernelState, clients: &mut HashMap<Token, Client>) -> Vec<Token> {
    let mut pending = std::mem::take(&mut state.outbox);

    if let Some(route) = state.stream.as_ref() {
        let owner = route.owner;
        let (out, finished) = drain_events(&route.events);
        if finished {
            state.stream = None;
            state.bridge.engine().join_pipeline();
            info!(client_id = owner.0, "KERNEL: stream finished");
        }
        if !out.is_empty() {
            pending.push((owner, out));
        }
    }

    let mut ready = Vec::new();
    for (owner, frames) in pending {
        match clients.get_mut(&owner) {
            Some(client) => {
                client.output_buffer.extend(frames);
                if !ready.contains(&owner) {
                    ready.push(owner);
                }
            }
            None => debug!(client_id = owner.0, "KERNEL: stream owner gone, chunks dropped"),
        }
    }
    ready
}
