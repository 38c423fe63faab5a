use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use pocket_llm::bridge::EngineBridge;
use pocket_llm::runtime::{run_stream_tick, KernelState};
use pocket_llm::transport::{handle_read, handle_write, needs_writable_interest, writable_interest, Client};
use pocket_llm::{CandleLoader, KernelConfig, LlmEngine, ResourceMonitor};

const SERVER: Token = Token(0);

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = KernelConfig::load().map_err(anyhow::Error::msg)?;
    let monitor = Arc::new(ResourceMonitor::system());
    let engine = LlmEngine::new(Box::new(CandleLoader), monitor, config.pipeline, config.cache)
        .with_tokenizer_hint(config.model.tokenizer.clone());
    let engine = Arc::new(engine);

    if let Some(path) = config.model.path.as_ref() {
        match engine.load_model(path, &config.generation) {
            Ok(()) => info!(path = %path.display(), "KERNEL: startup model loaded"),
            Err(e) => warn!(path = %path.display(), error = %e, "KERNEL: startup model not loaded"),
        }
    }

    let mut state = KernelState::new(EngineBridge::new(engine.clone()), config.model.path.clone());

    let mut poll = Poll::new()?;
    let mut events = Events::with_capacity(128);

    let addr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("invalid bind address '{}'", config.server.bind))?;
    let mut server = TcpListener::bind(addr).with_context(|| format!("failed to bind {}", addr))?;
    poll.registry().register(&mut server, SERVER, Interest::READABLE)?;

    let mut clients: HashMap<Token, Client> = HashMap::new();
    let mut unique_token = Token(SERVER.0 + 1);

    info!(%addr, "KERNEL: pocket-llm ready");

    while !state.shutdown_requested() {
        poll.poll(&mut events, Some(Duration::from_millis(5)))?;

        for event in events.iter() {
            match event.token() {
                SERVER => loop {
                    match server.accept() {
                        Ok((mut stream, peer)) => {
                            let token = unique_token;
                            unique_token.0 += 1;
                            info!(%peer, client_id = token.0, "KERNEL: new connection");
                            poll.registry().register(&mut stream, token, Interest::READABLE)?;
                            clients.insert(token, Client::new(stream));
                        }
                        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) => {
                            error!(error = %e, "KERNEL: accept failed");
                            break;
                        }
                    }
                },
                token => {
                    let Some(client) = clients.get_mut(&token) else {
                        continue;
                    };
                    let mut should_close = false;
                    if event.is_readable() && handle_read(client, token, &mut state) {
                        should_close = true;
                    }
                    if event.is_writable() && handle_write(client) {
                        should_close = true;
                    }
                    if !should_close {
                        let interest = if needs_writable_interest(client) {
                            writable_interest()
                        } else {
                            Interest::READABLE
                        };
                        poll.registry().reregister(&mut client.stream, token, interest)?;
                    }
                    if should_close {
                        clients.remove(&token);
                        if state.stream.as_ref().is_some_and(|route| route.owner == token) {
                            info!(client_id = token.0, "KERNEL: stream owner disconnected, stopping");
                            state.bridge.stop_generation();
                        }
                    }
                }
            }
        }

        for token in run_stream_tick(&mut state, &mut clients) {
            if let Some(client) = clients.get_mut(&token) {
                let _ = poll
                    .registry()
                    .reregister(&mut client.stream, token, writable_interest());
            }
        }
    }

    info!("KERNEL: shutdown requested, flushing");
    for client in clients.values_mut() {
        let _ = handle_write(client);
    }
    engine.unload_model();
    Ok(())
}
