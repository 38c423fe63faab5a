use std::collections::VecDeque;

use crate::protocol::CommandHeader;

pub enum ClientState {
    WaitingForHeader,
    ReadingBody { header: CommandHeader },
}

pub enum ParsedCommand {
    Ok { header: CommandHeader, payload: Vec<u8> },
    Err(String),
}

/// One TCP connection: bytes read but not yet framed, bytes waiting to be
/// written, and where the framer is.
pub struct Client {
    pub stream: mio::net::TcpStream,
    pub buffer: Vec<u8>,
    pub output_buffer: VecDeque<u8>,
    pub state: ClientState,
}

impl Client {
    pub fn new(stream: mio::net::TcpStream) -> Self {
        Self {
            stream,
            buffer: Vec::with_capacity(4096),
            output_buffer: VecDeque::new(),
            state: ClientState::WaitingForHeader,
        }
    }
}
