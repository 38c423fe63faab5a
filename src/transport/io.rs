use std::io::{self, Read, Write};

use mio::{Interest, Token};
use tracing::warn;

use crate::commands::execute_command;
use crate::protocol;
use crate::runtime::KernelState;

use super::{parse_available_commands, Client, ParsedCommand};

/// Reads what the socket has, then runs every complete command. Returns
/// `true` when the connection should be closed.
pub fn handle_read(client: &mut Client, token: Token, state: &mut KernelState) -> bool {
    let mut chunk = [0; 4096];
    loop {
        match client.stream.read(&mut chunk) {
            Ok(0) => return true,
            Ok(n) => {
                client.buffer.extend_from_slice(&chunk[..n]);
                break;
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return false,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(ref e)
                if e.kind() == io::ErrorKind::ConnectionReset || e.kind() == io::ErrorKind::BrokenPipe =>
            {
                return true;
            }
            Err(e) => {
                warn!(client_id = token.0, error = %e, "TRANSPORT: read error");
                return true;
            }
        }
    }

    let parsed = parse_available_commands(&mut client.buffer, &mut client.state);
    for command in parsed {
        match command {
            ParsedCommand::Ok { header, payload } => execute_command(client, token, header, payload, state),
            ParsedCommand::Err(e) => {
                client
                    .output_buffer
                    .extend(protocol::response_err_code("BAD_HEADER", &e));
            }
        }
    }
    false
}

/// Writes as much pending output as the socket accepts. Returns `true` when
/// the connection should be closed.
pub fn handle_write(client: &mut Client) -> bool {
    while !client.output_buffer.is_empty() {
        let (head, _) = client.output_buffer.as_slices();
        match client.stream.write(head) {
            Ok(n) => {
                client.output_buffer.drain(..n);
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return false,
            Err(_) => return true,
        }
    }
    false
}

pub fn needs_writable_interest(client: &Client) -> bool {
    !client.output_buffer.is_empty()
}

pub fn writable_interest() -> Interest {
    Interest::READABLE | Interest::WRITABLE
}
