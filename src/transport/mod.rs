mod client;
mod framing;
mod io;

pub use client::{Client, ClientState, ParsedCommand};
pub use framing::parse_available_commands;
pub use io::{handle_read, handle_write, needs_writable_interest, writable_interest};
