//! Control socket between the CLI and a running daemon.
//!
//! Each connection carries one newline-terminated JSON [`Request`] and
//! receives one newline-terminated JSON [`Response`].

mod client;
mod protocol;
mod server;

pub use client::ControlClient;
pub use protocol::{Request, Response};
pub use server::ControlServer;
