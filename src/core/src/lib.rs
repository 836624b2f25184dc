//! Hostlink Core - Foundational Types and Abstractions
//!
//! This crate provides the types shared between the daemon and the CLI:
//! the error type, daemon configuration, host DNS settings, the host/guest
//! capability traits and the status snapshot reported by a running daemon.

pub mod actions;
pub mod config;
pub mod dns;
pub mod error;
pub mod status;

// Re-export commonly used types
pub use actions::{GuestActions, HostActions};
pub use config::{ContainerRuntime, DaemonConfig, Profile, WorkerSelection};
pub use dns::ResolvConf;
pub use error::{HostlinkError, Result};
pub use status::{ProcessStatus, Status};

/// Hostlink version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
