//! Hostlink daemon: supervises the host-side helpers of a headless VM.
//!
//! - `vmnet`: privileged shared-network switch
//! - `gvproxy`: user-space network with DHCP, DNS and UDP NAT
//! - `inotify`: propagates host file changes into container volumes
//!
//! The CLI drives a detached daemon through [`Manager`]; the daemon process
//! itself runs [`daemon::run`].

pub mod control;
pub mod daemon;
pub mod deps;
pub mod gvproxy;
pub mod host;
pub mod inotify;
pub mod manager;
pub mod pidfile;
pub mod process;
pub mod supervisor;
pub mod vmnet;

pub use control::{ControlClient, ControlServer, Request, Response};
pub use deps::{Dependencies, Dependency};
pub use host::{LocalHost, ShellGuest};
pub use manager::Manager;
pub use process::{Process, WorkerKind};
pub use supervisor::Supervisor;
