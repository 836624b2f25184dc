//! CLI command definitions and dispatch.

mod daemon;
mod vmnet;

use clap::{Parser, Subcommand};
use hostlink_core::config::DaemonConfig;

/// Hostlink: network and file-sync daemon for a headless VM.
#[derive(Parser)]
#[command(name = "hostlink", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Manage the background daemon
    #[command(subcommand)]
    Daemon(daemon::DaemonCommand),
    /// Privileged vmnet helper, run through sudo by the daemon
    #[command(subcommand, hide = true)]
    Vmnet(vmnet::VmnetCommand),
}

/// Logging settings for the invoked command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Logging {
    pub filter: &'static str,
    pub ansi: bool,
}

impl Cli {
    /// Default log filter: quiet for interactive commands, `info`
    /// (`debug` when verbose) inside the daemon.
    pub fn logging(&self) -> Logging {
        match &self.command {
            Command::Daemon(daemon::DaemonCommand::Run(args)) => {
                let verbose = DaemonConfig::from_json(&args.config)
                    .map(|c| c.verbose)
                    .unwrap_or(false);
                Logging {
                    filter: if verbose { "debug" } else { "info" },
                    ansi: false,
                }
            }
            _ => Logging {
                filter: "warn",
                ansi: true,
            },
        }
    }
}

/// Dispatch a parsed CLI command.
pub async fn dispatch(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Daemon(command) => daemon::execute(command).await,
        Command::Vmnet(command) => vmnet::execute(command),
    }
}
