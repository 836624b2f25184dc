//! `hostlink daemon` commands: start, stop and inspect the background daemon.

use std::time::Duration;

use clap::{Args, Subcommand};
use hostlink_core::config::{DaemonConfig, Profile, WorkerSelection, DEFAULT_PROFILE};
use hostlink_daemon::{ControlClient, Manager, Response};

use crate::output;

#[derive(Subcommand)]
pub enum DaemonCommand {
    /// Start the daemon, replacing a running one
    Start(StartArgs),
    /// Stop the daemon
    Stop(StopArgs),
    /// Show daemon and worker status
    Status(StatusArgs),
    /// Run the daemon in the foreground (used by `start`)
    #[command(hide = true)]
    Run(RunArgs),
}

#[derive(Args)]
pub struct StartArgs {
    /// Profile name
    #[arg(long, default_value = DEFAULT_PROFILE)]
    pub profile: String,

    /// Run the privileged vmnet shared network
    #[arg(long)]
    pub vmnet: bool,

    /// Run the user-space network
    #[arg(long)]
    pub gvproxy: bool,

    /// Propagate host file changes into container volumes
    #[arg(long)]
    pub inotify: bool,

    /// Debug logging in the daemon log
    #[arg(long)]
    pub verbose: bool,
}

#[derive(Args)]
pub struct StopArgs {
    /// Profile name
    #[arg(long, default_value = DEFAULT_PROFILE)]
    pub profile: String,

    /// Seconds to wait before force-killing
    #[arg(short = 't', long, default_value = "60")]
    pub timeout: u64,
}

#[derive(Args)]
pub struct StatusArgs {
    /// Profile name
    #[arg(long, default_value = DEFAULT_PROFILE)]
    pub profile: String,

    /// Print status as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args)]
pub struct RunArgs {
    /// Daemon configuration as JSON
    #[arg(long)]
    pub config: String,
}

pub async fn execute(command: DaemonCommand) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        DaemonCommand::Start(args) => start(args).await,
        DaemonCommand::Stop(args) => stop(args).await,
        DaemonCommand::Status(args) => status(args).await,
        DaemonCommand::Run(args) => run(args).await,
    }
}

/// Overlay command-line flags on the profile configuration.
/// Worker flags replace the configured selection when any is given.
fn apply_flags(config: &mut DaemonConfig, args: &StartArgs) {
    let flags = WorkerSelection {
        vmnet: args.vmnet,
        gvproxy: args.gvproxy,
        inotify: args.inotify,
    };
    if flags.any() {
        config.workers = flags;
    }
    config.verbose |= args.verbose;
}

async fn start(args: StartArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = DaemonConfig::load(Profile::new(&args.profile)?)?;
    apply_flags(&mut config, &args);
    if !config.workers.any() {
        return Err("no workers selected; pass --vmnet, --gvproxy or --inotify".into());
    }

    Manager::new()?.start(&config).await?;
    println!("Daemon started for profile {}", config.profile.name);
    Ok(())
}

async fn stop(args: StopArgs) -> Result<(), Box<dyn std::error::Error>> {
    let profile = Profile::new(&args.profile)?;
    Manager::new()?
        .stop(&profile, Duration::from_secs(args.timeout))
        .await?;
    println!("Daemon stopped for profile {}", profile.name);
    Ok(())
}

async fn status(args: StatusArgs) -> Result<(), Box<dyn std::error::Error>> {
    let profile = Profile::new(&args.profile)?;
    let status = Manager::new()?.running(&profile).await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    if !status.running {
        println!("Daemon is not running for profile {}", profile.name);
        return Ok(());
    }

    if let Ok(Response::Pong {
        pid, started_at, ..
    }) = ControlClient::new(profile.control_socket()).ping().await
    {
        println!(
            "Daemon running for profile {} (pid {pid}, up {})",
            profile.name,
            output::format_uptime(&started_at, &chrono::Utc::now())
        );
    }
    println!("{}", output::status_table(&status));
    Ok(())
}

async fn run(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = DaemonConfig::from_json(&args.config)?;
    hostlink_daemon::daemon::run(config).await?;
    Ok(())
}
