//! Body of the detached daemon process.

use hostlink_core::config::DaemonConfig;
use hostlink_core::error::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::control::ControlServer;
use crate::deps::Dependencies;
use crate::host::LocalHost;
use crate::pidfile;
use crate::process;
use crate::supervisor::Supervisor;

/// Run the daemon until it is stopped, signalled, or a worker fails.
///
/// Owns the PID file and control socket for its lifetime and removes both
/// on the way out.
pub async fn run(config: DaemonConfig) -> Result<()> {
    let profile = config.profile.clone();
    std::fs::create_dir_all(profile.daemon_dir())?;
    pidfile::write(&profile.pid_file())?;
    tracing::info!(
        pid = std::process::id(),
        profile = %profile.name,
        workers = ?config.workers,
        "Daemon starting"
    );

    let result = serve(&config).await;

    pidfile::remove(&profile.pid_file());
    match &result {
        Ok(()) => tracing::info!("Daemon stopped"),
        Err(e) => tracing::error!(error = %e, "Daemon stopped with error"),
    }
    result
}

async fn serve(config: &DaemonConfig) -> Result<()> {
    let processes = process::processes(config);

    // The CLI installs these in the foreground; anything still missing can
    // only be installed here if it needs no prompt.
    let deps = Dependencies::of(&processes);
    if !deps.installed().await {
        deps.install(&LocalHost::new()).await?;
    }

    let supervisor = Arc::new(Supervisor::new(processes));
    let token = CancellationToken::new();

    let server = ControlServer::bind(&config.profile.control_socket(), supervisor.clone())?;
    let server_task = tokio::spawn(server.run(token.clone()));
    spawn_signal_handler(token.clone())?;

    let result = supervisor.run(token.clone()).await;
    token.cancel();
    if let Err(e) = server_task.await {
        tracing::debug!(error = %e, "Control server task failed");
    }
    result
}

fn spawn_signal_handler(token: CancellationToken) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
            _ = sigint.recv() => tracing::info!("Received SIGINT"),
            _ = token.cancelled() => return,
        }
        token.cancel();
    });
    Ok(())
}
