//! Hostlink CLI entry point.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use hostlink_cli::commands::{dispatch, Cli};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // The daemon logs to a file (its redirected stderr), so no colour codes there.
    let logging = cli.logging();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(logging.filter)),
        )
        .with_target(false)
        .with_ansi(logging.ansi)
        .init();

    if let Err(e) = dispatch(cli).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
