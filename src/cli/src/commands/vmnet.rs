//! `hostlink vmnet` helper, executed as root through the sudoers rule.
//!
//! Only the profile name crosses the privilege boundary. Paths are derived
//! from it inside the root-owned run directory.

use clap::{Args, Subcommand};
use hostlink_core::config::DEFAULT_PROFILE;
use hostlink_daemon::vmnet::privileged;

#[derive(Subcommand)]
pub enum VmnetCommand {
    /// Exec the vmnet switch for a profile
    Start(HelperArgs),
    /// Terminate the profile's vmnet switch
    Stop(HelperArgs),
    /// Exit successfully only if the profile's switch is alive
    Check(HelperArgs),
}

#[derive(Args)]
pub struct HelperArgs {
    /// Profile name
    #[arg(long, default_value = DEFAULT_PROFILE)]
    pub profile: String,
}

pub fn execute(command: VmnetCommand) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        VmnetCommand::Start(args) => privileged::start(&args.profile)?,
        VmnetCommand::Stop(args) => privileged::stop(&args.profile)?,
        VmnetCommand::Check(args) => privileged::check(&args.profile)?,
    }
    Ok(())
}
