mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;
use cli::{Command, MachineCommand, Opts};

#[tokio::main]
async fn main() -> Result<()> {
    let opts = Opts::parse();

    let level = match opts.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    if std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var("RUST_LOG", format!("{level},machine_core={level}"));
    }
    env_logger::init();

    match opts.command {
        Command::Machine(MachineCommand::Start(network)) => commands::start(&network).await,
        Command::Machine(MachineCommand::Stop { network, purge }) => commands::stop(&network, purge).await,
        Command::Machine(MachineCommand::Status { network }) => commands::status(&network).await,
        Command::Machine(MachineCommand::Reconcile { network, registry }) => {
            commands::reconcile(&network, &registry).await
        },
        Command::Machine(MachineCommand::Watch { network, registry }) => commands::watch(&network, &registry).await,
        Command::Machine(MachineCommand::Ls { network, format }) => commands::ls(&network, format.as_deref()).await,
        Command::Join(join_opts) => commands::join(&join_opts).await,
        Command::HostAccess(host_access_opts) => commands::host_access(&host_access_opts).await,
    }
}
