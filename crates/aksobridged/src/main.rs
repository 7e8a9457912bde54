//! aksobridged: supervisor and worker entry point.
//!
//! Without a subcommand the process is the supervisor. It re-executes
//! itself with the hidden `worker` subcommand once per CPU.

mod cli;
mod logging;

use aksobridge::{Supervisor, SupervisorConfig, shutdown_signal};
use clap::Parser;

use crate::cli::{Cli, Command};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init_tracing();

    // Supervisor and workers are each single-threaded; parallelism comes
    // from the worker processes.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    match cli.command {
        Some(Command::Worker) => runtime.block_on(aksobridge::run_worker())?,
        None => runtime.block_on(supervise(cli))?,
    }
    Ok(())
}

async fn supervise(cli: Cli) -> anyhow::Result<()> {
    tracing::info!(
        version = aksobridge::AKSOBRIDGE_VERSION,
        dir = %cli.dir.display(),
        "Starting aksobridged"
    );
    let config = SupervisorConfig::new(cli.dir, cli.host);
    let mut supervisor = Supervisor::start(config).await?;
    supervisor.run(shutdown_signal()).await?;
    Ok(())
}
