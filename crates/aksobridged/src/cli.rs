//! Command line and environment configuration.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "aksobridged",
    version,
    about = "Multiplexes local clients onto authenticated AKSO API sessions"
)]
pub struct Cli {
    /// Directory holding one socket per worker.
    #[arg(long, env = "AKSOBRIDGE_DIR", default_value = "aksobridge")]
    pub dir: PathBuf,

    /// Upstream AKSO API base URL.
    #[arg(long, env = "AKSO_HOST", default_value = "https://apitest.akso.org")]
    pub host: String,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a single worker; spawned by the supervisor.
    #[command(hide = true)]
    Worker,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "aksobridged",
            "--dir",
            "/run/aksobridge",
            "--host",
            "https://api.akso.org",
        ])
        .unwrap();
        assert_eq!(cli.dir, PathBuf::from("/run/aksobridge"));
        assert_eq!(cli.host, "https://api.akso.org");
        assert!(cli.command.is_none());
    }

    #[test]
    fn worker_subcommand_is_hidden() {
        let cli = Cli::try_parse_from(["aksobridged", "worker"]).unwrap();
        assert!(matches!(cli.command, Some(Command::Worker)));

        let help = Cli::command().render_help().to_string();
        assert!(
            !help
                .lines()
                .any(|line| line.trim_start().starts_with("worker"))
        );
    }
}
