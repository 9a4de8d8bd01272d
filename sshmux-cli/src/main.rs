//! CLI for running commands through an OpenSSH ControlMaster.

#![allow(
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::missing_docs_in_private_items
)]

mod run;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use serde::Serialize;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(
    name = "sshmux",
    version,
    about = "Run commands through a running OpenSSH ControlMaster"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a command on the master's host, or a login shell if none is given.
    Run(run::RunArgs),

    /// Check that the master is running.
    Check {
        #[command(flatten)]
        control: ControlArgs,

        /// Output format.
        #[arg(long, default_value = "table")]
        format: OutputFormat,
    },

    /// Generate shell completion scripts.
    #[command(hide = true)]
    Completion {
        /// Target shell.
        shell: Shell,
    },
}

/// Where to find the master.
#[derive(clap::Args)]
pub(crate) struct ControlArgs {
    /// Control socket of the master (`ControlPath` in ssh_config).
    #[arg(short = 'S', long, env = "SSHMUX_CONTROL_PATH")]
    pub(crate) control_path: PathBuf,
}

/// Output format for `check`.
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
pub(crate) enum OutputFormat {
    /// Human-readable line.
    #[default]
    Table,
    /// Machine-readable JSON.
    Json,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    init_tracing();
    if let Err(e) = Cli::parse().dispatch().await {
        // A failed remote command already reported on its own stderr.
        if let Some(status) = e
            .downcast_ref::<sshmux::Error>()
            .and_then(sshmux::Error::exit_status)
        {
            std::process::exit(i32::try_from(status).unwrap_or(255));
        }
        eprintln!("sshmux: {e:#}");
        std::process::exit(255);
    }
}

/// Logs to stderr, filtered by `SSHMUX_LOG` (default `warn`).
fn init_tracing() {
    let filter = EnvFilter::try_from_env("SSHMUX_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .init();
}

impl Cli {
    async fn dispatch(self) -> Result<()> {
        match self.command {
            Command::Run(args) => args.run().await,
            Command::Check { control, format } => check(&control.control_path, format).await,
            Command::Completion { shell } => {
                clap_complete::generate(
                    shell,
                    &mut Self::command(),
                    "sshmux",
                    &mut std::io::stdout(),
                );
                Ok(())
            }
        }
    }
}

#[derive(Serialize)]
struct CheckReport<'a> {
    control_path: &'a Path,
    master_pid: u32,
}

async fn check(control_path: &Path, format: OutputFormat) -> Result<()> {
    let master_pid = sshmux::check(control_path)
        .await
        .with_context(|| format!("check master at {}", control_path.display()))?;

    match format {
        OutputFormat::Json => {
            let report = CheckReport {
                control_path,
                master_pid,
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        OutputFormat::Table => println!("Master running (pid={master_pid})"),
    }
    Ok(())
}
