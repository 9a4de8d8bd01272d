//! `sshmux run`: run a command through the master on this process's stdio.
//!
//! Mirrors `ssh -S <path> [-t] [-n] [command ...]`.

use std::io;
use std::os::fd::{AsFd, OwnedFd};

use anyhow::{Context, Result};
use sshmux::{Input, Output, Session};

use crate::ControlArgs;

/// Arguments for `sshmux run`.
#[derive(clap::Args)]
#[command(trailing_var_arg = true)]
pub(crate) struct RunArgs {
    #[command(flatten)]
    control: ControlArgs,

    /// Request a pseudo-terminal for the remote command.
    #[arg(short = 't', long)]
    tty: bool,

    /// Terminal type sent with the pty request.
    #[arg(long, env = "TERM", default_value = "xterm")]
    term: String,

    /// Redirect stdin from nothing.
    #[arg(short = 'n')]
    no_stdin: bool,

    /// Command and arguments; joined with spaces like ssh does.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

impl RunArgs {
    /// The remote command line; empty means a login shell.
    pub(crate) fn command_line(&self) -> String {
        self.command.join(" ")
    }

    /// Whether a pty was requested.
    pub(crate) const fn tty(&self) -> bool {
        self.tty
    }

    pub(crate) async fn run(self) -> Result<()> {
        let command = self.command_line();
        let mut session = Session::new(&self.control.control_path);

        // Our own descriptors go to the master as is; no local relaying.
        if !self.no_stdin {
            session.set_stdin(Input::fd(dup(io::stdin().as_fd())?));
        }
        session
            .set_stdout(Output::fd(dup(io::stdout().as_fd())?))
            .set_stderr(Output::fd(dup(io::stderr().as_fd())?));
        if self.tty() {
            session.request_pty(self.term)?;
        }

        let started = if command.is_empty() {
            session.shell().await
        } else {
            session.start(&command).await
        };
        let outcome = match started {
            Ok(()) => session.wait().await,
            Err(e) => Err(e),
        };

        if let Some(state) = session.take_terminal_state()
            && let Err(e) = state.restore()
        {
            tracing::warn!(error = %e, "failed to restore terminal");
        }

        outcome.with_context(|| match session.session_id() {
            Some(id) => format!("session {id} via {}", self.control.control_path.display()),
            None => format!("open session via {}", self.control.control_path.display()),
        })
    }
}

/// Duplicates one of our standard descriptors for the master.
fn dup(fd: std::os::fd::BorrowedFd<'_>) -> Result<OwnedFd> {
    fd.try_clone_to_owned().context("duplicate stdio descriptor")
}
