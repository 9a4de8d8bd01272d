//! Client for OpenSSH ControlMaster multiplexing.
//!
//! `sshmux` runs remote commands through an `ssh` process that is already
//! authenticated and listening on a control socket (`ControlMaster` /
//! `ControlPath` in `ssh_config`). No keys, no new TCP connection: each
//! [`Session`] opens a fresh connection to the socket, speaks mux protocol
//! version 4, and hands its standard streams to the master as file
//! descriptors.
//!
//! # Quick start
//!
//! ```no_run
//! use sshmux::Session;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let mut session = Session::new("/tmp/ssh-control-example.sock");
//! let out = session.output("uname -a").await?;
//! println!("{}", String::from_utf8_lossy(&out));
//! # Ok(())
//! # }
//! ```
//!
//! # Streams
//!
//! Each stream is either an async reader/writer ([`Input::reader`],
//! [`Output::writer`]), relayed through a local pipe by a background
//! task, or a native descriptor ([`Input::fd`], [`Output::fd`]) passed to
//! the master untouched. The `*_pipe` accessors hand the caller the local
//! end of a relay pipe instead.
//!
//! Everything runs on the ambient Tokio runtime.

#![cfg(unix)]

mod conn;
mod copy;
mod error;
mod exit;
mod handoff;
mod handshake;
mod session;
mod stdio;
mod teardown;
mod term;
mod waitmsg;

pub use error::{Error, OutputError, ProtocolError, Result, Stream};
pub use handshake::check;
pub use session::Session;
pub use stdio::{Input, Output, SharedBuffer};
pub use teardown::Closer;
pub use term::TerminalState;
pub use waitmsg::{ExitError, Waitmsg};
