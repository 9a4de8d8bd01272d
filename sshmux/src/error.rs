//! Error types for sshmux operations.

use std::fmt;
use std::io;
use std::path::PathBuf;

use sshmux_proto::DecodeError;

use crate::waitmsg::ExitError;

/// Alias for `Result<T, sshmux::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// One of the three standard streams of the remote command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Stream {
    /// Standard input.
    Stdin,
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Stdin => "stdin",
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        })
    }
}

/// Errors returned by session operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// `start`, `shell` or `run` was called on a session that already started.
    #[error("session already started")]
    AlreadyStarted,

    /// `wait` was called before the session started.
    #[error("session not started")]
    NotStarted,

    /// `wait` was called after the session finished.
    #[error("session already finished")]
    Finished,

    /// The stream was already assigned by the caller.
    #[error("{0} already set")]
    StreamAlreadySet(Stream),

    /// A pipe accessor was called after the session started.
    #[error("{0} pipe requested after session started")]
    PipeAfterStart(Stream),

    /// The control socket could not be reached.
    #[error("connect to control socket {}: {source}", path.display())]
    Connect {
        /// Control path that was dialed.
        path: PathBuf,
        /// Underlying socket error.
        source: io::Error,
    },

    /// Reading from or writing to the control socket failed.
    #[error("control socket {context}: {source}")]
    Transport {
        /// What the client was doing when the socket failed.
        context: &'static str,
        /// Underlying socket error.
        source: io::Error,
    },

    /// The master violated the mux protocol.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The master answered a request with a failure reply.
    #[error("master refused {request}: {reason}")]
    Refused {
        /// The request that was refused.
        request: &'static str,
        /// Reason given by the master.
        reason: String,
    },

    /// The remote command exited unsuccessfully.
    #[error(transparent)]
    Exit(#[from] ExitError),

    /// The master ended the session without reporting an exit status.
    #[error("remote command exited without exit status or exit signal")]
    ExitMissing,

    /// The session was closed before the remote command finished.
    #[error("session aborted")]
    Aborted,

    /// Switching the terminal to raw mode failed.
    #[error("terminal raw mode: {0}")]
    Terminal(#[source] nix::Error),

    /// Relaying one of the standard streams failed.
    #[error("{stream} copy: {source}")]
    Copy {
        /// The stream whose relay failed.
        stream: Stream,
        /// Underlying I/O error.
        source: io::Error,
    },

    /// Creating or adopting a local descriptor failed.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Violations of the mux protocol by the master.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ProtocolError {
    /// The master greeted with something other than `{Hello, 4}`.
    #[error("incompatible hello: type {kind:#x}, version {version}")]
    IncompatibleHello {
        /// Message type received.
        kind: u32,
        /// Version received (0 if the message was not a hello).
        version: u32,
    },

    /// A reply of the wrong type arrived.
    #[error("expected {expected}, got {} ({got:#x})", sshmux_proto::kind::name(*got))]
    UnexpectedMessage {
        /// Name of the expected message.
        expected: &'static str,
        /// Type code received.
        got: u32,
    },

    /// A reply echoed a different request id.
    #[error("out of sequence reply: expected request id {expected}, got {got}")]
    RequestIdMismatch {
        /// Request id that was sent.
        expected: u32,
        /// Request id echoed by the master.
        got: u32,
    },

    /// A notification named a different session.
    #[error("unknown session id: ours {expected}, theirs {got}")]
    SessionIdMismatch {
        /// Session id assigned at open.
        expected: u32,
        /// Session id in the notification.
        got: u32,
    },

    /// A packet could not be decoded.
    #[error("malformed packet: {0}")]
    Decode(#[from] DecodeError),
}

/// Failure of [`Session::output`](crate::Session::output) or
/// [`Session::combined_output`](crate::Session::combined_output).
///
/// Keeps whatever the remote command printed before things went wrong.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct OutputError {
    /// Why the run failed.
    error: Error,
    /// Bytes captured before the failure.
    output: Vec<u8>,
}

impl OutputError {
    pub(crate) const fn new(error: Error, output: Vec<u8>) -> Self {
        Self { error, output }
    }

    /// Why the run failed.
    pub const fn error(&self) -> &Error {
        &self.error
    }

    /// Bytes captured before the failure.
    pub fn output(&self) -> &[u8] {
        &self.output
    }

    /// Splits into the error and the captured bytes.
    pub fn into_parts(self) -> (Error, Vec<u8>) {
        (self.error, self.output)
    }
}

impl From<DecodeError> for Error {
    fn from(e: DecodeError) -> Self {
        Self::Protocol(ProtocolError::Decode(e))
    }
}

impl Error {
    /// Builds a transport error with the step that failed.
    pub(crate) fn transport(context: &'static str, source: io::Error) -> Self {
        Self::Transport { context, source }
    }

    /// Exit status of the remote command, if this error carries one.
    pub fn exit_status(&self) -> Option<i64> {
        match self {
            Self::Exit(e) => Some(e.exit_status()),
            _ => None,
        }
    }
}
