//! Exit outcome of a remote command.

use std::fmt;

/// Exit information for a remote command, as reported by the master.
///
/// `exit_status() == -1` means no exit status was received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Waitmsg {
    /// Exit status, `-1` until the master reports one.
    status: i64,
    /// Terminating signal name, if killed by a signal.
    signal: String,
    /// Diagnostic message collected while waiting.
    message: String,
    /// RFC 3066 language tag of `message`.
    lang: String,
}

impl Default for Waitmsg {
    fn default() -> Self {
        Self {
            status: -1,
            signal: String::new(),
            message: String::new(),
            lang: String::new(),
        }
    }
}

impl Waitmsg {
    /// Exit status of the remote command, or `-1` if none was received.
    pub const fn exit_status(&self) -> i64 {
        self.status
    }

    /// Signal that terminated the remote command, if any.
    pub fn signal(&self) -> &str {
        &self.signal
    }

    /// Diagnostic message, e.g. a pty allocation failure.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Language tag of [`message`](Self::message).
    pub fn lang(&self) -> &str {
        &self.lang
    }

    /// Whether an exit status has been recorded.
    pub const fn has_status(&self) -> bool {
        self.status != -1
    }

    /// Records the exit status reported by the master.
    pub(crate) fn set_status(&mut self, status: u32) {
        self.status = i64::from(status);
    }

    /// Records a diagnostic message.
    pub(crate) fn set_message(&mut self, message: impl Into<String>) {
        self.message = message.into();
    }

    /// Maps the outcome to `Wait`'s result: success only for status 0.
    pub(crate) fn into_result(self) -> crate::Result<()> {
        match self.status {
            0 => Ok(()),
            -1 => Err(crate::Error::ExitMissing),
            _ => Err(ExitError { waitmsg: self }.into()),
        }
    }
}

impl fmt::Display for Waitmsg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Process exited with status {}", self.status)?;
        if !self.signal.is_empty() {
            write!(f, " from signal {}", self.signal)?;
        }
        if !self.message.is_empty() {
            write!(f, ". Reason was: {}", self.message)?;
        }
        Ok(())
    }
}

/// Unsuccessful completion of a remote command.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{waitmsg}")]
pub struct ExitError {
    /// The decoded exit outcome.
    waitmsg: Waitmsg,
}

impl ExitError {
    /// The decoded exit outcome.
    pub const fn waitmsg(&self) -> &Waitmsg {
        &self.waitmsg
    }

    /// Exit status of the remote command.
    pub const fn exit_status(&self) -> i64 {
        self.waitmsg.status
    }
}
