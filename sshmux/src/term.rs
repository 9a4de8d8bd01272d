//! Raw-mode switching for the terminal handed to the master.

use std::io::IsTerminal;
use std::os::fd::{BorrowedFd, OwnedFd};

use nix::sys::termios::{self, SetArg, Termios};

/// Terminal settings saved before switching to raw mode.
///
/// Restoring is the caller's job: call [`restore`](Self::restore) once the
/// remote session is over.
#[derive(Debug)]
pub struct TerminalState {
    /// Duplicate of the terminal descriptor, kept open for the restore.
    fd: OwnedFd,
    /// Settings in effect before raw mode.
    saved: Termios,
}

impl TerminalState {
    /// Puts back the settings saved by [`make_raw`].
    pub fn restore(&self) -> nix::Result<()> {
        termios::tcsetattr(&self.fd, SetArg::TCSANOW, &self.saved)
    }
}

/// Switches `fd` to raw mode and returns a token that restores it.
///
/// Returns `Ok(None)` when `fd` is not a terminal; pipes and files have
/// no line discipline to change.
pub(crate) fn make_raw(fd: BorrowedFd<'_>) -> nix::Result<Option<TerminalState>> {
    if !fd.is_terminal() {
        return Ok(None);
    }
    let owned = fd
        .try_clone_to_owned()
        .map_err(|e| nix::Error::from_raw(e.raw_os_error().unwrap_or(libc::EBADF)))?;
    let saved = termios::tcgetattr(&owned)?;
    let mut raw = saved.clone();
    termios::cfmakeraw(&mut raw);
    termios::tcsetattr(&owned, SetArg::TCSANOW, &raw)?;
    Ok(Some(TerminalState { fd: owned, saved }))
}
