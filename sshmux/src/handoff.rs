//! Descriptor hand-off: the three stdio descriptors passed to the master.
//!
//! For each stream the master receives one "remote" descriptor. It is
//! either a descriptor the caller supplied, or one end of a relay pipe
//! whose other end stays local for a copy task (or for the caller, after
//! a pipe accessor).

#![allow(unsafe_code)]

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use tokio::io::Interest;
use tokio::net::UnixStream;

use crate::stdio::{BoxReader, BoxWriter, Input, Output};

/// Descriptor given to the master for one stream.
#[derive(Debug)]
pub(crate) enum Remote {
    /// Our end of a relay pipe; closed locally once the session is open.
    Relay(OwnedFd),
    /// Left behind by a pipe accessor; also closed once the session is open.
    Accessor(OwnedFd),
    /// Supplied by the caller; kept open for the session's lifetime.
    Caller(OwnedFd),
}

impl Remote {
    /// The descriptor to pass.
    pub(crate) fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            Self::Relay(fd) | Self::Accessor(fd) | Self::Caller(fd) => fd.as_fd(),
        }
    }

    /// Drops pipe ends and keeps caller descriptors.
    pub(crate) fn release(self) -> Option<OwnedFd> {
        match self {
            Self::Relay(_) | Self::Accessor(_) => None,
            Self::Caller(fd) => Some(fd),
        }
    }
}

/// Local end of a relay pipe plus the caller's stream it is copied to/from.
///
/// `user` is `None` when the caller supplied nothing: empty input, or
/// discarded output.
#[derive(Debug)]
pub(crate) struct Relay<S> {
    /// Local pipe end the copy task reads or writes.
    pub(crate) local: OwnedFd,
    /// Caller stream on the other side of the copy.
    pub(crate) user: Option<S>,
}

/// How one stream is wired for the session.
#[derive(Debug)]
pub(crate) struct Endpoint<S> {
    /// Descriptor for the master.
    pub(crate) remote: Remote,
    /// Copy work for the orchestrator; `None` if nothing needs copying.
    pub(crate) relay: Option<Relay<S>>,
}

impl<S> Endpoint<S> {
    /// Passes `remote` with nothing to copy.
    const fn direct(remote: Remote) -> Self {
        Self {
            remote,
            relay: None,
        }
    }

    /// Puts the accessor end or the caller's stream back where it was
    /// taken from; a fresh relay pipe is closed.
    pub(crate) fn unwire<U>(
        self,
        accessor: &mut Option<OwnedFd>,
        user: &mut Option<U>,
        native: impl FnOnce(OwnedFd) -> U,
        stream: impl FnOnce(S) -> U,
    ) {
        match self.remote {
            Remote::Accessor(fd) => *accessor = Some(fd),
            Remote::Caller(fd) => *user = Some(native(fd)),
            Remote::Relay(_) => *user = self.relay.and_then(|r| r.user).map(stream),
        }
    }
}

/// Wires the stdin stream, taking from `accessor` and `user` only on
/// success.
///
/// `accessor` is the remote end kept by a prior pipe accessor call; the
/// caller owns the local end, so no relay is needed.
pub(crate) fn stdin(
    accessor: &mut Option<OwnedFd>,
    user: &mut Option<Input>,
) -> io::Result<Endpoint<BoxReader>> {
    if let Some(fd) = accessor.take() {
        return Ok(Endpoint::direct(Remote::Accessor(fd)));
    }
    if let Some(Ok(fd)) = user.take_if(|u| u.is_native()).map(Input::into_native) {
        return Ok(Endpoint::direct(Remote::Caller(fd)));
    }
    let (read, write) = pipe()?;
    let user = user.take().and_then(|u| u.into_native().err());
    Ok(Endpoint {
        remote: Remote::Relay(read),
        relay: Some(Relay { local: write, user }),
    })
}

/// Wires the stdout or stderr stream; see [`stdin`].
pub(crate) fn output(
    accessor: &mut Option<OwnedFd>,
    user: &mut Option<Output>,
) -> io::Result<Endpoint<BoxWriter>> {
    if let Some(fd) = accessor.take() {
        return Ok(Endpoint::direct(Remote::Accessor(fd)));
    }
    if let Some(Ok(fd)) = user.take_if(|u| u.is_native()).map(Output::into_native) {
        return Ok(Endpoint::direct(Remote::Caller(fd)));
    }
    let (read, write) = pipe()?;
    let user = user.take().and_then(|u| u.into_native().err());
    Ok(Endpoint {
        remote: Remote::Relay(write),
        relay: Some(Relay { local: read, user }),
    })
}

/// Creates a pipe pair `(read, write)`, both ends `FD_CLOEXEC`.
pub(crate) fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds: [RawFd; 2] = [0; 2];

    // SAFETY: pipe2() is a standard Linux call; fds is a valid 2-element array.
    #[cfg(any(target_os = "linux", target_os = "android"))]
    let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    // SAFETY: pipe() is a standard POSIX call; fds is a valid 2-element array.
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: both FDs are valid after a successful pipe call.
    let read_fd = unsafe { OwnedFd::from_raw_fd(fds[0]) };
    let write_fd = unsafe { OwnedFd::from_raw_fd(fds[1]) };

    // No pipe2 here; a fork between the two calls can still leak these.
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        set_cloexec(&read_fd)?;
        set_cloexec(&write_fd)?;
    }
    Ok((read_fd, write_fd))
}

/// Sets `FD_CLOEXEC` on a file descriptor.
#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn set_cloexec(fd: &OwnedFd) -> io::Result<()> {
    // SAFETY: fcntl(F_SETFD) only touches descriptor flags and the FD is valid.
    let ret = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC) };
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Passes `fds` to the peer, in order, as `SCM_RIGHTS` ancillary data.
///
/// The master receives descriptors one at a time, each riding on a single
/// dummy byte, so every descriptor goes out in its own `sendmsg`.
pub(crate) async fn send(stream: &UnixStream, fds: &[BorrowedFd<'_>]) -> io::Result<()> {
    for fd in fds {
        stream
            .async_io(Interest::WRITABLE, || send_one(stream.as_raw_fd(), *fd))
            .await?;
    }
    Ok(())
}

/// Size of one descriptor in a control message.
#[allow(clippy::cast_possible_truncation)]
const FD_SIZE: u32 = size_of::<libc::c_int>() as u32;

/// Sends one dummy byte carrying `fd` over `sock`.
fn send_one(sock: RawFd, fd: BorrowedFd<'_>) -> io::Result<()> {
    // SAFETY: CMSG_SPACE is a pure size computation.
    let cmsg_space = unsafe { libc::CMSG_SPACE(FD_SIZE) };
    let mut cmsg_buf = vec![0u8; cmsg_space as usize];

    let mut byte = [0u8; 1];
    let mut iov = libc::iovec {
        iov_base: byte.as_mut_ptr().cast(),
        iov_len: byte.len(),
    };

    // SAFETY: msghdr is plain old data; all-zero is a valid empty header.
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &raw mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr().cast();
    msg.msg_controllen = cmsg_space as _;

    // SAFETY: msg_control points at a buffer of CMSG_SPACE(sizeof(int))
    // bytes, so the first header and its data slot are in bounds.
    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&raw const msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(FD_SIZE) as _;
        std::ptr::write_unaligned(libc::CMSG_DATA(cmsg).cast::<libc::c_int>(), fd.as_raw_fd());
    }

    // SAFETY: msg and everything it points to outlive the call.
    let n = unsafe { libc::sendmsg(sock, &raw const msg, 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
