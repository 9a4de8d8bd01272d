//! Caller-supplied standard streams for a session.
//!
//! A stream is either an async byte stream, relayed through a local pipe
//! by a copy task, or a native descriptor handed to the master as is.

use std::fmt;
use std::io;
use std::os::fd::OwnedFd;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite};

/// Boxed reader feeding the remote command's stdin.
pub(crate) type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
/// Boxed writer receiving the remote command's stdout or stderr.
pub(crate) type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Source for the remote command's standard input.
#[non_exhaustive]
pub enum Input {
    /// Bytes are copied from this reader into a relay pipe.
    Reader(BoxReader),
    /// This descriptor is passed to the master directly.
    Fd(OwnedFd),
}

impl Input {
    /// Relays input from an async reader.
    pub fn reader(r: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self::Reader(Box::new(r))
    }

    /// Passes a native descriptor (file, pipe, terminal) to the master.
    pub fn fd(fd: impl Into<OwnedFd>) -> Self {
        Self::Fd(fd.into())
    }

    /// Whether this input is a native descriptor.
    pub(crate) const fn is_native(&self) -> bool {
        matches!(self, Self::Fd(_))
    }

    /// Splits off the native descriptor, if this input has one.
    pub(crate) fn into_native(self) -> Result<OwnedFd, BoxReader> {
        match self {
            Self::Fd(fd) => Ok(fd),
            Self::Reader(r) => Err(r),
        }
    }
}

impl fmt::Debug for Input {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reader(_) => f.write_str("Input::Reader(..)"),
            Self::Fd(fd) => f.debug_tuple("Input::Fd").field(fd).finish(),
        }
    }
}

/// Sink for the remote command's standard output or error.
#[non_exhaustive]
pub enum Output {
    /// Bytes read from a relay pipe are written to this writer.
    Writer(BoxWriter),
    /// This descriptor is passed to the master directly.
    Fd(OwnedFd),
}

impl Output {
    /// Relays output into an async writer.
    pub fn writer(w: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self::Writer(Box::new(w))
    }

    /// Passes a native descriptor (file, pipe, terminal) to the master.
    pub fn fd(fd: impl Into<OwnedFd>) -> Self {
        Self::Fd(fd.into())
    }

    /// Whether this output is a native descriptor.
    pub(crate) const fn is_native(&self) -> bool {
        matches!(self, Self::Fd(_))
    }

    /// Splits off the native descriptor, if this output has one.
    pub(crate) fn into_native(self) -> Result<OwnedFd, BoxWriter> {
        match self {
            Self::Fd(fd) => Ok(fd),
            Self::Writer(w) => Err(w),
        }
    }
}

impl fmt::Debug for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Writer(_) => f.write_str("Output::Writer(..)"),
            Self::Fd(fd) => f.debug_tuple("Output::Fd").field(fd).finish(),
        }
    }
}

impl From<SharedBuffer> for Output {
    fn from(buf: SharedBuffer) -> Self {
        Self::writer(buf)
    }
}

/// In-memory sink that several copy tasks may write into at once.
///
/// Each write appends under a lock held for that write only, so
/// concurrent writers interleave whole chunks and never lose bytes.
/// Clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer {
    /// Captured bytes.
    inner: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the bytes captured so far.
    pub fn contents(&self) -> Vec<u8> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Takes the captured bytes, leaving the buffer empty.
    pub fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.inner.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl AsyncWrite for SharedBuffer {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
