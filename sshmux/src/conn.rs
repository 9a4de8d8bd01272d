//! Control connection to the master's Unix socket.

use std::io;
use std::os::fd::BorrowedFd;
use std::path::Path;

use tokio::net::UnixStream;

use crate::error::{Error, Result};
use crate::handoff;

/// One connection to the master, carrying framed mux packets.
///
/// Used by exactly one party at a time: the handshake first, then the
/// exit-status reader.
#[derive(Debug)]
pub(crate) struct ControlConn {
    /// The connected socket.
    stream: UnixStream,
}

impl ControlConn {
    /// Connects to the control socket at `path`.
    pub(crate) async fn connect(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path).await.map_err(|source| Error::Connect {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "connected to control socket");
        Ok(Self { stream })
    }

    /// Wraps an already connected stream.
    #[cfg(test)]
    pub(crate) const fn from_stream(stream: UnixStream) -> Self {
        Self { stream }
    }

    /// Reads the next packet payload.
    pub(crate) async fn read_packet(&mut self) -> io::Result<Vec<u8>> {
        let payload = sshmux_proto::read_packet(&mut self.stream).await?;
        tracing::trace!(len = payload.len(), "packet received");
        Ok(payload)
    }

    /// Writes one packet.
    pub(crate) async fn write_packet(&mut self, payload: &[u8]) -> io::Result<()> {
        tracing::trace!(len = payload.len(), "packet sent");
        sshmux_proto::write_packet(&mut self.stream, payload).await
    }

    /// Passes descriptors to the master as ancillary data.
    pub(crate) async fn send_fds(&self, fds: &[BorrowedFd<'_>]) -> io::Result<()> {
        handoff::send(&self.stream, fds).await
    }
}
