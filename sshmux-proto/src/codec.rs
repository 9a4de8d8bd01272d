//! Length-prefixed packet transport over any async byte stream.
//!
//! Each packet is: `[u32 big-endian length][payload]`. No upper bound is
//! placed on the length; the master is trusted to send sane frames.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Prepends the 4-byte big-endian length to `payload`.
pub fn frame(payload: &[u8]) -> io::Result<Vec<u8>> {
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "packet exceeds u32::MAX"))?;
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Writes `payload` as one framed packet.
///
/// Header and payload go out in a single buffer so a packet is never
/// interleaved with other writes on the same stream.
pub async fn write_packet<W: AsyncWrite + Unpin + ?Sized>(w: &mut W, payload: &[u8]) -> io::Result<()> {
    let buf = frame(payload)?;
    w.write_all(&buf).await?;
    w.flush().await
}

/// Reads one framed packet and returns its payload.
///
/// A stream that ends before the first header byte yields
/// [`io::ErrorKind::UnexpectedEof`]; one that ends inside a packet yields
/// [`io::ErrorKind::InvalidData`] (truncated frame).
pub async fn read_packet<R: AsyncRead + Unpin + ?Sized>(r: &mut R) -> io::Result<Vec<u8>> {
    let mut header = [0u8; 4];
    let n = r.read(&mut header).await?;
    if n == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed",
        ));
    }
    r.read_exact(&mut header[n..]).await.map_err(truncated)?;

    let len = u32::from_be_bytes(header) as usize;
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload).await.map_err(truncated)?;
    Ok(payload)
}

/// Maps an EOF in the middle of a packet to a truncated-frame error.
fn truncated(e: io::Error) -> io::Error {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        io::Error::new(io::ErrorKind::InvalidData, "truncated packet")
    } else {
        e
    }
}
