//! Exit-status reader: consumes notifications after the session opens.

use std::io;

use sshmux_proto::Reply;

use crate::conn::ControlConn;
use crate::error::{Error, ProtocolError, Result};
use crate::waitmsg::Waitmsg;

/// Message recorded when the master could not allocate a pty.
const TTY_ALLOC_FAILED: &str = "pseudo-terminal allocation failed";

/// Reads notifications for `session_id` until the exit status arrives or
/// the master hangs up.
///
/// A clean hang-up before any exit status yields a [`Waitmsg`] with status
/// `-1`. The connection is dropped on return.
pub(crate) async fn read_exit(mut conn: ControlConn, session_id: u32) -> Result<Waitmsg> {
    let mut waitmsg = Waitmsg::default();
    loop {
        let payload = match conn.read_packet().await {
            Ok(p) => p,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                tracing::debug!(session_id, "control connection closed by master");
                break;
            }
            Err(e) => return Err(Error::transport("read exit status", e)),
        };

        match Reply::decode(&payload)? {
            Reply::TtyAllocFail { session_id: sid } => {
                expect_session(session_id, sid)?;
                tracing::warn!(session_id, "{TTY_ALLOC_FAILED}");
                waitmsg.set_message(TTY_ALLOC_FAILED);
            }
            Reply::ExitMessage {
                session_id: sid,
                status,
            } => {
                expect_session(session_id, sid)?;
                tracing::debug!(session_id, status, "remote command exited");
                waitmsg.set_status(status);
                break;
            }
            other => {
                return Err(ProtocolError::UnexpectedMessage {
                    expected: "ExitMessage",
                    got: other.kind(),
                }
                .into());
            }
        }
    }
    Ok(waitmsg)
}

/// Fails unless a notification names our session.
fn expect_session(expected: u32, got: u32) -> Result<()> {
    if expected == got {
        Ok(())
    } else {
        Err(ProtocolError::SessionIdMismatch { expected, got }.into())
    }
}
