//! Session-open sequence over a fresh control connection.
//!
//! Hello → AliveCheck → NewSession → descriptor hand-off → SessionOpened.
//! Every step is strictly request/reply; any deviation aborts the whole
//! sequence, since framing cannot be resynchronized afterwards.

use std::os::fd::BorrowedFd;
use std::path::Path;

use sshmux_proto::{AliveCheck, Hello, MUX_VERSION, NewSession, Reply, kind};

use crate::conn::ControlConn;
use crate::error::{Error, ProtocolError, Result};

/// Ids learned while opening a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Opened {
    /// Id the master assigned to the session.
    pub(crate) session_id: u32,
    /// Process id of the master.
    pub(crate) master_pid: u32,
}

/// Drives the request/reply steps on one connection.
#[derive(Debug)]
pub(crate) struct Handshake<'a> {
    /// Connection the steps run on.
    conn: &'a mut ControlConn,
    /// Id for the next request; advanced after each matched reply.
    request_id: &'a mut u32,
}

impl<'a> Handshake<'a> {
    /// Starts a handshake; `request_id` is the session's request counter.
    pub(crate) const fn new(conn: &'a mut ControlConn, request_id: &'a mut u32) -> Self {
        Self { conn, request_id }
    }

    /// Waits for the master's greeting and answers it.
    pub(crate) async fn hello(&mut self) -> Result<()> {
        match self.recv("read hello").await? {
            Reply::Hello {
                version: MUX_VERSION,
            } => {}
            Reply::Hello { version } => {
                return Err(ProtocolError::IncompatibleHello {
                    kind: kind::HELLO,
                    version,
                }
                .into());
            }
            other => {
                return Err(ProtocolError::IncompatibleHello {
                    kind: other.kind(),
                    version: 0,
                }
                .into());
            }
        }
        self.send(&Hello::CURRENT.encode(), "send hello").await?;
        tracing::debug!(version = MUX_VERSION, "mux hello exchanged");
        Ok(())
    }

    /// Checks the master is alive; returns its pid.
    pub(crate) async fn alive_check(&mut self) -> Result<u32> {
        let request_id = *self.request_id;
        self.send(&AliveCheck { request_id }.encode(), "send alive check")
            .await?;
        match self.recv("read alive reply").await? {
            Reply::IsAlive {
                request_id: echoed,
                pid,
            } => {
                expect_request_id(request_id, echoed)?;
                *self.request_id += 1;
                tracing::debug!(pid, "master alive");
                Ok(pid)
            }
            other => Err(unexpected("AliveCheck", "IsAlive", other)),
        }
    }

    /// Sends the new-session request with the current request id.
    pub(crate) async fn new_session(&mut self, term: &str, command: &str) -> Result<()> {
        let msg = NewSession {
            request_id: *self.request_id,
            term: term.to_owned(),
            command: command.to_owned(),
        };
        self.send(&msg.encode(), "send new session").await
    }

    /// Passes stdin/stdout/stderr and waits for the session to open.
    ///
    /// Returns the session id assigned by the master.
    pub(crate) async fn hand_off(&mut self, fds: &[BorrowedFd<'_>; 3]) -> Result<u32> {
        self.conn
            .send_fds(fds)
            .await
            .map_err(|e| Error::transport("pass descriptors", e))?;

        let request_id = *self.request_id;
        match self.recv("read session-opened reply").await? {
            Reply::SessionOpened {
                request_id: echoed,
                session_id,
            } => {
                expect_request_id(request_id, echoed)?;
                *self.request_id += 1;
                tracing::debug!(session_id, "session opened");
                Ok(session_id)
            }
            other => Err(unexpected("NewSession", "SessionOpened", other)),
        }
    }

    /// Reads and decodes the next reply.
    async fn recv(&mut self, context: &'static str) -> Result<Reply> {
        let payload = self
            .conn
            .read_packet()
            .await
            .map_err(|e| Error::transport(context, e))?;
        Ok(Reply::decode(&payload)?)
    }

    /// Writes one request packet.
    async fn send(&mut self, payload: &[u8], context: &'static str) -> Result<()> {
        self.conn
            .write_packet(payload)
            .await
            .map_err(|e| Error::transport(context, e))
    }
}

/// Runs the full open sequence and returns the assigned ids.
///
/// `fds` are the remote-side stdin, stdout and stderr, in that order.
pub(crate) async fn open_session(
    conn: &mut ControlConn,
    request_id: &mut u32,
    term: &str,
    command: &str,
    fds: &[BorrowedFd<'_>; 3],
) -> Result<Opened> {
    let mut hs = Handshake::new(conn, request_id);
    hs.hello().await?;
    let master_pid = hs.alive_check().await?;
    hs.new_session(term, command).await?;
    let session_id = hs.hand_off(fds).await?;
    Ok(Opened {
        session_id,
        master_pid,
    })
}

/// Checks that a master is listening on `path` and returns its pid.
///
/// Performs Hello and AliveCheck on a fresh connection, then hangs up;
/// the `ssh -O check` of this crate.
pub async fn check(path: impl AsRef<Path>) -> Result<u32> {
    let mut conn = ControlConn::connect(path.as_ref()).await?;
    let mut request_id = 0;
    let mut hs = Handshake::new(&mut conn, &mut request_id);
    hs.hello().await?;
    hs.alive_check().await
}

/// Fails unless the reply echoes the request id just sent.
fn expect_request_id(expected: u32, got: u32) -> Result<()> {
    if expected == got {
        Ok(())
    } else {
        Err(ProtocolError::RequestIdMismatch { expected, got }.into())
    }
}

/// Maps an unexpected reply to an error, keeping the master's reason for refusals.
fn unexpected(request: &'static str, expected: &'static str, reply: Reply) -> Error {
    match reply {
        Reply::Failure { reason, .. } | Reply::PermissionDenied { reason, .. } => {
            Error::Refused { request, reason }
        }
        other => ProtocolError::UnexpectedMessage {
            expected,
            got: other.kind(),
        }
        .into(),
    }
}
