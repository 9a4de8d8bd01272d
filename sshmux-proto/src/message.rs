//! Mux message shapes exchanged over the control socket.
//!
//! Type codes follow OpenSSH `mux.c`: client requests live in the
//! `0x1000_xxxx` range, master replies and notifications in `0x8000_xxxx`.

use crate::field::{DecodeError, Decoder, Encoder};

/// Protocol version spoken by this client. Only version 4 is supported.
pub const MUX_VERSION: u32 = 4;

/// Message type codes.
pub mod kind {
    /// Greeting, sent by both sides.
    pub const HELLO: u32 = 0x0000_0001;
    /// Client request: open a new session.
    pub const NEW_SESSION: u32 = 0x1000_0002;
    /// Client request: is the master alive?
    pub const ALIVE_CHECK: u32 = 0x1000_0004;

    /// Master reply: request refused by policy.
    pub const PERMISSION_DENIED: u32 = 0x8000_0002;
    /// Master reply: request failed.
    pub const FAILURE: u32 = 0x8000_0003;
    /// Master notification: remote command exited.
    pub const EXIT_MESSAGE: u32 = 0x8000_0004;
    /// Master reply to [`ALIVE_CHECK`].
    pub const IS_ALIVE: u32 = 0x8000_0005;
    /// Master reply to [`NEW_SESSION`].
    pub const SESSION_OPENED: u32 = 0x8000_0006;
    /// Master notification: pty allocation failed.
    pub const TTY_ALLOC_FAIL: u32 = 0x8000_0008;

    /// Human-readable name of a type code, for diagnostics.
    pub const fn name(kind: u32) -> &'static str {
        match kind {
            HELLO => "Hello",
            NEW_SESSION => "NewSession",
            ALIVE_CHECK => "AliveCheck",
            PERMISSION_DENIED => "PermissionDenied",
            FAILURE => "Failure",
            EXIT_MESSAGE => "ExitMessage",
            IS_ALIVE => "IsAlive",
            SESSION_OPENED => "SessionOpened",
            TTY_ALLOC_FAIL => "TtyAllocFail",
            _ => "unknown",
        }
    }
}

/// Escape character value that disables escape processing.
pub const ESCAPE_DISABLED: u32 = 0xffff_ffff;

/// Greeting `{Hello, version}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hello {
    /// Protocol version.
    pub version: u32,
}

impl Hello {
    /// The greeting this client sends back to the master.
    pub const CURRENT: Self = Self {
        version: MUX_VERSION,
    };

    /// Encodes `{Hello, version}`.
    pub fn encode(&self) -> Vec<u8> {
        Encoder::new()
            .put_u32(kind::HELLO)
            .put_u32(self.version)
            .finish()
    }
}

/// Liveness probe `{AliveCheck, request_id}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AliveCheck {
    /// Request id echoed by the master's reply.
    pub request_id: u32,
}

impl AliveCheck {
    /// Encodes the request.
    pub fn encode(&self) -> Vec<u8> {
        Encoder::new()
            .put_u32(kind::ALIVE_CHECK)
            .put_u32(self.request_id)
            .finish()
    }
}

/// Request to open a new session running `command`.
///
/// X11 and agent forwarding and the subsystem flag are always off; the
/// escape character is always disabled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSession {
    /// Request id echoed by the SessionOpened reply.
    pub request_id: u32,
    /// Terminal type; a non-empty value requests a pty.
    pub term: String,
    /// Remote command; empty starts a login shell.
    pub command: String,
}

impl NewSession {
    /// Encodes the request in the field order the master expects.
    pub fn encode(&self) -> Vec<u8> {
        let want_tty = u32::from(!self.term.is_empty());
        Encoder::new()
            .put_u32(kind::NEW_SESSION)
            .put_u32(self.request_id)
            .put_str("") // reserved
            .put_u32(want_tty)
            .put_u32(0) // forward X11
            .put_u32(0) // forward agent
            .put_u32(0) // subsystem
            .put_u32(ESCAPE_DISABLED)
            .put_str(&self.term)
            .put_str(&self.command)
            .finish()
    }
}

/// Any message the master sends to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Reply {
    /// Greeting. Extension pairs after the version are ignored.
    Hello {
        /// Master protocol version.
        version: u32,
    },
    /// Reply to an alive check.
    IsAlive {
        /// Echoed request id.
        request_id: u32,
        /// Process id of the master.
        pid: u32,
    },
    /// Reply to a new-session request.
    SessionOpened {
        /// Echoed request id.
        request_id: u32,
        /// Id assigned to the new session.
        session_id: u32,
    },
    /// The remote command exited.
    ExitMessage {
        /// Session the status belongs to.
        session_id: u32,
        /// Exit status of the remote command.
        status: u32,
    },
    /// The master could not allocate a pty for the session.
    TtyAllocFail {
        /// Session the failure belongs to.
        session_id: u32,
    },
    /// The master refused a request.
    PermissionDenied {
        /// Echoed request id.
        request_id: u32,
        /// Reason given by the master.
        reason: String,
    },
    /// A request failed on the master.
    Failure {
        /// Echoed request id.
        request_id: u32,
        /// Reason given by the master.
        reason: String,
    },
    /// A type code this client does not understand; the body is skipped.
    Unknown(u32),
}

impl Reply {
    /// Decodes a master message from a packet payload.
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let mut d = Decoder::new(payload);
        let reply = match d.get_u32()? {
            kind::HELLO => Self::Hello {
                version: d.get_u32()?,
            },
            kind::IS_ALIVE => Self::IsAlive {
                request_id: d.get_u32()?,
                pid: d.get_u32()?,
            },
            kind::SESSION_OPENED => Self::SessionOpened {
                request_id: d.get_u32()?,
                session_id: d.get_u32()?,
            },
            kind::EXIT_MESSAGE => Self::ExitMessage {
                session_id: d.get_u32()?,
                status: d.get_u32()?,
            },
            kind::TTY_ALLOC_FAIL => Self::TtyAllocFail {
                session_id: d.get_u32()?,
            },
            kind::PERMISSION_DENIED => Self::PermissionDenied {
                request_id: d.get_u32()?,
                reason: d.get_str()?.to_owned(),
            },
            kind::FAILURE => Self::Failure {
                request_id: d.get_u32()?,
                reason: d.get_str()?.to_owned(),
            },
            other => Self::Unknown(other),
        };
        Ok(reply)
    }

    /// The type code this reply was decoded from.
    pub const fn kind(&self) -> u32 {
        match self {
            Self::Hello { .. } => kind::HELLO,
            Self::IsAlive { .. } => kind::IS_ALIVE,
            Self::SessionOpened { .. } => kind::SESSION_OPENED,
            Self::ExitMessage { .. } => kind::EXIT_MESSAGE,
            Self::TtyAllocFail { .. } => kind::TTY_ALLOC_FAIL,
            Self::PermissionDenied { .. } => kind::PERMISSION_DENIED,
            Self::Failure { .. } => kind::FAILURE,
            Self::Unknown(k) => *k,
        }
    }
}
