//! Scripted in-process stand-in for an OpenSSH control master.

#![allow(
    unsafe_code,
    dead_code,
    clippy::unwrap_used,
    clippy::missing_docs_in_private_items,
    missing_docs
)]

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;

use sshmux_proto::{Decoder, Encoder, kind};
use tempfile::TempDir;

/// Session id the fake master assigns.
pub const SESSION_ID: u32 = 9;

/// Output written by [`Script::Hang`] before the session opens.
pub const HANG_BANNER: &[u8] = b"started\n";

/// What the master does once a session request arrives.
#[derive(Debug, Clone, Copy)]
pub enum Script {
    /// Copies stdin to stdout, then exits 0.
    Cat,
    /// Writes to stdout and stderr, then exits with `status`.
    Print {
        out: &'static [u8],
        err: &'static [u8],
        status: u32,
    },
    /// Writes the received request fields to stdout, then exits 0.
    Describe,
    /// Reports a pty allocation failure, then exits with `status`.
    TtyFail { status: u32 },
    /// Reports an exit status for a different session.
    ForeignExit,
    /// Writes [`HANG_BANNER`], then holds the session open until the
    /// client hangs up.
    Hang,
    /// Hangs up after opening the session without an exit status.
    Vanish,
    /// Echoes a wrong request id in the alive reply.
    WrongRequestId,
    /// Hangs up instead of confirming the session.
    NoSessionOpened,
    /// Refuses the session with a failure reply.
    Refuse(&'static str),
    /// Acts as [`Script::NoSessionOpened`] on the first connection and as
    /// [`Script::Cat`] on every later one.
    Flaky,
    /// Writes `len` bytes to stdout and to stderr from two threads at
    /// once, then exits 0.
    Flood { len: usize },
}

/// Fields of a new-session request as the master saw them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub request_id: u32,
    pub tty: u32,
    pub escape: u32,
    pub term: String,
    pub command: String,
}

/// A listening fake master; the socket lives as long as this value.
pub struct FakeMaster {
    _dir: TempDir,
    path: PathBuf,
    requests: Arc<Mutex<Vec<Request>>>,
}

impl FakeMaster {
    /// Starts listening; every connection runs `script`.
    pub fn start(script: Script) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));

        let seen = Arc::clone(&requests);
        thread::spawn(move || {
            for (attempt, conn) in listener.incoming().enumerate() {
                let Ok(conn) = conn else { return };
                let seen = Arc::clone(&seen);
                let script = match script {
                    Script::Flaky if attempt == 0 => Script::NoSessionOpened,
                    Script::Flaky => Script::Cat,
                    other => other,
                };
                thread::spawn(move || {
                    let _ = serve(conn, script, &seen);
                });
            }
        });

        Self {
            _dir: dir,
            path,
            requests,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// New-session requests received so far.
    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }
}

fn serve(mut conn: UnixStream, script: Script, seen: &Mutex<Vec<Request>>) -> io::Result<()> {
    send(&mut conn, &words(&[kind::HELLO, 4]))?;
    let hello = recv(&mut conn)?;
    assert_eq!(hello, words(&[kind::HELLO, 4]), "client hello");

    let Some(alive) = recv_opt(&mut conn)? else {
        return Ok(());
    };
    let mut d = Decoder::new(&alive);
    assert_eq!(d.get_u32().unwrap(), kind::ALIVE_CHECK);
    let rid = d.get_u32().unwrap();
    let echoed = if matches!(script, Script::WrongRequestId) {
        rid + 7
    } else {
        rid
    };
    send(
        &mut conn,
        &words(&[kind::IS_ALIVE, echoed, std::process::id()]),
    )?;

    // A liveness probe hangs up here.
    let Some(new_session) = recv_opt(&mut conn)? else {
        return Ok(());
    };
    let request = parse_new_session(&new_session);
    seen.lock().unwrap().push(request.clone());

    let stdin = File::from(recv_fd(conn.as_raw_fd())?);
    let mut stdout = File::from(recv_fd(conn.as_raw_fd())?);
    let mut stderr = File::from(recv_fd(conn.as_raw_fd())?);

    match script {
        Script::NoSessionOpened => return Ok(()),
        Script::Refuse(reason) => {
            let reply = Encoder::new()
                .put_u32(kind::FAILURE)
                .put_u32(request.request_id)
                .put_str(reason)
                .finish();
            return send(&mut conn, &reply);
        }
        Script::Hang => stdout.write_all(HANG_BANNER)?,
        _ => {}
    }
    send(
        &mut conn,
        &words(&[kind::SESSION_OPENED, request.request_id, SESSION_ID]),
    )?;

    let status = match script {
        Script::Cat => {
            io::copy(&mut &stdin, &mut stdout)?;
            0
        }
        Script::Print { out, err, status } => {
            stdout.write_all(out)?;
            stderr.write_all(err)?;
            status
        }
        Script::Describe => {
            write!(
                stdout,
                "tty={} term={} cmd={}",
                request.tty, request.term, request.command
            )?;
            0
        }
        Script::TtyFail { status } => {
            send(&mut conn, &words(&[kind::TTY_ALLOC_FAIL, SESSION_ID]))?;
            status
        }
        Script::ForeignExit => {
            drop((stdin, stdout, stderr));
            return send(&mut conn, &words(&[kind::EXIT_MESSAGE, SESSION_ID + 1, 0]));
        }
        Script::Hang => {
            let mut buf = [0u8; 64];
            while conn.read(&mut buf)? > 0 {}
            return Ok(());
        }
        Script::Flood { len } => {
            let out = thread::spawn(move || stdout.write_all(&vec![b'o'; len]));
            stderr.write_all(&vec![b'e'; len])?;
            drop((stdin, stderr));
            out.join().unwrap()?;
            return send(&mut conn, &words(&[kind::EXIT_MESSAGE, SESSION_ID, 0]));
        }
        Script::Vanish => return Ok(()),
        Script::WrongRequestId | Script::NoSessionOpened | Script::Refuse(_) => {
            unreachable!("handled before the session opened")
        }
        Script::Flaky => unreachable!("resolved per connection"),
    };

    // Closing our ends first lets the client's relays reach EOF.
    drop((stdin, stdout, stderr));
    send(&mut conn, &words(&[kind::EXIT_MESSAGE, SESSION_ID, status]))
}

fn parse_new_session(payload: &[u8]) -> Request {
    let mut d = Decoder::new(payload);
    assert_eq!(d.get_u32().unwrap(), kind::NEW_SESSION);
    let request_id = d.get_u32().unwrap();
    assert_eq!(d.get_str().unwrap(), "", "reserved field");
    let tty = d.get_u32().unwrap();
    let x11 = d.get_u32().unwrap();
    let agent = d.get_u32().unwrap();
    let subsystem = d.get_u32().unwrap();
    assert_eq!((x11, agent, subsystem), (0, 0, 0));
    let escape = d.get_u32().unwrap();
    let term = d.get_str().unwrap().to_owned();
    let command = d.get_str().unwrap().to_owned();
    assert_eq!(d.remaining(), 0, "trailing bytes in new session");
    Request {
        request_id,
        tty,
        escape,
        term,
        command,
    }
}

fn words(words: &[u32]) -> Vec<u8> {
    let mut e = Encoder::new();
    for w in words {
        e.put_u32(*w);
    }
    e.finish()
}

fn send(conn: &mut UnixStream, payload: &[u8]) -> io::Result<()> {
    let mut frame = u32::try_from(payload.len()).unwrap().to_be_bytes().to_vec();
    frame.extend_from_slice(payload);
    conn.write_all(&frame)
}

fn recv(conn: &mut UnixStream) -> io::Result<Vec<u8>> {
    recv_opt(conn)?.ok_or_else(|| io::ErrorKind::UnexpectedEof.into())
}

/// Reads one packet; `None` on a clean hang-up.
fn recv_opt(conn: &mut UnixStream) -> io::Result<Option<Vec<u8>>> {
    let mut header = [0u8; 4];
    match conn.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let mut payload = vec![0u8; u32::from_be_bytes(header) as usize];
    conn.read_exact(&mut payload)?;
    Ok(Some(payload))
}

/// Receives one descriptor riding on a single byte.
fn recv_fd(sock: RawFd) -> io::Result<OwnedFd> {
    #[allow(clippy::cast_possible_truncation)]
    let cmsg_space = unsafe { libc::CMSG_SPACE(size_of::<libc::c_int>() as u32) };
    let mut cmsg_buf = vec![0u8; cmsg_space as usize];
    let mut byte = [0u8; 1];
    let mut iov = libc::iovec {
        iov_base: byte.as_mut_ptr().cast(),
        iov_len: 1,
    };
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &raw mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr().cast();
    msg.msg_controllen = cmsg_space as _;

    let n = unsafe { libc::recvmsg(sock, &raw mut msg, 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    if n == 0 {
        return Err(io::ErrorKind::UnexpectedEof.into());
    }
    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&raw const msg);
        if cmsg.is_null() || (*cmsg).cmsg_type != libc::SCM_RIGHTS {
            return Err(io::Error::other("byte arrived without a descriptor"));
        }
        let raw = std::ptr::read_unaligned(libc::CMSG_DATA(cmsg).cast::<libc::c_int>());
        Ok(OwnedFd::from_raw_fd(raw))
    }
}
