//! Remote command sessions multiplexed over a control master.

use std::io;
use std::os::fd::{BorrowedFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::net::unix::pipe;
use tokio::sync::oneshot;

use crate::conn::ControlConn;
use crate::copy::{Copies, CopySet};
use crate::error::{Error, OutputError, Result, Stream};
use crate::exit;
use crate::handoff::{self, Endpoint, Remote};
use crate::handshake;
use crate::stdio::{BoxReader, BoxWriter, Input, Output, SharedBuffer};
use crate::teardown::{Closer, Teardown};
use crate::term::{self, TerminalState};
use crate::waitmsg::Waitmsg;

/// Lifecycle of a session.
#[derive(Debug)]
enum State {
    /// Configurable; not yet started.
    Created,
    /// Command running on the master.
    Running(Box<Running>),
    /// Waited on.
    Finished,
}

/// The three streams as wired for one start attempt.
struct Wiring {
    /// Stdin endpoint.
    stdin: Endpoint<BoxReader>,
    /// Stdout endpoint.
    stdout: Endpoint<BoxWriter>,
    /// Stderr endpoint.
    stderr: Endpoint<BoxWriter>,
}

impl Wiring {
    /// Descriptors for the master, in stdin/stdout/stderr order.
    fn fds(&self) -> [BorrowedFd<'_>; 3] {
        [
            self.stdin.remote.as_fd(),
            self.stdout.remote.as_fd(),
            self.stderr.remote.as_fd(),
        ]
    }
}

/// Everything `wait` needs once the session is open.
#[derive(Debug)]
struct Running {
    /// Outcome from the exit-status reader.
    exit: oneshot::Receiver<Result<()>>,
    /// Fires on close.
    aborted: oneshot::Receiver<()>,
    /// Stops the stdin relay.
    stop_stdin: Option<oneshot::Sender<()>>,
    /// Copy task results.
    copies: CopySet,
}

/// Remote ends left behind by the pipe accessors.
#[derive(Debug, Default)]
struct Accessors {
    /// Read end for the master; the caller writes the other end.
    stdin: Option<OwnedFd>,
    /// Write end for the master.
    stdout: Option<OwnedFd>,
    /// Write end for the master.
    stderr: Option<OwnedFd>,
}

/// A remote command run through an existing ControlMaster.
///
/// Configure the standard streams and the pty first, then call one of
/// [`start`](Self::start), [`shell`](Self::shell) or [`run`](Self::run).
/// At most one of them succeeds; a failed start leaves the session and
/// its streams as they were, so it can be retried. Each start attempt
/// opens its own connection to the control socket.
///
/// Streams the caller leaves unset are wired to empty input and discarded
/// output. Dropping a running session stops its background tasks.
#[derive(Debug)]
pub struct Session {
    /// Control socket of the master.
    control_path: PathBuf,
    /// Caller stdin, if set.
    stdin: Option<Input>,
    /// Caller stdout, if set.
    stdout: Option<Output>,
    /// Caller stderr, if set.
    stderr: Option<Output>,
    /// Pending remote ends from the pipe accessors.
    accessors: Accessors,
    /// Terminal type; empty means no pty.
    term: String,
    /// Assigned by the master at open.
    session_id: Option<u32>,
    /// Reported by the master's alive check.
    master_pid: Option<u32>,
    /// Saved settings, if stdin was switched to raw mode.
    terminal: Option<TerminalState>,
    /// Caller descriptors kept open while the session runs.
    retained: Vec<OwnedFd>,
    /// Lifecycle state.
    state: State,
    /// Shared with every [`Closer`].
    teardown: Arc<Teardown>,
}

impl Session {
    /// Creates a session for the master listening on `control_path`.
    ///
    /// Nothing is connected until the session starts.
    pub fn new(control_path: impl Into<PathBuf>) -> Self {
        Self {
            control_path: control_path.into(),
            stdin: None,
            stdout: None,
            stderr: None,
            accessors: Accessors::default(),
            term: String::new(),
            session_id: None,
            master_pid: None,
            terminal: None,
            retained: Vec::new(),
            state: State::Created,
            teardown: Arc::default(),
        }
    }

    /// Control socket this session connects to.
    pub fn control_path(&self) -> &Path {
        &self.control_path
    }

    /// Sets the source of the remote command's stdin.
    pub fn set_stdin(&mut self, input: Input) -> &mut Self {
        self.stdin = Some(input);
        self
    }

    /// Sets the sink for the remote command's stdout.
    pub fn set_stdout(&mut self, output: impl Into<Output>) -> &mut Self {
        self.stdout = Some(output.into());
        self
    }

    /// Sets the sink for the remote command's stderr.
    pub fn set_stderr(&mut self, output: impl Into<Output>) -> &mut Self {
        self.stderr = Some(output.into());
        self
    }

    /// Requests a pseudo-terminal of type `term` for the remote command.
    ///
    /// If stdin is a local terminal it is switched to raw mode once the
    /// session opens; see [`take_terminal_state`](Self::take_terminal_state).
    pub fn request_pty(&mut self, term: impl Into<String>) -> Result<()> {
        if !matches!(self.state, State::Created) {
            return Err(Error::AlreadyStarted);
        }
        self.term = term.into();
        Ok(())
    }

    /// Returns a writer connected to the remote command's stdin.
    ///
    /// The remote side sees end of input once the writer is dropped.
    /// Needs a Tokio runtime with I/O enabled.
    pub fn stdin_pipe(&mut self) -> Result<pipe::Sender> {
        if self.stdin.is_some() {
            return Err(Error::StreamAlreadySet(Stream::Stdin));
        }
        self.ensure_created(Stream::Stdin)?;
        let (read, write) = handoff::pipe()?;
        let local = pipe::Sender::from_owned_fd(write)?;
        self.accessors.stdin = Some(read);
        Ok(local)
    }

    /// Returns a reader connected to the remote command's stdout.
    pub fn stdout_pipe(&mut self) -> Result<pipe::Receiver> {
        if self.stdout.is_some() {
            return Err(Error::StreamAlreadySet(Stream::Stdout));
        }
        self.ensure_created(Stream::Stdout)?;
        let (read, write) = handoff::pipe()?;
        let local = pipe::Receiver::from_owned_fd(read)?;
        self.accessors.stdout = Some(write);
        Ok(local)
    }

    /// Returns a reader connected to the remote command's stderr.
    pub fn stderr_pipe(&mut self) -> Result<pipe::Receiver> {
        if self.stderr.is_some() {
            return Err(Error::StreamAlreadySet(Stream::Stderr));
        }
        self.ensure_created(Stream::Stderr)?;
        let (read, write) = handoff::pipe()?;
        let local = pipe::Receiver::from_owned_fd(read)?;
        self.accessors.stderr = Some(write);
        Ok(local)
    }

    /// Fails once the session has left the created state.
    fn ensure_created(&self, stream: Stream) -> Result<()> {
        if matches!(self.state, State::Created) {
            Ok(())
        } else {
            Err(Error::PipeAfterStart(stream))
        }
    }

    /// Starts `command` on the master without waiting for it.
    pub async fn start(&mut self, command: &str) -> Result<()> {
        self.start_command(command).await
    }

    /// Starts the user's login shell on the master.
    pub async fn shell(&mut self) -> Result<()> {
        self.start_command("").await
    }

    /// Runs `command` and waits for it to finish.
    pub async fn run(&mut self, command: &str) -> Result<()> {
        self.start(command).await?;
        self.wait().await
    }

    /// Runs `command` and returns its stdout.
    pub async fn output(&mut self, command: &str) -> std::result::Result<Vec<u8>, OutputError> {
        if self.stdout.is_some() {
            return Err(OutputError::new(
                Error::StreamAlreadySet(Stream::Stdout),
                Vec::new(),
            ));
        }
        let buf = SharedBuffer::new();
        self.stdout = Some(buf.clone().into());
        let res = self.run(command).await;
        if matches!(self.state, State::Created) {
            self.stdout = None;
        }
        capture(res, &buf)
    }

    /// Runs `command` and returns its stdout and stderr, interleaved as
    /// they arrived.
    pub async fn combined_output(
        &mut self,
        command: &str,
    ) -> std::result::Result<Vec<u8>, OutputError> {
        for (set, stream) in [
            (self.stdout.is_some(), Stream::Stdout),
            (self.stderr.is_some(), Stream::Stderr),
        ] {
            if set {
                return Err(OutputError::new(
                    Error::StreamAlreadySet(stream),
                    Vec::new(),
                ));
            }
        }
        let buf = SharedBuffer::new();
        self.stdout = Some(buf.clone().into());
        self.stderr = Some(buf.clone().into());
        let res = self.run(command).await;
        if matches!(self.state, State::Created) {
            self.stdout = None;
            self.stderr = None;
        }
        capture(res, &buf)
    }

    async fn start_command(&mut self, command: &str) -> Result<()> {
        if !matches!(self.state, State::Created) {
            return Err(Error::AlreadyStarted);
        }
        let running = self.open(command).await?;
        self.state = State::Running(Box::new(running));
        Ok(())
    }

    /// Connects, opens the session, and launches the background tasks.
    ///
    /// On failure every stream is handed back to the session.
    async fn open(&mut self, command: &str) -> Result<Running> {
        let mut conn = ControlConn::connect(&self.control_path).await?;
        let wiring = self.wire()?;
        let opened = match self.negotiate(&mut conn, command, &wiring).await {
            Ok(opened) => opened,
            Err(e) => {
                self.unwire(wiring);
                return Err(e);
            }
        };
        self.session_id = Some(opened.session_id);
        self.master_pid = Some(opened.master_pid);

        let Wiring {
            stdin,
            stdout,
            stderr,
        } = wiring;
        // The master holds its own copies now; closing ours lets EOF through.
        self.retained.extend(
            [stdin.remote, stdout.remote, stderr.remote]
                .into_iter()
                .filter_map(Remote::release),
        );

        let session_id = opened.session_id;
        let (exit_tx, exit) = oneshot::channel();
        let reader = tokio::spawn(async move {
            let outcome = exit::read_exit(conn, session_id)
                .await
                .and_then(Waitmsg::into_result);
            let _ = exit_tx.send(outcome);
        });
        self.teardown.register(reader.abort_handle());

        let mut copies = Copies::default();
        let stop_stdin = stdin.relay.map(|r| copies.stdin(r)).transpose()?;
        if let Some(r) = stdout.relay {
            copies.output(Stream::Stdout, r)?;
        }
        if let Some(r) = stderr.relay {
            copies.output(Stream::Stderr, r)?;
        }

        Ok(Running {
            exit,
            aborted: self.teardown.arm(),
            stop_stdin,
            copies: copies.launch(&self.teardown),
        })
    }

    /// Runs the open sequence and switches a local terminal to raw mode.
    async fn negotiate(
        &mut self,
        conn: &mut ControlConn,
        command: &str,
        wiring: &Wiring,
    ) -> Result<handshake::Opened> {
        // Request ids restart on every connection.
        let mut request_id = 0;
        let fds = wiring.fds();
        let opened =
            handshake::open_session(conn, &mut request_id, &self.term, command, &fds).await?;
        if !self.term.is_empty() {
            self.terminal = term::make_raw(fds[0]).map_err(Error::Terminal)?;
        }
        Ok(opened)
    }

    /// Takes the three streams for the master; nothing is taken on error.
    fn wire(&mut self) -> io::Result<Wiring> {
        let stdin = handoff::stdin(&mut self.accessors.stdin, &mut self.stdin)?;
        let stdout = match handoff::output(&mut self.accessors.stdout, &mut self.stdout) {
            Ok(ep) => ep,
            Err(e) => {
                stdin.unwire(&mut self.accessors.stdin, &mut self.stdin, Input::Fd, Input::Reader);
                return Err(e);
            }
        };
        match handoff::output(&mut self.accessors.stderr, &mut self.stderr) {
            Ok(stderr) => Ok(Wiring {
                stdin,
                stdout,
                stderr,
            }),
            Err(e) => {
                stdin.unwire(&mut self.accessors.stdin, &mut self.stdin, Input::Fd, Input::Reader);
                stdout.unwire(
                    &mut self.accessors.stdout,
                    &mut self.stdout,
                    Output::Fd,
                    Output::Writer,
                );
                Err(e)
            }
        }
    }

    /// Hands every stream of a failed attempt back to the session.
    fn unwire(&mut self, wiring: Wiring) {
        let Wiring {
            stdin,
            stdout,
            stderr,
        } = wiring;
        stdin.unwire(&mut self.accessors.stdin, &mut self.stdin, Input::Fd, Input::Reader);
        stdout.unwire(
            &mut self.accessors.stdout,
            &mut self.stdout,
            Output::Fd,
            Output::Writer,
        );
        stderr.unwire(
            &mut self.accessors.stderr,
            &mut self.stderr,
            Output::Fd,
            Output::Writer,
        );
    }

    /// Waits for the remote command to exit and the relays to finish.
    ///
    /// Succeeds only if the command exited with status 0 and every copy
    /// succeeded. A nonzero status is reported as [`Error::Exit`]; a
    /// [`close`](Self::close) while waiting as [`Error::Aborted`].
    pub async fn wait(&mut self) -> Result<()> {
        let running = match std::mem::replace(&mut self.state, State::Finished) {
            State::Running(running) => running,
            State::Created => {
                self.state = State::Created;
                return Err(Error::NotStarted);
            }
            State::Finished => return Err(Error::Finished),
        };
        let Running {
            exit,
            aborted,
            stop_stdin,
            copies,
        } = *running;

        let outcome = tokio::select! {
            res = exit => res.unwrap_or(Err(Error::Aborted)),
            _ = aborted => Err(Error::Aborted),
        };
        if let Some(stop) = stop_stdin {
            let _ = stop.send(());
        }
        let copied = copies.drain().await;
        self.retained.clear();

        tracing::debug!(session_id = ?self.session_id, ok = outcome.is_ok(), "session finished");
        outcome.and(copied)
    }

    /// Closes the session: drops the control connection, stops the output
    /// relays, and makes a pending [`wait`](Self::wait) return
    /// [`Error::Aborted`]. Idempotent; the error is always `Ok`.
    pub fn close(&self) -> Result<()> {
        self.teardown.close();
        Ok(())
    }

    /// Handle that can close this session from another task.
    pub fn closer(&self) -> Closer {
        Closer::new(Arc::clone(&self.teardown))
    }

    /// Session id assigned by the master, once started.
    pub const fn session_id(&self) -> Option<u32> {
        self.session_id
    }

    /// Process id of the master, once started.
    pub const fn master_pid(&self) -> Option<u32> {
        self.master_pid
    }

    /// Takes the saved terminal settings, if stdin was switched to raw
    /// mode. Restoring them is up to the caller.
    pub fn take_terminal_state(&mut self) -> Option<TerminalState> {
        self.terminal.take()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.teardown.abort_tasks();
    }
}

/// Pairs a run result with the bytes captured in `buf`.
fn capture(res: Result<()>, buf: &SharedBuffer) -> std::result::Result<Vec<u8>, OutputError> {
    let output = buf.take();
    match res {
        Ok(()) => Ok(output),
        Err(e) => Err(OutputError::new(e, output)),
    }
}
