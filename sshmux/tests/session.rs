//! End-to-end session behaviour against a scripted master.

#![allow(clippy::unwrap_used, clippy::panic, missing_docs)]

mod common;

use std::io::{Read, Seek};
use std::time::Duration;

use common::{FakeMaster, HANG_BANNER, SESSION_ID, Script};
use sshmux::{Error, Input, Output, ProtocolError, Session, SharedBuffer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

/// Upper bound for anything that should finish promptly.
const LIMIT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn output_captures_stdout() {
    let master = FakeMaster::start(Script::Print {
        out: b"hello\n",
        err: b"ignored\n",
        status: 0,
    });
    let mut session = Session::new(master.path());
    let out = timeout(LIMIT, session.output("echo hello"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(out, b"hello\n");
    assert_eq!(session.session_id(), Some(SESSION_ID));
    assert_eq!(session.master_pid(), Some(std::process::id()));
}

#[tokio::test]
async fn nonzero_exit_keeps_partial_output() {
    let master = FakeMaster::start(Script::Print {
        out: b"partial",
        err: b"",
        status: 3,
    });
    let mut session = Session::new(master.path());
    let err = timeout(LIMIT, session.output("false"))
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(err.error().exit_status(), Some(3));
    assert_eq!(err.output(), b"partial");
    assert_eq!(err.to_string(), "Process exited with status 3");
}

#[tokio::test]
async fn combined_output_collects_both_streams() {
    let master = FakeMaster::start(Script::Print {
        out: b"out",
        err: b"err",
        status: 0,
    });
    let mut session = Session::new(master.path());
    let out = timeout(LIMIT, session.combined_output("both"))
        .await
        .unwrap()
        .unwrap();
    // Interleaving between the streams is unspecified.
    let text = String::from_utf8(out).unwrap();
    assert_eq!(text.len(), 6);
    assert!(text.contains("out"));
    assert!(text.contains("err"));
}

#[tokio::test]
async fn combined_output_keeps_every_byte_of_busy_streams() {
    const LEN: usize = 512 * 1024;
    let master = FakeMaster::start(Script::Flood { len: LEN });
    let mut session = Session::new(master.path());
    let out = timeout(LIMIT, session.combined_output("flood"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(out.len(), 2 * LEN);
    assert_eq!(out.iter().filter(|&&b| b == b'o').count(), LEN);
    assert_eq!(out.iter().filter(|&&b| b == b'e').count(), LEN);
}

#[tokio::test]
async fn caller_reader_feeds_remote_stdin() {
    let master = FakeMaster::start(Script::Cat);
    let mut session = Session::new(master.path());
    session.set_stdin(Input::reader(&b"ping"[..]));
    let out = timeout(LIMIT, session.output("cat")).await.unwrap().unwrap();
    assert_eq!(out, b"ping");
}

#[tokio::test]
async fn large_input_round_trips_through_cat() {
    let master = FakeMaster::start(Script::Cat);
    let input: Vec<u8> = (0..1 << 20).map(|i: u32| (i % 251) as u8).collect();
    let mut session = Session::new(master.path());
    session.set_stdin(Input::reader(std::io::Cursor::new(input.clone())));
    let out = timeout(LIMIT, session.output("cat")).await.unwrap().unwrap();
    assert_eq!(out.len(), input.len());
    assert!(out == input);
}

#[tokio::test]
async fn stdin_pipe_delivers_eof_when_dropped() {
    let master = FakeMaster::start(Script::Cat);
    let mut session = Session::new(master.path());
    let buf = SharedBuffer::new();
    let mut stdin = session.stdin_pipe().unwrap();
    session.set_stdout(buf.clone());

    timeout(LIMIT, session.start("cat")).await.unwrap().unwrap();
    stdin.write_all(b"through the pipe").await.unwrap();
    drop(stdin);

    timeout(LIMIT, session.wait()).await.unwrap().unwrap();
    assert_eq!(buf.contents(), b"through the pipe");
}

#[tokio::test]
async fn pipes_echo_large_input_through_cat() {
    let master = FakeMaster::start(Script::Cat);
    let input: Vec<u8> = (0..2_000_000u32)
        .map(|i| u8::try_from(i % 253).unwrap())
        .collect();
    let mut session = Session::new(master.path());
    let mut stdin = session.stdin_pipe().unwrap();
    let mut stdout = session.stdout_pipe().unwrap();
    timeout(LIMIT, session.start("cat")).await.unwrap().unwrap();

    let data = input.clone();
    let writer = tokio::spawn(async move {
        stdin.write_all(&data).await.unwrap();
        // Dropping the writer is the remote's end of input.
    });
    let mut got = Vec::new();
    timeout(LIMIT, stdout.read_to_end(&mut got))
        .await
        .unwrap()
        .unwrap();
    writer.await.unwrap();
    timeout(LIMIT, session.wait()).await.unwrap().unwrap();

    assert_eq!(got.len(), input.len());
    assert!(got == input);
}

#[tokio::test]
async fn stdout_pipe_reads_remote_output() {
    let master = FakeMaster::start(Script::Print {
        out: b"piped",
        err: b"",
        status: 0,
    });
    let mut session = Session::new(master.path());
    let mut stdout = session.stdout_pipe().unwrap();

    timeout(LIMIT, session.start("print")).await.unwrap().unwrap();
    let mut got = Vec::new();
    timeout(LIMIT, stdout.read_to_end(&mut got))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got, b"piped");
    timeout(LIMIT, session.wait()).await.unwrap().unwrap();
}

#[tokio::test]
async fn native_descriptor_receives_output_directly() {
    let master = FakeMaster::start(Script::Print {
        out: b"to a file",
        err: b"",
        status: 0,
    });
    let mut file = tempfile::tempfile().unwrap();
    let mut session = Session::new(master.path());
    session.set_stdout(Output::fd(file.try_clone().unwrap()));

    timeout(LIMIT, session.run("print")).await.unwrap().unwrap();

    file.rewind().unwrap();
    let mut got = String::new();
    file.read_to_string(&mut got).unwrap();
    assert_eq!(got, "to a file");
}

#[tokio::test]
async fn request_fields_reach_the_master() {
    let master = FakeMaster::start(Script::Describe);

    let mut plain = Session::new(master.path());
    let out = timeout(LIMIT, plain.output("uptime")).await.unwrap().unwrap();
    assert_eq!(out, b"tty=0 term= cmd=uptime");

    let mut pty = Session::new(master.path());
    pty.request_pty("vt100").unwrap();
    let out = timeout(LIMIT, pty.output("top")).await.unwrap().unwrap();
    assert_eq!(out, b"tty=1 term=vt100 cmd=top");
    // The relayed stdin is a pipe, so raw mode was never applied.
    assert!(pty.take_terminal_state().is_none());

    let requests = master.requests();
    assert_eq!(requests.len(), 2);
    for r in &requests {
        assert_eq!(r.request_id, 1);
        assert_eq!(r.escape, sshmux_proto::ESCAPE_DISABLED);
    }
}

#[tokio::test]
async fn shell_sends_an_empty_command() {
    let master = FakeMaster::start(Script::Print {
        out: b"",
        err: b"",
        status: 0,
    });
    let mut session = Session::new(master.path());
    timeout(LIMIT, session.shell()).await.unwrap().unwrap();
    timeout(LIMIT, session.wait()).await.unwrap().unwrap();
    assert_eq!(master.requests()[0].command, "");
}

#[tokio::test]
async fn tty_failure_is_reported_with_the_exit() {
    let master = FakeMaster::start(Script::TtyFail { status: 1 });
    let mut session = Session::new(master.path());
    session.request_pty("xterm").unwrap();
    let err = timeout(LIMIT, session.run("ls")).await.unwrap().unwrap_err();
    match err {
        Error::Exit(e) => {
            assert_eq!(e.exit_status(), 1);
            assert_eq!(e.waitmsg().message(), "pseudo-terminal allocation failed");
        }
        other => panic!("expected exit error, got {other}"),
    }
}

#[tokio::test]
async fn vanished_master_means_missing_exit_status() {
    let master = FakeMaster::start(Script::Vanish);
    let mut session = Session::new(master.path());
    let err = timeout(LIMIT, session.run("true")).await.unwrap().unwrap_err();
    assert!(matches!(err, Error::ExitMissing), "{err}");
}

#[tokio::test]
async fn foreign_session_exit_is_a_protocol_error() {
    let master = FakeMaster::start(Script::ForeignExit);
    let mut session = Session::new(master.path());
    let err = timeout(LIMIT, session.run("true")).await.unwrap().unwrap_err();
    assert!(
        matches!(
            err,
            Error::Protocol(ProtocolError::SessionIdMismatch { .. })
        ),
        "{err}"
    );
}

#[tokio::test]
async fn wrong_request_id_fails_start() {
    let master = FakeMaster::start(Script::WrongRequestId);
    let mut session = Session::new(master.path());
    let err = timeout(LIMIT, session.start("true"))
        .await
        .unwrap()
        .unwrap_err();
    assert!(
        matches!(
            err,
            Error::Protocol(ProtocolError::RequestIdMismatch {
                expected: 0,
                got: 7
            })
        ),
        "{err}"
    );
}

#[tokio::test]
async fn missing_session_opened_fails_start() {
    let master = FakeMaster::start(Script::NoSessionOpened);
    let mut session = Session::new(master.path());
    let err = timeout(LIMIT, session.start("true"))
        .await
        .unwrap()
        .unwrap_err();
    assert!(
        matches!(
            err,
            Error::Transport {
                context: "read session-opened reply",
                ..
            }
        ),
        "{err}"
    );
    assert!(matches!(session.wait().await, Err(Error::NotStarted)));
    assert!(session.session_id().is_none());
}

#[tokio::test]
async fn failed_start_can_be_retried_with_the_same_streams() {
    let master = FakeMaster::start(Script::Flaky);
    let mut session = Session::new(master.path());
    session.set_stdin(Input::reader(&b"second try"[..]));
    let buf = SharedBuffer::new();
    session.set_stdout(buf.clone());

    let err = timeout(LIMIT, session.start("cat"))
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, Error::Transport { .. }), "{err}");
    assert!(matches!(session.wait().await, Err(Error::NotStarted)));

    timeout(LIMIT, session.run("cat")).await.unwrap().unwrap();
    assert_eq!(buf.contents(), b"second try");

    let requests = master.requests();
    assert_eq!(requests.len(), 2);
    // Each attempt runs on its own connection.
    assert!(requests.iter().all(|r| r.request_id == 1));
}

#[tokio::test]
async fn refusal_carries_the_masters_reason() {
    let master = FakeMaster::start(Script::Refuse("session request denied"));
    let mut session = Session::new(master.path());
    let err = timeout(LIMIT, session.start("true"))
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "master refused NewSession: session request denied"
    );
}

#[tokio::test]
async fn close_aborts_a_pending_wait() {
    let master = FakeMaster::start(Script::Hang);
    let mut session = Session::new(master.path());
    let buf = SharedBuffer::new();
    session.set_stdout(buf.clone());
    timeout(LIMIT, session.start("sleep 1000"))
        .await
        .unwrap()
        .unwrap();

    let closer = session.closer();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        closer.close();
    });

    let err = timeout(LIMIT, session.wait()).await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Aborted), "{err}");
    // Output relayed before the close survives it.
    assert_eq!(buf.contents(), HANG_BANNER);
    assert!(matches!(session.wait().await, Err(Error::Finished)));
}

#[tokio::test]
async fn close_before_wait_aborts_immediately() {
    let master = FakeMaster::start(Script::Hang);
    let mut session = Session::new(master.path());
    timeout(LIMIT, session.start("sleep 1000"))
        .await
        .unwrap()
        .unwrap();

    session.close().unwrap();
    session.close().unwrap();
    let err = timeout(LIMIT, session.wait()).await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Aborted), "{err}");
}

#[tokio::test]
async fn lifecycle_misuse_is_rejected() {
    let master = FakeMaster::start(Script::Print {
        out: b"",
        err: b"",
        status: 0,
    });
    let mut session = Session::new(master.path());
    assert!(matches!(session.wait().await, Err(Error::NotStarted)));

    timeout(LIMIT, session.start("true")).await.unwrap().unwrap();
    assert!(matches!(session.start("true").await, Err(Error::AlreadyStarted)));
    assert!(matches!(session.request_pty("xterm"), Err(Error::AlreadyStarted)));
    assert!(matches!(
        session.stdin_pipe(),
        Err(Error::PipeAfterStart(sshmux::Stream::Stdin))
    ));

    timeout(LIMIT, session.wait()).await.unwrap().unwrap();
    assert!(matches!(session.wait().await, Err(Error::Finished)));
}

#[tokio::test]
async fn unreachable_socket_is_a_connect_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = Session::new(dir.path().join("missing.sock"));
    let err = session.run("true").await.unwrap_err();
    assert!(matches!(err, Error::Connect { .. }), "{err}");
}

#[tokio::test]
async fn check_reports_the_master_pid() {
    let master = FakeMaster::start(Script::Hang);
    let pid = timeout(LIMIT, sshmux::check(master.path()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pid, std::process::id());
    assert!(master.requests().is_empty());
}
