//! Copy tasks relaying caller streams through the local pipe ends.

use std::future::Future;
use std::io;
use std::pin::Pin;

use tokio::net::unix::pipe;
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result, Stream};
use crate::handoff::Relay;
use crate::stdio::{BoxReader, BoxWriter};
use crate::teardown::Teardown;

/// One boxed copy loop.
type Job = Pin<Box<dyn Future<Output = io::Result<()>> + Send>>;

/// Copy jobs collected before the session starts them.
#[derive(Default)]
pub(crate) struct Copies {
    /// Stream, job, and whether closing the session cancels it.
    jobs: Vec<(Stream, Job, bool)>,
}

impl Copies {
    /// Adds the stdin relay.
    ///
    /// Returns the sender that stops it early; the relay pipe is closed
    /// either way, which the master sees as end of input.
    pub(crate) fn stdin(&mut self, relay: Relay<BoxReader>) -> io::Result<oneshot::Sender<()>> {
        let mut sender = pipe::Sender::from_owned_fd(relay.local)?;
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let user = relay.user;

        let job = async move {
            let copied = match user {
                Some(mut reader) => tokio::select! {
                    res = tokio::io::copy(&mut reader, &mut sender) => res.map(drop),
                    _ = stop_rx => Ok(()),
                },
                None => Ok(()),
            };
            drop(sender);
            match copied {
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                    tracing::warn!("remote stdin closed before input was exhausted");
                    Ok(())
                }
                other => other,
            }
        };
        self.jobs.push((Stream::Stdin, Box::pin(job), false));
        Ok(stop_tx)
    }

    /// Adds a stdout or stderr relay.
    pub(crate) fn output(&mut self, stream: Stream, relay: Relay<BoxWriter>) -> io::Result<()> {
        let mut receiver = pipe::Receiver::from_owned_fd(relay.local)?;
        let user = relay.user;

        let job = async move {
            match user {
                Some(mut writer) => tokio::io::copy(&mut receiver, &mut writer).await?,
                None => tokio::io::copy(&mut receiver, &mut tokio::io::sink()).await?,
            };
            Ok(())
        };
        self.jobs.push((stream, Box::pin(job), true));
        Ok(())
    }

    /// Spawns every job; output jobs are registered with `teardown`.
    pub(crate) fn launch(self, teardown: &Teardown) -> CopySet {
        let pending = self.jobs.len();
        let (tx, results) = mpsc::channel(pending.max(1));

        for (stream, job, cancellable) in self.jobs {
            let tx = tx.clone();
            let task = tokio::spawn(async move {
                let res = job.await;
                if let Err(e) = &res {
                    tracing::debug!(%stream, error = %e, "copy failed");
                }
                let _ = tx.send(res.map_err(|e| (stream, e))).await;
            });
            if cancellable {
                teardown.register(task.abort_handle());
            }
        }
        tracing::trace!(pending, "copy tasks started");
        CopySet { pending, results }
    }
}

/// Results of the running copy tasks.
#[derive(Debug)]
pub(crate) struct CopySet {
    /// Number of tasks launched.
    pending: usize,
    /// One message per task that ran to completion.
    results: mpsc::Receiver<std::result::Result<(), (Stream, io::Error)>>,
}

impl CopySet {
    /// Waits for every task and returns the first failure.
    ///
    /// Tasks cancelled by a close report nothing and are skipped.
    pub(crate) async fn drain(mut self) -> Result<()> {
        let mut first = None;
        for _ in 0..self.pending {
            match self.results.recv().await {
                Some(Ok(())) => {}
                Some(Err((stream, source))) => {
                    if first.is_none() {
                        first = Some(Error::Copy { stream, source });
                    }
                }
                None => break,
            }
        }
        first.map_or(Ok(()), Err)
    }
}
