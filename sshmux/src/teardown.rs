//! Session teardown shared between the session and its [`Closer`]s.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;
use tokio::task::AbortHandle;

/// Abort signal plus the background tasks a close must stop.
#[derive(Debug, Default)]
pub(crate) struct Teardown {
    /// Guarded teardown state.
    state: Mutex<State>,
}

/// What a close has to act on.
#[derive(Debug, Default)]
struct State {
    /// Set once by [`Teardown::close`]; never cleared.
    closed: bool,
    /// Wakes a pending `wait`.
    abort: Option<oneshot::Sender<()>>,
    /// Exit reader and output copy tasks.
    tasks: Vec<AbortHandle>,
}

impl Teardown {
    /// Locks the state, ignoring poisoning.
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the receiver `wait` races against the exit status.
    ///
    /// Fires at once if the session was already closed.
    pub(crate) fn arm(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.lock();
        if state.closed {
            let _ = tx.send(());
        } else {
            state.abort = Some(tx);
        }
        rx
    }

    /// Tracks a task to abort on close; aborts it now if already closed.
    pub(crate) fn register(&self, task: AbortHandle) {
        let mut state = self.lock();
        if state.closed {
            task.abort();
        } else {
            state.tasks.push(task);
        }
    }

    /// Stops all tracked tasks and signals abort. Idempotent.
    pub(crate) fn close(&self) {
        let mut state = self.lock();
        if !state.closed {
            tracing::debug!(tasks = state.tasks.len(), "closing session");
        }
        state.closed = true;
        for task in state.tasks.drain(..) {
            task.abort();
        }
        if let Some(tx) = state.abort.take() {
            let _ = tx.send(());
        }
    }

    /// Stops all tracked tasks without signalling abort.
    pub(crate) fn abort_tasks(&self) {
        for task in self.lock().tasks.drain(..) {
            task.abort();
        }
    }
}

/// Handle that closes a session from another task.
///
/// Obtained from [`Session::closer`](crate::Session::closer). Closing
/// makes a pending [`Session::wait`](crate::Session::wait) return
/// [`Error::Aborted`](crate::Error::Aborted).
#[derive(Debug, Clone)]
pub struct Closer {
    /// Teardown of the session this closes.
    teardown: Arc<Teardown>,
}

impl Closer {
    /// Wraps a session's teardown.
    pub(crate) const fn new(teardown: Arc<Teardown>) -> Self {
        Self { teardown }
    }

    /// Closes the session. Safe to call any number of times.
    pub fn close(&self) {
        self.teardown.close();
    }
}
