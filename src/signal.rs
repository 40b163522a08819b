//! Completion signalling between background tasks and the driver.
//!
//! Every background task is handed a `CompletionSender` when it is spawned
//! and wraps it in a `SignalGuard`. The guard sends exactly one
//! `Completion` when it is dropped, so the signal goes out on every exit
//! path: normal return, early return, panic, or task abort.

use crate::acceptor::AcceptExit;
use crate::handler::DrainReport;
use tokio::sync::mpsc;
use tracing::debug;

/// Which background task finished, and how.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// A connection handler drained its connection.
    Handler(DrainReport),
    /// The accept loop exited.
    Acceptor(AcceptExit),
}

#[cfg(test)]
impl Completion {
    pub fn is_handler(&self) -> bool {
        matches!(self, Completion::Handler(_))
    }

    pub fn is_acceptor(&self) -> bool {
        matches!(self, Completion::Acceptor(_))
    }
}

impl std::fmt::Display for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Completion::Handler(report) => write!(
                f,
                "handler for {} finished ({:?}, {} bytes)",
                report.peer, report.outcome, report.bytes
            ),
            Completion::Acceptor(exit) => write!(f, "acceptor finished ({exit:?})"),
        }
    }
}

impl From<DrainReport> for Completion {
    fn from(report: DrainReport) -> Self {
        Completion::Handler(report)
    }
}

impl From<AcceptExit> for Completion {
    fn from(exit: AcceptExit) -> Self {
        Completion::Acceptor(exit)
    }
}

/// Create the fan-in channel: many senders, one receiver owned by the driver.
///
/// The channel is unbounded so a guard can send from `Drop` without awaiting.
pub fn channel() -> (CompletionSender, CompletionReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (CompletionSender { tx }, CompletionReceiver { rx })
}

#[derive(Debug, Clone)]
pub struct CompletionSender {
    tx: mpsc::UnboundedSender<Completion>,
}

impl CompletionSender {
    /// Send a completion. A receiver that has gone away is not an error for
    /// the sending task.
    pub fn send(&self, completion: Completion) {
        if let Err(e) = self.tx.send(completion) {
            debug!(completion = %e.0, "Completion receiver dropped");
        }
    }
}

#[derive(Debug)]
pub struct CompletionReceiver {
    rx: mpsc::UnboundedReceiver<Completion>,
}

impl CompletionReceiver {
    /// Wait for the next completion. Returns `None` once every sender,
    /// including those held by running tasks, has been dropped.
    pub async fn recv(&mut self) -> Option<Completion> {
        self.rx.recv().await
    }
}

/// Sends one completion built from `state` when dropped.
///
/// Tasks start the guard in a pessimistic state (aborted) and overwrite it
/// as they learn how they are exiting.
pub struct SignalGuard<T>
where
    T: Clone + Into<Completion>,
{
    tx: CompletionSender,
    state: T,
}

impl<T> SignalGuard<T>
where
    T: Clone + Into<Completion>,
{
    pub fn new(tx: CompletionSender, initial: T) -> Self {
        Self { tx, state: initial }
    }

    pub fn state(&self) -> &T {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut T {
        &mut self.state
    }
}

impl<T> Drop for SignalGuard<T>
where
    T: Clone + Into<Completion>,
{
    fn drop(&mut self) {
        self.tx.send(self.state.clone().into());
    }
}
