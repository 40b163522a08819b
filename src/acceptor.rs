//! Acceptor: owns the listening socket and runs the accept loop.
//!
//! Each accepted connection is handed to its own handler task; the loop never
//! waits on a handler. The loop ends when the owner asks it to close the
//! listener, when the harness cancels it, or on the first accept error. Each
//! of those is reported as a distinct `AcceptExit`.

use crate::error::HarnessError;
use crate::handler::{self, ConnectionObserver, DrainContext, DEFAULT_BUFFER_SIZE};
use crate::shutdown::{self, ShutdownSignal, ShutdownTrigger};
use crate::signal::{CompletionSender, SignalGuard};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Why the accept loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptExit {
    /// The owner requested the listener close.
    Closed,
    /// The harness cancelled all background work.
    Cancelled,
    /// `accept` failed without a close being requested.
    Failed(io::ErrorKind),
    /// The task was dropped before it could record an exit.
    Aborted,
}

/// A bound listener that has not started accepting yet.
#[derive(Debug)]
pub struct Acceptor {
    listener: TcpListener,
    local_addr: SocketAddr,
    buffer_size: usize,
}

impl Acceptor {
    /// Bind a listener on `addr`. Port 0, or an empty port as in
    /// `127.0.0.1:`, asks the OS for an ephemeral port.
    pub async fn bind(addr: &str) -> Result<Self, HarnessError> {
        let bind_error = |source| HarnessError::Bind {
            addr: addr.to_string(),
            source,
        };

        let resolved = match addr.strip_suffix(':') {
            Some(host) => format!("{host}:0"),
            None => addr.to_string(),
        };
        let listener = TcpListener::bind(resolved.as_str())
            .await
            .map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;
        info!(address = %local_addr, "Listener created");

        Ok(Acceptor {
            listener,
            local_addr,
            buffer_size: DEFAULT_BUFFER_SIZE,
        })
    }

    /// Read buffer size handed to each connection handler.
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Resolved listening address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Start the accept loop on its own task.
    ///
    /// `cancel` is shared with every handler the loop spawns.
    pub fn spawn(
        self,
        completions: CompletionSender,
        cancel: ShutdownSignal,
        observer: Arc<dyn ConnectionObserver>,
    ) -> AcceptorHandle {
        let (close, close_signal) = shutdown::pair();
        let accepted = Arc::new(AtomicUsize::new(0));
        let guard = SignalGuard::new(completions.clone(), AcceptExit::Aborted);

        let ctx = DrainContext {
            completions,
            cancel: cancel.clone(),
            observer,
            buffer_size: self.buffer_size,
        };

        let task = tokio::spawn(accept_loop(
            guard,
            self.listener,
            close_signal,
            cancel,
            ctx,
            Arc::clone(&accepted),
        ));

        AcceptorHandle {
            local_addr: self.local_addr,
            close,
            accepted,
            task,
        }
    }
}

/// Control handle for a running accept loop.
///
/// Dropping the handle requests the listener close.
#[derive(Debug)]
pub struct AcceptorHandle {
    local_addr: SocketAddr,
    close: ShutdownTrigger,
    accepted: Arc<AtomicUsize>,
    task: JoinHandle<AcceptExit>,
}

impl AcceptorHandle {
    #[cfg(test)]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Ask the loop to close the listener and exit.
    ///
    /// Returns `false` if a close was already requested.
    pub fn close(&self) -> bool {
        let first = self.close.trigger();
        if first {
            debug!(address = %self.local_addr, "Listener close requested");
        }
        first
    }

    /// Connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Wait for the accept loop task itself to end.
    ///
    /// `None` if the task panicked or was aborted.
    pub async fn join(self) -> Option<AcceptExit> {
        self.task.await.ok()
    }
}

async fn accept_loop(
    guard: SignalGuard<AcceptExit>,
    listener: TcpListener,
    mut close: ShutdownSignal,
    mut cancel: ShutdownSignal,
    ctx: DrainContext,
    accepted: Arc<AtomicUsize>,
) -> AcceptExit {
    let mut guard = guard;
    // Declared after the guard so the socket closes before the signal is sent.
    let listener = listener;
    let local_addr = listener.local_addr().ok();

    info!("Listener started accepting connections");

    let exit = loop {
        tokio::select! {
            biased;

            _ = cancel.wait() => break AcceptExit::Cancelled,

            _ = close.wait() => break AcceptExit::Closed,

            res = listener.accept() => match res {
                Ok((stream, peer)) => {
                    accepted.fetch_add(1, Ordering::Relaxed);
                    debug!(peer = %peer, "Accepted a new connection");
                    handler::spawn(stream, peer, ctx.clone());
                }
                Err(e) => {
                    warn!(error = %e, "Error accepting connection");
                    break AcceptExit::Failed(e.kind());
                }
            }
        }
    };

    drop(listener);
    *guard.state_mut() = exit;
    info!(address = ?local_addr, exit = ?exit, "Accept loop exiting");
    exit
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::testing::RecordingObserver;
    use crate::handler::DrainOutcome;
    use crate::signal::{self, Completion, CompletionReceiver};
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;
    use tokio_test::{assert_err, assert_ok};

    const WAIT: Duration = Duration::from_secs(5);

    async fn next(rx: &mut CompletionReceiver) -> Option<Completion> {
        tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("completion within deadline")
    }

    async fn started() -> (
        AcceptorHandle,
        CompletionReceiver,
        ShutdownTrigger,
        Arc<RecordingObserver>,
    ) {
        let acceptor = assert_ok!(Acceptor::bind("127.0.0.1:0").await);
        let (completions, rx) = signal::channel();
        let (cancel, cancel_signal) = shutdown::pair();
        let observer = Arc::new(RecordingObserver::default());
        let handle = acceptor.spawn(completions, cancel_signal, observer.clone());
        (handle, rx, cancel, observer)
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let acceptor = assert_ok!(Acceptor::bind("127.0.0.1:0").await);
        assert_ne!(acceptor.local_addr().port(), 0);
        assert!(acceptor.local_addr().ip().is_loopback());
    }

    #[tokio::test]
    async fn test_bind_empty_port() {
        let acceptor = assert_ok!(Acceptor::bind("127.0.0.1:").await);
        assert_ne!(acceptor.local_addr().port(), 0);
    }

    #[tokio::test]
    async fn test_bind_address_in_use() {
        let first = assert_ok!(Acceptor::bind("127.0.0.1:0").await);
        let taken = first.local_addr().to_string();

        match Acceptor::bind(&taken).await {
            Err(HarnessError::Bind { addr, source }) => {
                assert_eq!(addr, taken);
                assert_eq!(source.kind(), io::ErrorKind::AddrInUse);
            }
            other => panic!("expected bind error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_bind_malformed_address() {
        let err = assert_err!(Acceptor::bind("not an address").await);
        assert!(matches!(err, HarnessError::Bind { .. }));
    }

    #[tokio::test]
    async fn test_close_ends_loop_with_one_signal() {
        let (handle, mut rx, _cancel, _observer) = started().await;

        assert!(handle.close());
        assert!(!handle.close());

        assert_eq!(next(&mut rx).await, Some(Completion::Acceptor(AcceptExit::Closed)));
        // No other task holds a sender.
        assert_eq!(next(&mut rx).await, None);
        assert!(!handle.close());

        // The port is released.
        assert_err!(TcpStream::connect(handle.local_addr()).await);
        assert_eq!(handle.join().await, Some(AcceptExit::Closed));
    }

    #[tokio::test]
    async fn test_cancel_ends_loop() {
        let (handle, mut rx, cancel, _observer) = started().await;

        cancel.trigger();

        assert_eq!(next(&mut rx).await, Some(Completion::Acceptor(AcceptExit::Cancelled)));
        assert_eq!(handle.accepted(), 0);
    }

    #[tokio::test]
    async fn test_dropping_handle_closes_listener() {
        let (handle, mut rx, _cancel, _observer) = started().await;

        drop(handle);

        assert_eq!(next(&mut rx).await, Some(Completion::Acceptor(AcceptExit::Closed)));
    }

    #[tokio::test]
    async fn test_accepts_while_handler_is_draining() {
        let (handle, mut rx, _cancel, observer) = started().await;

        // First client stays open, keeping its handler busy.
        let mut slow = assert_ok!(TcpStream::connect(handle.local_addr()).await);
        assert_ok!(slow.write_all(b"still here").await);

        let mut fast = assert_ok!(TcpStream::connect(handle.local_addr()).await);
        let fast_addr = assert_ok!(fast.local_addr());
        assert_ok!(fast.write_all(b"quick").await);
        drop(fast);

        match next(&mut rx).await {
            Some(Completion::Handler(report)) => {
                assert_eq!(report.peer, fast_addr);
                assert_eq!(report.outcome, DrainOutcome::Eof);
                assert_eq!(report.bytes, 5);
            }
            other => panic!("unexpected completion: {other:?}"),
        }
        assert_eq!(handle.accepted(), 2);
        assert_eq!(observer.received_from(fast_addr), b"quick");

        let slow_addr = assert_ok!(slow.local_addr());
        drop(slow);
        match next(&mut rx).await {
            Some(Completion::Handler(report)) => {
                assert_eq!(report.peer, slow_addr);
                assert_eq!(report.outcome, DrainOutcome::Eof);
            }
            other => panic!("unexpected completion: {other:?}"),
        }
        assert_eq!(observer.received_from(slow_addr), b"still here");

        handle.close();
        assert_eq!(next(&mut rx).await, Some(Completion::Acceptor(AcceptExit::Closed)));
    }

    #[tokio::test]
    async fn test_cancel_reaches_handlers() {
        let (handle, mut rx, cancel, _observer) = started().await;

        let _client = assert_ok!(TcpStream::connect(handle.local_addr()).await);
        while handle.accepted() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        cancel.trigger();

        let mut seen = vec![next(&mut rx).await.unwrap(), next(&mut rx).await.unwrap()];
        seen.sort_by_key(|c| c.is_acceptor());
        match &seen[..] {
            [Completion::Handler(report), Completion::Acceptor(AcceptExit::Cancelled)] => {
                assert_eq!(report.outcome, DrainOutcome::Cancelled);
            }
            other => panic!("unexpected completions: {other:?}"),
        }
        assert_eq!(next(&mut rx).await, None);
    }
}
