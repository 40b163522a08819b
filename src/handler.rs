//! Connection handler: drains one accepted connection.
//!
//! The handler reads into a fixed-size buffer until the peer closes its end
//! (end-of-stream), a read fails, or the harness cancels it. Received bytes
//! and read errors go to a `ConnectionObserver`; nothing is echoed or parsed.

use crate::shutdown::ShutdownSignal;
use crate::signal::{CompletionSender, SignalGuard};
use bytes::BytesMut;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Default read buffer size
pub const DEFAULT_BUFFER_SIZE: usize = 1024;

/// How a drain loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Peer performed an orderly close.
    Eof,
    /// A read failed with something other than end-of-stream.
    Failed(io::ErrorKind),
    /// The harness cancelled the handler.
    Cancelled,
    /// The task was dropped before it could record an outcome.
    Aborted,
}

impl DrainOutcome {
    /// Only end-of-stream counts as a clean finish.
    pub fn is_clean(&self) -> bool {
        matches!(self, DrainOutcome::Eof)
    }
}

/// Summary carried by a handler's completion signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub peer: SocketAddr,
    /// Total bytes read.
    pub bytes: u64,
    /// Number of reads that returned data.
    pub reads: usize,
    pub outcome: DrainOutcome,
}

impl DrainReport {
    fn new(peer: SocketAddr) -> Self {
        Self {
            peer,
            bytes: 0,
            reads: 0,
            outcome: DrainOutcome::Aborted,
        }
    }

    fn record(&mut self, n: usize) {
        self.bytes += n as u64;
        self.reads += 1;
    }
}

/// Sink for data and errors observed on accepted connections.
pub trait ConnectionObserver: Send + Sync {
    /// Called once per read that returned data.
    fn on_data(&self, peer: SocketAddr, data: &[u8]);

    /// Called when a read fails with anything other than end-of-stream.
    fn on_error(&self, peer: SocketAddr, error: &io::Error);
}

/// Observer that only logs.
#[derive(Debug, Default)]
pub struct TracingObserver;

impl ConnectionObserver for TracingObserver {
    fn on_data(&self, peer: SocketAddr, data: &[u8]) {
        trace!(peer = %peer, len = data.len(), data = %data.escape_ascii(), "Received data");
    }

    fn on_error(&self, peer: SocketAddr, error: &io::Error) {
        warn!(peer = %peer, error = %error, "Error reading from connection");
    }
}

/// Everything a handler task needs besides its connection.
#[derive(Clone)]
pub struct DrainContext {
    pub completions: CompletionSender,
    pub cancel: ShutdownSignal,
    pub observer: Arc<dyn ConnectionObserver>,
    pub buffer_size: usize,
}

/// Drain `stream` on its own task until end-of-stream, error or
/// cancellation.
///
/// The connection is closed and one completion is sent on every exit path.
/// The guard exists before the task does, so even a task aborted before its
/// first poll still signals.
pub fn spawn(stream: TcpStream, peer: SocketAddr, ctx: DrainContext) -> JoinHandle<DrainReport> {
    let guard = SignalGuard::new(ctx.completions.clone(), DrainReport::new(peer));
    tokio::spawn(drain(guard, stream, peer, ctx))
}

async fn drain(
    guard: SignalGuard<DrainReport>,
    stream: TcpStream,
    peer: SocketAddr,
    ctx: DrainContext,
) -> DrainReport {
    let DrainContext {
        completions,
        mut cancel,
        observer,
        buffer_size,
    } = ctx;
    drop(completions);

    let mut guard = guard;
    // Declared after the guard so the socket closes before the signal is sent.
    let mut stream = stream;
    let mut buffer = BytesMut::with_capacity(buffer_size.max(1));

    debug!(peer = %peer, "Connection handler started");

    let outcome = loop {
        buffer.clear();

        tokio::select! {
            biased;

            _ = cancel.wait() => break DrainOutcome::Cancelled,

            res = stream.read_buf(&mut buffer) => match res {
                Ok(0) => break DrainOutcome::Eof,
                Ok(n) => {
                    guard.state_mut().record(n);
                    observer.on_data(peer, &buffer[..n]);
                }
                Err(e) => {
                    observer.on_error(peer, &e);
                    break DrainOutcome::Failed(e.kind());
                }
            }
        }
    };

    if let Err(e) = stream.shutdown().await {
        // Already torn down by the peer; nothing left to close.
        debug!(peer = %peer, error = %e, "Shutdown after drain failed");
    }
    drop(stream);

    guard.state_mut().outcome = outcome;
    let report = *guard.state();
    debug!(
        peer = %peer,
        outcome = ?report.outcome,
        bytes = report.bytes,
        reads = report.reads,
        "Closing connection"
    );
    report
}
