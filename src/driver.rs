//! Scenario driver.
//!
//! Runs the dial lifecycle end to end: bind, start the accept loop, dial,
//! optionally write a payload, close the client, wait for the handler to
//! finish, close the listener, and wait for the accept loop to finish.
//!
//! Every blocking step is bound by the configured step timeout. On any
//! failure after the accept loop starts, all background tasks are cancelled
//! and `run` waits for their completions before returning.

use crate::acceptor::{AcceptExit, Acceptor};
use crate::config::Config;
use crate::error::HarnessError;
use crate::handler::{ConnectionObserver, DrainReport};
use crate::shutdown::{self, ShutdownSignal};
use crate::signal::{self, Completion, CompletionReceiver, CompletionSender};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// How long a failed run waits for cancelled tasks to signal.
const CANCEL_GRACE: Duration = Duration::from_secs(1);

/// Driver state machine. States are visited strictly in declaration order;
/// `Failed` may be entered from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Idle,
    Bound,
    Listening,
    Dialed,
    ClientClosed,
    AwaitingHandlerDone,
    ListenerClosed,
    AwaitingAcceptorDone,
    Complete,
    Failed,
}

impl DriverState {
    /// The only state reachable on success.
    fn successor(self) -> Option<DriverState> {
        use DriverState::*;
        match self {
            Idle => Some(Bound),
            Bound => Some(Listening),
            Listening => Some(Dialed),
            Dialed => Some(ClientClosed),
            ClientClosed => Some(AwaitingHandlerDone),
            AwaitingHandlerDone => Some(ListenerClosed),
            ListenerClosed => Some(AwaitingAcceptorDone),
            AwaitingAcceptorDone => Some(Complete),
            Complete | Failed => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, DriverState::Complete | DriverState::Failed)
    }
}

/// Outcome of a successful scenario.
#[derive(Debug, Clone)]
pub struct ScenarioReport {
    pub local_addr: SocketAddr,
    /// Every state visited, starting with `Idle`.
    pub transitions: Vec<DriverState>,
    /// Completions in the order they were received.
    pub completions: Vec<Completion>,
}

impl ScenarioReport {
    /// The connection handler's report, if one was received.
    pub fn handler(&self) -> Option<&DrainReport> {
        self.completions.iter().find_map(|c| match c {
            Completion::Handler(report) => Some(report),
            _ => None,
        })
    }

    /// How the accept loop exited, if it was observed.
    pub fn acceptor(&self) -> Option<AcceptExit> {
        self.completions.iter().find_map(|c| match c {
            Completion::Acceptor(exit) => Some(*exit),
            _ => None,
        })
    }
}

pub struct Driver {
    config: Config,
    observer: Arc<dyn ConnectionObserver>,
    state: DriverState,
    transitions: Vec<DriverState>,
    /// Completions from tasks stopped after a failure.
    abandoned: Vec<Completion>,
}

impl Driver {
    /// `observer` receives every byte and read error seen by handlers.
    pub fn new(config: Config, observer: Arc<dyn ConnectionObserver>) -> Self {
        Driver {
            config,
            observer,
            state: DriverState::Idle,
            transitions: vec![DriverState::Idle],
            abandoned: Vec::new(),
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> DriverState {
        self.state
    }

    #[cfg(test)]
    pub fn transitions(&self) -> &[DriverState] {
        &self.transitions
    }

    #[cfg(test)]
    pub fn abandoned(&self) -> &[Completion] {
        &self.abandoned
    }

    /// Run the scenario once.
    ///
    /// On failure every background task is cancelled, and `run` waits (up to
    /// `CANCEL_GRACE`) for each of them to signal before returning.
    /// A driver that has already reached a terminal state cannot be rerun.
    pub async fn run(&mut self) -> Result<ScenarioReport, HarnessError> {
        let (cancel, cancel_signal) = shutdown::pair();
        let (completions, mut rx) = signal::channel();

        let result = self.execute(completions, &mut rx, cancel_signal).await;

        if let Err(e) = &result {
            if cancel.trigger() {
                debug!("Cancelling background tasks");
            }
            if !self.state.is_terminal() {
                self.state = DriverState::Failed;
                self.transitions.push(DriverState::Failed);
            }
            self.collect_abandoned(&mut rx).await;
            error!(error = %e, stopped = self.abandoned.len(), "Scenario failed");
        }

        result
    }

    async fn execute(
        &mut self,
        completions: CompletionSender,
        rx: &mut CompletionReceiver,
        cancel: ShutdownSignal,
    ) -> Result<ScenarioReport, HarnessError> {
        if self.state != DriverState::Idle {
            return Err(HarnessError::InvalidTransition {
                from: self.state,
                to: DriverState::Bound,
            });
        }

        let acceptor = Acceptor::bind(&self.config.listen)
            .await?
            .with_buffer_size(self.config.buffer_size);
        let local_addr = acceptor.local_addr();
        self.advance(DriverState::Bound)?;

        let acceptor = acceptor.spawn(completions, cancel, Arc::clone(&self.observer));
        self.advance(DriverState::Listening)?;

        let mut client = self.dial(local_addr).await?;
        self.advance(DriverState::Dialed)?;

        if let Some(payload) = &self.config.payload {
            client
                .write_all(payload.as_bytes())
                .await
                .map_err(|source| HarnessError::Write { source })?;
            debug!(bytes = payload.len(), "Wrote client payload");
        }

        info!("Closing client connection");
        close_client(&mut client).await;
        drop(client);
        self.advance(DriverState::ClientClosed)?;

        self.advance(DriverState::AwaitingHandlerDone)?;
        let handler_done = self.expect_handler(rx).await?;
        if handler_done.outcome.is_clean() {
            info!(peer = %handler_done.peer, bytes = handler_done.bytes, "Connection handler finished");
        } else {
            // Reported, but the handler still cleaned up and signalled.
            warn!(
                peer = %handler_done.peer,
                outcome = ?handler_done.outcome,
                "Connection handler did not see a clean close"
            );
        }

        acceptor.close();
        self.advance(DriverState::ListenerClosed)?;
        info!("Listener closed");

        self.advance(DriverState::AwaitingAcceptorDone)?;
        let acceptor_done = self.expect_acceptor(rx).await?;
        info!(
            exit = ?acceptor_done,
            accepted = acceptor.accepted(),
            "Accept loop finished"
        );
        let joined = acceptor.join().await;
        debug!(exit = ?joined, "Accept loop task joined");

        self.advance(DriverState::Complete)?;
        info!("Test completed");

        Ok(ScenarioReport {
            local_addr,
            transitions: self.transitions.clone(),
            completions: vec![
                Completion::Handler(handler_done),
                Completion::Acceptor(acceptor_done),
            ],
        })
    }

    async fn dial(&self, addr: SocketAddr) -> Result<TcpStream, HarnessError> {
        info!(address = %addr, "Dialing the server");
        let after = self.step_timeout();
        match tokio::time::timeout(after, TcpStream::connect(addr)).await {
            Ok(Ok(client)) => {
                info!("Dial successful, connected to server");
                Ok(client)
            }
            Ok(Err(source)) => Err(HarnessError::Dial {
                addr: addr.to_string(),
                source,
            }),
            Err(_) => Err(HarnessError::Timeout {
                state: self.state,
                after,
            }),
        }
    }

    /// Next completion, which must come from a connection handler.
    async fn expect_handler(
        &self,
        rx: &mut CompletionReceiver,
    ) -> Result<DrainReport, HarnessError> {
        match self.await_completion(rx).await? {
            Completion::Handler(report) => Ok(report),
            got => Err(HarnessError::UnexpectedCompletion {
                state: self.state,
                got,
            }),
        }
    }

    /// Next completion, which must come from the accept loop.
    async fn expect_acceptor(
        &self,
        rx: &mut CompletionReceiver,
    ) -> Result<AcceptExit, HarnessError> {
        match self.await_completion(rx).await? {
            Completion::Acceptor(exit) => Ok(exit),
            got => Err(HarnessError::UnexpectedCompletion {
                state: self.state,
                got,
            }),
        }
    }

    /// Drain completions until every sender is gone, i.e. every background
    /// task has ended.
    async fn collect_abandoned(&mut self, rx: &mut CompletionReceiver) {
        let deadline = Instant::now() + CANCEL_GRACE;
        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(completion)) => {
                    debug!(completion = %completion, "Background task stopped");
                    self.abandoned.push(completion);
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        stopped = self.abandoned.len(),
                        "Background tasks still running after cancel"
                    );
                    break;
                }
            }
        }
    }

    fn advance(&mut self, to: DriverState) -> Result<(), HarnessError> {
        let allowed = match to {
            DriverState::Failed => !self.state.is_terminal(),
            _ => self.state.successor() == Some(to),
        };
        if !allowed {
            return Err(HarnessError::InvalidTransition {
                from: self.state,
                to,
            });
        }

        debug!(from = ?self.state, to = ?to, "Driver transition");
        self.state = to;
        self.transitions.push(to);
        Ok(())
    }

    async fn await_completion(
        &self,
        rx: &mut CompletionReceiver,
    ) -> Result<Completion, HarnessError> {
        let after = self.step_timeout();
        match tokio::time::timeout(after, rx.recv()).await {
            Ok(Some(completion)) => Ok(completion),
            Ok(None) => Err(HarnessError::ChannelClosed { state: self.state }),
            Err(_) => Err(HarnessError::Timeout {
                state: self.state,
                after,
            }),
        }
    }

    fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.config.step_timeout_ms)
    }
}

/// Shut down the client's write half. Safe to call more than once.
async fn close_client(client: &mut TcpStream) {
    if let Err(e) = client.shutdown().await {
        debug!(error = %e, "Client shutdown failed");
    }
}
