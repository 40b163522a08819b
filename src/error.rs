//! Error types for the harness driver.
//!
//! Only failures on the driver's own calls live here. Read and accept
//! faults inside background tasks stay local to the task and are reported
//! through its completion signal.

use crate::driver::DriverState;
use crate::signal::Completion;
use std::time::Duration;

/// Scenario failures.
#[derive(Debug)]
pub enum HarnessError {
    /// The listening socket could not be created.
    Bind {
        addr: String,
        source: std::io::Error,
    },
    /// The client connection could not be established.
    Dial {
        addr: String,
        source: std::io::Error,
    },
    /// Writing the client payload failed.
    Write { source: std::io::Error },
    /// A blocking step did not finish before its deadline.
    Timeout { state: DriverState, after: Duration },
    /// A completion arrived from a task the driver was not waiting on.
    UnexpectedCompletion { state: DriverState, got: Completion },
    /// Every sender dropped while the driver was still waiting.
    ChannelClosed { state: DriverState },
    /// The driver attempted to skip or reverse a state.
    InvalidTransition { from: DriverState, to: DriverState },
}

impl std::fmt::Display for HarnessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HarnessError::Bind { addr, source } => {
                write!(f, "Failed to bind listener on '{addr}': {source}")
            }
            HarnessError::Dial { addr, source } => {
                write!(f, "Failed to dial '{addr}': {source}")
            }
            HarnessError::Write { source } => {
                write!(f, "Failed to write client payload: {source}")
            }
            HarnessError::Timeout { state, after } => {
                write!(f, "Timed out after {after:?} in state {state:?}")
            }
            HarnessError::UnexpectedCompletion { state, got } => {
                write!(f, "Unexpected completion in state {state:?}: {got}")
            }
            HarnessError::ChannelClosed { state } => {
                write!(f, "Completion channel closed in state {state:?}")
            }
            HarnessError::InvalidTransition { from, to } => {
                write!(f, "Invalid driver transition {from:?} -> {to:?}")
            }
        }
    }
}

impl std::error::Error for HarnessError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HarnessError::Bind { source, .. }
            | HarnessError::Dial { source, .. }
            | HarnessError::Write { source } => Some(source),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;
    use std::io;

    #[test]
    fn test_bind_error_display() {
        let err = HarnessError::Bind {
            addr: "127.0.0.1:1".to_string(),
            source: io::Error::new(io::ErrorKind::AddrInUse, "in use"),
        };
        assert_eq!(
            err.to_string(),
            "Failed to bind listener on '127.0.0.1:1': in use"
        );
        assert!(err.source().is_some());
    }

    #[test]
    fn test_timeout_has_no_source() {
        let err = HarnessError::Timeout {
            state: DriverState::AwaitingHandlerDone,
            after: Duration::from_millis(10),
        };
        assert!(err.source().is_none());
        assert!(err.to_string().contains("AwaitingHandlerDone"));
    }
}
