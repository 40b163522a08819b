//! dial-harness: TCP listener/dialer lifecycle harness
//!
//! Runs one scenario against a local listener:
//! - Bind an ephemeral port and accept connections in the background
//! - Dial it, optionally write a payload, close the client
//! - Wait for the connection handler, then close the listener
//! - Wait for the accept loop to exit
//!
//! Exits non-zero with the triggering error if any step fails.

mod acceptor;
mod config;
mod driver;
mod error;
mod handler;
mod shutdown;
mod signal;

use config::Config;
use driver::Driver;
use handler::TracingObserver;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        payload_bytes = config.payload.as_ref().map_or(0, |p| p.len()),
        buffer_size = config.buffer_size,
        step_timeout_ms = config.step_timeout_ms,
        "Starting dial-harness"
    );

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(workers) = config.workers {
        builder.worker_threads(workers);
    }
    let runtime = builder.enable_all().build()?;

    let mut driver = Driver::new(config, Arc::new(TracingObserver));
    let report = runtime.block_on(driver.run())?;

    info!(
        address = %report.local_addr,
        transitions = report.transitions.len(),
        completions = report.completions.len(),
        handler = ?report.handler().map(|h| h.outcome),
        acceptor = ?report.acceptor(),
        "Scenario complete"
    );
    Ok(())
}
