//! CLI command implementations.

mod pubsub;
mod start;

pub use pubsub::{run_publish, run_subscribe};
pub use start::run_start;

use tokio::signal::unix::{signal, SignalKind};

/// Wait for shutdown signal (SIGINT or SIGTERM).
pub(crate) async fn shutdown_signal() -> &'static str {
    let mut sigint = signal(SignalKind::interrupt()).expect("register SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("register SIGTERM handler");

    tokio::select! {
        _ = sigint.recv() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
    }
}
