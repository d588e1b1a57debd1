//! Start command - launches the Nimbus broker.

use crate::cli::args::StartArgs;
use crate::cli::commands::shutdown_signal;
use crate::config::Config;
use crate::server::Server;
use crate::telemetry;
use anyhow::Result;

pub async fn run_start(args: StartArgs) -> Result<()> {
    let config = Config::load(&args.config)?;
    telemetry::init_tracing(config.telemetry.log_level.as_deref())?;

    let server = Server::bind(config).await?;
    tokio::select! {
        result = server.run() => result,
        sig = shutdown_signal() => {
            tracing::info!("received {sig}, shutting down");
            Ok(())
        }
    }
}
