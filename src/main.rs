#![deny(unused, dead_code)]
#![deny(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::uninlined_format_args)]

//! Nimbus - unified CLI entrypoint.
//!
//! Usage:
//!   nimbus start --config config/nimbus.toml
//!   nimbus subscribe --subject orders.>
//!   nimbus publish --subject orders.new.us --message '{"id":1}'

use anyhow::Result;
use clap::Parser;
use nimbus::cli::commands::{run_publish, run_start, run_subscribe};
use nimbus::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start(args) => run_start(args).await,
        Commands::Subscribe(args) => run_subscribe(args).await,
        Commands::Publish(args) => run_publish(args).await,
    }
}
