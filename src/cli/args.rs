//! CLI argument definitions using clap.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Nimbus - lightweight NATS-protocol pub/sub broker.
#[derive(Parser)]
#[command(name = "nimbus")]
#[command(version)]
#[command(about = "Nimbus pub/sub broker and client tools")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the Nimbus broker
    Start(StartArgs),

    /// Subscribe to subjects and stream messages to stdout
    Subscribe(SubscribeArgs),

    /// Publish a message from the command line or stdin
    Publish(PublishArgs),
}

// -----------------------------------------------------------------------------
// Start command
// -----------------------------------------------------------------------------

#[derive(Args)]
pub struct StartArgs {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/nimbus.toml")]
    pub config: PathBuf,
}

// -----------------------------------------------------------------------------
// Subscribe/Publish commands
// -----------------------------------------------------------------------------

/// Common broker connection arguments shared by subscribe/publish commands.
#[derive(Args, Clone)]
pub struct ConnectArgs {
    /// Broker hostname or IP
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Broker port
    #[arg(long, default_value_t = 4222)]
    pub port: u16,

    /// Username when the broker requires authentication
    #[arg(long)]
    pub user: Option<String>,

    /// Password when the broker requires authentication
    #[arg(long)]
    pub pass: Option<String>,
}

/// Output format for the subscribe command.
#[derive(clap::ValueEnum, Clone, Default)]
pub enum OutputFormat {
    /// JSON objects, one per line
    #[default]
    Json,
    /// Raw payload only (no metadata)
    Raw,
}

#[derive(Args)]
pub struct SubscribeArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,

    /// Comma-separated list of subjects to subscribe to
    #[arg(long, value_delimiter = ',', required = true)]
    pub subject: Vec<String>,

    /// Join this queue group on every subscription
    #[arg(long)]
    pub queue: Option<String>,

    /// Output format
    #[arg(long, value_enum, default_value = "json")]
    pub format: OutputFormat,
}

#[derive(Args)]
pub struct PublishArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,

    /// Subject to publish to
    #[arg(long)]
    pub subject: String,

    /// Message payload (if omitted, reads from stdin)
    #[arg(long)]
    pub message: Option<String>,

    /// Reply-to subject carried with the message
    #[arg(long)]
    pub reply_to: Option<String>,
}
