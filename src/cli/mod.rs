//! Nimbus CLI - unified command-line interface.
//!
//! Provides a single binary entry point for:
//! - `nimbus start` - Start the broker
//! - `nimbus subscribe` - Stream messages for subjects to stdout
//! - `nimbus publish` - Send a message from an argument or stdin

mod args;
pub mod commands;

pub use args::{Cli, Commands, ConnectArgs, OutputFormat, PublishArgs, StartArgs, SubscribeArgs};
