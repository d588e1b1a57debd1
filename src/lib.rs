#![deny(unused, dead_code)]
#![deny(clippy::all, clippy::pedantic)]
// Module naming: common pattern in domain-driven code
#![allow(clippy::module_name_repetitions)]
// Function complexity: dispatch loops are inherently long
#![allow(clippy::too_many_lines)]
// Documentation style: many protocol terms don't need backticks
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
// API ergonomics: prefer simplicity over must_use annotations
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
// Format strings: allow non-inlined for readability
#![allow(clippy::uninlined_format_args)]
// Numeric casts: intentional in protocol and accounting code
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]
// Control flow style
#![allow(clippy::if_not_else)]
#![allow(clippy::single_match_else)]
// Passing style
#![allow(clippy::needless_pass_by_value)]

//! Nimbus - lightweight publish/subscribe broker speaking the NATS text
//! protocol.
//!
//! # Module Organization
//!
//! ## Core
//! - `core::config` - Configuration parsing and validation
//!
//! ## Protocol
//! - `protocol::request` - Control-line parsing into requests
//! - `protocol::response` - Outbound frames
//! - `protocol::subject` - Dotted-subject validation
//! - `protocol::error` - Wire error kinds
//!
//! ## Messaging
//! - `messaging::trie` - Subject trie with wildcard matching
//! - `messaging::outbox` - Bounded outbound queue with batched handoff
//!
//! ## Networking
//! - `net::conn` - Per-connection actor (read, write, dispatch tasks)
//! - `net::heartbeat` - Server-initiated PING liveness
//! - `net::auth` - Connection authorization gate
//!
//! ## Server
//! - `server` - Listener, server actor, fan-out, stats
//!
//! ## Operations
//! - `ops::telemetry` - Tracing setup
//!
//! ## CLI
//! - `cli` - start / publish / subscribe commands

// Core infrastructure
pub mod core;

// Wire protocol
pub mod protocol;

// Messaging
pub mod messaging;

// Networking
pub mod net;

// Server
pub mod server;

// Operations
pub mod ops;

// CLI
pub mod cli;

// Re-exports for convenience
pub use self::core::config;
pub use ops::telemetry;
pub use server::Server;
