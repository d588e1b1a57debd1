//! Networking: the per-connection actor and its helpers.
//!
//! - `conn` - Connection actor (read, write, dispatch tasks)
//! - `heartbeat` - Server-initiated PING liveness tracking
//! - `auth` - Connection authorization gate

pub mod auth;
pub mod conn;
pub mod heartbeat;
