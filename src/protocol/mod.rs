//! NATS line-oriented wire protocol.
//!
//! - `error` - Wire error kinds and their `-ERR` literals
//! - `subject` - Dotted-subject validation
//! - `request` - Control-line parsing into client requests
//! - `response` - Outbound frames

pub mod error;
pub mod request;
pub mod response;
pub mod subject;

pub use error::ProtoError;
pub use request::{
    ConnectRequest, LineError, LineReader, ParseError, PublishRequest, Request, SubscribeRequest,
    UnsubscribeRequest, Verb,
};
pub use response::Response;
