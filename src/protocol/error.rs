use thiserror::Error;

/// Protocol-level error sent to clients as `-ERR '<message>'`.
///
/// Fatal kinds close the connection after the error is written; the rest
/// leave the connection open.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ProtoError {
    #[error("Payload size exceeded")]
    PayloadTooBig,
    #[error("Protocol Operation size exceeded")]
    ProtocolOpTooBig,
    #[error("Invalid Subject")]
    InvalidSubject,
    #[error("Invalid Subject Identifier (sid), already taken")]
    SidTaken,
    #[error("Invalid Subject-Identifier (sid), no subscriber registered")]
    SidNoExist,
    #[error("Invalid config, valid JSON required for connection configuration")]
    InvalidConfig,
    #[error("Authorization is required")]
    AuthRequired,
    #[error("Authorization failed")]
    AuthFailed,
    #[error("Unknown Protocol Operation")]
    UnknownOp,
    #[error("Slow consumer detected, connection dropped")]
    SlowConsumer,
    #[error("Unresponsive client detected, connection dropped")]
    Unresponsive,
    #[error("Maximum client connections exceeded, connection dropped")]
    MaxConnsExceeded,
}

impl ProtoError {
    /// Whether this error closes the connection.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            Self::PayloadTooBig
                | Self::ProtocolOpTooBig
                | Self::AuthRequired
                | Self::AuthFailed
                | Self::SlowConsumer
                | Self::Unresponsive
                | Self::MaxConnsExceeded
        )
    }

    /// The full `-ERR` control line for this error, without CRLF.
    pub fn wire_line(self) -> String {
        format!("-ERR '{self}'")
    }
}
