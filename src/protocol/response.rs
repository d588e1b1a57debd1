use crate::messaging::outbox::HasSize;
use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Outbound frame: a head line, an optional payload, and the closing CRLF.
///
/// The payload rides as `Bytes` so one published message body is shared by
/// every subscriber's frame instead of being copied per delivery.
#[derive(Debug, Clone)]
pub struct Response {
    head: String,
    payload: Option<Bytes>,
}

impl Response {
    /// A bare control line, e.g. `+OK` or `PONG`.
    pub fn line(head: impl Into<String>) -> Self {
        Self {
            head: head.into(),
            payload: None,
        }
    }

    /// A head line followed by payload bytes, e.g. a MSG frame.
    pub fn with_payload(head: String, payload: Bytes) -> Self {
        Self {
            head,
            payload: Some(payload),
        }
    }

    /// The server INFO greeting.
    pub fn info(blob: Bytes) -> Self {
        Self::with_payload("INFO ".to_string(), blob)
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_all(self.head.as_bytes()).await?;
        if let Some(payload) = &self.payload {
            writer.write_all(payload).await?;
        }
        writer.write_all(b"\r\n").await
    }
}

impl HasSize for Response {
    fn size(&self) -> usize {
        self.head.len() + self.payload.as_ref().map_or(0, Bytes::len)
    }
}
