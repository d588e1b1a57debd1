use crate::config::LimitsConfig;
use crate::protocol::error::ProtoError;
use crate::protocol::subject::{self, fields_n};
use bytes::Bytes;
use serde::Deserialize;
use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// The protocol verbs a client may send. Matching is case-insensitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Info,
    Connect,
    Ping,
    Pong,
    Pub,
    Sub,
    Unsub,
}

impl Verb {
    pub const ALL: [Verb; 7] = [
        Verb::Info,
        Verb::Connect,
        Verb::Ping,
        Verb::Pong,
        Verb::Pub,
        Verb::Sub,
        Verb::Unsub,
    ];

    pub fn lookup(token: &str) -> Option<Verb> {
        match token.to_ascii_uppercase().as_str() {
            "INFO" => Some(Verb::Info),
            "CONNECT" => Some(Verb::Connect),
            "PING" => Some(Verb::Ping),
            "PONG" => Some(Verb::Pong),
            "PUB" => Some(Verb::Pub),
            "SUB" => Some(Verb::Sub),
            "UNSUB" => Some(Verb::Unsub),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Verb::Info => "INFO",
            Verb::Connect => "CONNECT",
            Verb::Ping => "PING",
            Verb::Pong => "PONG",
            Verb::Pub => "PUB",
            Verb::Sub => "SUB",
            Verb::Unsub => "UNSUB",
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

/// A parsed client request, ready for the dispatch loop.
#[derive(Debug, Clone)]
pub enum Request {
    Info,
    Ping,
    Pong,
    Connect(ConnectRequest),
    Publish(PublishRequest),
    Subscribe(SubscribeRequest),
    Unsubscribe(UnsubscribeRequest),
}

/// CONNECT options; unknown JSON fields are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectRequest {
    pub verbose: Option<bool>,
    pub pedantic: Option<bool>,
    pub user: Option<String>,
    #[serde(rename = "pass")]
    pub password: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub subject: String,
    pub reply_to: Option<String>,
    pub content: Bytes,
}

#[derive(Debug, Clone)]
pub struct SubscribeRequest {
    pub subject: String,
    pub queue: Option<String>,
    pub sid: u64,
}

#[derive(Debug, Clone)]
pub struct UnsubscribeRequest {
    pub sid: u64,
    pub max_responses: Option<u64>,
}

/// Failure while reading a control line.
#[derive(Debug)]
pub enum LineError {
    /// Line exceeded `limits.control`.
    TooBig,
    /// Peer closed the stream.
    Eof,
    Io(io::Error),
}

/// Failure while parsing a request.
#[derive(Debug)]
pub enum ParseError {
    /// Reported to the client as `-ERR`; fatal kinds close the connection.
    Proto(ProtoError),
    /// Low-level failure; the connection closes silently.
    Io(io::Error),
}

impl From<ProtoError> for ParseError {
    fn from(err: ProtoError) -> Self {
        ParseError::Proto(err)
    }
}

impl From<io::Error> for ParseError {
    fn from(err: io::Error) -> Self {
        ParseError::Io(err)
    }
}

impl From<LineError> for ParseError {
    fn from(err: LineError) -> Self {
        match err {
            LineError::TooBig => ParseError::Proto(ProtoError::ProtocolOpTooBig),
            LineError::Eof => ParseError::Io(io::ErrorKind::UnexpectedEof.into()),
            LineError::Io(e) => ParseError::Io(e),
        }
    }
}

/// Buffered protocol reader enforcing the control-line length cap.
pub struct LineReader<R> {
    inner: R,
    max_line: usize,
}

impl<R: AsyncBufRead + Unpin> LineReader<R> {
    pub fn new(inner: R, max_line: usize) -> Self {
        Self { inner, max_line }
    }

    /// Read one CRLF-terminated control line, without the terminator.
    ///
    /// Lines longer than the configured cap fail with `LineError::TooBig`
    /// without consuming the remainder.
    pub async fn read_control_line(&mut self) -> Result<String, LineError> {
        let mut line: Vec<u8> = Vec::new();
        loop {
            let available = self.inner.fill_buf().await.map_err(LineError::Io)?;
            if available.is_empty() {
                return Err(LineError::Eof);
            }
            match available.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    line.extend_from_slice(&available[..pos]);
                    self.inner.consume(pos + 1);
                    break;
                }
                None => {
                    line.extend_from_slice(available);
                    let taken = available.len();
                    self.inner.consume(taken);
                }
            }
            if line.len() > self.max_line {
                return Err(LineError::TooBig);
            }
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        if line.len() > self.max_line {
            return Err(LineError::TooBig);
        }
        Ok(String::from_utf8_lossy(&line).into_owned())
    }

    async fn read_payload(&mut self, length: usize) -> io::Result<Bytes> {
        let mut buf = vec![0u8; length];
        self.inner.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }
}

/// Parse the arguments (and for PUB, the payload) of one control line.
pub async fn parse<R: AsyncBufRead + Unpin>(
    verb: Verb,
    args: &str,
    reader: &mut LineReader<R>,
    limits: &LimitsConfig,
) -> Result<Request, ParseError> {
    match verb {
        Verb::Info => bare(args, Request::Info),
        Verb::Ping => bare(args, Request::Ping),
        Verb::Pong => bare(args, Request::Pong),
        Verb::Connect => parse_connect(args),
        Verb::Pub => parse_publish(args, reader, limits).await,
        Verb::Sub => parse_subscribe(args),
        Verb::Unsub => parse_unsubscribe(args),
    }
}

fn bare(args: &str, request: Request) -> Result<Request, ParseError> {
    if args.trim().is_empty() {
        Ok(request)
    } else {
        Err(ProtoError::UnknownOp.into())
    }
}

fn parse_connect(args: &str) -> Result<Request, ParseError> {
    let options: ConnectRequest =
        serde_json::from_str(args).map_err(|_| ProtoError::InvalidConfig)?;
    Ok(Request::Connect(options))
}

async fn parse_publish<R: AsyncBufRead + Unpin>(
    args: &str,
    reader: &mut LineReader<R>,
    limits: &LimitsConfig,
) -> Result<Request, ParseError> {
    let fields = fields_n(args, 3);
    let (subject, reply_to, length) = match fields.as_slice() {
        [subject, length] => (*subject, None, parse_usize(length)?),
        [subject, reply_to, length] => (*subject, Some(*reply_to), parse_usize(length)?),
        _ => return Err(ProtoError::UnknownOp.into()),
    };

    if length > limits.payload {
        return Err(ProtoError::PayloadTooBig.into());
    }

    let content = reader.read_payload(length).await?;

    // The payload must be followed by its own empty control line.
    let trailer = reader.read_control_line().await?;
    if !trailer.is_empty() {
        return Err(ProtoError::UnknownOp.into());
    }

    Ok(Request::Publish(PublishRequest {
        subject: subject.to_string(),
        reply_to: reply_to.map(str::to_string),
        content,
    }))
}

fn parse_subscribe(args: &str) -> Result<Request, ParseError> {
    let fields = fields_n(args, 3);
    let (subject, queue, sid) = match fields.as_slice() {
        [subject, sid] => (*subject, None, parse_u64(sid)?),
        [subject, queue, sid] => (*subject, Some(*queue), parse_u64(sid)?),
        _ => return Err(ProtoError::UnknownOp.into()),
    };

    if !subject::valid_subscribed(subject) {
        return Err(ProtoError::InvalidSubject.into());
    }

    Ok(Request::Subscribe(SubscribeRequest {
        subject: subject.to_string(),
        queue: queue.map(str::to_string),
        sid,
    }))
}

fn parse_unsubscribe(args: &str) -> Result<Request, ParseError> {
    let fields = fields_n(args, 2);
    let (sid, max_responses) = match fields.as_slice() {
        [sid] => (parse_u64(sid)?, None),
        [sid, max] => (parse_u64(sid)?, Some(parse_u64(max)?)),
        _ => return Err(ProtoError::UnknownOp.into()),
    };
    Ok(Request::Unsubscribe(UnsubscribeRequest {
        sid,
        max_responses,
    }))
}

fn parse_u64(value: &str) -> Result<u64, ParseError> {
    value.parse().map_err(|_| ProtoError::UnknownOp.into())
}

fn parse_usize(value: &str) -> Result<usize, ParseError> {
    value.parse().map_err(|_| ProtoError::UnknownOp.into())
}
