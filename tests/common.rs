//! Common test harness utilities for integration tests.
//!
//! Starts brokers on ephemeral ports and drives them with a raw TCP client
//! speaking the wire protocol directly.

// Not all test files use all helpers; silence dead_code warnings for unused
// exports.
#![allow(dead_code)]

use nimbus::config::{AuthConfig, Config, LimitsConfig, PingConfig, TelemetryConfig};
use nimbus::server::stats::Stats;
use nimbus::Server;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// How long a test waits for a line that must arrive.
pub const READ_DEADLINE: Duration = Duration::from_secs(5);
/// How long a test waits to conclude a line will not arrive.
pub const SILENCE_WINDOW: Duration = Duration::from_millis(300);

/// A broker configuration bound to an ephemeral loopback port.
pub fn base_config() -> Config {
    Config {
        bind_address: "127.0.0.1:0".to_string(),
        ping: PingConfig::default(),
        auth: AuthConfig::default(),
        limits: LimitsConfig::default(),
        telemetry: TelemetryConfig::default(),
    }
}

/// A config requiring authentication as derek/foo.
pub fn auth_config(timeout: Duration) -> Config {
    let mut config = base_config();
    config.auth.users = HashMap::from([("derek".to_string(), "foo".to_string())]);
    config.auth.timeout = timeout;
    config
}

pub struct TestBroker {
    pub addr: SocketAddr,
    pub stats: Arc<Stats>,
}

/// Bind and spawn a broker; the task dies with the test runtime.
pub async fn start_broker(config: Config) -> TestBroker {
    let server = Server::bind(config).await.expect("bind broker");
    let addr = server.local_addr();
    let stats = server.stats();
    tokio::spawn(server.run());
    TestBroker { addr, stats }
}

/// Raw protocol client.
pub struct TestClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl TestClient {
    /// Connect without touching the stream.
    pub async fn connect_raw(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect to broker");
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        }
    }

    /// Connect and consume the INFO greeting, returning its JSON body.
    pub async fn connect(addr: SocketAddr) -> (Self, serde_json::Value) {
        let mut client = Self::connect_raw(addr).await;
        let greeting = client.read_line().await.expect("INFO greeting");
        let body = greeting.strip_prefix("INFO ").expect("greeting is INFO");
        let info = serde_json::from_str(body).expect("INFO blob is JSON");
        (client, info)
    }

    pub async fn send(&mut self, data: &str) {
        self.writer
            .write_all(data.as_bytes())
            .await
            .expect("write to broker");
    }

    /// Next CRLF-terminated line, or `None` on EOF. Panics if nothing
    /// arrives within the read deadline.
    pub async fn read_line(&mut self) -> Option<String> {
        let mut line = String::new();
        let read = timeout(READ_DEADLINE, self.reader.read_line(&mut line))
            .await
            .expect("timed out waiting for a line")
            .expect("read from broker");
        if read == 0 {
            return None;
        }
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Some(line)
    }

    /// A line if one arrives within `wait`, `None` otherwise (or on EOF).
    pub async fn try_read_line(&mut self, wait: Duration) -> Option<String> {
        let mut line = String::new();
        match timeout(wait, self.reader.read_line(&mut line)).await {
            Ok(Ok(0)) | Err(_) => None,
            Ok(Ok(_)) => {
                while line.ends_with('\n') || line.ends_with('\r') {
                    line.pop();
                }
                Some(line)
            }
            Ok(Err(err)) => panic!("read from broker: {err}"),
        }
    }

    pub async fn expect_line(&mut self, want: &str) {
        let line = self.read_line().await.expect("line before EOF");
        assert_eq!(line, want);
    }

    pub async fn expect_ok(&mut self) {
        self.expect_line("+OK").await;
    }

    /// Expect a MSG frame: header line then payload line.
    pub async fn expect_msg(&mut self, header: &str, payload: &str) {
        self.expect_line(header).await;
        self.expect_line(payload).await;
    }

    /// Expect the peer to close the stream.
    pub async fn expect_eof(&mut self) {
        let mut byte = [0u8; 1];
        let read = timeout(READ_DEADLINE, self.reader.read(&mut byte))
            .await
            .expect("timed out waiting for EOF")
            .expect("read from broker");
        assert_eq!(read, 0, "expected EOF, got more data");
    }

    /// Subscribe and consume the verbose ack.
    pub async fn subscribe(&mut self, subject: &str, sid: u64) {
        self.send(&format!("SUB {subject} {sid}\r\n")).await;
        self.expect_ok().await;
    }

    /// Publish and consume the verbose ack.
    pub async fn publish(&mut self, subject: &str, payload: &str) {
        self.send(&format!("PUB {subject} {}\r\n{payload}\r\n", payload.len()))
            .await;
        self.expect_ok().await;
    }
}
