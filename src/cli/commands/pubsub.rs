//! Subscribe and Publish command implementations - a minimal client over
//! the broker's own text protocol.

use crate::cli::args::{ConnectArgs, OutputFormat, PublishArgs, SubscribeArgs};
use crate::cli::commands::shutdown_signal;
use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::borrow::Cow;
use std::io::Read as StdRead;
use std::time::SystemTime;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

// -----------------------------------------------------------------------------
// Subscribe implementation
// -----------------------------------------------------------------------------

/// Run the subscribe command - connect to the broker and stream messages to
/// stdout until interrupted.
pub async fn run_subscribe(args: SubscribeArgs) -> Result<()> {
    let mut client = Client::connect(&args.connect).await?;

    for (index, subject) in args.subject.iter().enumerate() {
        let sid = index as u64 + 1;
        let line = match &args.queue {
            Some(queue) => format!("SUB {subject} {queue} {sid}\r\n"),
            None => format!("SUB {subject} {sid}\r\n"),
        };
        client.send(&line).await?;
        client.expect_ok().await?;
    }
    eprintln!(
        "subscribed to {} subject(s): {}",
        args.subject.len(),
        args.subject.join(", ")
    );

    loop {
        tokio::select! {
            biased;
            sig = shutdown_signal() => {
                eprintln!("received {sig}, shutting down...");
                return Ok(());
            }
            line = client.read_line() => {
                let line = line?;
                if line.is_empty() {
                    continue;
                }
                if line == "PING" {
                    client.send("PONG\r\n").await?;
                } else if let Some(header) = line.strip_prefix("MSG ") {
                    let (subject, payload) = client.read_msg(header).await?;
                    output_message(&args.format, &subject, &payload);
                } else if line.starts_with("-ERR") {
                    bail!("broker error: {line}");
                }
            }
        }
    }
}

#[derive(Serialize)]
struct MessageOutput<'a> {
    ts: String,
    subject: &'a str,
    size: usize,
    payload: Cow<'a, str>,
}

fn output_message(format: &OutputFormat, subject: &str, payload: &[u8]) {
    match format {
        OutputFormat::Json => {
            let msg = MessageOutput {
                ts: humantime::format_rfc3339(SystemTime::now()).to_string(),
                subject,
                size: payload.len(),
                payload: String::from_utf8_lossy(payload),
            };
            if let Ok(json) = serde_json::to_string(&msg) {
                println!("{json}");
            }
        }
        OutputFormat::Raw => {
            if let Ok(text) = std::str::from_utf8(payload) {
                println!("{text}");
            } else {
                use std::io::Write;
                let _ = std::io::stdout().write_all(payload);
                let _ = std::io::stdout().write_all(b"\n");
            }
        }
    }
}

// -----------------------------------------------------------------------------
// Publish implementation
// -----------------------------------------------------------------------------

/// Run the publish command - send one message and confirm the broker
/// processed it with a PING round-trip.
pub async fn run_publish(args: PublishArgs) -> Result<()> {
    let mut client = Client::connect(&args.connect).await?;

    let (payload, source) = if let Some(message) = &args.message {
        (message.clone().into_bytes(), "argument")
    } else {
        let mut buf = Vec::new();
        std::io::stdin().read_to_end(&mut buf).context("read stdin")?;
        (buf, "stdin")
    };

    eprintln!(
        "publishing {} bytes from {} to '{}'",
        payload.len(),
        source,
        args.subject
    );

    let header = match &args.reply_to {
        Some(reply_to) => format!("PUB {} {} {}\r\n", args.subject, reply_to, payload.len()),
        None => format!("PUB {} {}\r\n", args.subject, payload.len()),
    };
    client.writer.write_all(header.as_bytes()).await?;
    client.writer.write_all(&payload).await?;
    client.writer.write_all(b"\r\n").await?;
    client.expect_ok().await?;

    client.send("PING\r\n").await?;
    let line = client.read_line().await?;
    if line != "PONG" {
        bail!("unexpected response: {line}");
    }
    eprintln!("published");
    Ok(())
}

// -----------------------------------------------------------------------------
// Protocol client
// -----------------------------------------------------------------------------

struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn connect(args: &ConnectArgs) -> Result<Self> {
        let stream = TcpStream::connect((args.host.as_str(), args.port))
            .await
            .with_context(|| format!("connect to {}:{}", args.host, args.port))?;
        let (read_half, write_half) = stream.into_split();
        let mut client = Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        };

        let greeting = client.read_line().await?;
        if !greeting.starts_with("INFO ") {
            bail!("unexpected greeting: {greeting}");
        }

        let mut options = serde_json::json!({"verbose": true, "pedantic": true});
        if let (Some(user), Some(pass)) = (&args.user, &args.pass) {
            options["user"] = serde_json::json!(user);
            options["pass"] = serde_json::json!(pass);
        }
        client.send(&format!("CONNECT {options}\r\n")).await?;
        client.expect_ok().await?;
        Ok(client)
    }

    async fn send(&mut self, line: &str) -> Result<()> {
        self.writer
            .write_all(line.as_bytes())
            .await
            .context("write to broker")
    }

    async fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        let read = self.reader.read_line(&mut line).await.context("read from broker")?;
        if read == 0 {
            bail!("connection closed by broker");
        }
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(line)
    }

    async fn expect_ok(&mut self) -> Result<()> {
        let line = self.read_line().await?;
        if line == "+OK" {
            Ok(())
        } else {
            bail!("broker error: {line}");
        }
    }

    /// Read the payload of a MSG whose header (after `MSG `) is given.
    async fn read_msg(&mut self, header: &str) -> Result<(String, Vec<u8>)> {
        let fields: Vec<&str> = header.split_whitespace().collect();
        if fields.len() < 3 {
            bail!("malformed MSG header: {header}");
        }
        let length: usize = fields[fields.len() - 1]
            .parse()
            .with_context(|| format!("MSG length in: {header}"))?;
        let mut payload = vec![0u8; length + 2];
        self.reader
            .read_exact(&mut payload)
            .await
            .context("read MSG payload")?;
        payload.truncate(length);
        Ok((fields[0].to_string(), payload))
    }
}
