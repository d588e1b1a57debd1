//! The per-connection actor.
//!
//! Each accepted socket runs three cooperating tasks:
//!
//! - a **read task** that turns the byte stream into parsed requests,
//! - a **write task** that drains the bounded outbox onto the socket,
//! - a **dispatch task** (this module's main loop) that owns the connection
//!   state and serves requests, server deliveries, timers, and teardown.
//!
//! All server interaction goes through `ServerCmd` sends that keep draining
//! our own delivery channel while the send is pending, so the server actor
//! can never deadlock against a connection.

use crate::messaging::outbox::{self, OutboxReceiver, OutboxSender, QueueError};
use crate::messaging::{DeliveryHandle, Message, SubscribedMessage, Subscription};
use crate::net::auth::AuthGate;
use crate::net::heartbeat::{Beat, Heartbeat};
use crate::protocol::request::{self, ParseError};
use crate::protocol::subject::{self, fields_n};
use crate::protocol::{
    LineError, LineReader, ProtoError, PublishRequest, Request, Response, SubscribeRequest,
    UnsubscribeRequest, Verb,
};
use crate::server::command::ServerCmd;
use crate::server::ServerHandle;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{info, trace, warn};

const CHANNEL_BACKLOG: usize = 16;
const BUF_IO_SIZE: usize = 64 * 1024;
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Items the read task funnels into the dispatch loop.
enum Inbound {
    Request(Request),
    /// A line that failed to parse; reported to the client, fatally or not.
    Bad(ProtoError),
}

/// Low-level signals from the read and write tasks.
enum ConnCmd {
    /// Peer disconnected cleanly.
    Close,
    /// I/O failure; the connection closes without a client message.
    Error(std::io::Error),
}

/// Run one client connection to completion.
pub(crate) async fn handle(
    server: ServerHandle,
    stream: TcpStream,
    remote: SocketAddr,
    conn_id: u64,
    over_limit: bool,
) {
    let limits = server.config().limits.clone();
    let (read_half, write_half) = stream.into_split();

    let (outbox_tx, outbox_rx) = outbox::channel(limits.pending);
    let (inbox_tx, inbox_rx) = mpsc::channel(CHANNEL_BACKLOG);
    let (cmds_tx, cmds_rx) = mpsc::channel(CHANNEL_BACKLOG);
    let (deliveries_tx, deliveries_rx) = mpsc::channel(CHANNEL_BACKLOG);
    let (writer_done_tx, writer_done_rx) = oneshot::channel();
    let fatal: Arc<Mutex<Option<ProtoError>>> = Arc::new(Mutex::new(None));
    let shutdown = Arc::new(Notify::new());

    let writer = BufWriter::with_capacity(BUF_IO_SIZE, write_half);
    let writer_task = tokio::spawn(write_loop(
        outbox_rx,
        writer,
        fatal.clone(),
        cmds_tx.clone(),
        writer_done_tx,
    ));

    let reader = ReadTask {
        remote,
        reader: LineReader::new(
            BufReader::with_capacity(BUF_IO_SIZE, read_half),
            limits.control,
        ),
        inbox: inbox_tx,
        cmds: cmds_tx,
        shutdown: shutdown.clone(),
        server: server.clone(),
    };
    tokio::spawn(reader.run());

    let heartbeat = Heartbeat::new(
        server.config().ping.interval,
        server.config().ping.max_outstanding,
    );
    let auth = AuthGate::new(
        server.config().auth.users.clone(),
        server.config().auth.timeout,
    );

    let mut conn = Conn {
        id: conn_id,
        remote,
        server,
        options: ConnOptions::default(),
        subscriptions: HashMap::new(),
        outbox: outbox_tx,
        deliveries_tx,
        deliveries_rx,
        inbox_rx,
        inbox_open: true,
        cmds_rx,
        fatal,
        heartbeat,
        auth,
        shutdown,
        writer_task,
        writer_done: Some(writer_done_rx),
        closed: false,
    };

    if over_limit {
        conn.close_with_error(ProtoError::MaxConnsExceeded).await;
        return;
    }

    info!("[client {remote}] connected");
    conn.dispatch().await;
}

/// Client-settable connection options. Both default on, per protocol.
struct ConnOptions {
    verbose: bool,
    pedantic: bool,
}

impl Default for ConnOptions {
    fn default() -> Self {
        Self {
            verbose: true,
            pedantic: true,
        }
    }
}

struct Conn {
    id: u64,
    remote: SocketAddr,
    server: ServerHandle,
    options: ConnOptions,
    subscriptions: HashMap<u64, Arc<Subscription>>,
    outbox: OutboxSender<Response>,
    /// Prototype sender cloned into each subscription's delivery handle.
    deliveries_tx: mpsc::Sender<SubscribedMessage>,
    deliveries_rx: mpsc::Receiver<SubscribedMessage>,
    inbox_rx: mpsc::Receiver<Inbound>,
    inbox_open: bool,
    cmds_rx: mpsc::Receiver<ConnCmd>,
    fatal: Arc<Mutex<Option<ProtoError>>>,
    heartbeat: Heartbeat,
    auth: AuthGate,
    shutdown: Arc<Notify>,
    writer_task: JoinHandle<()>,
    writer_done: Option<oneshot::Receiver<()>>,
    closed: bool,
}

enum Turn {
    Delivery(Option<SubscribedMessage>),
    Inbound(Option<Inbound>),
    Command(Option<ConnCmd>),
    AuthExpired,
    HeartbeatTick,
}

impl Conn {
    async fn dispatch(&mut self) {
        let greeting = Response::info(self.server.info());
        self.write_or_close(greeting).await;

        while !self.closed {
            let turn = tokio::select! {
                delivery = self.deliveries_rx.recv() => Turn::Delivery(delivery),
                inbound = self.inbox_rx.recv(), if self.inbox_open => Turn::Inbound(inbound),
                command = self.cmds_rx.recv() => Turn::Command(command),
                () = self.auth.expired() => Turn::AuthExpired,
                () = self.heartbeat.tick() => Turn::HeartbeatTick,
            };
            match turn {
                Turn::Delivery(Some(delivery)) => {
                    if let Err(err) = self.process_delivery(delivery) {
                        self.close_with_error(err).await;
                    }
                }
                Turn::Delivery(None) => break,
                Turn::Inbound(Some(inbound)) => self.process_inbound(inbound).await,
                Turn::Inbound(None) => self.inbox_open = false,
                Turn::Command(Some(ConnCmd::Close)) => self.close().await,
                Turn::Command(Some(ConnCmd::Error(err))) => {
                    warn!("[client {}] error: {err}", self.remote);
                    self.close().await;
                }
                Turn::Command(None) => self.close().await,
                Turn::AuthExpired => self.close_with_error(ProtoError::AuthRequired).await,
                Turn::HeartbeatTick => match self.heartbeat.fire() {
                    Beat::Ping => self.write_or_close(Response::line("PING")).await,
                    Beat::Unresponsive => {
                        self.close_with_error(ProtoError::Unresponsive).await;
                    }
                },
            }
        }

        trace!("[client {}] stopped dispatch loop", self.remote);
    }

    async fn process_inbound(&mut self, inbound: Inbound) {
        let request = match &inbound {
            Inbound::Request(request) => Some(request),
            Inbound::Bad(_) => None,
        };
        if let Err(err) = self.auth.admit(request) {
            self.close_with_error(err).await;
            return;
        }
        match inbound {
            Inbound::Bad(err) if err.is_fatal() => self.close_with_error(err).await,
            Inbound::Bad(err) => self.write_or_close(Response::line(err.wire_line())).await,
            Inbound::Request(request) => self.serve(request).await,
        }
    }

    async fn serve(&mut self, request: Request) {
        match request {
            Request::Info => {
                let info = Response::info(self.server.info());
                self.write_or_close(info).await;
            }
            Request::Ping => self.write_or_close(Response::line("PONG")).await,
            Request::Pong => self.heartbeat.pong(),
            Request::Connect(options) => {
                if let Some(verbose) = options.verbose {
                    self.options.verbose = verbose;
                }
                if let Some(pedantic) = options.pedantic {
                    self.options.pedantic = pedantic;
                }
                self.ack().await;
            }
            Request::Publish(publish) => self.serve_publish(publish).await,
            Request::Subscribe(subscribe) => self.serve_subscribe(subscribe).await,
            Request::Unsubscribe(unsubscribe) => self.serve_unsubscribe(unsubscribe).await,
        }
    }

    async fn serve_publish(&mut self, publish: PublishRequest) {
        if self.options.pedantic && !subject::valid_published(&publish.subject) {
            self.write_or_close(Response::line(ProtoError::InvalidSubject.wire_line()))
                .await;
            return;
        }
        let message = Arc::new(Message {
            subject: publish.subject,
            reply_to: publish.reply_to,
            content: publish.content,
        });
        if let Err(err) = self.send_server_cmd(ServerCmd::Publish { message }).await {
            self.close_with_error(err).await;
            return;
        }
        self.ack().await;
    }

    async fn serve_subscribe(&mut self, subscribe: SubscribeRequest) {
        if self.subscriptions.contains_key(&subscribe.sid) {
            self.write_or_close(Response::line(ProtoError::SidTaken.wire_line()))
                .await;
            return;
        }
        let subscription = Arc::new(Subscription::new(
            subscribe.sid,
            subscribe.subject,
            subscribe.queue,
            self.id,
            DeliveryHandle::new(self.deliveries_tx.clone()),
        ));
        self.subscriptions.insert(subscribe.sid, subscription.clone());

        let (done_tx, done_rx) = oneshot::channel();
        let cmd = ServerCmd::Subscribe {
            subscription,
            done: done_tx,
        };
        match self.server_roundtrip(cmd, done_rx).await {
            Ok(_) => self.ack().await,
            Err(err) => self.close_with_error(err).await,
        }
    }

    async fn serve_unsubscribe(&mut self, unsubscribe: UnsubscribeRequest) {
        let Some(subscription) = self.subscriptions.get(&unsubscribe.sid).cloned() else {
            if self.options.pedantic {
                self.write_or_close(Response::line(ProtoError::SidNoExist.wire_line()))
                    .await;
            }
            return;
        };
        let (done_tx, done_rx) = oneshot::channel();
        let cmd = ServerCmd::Unsubscribe {
            subscription,
            max_responses: unsubscribe.max_responses,
            done: done_tx,
        };
        match self.server_roundtrip(cmd, done_rx).await {
            Ok(unsubscribed) => {
                if unsubscribed.unwrap_or(false) {
                    self.subscriptions.remove(&unsubscribe.sid);
                }
                self.ack().await;
            }
            Err(err) => self.close_with_error(err).await,
        }
    }

    /// `+OK` under verbose.
    async fn ack(&mut self) {
        if self.options.verbose {
            self.write_or_close(Response::line("+OK")).await;
        }
    }

    /// Turn a server delivery into a MSG frame on the outbox.
    fn process_delivery(&mut self, delivery: SubscribedMessage) -> Result<(), ProtoError> {
        let message = &delivery.message;
        let sid = delivery.subscription.id;
        if delivery.last {
            // Auto-unsubscribe: the server already removed it from the trie.
            self.subscriptions.remove(&sid);
        }
        let header = match &message.reply_to {
            Some(reply_to) => format!(
                "MSG {} {} {} {}\r\n",
                message.subject,
                sid,
                reply_to,
                message.content.len()
            ),
            None => format!("MSG {} {} {}\r\n", message.subject, sid, message.content.len()),
        };
        self.write(Response::with_payload(header, message.content.clone()))
    }

    /// Enqueue a response; a full outbox marks the client a slow consumer.
    fn write(&mut self, response: Response) -> Result<(), ProtoError> {
        match self.outbox.enqueue(response) {
            Ok(()) => Ok(()),
            Err(QueueError::Full) => Err(ProtoError::SlowConsumer),
            Err(QueueError::Closed) => Ok(()),
        }
    }

    async fn write_or_close(&mut self, response: Response) {
        if let Err(err) = self.write(response) {
            self.close_with_error(err).await;
        }
    }

    /// Send a command to the server while draining our own delivery
    /// channel, so a server blocked handing us a message always makes
    /// progress.
    async fn send_server_cmd(&mut self, cmd: ServerCmd) -> Result<(), ProtoError> {
        let commands = self.server.commands().clone();
        let mut slot = Some(cmd);
        let mut failure: Option<ProtoError> = None;
        while slot.is_some() {
            enum Offer<'p> {
                Permit(Option<mpsc::Permit<'p, ServerCmd>>),
                Delivery(Option<SubscribedMessage>),
            }
            let offer = tokio::select! {
                permit = commands.reserve() => Offer::Permit(permit.ok()),
                delivery = self.deliveries_rx.recv() => Offer::Delivery(delivery),
            };
            match offer {
                Offer::Permit(Some(permit)) => {
                    permit.send(slot.take().expect("command still pending"));
                }
                // Server actor gone; the broker is shutting down.
                Offer::Permit(None) => slot = None,
                Offer::Delivery(Some(delivery)) => {
                    if !self.closed && failure.is_none() {
                        if let Err(err) = self.process_delivery(delivery) {
                            failure = Some(err);
                        }
                    }
                }
                Offer::Delivery(None) => {}
            }
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Send a command and wait for its acknowledgement, draining deliveries
    /// the whole time. `Ok(None)` means the server actor is gone.
    async fn server_roundtrip<V>(
        &mut self,
        cmd: ServerCmd,
        done: oneshot::Receiver<V>,
    ) -> Result<Option<V>, ProtoError> {
        self.send_server_cmd(cmd).await?;
        let mut done = done;
        loop {
            enum Ack<V> {
                Done(Option<V>),
                Delivery(Option<SubscribedMessage>),
            }
            let ack = tokio::select! {
                result = &mut done => Ack::Done(result.ok()),
                delivery = self.deliveries_rx.recv() => Ack::Delivery(delivery),
            };
            match ack {
                Ack::Done(value) => return Ok(value),
                Ack::Delivery(Some(delivery)) => {
                    if !self.closed {
                        self.process_delivery(delivery)?;
                    }
                }
                Ack::Delivery(None) => {}
            }
        }
    }

    /// Stage a fatal error for the writer's last gasp and close.
    async fn close_with_error(&mut self, err: ProtoError) {
        if self.closed {
            return;
        }
        self.server.stats().record_close_error(err);
        warn!("[client {}] error: {}", self.remote, err.wire_line());
        {
            let mut slot = self.fatal.lock();
            if slot.is_none() {
                *slot = Some(err);
            }
        }
        self.close().await;
    }

    /// Idempotent teardown: stop timers, stop the read task, let the writer
    /// drain, unregister from the server, then bound the writer wait.
    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        self.heartbeat.stop();
        self.auth.stop();

        self.shutdown.notify_one();
        self.outbox.close();

        self.unregister().await;
        self.deliveries_rx.close();

        if let Some(done) = self.writer_done.take() {
            if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, done).await.is_err() {
                self.writer_task.abort();
            }
        }

        info!("[client {}] disconnected", self.remote);
    }

    /// Hand our subscriptions back to the server, discarding deliveries the
    /// server may still be pushing at us until it acknowledges.
    async fn unregister(&mut self) {
        let (done_tx, mut done_rx) = oneshot::channel();
        let subscriptions: Vec<Arc<Subscription>> = self.subscriptions.values().cloned().collect();
        let commands = self.server.commands().clone();
        let mut slot = Some(ServerCmd::UnregisterConn {
            subscriptions,
            done: done_tx,
        });

        while slot.is_some() {
            enum Offer<'p> {
                Permit(Option<mpsc::Permit<'p, ServerCmd>>),
                Delivery,
            }
            let offer = tokio::select! {
                permit = commands.reserve() => Offer::Permit(permit.ok()),
                _ = self.deliveries_rx.recv() => Offer::Delivery,
            };
            match offer {
                Offer::Permit(Some(permit)) => {
                    permit.send(slot.take().expect("command still pending"));
                }
                Offer::Permit(None) => return,
                Offer::Delivery => {}
            }
        }

        loop {
            let acked = tokio::select! {
                result = &mut done_rx => {
                    let _ = result;
                    true
                }
                _ = self.deliveries_rx.recv() => false,
            };
            if acked {
                break;
            }
        }
        self.subscriptions.clear();
    }
}

struct ReadTask {
    remote: SocketAddr,
    reader: LineReader<BufReader<OwnedReadHalf>>,
    inbox: mpsc::Sender<Inbound>,
    cmds: mpsc::Sender<ConnCmd>,
    shutdown: Arc<Notify>,
    server: ServerHandle,
}

impl ReadTask {
    async fn run(mut self) {
        let shutdown = self.shutdown.clone();
        loop {
            let proceed = tokio::select! {
                () = shutdown.notified() => false,
                proceed = self.step() => proceed,
            };
            if !proceed {
                return;
            }
        }
    }

    /// Read and forward one control line; false ends the task.
    async fn step(&mut self) -> bool {
        let line = match self.reader.read_control_line().await {
            Ok(line) => line,
            Err(LineError::Eof) => {
                let _ = self.cmds.send(ConnCmd::Close).await;
                return false;
            }
            Err(LineError::TooBig) => {
                let _ = self
                    .inbox
                    .send(Inbound::Bad(ProtoError::ProtocolOpTooBig))
                    .await;
                return false;
            }
            Err(LineError::Io(err)) => {
                let _ = self.cmds.send(ConnCmd::Error(err)).await;
                return false;
            }
        };

        trace!("[client {}] {}", self.remote, line);

        let fields = fields_n(&line, 2);
        let Some(verb_token) = fields.first() else {
            return true;
        };
        let args = fields.get(1).copied().unwrap_or("");

        let Some(verb) = Verb::lookup(verb_token) else {
            self.server.stats().record_unknown_op();
            let _ = self.inbox.send(Inbound::Bad(ProtoError::UnknownOp)).await;
            return true;
        };
        self.server.stats().record_op(verb);

        match request::parse(verb, args, &mut self.reader, &self.server.config().limits).await {
            Ok(request) => self.inbox.send(Inbound::Request(request)).await.is_ok(),
            Err(ParseError::Proto(err)) => {
                let _ = self.inbox.send(Inbound::Bad(err)).await;
                true
            }
            Err(ParseError::Io(err)) => {
                let _ = self.cmds.send(ConnCmd::Error(err)).await;
                false
            }
        }
    }
}

/// Drain the outbox onto the socket, flushing only when the queue runs dry,
/// and write the staged fatal error (if any) before finishing.
async fn write_loop(
    mut outbox: OutboxReceiver<Response>,
    mut writer: BufWriter<OwnedWriteHalf>,
    fatal: Arc<Mutex<Option<ProtoError>>>,
    cmds: mpsc::Sender<ConnCmd>,
    done: oneshot::Sender<()>,
) {
    while let Ok(response) = outbox.dequeue().await {
        if let Err(err) = response.write_to(&mut writer).await {
            let _ = cmds.try_send(ConnCmd::Error(err));
            break;
        }
        if !outbox.has_more() {
            if let Err(err) = writer.flush().await {
                let _ = cmds.try_send(ConnCmd::Error(err));
                break;
            }
        }
    }

    let parting = fatal.lock().take();
    if let Some(err) = parting {
        let _ = Response::line(err.wire_line()).write_to(&mut writer).await;
    }
    let _ = writer.flush().await;
    let _ = done.send(());
}
