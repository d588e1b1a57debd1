//! The broker server: TCP listener, per-connection spawning, and the
//! single-threaded actor that owns the subscription trie and fans published
//! messages out to matching connections.

pub mod command;
pub mod stats;

use crate::config::Config;
use crate::messaging::trie::{SubjectTrie, WildcardMatcher};
use crate::messaging::{Message, SubscribedMessage, Subscription};
use crate::net::conn;
use anyhow::{Context, Result};
use bytes::Bytes;
use command::ServerCmd;
use rand::Rng;
use serde::Serialize;
use stats::Stats;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

const SERVER_BACKLOG: usize = 1024;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The INFO greeting blob, advertised to every client.
#[derive(Debug, Serialize)]
struct Info<'a> {
    server_id: &'a str,
    host: String,
    port: u16,
    version: &'a str,
    auth_required: bool,
    ssl_required: bool,
    max_payload: usize,
}

/// Shared server context handed to every connection actor.
#[derive(Clone)]
pub(crate) struct ServerHandle {
    commands: mpsc::Sender<ServerCmd>,
    config: Arc<Config>,
    stats: Arc<Stats>,
    info: Bytes,
}

impl ServerHandle {
    pub fn commands(&self) -> &mpsc::Sender<ServerCmd> {
        &self.commands
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn info(&self) -> Bytes {
        self.info.clone()
    }
}

/// A bound broker, ready to run.
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    handle: ServerHandle,
    commands_rx: mpsc::Receiver<ServerCmd>,
}

impl Server {
    /// Validate the configuration, bind the listener, and build the INFO
    /// blob from the bound address.
    pub async fn bind(config: Config) -> Result<Self> {
        config.validate()?;
        let listener = TcpListener::bind(&config.bind_address)
            .await
            .with_context(|| format!("failed to bind on {}", config.bind_address))?;
        let local_addr = listener.local_addr().context("listener local address")?;

        let server_id = Uuid::new_v4().to_string();
        let info = Info {
            server_id: &server_id,
            host: local_addr.ip().to_string(),
            port: local_addr.port(),
            version: VERSION,
            auth_required: config.auth_required(),
            ssl_required: false,
            max_payload: config.limits.payload,
        };
        let blob = serde_json::to_vec(&info).context("encode INFO blob")?;

        let (commands_tx, commands_rx) = mpsc::channel(SERVER_BACKLOG);
        let handle = ServerHandle {
            commands: commands_tx,
            config: Arc::new(config),
            stats: Arc::new(Stats::default()),
            info: Bytes::from(blob),
        };

        Ok(Self {
            listener,
            local_addr,
            handle,
            commands_rx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Global counters; clone before `run` to observe a live broker.
    pub fn stats(&self) -> Arc<Stats> {
        self.handle.stats.clone()
    }

    /// Run the actor and the accept loop until the process ends.
    pub async fn run(self) -> Result<()> {
        let Self {
            listener,
            local_addr,
            handle,
            commands_rx,
        } = self;

        let config = handle.config();
        info!(
            "listening on {} [auth: {}] [users: {}]",
            local_addr,
            config.auth_required(),
            config.auth.users.len()
        );

        let actor = ServerActor {
            subscriptions: SubjectTrie::new(),
            stats: handle.stats.clone(),
        };
        tokio::spawn(actor.run(commands_rx));

        let connections = Arc::new(AtomicI64::new(0));
        let next_conn_id = AtomicU64::new(0);
        loop {
            let (stream, remote) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!("accept error: {err:?}");
                    continue;
                }
            };
            let conn_id = next_conn_id.fetch_add(1, Ordering::Relaxed) + 1;
            let live = connections.fetch_add(1, Ordering::SeqCst) + 1;
            let limit = handle.config().limits.connections;
            let over_limit = limit > 0 && live > i64::from(limit);

            let handle = handle.clone();
            let connections = connections.clone();
            tokio::spawn(async move {
                conn::handle(handle, stream, remote, conn_id, over_limit).await;
                connections.fetch_sub(1, Ordering::SeqCst);
            });
        }
    }
}

/// Exclusive owner of the subscription trie; processes commands one at a
/// time, so fan-out and trie mutation never race.
struct ServerActor {
    subscriptions: SubjectTrie<Arc<Subscription>>,
    stats: Arc<Stats>,
}

impl ServerActor {
    async fn run(mut self, mut commands: mpsc::Receiver<ServerCmd>) {
        while let Some(cmd) = commands.recv().await {
            self.process(cmd).await;
        }
    }

    async fn process(&mut self, cmd: ServerCmd) {
        match cmd {
            ServerCmd::Subscribe { subscription, done } => {
                let subject = subscription.subject.clone();
                self.subscriptions.insert(&subject, subscription);
                let _ = done.send(());
            }
            ServerCmd::Unsubscribe {
                subscription,
                max_responses,
                done,
            } => {
                if let Some(max) = max_responses.filter(|max| *max > 0) {
                    subscription.set_max_responses(max);
                    if subscription.responses() < max {
                        let _ = done.send(false);
                        return;
                    }
                }
                self.subscriptions
                    .delete(&subscription.subject, &subscription);
                let _ = done.send(true);
            }
            ServerCmd::Publish { message } => self.publish(message).await,
            ServerCmd::UnregisterConn {
                subscriptions,
                done,
            } => {
                for subscription in &subscriptions {
                    self.subscriptions
                        .delete(&subscription.subject, subscription);
                }
                let _ = done.send(());
            }
        }
    }

    /// Deliver to every plain match, and to one random member per queue
    /// group.
    async fn publish(&mut self, message: Arc<Message>) {
        self.stats.record_msg_in(message.content.len());

        let matches = self.subscriptions.matches(&message.subject, &WildcardMatcher);
        let mut queue_groups: HashMap<String, Vec<Arc<Subscription>>> = HashMap::new();
        for subscription in matches {
            match subscription.queue.clone() {
                Some(queue) => queue_groups.entry(queue).or_default().push(subscription),
                None => self.deliver(&subscription, &message).await,
            }
        }
        for members in queue_groups.into_values() {
            let chosen = rand::thread_rng().gen_range(0..members.len());
            self.deliver(&members[chosen], &message).await;
        }
    }

    /// One-way handoff onto the subscription's connection, enforcing the
    /// auto-unsubscribe threshold.
    async fn deliver(&mut self, subscription: &Arc<Subscription>, message: &Arc<Message>) {
        let responses = subscription.record_response();
        let max = subscription.max_responses();
        let mut last = false;
        if max > 0 && responses >= max {
            self.subscriptions.delete(&subscription.subject, subscription);
            last = true;
        }
        subscription
            .deliver(SubscribedMessage {
                subscription: subscription.clone(),
                message: message.clone(),
                last,
            })
            .await;
        self.stats.record_msg_out(message.content.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::DeliveryHandle;
    use bytes::Bytes;
    use tokio::sync::oneshot;

    fn actor() -> ServerActor {
        ServerActor {
            subscriptions: SubjectTrie::new(),
            stats: Arc::new(Stats::default()),
        }
    }

    fn subscription(
        sid: u64,
        subject: &str,
        queue: Option<&str>,
    ) -> (Arc<Subscription>, mpsc::Receiver<SubscribedMessage>) {
        let (tx, rx) = mpsc::channel(16);
        let subscription = Arc::new(Subscription::new(
            sid,
            subject.to_string(),
            queue.map(str::to_string),
            1,
            DeliveryHandle::new(tx),
        ));
        (subscription, rx)
    }

    fn message(subject: &str, content: &'static [u8]) -> Arc<Message> {
        Arc::new(Message {
            subject: subject.to_string(),
            reply_to: None,
            content: Bytes::from_static(content),
        })
    }

    async fn subscribe(actor: &mut ServerActor, subscription: Arc<Subscription>) {
        let (done, ack) = oneshot::channel();
        actor
            .process(ServerCmd::Subscribe { subscription, done })
            .await;
        ack.await.unwrap();
    }

    #[tokio::test]
    async fn publish_reaches_plain_and_wildcard_subscribers() {
        let mut actor = actor();
        let (plain, mut plain_rx) = subscription(1, "foo.bar", None);
        let (wild, mut wild_rx) = subscription(2, "foo.*", None);
        let (other, mut other_rx) = subscription(3, "baz", None);
        subscribe(&mut actor, plain).await;
        subscribe(&mut actor, wild).await;
        subscribe(&mut actor, other).await;

        actor
            .process(ServerCmd::Publish {
                message: message("foo.bar", b"hey"),
            })
            .await;

        assert_eq!(plain_rx.recv().await.unwrap().message.subject, "foo.bar");
        assert_eq!(wild_rx.recv().await.unwrap().subscription.id, 2);
        assert!(other_rx.try_recv().is_err());
        assert_eq!(actor.stats.snapshot().msg_sent, 2);
    }

    #[tokio::test]
    async fn queue_group_delivers_to_exactly_one_member() {
        let mut actor = actor();
        let (first, mut first_rx) = subscription(1, "work", Some("q1"));
        let (second, mut second_rx) = subscription(2, "work", Some("q1"));
        subscribe(&mut actor, first).await;
        subscribe(&mut actor, second).await;

        for _ in 0..8 {
            actor
                .process(ServerCmd::Publish {
                    message: message("work", b"X"),
                })
                .await;
        }

        let mut delivered = 0;
        while first_rx.try_recv().is_ok() {
            delivered += 1;
        }
        while second_rx.try_recv().is_ok() {
            delivered += 1;
        }
        assert_eq!(delivered, 8);
    }

    #[tokio::test]
    async fn queue_group_of_one_still_delivers() {
        let mut actor = actor();
        let (only, mut only_rx) = subscription(1, "work", Some("q1"));
        subscribe(&mut actor, only).await;

        actor
            .process(ServerCmd::Publish {
                message: message("work", b"X"),
            })
            .await;

        assert!(only_rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn unsubscribe_with_threshold_defers_removal() {
        let mut actor = actor();
        let (sub, mut rx) = subscription(7, "foo", None);
        subscribe(&mut actor, sub.clone()).await;

        let (done, ack) = oneshot::channel();
        actor
            .process(ServerCmd::Unsubscribe {
                subscription: sub.clone(),
                max_responses: Some(2),
                done,
            })
            .await;
        assert!(!ack.await.unwrap());
        assert_eq!(actor.subscriptions.value_count(), 1);

        actor
            .process(ServerCmd::Publish {
                message: message("foo", b"a"),
            })
            .await;
        let first = rx.recv().await.unwrap();
        assert!(!first.last);
        assert_eq!(actor.subscriptions.value_count(), 1);

        actor
            .process(ServerCmd::Publish {
                message: message("foo", b"b"),
            })
            .await;
        let second = rx.recv().await.unwrap();
        assert!(second.last);
        assert_eq!(actor.subscriptions.value_count(), 0);

        // A third publish finds no subscription.
        actor
            .process(ServerCmd::Publish {
                message: message("foo", b"c"),
            })
            .await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsubscribe_past_threshold_removes_immediately() {
        let mut actor = actor();
        let (sub, mut rx) = subscription(7, "foo", None);
        subscribe(&mut actor, sub.clone()).await;

        actor
            .process(ServerCmd::Publish {
                message: message("foo", b"a"),
            })
            .await;
        rx.recv().await.unwrap();

        let (done, ack) = oneshot::channel();
        actor
            .process(ServerCmd::Unsubscribe {
                subscription: sub,
                max_responses: Some(1),
                done,
            })
            .await;
        assert!(ack.await.unwrap());
        assert_eq!(actor.subscriptions.value_count(), 0);
    }

    #[tokio::test]
    async fn unregister_clears_every_subscription_of_the_connection() {
        let mut actor = actor();
        let (first, _first_rx) = subscription(1, "foo", None);
        let (second, _second_rx) = subscription(2, "bar.*", None);
        subscribe(&mut actor, first.clone()).await;
        subscribe(&mut actor, second.clone()).await;
        assert_eq!(actor.subscriptions.value_count(), 2);

        let (done, ack) = oneshot::channel();
        actor
            .process(ServerCmd::UnregisterConn {
                subscriptions: vec![first, second],
                done,
            })
            .await;
        ack.await.unwrap();
        assert_eq!(actor.subscriptions.value_count(), 0);
        assert_eq!(actor.subscriptions.node_count(), 0);
    }
}
