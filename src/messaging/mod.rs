//! Messaging primitives shared between connections and the server actor.
//!
//! - `trie` - Subject trie with wildcard matching
//! - `outbox` - Bounded outbound queue with batched handoff

pub mod outbox;
pub mod trie;

use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// An immutable published message, shared across every delivery.
#[derive(Debug, Clone)]
pub struct Message {
    pub subject: String,
    pub reply_to: Option<String>,
    pub content: Bytes,
}

/// Capability handed to the server actor for delivering messages to one
/// connection. Revoked by removing the subscription from the trie; a send
/// to a closed connection is silently dropped.
#[derive(Debug, Clone)]
pub struct DeliveryHandle {
    tx: mpsc::Sender<SubscribedMessage>,
}

impl DeliveryHandle {
    pub fn new(tx: mpsc::Sender<SubscribedMessage>) -> Self {
        Self { tx }
    }

    pub async fn deliver(&self, message: SubscribedMessage) {
        let _ = self.tx.send(message).await;
    }
}

/// A client subscription. Identity is `(conn_id, id)`; the sid is unique
/// only within its owning connection.
///
/// `responses`/`max_responses` are written solely by the server actor; they
/// are atomics because the subscription itself is shared via `Arc` with the
/// owning connection's sid map.
#[derive(Debug)]
pub struct Subscription {
    pub id: u64,
    pub subject: String,
    pub queue: Option<String>,
    pub conn_id: u64,
    delivery: DeliveryHandle,
    /// Auto-unsubscribe threshold; zero means unlimited.
    max_responses: AtomicU64,
    responses: AtomicU64,
}

impl Subscription {
    pub fn new(
        id: u64,
        subject: String,
        queue: Option<String>,
        conn_id: u64,
        delivery: DeliveryHandle,
    ) -> Self {
        Self {
            id,
            subject,
            queue,
            conn_id,
            delivery,
            max_responses: AtomicU64::new(0),
            responses: AtomicU64::new(0),
        }
    }

    /// Count one delivery; returns the new total.
    pub fn record_response(&self) -> u64 {
        self.responses.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn responses(&self) -> u64 {
        self.responses.load(Ordering::Relaxed)
    }

    pub fn set_max_responses(&self, max: u64) {
        self.max_responses.store(max, Ordering::Relaxed);
    }

    pub fn max_responses(&self) -> u64 {
        self.max_responses.load(Ordering::Relaxed)
    }

    pub async fn deliver(&self, message: SubscribedMessage) {
        self.delivery.deliver(message).await;
    }
}

impl PartialEq for Subscription {
    fn eq(&self, other: &Self) -> bool {
        self.conn_id == other.conn_id && self.id == other.id
    }
}

impl Eq for Subscription {}

/// A delivery record pairing a subscription with a message. `last` is set
/// when this delivery triggered auto-unsubscribe.
#[derive(Debug, Clone)]
pub struct SubscribedMessage {
    pub subscription: Arc<Subscription>,
    pub message: Arc<Message>,
    pub last: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscription(conn_id: u64, id: u64) -> Subscription {
        let (tx, _rx) = mpsc::channel(1);
        Subscription::new(id, "foo".into(), None, conn_id, DeliveryHandle::new(tx))
    }

    #[test]
    fn identity_is_conn_and_sid() {
        assert_eq!(subscription(1, 7), subscription(1, 7));
        assert_ne!(subscription(1, 7), subscription(2, 7));
        assert_ne!(subscription(1, 7), subscription(1, 8));
    }

    #[test]
    fn response_accounting_is_monotonic() {
        let sub = subscription(1, 1);
        assert_eq!(sub.responses(), 0);
        assert_eq!(sub.record_response(), 1);
        assert_eq!(sub.record_response(), 2);
        assert_eq!(sub.responses(), 2);
        sub.set_max_responses(2);
        assert!(sub.responses() >= sub.max_responses());
    }
}
