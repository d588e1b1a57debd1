//! Commands consumed sequentially by the server actor.
//!
//! Because the actor processes one command at a time, the subscription trie
//! needs no lock. Acknowledgements ride on oneshot channels so a send can
//! never block the actor.

use crate::messaging::{Message, Subscription};
use std::sync::Arc;
use tokio::sync::oneshot;

pub enum ServerCmd {
    /// Insert a subscription into the trie.
    Subscribe {
        subscription: Arc<Subscription>,
        done: oneshot::Sender<()>,
    },
    /// Remove a subscription, or arm its auto-unsubscribe threshold.
    /// Acks `true` when the subscription left the trie.
    Unsubscribe {
        subscription: Arc<Subscription>,
        max_responses: Option<u64>,
        done: oneshot::Sender<bool>,
    },
    /// Fan a published message out to every matching subscription.
    Publish { message: Arc<Message> },
    /// Remove every subscription of a closing connection.
    UnregisterConn {
        subscriptions: Vec<Arc<Subscription>>,
        done: oneshot::Sender<()>,
    },
}
