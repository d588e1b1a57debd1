//! Global broker counters.
//!
//! Incremented from connection tasks and the server actor alike, so every
//! counter is an atomic. The metrics endpoint of the original server is out
//! of scope; the counters feed logs and tests through `snapshot()`.

use crate::protocol::{ProtoError, Verb};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Stats {
    ops: [AtomicU64; Verb::ALL.len()],
    msg_sent: AtomicU64,
    msg_recv: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_recv: AtomicU64,
    slow_consumer: AtomicU64,
    payload_too_big: AtomicU64,
    bad_auth: AtomicU64,
    unresponsive: AtomicU64,
    unknown_ops: AtomicU64,
    errors: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub ops: BTreeMap<&'static str, u64>,
    pub msg_sent: u64,
    pub msg_recv: u64,
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub slow_consumer: u64,
    pub payload_too_big: u64,
    pub bad_auth: u64,
    pub unresponsive: u64,
    pub unknown_ops: u64,
    pub errors: u64,
}

impl Stats {
    pub fn record_op(&self, verb: Verb) {
        self.ops[verb.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unknown_op(&self) {
        self.unknown_ops.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a published message accepted by the actor.
    pub fn record_msg_in(&self, bytes: usize) {
        self.msg_recv.fetch_add(1, Ordering::Relaxed);
        self.bytes_recv.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Count one delivery handed to a connection.
    pub fn record_msg_out(&self, bytes: usize) {
        self.msg_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Count a connection closed with a protocol error.
    pub fn record_close_error(&self, err: ProtoError) {
        let counter = match err {
            ProtoError::SlowConsumer => &self.slow_consumer,
            ProtoError::PayloadTooBig => &self.payload_too_big,
            ProtoError::AuthRequired | ProtoError::AuthFailed => &self.bad_auth,
            ProtoError::Unresponsive => &self.unresponsive,
            _ => &self.errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let mut ops = BTreeMap::new();
        for verb in Verb::ALL {
            ops.insert(verb.name(), self.ops[verb.index()].load(Ordering::Relaxed));
        }
        StatsSnapshot {
            ops,
            msg_sent: self.msg_sent.load(Ordering::Relaxed),
            msg_recv: self.msg_recv.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_recv: self.bytes_recv.load(Ordering::Relaxed),
            slow_consumer: self.slow_consumer.load(Ordering::Relaxed),
            payload_too_big: self.payload_too_big.load(Ordering::Relaxed),
            bad_auth: self.bad_auth.load(Ordering::Relaxed),
            unresponsive: self.unresponsive.load(Ordering::Relaxed),
            unknown_ops: self.unknown_ops.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}
