//! Server-initiated heartbeats.
//!
//! When enabled, a ticker fires every `ping.interval`; each fire sends a
//! PING and counts it outstanding. A client PONG pays one back. A client
//! that falls more than `ping.max_outstanding` PINGs behind is declared
//! unresponsive.

use std::future;
use std::time::Duration;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};

/// Verdict of one ticker fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Beat {
    /// Send a PING to the client.
    Ping,
    /// The client is too far behind; drop it.
    Unresponsive,
}

#[derive(Debug)]
pub struct Heartbeat {
    ticker: Option<Interval>,
    outstanding: u32,
    max_outstanding: u32,
}

impl Heartbeat {
    /// A zero interval disables heartbeats entirely.
    pub fn new(interval: Duration, max_outstanding: u32) -> Self {
        let ticker = if interval.is_zero() {
            None
        } else {
            let mut ticker = time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            Some(ticker)
        };
        Self {
            ticker,
            outstanding: 0,
            max_outstanding,
        }
    }

    /// Resolves on the next ticker fire; pends forever when disabled, so it
    /// can sit unguarded in a `select!`.
    pub async fn tick(&mut self) {
        match self.ticker.as_mut() {
            Some(ticker) => {
                ticker.tick().await;
            }
            None => future::pending().await,
        }
    }

    /// Account one ticker fire.
    pub fn fire(&mut self) -> Beat {
        self.outstanding += 1;
        if self.outstanding > self.max_outstanding {
            Beat::Unresponsive
        } else {
            Beat::Ping
        }
    }

    /// Account a client PONG; saturates at zero.
    pub fn pong(&mut self) {
        self.outstanding = self.outstanding.saturating_sub(1);
    }

    pub fn stop(&mut self) {
        self.ticker = None;
    }
}
