//! Connection authorization gate.
//!
//! With no configured users every connection is pre-authorized. Otherwise a
//! connection must present matching credentials in a CONNECT before any
//! other request, optionally under a deadline.

use crate::protocol::{ProtoError, Request};
use std::collections::HashMap;
use std::future;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::{self, Sleep};

#[derive(Debug)]
pub struct AuthGate {
    users: HashMap<String, String>,
    deadline: Option<Pin<Box<Sleep>>>,
    authorized: bool,
}

impl AuthGate {
    pub fn new(users: HashMap<String, String>, timeout: Duration) -> Self {
        let authorized = users.is_empty();
        let deadline = if !authorized && !timeout.is_zero() {
            Some(Box::pin(time::sleep(timeout)))
        } else {
            None
        };
        Self {
            users,
            deadline,
            authorized,
        }
    }

    pub fn authorized(&self) -> bool {
        self.authorized
    }

    /// Resolves when the authentication deadline passes; pends forever when
    /// no deadline is armed, so it can sit unguarded in a `select!`.
    pub async fn expired(&mut self) {
        match self.deadline.as_mut() {
            Some(sleep) => sleep.as_mut().await,
            None => future::pending().await,
        }
    }

    /// Gate one inbound item. A CONNECT carrying valid credentials
    /// authorizes the connection; anything else before authorization is an
    /// auth failure. `None` represents an inbound item that is not a
    /// request (a malformed line), which is gated all the same.
    pub fn admit(&mut self, request: Option<&Request>) -> Result<(), ProtoError> {
        if self.authorized {
            return Ok(());
        }
        let Some(Request::Connect(options)) = request else {
            return Err(ProtoError::AuthRequired);
        };
        let (Some(user), Some(password)) = (&options.user, &options.password) else {
            return Err(ProtoError::AuthRequired);
        };
        if self.users.get(user) == Some(password) {
            self.authorized = true;
            self.stop();
            Ok(())
        } else {
            Err(ProtoError::AuthFailed)
        }
    }

    /// Disarm the deadline timer.
    pub fn stop(&mut self) {
        self.deadline = None;
    }
}
