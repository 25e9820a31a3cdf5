// Client facade over a manager's bus

//! # Client
//!
//! What sibling code uses to talk to a manager. A client is a cheap clone of
//! the bus handle plus the manager name; envelopes go in as JSON objects with
//! the reserved `_`-prefixed routing keys.
//!
//! ```text
//! send_sync  → unpack → bus.send  → reply (errors folded into {"error": ...})
//! send_async → unpack → bus.submit → correlation id, reply discarded
//! ```

use std::time::Duration;

use serde_json::Value;
use uuid::Uuid;

use super::bus::{Bus, Subscription};
use crate::models::event::TOPIC_PREFIX;
use crate::models::result::ResultMap;
use crate::models::Message;
use crate::Result;

#[derive(Clone)]
pub struct Client {
    bus: Bus,
    manager: String,
}

impl Client {
    pub fn new(bus: Bus, manager: impl Into<String>) -> Self {
        Self {
            bus,
            manager: manager.into(),
        }
    }

    /// Name of the manager this client talks to
    pub fn manager(&self) -> &str {
        &self.manager
    }

    /// Send an envelope and wait up to `timeout` for the reply
    ///
    /// Failures inside the workflow come back as a reply with an `error`
    /// field. Transport failures (unknown handler, timeout, bus closed) are
    /// returned as errors.
    pub async fn send_sync(&self, envelope: Value, timeout: Duration) -> Result<ResultMap> {
        let message = Message::unpack(envelope)?;
        self.bus.send(message, Some(timeout)).await
    }

    /// Enqueue an envelope without waiting for its result
    pub fn send_async(&self, envelope: Value) -> Result<Uuid> {
        let message = Message::unpack(envelope)?;
        self.bus.submit(message)
    }

    /// Send an already built message, using the bus default timeout when unset
    pub async fn call(&self, message: Message, timeout: Option<Duration>) -> Result<ResultMap> {
        self.bus.send(message, timeout).await
    }

    /// Run a `manage` command, e.g. `["worker", "list"]`
    pub async fn manage(&self, args: Vec<Value>, timeout: Duration) -> Result<ResultMap> {
        self.bus.send(Message::manage(args), Some(timeout)).await
    }

    /// Every event this manager publishes
    pub fn events(&self) -> Subscription {
        self.bus.subscribe(format!("{}/*", TOPIC_PREFIX))
    }
}
