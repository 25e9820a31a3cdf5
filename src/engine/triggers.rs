// Built-in triggers turning results into events

//! # Built-in Triggers
//!
//! - [`EngineStateTrigger`] watches an rpm reading and publishes
//!   `engine/running` or `engine/stopped` on every change.
//! - [`RecurrenceTrigger`] publishes `<prefix>/<state>` once a state has been
//!   seen a number of times in a row, and only once per streak.
//!
//! Both keep their memory per trigger instance, never in the result.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use super::events::EventPublisher;
use super::registry::{ExtensionRegistry, Trigger};
use crate::models::event::tags::{self, EngineState};
use crate::models::result::{self, ResultMap};
use crate::models::Message;
use crate::Result;

/// Edge-triggered engine state from rpm readings
pub struct EngineStateTrigger {
    /// Result field holding the rpm
    field: String,
    /// The engine counts as running above this rpm
    threshold: f64,
    last: Mutex<Option<EngineState>>,
}

impl EngineStateTrigger {
    pub fn new(field: impl Into<String>, threshold: f64) -> Self {
        Self {
            field: field.into(),
            threshold,
            last: Mutex::new(None),
        }
    }
}

impl Default for EngineStateTrigger {
    fn default() -> Self {
        Self::new(result::VALUE, 0.0)
    }
}

#[async_trait]
impl Trigger for EngineStateTrigger {
    async fn fire(&self, _message: &Message, result: &ResultMap, events: &EventPublisher) -> Result<()> {
        let Some(rpm) = result.get(&self.field).and_then(Value::as_f64) else {
            return Ok(());
        };
        let state = if rpm > self.threshold {
            EngineState::Running
        } else {
            EngineState::Stopped
        };

        let changed = {
            let mut last = self.last.lock().unwrap_or_else(|p| p.into_inner());
            let changed = *last != Some(state);
            *last = Some(state);
            changed
        };
        if changed {
            debug!(%state, rpm, "engine state changed");
            events.emit(tags::engine(state), json!({"rpm": rpm}))?;
        }
        Ok(())
    }
}

#[derive(Default)]
struct Streak {
    state: Option<String>,
    count: usize,
}

/// Emits `<prefix>/<state>` after `threshold` consecutive identical states
pub struct RecurrenceTrigger {
    /// Fixed tag prefix; derived from the result's `_type` when unset
    prefix: Option<String>,
    key: String,
    threshold: usize,
    streaks: Mutex<HashMap<String, Streak>>,
}

impl RecurrenceTrigger {
    pub fn new(prefix: Option<String>, key: impl Into<String>, threshold: usize) -> Self {
        Self {
            prefix,
            key: key.into(),
            threshold: threshold.max(1),
            streaks: Mutex::new(HashMap::new()),
        }
    }

    fn prefix_for(&self, result: &ResultMap) -> Option<String> {
        self.prefix
            .clone()
            .or_else(|| result::type_of(result).map(|kind| kind.replace('.', "/")))
    }
}

impl Default for RecurrenceTrigger {
    fn default() -> Self {
        Self::new(None, "state", 3)
    }
}

#[async_trait]
impl Trigger for RecurrenceTrigger {
    async fn fire(&self, _message: &Message, result: &ResultMap, events: &EventPublisher) -> Result<()> {
        let Some(prefix) = self.prefix_for(result) else {
            return Ok(());
        };
        let state = match result.get(&self.key) {
            Some(Value::String(state)) => state.clone(),
            Some(Value::Null) | None => return Ok(()),
            Some(other) => other.to_string(),
        };

        let reached = {
            let mut streaks = self.streaks.lock().unwrap_or_else(|p| p.into_inner());
            let streak = streaks.entry(prefix.clone()).or_default();
            if streak.state.as_deref() == Some(state.as_str()) {
                streak.count += 1;
            } else {
                streak.state = Some(state.clone());
                streak.count = 1;
            }
            streak.count == self.threshold
        };

        if reached {
            events.emit(format!("{}/{}", prefix, state), json!({"count": self.threshold}))?;
        }
        Ok(())
    }
}

/// Register `engine_state` and `recurrence`
pub fn register_builtin_triggers(registry: &ExtensionRegistry) {
    registry.register_trigger("engine_state", Arc::new(EngineStateTrigger::default()));
    registry.register_trigger("recurrence", Arc::new(RecurrenceTrigger::default()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::bus::{Bus, Subscription};

    fn publisher() -> (EventPublisher, Subscription) {
        let events = EventPublisher::new(Bus::default(), "test", Vec::new(), false);
        let subscription = events.subscribe();
        (events, subscription)
    }

    fn tags_seen(subscription: &mut Subscription) -> Vec<String> {
        let mut seen = Vec::new();
        while let Some(publication) = subscription.try_recv() {
            if let Some(event) = publication.event() {
                seen.push(event.tag.clone());
            }
        }
        seen
    }

    fn result(value: Value) -> ResultMap {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[tokio::test]
    async fn test_engine_state_is_edge_triggered() {
        let (events, mut subscription) = publisher();
        let trigger = EngineStateTrigger::new("value", 400.0);
        let message = Message::new("query");

        for rpm in [0, 0, 850, 900, 300, 0] {
            trigger
                .fire(&message, &result(json!({"value": rpm})), &events)
                .await
                .unwrap();
        }
        // Non-numeric readings are ignored
        trigger.fire(&message, &result(json!({"value": "n/a"})), &events).await.unwrap();

        assert_eq!(
            tags_seen(&mut subscription),
            vec!["engine/stopped", "engine/running", "engine/stopped"]
        );
    }

    #[tokio::test]
    async fn test_recurrence_fires_once_per_streak() {
        let (events, mut subscription) = publisher();
        let trigger = RecurrenceTrigger::new(Some("vehicle/motion".to_string()), "state", 2);
        let message = Message::new("motion");

        for state in ["moving", "moving", "moving", "idle", "moving", "moving"] {
            trigger
                .fire(&message, &result(json!({"state": state})), &events)
                .await
                .unwrap();
        }
        assert_eq!(
            tags_seen(&mut subscription),
            vec!["vehicle/motion/moving", "vehicle/motion/moving"]
        );
    }

    #[tokio::test]
    async fn test_recurrence_prefix_from_type() {
        let (events, mut subscription) = publisher();
        let trigger = RecurrenceTrigger::new(None, "state", 1);
        trigger
            .fire(
                &Message::new("acc"),
                &result(json!({"_type": "acc.orientation", "state": "flat"})),
                &events,
            )
            .await
            .unwrap();
        assert_eq!(tags_seen(&mut subscription), vec!["acc/orientation/flat"]);
    }
}
