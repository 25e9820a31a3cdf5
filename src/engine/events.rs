// Event publisher for tag-namespaced events

//! # Event System
//!
//! This module provides the publisher every trigger, worker and the processor
//! itself use to put [`Event`]s on the bus. It handles:
//! - Topic derivation (`event/<tag-head>`)
//! - Duplicate suppression keyed by tag glob
//! - Lifecycle events for workers and the manager service
//!
//! ## Duplicate Suppression
//!
//! With a filter such as `vehicle/position/*`, publishing the same `(tag, data)`
//! twice in a row emits only once. The last event is remembered per glob, so a
//! different tag under the same glob resets the streak. The cache is scoped to
//! this process.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::debug;

use super::bus::{Bus, Payload, Subscription};
use crate::models::event::tags::{self, ServiceEvent, WorkerEvent};
use crate::models::event::TOPIC_PREFIX;
use crate::models::Event;
use crate::{EdmpError, Result};

struct PublisherInner {
    bus: Bus,
    manager: String,
    skip_duplicates: Vec<String>,
    last: Mutex<HashMap<String, (String, Value)>>,
    lifecycle: bool,
}

/// Publisher for events on one manager's bus
#[derive(Clone)]
pub struct EventPublisher {
    inner: Arc<PublisherInner>,
}

impl EventPublisher {
    /// Create a publisher
    ///
    /// `skip_duplicates` lists the tag globs under which repeated events are
    /// suppressed; `lifecycle` enables worker and service lifecycle events.
    pub fn new(bus: Bus, manager: impl Into<String>, skip_duplicates: Vec<String>, lifecycle: bool) -> Self {
        Self {
            inner: Arc::new(PublisherInner {
                bus,
                manager: manager.into(),
                skip_duplicates,
                last: Mutex::new(HashMap::new()),
                lifecycle,
            }),
        }
    }

    pub fn manager(&self) -> &str {
        &self.inner.manager
    }

    pub fn lifecycle_enabled(&self) -> bool {
        self.inner.lifecycle
    }

    /// Publish an event; returns false when it was suppressed as a duplicate
    pub fn publish(&self, event: Event) -> Result<bool> {
        self.publish_with(event, None)
    }

    /// Publish an event with an extra one-off duplicate filter
    pub fn publish_with(&self, event: Event, skip_duplicates_filter: Option<&str>) -> Result<bool> {
        if self.inner.bus.is_closed() {
            return Err(EdmpError::Cancelled(format!(
                "bus closed, dropping event '{}'",
                event.tag
            )));
        }

        let globs: Vec<&str> = self
            .inner
            .skip_duplicates
            .iter()
            .map(String::as_str)
            .chain(skip_duplicates_filter)
            .filter(|glob| event.matches(glob))
            .collect();

        if !globs.is_empty() {
            let mut last = self.inner.last.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let duplicate = globs.iter().any(|glob| {
                last.get(*glob)
                    .map_or(false, |(tag, data)| *tag == event.tag && *data == event.data)
            });
            if duplicate {
                debug!(tag = %event.tag, "suppressing duplicate event");
                return Ok(false);
            }
            for glob in globs {
                last.insert(glob.to_string(), (event.tag.clone(), event.data.clone()));
            }
        }

        debug!(tag = %event.tag, "publishing event");
        self.inner.bus.publish(event.topic(), Payload::Event(event));
        Ok(true)
    }

    /// Build and publish an event from a tag and data
    pub fn emit(&self, tag: impl Into<String>, data: Value) -> Result<bool> {
        self.publish(Event::new(tag, data))
    }

    /// Publish a worker lifecycle event
    ///
    /// `failed` is always published; the other states only when lifecycle
    /// events are enabled.
    pub fn emit_worker(&self, name: &str, event: WorkerEvent, data: Value) -> Result<bool> {
        if event != WorkerEvent::Failed && !self.inner.lifecycle {
            return Ok(false);
        }
        self.emit(tags::worker(name, event), data)
    }

    /// Publish `system/service/<manager>/<event>` when lifecycle events are enabled
    pub fn emit_service(&self, event: ServiceEvent, data: Value) -> Result<bool> {
        if !self.inner.lifecycle {
            return Ok(false);
        }
        self.emit(tags::service(&self.inner.manager, event), data)
    }

    /// Subscribe to every event topic
    pub fn subscribe(&self) -> Subscription {
        self.inner.bus.subscribe(format!("{}/*", TOPIC_PREFIX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::event::tags::{PositionState, ServiceEvent};
    use serde_json::json;

    fn publisher(skip: &[&str], lifecycle: bool) -> (EventPublisher, Subscription) {
        let bus = Bus::default();
        let events = EventPublisher::new(
            bus,
            "obd_manager",
            skip.iter().map(|s| s.to_string()).collect(),
            lifecycle,
        );
        let subscription = events.subscribe();
        (events, subscription)
    }

    fn drain(subscription: &mut Subscription) -> Vec<String> {
        let mut tags = Vec::new();
        while let Some(publication) = subscription.try_recv() {
            if let Some(event) = publication.event() {
                tags.push(event.tag.clone());
            }
        }
        tags
    }

    #[tokio::test]
    async fn test_duplicate_suppression_per_glob() {
        let (events, mut subscription) = publisher(&["vehicle/position/*"], false);
        let standstill = tags::position(PositionState::Standstill);

        assert!(events.emit(standstill.clone(), json!({"speed": 0})).unwrap());
        assert!(!events.emit(standstill.clone(), json!({"speed": 0})).unwrap());
        // Different data is not a duplicate
        assert!(events.emit(standstill.clone(), json!({"speed": 1})).unwrap());
        // Tags outside the glob are never suppressed
        assert!(events.emit("engine/running", json!({})).unwrap());
        assert!(events.emit("engine/running", json!({})).unwrap());

        assert_eq!(
            drain(&mut subscription),
            vec![
                "vehicle/position/standstill".to_string(),
                "vehicle/position/standstill".to_string(),
                "engine/running".to_string(),
                "engine/running".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_one_off_filter() {
        let (events, mut subscription) = publisher(&[], false);
        let event = || Event::new("battery/charging", json!({"level": 80}));

        assert!(events.publish_with(event(), Some("battery/*")).unwrap());
        assert!(!events.publish_with(event(), Some("battery/*")).unwrap());
        assert!(events.publish(event()).unwrap());
        assert_eq!(drain(&mut subscription).len(), 2);
    }

    #[tokio::test]
    async fn test_lifecycle_gating() {
        let (quiet, mut quiet_sub) = publisher(&[], false);
        assert!(!quiet.emit_service(ServiceEvent::Started, json!({})).unwrap());
        assert!(!quiet.emit_worker("poller", WorkerEvent::Started, json!({})).unwrap());
        assert!(quiet.emit_worker("poller", WorkerEvent::Failed, json!({"error": "x"})).unwrap());
        assert_eq!(drain(&mut quiet_sub), vec!["worker/poller/failed".to_string()]);

        let (loud, mut loud_sub) = publisher(&[], true);
        assert!(loud.emit_service(ServiceEvent::Started, json!({})).unwrap());
        assert_eq!(drain(&mut loud_sub), vec!["system/service/obd_manager/started".to_string()]);
    }

    #[tokio::test]
    async fn test_events_travel_on_head_topic() {
        let bus = Bus::default();
        let events = EventPublisher::new(bus.clone(), "m", Vec::new(), false);
        let mut system = bus.subscribe("event/system");

        events.emit("engine/running", json!({})).unwrap();
        events.emit("system/power/sleep", json!({})).unwrap();

        let publication = system.recv().await.unwrap();
        assert_eq!(publication.event().unwrap().tag, "system/power/sleep");
    }
}
