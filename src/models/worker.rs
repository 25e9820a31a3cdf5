// Worker descriptors and their lifecycle

//! # Workers
//!
//! A worker is a named task that re-submits a fixed [`Message`] through the
//! workflow executor. The supervisor owns the task; this module only holds the
//! serializable view of it.
//!
//! ## State Machine
//!
//! ```text
//! pending → running ⇄ suspended
//!              ↓
//!     killed | completed | failed
//! ```
//!
//! `killed` is reachable from every non-terminal state. Terminal states never
//! transition again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::message::{Message, MessageSpec, WorkerSpec};
use crate::{EdmpError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Pending,
    Running,
    Suspended,
    Killed,
    Completed,
    Failed,
}

impl WorkerState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkerState::Killed | WorkerState::Completed | WorkerState::Failed
        )
    }

    pub fn can_transition_to(&self, next: WorkerState) -> bool {
        use WorkerState::*;

        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, Killed) => true,
            (current, next) if *current == next => true,
            (Pending, Running) | (Pending, Suspended) | (Pending, Failed) => true,
            (Running, Suspended) | (Running, Completed) | (Running, Failed) => true,
            (Suspended, Running) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Pending => "pending",
            WorkerState::Running => "running",
            WorkerState::Suspended => "suspended",
            WorkerState::Killed => "killed",
            WorkerState::Completed => "completed",
            WorkerState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a supervised worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerDescriptor {
    pub name: String,
    pub message: Message,
    pub state: WorkerState,
    pub created_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    /// Iterations left, `-1` for infinite
    pub loop_remaining: i64,
    pub interval: f64,
    pub delay: f64,
    pub schedule: Option<String>,
    pub kill_upon_suspend: bool,
    pub iterations: u64,
    pub last_error: Option<String>,
}

impl WorkerDescriptor {
    pub fn new(spec: &WorkerSpec, message: Message) -> Self {
        Self {
            name: spec.name.clone(),
            message,
            state: WorkerState::Pending,
            created_at: Utc::now(),
            last_run_at: None,
            next_run_at: None,
            loop_remaining: spec.loop_count,
            interval: spec.interval,
            delay: spec.delay,
            schedule: spec.schedule.clone(),
            kill_upon_suspend: spec.kill_upon_suspend,
            iterations: 0,
            last_error: None,
        }
    }

    /// Move to `next`, rejecting transitions the state machine does not allow
    pub fn transition(&mut self, next: WorkerState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(EdmpError::InvalidInput(format!(
                "worker '{}' cannot go from {} to {}",
                self.name, self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }

    /// Record one finished iteration; returns true when the loop budget is spent
    pub fn record_iteration(&mut self) -> bool {
        self.iterations += 1;
        self.last_run_at = Some(Utc::now());
        if self.loop_remaining > 0 {
            self.loop_remaining -= 1;
        }
        self.loop_remaining == 0
    }
}

fn default_loop() -> i64 {
    -1
}

/// A worker as declared in manager configuration or the admin `worker start` verb
///
/// ```json
/// {"name": "rpm_poller", "handler": "query", "args": ["rpm"], "interval": 5, "loop": -1}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerDefinition {
    pub name: String,
    #[serde(flatten)]
    pub message: MessageSpec,
    #[serde(default)]
    pub interval: f64,
    #[serde(default)]
    pub delay: f64,
    #[serde(rename = "loop", default = "default_loop")]
    pub loop_count: i64,
    #[serde(default)]
    pub schedule: Option<String>,
    #[serde(default)]
    pub kill_upon_suspend: bool,
}

impl WorkerDefinition {
    pub fn into_parts(self) -> Result<(WorkerSpec, Message)> {
        let spec = WorkerSpec {
            name: self.name,
            schedule: self.schedule,
            loop_count: self.loop_count,
            delay: self.delay,
            interval: self.interval,
            kill_upon_suspend: self.kill_upon_suspend,
        };
        let message = self.message.into_message()?;
        Ok((spec, message))
    }

    /// A message carrying this worker spec, ready to submit on the bus
    pub fn into_message(self) -> Result<Message> {
        let (spec, message) = self.into_parts()?;
        Ok(message.with_worker(spec))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_state_machine() {
        use WorkerState::*;

        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Suspended));
        assert!(Suspended.can_transition_to(Running));
        assert!(Suspended.can_transition_to(Killed));
        assert!(Running.can_transition_to(Completed));
        assert!(!Suspended.can_transition_to(Completed));
        assert!(!Killed.can_transition_to(Running));
        assert!(!Completed.can_transition_to(Killed));
        assert!(Failed.is_terminal());
    }

    #[test]
    fn test_descriptor_loop_budget() {
        let spec = WorkerSpec::new("poller").with_loop(2);
        let mut descriptor = WorkerDescriptor::new(&spec, Message::new("query"));
        assert_eq!(descriptor.state, WorkerState::Pending);

        descriptor.transition(WorkerState::Running).unwrap();
        assert!(!descriptor.record_iteration());
        assert!(descriptor.record_iteration());
        descriptor.transition(WorkerState::Completed).unwrap();
        assert!(descriptor.transition(WorkerState::Running).is_err());
    }

    #[test]
    fn test_infinite_loop_never_completes() {
        let spec = WorkerSpec::new("poller");
        let mut descriptor = WorkerDescriptor::new(&spec, Message::new("query"));
        for _ in 0..5 {
            assert!(!descriptor.record_iteration());
        }
        assert_eq!(descriptor.loop_remaining, -1);
        assert_eq!(descriptor.iterations, 5);
    }

    #[test]
    fn test_definition_from_configuration() {
        let definition: WorkerDefinition = serde_json::from_value(json!({
            "name": "rpm_poller",
            "handler": "query",
            "args": ["rpm"],
            "interval": 5,
            "loop": 3,
        }))
        .unwrap();

        let message = definition.into_message().unwrap();
        let worker = message.routing.worker.clone().unwrap();
        assert_eq!(worker.name, "rpm_poller");
        assert_eq!(worker.loop_count, 3);
        assert_eq!(worker.interval, 5.0);
        assert_eq!(message.handler(), Some("query"));
        assert_eq!(message.args, vec![json!("rpm")]);
    }
}
