// Worker supervisor for named, schedulable tasks

//! # Worker Supervisor
//!
//! A worker is a named task that re-submits one message through the bus on a
//! schedule. The supervisor owns the registry of live workers and their control
//! channels:
//!
//! - `start` registers a worker (duplicate names are rejected) and honors its `delay`
//! - `pause` / `resume` toggle a suspend flag the loop waits on
//! - `kill` cancels the worker; sleeps wake immediately, an in-flight iteration finishes
//! - `list` / `show` take a snapshot of the registry filtered by a `*` glob
//!
//! The worker loop never holds a registry guard while the message executes.
//! Each worker only owns its descriptor, a cancellation token and a suspend flag.
//!
//! ## Scheduling
//!
//! Iterations run back to back separated by `interval` seconds, or on the ticks
//! of a cron `schedule` (seconds field first) when one is configured. `loop` is
//! the iteration budget; `-1` means forever.

use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::json;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::bus::Bus;
use super::events::EventPublisher;
use crate::models::event::tags::WorkerEvent;
use crate::models::{Message, WorkerDescriptor, WorkerSpec, WorkerState};
use crate::utils::{glob_match, secs};
use crate::{EdmpError, Result};

/// Control block of one live worker
struct WorkerHandle {
    descriptor: Arc<Mutex<WorkerDescriptor>>,
    cancel: CancellationToken,
    suspend: watch::Sender<bool>,
}

impl WorkerHandle {
    fn snapshot(&self) -> WorkerDescriptor {
        lock(&self.descriptor).clone()
    }
}

fn announce(events: &EventPublisher, name: &str, event: WorkerEvent, data: serde_json::Value) {
    if let Err(e) = events.emit_worker(name, event, data) {
        warn!(worker = %name, error = %e, "failed to publish worker event");
    }
}

fn lock(descriptor: &Mutex<WorkerDescriptor>) -> std::sync::MutexGuard<'_, WorkerDescriptor> {
    descriptor.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct SupervisorInner {
    bus: Bus,
    events: EventPublisher,
    workers: DashMap<String, WorkerHandle>,
    finished: DashMap<String, WorkerDescriptor>,
    tracker: TaskTracker,
}

/// Registry and scheduler of named workers
#[derive(Clone)]
pub struct WorkerSupervisor {
    inner: Arc<SupervisorInner>,
}

impl WorkerSupervisor {
    pub fn new(bus: Bus, events: EventPublisher) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                bus,
                events,
                workers: DashMap::new(),
                finished: DashMap::new(),
                tracker: TaskTracker::new(),
            }),
        }
    }

    /// Register and launch a worker; the returned descriptor is the scheduling confirmation
    pub fn start(&self, spec: WorkerSpec, message: Message) -> Result<WorkerDescriptor> {
        if spec.name.is_empty() {
            return Err(EdmpError::InvalidInput("worker name must not be empty".to_string()));
        }
        let schedule = match spec.schedule.as_deref() {
            Some(expression) => Some(cron::Schedule::from_str(expression).map_err(|e| {
                EdmpError::InvalidInput(format!("invalid schedule '{}': {}", expression, e))
            })?),
            None => None,
        };

        let body = message.iteration();
        let descriptor = Arc::new(Mutex::new(WorkerDescriptor::new(&spec, body.clone())));
        let cancel = CancellationToken::new();
        let (suspend, suspended) = watch::channel(false);

        match self.inner.workers.entry(spec.name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(EdmpError::DuplicateWorker(spec.name));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(WorkerHandle {
                    descriptor: descriptor.clone(),
                    cancel: cancel.clone(),
                    suspend,
                });
            }
        }
        self.inner.finished.remove(&spec.name);

        info!(worker = %spec.name, handler = ?body.handler(), "starting worker");
        let confirmation = lock(&descriptor).clone();

        let task = WorkerTask {
            supervisor: self.inner.clone(),
            name: spec.name,
            body,
            descriptor,
            cancel,
            suspended,
            schedule,
        };
        self.inner.tracker.spawn(task.run());

        Ok(confirmation)
    }

    /// Suspend every worker matching `pattern`; returns the affected names
    ///
    /// Workers flagged `kill_upon_suspend` are killed instead.
    pub fn pause(&self, pattern: &str) -> Vec<String> {
        let mut paused = Vec::new();
        let mut to_kill = Vec::new();

        for entry in self.inner.workers.iter().filter(|e| glob_match(pattern, e.key())) {
            let mut descriptor = lock(&entry.descriptor);
            if descriptor.kill_upon_suspend {
                to_kill.push(entry.key().clone());
                continue;
            }
            if descriptor.transition(WorkerState::Suspended).is_ok() {
                entry.suspend.send_replace(true);
                debug!(worker = %entry.key(), "worker suspended");
                paused.push(entry.key().clone());
            }
        }

        for name in to_kill {
            paused.extend(self.kill(&name));
        }
        paused.sort();
        paused
    }

    /// Resume every suspended worker matching `pattern`
    pub fn resume(&self, pattern: &str) -> Vec<String> {
        let mut resumed: Vec<String> = self
            .inner
            .workers
            .iter()
            .filter(|e| glob_match(pattern, e.key()))
            .filter_map(|entry| {
                let mut descriptor = lock(&entry.descriptor);
                if descriptor.state != WorkerState::Suspended {
                    return None;
                }
                descriptor.transition(WorkerState::Running).ok()?;
                entry.suspend.send_replace(false);
                debug!(worker = %entry.key(), "worker resumed");
                Some(entry.key().clone())
            })
            .collect();
        resumed.sort();
        resumed
    }

    /// Kill every worker matching `pattern`
    ///
    /// Sleeps wake immediately; the worker leaves the registry once its current
    /// iteration (if any) returns.
    pub fn kill(&self, pattern: &str) -> Vec<String> {
        let mut killed: Vec<String> = self
            .inner
            .workers
            .iter()
            .filter(|e| glob_match(pattern, e.key()))
            .filter_map(|entry| {
                let mut descriptor = lock(&entry.descriptor);
                descriptor.transition(WorkerState::Killed).ok()?;
                entry.cancel.cancel();
                info!(worker = %entry.key(), "worker killed");
                Some(entry.key().clone())
            })
            .collect();
        killed.sort();
        killed
    }

    /// Names of live workers matching `pattern`
    pub fn list(&self, pattern: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .workers
            .iter()
            .filter(|e| glob_match(pattern, e.key()))
            .map(|e| e.key().clone())
            .collect();
        names.sort();
        names
    }

    /// Descriptors of live workers matching `pattern`
    pub fn show(&self, pattern: &str) -> Vec<WorkerDescriptor> {
        let mut descriptors: Vec<WorkerDescriptor> = self
            .inner
            .workers
            .iter()
            .filter(|e| glob_match(pattern, e.key()))
            .map(|e| e.snapshot())
            .collect();
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        descriptors
    }

    /// Current state of a worker, including ones that already terminated
    pub fn state(&self, name: &str) -> Option<WorkerState> {
        if let Some(handle) = self.inner.workers.get(name) {
            return Some(lock(&handle.descriptor).state);
        }
        self.inner.finished.get(name).map(|d| d.state)
    }

    /// Final descriptor of a terminated worker
    pub fn last_descriptor(&self, name: &str) -> Option<WorkerDescriptor> {
        self.inner.finished.get(name).map(|d| d.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.workers.is_empty()
    }

    /// Kill every worker and wait for the loops to exit
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        let killed = self.kill("*");
        if !killed.is_empty() {
            info!(count = killed.len(), "stopping workers");
        }
        self.inner.tracker.close();
        tokio::time::timeout(timeout, self.inner.tracker.wait())
            .await
            .is_ok()
    }
}

enum Exit {
    Killed,
    Completed,
    Failed(String),
}

struct WorkerTask {
    supervisor: Arc<SupervisorInner>,
    name: String,
    body: Message,
    descriptor: Arc<Mutex<WorkerDescriptor>>,
    cancel: CancellationToken,
    suspended: watch::Receiver<bool>,
    schedule: Option<cron::Schedule>,
}

impl WorkerTask {
    async fn run(mut self) {
        let delay = lock(&self.descriptor).delay;
        let exit = if delay > 0.0 && !self.sleep(secs(delay)).await {
            Exit::Killed
        } else {
            self.iterate().await
        };
        self.finish(exit);
    }

    async fn iterate(&mut self) -> Exit {
        let mut started = false;
        loop {
            if !self.wait_until_resumed().await {
                return Exit::Killed;
            }

            if let Some(schedule) = &self.schedule {
                let Some(next) = schedule.upcoming(Utc).next() else {
                    return Exit::Completed;
                };
                lock(&self.descriptor).next_run_at = Some(next);
                let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                if !self.sleep(wait).await {
                    return Exit::Killed;
                }
                if !self.wait_until_resumed().await {
                    return Exit::Killed;
                }
            }

            {
                let mut descriptor = lock(&self.descriptor);
                if descriptor.state.is_terminal() {
                    return Exit::Killed;
                }
                if descriptor.state == WorkerState::Pending {
                    let _ = descriptor.transition(WorkerState::Running);
                }
            }
            if !started {
                started = true;
                announce(
                    &self.supervisor.events,
                    &self.name,
                    WorkerEvent::Started,
                    json!({"handler": self.body.handler()}),
                );
            }

            // Runs to completion even if a kill arrives meanwhile, however long it takes
            let outcome = self
                .supervisor
                .bus
                .call_to_completion(self.body.iteration())
                .await;

            if self.cancel.is_cancelled() {
                return Exit::Killed;
            }
            if let Err(e) = outcome {
                return Exit::Failed(e.to_string());
            }

            let done = lock(&self.descriptor).record_iteration();
            if done {
                return Exit::Completed;
            }

            if self.schedule.is_none() {
                let interval = secs(lock(&self.descriptor).interval);
                lock(&self.descriptor).next_run_at = chrono::Duration::from_std(interval)
                    .ok()
                    .map(|interval| Utc::now() + interval);
                if interval.is_zero() {
                    tokio::task::yield_now().await;
                } else if !self.sleep(interval).await {
                    return Exit::Killed;
                }
            }
        }
    }

    /// Sleep unless killed first; returns false on kill
    async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    /// Block while suspended; returns false on kill
    async fn wait_until_resumed(&mut self) -> bool {
        loop {
            if self.cancel.is_cancelled() {
                return false;
            }
            if !*self.suspended.borrow_and_update() {
                return true;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                changed = self.suspended.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    fn finish(self, exit: Exit) {
        let events = &self.supervisor.events;
        let final_state = {
            let mut descriptor = lock(&self.descriptor);
            descriptor.next_run_at = None;
            let state = match &exit {
                Exit::Killed => WorkerState::Killed,
                Exit::Completed => WorkerState::Completed,
                Exit::Failed(error) => {
                    descriptor.last_error = Some(error.clone());
                    WorkerState::Failed
                }
            };
            if !descriptor.state.is_terminal() {
                // Pending/Suspended cannot complete directly; kill covers every live state
                if descriptor.transition(state).is_err() {
                    descriptor.state = state;
                }
            }
            descriptor.clone()
        };

        match &exit {
            Exit::Killed => {
                announce(events, &self.name, WorkerEvent::Killed, json!({}));
            }
            Exit::Completed => {
                info!(worker = %self.name, iterations = final_state.iterations, "worker completed");
                announce(
                    events,
                    &self.name,
                    WorkerEvent::Completed,
                    json!({"iterations": final_state.iterations}),
                );
            }
            Exit::Failed(error) => {
                warn!(worker = %self.name, error = %error, "worker failed");
                announce(events, &self.name, WorkerEvent::Failed, json!({"error": error}));
            }
        }

        self.supervisor.workers.remove(&self.name);
        self.supervisor.finished.insert(self.name.clone(), final_state);
        debug!(worker = %self.name, "worker removed from registry");
    }
}
