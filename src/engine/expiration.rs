// Expiration gate for returner activity

//! # Expiration Gate
//!
//! A per-manager switch that decides whether returners still accept data.
//!
//! ```text
//! enabled ──set_expiration(delay)──► expires_at(t) ──t reached──► expired
//!    │  └────────────────expire(reason)───────────────────────────────┘ │
//!    └◄──────────────────────────enable()──────────────────────────────┘
//! ```
//!
//! Entering `expired` drains and closes every registered writer, and writers
//! registered while expired are closed on the spot. Leaving it through
//! `enable()` or a new `set_expiration` lets returners accept data again;
//! writers closed on expiry stay closed and have to be registered anew.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::writer::RotatingWriter;
use crate::{EdmpError, Result};

/// Current state of the gate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ExpirationState {
    Enabled,
    ExpiresAt { at: DateTime<Utc>, reason: String },
    Expired { reason: String },
}

/// Configured expiration applied at startup
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpirationConfig {
    /// Seconds after startup at which returners stop accepting data
    pub after: Option<f64>,
    pub reason: Option<String>,
}

/// Global switch suppressing returner activity
#[derive(Default)]
pub struct ExpirationGate {
    state: RwLock<ExpirationState>,
    writers: Mutex<Vec<Arc<RotatingWriter>>>,
    timer: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Default for ExpirationState {
    fn default() -> Self {
        ExpirationState::Enabled
    }
}

impl ExpirationGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn state(&self) -> ExpirationState {
        self.state.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Whether returners may take new data right now
    pub fn accepts(&self) -> bool {
        match &*self.state.read().unwrap_or_else(|p| p.into_inner()) {
            ExpirationState::Enabled => true,
            ExpirationState::ExpiresAt { at, .. } => Utc::now() < *at,
            ExpirationState::Expired { .. } => false,
        }
    }

    pub fn is_expired(&self) -> bool {
        matches!(self.state(), ExpirationState::Expired { .. })
    }

    /// Back to `enabled`, cancelling any pending expiration
    pub fn enable(&self) {
        if let Some(timer) = self.timer.lock().unwrap_or_else(|p| p.into_inner()).take() {
            timer.abort();
        }
        let previous = std::mem::replace(
            &mut *self.state.write().unwrap_or_else(|p| p.into_inner()),
            ExpirationState::Enabled,
        );
        if previous != ExpirationState::Enabled {
            info!(previous = ?previous, "returners re-enabled");
        }
    }

    /// Expire after `delay`; a zero delay expires immediately
    ///
    /// Also re-arms an already expired gate: returners accept data until the
    /// new deadline passes.
    pub async fn set_expiration(self: &Arc<Self>, delay: Duration, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();
        if delay.is_zero() {
            self.expire(reason).await;
            return Ok(());
        }

        let at = Utc::now()
            + chrono::Duration::from_std(delay)
                .map_err(|e| EdmpError::InvalidInput(format!("expiration delay out of range: {}", e)))?;
        *self.state.write().unwrap_or_else(|p| p.into_inner()) = ExpirationState::ExpiresAt {
            at,
            reason: reason.clone(),
        };
        info!(%at, reason = %reason, "returners will expire");

        let gate = Arc::downgrade(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(gate) = gate.upgrade() {
                gate.expire(reason).await;
            }
        });
        if let Some(previous) = self
            .timer
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .replace(timer)
        {
            previous.abort();
        }
        Ok(())
    }

    /// Enter `expired` now and close every registered writer
    pub async fn expire(&self, reason: impl Into<String>) {
        let reason = reason.into();
        {
            let mut state = self.state.write().unwrap_or_else(|p| p.into_inner());
            if matches!(*state, ExpirationState::Expired { .. }) {
                return;
            }
            *state = ExpirationState::Expired { reason: reason.clone() };
        }
        // Detach rather than abort, this may be running on the timer task itself
        drop(self.timer.lock().unwrap_or_else(|p| p.into_inner()).take());
        warn!(reason = %reason, "returners expired");
        self.close_writers().await;
    }

    /// Track a writer so expiration can close it
    pub async fn register_writer(&self, writer: Arc<RotatingWriter>) {
        if self.is_expired() {
            let _ = writer.close().await;
            return;
        }
        self.writers.lock().await.push(writer);
    }

    /// Drain and close every registered writer
    pub async fn close_writers(&self) {
        let writers: Vec<Arc<RotatingWriter>> = self.writers.lock().await.drain(..).collect();
        for writer in writers {
            if let Err(e) = writer.close().await {
                warn!(writer = %writer.name(), error = %e, "failed to close writer");
            }
        }
    }
}
