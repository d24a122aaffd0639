//! Shared per-service runtime state.
//!
//! One [`ServiceState`] exists per declared service for the whole supervisor
//! lifetime. The table supports concurrent reads (the aggregate health
//! reporter is called at arbitrary times) against serialized writes, and
//! signals a condvar on every Healthy transition so the launcher can suspend
//! instead of polling.
use std::{
    collections::HashMap,
    sync::{Condvar, Mutex, RwLock},
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, EnumString};

/// Lifecycle states for a supervised service.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ServiceStatus {
    /// Declared but not yet spawned.
    Pending,
    /// Spawned, waiting for the first Healthy confirmation.
    Starting,
    /// Probes passing.
    Healthy,
    /// `failure_threshold` consecutive probe failures while running.
    Degraded,
    /// Crashed (or recycled) and waiting out the restart backoff.
    Restarting,
    /// Intentionally stopped by the shutdown sequence. Terminal.
    Stopped,
    /// Restart budget exhausted. Terminal absent external intervention.
    Failed,
}

impl ServiceStatus {
    /// Whether no further transitions are expected without outside help.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ServiceStatus::Stopped | ServiceStatus::Failed)
    }
}

/// Mutable runtime state for one service instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceState {
    /// Service identifier.
    pub id: String,
    /// OS process id of the current instance, if one is running.
    pub pid: Option<u32>,
    /// Current lifecycle status.
    pub status: ServiceStatus,
    /// Probe failures since the last success.
    #[serde(skip)]
    pub consecutive_failures: u32,
    /// Probe successes since the last failure.
    #[serde(skip)]
    pub consecutive_successes: u32,
    /// Restarts within the current restart window.
    #[serde(skip)]
    pub restart_count: u32,
    /// When the last restart was initiated.
    #[serde(skip)]
    pub last_restart_at: Option<DateTime<Utc>>,
    /// When the current instance was spawned.
    pub started_at: Option<DateTime<Utc>>,
    /// When the last probe completed.
    pub last_check_at: Option<DateTime<Utc>>,
}

impl ServiceState {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            pid: None,
            status: ServiceStatus::Pending,
            consecutive_failures: 0,
            consecutive_successes: 0,
            restart_count: 0,
            last_restart_at: None,
            started_at: None,
            last_check_at: None,
        }
    }
}

/// Concurrently readable table of every service's state.
///
/// Writers go through [`StateTable::update`], which holds the write lock for
/// the duration of the closure, so all writes are linearized. Healthy
/// transitions bump a generation counter and wake anything blocked in
/// [`StateTable::wait_for_healthy`].
#[derive(Debug)]
pub struct StateTable {
    inner: RwLock<HashMap<String, ServiceState>>,
    ready_generation: Mutex<u64>,
    ready: Condvar,
}

impl StateTable {
    /// Creates the table with one Pending entry per declared service.
    pub fn new<'a>(ids: impl IntoIterator<Item = &'a String>) -> Self {
        let inner = ids
            .into_iter()
            .map(|id| (id.clone(), ServiceState::new(id)))
            .collect();
        Self {
            inner: RwLock::new(inner),
            ready_generation: Mutex::new(0),
            ready: Condvar::new(),
        }
    }

    /// Current status for a service, if declared.
    pub fn status(&self, id: &str) -> Option<ServiceStatus> {
        self.inner
            .read()
            .ok()
            .and_then(|map| map.get(id).map(|state| state.status))
    }

    /// Clones the full state for a service.
    pub fn get(&self, id: &str) -> Option<ServiceState> {
        self.inner
            .read()
            .ok()
            .and_then(|map| map.get(id).cloned())
    }

    /// Snapshot of every service state, ordered by id.
    pub fn snapshot(&self) -> Vec<ServiceState> {
        let mut states: Vec<ServiceState> = self
            .inner
            .read()
            .map(|map| map.values().cloned().collect())
            .unwrap_or_default();
        states.sort_by(|a, b| a.id.cmp(&b.id));
        states
    }

    /// Applies `mutate` to the service's state under the write lock.
    ///
    /// Returns the status after the update. A transition into Healthy wakes
    /// all waiters.
    pub fn update<F>(&self, id: &str, mutate: F) -> Option<ServiceStatus>
    where
        F: FnOnce(&mut ServiceState),
    {
        let (before, after) = {
            let mut map = match self.inner.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let state = map.get_mut(id)?;
            let before = state.status;
            mutate(state);
            (before, state.status)
        };

        if after == ServiceStatus::Healthy && before != ServiceStatus::Healthy {
            let mut generation = match self.ready_generation.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            *generation += 1;
            self.ready.notify_all();
        }

        Some(after)
    }

    /// Blocks until the service reports Healthy, a terminal status, or the
    /// deadline passes. Returns the last observed status.
    pub fn wait_for_healthy(&self, id: &str, deadline: Instant) -> Option<ServiceStatus> {
        loop {
            let status = self.status(id)?;
            if status == ServiceStatus::Healthy || status.is_terminal() {
                return Some(status);
            }

            let now = Instant::now();
            if now >= deadline {
                return Some(status);
            }

            let generation = match self.ready_generation.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let remaining = deadline.saturating_duration_since(now);
            // Re-check the table after every wakeup or 100ms, whichever first;
            // the condvar is only a hint that some service turned Healthy.
            let wait = remaining.min(Duration::from_millis(100));
            let _ = self
                .ready
                .wait_timeout(generation, wait)
                .map(|(guard, _)| drop(guard));
        }
    }
}
