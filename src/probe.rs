//! Per-service health probing.
//!
//! Each probed service gets one polling thread. A tick issues at most one
//! check (never overlapping), bounded by the check's own timeout, then updates
//! the consecutive-success/failure counters in the state table and forwards
//! the result to the process monitor. The loop observes a cancellation flag
//! between sleep slices so shutdown never waits out a full interval.
use std::{
    process::{Command, Stdio},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc::Sender,
    },
    thread,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use tracing::{debug, error, warn};

use crate::config::{HealthCheckKind, collect_service_env};
use crate::monitor::MonitorEvent;
use crate::registry::{HealthSpec, ServiceSpec};
use crate::spawn::wait_with_timeout;
use crate::state::{ServiceStatus, StateTable};

/// Outcome of a single health check.
#[derive(Debug, Clone)]
pub struct HealthResult {
    /// The probed service.
    pub service: String,
    /// When the check completed.
    pub timestamp: DateTime<Utc>,
    /// Whether the check passed.
    pub ok: bool,
    /// How long the check took.
    pub latency: Duration,
    /// Failure detail, when available.
    pub detail: Option<String>,
}

/// Handle to a running probe loop.
#[derive(Debug)]
pub struct ProbeHandle {
    cancel: Arc<AtomicBool>,
    handle: thread::JoinHandle<()>,
}

impl ProbeHandle {
    /// Asks the loop to stop scheduling further probes.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Cancels and waits for the loop to exit.
    pub fn stop(self) {
        self.cancel();
        let _ = self.handle.join();
    }
}

/// Starts the probe loop for a service, or returns `None` when the spec has
/// no health check (running implies Healthy for those).
pub fn spawn_probe(
    spec: Arc<ServiceSpec>,
    states: Arc<StateTable>,
    events: Sender<MonitorEvent>,
) -> Option<ProbeHandle> {
    let health = spec.health.clone()?;
    let cancel = Arc::new(AtomicBool::new(false));

    let handle = {
        let cancel = Arc::clone(&cancel);
        thread::spawn(move || probe_loop(&spec, &health, &states, &events, &cancel))
    };

    Some(ProbeHandle { cancel, handle })
}

fn probe_loop(
    spec: &ServiceSpec,
    health: &HealthSpec,
    states: &StateTable,
    events: &Sender<MonitorEvent>,
    cancel: &AtomicBool,
) {
    let client = reqwest::blocking::Client::builder()
        .timeout(health.timeout)
        .build();

    while !cancel.load(Ordering::SeqCst) {
        match states.status(&spec.id) {
            Some(status) if status.is_terminal() => {
                debug!("Probe loop for '{}' exiting: status {:?}", spec.id, status);
                return;
            }
            None => return,
            _ => {}
        }

        let result = run_check(spec, health, &client);
        record_result(states, health, &result);

        if events.send(MonitorEvent::Probe(result)).is_err() {
            return;
        }

        // Sleep in short slices so cancellation is observed promptly.
        let wake_at = Instant::now() + health.interval;
        while Instant::now() < wake_at {
            if cancel.load(Ordering::SeqCst) {
                return;
            }
            thread::sleep(Duration::from_millis(50));
        }
    }
}

/// Issues one health check and packages the outcome.
fn run_check(
    spec: &ServiceSpec,
    health: &HealthSpec,
    client: &Result<reqwest::blocking::Client, reqwest::Error>,
) -> HealthResult {
    let started = Instant::now();
    let (ok, detail) = match health.kind {
        HealthCheckKind::Http => check_http(client, &health.target),
        HealthCheckKind::Exec => check_exec(spec, health),
    };

    if !ok {
        debug!(
            "Health check failed for '{}': {}",
            spec.id,
            detail.as_deref().unwrap_or("no detail")
        );
    }

    HealthResult {
        service: spec.id.clone(),
        timestamp: Utc::now(),
        ok,
        latency: started.elapsed(),
        detail,
    }
}

/// GETs the target URL; any 2xx response is a pass. A check that cannot
/// execute at all (connection refused, client build failure) is recorded as a
/// failed result, never raised.
fn check_http(
    client: &Result<reqwest::blocking::Client, reqwest::Error>,
    target: &str,
) -> (bool, Option<String>) {
    let client = match client {
        Ok(client) => client,
        Err(err) => return (false, Some(format!("http client unavailable: {err}"))),
    };

    match client.get(target).send() {
        Ok(response) if response.status().is_success() => (true, None),
        Ok(response) => (
            false,
            Some(format!("unexpected status {}", response.status())),
        ),
        Err(err) => (false, Some(err.to_string())),
    }
}

/// Runs the target command through `sh -c` with the service's environment;
/// exit 0 is a pass. The command is killed at the probe deadline.
fn check_exec(spec: &ServiceSpec, health: &HealthSpec) -> (bool, Option<String>) {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(&health.target);
    cmd.current_dir(&spec.working_dir);
    cmd.stdout(Stdio::null()).stderr(Stdio::null());

    for (key, value) in collect_service_env(&spec.env, &spec.working_dir, &spec.id) {
        cmd.env(key, value);
    }

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => return (false, Some(format!("failed to run check: {err}"))),
    };

    match wait_with_timeout(&mut child, health.timeout) {
        Ok(Some(status)) if status.success() => (true, None),
        Ok(Some(status)) => (false, Some(format!("check exited with {status}"))),
        Ok(None) => {
            warn!("Health check for '{}' timed out; killing it", spec.id);
            if let Err(err) = child.kill() {
                error!("Failed to kill timed-out check for '{}': {err}", spec.id);
            }
            let _ = child.wait();
            (false, Some("check timed out".to_string()))
        }
        Err(err) => (false, Some(err.to_string())),
    }
}

/// Applies the consecutive-threshold transition rules to the state table.
fn record_result(states: &StateTable, health: &HealthSpec, result: &HealthResult) {
    states.update(&result.service, |state| {
        state.last_check_at = Some(result.timestamp);

        if result.ok {
            state.consecutive_successes += 1;
            state.consecutive_failures = 0;

            let recovering = matches!(
                state.status,
                ServiceStatus::Starting
                    | ServiceStatus::Degraded
                    | ServiceStatus::Restarting
            );
            if recovering && state.consecutive_successes >= health.success_threshold {
                state.status = ServiceStatus::Healthy;
            }
        } else {
            state.consecutive_failures += 1;
            state.consecutive_successes = 0;

            if state.status == ServiceStatus::Healthy
                && state.consecutive_failures >= health.failure_threshold
            {
                warn!(
                    "Service '{}' degraded after {} consecutive probe failures",
                    result.service, state.consecutive_failures
                );
                state.status = ServiceStatus::Degraded;
            }
        }
    });
}
