//! Process table ownership, exit reaping, and restart policy.
//!
//! All restart decisions flow through a single event-loop thread, so writes
//! for one service never interleave and a restart decision for one service
//! never races a probe result for another. Each spawned process gets a
//! dedicated blocking waiter thread that reports its exit into the loop,
//! keeping reaping off the launcher and probe paths.
use std::{
    collections::{HashMap, HashSet},
    process::{Child, ExitStatus},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, Sender},
    },
    thread,
    time::Instant,
};

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::probe::HealthResult;
use crate::registry::{ServiceRegistry, ServiceSpec};
use crate::spawn;
use crate::state::{ServiceStatus, StateTable};

/// Events consumed by the monitor loop.
#[derive(Debug)]
pub enum MonitorEvent {
    /// A supervised process exited; reported by its waiter thread.
    Exited {
        /// The service whose process exited.
        service: String,
        /// The exit status observed by `wait`.
        status: ExitStatus,
    },
    /// A health probe completed.
    Probe(HealthResult),
    /// A restart backoff elapsed.
    RestartDue {
        /// The service whose respawn is due.
        service: String,
    },
    /// Stop the monitor loop.
    Shutdown,
}

struct Shared {
    registry: Arc<ServiceRegistry>,
    states: Arc<StateTable>,
    pids: Mutex<HashMap<String, u32>>,
    intentional: Mutex<HashSet<String>>,
    shutting_down: AtomicBool,
}

/// Owns the pid table and applies the restart policy.
pub struct ProcessMonitor {
    events_tx: Sender<MonitorEvent>,
    shared: Arc<Shared>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ProcessMonitor {
    /// Starts the monitor loop.
    pub fn new(registry: Arc<ServiceRegistry>, states: Arc<StateTable>) -> Self {
        let (events_tx, events_rx) = mpsc::channel();
        let shared = Arc::new(Shared {
            registry,
            states,
            pids: Mutex::new(HashMap::new()),
            intentional: Mutex::new(HashSet::new()),
            shutting_down: AtomicBool::new(false),
        });

        let handle = {
            let shared = Arc::clone(&shared);
            let events_tx = events_tx.clone();
            thread::spawn(move || monitor_loop(&shared, events_rx, events_tx))
        };

        Self {
            events_tx,
            shared,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Sender used by probe loops to feed results into the monitor.
    pub fn events(&self) -> Sender<MonitorEvent> {
        self.events_tx.clone()
    }

    /// Registers a freshly spawned process: records its pid and starts the
    /// blocking waiter thread that reports its exit.
    pub fn register(&self, service: &str, child: Child) {
        let pid = child.id();
        if let Ok(mut pids) = self.shared.pids.lock() {
            pids.insert(service.to_string(), pid);
        }

        spawn_exit_waiter(service, child, self.events_tx.clone());
    }

    /// Current pid for a service, if a process is registered.
    pub fn pid(&self, service: &str) -> Option<u32> {
        self.shared
            .pids
            .lock()
            .ok()
            .and_then(|pids| pids.get(service).copied())
    }

    /// Flags the service's next exit as intentional so no restart is attempted.
    pub fn mark_intentional(&self, service: &str) {
        if let Ok(mut intentional) = self.shared.intentional.lock() {
            intentional.insert(service.to_string());
        }
    }

    /// Marks shutdown in progress: from here on no crash triggers a restart.
    pub fn begin_shutdown(&self) {
        self.shared.shutting_down.store(true, Ordering::SeqCst);
    }

    /// Whether shutdown has been initiated.
    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutting_down.load(Ordering::SeqCst)
    }

    /// Stops the monitor loop and waits for it to exit.
    pub fn stop(&self) {
        let _ = self.events_tx.send(MonitorEvent::Shutdown);
        if let Ok(mut slot) = self.handle.lock()
            && let Some(handle) = slot.take()
        {
            let _ = handle.join();
        }
    }
}

/// Dedicated blocking wait for one process instance.
fn spawn_exit_waiter(service: &str, mut child: Child, events: Sender<MonitorEvent>) {
    let service = service.to_string();
    thread::spawn(move || match child.wait() {
        Ok(status) => {
            let _ = events.send(MonitorEvent::Exited { service, status });
        }
        Err(err) => {
            error!("Failed to wait on process for '{service}': {err}");
        }
    });
}

fn monitor_loop(
    shared: &Shared,
    events_rx: Receiver<MonitorEvent>,
    events_tx: Sender<MonitorEvent>,
) {
    // Loop-local bookkeeping; only this thread touches it.
    let mut healthy_since: HashMap<String, Instant> = HashMap::new();
    let mut degraded_since: HashMap<String, Instant> = HashMap::new();
    let mut recycling: HashSet<String> = HashSet::new();

    while let Ok(event) = events_rx.recv() {
        match event {
            MonitorEvent::Shutdown => break,
            MonitorEvent::Exited { service, status } => {
                if let Ok(mut pids) = shared.pids.lock() {
                    pids.remove(&service);
                }
                healthy_since.remove(&service);
                degraded_since.remove(&service);
                recycling.remove(&service);

                let intentional = shared
                    .intentional
                    .lock()
                    .map(|mut set| set.remove(&service))
                    .unwrap_or(false);

                if intentional || shared.shutting_down.load(Ordering::SeqCst) {
                    debug!("Service '{service}' exited intentionally ({status})");
                    continue;
                }

                warn!("Service '{service}' exited unexpectedly with {status}");
                handle_crash(shared, &events_tx, &service);
            }
            MonitorEvent::RestartDue { service } => {
                if shared.shutting_down.load(Ordering::SeqCst) {
                    debug!("Skipping restart of '{service}': shutdown in progress");
                    continue;
                }

                if shared.states.status(&service) != Some(ServiceStatus::Restarting) {
                    continue;
                }

                respawn(shared, &events_tx, &service);
            }
            MonitorEvent::Probe(result) => {
                if shared.shutting_down.load(Ordering::SeqCst) {
                    continue;
                }

                track_health_windows(
                    shared,
                    &result,
                    &mut healthy_since,
                    &mut degraded_since,
                    &mut recycling,
                );
            }
        }
    }

    debug!("Monitor loop terminating.");
}

/// Applies the restart policy to an unexpected exit.
fn handle_crash(shared: &Shared, events: &Sender<MonitorEvent>, service: &str) {
    let Some(spec) = shared.registry.spec(service).cloned() else {
        return;
    };

    let mut attempt = 0;
    shared.states.update(service, |state| {
        state.pid = None;
        state.consecutive_successes = 0;
        state.consecutive_failures += 1;
        state.restart_count += 1;
        attempt = state.restart_count;

        if state.restart_count > spec.restart.max_retries {
            state.status = ServiceStatus::Failed;
        } else {
            state.status = ServiceStatus::Restarting;
            state.last_restart_at = Some(Utc::now());
        }
    });

    if attempt > spec.restart.max_retries {
        error!(
            "Service '{service}' exceeded its restart budget ({} within the window); marking failed",
            spec.restart.max_retries
        );
        return;
    }

    let delay = spec.restart.backoff_delay(attempt - 1);
    warn!(
        "Restarting '{service}' in {:?} (attempt {attempt}/{})",
        delay, spec.restart.max_retries
    );

    let events = events.clone();
    let service = service.to_string();
    thread::spawn(move || {
        thread::sleep(delay);
        let _ = events.send(MonitorEvent::RestartDue { service });
    });
}

/// Spawns a replacement process for a service whose backoff has elapsed.
fn respawn(shared: &Shared, events: &Sender<MonitorEvent>, service: &str) {
    let Some(spec) = shared.registry.spec(service).cloned() else {
        return;
    };

    match spawn::launch_service(&spec) {
        Ok(child) => {
            let pid = child.id();
            if let Ok(mut pids) = shared.pids.lock() {
                pids.insert(service.to_string(), pid);
            }
            spawn_exit_waiter(service, child, events.clone());

            info!("Service '{service}' respawned with PID {pid}");
            shared.states.update(service, |state| {
                state.pid = Some(pid);
                state.started_at = Some(Utc::now());
                // Without a probe, running is as healthy as we can observe.
                if spec.health.is_none() {
                    state.status = ServiceStatus::Healthy;
                }
            });
        }
        Err(err) => {
            error!("Failed to respawn '{service}': {err}");
            handle_crash(shared, events, service);
        }
    }
}

/// Tracks how long a service has stayed Healthy (to reset the restart budget)
/// or Degraded (to trigger the opt-in recycle policy).
fn track_health_windows(
    shared: &Shared,
    result: &HealthResult,
    healthy_since: &mut HashMap<String, Instant>,
    degraded_since: &mut HashMap<String, Instant>,
    recycling: &mut HashSet<String>,
) {
    let service = &result.service;
    let Some(spec) = shared.registry.spec(service).cloned() else {
        return;
    };

    match shared.states.status(service) {
        Some(ServiceStatus::Healthy) => {
            degraded_since.remove(service);
            recycling.remove(service);

            let since = *healthy_since
                .entry(service.clone())
                .or_insert_with(Instant::now);
            if since.elapsed() >= spec.restart.restart_window {
                shared.states.update(service, |state| {
                    if state.restart_count > 0 {
                        debug!(
                            "Service '{}' healthy for the full restart window; resetting budget",
                            state.id
                        );
                        state.restart_count = 0;
                    }
                });
            }
        }
        Some(ServiceStatus::Degraded) => {
            healthy_since.remove(service);

            let Some(recycle_after) = spec.restart.restart_on_degraded_after else {
                return;
            };

            let since = *degraded_since
                .entry(service.clone())
                .or_insert_with(Instant::now);
            if since.elapsed() >= recycle_after && !recycling.contains(service) {
                let Some(pid) = shared
                    .pids
                    .lock()
                    .ok()
                    .and_then(|pids| pids.get(service).copied())
                else {
                    return;
                };

                warn!(
                    "Service '{service}' degraded for {:?}; killing PID {pid} for recycle",
                    recycle_after
                );
                recycling.insert(service.clone());
                if let Err(err) =
                    spawn::signal_service(pid, service, nix::sys::signal::Signal::SIGKILL)
                {
                    error!("Failed to kill degraded service '{service}': {err}");
                    recycling.remove(service);
                }
            }
        }
        _ => {
            healthy_since.remove(service);
            degraded_since.remove(service);
        }
    }
}
