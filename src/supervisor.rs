//! The supervisor context: launcher and shutdown coordinator.
//!
//! One `Supervisor` owns the registry, the state table, the process monitor,
//! and the probe handles, and is threaded explicitly through every component
//! in place of ambient globals. The launcher walks the topological order and
//! suspends on Healthy transitions; the shutdown coordinator walks the
//! reverse order exactly once, strictly sequentially.
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc, Condvar, Mutex, MutexGuard,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::config::{Config, StartupTimeoutPolicy};
use crate::error::SupervisorError;
use crate::health::{self, AggregateStatus, HealthServer};
use crate::monitor::ProcessMonitor;
use crate::probe::{ProbeHandle, spawn_probe};
use crate::registry::ServiceRegistry;
use crate::spawn;
use crate::state::{ServiceState, ServiceStatus, StateTable};

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);
const READY_POLL_INTERVAL: Duration = Duration::from_millis(50);
const NO_PROBE_CONFIRM_WINDOW: Duration = Duration::from_secs(5);

/// Long-lived supervisor that starts, monitors, and stops the service set.
pub struct Supervisor {
    registry: Arc<ServiceRegistry>,
    states: Arc<StateTable>,
    monitor: ProcessMonitor,
    probes: Mutex<HashMap<String, ProbeHandle>>,
    shutdown_started: AtomicBool,
    done: Mutex<bool>,
    done_cv: Condvar,
    health_server: Mutex<Option<HealthServer>>,
}

impl Supervisor {
    /// Validates the configuration into a ready-to-start supervisor.
    ///
    /// Any configuration error surfaces here, before a single process exists.
    pub fn new(config: Config) -> Result<Arc<Self>, SupervisorError> {
        let registry = Arc::new(ServiceRegistry::from_config(config)?);
        let states = Arc::new(StateTable::new(registry.start_order().iter()));
        let monitor = ProcessMonitor::new(Arc::clone(&registry), Arc::clone(&states));

        Ok(Arc::new(Self {
            registry,
            states,
            monitor,
            probes: Mutex::new(HashMap::new()),
            shutdown_started: AtomicBool::new(false),
            done: Mutex::new(false),
            done_cv: Condvar::new(),
            health_server: Mutex::new(None),
        }))
    }

    /// Starts every service in dependency order.
    ///
    /// Blocks until each service confirms Healthy before moving to the next,
    /// bounded overall by the registry's `startup_timeout`. On the default
    /// policy a service missing the window aborts the whole startup; an
    /// explicit `on_startup_timeout: degrade` marks it Degraded and continues.
    pub fn start(&self) -> Result<(), SupervisorError> {
        if let Some(bind) = self.registry.health_endpoint() {
            let server = health::spawn_health_endpoint(bind, Arc::clone(&self.states))?;
            *lock_or_recover(&self.health_server) = Some(server);
        }

        let deadline = Instant::now() + self.registry.startup_timeout();
        info!("Starting {} services...", self.registry.len());

        for id in self.registry.start_order() {
            if self.monitor.is_shutting_down() {
                debug!("Startup interrupted by shutdown; not starting '{id}'");
                return Ok(());
            }

            let Some(spec) = self.registry.spec(id) else {
                continue;
            };

            for dep in &spec.depends_on {
                match self.states.wait_for_healthy(dep, deadline) {
                    Some(ServiceStatus::Healthy) => {}
                    Some(ServiceStatus::Stopped) => return Ok(()),
                    _ => {
                        error!(
                            "Dependency '{dep}' of '{id}' never became healthy; aborting startup"
                        );
                        return Err(SupervisorError::StartupTimeout {
                            service: dep.clone(),
                            timeout: self.registry.startup_timeout(),
                        });
                    }
                }
            }

            let child = spawn::launch_service(spec)?;
            let pid = child.id();
            self.states.update(id, |state| {
                state.status = ServiceStatus::Starting;
                state.pid = Some(pid);
                state.started_at = Some(Utc::now());
            });
            self.monitor.register(id, child);
            info!("Service '{id}' started with PID {pid}");

            if spec.health.is_some() {
                if let Some(handle) = spawn_probe(
                    Arc::clone(spec),
                    Arc::clone(&self.states),
                    self.monitor.events(),
                ) {
                    lock_or_recover(&self.probes).insert(id.clone(), handle);
                }

                match self.states.wait_for_healthy(id, deadline) {
                    Some(ServiceStatus::Healthy) => {
                        info!("Service '{id}' is healthy");
                    }
                    Some(ServiceStatus::Stopped) => return Ok(()),
                    Some(ServiceStatus::Failed) => {
                        error!("Service '{id}' failed during startup");
                        return Err(SupervisorError::ServiceStart {
                            service: id.clone(),
                            source: std::io::Error::other(
                                "service failed before becoming healthy",
                            ),
                        });
                    }
                    _ => match spec.on_startup_timeout {
                        StartupTimeoutPolicy::Abort => {
                            error!(
                                "Service '{id}' missed the startup window; aborting"
                            );
                            return Err(SupervisorError::StartupTimeout {
                                service: id.clone(),
                                timeout: self.registry.startup_timeout(),
                            });
                        }
                        StartupTimeoutPolicy::Degrade => {
                            warn!(
                                "Service '{id}' missed the startup window; continuing degraded"
                            );
                            self.states.update(id, |state| {
                                if state.status == ServiceStatus::Starting {
                                    state.status = ServiceStatus::Degraded;
                                }
                            });
                        }
                    },
                }
            } else {
                self.confirm_running(id)?;
            }
        }

        info!("All services started successfully.");
        Ok(())
    }

    /// Readiness for services without a probe: the process staying alive
    /// across consecutive polls is the only observable signal. Uses its own
    /// short window so a degrade-continued startup can still confirm
    /// later services after the overall deadline has lapsed.
    fn confirm_running(&self, id: &str) -> Result<(), SupervisorError> {
        let confirm_deadline = Instant::now() + NO_PROBE_CONFIRM_WINDOW;
        let mut seen_alive_once = false;

        loop {
            let alive = self
                .monitor
                .pid(id)
                .map(spawn::is_alive)
                .unwrap_or(false);

            if alive {
                if seen_alive_once {
                    self.states.update(id, |state| {
                        if state.status == ServiceStatus::Starting {
                            state.status = ServiceStatus::Healthy;
                        }
                    });
                    return Ok(());
                }
                seen_alive_once = true;
            } else if self.monitor.is_shutting_down() {
                return Ok(());
            }

            if Instant::now() >= confirm_deadline {
                return Err(SupervisorError::ServiceStart {
                    service: id.to_string(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "service did not report a running state in time",
                    ),
                });
            }

            thread::sleep(READY_POLL_INTERVAL);
        }
    }

    /// Stops every service in reverse dependency order.
    ///
    /// Idempotent: only the first call does anything. Each service gets its
    /// probe cancelled and its next exit flagged as intentional before the
    /// stop signal goes out, so no restart races the drain. A service still
    /// alive after its `drain_timeout` is force-killed and the sequence
    /// continues.
    pub fn shutdown(&self) {
        if self.shutdown_started.swap(true, Ordering::SeqCst) {
            debug!("Shutdown already in progress; ignoring duplicate request");
            return;
        }

        info!("Stopping services in reverse dependency order");
        self.monitor.begin_shutdown();

        for id in self.registry.shutdown_order() {
            let Some(spec) = self.registry.spec(&id) else {
                continue;
            };

            if let Some(handle) = lock_or_recover(&self.probes).remove(&id) {
                handle.stop();
            }
            self.monitor.mark_intentional(&id);

            if let Some(pid) = self.monitor.pid(&id)
                && spawn::is_alive(pid)
            {
                info!("Stopping service '{id}' (PID {pid})");
                if let Err(err) = spawn::signal_service(
                    pid,
                    &id,
                    nix::sys::signal::Signal::SIGTERM,
                ) {
                    error!("Failed to signal service '{id}': {err}");
                }

                let deadline = Instant::now() + spec.restart.drain_timeout;
                let mut exited = false;
                while Instant::now() < deadline {
                    if !spawn::is_alive(pid) {
                        exited = true;
                        break;
                    }
                    thread::sleep(DRAIN_POLL_INTERVAL);
                }

                if !exited {
                    warn!(
                        "Service '{id}' did not exit within {:?}; sending SIGKILL",
                        spec.restart.drain_timeout
                    );
                    if let Err(err) = spawn::signal_service(
                        pid,
                        &id,
                        nix::sys::signal::Signal::SIGKILL,
                    ) {
                        error!("Failed to force-kill service '{id}': {err}");
                    }
                }
            }

            self.states.update(&id, |state| {
                state.status = ServiceStatus::Stopped;
                state.pid = None;
            });
            debug!("Service '{id}' stopped");
        }

        self.monitor.stop();

        let mut done = lock_or_recover(&self.done);
        *done = true;
        self.done_cv.notify_all();
        info!("All services stopped");
    }

    /// Blocks until the shutdown sequence has completed.
    pub fn wait(&self) {
        let mut done = lock_or_recover(&self.done);
        while !*done {
            done = match self.done_cv.wait(done) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    /// Whether a termination signal has been observed.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_started.load(Ordering::SeqCst)
    }

    /// Snapshot of every service state, ordered by id.
    pub fn snapshot(&self) -> Vec<ServiceState> {
        self.states.snapshot()
    }

    /// Current folded status across all services.
    pub fn aggregate_health(&self) -> AggregateStatus {
        health::aggregate(&self.snapshot())
    }

    /// Bound address of the health endpoint, when one is configured.
    pub fn health_addr(&self) -> Option<SocketAddr> {
        lock_or_recover(&self.health_server)
            .as_ref()
            .map(HealthServer::addr)
    }
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
