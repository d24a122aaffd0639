//! Validated service registry and dependency ordering.
//!
//! The registry is built once from a parsed [`Config`] and never mutated. It
//! resolves every optional knob to a concrete value, rejects dangling
//! dependency references and cycles before any process is spawned, and owns
//! the topological start order (reversed for shutdown).
use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use crate::config::{
    Config, EnvConfig, HealthCheckKind, StartupTimeoutPolicy, parse_duration,
};
use crate::error::SupervisorError;

const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_SUCCESS_THRESHOLD: u32 = 1;
const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(2);
const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(60);
const DEFAULT_RESTART_WINDOW: Duration = Duration::from_secs(300);
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolved probe definition with every knob concrete.
#[derive(Debug, Clone)]
pub struct HealthSpec {
    /// Probe mechanism.
    pub kind: HealthCheckKind,
    /// URL for `http` probes, command line for `exec` probes.
    pub target: String,
    /// Polling cadence.
    pub interval: Duration,
    /// Per-call deadline.
    pub timeout: Duration,
    /// Consecutive passes required to (re)enter Healthy.
    pub success_threshold: u32,
    /// Consecutive failures required to leave Healthy.
    pub failure_threshold: u32,
}

/// Resolved restart policy with every knob concrete.
#[derive(Debug, Clone)]
pub struct RestartSpec {
    /// Restarts allowed within `restart_window` before the service is Failed.
    pub max_retries: u32,
    /// Base backoff before the first respawn. Doubles per attempt.
    pub backoff_base: Duration,
    /// Upper bound on the backoff delay.
    pub backoff_max: Duration,
    /// Staying Healthy this long resets the restart counter.
    pub restart_window: Duration,
    /// Grace period between SIGTERM and SIGKILL at shutdown.
    pub drain_timeout: Duration,
    /// Opt-in: recycle a service continuously Degraded for this long.
    pub restart_on_degraded_after: Option<Duration>,
}

impl RestartSpec {
    /// Backoff delay before restart attempt number `restart_count`.
    pub fn backoff_delay(&self, restart_count: u32) -> Duration {
        let factor = 2u32.saturating_pow(restart_count.min(16));
        self.backoff_base
            .saturating_mul(factor)
            .min(self.backoff_max)
    }
}

/// Immutable, fully-resolved definition of one supervised service.
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    /// Service identifier (the key in the configuration map).
    pub id: String,
    /// Command line or executable.
    pub command: String,
    /// Explicit argv; empty means the command is run through `sh -c`.
    pub args: Vec<String>,
    /// Working directory, resolved against the project root.
    pub working_dir: PathBuf,
    /// Environment definition for the spawned process.
    pub env: Option<EnvConfig>,
    /// Services that must be Healthy before this one starts.
    pub depends_on: Vec<String>,
    /// Probe definition; absent means "running implies Healthy".
    pub health: Option<HealthSpec>,
    /// Restart policy.
    pub restart: RestartSpec,
    /// Launcher policy when this service misses the startup window.
    pub on_startup_timeout: StartupTimeoutPolicy,
}

/// Static, validated registry of every supervised service.
#[derive(Debug)]
pub struct ServiceRegistry {
    specs: HashMap<String, Arc<ServiceSpec>>,
    start_order: Vec<String>,
    startup_timeout: Duration,
    health_endpoint: Option<String>,
    project_root: PathBuf,
}

impl ServiceRegistry {
    /// Validates a parsed configuration into a registry.
    ///
    /// Fails with a configuration-class error on an unknown dependency
    /// reference, a dependency cycle, or an unparsable duration, before any
    /// process is started.
    pub fn from_config(config: Config) -> Result<Self, SupervisorError> {
        let project_root = config
            .project_dir
            .as_ref()
            .and_then(|dir| {
                let trimmed = dir.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(PathBuf::from(trimmed))
                }
            })
            .unwrap_or_else(|| PathBuf::from("."));

        let startup_timeout = match &config.startup_timeout {
            Some(raw) => parse_duration("startup_timeout", raw)?,
            None => DEFAULT_STARTUP_TIMEOUT,
        };

        let mut specs = HashMap::new();
        for (name, service) in &config.services {
            let deps = service.depends_on.clone().unwrap_or_default();
            for dep in &deps {
                if !config.services.contains_key(dep) {
                    return Err(SupervisorError::UnknownDependency {
                        service: name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }

            let health = match &service.health_check {
                Some(check) => Some(HealthSpec {
                    kind: check.kind,
                    target: check.target.clone(),
                    interval: match &check.interval {
                        Some(raw) => parse_duration("health_check.interval", raw)?,
                        None => DEFAULT_PROBE_INTERVAL,
                    },
                    timeout: match &check.timeout {
                        Some(raw) => parse_duration("health_check.timeout", raw)?,
                        None => DEFAULT_PROBE_TIMEOUT,
                    },
                    success_threshold: check
                        .success_threshold
                        .unwrap_or(DEFAULT_SUCCESS_THRESHOLD)
                        .max(1),
                    failure_threshold: check
                        .failure_threshold
                        .unwrap_or(DEFAULT_FAILURE_THRESHOLD)
                        .max(1),
                }),
                None => None,
            };

            let restart = match &service.restart {
                Some(policy) => RestartSpec {
                    max_retries: policy.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
                    backoff_base: match &policy.backoff_base {
                        Some(raw) => parse_duration("restart.backoff_base", raw)?,
                        None => DEFAULT_BACKOFF_BASE,
                    },
                    backoff_max: match &policy.backoff_max {
                        Some(raw) => parse_duration("restart.backoff_max", raw)?,
                        None => DEFAULT_BACKOFF_MAX,
                    },
                    restart_window: match &policy.restart_window {
                        Some(raw) => parse_duration("restart.restart_window", raw)?,
                        None => DEFAULT_RESTART_WINDOW,
                    },
                    drain_timeout: match &policy.drain_timeout {
                        Some(raw) => parse_duration("restart.drain_timeout", raw)?,
                        None => DEFAULT_DRAIN_TIMEOUT,
                    },
                    restart_on_degraded_after: match &policy.restart_on_degraded_after {
                        Some(raw) => {
                            Some(parse_duration("restart.restart_on_degraded_after", raw)?)
                        }
                        None => None,
                    },
                },
                None => RestartSpec {
                    max_retries: DEFAULT_MAX_RETRIES,
                    backoff_base: DEFAULT_BACKOFF_BASE,
                    backoff_max: DEFAULT_BACKOFF_MAX,
                    restart_window: DEFAULT_RESTART_WINDOW,
                    drain_timeout: DEFAULT_DRAIN_TIMEOUT,
                    restart_on_degraded_after: None,
                },
            };

            let working_dir = match &service.working_dir {
                Some(dir) => {
                    let path = PathBuf::from(dir);
                    if path.is_absolute() {
                        path
                    } else {
                        project_root.join(path)
                    }
                }
                None => project_root.clone(),
            };

            specs.insert(
                name.clone(),
                Arc::new(ServiceSpec {
                    id: name.clone(),
                    command: service.command.clone(),
                    args: service.args.clone().unwrap_or_default(),
                    working_dir,
                    env: service.env.clone(),
                    depends_on: deps,
                    health,
                    restart,
                    on_startup_timeout: service.on_startup_timeout.unwrap_or_default(),
                }),
            );
        }

        let start_order = topological_order(&specs)?;

        Ok(Self {
            specs,
            start_order,
            startup_timeout,
            health_endpoint: config.health_endpoint,
            project_root,
        })
    }

    /// Service ids in startup order (dependencies first).
    pub fn start_order(&self) -> &[String] {
        &self.start_order
    }

    /// Service ids in shutdown order (dependents first).
    pub fn shutdown_order(&self) -> Vec<String> {
        self.start_order.iter().rev().cloned().collect()
    }

    /// Looks up the resolved spec for a service.
    pub fn spec(&self, id: &str) -> Option<&Arc<ServiceSpec>> {
        self.specs.get(id)
    }

    /// Number of declared services.
    pub fn len(&self) -> usize {
        self.specs.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Overall window the launcher allows for the full startup sequence.
    pub fn startup_timeout(&self) -> Duration {
        self.startup_timeout
    }

    /// Bind address for the aggregate health endpoint, if configured.
    pub fn health_endpoint(&self) -> Option<&str> {
        self.health_endpoint.as_deref()
    }

    /// Root directory from which relative paths are resolved.
    pub fn project_root(&self) -> &PathBuf {
        &self.project_root
    }
}

/// Computes a deterministic topological order over the dependency graph,
/// reporting the offending path on a cycle.
fn topological_order(
    specs: &HashMap<String, Arc<ServiceSpec>>,
) -> Result<Vec<String>, SupervisorError> {
    let mut order = Vec::with_capacity(specs.len());
    let mut visited = HashSet::new();
    let mut in_progress = HashSet::new();

    let mut names: Vec<&String> = specs.keys().collect();
    names.sort();

    for name in names {
        visit(name, specs, &mut visited, &mut in_progress, &mut Vec::new(), &mut order)?;
    }

    Ok(order)
}

fn visit(
    name: &str,
    specs: &HashMap<String, Arc<ServiceSpec>>,
    visited: &mut HashSet<String>,
    in_progress: &mut HashSet<String>,
    path: &mut Vec<String>,
    order: &mut Vec<String>,
) -> Result<(), SupervisorError> {
    if visited.contains(name) {
        return Ok(());
    }

    if !in_progress.insert(name.to_string()) {
        let start = path.iter().position(|p| p == name).unwrap_or(0);
        let mut cycle: Vec<&str> = path[start..].iter().map(String::as_str).collect();
        cycle.push(name);
        return Err(SupervisorError::DependencyCycle {
            cycle: cycle.join(" -> "),
        });
    }

    path.push(name.to_string());

    if let Some(spec) = specs.get(name) {
        let mut deps: Vec<&String> = spec.depends_on.iter().collect();
        deps.sort();
        for dep in deps {
            visit(dep, specs, visited, in_progress, path, order)?;
        }
    }

    path.pop();
    in_progress.remove(name);
    visited.insert(name.to_string());
    order.push(name.to_string());
    Ok(())
}
