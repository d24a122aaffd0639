//! Error handling for tandemd.
use std::time::Duration;

use thiserror::Error;

/// Defines all possible errors that can occur in the supervisor.
///
/// Configuration-class variants (`ConfigRead`, `ConfigParse`, `MissingEnvVar`,
/// `InvalidDuration`, `UnknownDependency`, `DependencyCycle`) are fatal at load
/// time: the supervisor refuses to spawn anything and exits non-zero. Everything
/// else is contained per-service and reported through the aggregate health
/// surface.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Error reading or accessing a configuration file.
    #[error("Failed to read config file: {0}")]
    ConfigRead(#[from] std::io::Error),

    /// Error parsing YAML configuration.
    #[error("Invalid YAML format: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// A `${VAR}` reference in the configuration has no value in the environment.
    #[error("Missing environment variable referenced in config: {0}")]
    MissingEnvVar(String),

    /// A duration field could not be parsed.
    #[error("Invalid duration '{value}' for '{field}'")]
    InvalidDuration {
        /// The configuration field holding the bad value.
        field: String,
        /// The raw value as written.
        value: String,
    },

    /// Error when a dependency reference is undefined in the configuration.
    #[error("Service '{service}' declares unknown dependency '{dependency}'")]
    UnknownDependency {
        /// The service with an invalid dependency reference.
        service: String,
        /// The missing dependency name.
        dependency: String,
    },

    /// Error when the dependency graph contains a cycle.
    #[error("Detected dependency cycle: {cycle}")]
    DependencyCycle {
        /// Human-readable cycle description (e.g. `a -> b -> a`).
        cycle: String,
    },

    /// Error spawning a service process.
    #[error("Failed to start service '{service}': {source}")]
    ServiceStart {
        /// The service name that failed to start.
        service: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// Error stopping a service process.
    #[error("Failed to stop service '{service}': {source}")]
    ServiceStop {
        /// The service name that failed to stop.
        service: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// A service did not report Healthy within the launcher's startup window.
    #[error("Service '{service}' did not become healthy within {timeout:?}")]
    StartupTimeout {
        /// The service that never confirmed Healthy.
        service: String,
        /// The startup window that elapsed.
        timeout: Duration,
    },

    /// Error binding or serving the aggregate health endpoint.
    #[error("Health endpoint error: {0}")]
    HealthEndpoint(std::io::Error),

    /// Error delivering a signal to a supervised process.
    #[error("Signal delivery failed: {0}")]
    Signal(#[from] nix::errno::Errno),

    /// Error for poisoned mutex.
    #[error("Mutex is poisoned: {0}")]
    MutexPoison(String),
}

/// Implement the `From` trait to convert a `std::sync::PoisonError` into a `SupervisorError`.
impl<T> From<std::sync::PoisonError<T>> for SupervisorError {
    /// Converts a `std::sync::PoisonError` into a `SupervisorError`.
    fn from(err: std::sync::PoisonError<T>) -> Self {
        SupervisorError::MutexPoison(err.to_string())
    }
}
