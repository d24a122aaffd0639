//! Configuration management for tandemd.
use regex::Regex;
use serde::Deserialize;
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};
use strum_macros::{AsRefStr, EnumString};
use tracing::warn;

use crate::error::SupervisorError;

/// Represents the structure of the configuration file.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Configuration version.
    pub version: String,
    /// Map of service names to their respective configurations.
    pub services: HashMap<String, ServiceConfig>,
    /// Overall window the launcher allows for the full startup sequence.
    pub startup_timeout: Option<String>,
    /// Optional TCP bind address for the aggregate `/health` endpoint.
    pub health_endpoint: Option<String>,
    /// Root directory from which relative paths are resolved.
    pub project_dir: Option<String>,
}

/// Configuration for an individual service.
#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    /// Command used to start the service. Run through `sh -c` unless `args` is given.
    pub command: String,
    /// Explicit argv; when present the command is executed directly, not via the shell.
    pub args: Option<Vec<String>>,
    /// Working directory for the service, relative to the project root.
    pub working_dir: Option<String>,
    /// Optional environment variables for the service.
    pub env: Option<EnvConfig>,
    /// List of services that must be Healthy before this service starts.
    pub depends_on: Option<Vec<String>>,
    /// Liveness/readiness probe definition.
    pub health_check: Option<HealthCheckConfig>,
    /// Restart policy for crashes and sustained degradation.
    pub restart: Option<RestartConfig>,
    /// What the launcher does if this service never confirms Healthy in time.
    pub on_startup_timeout: Option<StartupTimeoutPolicy>,
}

/// Represents environment variables for a service.
#[derive(Debug, Deserialize, Clone)]
pub struct EnvConfig {
    /// Optional path to an environment file.
    pub file: Option<String>,
    /// Key-value pairs of environment variables.
    pub vars: Option<HashMap<String, String>>,
}

impl EnvConfig {
    /// Resolves the full path to the env file based on a base directory.
    pub fn path(&self, base: &Path) -> Option<PathBuf> {
        self.file.as_ref().map(|f| {
            let path = Path::new(f);
            if path.is_absolute() || path.exists() {
                path.to_path_buf()
            } else {
                base.join(path)
            }
        })
    }
}

/// How a service's health is checked.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, EnumString, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum HealthCheckKind {
    /// GET the target URL; 2xx is a pass.
    Http,
    /// Run the target command through `sh -c`; exit 0 is a pass.
    Exec,
}

/// Probe definition for a single service.
#[derive(Debug, Deserialize, Clone)]
pub struct HealthCheckConfig {
    /// Probe mechanism.
    pub kind: HealthCheckKind,
    /// URL for `http` probes, command line for `exec` probes.
    pub target: String,
    /// Polling cadence (e.g. "10s"). Defaults to 10s.
    pub interval: Option<String>,
    /// Per-call deadline, independent of the interval. Defaults to 5s.
    pub timeout: Option<String>,
    /// Consecutive passes required to (re)enter Healthy. Defaults to 1.
    pub success_threshold: Option<u32>,
    /// Consecutive failures required to leave Healthy. Defaults to 3.
    pub failure_threshold: Option<u32>,
}

/// Restart policy knobs for a single service.
#[derive(Debug, Deserialize, Clone)]
pub struct RestartConfig {
    /// Restarts allowed within `restart_window` before the service is Failed.
    pub max_retries: Option<u32>,
    /// Base backoff before the first respawn. Doubles per attempt.
    pub backoff_base: Option<String>,
    /// Upper bound on the backoff delay.
    pub backoff_max: Option<String>,
    /// Staying Healthy this long resets the restart counter.
    pub restart_window: Option<String>,
    /// Grace period between SIGTERM and SIGKILL at shutdown.
    pub drain_timeout: Option<String>,
    /// When set, a service continuously Degraded for this long is killed and
    /// respawned under the normal restart budget. Off unless configured.
    pub restart_on_degraded_after: Option<String>,
}

/// Launcher behavior when a service misses its startup window.
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq, EnumString, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StartupTimeoutPolicy {
    /// Abort the whole supervisor (default).
    #[default]
    Abort,
    /// Mark the service Degraded and continue with the start order.
    Degrade,
}

/// Expands `${VAR}` references within a string from the process environment.
///
/// Unlike shell expansion, an unset variable is a configuration error rather
/// than an empty substitution.
fn expand_env_vars(input: &str) -> Result<String, SupervisorError> {
    let re = Regex::new(r"\$\{?([A-Za-z_][A-Za-z0-9_]*)\}?").unwrap();

    for caps in re.captures_iter(input) {
        let var_name = &caps[1];
        if env::var(var_name).is_err() {
            return Err(SupervisorError::MissingEnvVar(var_name.to_string()));
        }
    }

    let result = re.replace_all(input, |caps: &regex::Captures| {
        env::var(&caps[1]).unwrap_or_default()
    });
    Ok(result.to_string())
}

/// Builds the environment map for a service, giving inline `env.vars` precedence
/// over entries loaded from `env.file`.
pub fn collect_service_env(
    env: &Option<EnvConfig>,
    project_root: &Path,
    service_name: &str,
) -> HashMap<String, String> {
    let mut resolved = HashMap::new();

    if let Some(env_config) = env {
        if let Some(file_path) = env_config.path(project_root) {
            match fs::read_to_string(&file_path) {
                Ok(content) => {
                    for raw_line in content.lines() {
                        let line = raw_line.trim();
                        if line.is_empty() || line.starts_with('#') {
                            continue;
                        }

                        if let Some((key, value)) = line.split_once('=') {
                            let key = key.trim().to_string();
                            let mut value = value.trim().to_string();

                            if value.starts_with('"')
                                && value.ends_with('"')
                                && value.len() >= 2
                            {
                                value = value[1..value.len() - 1].to_string();
                            }

                            resolved.entry(key).or_insert(value);
                        } else {
                            warn!(
                                "Ignoring malformed line in env file for '{}': {}",
                                service_name, line
                            );
                        }
                    }
                }
                Err(err) => {
                    warn!("Failed to read env file for '{}': {}", service_name, err);
                }
            }
        }

        if let Some(vars) = &env_config.vars {
            for (key, value) in vars {
                resolved.insert(key.clone(), value.clone());
            }
        }
    }

    resolved
}

/// Parses a user-facing duration string in the format `<number>[s|m|h]`.
///
/// A bare number is seconds. `field` names the config key for error reporting.
pub fn parse_duration(field: &str, raw: &str) -> Result<Duration, SupervisorError> {
    let value = raw.trim();
    if value.is_empty() {
        return Err(SupervisorError::InvalidDuration {
            field: field.to_string(),
            value: raw.to_string(),
        });
    }

    let (amount_str, multiplier) = if let Some(stripped) = value.strip_suffix('s') {
        (stripped.trim(), 1)
    } else if let Some(stripped) = value.strip_suffix('m') {
        (stripped.trim(), 60)
    } else if let Some(stripped) = value.strip_suffix('h') {
        (stripped.trim(), 3600)
    } else {
        (value, 1)
    };

    let amount: u64 =
        amount_str
            .parse()
            .map_err(|_| SupervisorError::InvalidDuration {
                field: field.to_string(),
                value: raw.to_string(),
            })?;

    Ok(Duration::from_secs(amount.saturating_mul(multiplier)))
}

/// Loads and parses the configuration file, expanding environment variables.
pub fn load_config(config_path: Option<&str>) -> Result<Config, SupervisorError> {
    let config_path = config_path
        .map(Path::new)
        .unwrap_or_else(|| Path::new("tandemd.yaml"));

    let content = fs::read_to_string(config_path).map_err(|e| {
        SupervisorError::ConfigRead(std::io::Error::new(
            e.kind(),
            format!("{} ({})", e, config_path.display()),
        ))
    })?;

    let expanded_content = expand_env_vars(&content)?;

    let mut config: Config = serde_yaml::from_str(&expanded_content)?;

    let base_path = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    config.project_dir = Some(base_path.to_string_lossy().to_string());

    Ok(config)
}
