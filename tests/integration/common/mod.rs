#![allow(dead_code)]

use std::{
    collections::HashMap,
    path::Path,
    thread,
    time::{Duration, Instant},
};

use tandemd::config::{
    Config, HealthCheckConfig, HealthCheckKind, RestartConfig, ServiceConfig,
};

/// Minimal service definition; tests mutate the fields they care about.
pub fn make_service(command: &str, deps: &[&str]) -> ServiceConfig {
    ServiceConfig {
        command: command.to_string(),
        args: None,
        working_dir: None,
        env: None,
        depends_on: if deps.is_empty() {
            None
        } else {
            Some(deps.iter().map(|d| d.to_string()).collect())
        },
        health_check: None,
        restart: Some(fast_restart()),
        on_startup_timeout: None,
    }
}

/// Exec health check polling every second.
pub fn exec_check(target: &str) -> HealthCheckConfig {
    HealthCheckConfig {
        kind: HealthCheckKind::Exec,
        target: target.to_string(),
        interval: Some("1s".into()),
        timeout: Some("2s".into()),
        success_threshold: Some(1),
        failure_threshold: Some(3),
    }
}

/// Restart policy tuned for test turnaround.
pub fn fast_restart() -> RestartConfig {
    RestartConfig {
        max_retries: Some(3),
        backoff_base: Some("0s".into()),
        backoff_max: Some("1s".into()),
        restart_window: Some("5m".into()),
        drain_timeout: Some("3s".into()),
        restart_on_degraded_after: None,
    }
}

pub fn make_config(dir: &Path, services: Vec<(&str, ServiceConfig)>) -> Config {
    Config {
        version: "1".into(),
        services: services
            .into_iter()
            .map(|(name, svc)| (name.to_string(), svc))
            .collect::<HashMap<_, _>>(),
        startup_timeout: Some("20s".into()),
        health_endpoint: None,
        project_dir: Some(dir.to_string_lossy().to_string()),
    }
}

/// Polls `cond` until it holds or the timeout elapses.
pub fn wait_until<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(50));
    }
    false
}

pub fn wait_for_path(path: &Path) {
    if !wait_until(|| path.exists(), Duration::from_secs(10)) {
        panic!("Timed out waiting for {:?} to exist", path);
    }
}

pub fn is_process_alive(pid: u32) -> bool {
    use sysinfo::{Pid, ProcessesToUpdate, System};

    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);
    system.process(Pid::from_u32(pid)).is_some()
}
