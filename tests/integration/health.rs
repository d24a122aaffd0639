mod common;

use std::time::Duration;

use common::{make_config, make_service, wait_until};
use tandemd::{
    health::{AggregateStatus, check_endpoint},
    state::ServiceStatus,
    supervisor::Supervisor,
};

#[test]
fn endpoint_serves_aggregate_report_and_flips_to_503_on_failure() {
    let dir = tempfile::tempdir().unwrap();

    let mut doomed = make_service("sleep 30", &[]);
    doomed.restart.as_mut().unwrap().max_retries = Some(0);
    let steady = make_service("sleep 30", &[]);

    let mut config = make_config(dir.path(), vec![("doomed", doomed), ("steady", steady)]);
    config.health_endpoint = Some("127.0.0.1:0".into());

    let supervisor = Supervisor::new(config).unwrap();
    supervisor.start().unwrap();

    let addr = supervisor.health_addr().expect("endpoint should be bound");
    let url = format!("http://{addr}/health");

    let report = check_endpoint(&url, Duration::from_secs(5)).unwrap();
    assert_eq!(report.status, AggregateStatus::Healthy);
    assert_eq!(report.services.len(), 2);
    assert!(report.services.iter().all(|s| s.pid.is_some()));
    assert!(
        report
            .services
            .iter()
            .all(|s| s.status == ServiceStatus::Healthy)
    );

    // Kill the zero-budget service: it goes terminal Failed and the endpoint
    // starts answering 503 with an unhealthy fold.
    let pid = report
        .services
        .iter()
        .find(|s| s.id == "doomed")
        .unwrap()
        .pid
        .unwrap();
    nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(pid as i32),
        nix::sys::signal::Signal::SIGKILL,
    )
    .unwrap();

    assert!(wait_until(
        || supervisor.aggregate_health() == AggregateStatus::Unhealthy,
        Duration::from_secs(10),
    ));

    let client = reqwest::blocking::Client::new();
    let response = client.get(&url).send().unwrap();
    assert_eq!(response.status().as_u16(), 503);

    let report: tandemd::health::HealthReport =
        serde_json::from_str(&response.text().unwrap()).unwrap();
    assert_eq!(report.status, AggregateStatus::Unhealthy);
    assert_eq!(
        report
            .services
            .iter()
            .find(|s| s.id == "doomed")
            .unwrap()
            .status,
        ServiceStatus::Failed
    );

    supervisor.shutdown();
    supervisor.wait();
}

#[test]
fn unknown_paths_get_a_404() {
    let dir = tempfile::tempdir().unwrap();

    let mut config = make_config(dir.path(), vec![("svc", make_service("sleep 30", &[]))]);
    config.health_endpoint = Some("127.0.0.1:0".into());

    let supervisor = Supervisor::new(config).unwrap();
    supervisor.start().unwrap();

    let addr = supervisor.health_addr().unwrap();
    let client = reqwest::blocking::Client::new();
    let response = client
        .get(format!("http://{addr}/metrics"))
        .send()
        .unwrap();
    assert_eq!(response.status().as_u16(), 404);

    supervisor.shutdown();
    supervisor.wait();
}

#[test]
fn degraded_startup_reports_degraded_not_unhealthy() {
    let dir = tempfile::tempdir().unwrap();

    let mut laggard = make_service("sleep 30", &[]);
    laggard.health_check = Some(common::exec_check("false"));
    laggard.on_startup_timeout = Some(tandemd::config::StartupTimeoutPolicy::Degrade);
    let steady = make_service("sleep 30", &[]);

    let mut config = make_config(dir.path(), vec![("laggard", laggard), ("steady", steady)]);
    config.startup_timeout = Some("2s".into());
    config.health_endpoint = Some("127.0.0.1:0".into());

    let supervisor = Supervisor::new(config).unwrap();
    supervisor.start().unwrap();

    let addr = supervisor.health_addr().unwrap();
    let client = reqwest::blocking::Client::new();
    let response = client
        .get(format!("http://{addr}/health"))
        .send()
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);

    let report: tandemd::health::HealthReport =
        serde_json::from_str(&response.text().unwrap()).unwrap();
    assert_eq!(report.status, AggregateStatus::Degraded);

    supervisor.shutdown();
    supervisor.wait();
}
