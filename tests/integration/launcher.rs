mod common;

use std::{sync::Arc, thread, time::Duration};

use common::{exec_check, make_config, make_service, wait_for_path, wait_until};
use tandemd::{
    config::StartupTimeoutPolicy,
    error::SupervisorError,
    state::ServiceStatus,
    supervisor::Supervisor,
};

#[test]
fn dependent_stays_pending_until_dependency_is_healthy() {
    let dir = tempfile::tempdir().unwrap();
    let gate = dir.path().join("a_ok");
    let a_started = dir.path().join("a_started");
    let b_started = dir.path().join("b_started");

    let mut a = make_service(&format!("touch {} && sleep 30", a_started.display()), &[]);
    a.health_check = Some(exec_check(&format!("test -f {}", gate.display())));
    let b = make_service(&format!("touch {} && sleep 30", b_started.display()), &["a"]);

    let config = make_config(dir.path(), vec![("a", a), ("b", b)]);
    let supervisor = Supervisor::new(config).unwrap();

    let starter = {
        let supervisor = Arc::clone(&supervisor);
        thread::spawn(move || supervisor.start())
    };

    wait_for_path(&a_started);
    thread::sleep(Duration::from_millis(1500));

    // A's health gate is closed, so B has not been touched.
    assert!(!b_started.exists());
    assert_eq!(supervisor.snapshot().iter().find(|s| s.id == "b").unwrap().status,
        ServiceStatus::Pending);

    std::fs::write(&gate, "").unwrap();

    assert!(wait_until(
        || {
            let states = supervisor.snapshot();
            states.iter().all(|s| s.status == ServiceStatus::Healthy)
        },
        Duration::from_secs(10),
    ));
    assert!(b_started.exists());

    starter.join().unwrap().unwrap();
    supervisor.shutdown();
    supervisor.wait();
}

#[test]
fn startup_aborts_when_service_never_confirms_healthy() {
    let dir = tempfile::tempdir().unwrap();
    let b_started = dir.path().join("b_started");

    let mut a = make_service("sleep 30", &[]);
    a.health_check = Some(exec_check("false"));
    let b = make_service(&format!("touch {} && sleep 30", b_started.display()), &["a"]);

    let mut config = make_config(dir.path(), vec![("a", a), ("b", b)]);
    config.startup_timeout = Some("3s".into());

    let supervisor = Supervisor::new(config).unwrap();
    let err = supervisor.start().unwrap_err();
    assert!(matches!(err, SupervisorError::StartupTimeout { .. }));
    assert!(!b_started.exists());

    supervisor.shutdown();
    supervisor.wait();
}

#[test]
fn degrade_override_continues_past_a_failing_service() {
    let dir = tempfile::tempdir().unwrap();

    let mut a = make_service("sleep 30", &[]);
    a.health_check = Some(exec_check("false"));
    a.on_startup_timeout = Some(StartupTimeoutPolicy::Degrade);
    let b = make_service("sleep 30", &[]);

    let mut config = make_config(dir.path(), vec![("a", a), ("b", b)]);
    config.startup_timeout = Some("3s".into());

    let supervisor = Supervisor::new(config).unwrap();
    supervisor.start().unwrap();

    let states = supervisor.snapshot();
    assert_eq!(
        states.iter().find(|s| s.id == "a").unwrap().status,
        ServiceStatus::Degraded
    );
    assert_eq!(
        states.iter().find(|s| s.id == "b").unwrap().status,
        ServiceStatus::Healthy
    );

    supervisor.shutdown();
    supervisor.wait();
}

#[test]
fn services_without_probes_confirm_by_staying_alive() {
    let dir = tempfile::tempdir().unwrap();

    let config = make_config(
        dir.path(),
        vec![
            ("api", make_service("sleep 30", &["agent"])),
            ("agent", make_service("sleep 30", &[])),
        ],
    );

    let supervisor = Supervisor::new(config).unwrap();
    supervisor.start().unwrap();

    let states = supervisor.snapshot();
    assert!(states.iter().all(|s| s.status == ServiceStatus::Healthy));
    assert!(states.iter().all(|s| s.pid.is_some()));

    supervisor.shutdown();
    supervisor.wait();
}
