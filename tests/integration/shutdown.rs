mod common;

use std::{fs, sync::Arc, thread, time::Duration};

use common::{is_process_alive, make_config, make_service, wait_until};
use tandemd::{state::ServiceStatus, supervisor::Supervisor};

/// A service that records its own termination into `order.log` before exiting.
fn trap_service(dir: &std::path::Path, name: &str, deps: &[&str]) -> tandemd::config::ServiceConfig {
    let order_log = dir.join("order.log");
    let command = format!(
        "trap 'echo {name} >> {log}; exit 0' TERM; while true; do sleep 0.1; done",
        log = order_log.display()
    );
    make_service(&command, deps)
}

#[test]
fn services_stop_in_reverse_dependency_order() {
    let dir = tempfile::tempdir().unwrap();

    let config = make_config(
        dir.path(),
        vec![
            ("a", trap_service(dir.path(), "a", &[])),
            ("b", trap_service(dir.path(), "b", &["a"])),
        ],
    );

    let supervisor = Supervisor::new(config).unwrap();
    supervisor.start().unwrap();

    supervisor.shutdown();
    supervisor.wait();

    let content = fs::read_to_string(dir.path().join("order.log")).unwrap();
    let lines: Vec<_> = content.lines().collect();
    assert_eq!(lines, vec!["b", "a"]);

    let states = supervisor.snapshot();
    assert!(states.iter().all(|s| s.status == ServiceStatus::Stopped));
    assert!(states.iter().all(|s| s.restart_count == 0));
}

#[test]
fn no_restart_is_attempted_for_exits_after_the_signal() {
    let dir = tempfile::tempdir().unwrap();

    let config = make_config(
        dir.path(),
        vec![
            ("a", trap_service(dir.path(), "a", &[])),
            ("b", trap_service(dir.path(), "b", &["a"])),
        ],
    );

    let supervisor = Supervisor::new(config).unwrap();
    supervisor.start().unwrap();

    let pids: Vec<u32> = supervisor
        .snapshot()
        .iter()
        .filter_map(|s| s.pid)
        .collect();
    assert_eq!(pids.len(), 2);

    supervisor.shutdown();
    supervisor.wait();

    thread::sleep(Duration::from_millis(300));
    for pid in pids {
        assert!(!is_process_alive(pid));
    }
    assert!(supervisor.snapshot().iter().all(|s| s.restart_count == 0));
}

#[test]
fn duplicate_termination_signals_are_idempotent() {
    let dir = tempfile::tempdir().unwrap();

    let config = make_config(
        dir.path(),
        vec![
            ("a", trap_service(dir.path(), "a", &[])),
            ("b", trap_service(dir.path(), "b", &["a"])),
        ],
    );

    let supervisor = Supervisor::new(config).unwrap();
    supervisor.start().unwrap();

    // Two signals in quick succession: the second is a no-op.
    let second = {
        let supervisor = Arc::clone(&supervisor);
        thread::spawn(move || supervisor.shutdown())
    };
    supervisor.shutdown();
    second.join().unwrap();
    supervisor.wait();

    let content = fs::read_to_string(dir.path().join("order.log")).unwrap();
    let lines: Vec<_> = content.lines().collect();
    assert_eq!(lines, vec!["b", "a"]);
    assert!(
        supervisor
            .snapshot()
            .iter()
            .all(|s| s.status == ServiceStatus::Stopped)
    );
}

#[test]
fn stubborn_service_is_force_killed_after_drain_timeout() {
    let dir = tempfile::tempdir().unwrap();

    // Ignores TERM entirely; only SIGKILL can take it down.
    let mut stubborn = make_service("trap '' TERM; while true; do sleep 0.1; done", &[]);
    stubborn.restart.as_mut().unwrap().drain_timeout = Some("1s".into());

    let config = make_config(dir.path(), vec![("stubborn", stubborn)]);
    let supervisor = Supervisor::new(config).unwrap();
    supervisor.start().unwrap();

    let pid = supervisor.snapshot()[0].pid.unwrap();

    supervisor.shutdown();
    supervisor.wait();

    assert!(wait_until(|| !is_process_alive(pid), Duration::from_secs(5)));
    assert_eq!(supervisor.snapshot()[0].status, ServiceStatus::Stopped);
}

#[test]
fn pending_services_reach_stopped_when_startup_is_interrupted() {
    let dir = tempfile::tempdir().unwrap();

    let mut a = make_service("sleep 30", &[]);
    a.health_check = Some(common::exec_check("false"));
    let b = make_service("sleep 30", &["a"]);

    let mut config = make_config(dir.path(), vec![("a", a), ("b", b)]);
    config.startup_timeout = Some("10s".into());

    let supervisor = Supervisor::new(config).unwrap();
    let starter = {
        let supervisor = Arc::clone(&supervisor);
        thread::spawn(move || supervisor.start())
    };

    // Signal arrives while the launcher is still waiting on A's first probe.
    assert!(wait_until(
        || supervisor.snapshot().iter().any(|s| s.pid.is_some()),
        Duration::from_secs(5),
    ));
    supervisor.shutdown();
    supervisor.wait();

    starter.join().unwrap().unwrap();
    assert!(
        supervisor
            .snapshot()
            .iter()
            .all(|s| s.status == ServiceStatus::Stopped)
    );
}
