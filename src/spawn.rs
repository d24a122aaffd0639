//! Process launching and signal delivery for supervised services.
use std::{
    io::{BufRead, BufReader, Read},
    process::{Child, Command, ExitStatus, Stdio},
    thread,
    time::{Duration, Instant},
};

use tracing::{debug, info, warn};

use crate::config::collect_service_env;
use crate::error::SupervisorError;
use crate::registry::ServiceSpec;

/// Launches a service as a child process that remains attached to the supervisor.
///
/// Each service is placed in its own process group so the whole tree can be
/// signalled without touching the supervisor's group. On **Linux** the child
/// additionally receives `SIGTERM` if the supervisor dies, via `prctl()`.
///
/// The command string runs through `sh -c` unless the spec carries an explicit
/// argv. Stdout and stderr are piped and forwarded line-by-line into the
/// supervisor's log.
pub fn launch_service(spec: &ServiceSpec) -> Result<Child, SupervisorError> {
    debug!(
        "Launching service: '{}' with command: `{}`",
        spec.id, spec.command
    );

    let mut cmd = if spec.args.is_empty() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&spec.command);
        cmd
    } else {
        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args);
        cmd
    };

    cmd.current_dir(&spec.working_dir);
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    let merged_env = collect_service_env(&spec.env, &spec.working_dir, &spec.id);
    if !merged_env.is_empty() {
        let keys: Vec<_> = merged_env.keys().cloned().collect();
        debug!("Setting environment variables: {:?}", keys);
        for (key, value) in merged_env {
            cmd.env(key, value);
        }
    }

    unsafe {
        use std::os::unix::process::CommandExt;
        cmd.pre_exec(move || {
            // Own process group so stop signals reach the whole service tree
            // without hitting the supervisor.
            if libc::setpgid(0, 0) < 0 {
                return Err(std::io::Error::last_os_error());
            }

            // Ensure the service gets killed on supervisor death (Linux only).
            #[cfg(target_os = "linux")]
            {
                use libc::{PR_SET_PDEATHSIG, SIGTERM, prctl};
                if prctl(PR_SET_PDEATHSIG, SIGTERM, 0, 0, 0) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }

            Ok(())
        });
    }

    let mut child = cmd.spawn().map_err(|e| SupervisorError::ServiceStart {
        service: spec.id.clone(),
        source: e,
    })?;

    debug!("Service '{}' started with PID: {}", spec.id, child.id());

    if let Some(out) = child.stdout.take() {
        spawn_output_forwarder(&spec.id, out, "stdout");
    }
    if let Some(err) = child.stderr.take() {
        spawn_output_forwarder(&spec.id, err, "stderr");
    }

    Ok(child)
}

/// Streams a child's output into the supervisor log, one line at a time.
fn spawn_output_forwarder<R: Read + Send + 'static>(
    service: &str,
    stream: R,
    kind: &'static str,
) {
    let service = service.to_string();
    thread::spawn(move || {
        let reader = BufReader::new(stream);
        for line in reader.lines().map_while(Result::ok) {
            match kind {
                "stderr" => warn!("[{service} {kind}] {line}"),
                _ => info!("[{service} {kind}] {line}"),
            }
        }
    });
}

/// Whether the process is still alive, probed with a null signal.
pub fn is_alive(pid: u32) -> bool {
    let pid = nix::unistd::Pid::from_raw(pid as i32);
    !matches!(
        nix::sys::signal::kill(pid, None),
        Err(nix::errno::Errno::ESRCH)
    )
}

/// Delivers a signal to the service's process group, falling back to the
/// process itself when the group is gone or off-limits.
pub fn signal_service(
    pid: u32,
    service: &str,
    signal: nix::sys::signal::Signal,
) -> Result<(), SupervisorError> {
    let target = nix::unistd::Pid::from_raw(pid as i32);

    let supervisor_pgid = unsafe { libc::getpgid(0) };
    let child_pgid = unsafe { libc::getpgid(pid as i32) };

    if child_pgid >= 0 && child_pgid != supervisor_pgid {
        let kill_result = unsafe { libc::killpg(child_pgid, signal as libc::c_int) };
        if kill_result < 0 {
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(code) if code == libc::ESRCH => {
                    debug!(
                        "Process group for service '{service}' missing; falling back to direct signal"
                    );
                }
                Some(code) if code == libc::EPERM => {
                    warn!(
                        "Insufficient permissions to signal process group {child_pgid} for '{service}'. Falling back to direct signal"
                    );
                }
                _ => {
                    return Err(SupervisorError::ServiceStop {
                        service: service.to_string(),
                        source: err,
                    });
                }
            }
        } else {
            debug!(
                "Sent {signal} to process group {child_pgid} for service '{service}'"
            );
            return Ok(());
        }
    }

    match nix::sys::signal::kill(target, Some(signal)) {
        Ok(_) | Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(err) => Err(SupervisorError::ServiceStop {
            service: service.to_string(),
            source: std::io::Error::from_raw_os_error(err as i32),
        }),
    }
}

/// Waits for a child process with a timeout, returning `Ok(None)` on timeout.
pub fn wait_with_timeout(
    child: &mut Child,
    timeout: Duration,
) -> std::io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;

    loop {
        match child.try_wait()? {
            Some(status) => return Ok(Some(status)),
            None => {
                if Instant::now() >= deadline {
                    return Ok(None);
                }
                thread::sleep(Duration::from_millis(50));
            }
        }
    }
}
