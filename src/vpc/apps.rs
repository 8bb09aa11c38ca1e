// Test-workload lifecycle: a minimal HTTP listener launched inside a
// subnet namespace, detached, with output captured to a well-known log
// path so reachability scenarios have something to probe.

use std::fs::File;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

use crate::error::Result;
use crate::exec::Executor;
use crate::store::model::AppRecord;

pub fn log_path(ns: &str) -> String {
    format!("/tmp/vpcctl-{ns}-http.log")
}

/// Launch the listener detached. In dry-run mode the launch command is
/// traced and no process is started (the record then has no pid).
pub fn launch(exec: &Executor, ns: &str, port: u16) -> Result<AppRecord> {
    let port_str = port.to_string();
    let cmd: Vec<String> = ["ip", "netns", "exec", ns, "python3", "-m", "http.server"]
        .iter()
        .map(|s| s.to_string())
        .chain(std::iter::once(port_str))
        .collect();

    if exec.is_dry() {
        exec.run(&cmd)?;
        return Ok(AppRecord {
            ns: ns.to_string(),
            port,
            pid: None,
            cmd,
        });
    }

    let log = File::create(log_path(ns))?;
    let log_err = log.try_clone()?;
    let child = Command::new(&cmd[0])
        .args(&cmd[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err))
        .spawn()?;
    let pid = child.id() as i32;
    // Not waited on inline; a detached reaper collects the exit status if
    // the listener dies while this process is still alive, so a later
    // stop-app sees the pid disappear instead of a zombie.
    thread::spawn(move || {
        let mut child = child;
        let _ = child.wait();
    });

    tracing::info!("listener started in {} on port {} (pid {})", ns, port, pid);
    Ok(AppRecord {
        ns: ns.to_string(),
        port,
        pid: Some(pid),
        cmd,
    })
}

/// Stop a recorded workload: SIGTERM, bounded wait, SIGKILL on timeout.
/// Returns false only when the process refused to die.
pub fn stop(exec: &Executor, app: &AppRecord, grace: Duration) -> bool {
    let Some(raw_pid) = app.pid else {
        return true;
    };
    if exec.is_dry() {
        let _ = exec.run(&["kill", "-TERM", &raw_pid.to_string()].map(String::from));
        return true;
    }
    terminate(Pid::from_raw(raw_pid), grace)
}

fn terminate(pid: Pid, grace: Duration) -> bool {
    if !alive(pid) {
        return true;
    }
    if let Err(e) = signal::kill(pid, Signal::SIGTERM) {
        tracing::warn!("SIGTERM to {} failed: {}", pid, e);
    }
    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if !alive(pid) {
            return true;
        }
        thread::sleep(Duration::from_millis(100));
    }
    tracing::warn!("pid {} survived SIGTERM, escalating", pid);
    let _ = signal::kill(pid, Signal::SIGKILL);
    thread::sleep(Duration::from_millis(100));
    !alive(pid)
}

fn alive(pid: Pid) -> bool {
    signal::kill(pid, None).is_ok()
}
