// Privileged command execution: tokenized argv in, captured outcome out.
// Commands are never passed through a shell.

use std::cell::RefCell;
use std::io::Read;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{Result, VpcError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    /// Execute commands and capture their outcome.
    Live,
    /// Trace mutating commands without executing them. Read-only probes
    /// still run so planning can observe the host.
    DryRun,
}

#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl ExecOutput {
    fn dry() -> Self {
        Self {
            success: true,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: Some(0),
        }
    }
}

/// Runs external tools synchronously with a wall-clock bound.
///
/// The control plane is single-writer and strictly sequential, so the
/// executor blocks until the child terminates (or the deadline passes).
pub struct Executor {
    mode: ExecMode,
    timeout: Duration,
    trace: RefCell<Vec<Vec<String>>>,
}

impl Executor {
    pub fn new(mode: ExecMode, timeout: Duration) -> Self {
        Self {
            mode,
            timeout,
            trace: RefCell::new(Vec::new()),
        }
    }

    pub fn mode(&self) -> ExecMode {
        self.mode
    }

    pub fn is_dry(&self) -> bool {
        self.mode == ExecMode::DryRun
    }

    /// Run a mutating command. Non-zero exit is an error carrying the
    /// original tokens and captured stderr.
    pub fn run(&self, argv: &[String]) -> Result<ExecOutput> {
        if self.is_dry() {
            println!(">>> {}", argv.join(" "));
            self.trace.borrow_mut().push(argv.to_vec());
            return Ok(ExecOutput::dry());
        }
        tracing::debug!("exec: {}", argv.join(" "));
        let out = self.spawn_bounded(argv)?;
        if !out.success {
            return Err(VpcError::Exec {
                cmd: argv.to_vec(),
                stderr: out.stderr,
            });
        }
        Ok(out)
    }

    /// Run a mutating command where failure is tolerable (teardown paths).
    /// Spawn errors and timeouts surface as a failed [`ExecOutput`].
    pub fn run_unchecked(&self, argv: &[String]) -> ExecOutput {
        if self.is_dry() {
            println!(">>> {}", argv.join(" "));
            self.trace.borrow_mut().push(argv.to_vec());
            return ExecOutput::dry();
        }
        tracing::debug!("exec (unchecked): {}", argv.join(" "));
        match self.spawn_bounded(argv) {
            Ok(out) => out,
            Err(e) => ExecOutput {
                success: false,
                stdout: String::new(),
                stderr: e.to_string(),
                exit_code: None,
            },
        }
    }

    /// Read-only existence probe. Runs even in dry mode; must not mutate.
    pub fn probe(&self, argv: &[String]) -> bool {
        match self.spawn_bounded(argv) {
            Ok(out) => out.success,
            Err(_) => false,
        }
    }

    /// Read-only stdout capture for enumeration and planning.
    pub fn capture(&self, argv: &[String]) -> Result<String> {
        let out = self.spawn_bounded(argv)?;
        if !out.success {
            return Err(VpcError::Exec {
                cmd: argv.to_vec(),
                stderr: out.stderr,
            });
        }
        Ok(out.stdout)
    }

    /// Commands traced so far in dry-run mode, in emission order.
    pub fn trace(&self) -> Vec<Vec<String>> {
        self.trace.borrow().clone()
    }

    fn spawn_bounded(&self, argv: &[String]) -> Result<ExecOutput> {
        let (program, args) = argv.split_first().ok_or_else(|| VpcError::Exec {
            cmd: Vec::new(),
            stderr: "empty command".to_string(),
        })?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let deadline = Instant::now() + self.timeout;
        loop {
            match child.try_wait()? {
                Some(status) => {
                    let mut stdout = String::new();
                    let mut stderr = String::new();
                    if let Some(mut s) = child.stdout.take() {
                        let _ = s.read_to_string(&mut stdout);
                    }
                    if let Some(mut s) = child.stderr.take() {
                        let _ = s.read_to_string(&mut stderr);
                    }
                    return Ok(ExecOutput {
                        success: status.success(),
                        stdout,
                        stderr,
                        exit_code: status.code(),
                    });
                }
                None => {
                    if Instant::now() >= deadline {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(VpcError::Timeout {
                            cmd: argv.to_vec(),
                            timeout_secs: self.timeout.as_secs(),
                        });
                    }
                    thread::sleep(Duration::from_millis(20));
                }
            }
        }
    }
}

/// Convenience for building tokenized command vectors.
pub fn tokens(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dry() -> Executor {
        Executor::new(ExecMode::DryRun, Duration::from_secs(5))
    }

    #[test]
    fn dry_run_records_mutations_without_executing() {
        let exec = dry();
        let argv = tokens(&["ip", "link", "add", "name", "br-x", "type", "bridge"]);
        let out = exec.run(&argv).unwrap();
        assert!(out.success);
        assert_eq!(exec.trace(), vec![argv]);
    }

    #[test]
    fn dry_run_unchecked_also_traces() {
        let exec = dry();
        let argv = tokens(&["ip", "link", "del", "br-x"]);
        assert!(exec.run_unchecked(&argv).success);
        assert_eq!(exec.trace().len(), 1);
    }

    #[test]
    fn live_command_captures_stdout() {
        let exec = Executor::new(ExecMode::Live, Duration::from_secs(5));
        let out = exec.capture(&tokens(&["echo", "hello"])).unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[test]
    fn live_failure_carries_tokens() {
        let exec = Executor::new(ExecMode::Live, Duration::from_secs(5));
        let argv = tokens(&["false"]);
        match exec.run(&argv) {
            Err(VpcError::Exec { cmd, .. }) => assert_eq!(cmd, argv),
            other => panic!("expected ErrExec, got {:?}", other.map(|o| o.exit_code)),
        }
    }

    #[test]
    fn timeout_kills_the_child() {
        let exec = Executor::new(ExecMode::Live, Duration::from_millis(100));
        let argv = tokens(&["sleep", "10"]);
        match exec.run(&argv) {
            Err(VpcError::Timeout { .. }) => {}
            other => panic!("expected ErrTimeout, got {:?}", other.map(|o| o.exit_code)),
        }
    }

    #[test]
    fn probe_reports_exit_status() {
        let exec = Executor::new(ExecMode::Live, Duration::from_secs(5));
        assert!(exec.probe(&tokens(&["true"])));
        assert!(!exec.probe(&tokens(&["false"])));
    }
}
