// Network namespace lifecycle and in-namespace command scoping.

use crate::error::Result;
use crate::exec::{tokens, Executor};

pub struct NetnsOps<'a> {
    exec: &'a Executor,
}

impl<'a> NetnsOps<'a> {
    pub fn new(exec: &'a Executor) -> Self {
        Self { exec }
    }

    pub fn exists(&self, ns: &str) -> bool {
        match self.exec.capture(&tokens(&["ip", "netns", "list"])) {
            Ok(out) => out
                .lines()
                .any(|l| l.split_whitespace().next() == Some(ns)),
            Err(_) => false,
        }
    }

    pub fn create(&self, ns: &str) -> Result<()> {
        if self.exists(ns) {
            tracing::debug!("namespace {} already exists, skipping", ns);
            return Ok(());
        }
        self.exec.run(&tokens(&["ip", "netns", "add", ns]))?;
        Ok(())
    }

    /// Bring the loopback interface up inside a fresh namespace.
    pub fn loopback_up(&self, ns: &str) -> Result<()> {
        self.exec
            .run(&wrap(ns, &["ip", "link", "set", "lo", "up"]))?;
        Ok(())
    }

    /// Flush the namespace-local filter and nat tables. Best-effort,
    /// used only on teardown.
    pub fn flush_iptables(&self, ns: &str) {
        for argv in [
            wrap(ns, &["iptables", "-F"]),
            wrap(ns, &["iptables", "-t", "nat", "-F"]),
        ] {
            let out = self.exec.run_unchecked(&argv);
            if !out.success {
                tracing::debug!("flush in {} failed: {}", ns, out.stderr.trim());
            }
        }
    }

    /// Best-effort delete; removes any interfaces moved into the namespace.
    pub fn delete(&self, ns: &str) {
        let out = self.exec.run_unchecked(&tokens(&["ip", "netns", "del", ns]));
        if !out.success {
            tracing::warn!("namespace {} delete failed: {}", ns, out.stderr.trim());
        }
    }
}

/// Prefix a tokenized command so it runs inside the namespace.
pub fn wrap(ns: &str, inner: &[&str]) -> Vec<String> {
    let mut argv = tokens(&["ip", "netns", "exec", ns]);
    argv.extend(inner.iter().map(|s| s.to_string()));
    argv
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::ExecMode;
    use std::time::Duration;

    #[test]
    fn wrap_scopes_commands_to_the_namespace() {
        assert_eq!(
            wrap("ns-a-b", &["ip", "route", "add", "default", "via", "10.0.1.1"]),
            tokens(&[
                "ip", "netns", "exec", "ns-a-b", "ip", "route", "add", "default", "via",
                "10.0.1.1"
            ])
        );
    }

    #[test]
    fn teardown_flushes_filter_and_nat() {
        let exec = Executor::new(ExecMode::DryRun, Duration::from_secs(5));
        let ops = NetnsOps::new(&exec);
        ops.flush_iptables("ns-x");
        ops.delete("ns-x");
        let trace = exec.trace();
        assert_eq!(trace.len(), 3);
        assert_eq!(trace[2], tokens(&["ip", "netns", "del", "ns-x"]));
    }
}
