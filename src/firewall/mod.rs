// Filter-rule management: probe-then-add with comment tags, and reversal
// of recorded rules on teardown. The kernel is the source of truth; the VPC
// document's recorded forms are the replay log.

pub mod rule;

pub use rule::{Rule, Table, Verdict};

use crate::error::Result;
use crate::exec::{tokens, Executor};

pub struct RuleManager<'a> {
    exec: &'a Executor,
}

impl<'a> RuleManager<'a> {
    pub fn new(exec: &'a Executor) -> Self {
        Self { exec }
    }

    /// Ensure the rule is present. Probes with the check form first; adding
    /// an already-present rule is a no-op. Returns the add-form tokens for
    /// the caller to persist.
    pub fn ensure(&self, rule: &Rule) -> Result<Vec<String>> {
        let add = rule.add_tokens();
        if self.exec.probe(&rule.check_tokens()) {
            tracing::debug!("rule exists, skipping: {}", add.join(" "));
            return Ok(add);
        }
        self.exec.run(&add)?;
        Ok(add)
    }

    /// Delete a rule from its recorded add-form. Tries the exact form
    /// first, then retries with the comment match stripped (the comment may
    /// have been hand-edited away). Failure is reported, not fatal.
    pub fn remove_recorded(&self, recorded: &[String]) -> bool {
        let del = rule::delete_form(recorded);
        if self.exec.run_unchecked(&del).success {
            return true;
        }
        let stripped = rule::strip_comment(&del);
        if stripped != del && self.exec.run_unchecked(&stripped).success {
            return true;
        }
        tracing::warn!("could not delete rule: {}", del.join(" "));
        false
    }

    /// Create a user-defined chain, tolerating one that already exists.
    pub fn create_chain(&self, chain: &str) -> Result<()> {
        if self.exec.probe(&tokens(&["iptables", "-L", chain, "-n"])) {
            tracing::debug!("chain {} already exists, skipping", chain);
            return Ok(());
        }
        self.exec.run(&tokens(&["iptables", "-N", chain]))?;
        Ok(())
    }

    /// Best-effort chain teardown: drop the FORWARD jump, flush, delete.
    pub fn delete_chain(&self, chain: &str, bridge: &str) {
        for argv in [
            tokens(&["iptables", "-D", "FORWARD", "-i", bridge, "-j", chain]),
            tokens(&["iptables", "-F", chain]),
            tokens(&["iptables", "-X", chain]),
        ] {
            let out = self.exec.run_unchecked(&argv);
            if !out.success {
                tracing::debug!("chain teardown step failed: {}", argv.join(" "));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::ExecMode;
    use std::time::Duration;

    fn dry() -> Executor {
        Executor::new(ExecMode::DryRun, Duration::from_secs(5))
    }

    #[test]
    fn ensure_returns_recorded_add_form() {
        let exec = dry();
        let fw = RuleManager::new(&exec);
        let rule = Rule::new(
            Table::Filter,
            "vpc-a",
            Verdict::Accept,
            "vpcctl:a:intra".to_string(),
        )
        .source("10.0.0.0/16")
        .dest("10.0.0.0/16");
        let recorded = fw.ensure(&rule).unwrap();
        assert_eq!(recorded, rule.add_tokens());
        // The probe runs live (and fails on this host), so the add is traced.
        assert_eq!(exec.trace(), vec![recorded]);
    }

    #[test]
    fn remove_recorded_swaps_to_delete_verb() {
        let exec = dry();
        let fw = RuleManager::new(&exec);
        let rule = Rule::new(
            Table::Nat,
            "POSTROUTING",
            Verdict::Masquerade,
            "vpcctl:a:nat:public".to_string(),
        )
        .source("10.0.1.0/24")
        .out_iface("eth0");
        assert!(fw.remove_recorded(&rule.add_tokens()));
        let trace = exec.trace();
        assert_eq!(trace.len(), 1);
        assert!(trace[0].contains(&"-D".to_string()));
    }

    #[test]
    fn chain_teardown_emits_jump_flush_delete() {
        let exec = dry();
        RuleManager::new(&exec).delete_chain("vpc-a", "br-a");
        let trace = exec.trace();
        assert_eq!(trace.len(), 3);
        assert_eq!(trace[0][1], "-D");
        assert_eq!(trace[1][1], "-F");
        assert_eq!(trace[2][1], "-X");
    }
}
