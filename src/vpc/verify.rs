// Cross-check: enumerate live kernel objects carrying the reserved naming
// prefixes and compare them against what the VPC documents account for.
// Report-only; the verifier never mutates.

use std::collections::BTreeSet;

use crate::error::Result;
use crate::exec::{tokens, Executor};
use crate::store::MetadataStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Namespace,
    Bridge,
    Link,
    Chain,
}

impl ResourceKind {
    pub fn label(self) -> &'static str {
        match self {
            ResourceKind::Namespace => "namespace",
            ResourceKind::Bridge => "bridge",
            ResourceKind::Link => "link",
            ResourceKind::Chain => "chain",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrphanState {
    /// Live on the host with a reserved prefix, but no document claims it.
    LiveUnaccounted,
    /// Referenced by a document, but the kernel has no such object.
    MissingLive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Orphan {
    pub kind: ResourceKind,
    pub name: String,
    pub state: OrphanState,
}

#[derive(Debug, Clone, Default)]
pub struct VerifyReport {
    /// Live objects accounted for by some VPC document.
    pub accounted: Vec<String>,
    pub orphans: Vec<Orphan>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.orphans.is_empty()
    }
}

pub fn verify(exec: &Executor, store: &MetadataStore) -> Result<VerifyReport> {
    let mut expected_ns = BTreeSet::new();
    let mut expected_bridges = BTreeSet::new();
    let mut expected_chains = BTreeSet::new();
    // Links expected to be visible on the host: bridge-side subnet veths
    // and peering veths. Namespace-side ends live inside their namespace.
    let mut expected_host_links = BTreeSet::new();
    // Any link name a document mentions, either side.
    let mut referenced_links = BTreeSet::new();

    for name in store.list()? {
        let doc = store.require(&name)?;
        expected_bridges.insert(doc.bridge.clone());
        expected_chains.insert(doc.chain.clone());
        for sub in &doc.subnets {
            expected_ns.insert(sub.ns.clone());
            expected_host_links.insert(sub.veth.bridge_side.clone());
            referenced_links.insert(sub.veth.bridge_side.clone());
            referenced_links.insert(sub.veth.ns_side.clone());
        }
        for peering in &doc.peers {
            expected_host_links.insert(peering.local_veth.clone());
            referenced_links.insert(peering.local_veth.clone());
            referenced_links.insert(peering.peer_veth.clone());
        }
    }

    let live_ns = live_namespaces(exec);
    let live_bridges = live_links(exec, true);
    let live_veths = live_links(exec, false);
    let live_chains = live_chains(exec);

    let mut report = VerifyReport::default();
    classify(
        &mut report,
        ResourceKind::Namespace,
        live_ns,
        &expected_ns,
        &expected_ns,
    );
    classify(
        &mut report,
        ResourceKind::Bridge,
        live_bridges,
        &expected_bridges,
        &expected_bridges,
    );
    classify(
        &mut report,
        ResourceKind::Link,
        live_veths,
        &referenced_links,
        &expected_host_links,
    );
    classify(
        &mut report,
        ResourceKind::Chain,
        live_chains,
        &expected_chains,
        &expected_chains,
    );
    Ok(report)
}

/// Match live objects against the documents. When an enumeration was
/// unavailable (insufficient privilege, missing tool) the missing-live
/// check for that kind is skipped rather than reporting noise.
fn classify(
    report: &mut VerifyReport,
    kind: ResourceKind,
    live: Option<BTreeSet<String>>,
    recognized: &BTreeSet<String>,
    expected_live: &BTreeSet<String>,
) {
    let Some(live) = live else {
        tracing::warn!("could not enumerate live {}s, skipping", kind.label());
        return;
    };
    for name in &live {
        if recognized.contains(name) {
            report.accounted.push(format!("{} {}", kind.label(), name));
        } else {
            report.orphans.push(Orphan {
                kind,
                name: name.clone(),
                state: OrphanState::LiveUnaccounted,
            });
        }
    }
    for name in expected_live {
        if !live.contains(name) {
            report.orphans.push(Orphan {
                kind,
                name: name.clone(),
                state: OrphanState::MissingLive,
            });
        }
    }
}

fn live_namespaces(exec: &Executor) -> Option<BTreeSet<String>> {
    let out = exec.capture(&tokens(&["ip", "netns", "list"])).ok()?;
    Some(
        out.lines()
            .filter_map(|line| line.split_whitespace().next())
            .filter(|name| name.starts_with("ns-"))
            .map(String::from)
            .collect(),
    )
}

fn live_links(exec: &Executor, bridges: bool) -> Option<BTreeSet<String>> {
    let argv = if bridges {
        tokens(&["ip", "-o", "link", "show", "type", "bridge"])
    } else {
        tokens(&["ip", "-o", "link", "show"])
    };
    let out = exec.capture(&argv).ok()?;
    let wanted: &[&str] = if bridges { &["br-"] } else { &["v-", "pv-"] };
    Some(
        out.lines()
            .filter_map(parse_link_name)
            .filter(|name| wanted.iter().any(|p| name.starts_with(p)))
            .collect(),
    )
}

/// `ip -o link show` lines look like `4: br-myvpc: <BROADCAST,...` or
/// `7: v-a-weba@if6: <...`; the name is the second field, with any
/// `@peer` qualifier dropped.
fn parse_link_name(line: &str) -> Option<String> {
    let field = line.split_whitespace().nth(1)?;
    let name = field.trim_end_matches(':').split('@').next()?;
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

fn live_chains(exec: &Executor) -> Option<BTreeSet<String>> {
    let out = exec.capture(&tokens(&["iptables", "-S"])).ok()?;
    Some(
        out.lines()
            .filter_map(|line| line.strip_prefix("-N "))
            .map(|name| name.trim().to_string())
            .filter(|name| name.starts_with("vpc-"))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_names_parse_with_and_without_peers() {
        assert_eq!(
            parse_link_name("4: br-myvpc: <BROADCAST,MULTICAST> mtu 1500"),
            Some("br-myvpc".to_string())
        );
        assert_eq!(
            parse_link_name("7: v-myvpc-weba@if6: <BROADCAST> mtu 1500"),
            Some("v-myvpc-weba".to_string())
        );
        assert_eq!(parse_link_name(""), None);
    }

    #[test]
    fn classify_reports_both_orphan_directions() {
        let mut report = VerifyReport::default();
        let live: BTreeSet<String> = ["ns-known", "ns-stray"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let expected: BTreeSet<String> = ["ns-known", "ns-lost"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        classify(
            &mut report,
            ResourceKind::Namespace,
            Some(live),
            &expected,
            &expected,
        );
        assert_eq!(report.accounted, vec!["namespace ns-known"]);
        assert_eq!(report.orphans.len(), 2);
        assert!(report.orphans.contains(&Orphan {
            kind: ResourceKind::Namespace,
            name: "ns-stray".to_string(),
            state: OrphanState::LiveUnaccounted,
        }));
        assert!(report.orphans.contains(&Orphan {
            kind: ResourceKind::Namespace,
            name: "ns-lost".to_string(),
            state: OrphanState::MissingLive,
        }));
    }

    #[test]
    fn unavailable_enumeration_is_skipped() {
        let mut report = VerifyReport::default();
        let expected: BTreeSet<String> = ["br-a".to_string()].into_iter().collect();
        classify(
            &mut report,
            ResourceKind::Bridge,
            None,
            &expected,
            &expected,
        );
        assert!(report.is_clean());
        assert!(report.accounted.is_empty());
    }
}
