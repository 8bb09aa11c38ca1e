// VPC orchestration: the operation surface of the control plane.
//
// Every operation follows the same shape: validate, read the document,
// mutate the kernel step by step, then write the document exactly once —
// recording what was attempted even when a step failed, so `delete` can
// unwind partial progress. There is no rollback.

pub mod apps;
pub mod verify;

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

use crate::context::{Context, APP_STOP_GRACE};
use crate::error::{Result, VpcError};
use crate::exec::tokens;
use crate::firewall::{rule, Rule, RuleManager, Table, Verdict};
use crate::net::{self, bridge::BridgeOps, names, names::Role, netns, netns::NetnsOps, veth::VethOps};
use crate::policy::{self, PolicyDoc};
use crate::store::model::{
    AppRecord, AppliedPolicy, NatRecord, PeeringRecord, SubnetRecord, VethPair, VpcDoc,
};
use crate::store::MetadataStore;

pub use verify::{Orphan, OrphanState, ResourceKind, VerifyReport};

/// Which subnets an `enable-nat` call targets. The default heuristic only
/// matches subnets literally named `public`; anything else requires the
/// operator to say what they mean.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NatScope {
    Default,
    Subnet(String),
    AllSubnets,
}

pub struct VpcManager {
    ctx: Context,
    store: MetadataStore,
}

impl VpcManager {
    pub fn new(ctx: Context) -> Self {
        let store = MetadataStore::new(&ctx.data_dir);
        Self { ctx, store }
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn store(&self) -> &MetadataStore {
        &self.store
    }

    // ── create ────────────────────────────────────────────────────────

    pub fn create(&self, name: &str, cidr: &str) -> Result<VpcDoc> {
        validate_name(name)?;
        let vpc_net = net::parse_cidr(cidr)?;
        if net::usable_hosts(&vpc_net) < 2 {
            return Err(VpcError::CidrInvalid {
                cidr: cidr.to_string(),
                reason: "must admit at least two usable addresses".to_string(),
            });
        }

        let _lock = self.store.lock()?;
        if self.store.exists(name) {
            return Err(VpcError::Exists {
                kind: "VPC",
                name: name.to_string(),
            });
        }

        let bridge = names::encode(&[name], Role::Bridge);
        let chain = names::encode(&[name], Role::Chain);
        let mut doc = VpcDoc::new(name, vpc_net, bridge, chain);

        let result = self.create_steps(&mut doc);
        self.store.save(&doc)?;
        result?;
        tracing::info!(
            "created VPC '{}' (bridge {}, chain {}, {})",
            doc.name,
            doc.bridge,
            doc.chain,
            doc.cidr
        );
        Ok(doc)
    }

    fn create_steps(&self, doc: &mut VpcDoc) -> Result<()> {
        let exec = &self.ctx.exec;
        let bridge = BridgeOps::new(exec);
        bridge.create(&doc.bridge)?;

        let gw = net::nth_host(&doc.cidr, 1).ok_or_else(|| VpcError::CidrInvalid {
            cidr: doc.cidr.to_string(),
            reason: "no usable gateway address".to_string(),
        })?;
        bridge.assign_addr(&doc.bridge, &format!("{gw}/{}", doc.cidr.prefix_len()))?;
        bridge.set_up(&doc.bridge)?;
        net::enable_ip_forwarding(exec)?;

        let fw = RuleManager::new(exec);
        fw.create_chain(&doc.chain)?;

        let jump = Rule::new(
            Table::Filter,
            "FORWARD",
            Verdict::Chain(doc.chain.clone()),
            format!("vpcctl:{}:jump", doc.name),
        )
        .insert_first()
        .in_iface(&doc.bridge);
        let recorded = fw.ensure(&jump)?;
        doc.record_rule(recorded);

        // Inter-subnet traffic stays within the bridge but still traverses
        // FORWARD; accept it wholesale inside the VPC's own chain.
        let cidr_str = doc.cidr.to_string();
        let intra = Rule::new(
            Table::Filter,
            &doc.chain,
            Verdict::Accept,
            format!("vpcctl:{}:intra", doc.name),
        )
        .source(&cidr_str)
        .dest(&cidr_str);
        let recorded = fw.ensure(&intra)?;
        doc.record_rule(recorded);
        Ok(())
    }

    // ── add-subnet ────────────────────────────────────────────────────

    pub fn add_subnet(
        &self,
        vpc: &str,
        sub_name: &str,
        cidr: &str,
        gw: Option<Ipv4Addr>,
    ) -> Result<SubnetRecord> {
        validate_name(sub_name)?;
        let sub_net = net::parse_cidr(cidr)?;

        let _lock = self.store.lock()?;
        let mut doc = self.store.require(vpc)?;

        if doc.subnet(sub_name).is_some() {
            return Err(VpcError::Exists {
                kind: "subnet",
                name: sub_name.to_string(),
            });
        }
        if !doc.cidr.contains(&sub_net) {
            return Err(VpcError::CidrOutOfRange {
                cidr: cidr.to_string(),
                vpc_cidr: doc.cidr.to_string(),
            });
        }
        for existing in &doc.subnets {
            if net::overlaps(&existing.cidr, &sub_net) {
                return Err(VpcError::CidrOverlap {
                    cidr: cidr.to_string(),
                    other: existing.cidr.to_string(),
                });
            }
        }
        if net::usable_hosts(&sub_net) < 2 {
            return Err(VpcError::CidrInvalid {
                cidr: cidr.to_string(),
                reason: "must admit at least two usable addresses (gateway and host)".to_string(),
            });
        }

        let gw_addr = match gw {
            Some(addr) => {
                if !sub_net.contains(&addr) {
                    return Err(VpcError::CidrInvalid {
                        cidr: cidr.to_string(),
                        reason: format!("gateway {addr} is outside the subnet"),
                    });
                }
                addr
            }
            None => net::nth_host(&sub_net, 1).ok_or_else(|| VpcError::CidrInvalid {
                cidr: cidr.to_string(),
                reason: "no usable gateway address".to_string(),
            })?,
        };
        let host_ip = (1..=net::usable_hosts(&sub_net))
            .filter_map(|n| net::nth_host(&sub_net, n))
            .find(|addr| *addr != gw_addr)
            .ok_or_else(|| VpcError::CidrInvalid {
                cidr: cidr.to_string(),
                reason: format!("no host address available besides gateway {gw_addr}"),
            })?;

        let record = SubnetRecord {
            name: sub_name.to_string(),
            cidr: sub_net,
            ns: names::encode(&[vpc, sub_name], Role::Namespace),
            gw: gw_addr,
            host_ip,
            veth: VethPair {
                bridge_side: names::encode_with_suffix(&[vpc, sub_name], Role::Veth, "b"),
                ns_side: names::encode_with_suffix(&[vpc, sub_name], Role::Veth, "a"),
            },
        };

        let mut result = self.add_subnet_steps(&doc, &record);
        doc.subnets.push(record.clone());

        if result.is_ok() {
            let default = policy::default_subnet_policy(sub_net);
            result = self.apply_policy_to_doc(&mut doc, &default).map(|_| ());
        }

        self.store.save(&doc)?;
        result?;
        tracing::info!(
            "created subnet '{}' ({}) in VPC '{}' with namespace {}",
            record.name,
            record.cidr,
            vpc,
            record.ns
        );
        Ok(record)
    }

    fn add_subnet_steps(&self, doc: &VpcDoc, sub: &SubnetRecord) -> Result<()> {
        let exec = &self.ctx.exec;
        let ns_ops = NetnsOps::new(exec);
        let veth = VethOps::new(exec);

        ns_ops.create(&sub.ns)?;
        ns_ops.loopback_up(&sub.ns)?;

        veth.create_pair(&sub.veth.ns_side, &sub.veth.bridge_side)?;
        veth.attach_to_bridge(&sub.veth.bridge_side, &doc.bridge)?;
        veth.set_up(&sub.veth.bridge_side)?;
        veth.move_to_netns(&sub.veth.ns_side, &sub.ns)?;

        // The bridge carries every subnet's gateway address.
        let prefix = sub.cidr.prefix_len();
        BridgeOps::new(exec).assign_addr(&doc.bridge, &format!("{}/{prefix}", sub.gw))?;

        veth.assign_addr_in_ns(&sub.ns, &sub.veth.ns_side, &format!("{}/{prefix}", sub.host_ip))?;
        veth.set_up_in_ns(&sub.ns, &sub.veth.ns_side)?;
        veth.default_route_in_ns(&sub.ns, sub.gw)?;

        // Baseline namespace rules, installed once before any policy:
        // loopback and return traffic stay open under later deny rules.
        let fw = RuleManager::new(exec);
        let base = format!("vpcctl:{}:base:{}", doc.name, sub.name);
        fw.ensure(
            &Rule::new(Table::Filter, "INPUT", Verdict::Accept, base.clone())
                .in_netns(&sub.ns)
                .in_iface("lo"),
        )?;
        fw.ensure(
            &Rule::new(Table::Filter, "INPUT", Verdict::Accept, base)
                .in_netns(&sub.ns)
                .ct_state("ESTABLISHED,RELATED"),
        )?;
        Ok(())
    }

    // ── enable-nat ────────────────────────────────────────────────────

    /// Returns the names of the subnets NAT was enabled for.
    pub fn enable_nat(&self, vpc: &str, interface: &str, scope: NatScope) -> Result<Vec<String>> {
        let _lock = self.store.lock()?;
        let mut doc = self.store.require(vpc)?;

        let targets: Vec<SubnetRecord> = match &scope {
            NatScope::Subnet(name) => vec![doc
                .subnet(name)
                .cloned()
                .ok_or_else(|| VpcError::NotFound {
                    kind: "subnet",
                    name: name.clone(),
                })?],
            NatScope::AllSubnets => doc.subnets.clone(),
            NatScope::Default => doc
                .subnets
                .iter()
                .filter(|s| s.name == "public")
                .cloned()
                .collect(),
        };
        if targets.is_empty() {
            tracing::warn!(
                "enable-nat on '{}': no subnet in scope, nothing to do",
                vpc
            );
            return Ok(Vec::new());
        }

        let result = self.enable_nat_steps(&mut doc, interface, &targets);

        let names: Vec<String> = targets.iter().map(|s| s.name.clone()).collect();
        match &mut doc.nat {
            Some(nat) => {
                nat.interface = interface.to_string();
                for name in &names {
                    if !nat.subnets.contains(name) {
                        nat.subnets.push(name.clone());
                    }
                }
                nat.subnets.sort();
            }
            None => {
                let mut subnets = names.clone();
                subnets.sort();
                doc.nat = Some(NatRecord {
                    interface: interface.to_string(),
                    subnets,
                });
            }
        }

        self.store.save(&doc)?;
        result?;
        tracing::info!(
            "enabled NAT for VPC '{}' via {} (subnets: {})",
            vpc,
            interface,
            names.join(", ")
        );
        Ok(names)
    }

    fn enable_nat_steps(
        &self,
        doc: &mut VpcDoc,
        interface: &str,
        targets: &[SubnetRecord],
    ) -> Result<()> {
        let exec = &self.ctx.exec;
        net::enable_ip_forwarding(exec)?;
        let fw = RuleManager::new(exec);

        for sub in targets {
            let masq = Rule::new(
                Table::Nat,
                "POSTROUTING",
                Verdict::Masquerade,
                format!("vpcctl:{}:nat:{}", doc.name, sub.name),
            )
            .source(&sub.cidr.to_string())
            .out_iface(interface);
            let recorded = fw.ensure(&masq)?;
            doc.record_rule(recorded);
        }

        let fwd_out = Rule::new(
            Table::Filter,
            "FORWARD",
            Verdict::Accept,
            format!("vpcctl:{}:nat-fwd-out", doc.name),
        )
        .in_iface(&doc.bridge)
        .out_iface(interface);
        let recorded = fw.ensure(&fwd_out)?;
        doc.record_rule(recorded);

        let fwd_in = Rule::new(
            Table::Filter,
            "FORWARD",
            Verdict::Accept,
            format!("vpcctl:{}:nat-fwd-in", doc.name),
        )
        .in_iface(interface)
        .out_iface(&doc.bridge)
        .ct_state("ESTABLISHED,RELATED");
        let recorded = fw.ensure(&fwd_in)?;
        doc.record_rule(recorded);
        Ok(())
    }

    // ── peer ──────────────────────────────────────────────────────────

    pub fn peer(
        &self,
        vpc_a: &str,
        vpc_b: &str,
        allow_cidrs: Option<Vec<Ipv4Net>>,
    ) -> Result<()> {
        if vpc_a == vpc_b {
            return Err(VpcError::SelfPeer(vpc_a.to_string()));
        }
        let _lock = self.store.lock()?;
        let mut doc_a = self.store.require(vpc_a)?;
        let mut doc_b = self.store.require(vpc_b)?;
        if doc_a.peering(vpc_b).is_some() || doc_b.peering(vpc_a).is_some() {
            return Err(VpcError::AlreadyPeered {
                a: vpc_a.to_string(),
                b: vpc_b.to_string(),
            });
        }

        let veth_a = names::encode_with_suffix(&[vpc_a, vpc_b], Role::Peering, "a");
        let veth_b = names::encode_with_suffix(&[vpc_a, vpc_b], Role::Peering, "b");
        let allow = allow_cidrs.unwrap_or_else(|| vec![doc_a.cidr, doc_b.cidr]);

        let result = self.peer_steps(&mut doc_a, &mut doc_b, &veth_a, &veth_b, &allow);

        doc_a.peers.push(PeeringRecord {
            peer_vpc: vpc_b.to_string(),
            local_veth: veth_a.clone(),
            peer_veth: veth_b.clone(),
            allow_cidrs: allow.clone(),
        });
        doc_b.peers.push(PeeringRecord {
            peer_vpc: vpc_a.to_string(),
            local_veth: veth_b,
            peer_veth: veth_a,
            allow_cidrs: allow,
        });

        self.store.save(&doc_a)?;
        self.store.save(&doc_b)?;
        result?;
        tracing::info!("peered VPC '{}' <-> '{}'", vpc_a, vpc_b);
        Ok(())
    }

    fn peer_steps(
        &self,
        doc_a: &mut VpcDoc,
        doc_b: &mut VpcDoc,
        veth_a: &str,
        veth_b: &str,
        allow: &[Ipv4Net],
    ) -> Result<()> {
        let exec = &self.ctx.exec;
        let veth = VethOps::new(exec);
        veth.create_pair(veth_a, veth_b)?;
        veth.attach_to_bridge(veth_a, &doc_a.bridge)?;
        veth.attach_to_bridge(veth_b, &doc_b.bridge)?;
        veth.set_up(veth_a)?;
        veth.set_up(veth_b)?;

        let fw = RuleManager::new(exec);
        let tag = format!("vpcctl:peer:{}:{}", doc_a.name, doc_b.name);
        for src in allow {
            for dst in allow {
                if src == dst {
                    continue;
                }
                let src_str = src.to_string();
                let dst_str = dst.to_string();
                let accept_a = Rule::new(Table::Filter, &doc_a.chain, Verdict::Accept, tag.clone())
                    .out_iface(&doc_b.bridge)
                    .source(&src_str)
                    .dest(&dst_str);
                let recorded = fw.ensure(&accept_a)?;
                doc_a.record_rule(recorded);

                let accept_b = Rule::new(Table::Filter, &doc_b.chain, Verdict::Accept, tag.clone())
                    .out_iface(&doc_a.bridge)
                    .source(&src_str)
                    .dest(&dst_str);
                let recorded = fw.ensure(&accept_b)?;
                doc_b.record_rule(recorded);
            }
        }

        // Everything not explicitly allowed across the peering is dropped.
        let drop_tag = format!("vpcctl:peer-drop:{}:{}", doc_a.name, doc_b.name);
        let drop_a = Rule::new(Table::Filter, &doc_a.chain, Verdict::Drop, drop_tag.clone())
            .out_iface(&doc_b.bridge);
        let recorded = fw.ensure(&drop_a)?;
        doc_a.record_rule(recorded);
        let drop_b =
            Rule::new(Table::Filter, &doc_b.chain, Verdict::Drop, drop_tag).out_iface(&doc_a.bridge);
        let recorded = fw.ensure(&drop_b)?;
        doc_b.record_rule(recorded);
        Ok(())
    }

    // ── apply-policy ──────────────────────────────────────────────────

    /// Returns the name of the subnet the policy resolved to.
    pub fn apply_policy(&self, vpc: &str, policy: &PolicyDoc) -> Result<String> {
        policy.validate()?;
        let _lock = self.store.lock()?;
        let mut doc = self.store.require(vpc)?;
        let result = self.apply_policy_to_doc(&mut doc, policy);
        self.store.save(&doc)?;
        result
    }

    pub fn apply_policy_json(&self, vpc: &str, policy_json: &str) -> Result<String> {
        let policy = PolicyDoc::from_json(policy_json)?;
        self.apply_policy(vpc, &policy)
    }

    fn apply_policy_to_doc(&self, doc: &mut VpcDoc, policy: &PolicyDoc) -> Result<String> {
        let (subnet_name, rules) = policy::compile(doc, policy)?;
        let fw = RuleManager::new(&self.ctx.exec);
        // Namespace-scoped rules are not recorded in the host replay log;
        // they disappear with the namespace.
        for rule in &rules {
            fw.ensure(rule)?;
        }
        let applied = AppliedPolicy {
            subnet: subnet_name.clone(),
            policy: policy.clone(),
        };
        if !doc.policies.contains(&applied) {
            doc.policies.push(applied);
        }
        if let Err(e) = self.store.save_policy_file(&doc.name, &subnet_name, policy) {
            tracing::warn!("could not write policy file: {}", e);
        }
        tracing::info!(
            "applied policy to subnet '{}' of VPC '{}'",
            subnet_name,
            doc.name
        );
        Ok(subnet_name)
    }

    // ── workloads ─────────────────────────────────────────────────────

    pub fn deploy_app(&self, vpc: &str, subnet: &str, port: u16) -> Result<AppRecord> {
        let _lock = self.store.lock()?;
        let mut doc = self.store.require(vpc)?;
        let sub = doc.subnet(subnet).cloned().ok_or_else(|| VpcError::NotFound {
            kind: "subnet",
            name: subnet.to_string(),
        })?;
        let record = apps::launch(&self.ctx.exec, &sub.ns, port)?;
        doc.apps.push(record.clone());
        self.store.save(&doc)?;
        Ok(record)
    }

    /// Stop workloads selected by namespace and/or pid; both absent stops
    /// every app in the VPC. Returns the records removed.
    pub fn stop_app(
        &self,
        vpc: &str,
        ns: Option<&str>,
        pid: Option<i32>,
    ) -> Result<Vec<AppRecord>> {
        let _lock = self.store.lock()?;
        let mut doc = self.store.require(vpc)?;
        let (matched, kept): (Vec<AppRecord>, Vec<AppRecord>) =
            doc.apps.drain(..).partition(|app| {
                ns.map_or(true, |n| app.ns == n) && pid.map_or(true, |p| app.pid == Some(p))
            });
        for app in &matched {
            if !apps::stop(&self.ctx.exec, app, APP_STOP_GRACE) {
                tracing::warn!("app pid {:?} in {} refused to die", app.pid, app.ns);
            }
        }
        doc.apps = kept;
        self.store.save(&doc)?;
        Ok(matched)
    }

    // ── delete / cleanup ──────────────────────────────────────────────

    /// Tear down everything the VPC document accounts for, in reverse
    /// dependency order. Per-step failures are downgraded to warnings; the
    /// only hard error is failing to persist the final state.
    pub fn delete(&self, name: &str) -> Result<()> {
        let _lock = self.store.lock()?;
        let mut doc = self.store.require(name)?;
        let exec = &self.ctx.exec;

        for app in &doc.apps {
            if !apps::stop(exec, app, APP_STOP_GRACE) {
                tracing::warn!("app pid {:?} in {} refused to die", app.pid, app.ns);
            }
        }
        doc.apps.clear();

        // Replay the host rule log backwards.
        let fw = RuleManager::new(exec);
        for recorded in doc.host_iptables.iter().rev() {
            fw.remove_recorded(recorded);
        }
        doc.host_iptables.clear();

        // Unlink peerings from both sides.
        let veth = VethOps::new(exec);
        let peers = std::mem::take(&mut doc.peers);
        for peering in &peers {
            veth.delete(&peering.local_veth);
            match self.store.load(&peering.peer_vpc) {
                Ok(Some(mut peer_doc)) => {
                    let (mine, kept): (Vec<Vec<String>>, Vec<Vec<String>>) = peer_doc
                        .host_iptables
                        .drain(..)
                        .partition(|recorded| {
                            rule::comment_of(recorded)
                                .is_some_and(|c| is_peering_tag(c, name, &peering.peer_vpc))
                        });
                    for recorded in &mine {
                        fw.remove_recorded(recorded);
                    }
                    peer_doc.host_iptables = kept;
                    peer_doc.peers.retain(|p| p.peer_vpc != name);
                    if let Err(e) = self.store.save(&peer_doc) {
                        tracing::warn!(
                            "could not update peer document '{}': {}",
                            peering.peer_vpc,
                            e
                        );
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("could not load peer document '{}': {}", peering.peer_vpc, e)
                }
            }
        }

        // Deleting the namespace also removes the veth end inside it,
        // which destroys the pair.
        let ns_ops = NetnsOps::new(exec);
        for sub in &doc.subnets {
            ns_ops.flush_iptables(&sub.ns);
            ns_ops.delete(&sub.ns);
        }
        doc.subnets.clear();

        BridgeOps::new(exec).delete(&doc.bridge);
        fw.delete_chain(&doc.chain, &doc.bridge);

        self.store.remove_policy_files(name);
        self.store.remove(name)?;
        tracing::info!("deleted VPC '{}'", name);
        Ok(())
    }

    /// Delete every stored VPC, in name order. Individual failures are
    /// reported after the sweep finishes.
    pub fn cleanup_all(&self) -> Result<Vec<String>> {
        let names = self.store.list()?;
        let mut deleted = Vec::new();
        let mut first_err = None;
        for name in names {
            match self.delete(&name) {
                Ok(()) => deleted.push(name),
                Err(e) => {
                    tracing::warn!("cleanup of '{}' failed: {}", name, e);
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(deleted),
        }
    }

    // ── read-only surface ─────────────────────────────────────────────

    pub fn list(&self) -> Result<Vec<String>> {
        self.store.list()
    }

    pub fn inspect(&self, name: &str) -> Result<VpcDoc> {
        self.store.require(name)
    }

    pub fn verify(&self) -> Result<VerifyReport> {
        verify::verify(&self.ctx.exec, &self.store)
    }

    /// Reachability probe: HTTP GET against `target:port`, optionally from
    /// inside a namespace. Returns the response body.
    pub fn test_connectivity(
        &self,
        target: Ipv4Addr,
        port: u16,
        from_ns: Option<&str>,
    ) -> Result<String> {
        let url = format!("http://{target}:{port}");
        let argv = match from_ns {
            Some(ns) => netns::wrap(ns, &["curl", "-sS", "--max-time", "5", &url]),
            None => tokens(&["curl", "-sS", "--max-time", "5", &url]),
        };
        let out = self.ctx.exec.run(&argv)?;
        Ok(out.stdout)
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(VpcError::InvalidName {
            name: name.to_string(),
            reason: "must not be empty".to_string(),
        });
    }
    if !name.bytes().all(|b| (0x20..=0x7e).contains(&b)) {
        return Err(VpcError::InvalidName {
            name: name.to_string(),
            reason: "must be printable ASCII".to_string(),
        });
    }
    Ok(())
}

fn is_peering_tag(comment: &str, x: &str, y: &str) -> bool {
    comment == format!("vpcctl:peer:{x}:{y}")
        || comment == format!("vpcctl:peer:{y}:{x}")
        || comment == format!("vpcctl:peer-drop:{x}:{y}")
        || comment == format!("vpcctl:peer-drop:{y}:{x}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager() -> (TempDir, VpcManager) {
        let dir = TempDir::new().unwrap();
        let ctx = Context::new(dir.path(), true);
        (dir, VpcManager::new(ctx))
    }

    #[test]
    fn create_then_inspect_round_trips() {
        let (_dir, mgr) = manager();
        mgr.create("myvpc", "10.10.0.0/16").unwrap();
        let doc = mgr.inspect("myvpc").unwrap();
        assert_eq!(doc.name, "myvpc");
        assert_eq!(doc.cidr.to_string(), "10.10.0.0/16");
        assert_eq!(doc.bridge, "br-myvpc");
        assert_eq!(doc.chain, "vpc-myvpc");
        assert!(doc.subnets.is_empty());
        assert!(doc.apps.is_empty());
        assert!(doc.peers.is_empty());
        assert!(doc.nat.is_none());
        // Jump and intra-VPC accept are recorded for teardown.
        assert_eq!(doc.host_iptables.len(), 2);
    }

    #[test]
    fn create_traces_the_bridge_sequence() {
        let (_dir, mgr) = manager();
        mgr.create("myvpc", "10.10.0.0/16").unwrap();
        let trace = mgr.context().exec.trace();
        assert_eq!(
            trace[0],
            tokens(&["ip", "link", "add", "name", "br-myvpc", "type", "bridge"])
        );
        assert!(trace.contains(&tokens(&["sysctl", "-w", "net.ipv4.ip_forward=1"])));
        assert!(trace.contains(&tokens(&["iptables", "-N", "vpc-myvpc"])));
    }

    #[test]
    fn create_twice_is_an_error_and_leaves_state_alone() {
        let (_dir, mgr) = manager();
        mgr.create("myvpc", "10.10.0.0/16").unwrap();
        let before = mgr.inspect("myvpc").unwrap();
        assert!(matches!(
            mgr.create("myvpc", "10.99.0.0/16"),
            Err(VpcError::Exists { .. })
        ));
        assert_eq!(mgr.inspect("myvpc").unwrap(), before);
    }

    #[test]
    fn create_rejects_tiny_and_unaligned_cidrs() {
        let (_dir, mgr) = manager();
        assert!(matches!(
            mgr.create("a", "10.0.0.0/31"),
            Err(VpcError::CidrInvalid { .. })
        ));
        assert!(matches!(
            mgr.create("a", "10.0.0.5/16"),
            Err(VpcError::CidrInvalid { .. })
        ));
        assert!(mgr.list().unwrap().is_empty());
    }

    #[test]
    fn add_subnet_defaults_gateway_and_host_addresses() {
        let (_dir, mgr) = manager();
        mgr.create("myvpc", "10.10.0.0/16").unwrap();
        let sub = mgr
            .add_subnet("myvpc", "public", "10.10.1.0/24", None)
            .unwrap();
        assert_eq!(sub.ns, "ns-myvpc-public");
        assert_eq!(sub.gw.to_string(), "10.10.1.1");
        assert_eq!(sub.host_ip.to_string(), "10.10.1.2");

        let doc = mgr.inspect("myvpc").unwrap();
        assert_eq!(doc.subnets.len(), 1);
        // The default policy is applied and recorded.
        assert_eq!(doc.policies.len(), 1);
        assert_eq!(doc.policies[0].subnet, "public");
        assert_eq!(doc.policies[0].policy.ingress.len(), 3);
    }

    #[test]
    fn add_subnet_honors_an_explicit_gateway() {
        let (_dir, mgr) = manager();
        mgr.create("myvpc", "10.10.0.0/16").unwrap();
        let sub = mgr
            .add_subnet(
                "myvpc",
                "db",
                "10.10.5.0/24",
                Some("10.10.5.10".parse().unwrap()),
            )
            .unwrap();
        assert_eq!(sub.gw.to_string(), "10.10.5.10");
        assert_eq!(sub.host_ip.to_string(), "10.10.5.1");
    }

    #[test]
    fn add_subnet_validation_matrix() {
        let (_dir, mgr) = manager();
        mgr.create("myvpc", "10.10.0.0/16").unwrap();
        mgr.add_subnet("myvpc", "public", "10.10.1.0/24", None)
            .unwrap();

        assert!(matches!(
            mgr.add_subnet("ghost", "x", "10.10.2.0/24", None),
            Err(VpcError::NotFound { .. })
        ));
        assert!(matches!(
            mgr.add_subnet("myvpc", "public", "10.10.2.0/24", None),
            Err(VpcError::Exists { .. })
        ));
        assert!(matches!(
            mgr.add_subnet("myvpc", "clash", "10.10.1.128/25", None),
            Err(VpcError::CidrOverlap { .. })
        ));
        assert!(matches!(
            mgr.add_subnet("myvpc", "away", "10.20.1.0/24", None),
            Err(VpcError::CidrOutOfRange { .. })
        ));
        assert!(matches!(
            mgr.add_subnet("myvpc", "tiny", "10.10.3.0/31", None),
            Err(VpcError::CidrInvalid { .. })
        ));
        // /30 still admits gateway + host.
        assert!(mgr.add_subnet("myvpc", "p2p", "10.10.3.0/30", None).is_ok());
    }

    #[test]
    fn peer_writes_mirror_records_and_rules() {
        let (_dir, mgr) = manager();
        mgr.create("alpha", "10.10.0.0/16").unwrap();
        mgr.create("beta", "10.20.0.0/16").unwrap();
        let allow: Vec<Ipv4Net> = vec![
            "10.10.1.0/24".parse().unwrap(),
            "10.20.1.0/24".parse().unwrap(),
        ];
        mgr.peer("alpha", "beta", Some(allow.clone())).unwrap();

        let a = mgr.inspect("alpha").unwrap();
        let b = mgr.inspect("beta").unwrap();
        assert_eq!(a.peers.len(), 1);
        assert_eq!(b.peers.len(), 1);
        assert_eq!(a.peers[0].peer_vpc, "beta");
        assert_eq!(b.peers[0].peer_vpc, "alpha");
        assert_eq!(a.peers[0].local_veth, b.peers[0].peer_veth);
        assert_eq!(a.peers[0].allow_cidrs, allow);
        assert_eq!(b.peers[0].allow_cidrs, allow);

        // Two ordered allow pairs plus the final drop, per side.
        let peer_rules = |doc: &VpcDoc, tag_part: &str| {
            doc.host_iptables
                .iter()
                .filter(|r| {
                    rule::comment_of(r).is_some_and(|c| c.contains(tag_part))
                })
                .count()
        };
        assert_eq!(peer_rules(&a, ":peer:"), 2);
        assert_eq!(peer_rules(&a, ":peer-drop:"), 1);
        assert_eq!(peer_rules(&b, ":peer:"), 2);
        assert_eq!(peer_rules(&b, ":peer-drop:"), 1);
    }

    #[test]
    fn peer_defaults_to_both_vpc_cidrs() {
        let (_dir, mgr) = manager();
        mgr.create("alpha", "10.10.0.0/16").unwrap();
        mgr.create("beta", "10.20.0.0/16").unwrap();
        mgr.peer("alpha", "beta", None).unwrap();
        let a = mgr.inspect("alpha").unwrap();
        assert_eq!(
            a.peers[0].allow_cidrs,
            vec![
                "10.10.0.0/16".parse::<Ipv4Net>().unwrap(),
                "10.20.0.0/16".parse::<Ipv4Net>().unwrap()
            ]
        );
    }

    #[test]
    fn peer_rejects_self_and_duplicates() {
        let (_dir, mgr) = manager();
        mgr.create("alpha", "10.10.0.0/16").unwrap();
        mgr.create("beta", "10.20.0.0/16").unwrap();
        assert!(matches!(
            mgr.peer("alpha", "alpha", None),
            Err(VpcError::SelfPeer(_))
        ));
        mgr.peer("alpha", "beta", None).unwrap();
        assert!(matches!(
            mgr.peer("alpha", "beta", None),
            Err(VpcError::AlreadyPeered { .. })
        ));
        assert!(matches!(
            mgr.peer("beta", "alpha", None),
            Err(VpcError::AlreadyPeered { .. })
        ));
    }

    #[test]
    fn enable_nat_default_scope_needs_a_public_subnet() {
        let (_dir, mgr) = manager();
        mgr.create("myvpc", "10.10.0.0/16").unwrap();
        mgr.add_subnet("myvpc", "private", "10.10.2.0/24", None)
            .unwrap();
        let enabled = mgr.enable_nat("myvpc", "eth0", NatScope::Default).unwrap();
        assert!(enabled.is_empty());
        assert!(mgr.inspect("myvpc").unwrap().nat.is_none());
    }

    #[test]
    fn enable_nat_records_rules_and_the_nat_field() {
        let (_dir, mgr) = manager();
        mgr.create("myvpc", "10.10.0.0/16").unwrap();
        mgr.add_subnet("myvpc", "public", "10.10.1.0/24", None)
            .unwrap();
        let enabled = mgr.enable_nat("myvpc", "eth0", NatScope::Default).unwrap();
        assert_eq!(enabled, vec!["public"]);

        let doc = mgr.inspect("myvpc").unwrap();
        let nat = doc.nat.as_ref().unwrap();
        assert_eq!(nat.interface, "eth0");
        assert_eq!(nat.subnets, vec!["public"]);
        let masq = doc
            .host_iptables
            .iter()
            .find(|r| r.contains(&"MASQUERADE".to_string()))
            .unwrap();
        assert!(masq.contains(&"10.10.1.0/24".to_string()));
        assert!(masq.contains(&"nat".to_string()));
    }

    #[test]
    fn enable_nat_by_name_requires_the_subnet() {
        let (_dir, mgr) = manager();
        mgr.create("myvpc", "10.10.0.0/16").unwrap();
        assert!(matches!(
            mgr.enable_nat("myvpc", "eth0", NatScope::Subnet("ghost".to_string())),
            Err(VpcError::NotFound { .. })
        ));
    }

    #[test]
    fn apply_policy_requires_a_matching_subnet() {
        let (_dir, mgr) = manager();
        mgr.create("myvpc", "10.10.0.0/16").unwrap();
        let err = mgr
            .apply_policy_json(
                "myvpc",
                r#"{"subnet": "10.10.9.0/24", "ingress": [], "egress": []}"#,
            )
            .unwrap_err();
        assert!(matches!(err, VpcError::NoMatchingSubnet(_)));
    }

    #[test]
    fn reapplying_a_policy_records_it_once() {
        let (_dir, mgr) = manager();
        mgr.create("myvpc", "10.10.0.0/16").unwrap();
        mgr.add_subnet("myvpc", "public", "10.10.1.0/24", None)
            .unwrap();
        let policy = r#"{
            "subnet": "10.10.1.0/24",
            "ingress": [{"port": 8080, "protocol": "tcp", "action": "allow"}],
            "egress": []
        }"#;
        mgr.apply_policy_json("myvpc", policy).unwrap();
        mgr.apply_policy_json("myvpc", policy).unwrap();
        let doc = mgr.inspect("myvpc").unwrap();
        // Default subnet policy plus this one, recorded once each.
        assert_eq!(doc.policies.len(), 2);
    }

    #[test]
    fn deploy_and_stop_app_maintain_records() {
        let (_dir, mgr) = manager();
        mgr.create("myvpc", "10.10.0.0/16").unwrap();
        mgr.add_subnet("myvpc", "public", "10.10.1.0/24", None)
            .unwrap();
        let rec = mgr.deploy_app("myvpc", "public", 8080).unwrap();
        assert_eq!(rec.ns, "ns-myvpc-public");
        assert_eq!(rec.pid, None); // dry-run launch

        assert_eq!(mgr.inspect("myvpc").unwrap().apps.len(), 1);
        let stopped = mgr.stop_app("myvpc", None, None).unwrap();
        assert_eq!(stopped.len(), 1);
        assert!(mgr.inspect("myvpc").unwrap().apps.is_empty());
    }

    #[test]
    fn stop_app_filters_by_namespace() {
        let (_dir, mgr) = manager();
        mgr.create("myvpc", "10.10.0.0/16").unwrap();
        mgr.add_subnet("myvpc", "public", "10.10.1.0/24", None)
            .unwrap();
        mgr.add_subnet("myvpc", "private", "10.10.2.0/24", None)
            .unwrap();
        mgr.deploy_app("myvpc", "public", 8080).unwrap();
        mgr.deploy_app("myvpc", "private", 8080).unwrap();
        let stopped = mgr
            .stop_app("myvpc", Some("ns-myvpc-public"), None)
            .unwrap();
        assert_eq!(stopped.len(), 1);
        assert_eq!(mgr.inspect("myvpc").unwrap().apps.len(), 1);
    }

    #[test]
    fn delete_removes_the_document_and_peer_mirror() {
        let (_dir, mgr) = manager();
        mgr.create("alpha", "10.10.0.0/16").unwrap();
        mgr.create("beta", "10.20.0.0/16").unwrap();
        mgr.add_subnet("alpha", "public", "10.10.1.0/24", None)
            .unwrap();
        mgr.peer("alpha", "beta", None).unwrap();

        mgr.delete("alpha").unwrap();
        assert!(matches!(
            mgr.inspect("alpha"),
            Err(VpcError::NotFound { .. })
        ));
        let beta = mgr.inspect("beta").unwrap();
        assert!(beta.peers.is_empty());
        // Beta's peering rules are gone; its own jump/intra rules remain.
        assert!(beta
            .host_iptables
            .iter()
            .all(|r| rule::comment_of(r).is_some_and(|c| !c.contains(":peer"))));
        assert_eq!(beta.host_iptables.len(), 2);
    }

    #[test]
    fn delete_requires_the_vpc_to_exist() {
        let (_dir, mgr) = manager();
        assert!(matches!(
            mgr.delete("ghost"),
            Err(VpcError::NotFound { .. })
        ));
    }

    #[test]
    fn cleanup_all_empties_the_store() {
        let (_dir, mgr) = manager();
        mgr.create("alpha", "10.10.0.0/16").unwrap();
        mgr.create("beta", "10.20.0.0/16").unwrap();
        mgr.add_subnet("alpha", "public", "10.10.1.0/24", None)
            .unwrap();
        mgr.peer("alpha", "beta", None).unwrap();

        let deleted = mgr.cleanup_all().unwrap();
        assert_eq!(deleted, vec!["alpha", "beta"]);
        assert!(mgr.list().unwrap().is_empty());
    }

    #[test]
    fn names_are_validated() {
        let (_dir, mgr) = manager();
        assert!(matches!(
            mgr.create("", "10.0.0.0/16"),
            Err(VpcError::InvalidName { .. })
        ));
        assert!(matches!(
            mgr.create("caf\u{e9}", "10.0.0.0/16"),
            Err(VpcError::InvalidName { .. })
        ));
        // Printable ASCII, spaces included, is fair game; the name
        // encoder sanitizes what reaches the kernel.
        assert!(mgr.create("my vpc", "10.0.0.0/16").is_ok());
    }
}
