//! The durable VPC document. One document per VPC, serialized to pretty
//! JSON in the data directory; every kernel object the control plane
//! creates is represented by exactly one field here.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::policy::PolicyDoc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VethPair {
    /// End attached to the VPC bridge.
    pub bridge_side: String,
    /// End moved into the subnet namespace.
    pub ns_side: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubnetRecord {
    pub name: String,
    pub cidr: Ipv4Net,
    pub ns: String,
    /// Gateway address, carried by the bridge.
    pub gw: Ipv4Addr,
    /// Address assigned inside the namespace.
    pub host_ip: Ipv4Addr,
    pub veth: VethPair,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppRecord {
    pub ns: String,
    pub port: u16,
    /// Absent when the workload was launched in dry-run mode.
    pub pid: Option<i32>,
    pub cmd: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeeringRecord {
    pub peer_vpc: String,
    /// Veth end attached to this VPC's bridge.
    pub local_veth: String,
    /// Veth end attached to the peer's bridge.
    pub peer_veth: String,
    pub allow_cidrs: Vec<Ipv4Net>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NatRecord {
    pub interface: String,
    /// Names of the subnets NAT is active for.
    pub subnets: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedPolicy {
    /// Name of the subnet the policy resolved to.
    pub subnet: String,
    pub policy: PolicyDoc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VpcDoc {
    pub name: String,
    pub cidr: Ipv4Net,
    pub bridge: String,
    pub chain: String,
    #[serde(default)]
    pub subnets: Vec<SubnetRecord>,
    /// Replay log: the exact tokenized add-form of every host-level rule
    /// this VPC installed. Reversed on delete.
    #[serde(default)]
    pub host_iptables: Vec<Vec<String>>,
    #[serde(default)]
    pub apps: Vec<AppRecord>,
    #[serde(default)]
    pub peers: Vec<PeeringRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nat: Option<NatRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub policies: Vec<AppliedPolicy>,
}

impl VpcDoc {
    pub fn new(name: &str, cidr: Ipv4Net, bridge: String, chain: String) -> Self {
        Self {
            name: name.to_string(),
            cidr,
            bridge,
            chain,
            subnets: Vec::new(),
            host_iptables: Vec::new(),
            apps: Vec::new(),
            peers: Vec::new(),
            nat: None,
            policies: Vec::new(),
        }
    }

    pub fn subnet(&self, name: &str) -> Option<&SubnetRecord> {
        self.subnets.iter().find(|s| s.name == name)
    }

    pub fn peering(&self, peer_vpc: &str) -> Option<&PeeringRecord> {
        self.peers.iter().find(|p| p.peer_vpc == peer_vpc)
    }

    /// Append a recorded rule unless an identical form is already present,
    /// keeping re-runs from growing the replay log.
    pub fn record_rule(&mut self, recorded: Vec<String>) {
        if !self.host_iptables.contains(&recorded) {
            self.host_iptables.push(recorded);
        }
    }
}
