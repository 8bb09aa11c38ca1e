//! Declarative ingress/egress policies and their compilation into
//! namespace-scoped filter rules.
//!
//! A policy targets the subnet whose CIDR matches its `subnet` field.
//! Ingress entries compile against the namespace INPUT chain, egress
//! entries against OUTPUT, in input order; first match wins. Application
//! is additive and idempotent: compiled rules go through the rule
//! manager's existence checks and prior rules are never flushed.

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::error::{Result, VpcError};
use crate::firewall::{Rule, Table, Verdict};
use crate::store::model::VpcDoc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Icmp => "icmp",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Allow,
    Deny,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub protocol: Protocol,
    pub action: Action,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyDoc {
    pub subnet: Ipv4Net,
    #[serde(default)]
    pub ingress: Vec<PolicyEntry>,
    #[serde(default)]
    pub egress: Vec<PolicyEntry>,
}

impl PolicyDoc {
    pub fn from_json(text: &str) -> Result<Self> {
        let doc: PolicyDoc = serde_json::from_str(text)
            .map_err(|e| VpcError::PolicyMalformed(e.to_string()))?;
        doc.validate()?;
        Ok(doc)
    }

    pub fn validate(&self) -> Result<()> {
        for entry in self.ingress.iter().chain(self.egress.iter()) {
            if entry.port.is_none() && entry.protocol != Protocol::Icmp {
                return Err(VpcError::PolicyMalformed(format!(
                    "{} entry requires a port",
                    entry.protocol.as_str()
                )));
            }
        }
        Ok(())
    }
}

/// The default policy every new subnet receives: web in, no ssh.
pub fn default_subnet_policy(subnet: Ipv4Net) -> PolicyDoc {
    let entry = |port, action| PolicyEntry {
        port: Some(port),
        protocol: Protocol::Tcp,
        action,
    };
    PolicyDoc {
        subnet,
        ingress: vec![
            entry(80, Action::Allow),
            entry(443, Action::Allow),
            entry(22, Action::Deny),
        ],
        egress: Vec::new(),
    }
}

/// Compile a policy against a VPC document. Returns the name of the matched
/// subnet and the planned rule sequence, in input order.
pub fn compile(vpc: &VpcDoc, doc: &PolicyDoc) -> Result<(String, Vec<Rule>)> {
    doc.validate()?;
    let subnet = vpc
        .subnets
        .iter()
        .find(|s| s.cidr == doc.subnet)
        .ok_or_else(|| VpcError::NoMatchingSubnet(doc.subnet.to_string()))?;

    let comment = format!("vpcctl:{}:policy:{}", vpc.name, subnet.name);
    let mut rules = Vec::with_capacity(doc.ingress.len() + doc.egress.len());
    for entry in &doc.ingress {
        rules.push(entry_rule(&subnet.ns, "INPUT", entry, &comment));
    }
    for entry in &doc.egress {
        rules.push(entry_rule(&subnet.ns, "OUTPUT", entry, &comment));
    }
    Ok((subnet.name.clone(), rules))
}

fn entry_rule(ns: &str, chain: &str, entry: &PolicyEntry, comment: &str) -> Rule {
    let verdict = match entry.action {
        Action::Allow => Verdict::Accept,
        Action::Deny => Verdict::Drop,
    };
    let mut rule = Rule::new(Table::Filter, chain, verdict, comment.to_string())
        .in_netns(ns)
        .protocol(entry.protocol.as_str());
    if entry.protocol != Protocol::Icmp {
        if let Some(port) = entry.port {
            rule = rule.dport(port);
        }
    }
    rule
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::model::{SubnetRecord, VethPair, VpcDoc};

    fn vpc_with_subnet() -> VpcDoc {
        let mut doc = VpcDoc::new(
            "myvpc",
            "10.10.0.0/16".parse().unwrap(),
            "br-myvpc".to_string(),
            "vpc-myvpc".to_string(),
        );
        doc.subnets.push(SubnetRecord {
            name: "public".to_string(),
            cidr: "10.10.1.0/24".parse().unwrap(),
            ns: "ns-myvpc-public".to_string(),
            gw: "10.10.1.1".parse().unwrap(),
            host_ip: "10.10.1.2".parse().unwrap(),
            veth: VethPair {
                bridge_side: "v-myvpc-publicb".to_string(),
                ns_side: "v-myvpc-publica".to_string(),
            },
        });
        doc
    }

    #[test]
    fn parses_the_documented_schema() {
        let doc = PolicyDoc::from_json(
            r#"{
                "subnet": "10.10.1.0/24",
                "ingress": [
                    {"port": 80, "protocol": "tcp", "action": "allow"},
                    {"port": 22, "protocol": "tcp", "action": "deny"}
                ],
                "egress": []
            }"#,
        )
        .unwrap();
        assert_eq!(doc.ingress.len(), 2);
        assert_eq!(doc.ingress[1].action, Action::Deny);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = PolicyDoc::from_json(r#"{"subnet": "10.10.1.0/24", "extra": true}"#).unwrap_err();
        assert!(matches!(err, VpcError::PolicyMalformed(_)));
    }

    #[test]
    fn tcp_without_port_is_rejected() {
        let err = PolicyDoc::from_json(
            r#"{"subnet": "10.10.1.0/24", "ingress": [{"protocol": "tcp", "action": "allow"}]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, VpcError::PolicyMalformed(_)));
    }

    #[test]
    fn icmp_ignores_port() {
        let doc = PolicyDoc::from_json(
            r#"{"subnet": "10.10.1.0/24", "ingress": [{"protocol": "icmp", "action": "deny", "port": 9}]}"#,
        )
        .unwrap();
        let (_, rules) = compile(&vpc_with_subnet(), &doc).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].dport, None);
        assert_eq!(rules[0].verdict, Verdict::Drop);
    }

    #[test]
    fn compiles_in_input_order_against_the_namespace() {
        let doc = PolicyDoc::from_json(
            r#"{
                "subnet": "10.10.1.0/24",
                "ingress": [
                    {"port": 80, "protocol": "tcp", "action": "allow"},
                    {"port": 22, "protocol": "tcp", "action": "deny"}
                ],
                "egress": [{"port": 53, "protocol": "udp", "action": "allow"}]
            }"#,
        )
        .unwrap();
        let (name, rules) = compile(&vpc_with_subnet(), &doc).unwrap();
        assert_eq!(name, "public");
        assert_eq!(rules.len(), 3);
        assert_eq!(rules[0].chain, "INPUT");
        assert_eq!(rules[0].dport, Some(80));
        assert_eq!(rules[0].verdict, Verdict::Accept);
        assert_eq!(rules[1].dport, Some(22));
        assert_eq!(rules[1].verdict, Verdict::Drop);
        assert_eq!(rules[2].chain, "OUTPUT");
        assert_eq!(rules[2].netns.as_deref(), Some("ns-myvpc-public"));
    }

    #[test]
    fn unmatched_subnet_is_an_error() {
        let doc = PolicyDoc::from_json(r#"{"subnet": "10.99.0.0/24"}"#).unwrap();
        let err = compile(&vpc_with_subnet(), &doc).unwrap_err();
        assert!(matches!(err, VpcError::NoMatchingSubnet(_)));
    }

    #[test]
    fn default_policy_allows_web_denies_ssh() {
        let doc = default_subnet_policy("10.10.1.0/24".parse().unwrap());
        assert_eq!(doc.ingress.len(), 3);
        assert_eq!(doc.ingress[0].port, Some(80));
        assert_eq!(doc.ingress[2].port, Some(22));
        assert_eq!(doc.ingress[2].action, Action::Deny);
        assert!(doc.egress.is_empty());
    }
}
