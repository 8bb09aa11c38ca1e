// Network primitives and address math. Every primitive is idempotent: it
// probes for the target condition and skips the mutation when already met.

pub mod bridge;
pub mod names;
pub mod netns;
pub mod veth;

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

use crate::error::{Result, VpcError};
use crate::exec::{tokens, Executor};

/// Parse a CIDR, requiring the address to be the network base
/// (e.g. `10.42.7.0/24`, not `10.42.7.5/24`).
pub fn parse_cidr(s: &str) -> Result<Ipv4Net> {
    let net: Ipv4Net = s.trim().parse().map_err(|e| VpcError::CidrInvalid {
        cidr: s.to_string(),
        reason: format!("{e}"),
    })?;
    if net.network() != net.addr() {
        return Err(VpcError::CidrInvalid {
            cidr: s.to_string(),
            reason: "must be a network base address".to_string(),
        });
    }
    Ok(net)
}

/// Usable host addresses in the range, network and broadcast excluded.
pub fn usable_hosts(net: &Ipv4Net) -> u32 {
    if net.prefix_len() >= 31 {
        return 0;
    }
    ((1u64 << (32 - net.prefix_len())) - 2) as u32
}

/// The nth usable address, 1-based (1 = first usable, the default gateway).
pub fn nth_host(net: &Ipv4Net, n: u32) -> Option<Ipv4Addr> {
    if n == 0 || n > usable_hosts(net) {
        return None;
    }
    Some(Ipv4Addr::from(u32::from(net.network()) + n))
}

/// Two prefix-aligned networks overlap iff one contains the other's base.
pub fn overlaps(a: &Ipv4Net, b: &Ipv4Net) -> bool {
    a.contains(&b.network()) || b.contains(&a.network())
}

/// Host-global sysctl enabling IPv4 forwarding.
pub fn enable_ip_forwarding(exec: &Executor) -> Result<()> {
    exec.run(&tokens(&["sysctl", "-w", "net.ipv4.ip_forward=1"]))?;
    Ok(())
}
