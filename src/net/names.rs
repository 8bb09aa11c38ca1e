// Kernel-safe identifier derivation. Encoding is pure: the same logical
// name maps to the same identifier on every run.

use sha2::{Digest, Sha256};

/// IFNAMSIZ is 16 including the NUL, so link names carry at most 15 octets.
pub const LINK_NAME_MAX: usize = 15;

const NETNS_NAME_MAX: usize = 32;

/// What the identifier will be used for. Each role has a reserved prefix
/// and a length bound appropriate to the kernel object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// VPC software bridge, `br-`.
    Bridge,
    /// Subnet network namespace, `ns-`.
    Namespace,
    /// Per-VPC iptables chain, `vpc-`.
    Chain,
    /// Subnet veth pair ends, `v-`.
    Veth,
    /// Peering veth pair ends, `pv-`.
    Peering,
}

impl Role {
    pub fn prefix(self) -> &'static str {
        match self {
            Role::Bridge => "br-",
            Role::Namespace => "ns-",
            Role::Chain => "vpc-",
            Role::Veth => "v-",
            Role::Peering => "pv-",
        }
    }

    fn max_len(self) -> usize {
        match self {
            // Namespace names are files under /run/netns, not link names;
            // a looser bound keeps `ns-<vpc>-<subnet>` readable.
            Role::Namespace => NETNS_NAME_MAX,
            _ => LINK_NAME_MAX,
        }
    }
}

/// Derive an identifier for `role` from logical name parts.
pub fn encode(parts: &[&str], role: Role) -> String {
    encode_with_suffix(parts, role, "")
}

/// As [`encode`], with a trailing suffix kept inside the length bound
/// (used for the `a`/`b` ends of a peering pair).
pub fn encode_with_suffix(parts: &[&str], role: Role, suffix: &str) -> String {
    let core = sanitize(&parts.join("-"));
    let prefix = role.prefix();
    let avail = role.max_len().saturating_sub(prefix.len() + suffix.len());

    if core.len() <= avail {
        return format!("{prefix}{core}{suffix}");
    }

    // Truncate from the right and spend the last four available characters
    // on a digest of the full core so distinct inputs stay distinct.
    let digest = short_digest(&core);
    let keep = avail.saturating_sub(digest.len());
    format!("{prefix}{}{digest}{suffix}", &core[..keep])
}

fn sanitize(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut prev_dash = false;
    for c in raw.chars() {
        let mapped = if c.is_ascii_alphanumeric() { c } else { '-' };
        if mapped == '-' {
            if prev_dash {
                continue;
            }
            prev_dash = true;
        } else {
            prev_dash = false;
        }
        out.push(mapped);
    }
    out.trim_matches('-').to_string()
}

fn short_digest(core: &str) -> String {
    let d = Sha256::digest(core.as_bytes());
    format!("{:02x}{:02x}", d[0], d[1])
}
