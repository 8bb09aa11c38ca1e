// Veth pair plumbing: create, attach to bridge, move into namespace,
// address and route the namespace side.

use std::net::Ipv4Addr;

use crate::error::Result;
use crate::exec::{tokens, Executor};
use crate::net::netns;

pub struct VethOps<'a> {
    exec: &'a Executor,
}

impl<'a> VethOps<'a> {
    pub fn new(exec: &'a Executor) -> Self {
        Self { exec }
    }

    pub fn exists(&self, name: &str) -> bool {
        self.exec.probe(&tokens(&["ip", "link", "show", name]))
    }

    pub fn create_pair(&self, a: &str, b: &str) -> Result<()> {
        if self.exists(a) || self.exists(b) {
            tracing::debug!("veth pair {}/{} already present, skipping", a, b);
            return Ok(());
        }
        self.exec.run(&tokens(&[
            "ip", "link", "add", a, "type", "veth", "peer", "name", b,
        ]))?;
        Ok(())
    }

    pub fn attach_to_bridge(&self, veth: &str, bridge: &str) -> Result<()> {
        self.exec
            .run(&tokens(&["ip", "link", "set", veth, "master", bridge]))?;
        Ok(())
    }

    pub fn move_to_netns(&self, veth: &str, ns: &str) -> Result<()> {
        self.exec
            .run(&tokens(&["ip", "link", "set", veth, "netns", ns]))?;
        Ok(())
    }

    pub fn set_up(&self, veth: &str) -> Result<()> {
        self.exec.run(&tokens(&["ip", "link", "set", veth, "up"]))?;
        Ok(())
    }

    pub fn set_up_in_ns(&self, ns: &str, veth: &str) -> Result<()> {
        self.exec
            .run(&netns::wrap(ns, &["ip", "link", "set", veth, "up"]))?;
        Ok(())
    }

    pub fn assign_addr_in_ns(&self, ns: &str, veth: &str, addr_cidr: &str) -> Result<()> {
        self.exec
            .run(&netns::wrap(ns, &["ip", "addr", "add", addr_cidr, "dev", veth]))?;
        Ok(())
    }

    pub fn default_route_in_ns(&self, ns: &str, gw: Ipv4Addr) -> Result<()> {
        self.exec.run(&netns::wrap(
            ns,
            &["ip", "route", "add", "default", "via", &gw.to_string()],
        ))?;
        Ok(())
    }

    /// Best-effort delete. Removing either end destroys the pair.
    pub fn delete(&self, name: &str) {
        let out = self.exec.run_unchecked(&tokens(&["ip", "link", "del", name]));
        if !out.success {
            tracing::debug!("veth {} delete failed: {}", name, out.stderr.trim());
        }
    }
}
