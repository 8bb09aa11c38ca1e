// Linux bridge lifecycle: create, address, up, delete.

use crate::error::{Result, VpcError};
use crate::exec::{tokens, Executor};

pub struct BridgeOps<'a> {
    exec: &'a Executor,
}

impl<'a> BridgeOps<'a> {
    pub fn new(exec: &'a Executor) -> Self {
        Self { exec }
    }

    pub fn exists(&self, name: &str) -> bool {
        self.exec.probe(&tokens(&["ip", "link", "show", name]))
    }

    pub fn create(&self, name: &str) -> Result<()> {
        if self.exists(name) {
            tracing::debug!("bridge {} already exists, skipping", name);
            return Ok(());
        }
        self.exec
            .run(&tokens(&["ip", "link", "add", "name", name, "type", "bridge"]))?;
        Ok(())
    }

    /// Assign `addr/prefix` to the bridge, tolerating an address that is
    /// already present.
    pub fn assign_addr(&self, name: &str, addr_cidr: &str) -> Result<()> {
        if let Ok(out) = self
            .exec
            .capture(&tokens(&["ip", "-o", "addr", "show", "dev", name]))
        {
            if out.contains(addr_cidr) {
                tracing::debug!("bridge {} already carries {}", name, addr_cidr);
                return Ok(());
            }
        }
        match self
            .exec
            .run(&tokens(&["ip", "addr", "add", addr_cidr, "dev", name]))
        {
            Ok(_) => Ok(()),
            Err(VpcError::Exec { stderr, .. }) if stderr.contains("File exists") => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn set_up(&self, name: &str) -> Result<()> {
        self.exec.run(&tokens(&["ip", "link", "set", name, "up"]))?;
        Ok(())
    }

    /// Best-effort teardown: bring down, then delete.
    pub fn delete(&self, name: &str) {
        let down = self.exec.run_unchecked(&tokens(&["ip", "link", "set", name, "down"]));
        if !down.success {
            tracing::debug!("bridge {} down failed: {}", name, down.stderr.trim());
        }
        let del = self.exec.run_unchecked(&tokens(&["ip", "link", "del", name]));
        if !del.success {
            tracing::warn!("bridge {} delete failed: {}", name, del.stderr.trim());
        }
    }
}
