//! vpcctl — a single-host VPC simulator control plane.
//!
//! Materializes isolated, routed, policy-controlled networks out of Linux
//! bridges, network namespaces, veth pairs and iptables rules, and keeps one
//! durable JSON document per VPC so everything it creates can be torn down
//! deterministically.
//!
//! The operations API lives on [`vpc::VpcManager`]; any driver (the bundled
//! CLI, a test harness) composes it with a [`context::Context`] that fixes
//! the data directory, dry-run mode and command timeout policy.

pub mod context;
pub mod error;
pub mod exec;
pub mod firewall;
pub mod net;
pub mod policy;
pub mod store;
pub mod vpc;

pub use context::Context;
pub use error::{Result, VpcError};
pub use vpc::VpcManager;
