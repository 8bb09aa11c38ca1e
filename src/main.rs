use std::net::Ipv4Addr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use ipnet::Ipv4Net;
use tracing_subscriber::EnvFilter;

use vpcctl::context::DEFAULT_DATA_DIR;
use vpcctl::vpc::{NatScope, OrphanState, VpcManager};
use vpcctl::{Context, Result, VpcError};

#[derive(Parser, Debug)]
#[command(
    name = "vpcctl",
    version,
    about = "Single-host VPC simulator on Linux namespaces, bridges and iptables"
)]
struct Cli {
    /// Print mutating commands without executing them
    #[arg(long, global = true)]
    dry_run: bool,

    /// Directory holding VPC metadata
    #[arg(long, global = true, default_value = DEFAULT_DATA_DIR)]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a VPC: a bridge plus a dedicated filter chain
    Create {
        name: String,
        /// IPv4 range in prefix form, e.g. 10.10.0.0/16
        #[arg(long)]
        cidr: String,
    },

    /// Add a subnet (network namespace) to a VPC
    AddSubnet {
        vpc: String,
        name: String,
        /// Subnet range, contained in the VPC CIDR
        #[arg(long)]
        cidr: String,
        /// Gateway address; defaults to the first usable address
        #[arg(long)]
        gw: Option<Ipv4Addr>,
    },

    /// Enable NAT for subnets of a VPC via a host egress interface
    EnableNat {
        vpc: String,
        /// Host outbound interface, e.g. eth0
        #[arg(long)]
        interface: String,
        /// Target a single named subnet
        #[arg(long, conflicts_with = "all_subnets")]
        subnet: Option<String>,
        /// Target every subnet in the VPC
        #[arg(long)]
        all_subnets: bool,
    },

    /// Connect two VPC bridges with filtered reachability
    Peer {
        vpc_a: String,
        vpc_b: String,
        /// Comma-separated CIDRs allowed across the peering
        /// (default: both VPC CIDRs)
        #[arg(long, value_delimiter = ',')]
        allow_cidrs: Option<Vec<Ipv4Net>>,
    },

    /// Apply a JSON ingress/egress policy to a subnet
    ApplyPolicy {
        vpc: String,
        /// Path to the policy document
        policy_file: PathBuf,
    },

    /// Start a test HTTP listener inside a subnet namespace
    DeployApp {
        vpc: String,
        subnet: String,
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },

    /// Stop test listeners, selected by namespace and/or pid
    StopApp {
        vpc: String,
        #[arg(long)]
        ns: Option<String>,
        #[arg(long)]
        pid: Option<i32>,
    },

    /// Delete a VPC and everything it created
    Delete { name: String },

    /// Delete every VPC in the store
    CleanupAll,

    /// List VPC names
    List,

    /// Print a VPC document
    Inspect { name: String },

    /// Cross-check metadata against live kernel state
    Verify,

    /// Probe HTTP reachability of target:port, optionally from a namespace
    TestConnectivity {
        target: Ipv4Addr,
        #[arg(default_value_t = 80)]
        port: u16,
        #[arg(long)]
        from_ns: Option<String>,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let dry_run = cli.dry_run;
    let ctx = Context::new(cli.data_dir, dry_run);
    let manager = VpcManager::new(ctx);

    match run(&manager, cli.command, dry_run) {
        Ok(()) => {}
        Err(e) => {
            eprintln!("vpcctl: {e}");
            std::process::exit(e.exit_code());
        }
    }
}

fn run(manager: &VpcManager, command: Commands, dry_run: bool) -> Result<()> {
    if mutates(&command) && !dry_run && !nix::unistd::geteuid().is_root() {
        return Err(VpcError::Privilege);
    }

    match command {
        Commands::Create { name, cidr } => {
            let doc = manager.create(&name, &cidr)?;
            println!(
                "Created VPC '{}' with bridge '{}' and CIDR {}",
                doc.name, doc.bridge, doc.cidr
            );
        }
        Commands::AddSubnet {
            vpc,
            name,
            cidr,
            gw,
        } => {
            let sub = manager.add_subnet(&vpc, &name, &cidr, gw)?;
            println!(
                "Created subnet '{}' ({}) in VPC '{}' with namespace '{}' and gateway {}",
                sub.name, sub.cidr, vpc, sub.ns, sub.gw
            );
        }
        Commands::EnableNat {
            vpc,
            interface,
            subnet,
            all_subnets,
        } => {
            let scope = match (subnet, all_subnets) {
                (Some(name), _) => NatScope::Subnet(name),
                (None, true) => NatScope::AllSubnets,
                (None, false) => NatScope::Default,
            };
            let enabled = manager.enable_nat(&vpc, &interface, scope)?;
            if enabled.is_empty() {
                println!(
                    "No subnet in scope for NAT on '{vpc}' (use --subnet or --all-subnets)"
                );
            } else {
                println!(
                    "Enabled NAT for VPC '{vpc}' via '{interface}' (subnets: {})",
                    enabled.join(", ")
                );
            }
        }
        Commands::Peer {
            vpc_a,
            vpc_b,
            allow_cidrs,
        } => {
            manager.peer(&vpc_a, &vpc_b, allow_cidrs)?;
            println!("Peered VPC '{vpc_a}' <-> '{vpc_b}'");
        }
        Commands::ApplyPolicy { vpc, policy_file } => {
            let text = std::fs::read_to_string(&policy_file)?;
            let subnet = manager.apply_policy_json(&vpc, &text)?;
            println!("Applied policy to subnet '{subnet}' of VPC '{vpc}'");
        }
        Commands::DeployApp { vpc, subnet, port } => {
            let app = manager.deploy_app(&vpc, &subnet, port)?;
            match app.pid {
                Some(pid) => println!(
                    "HTTP listener started in '{}' on port {} (pid {})",
                    app.ns, app.port, pid
                ),
                None => println!(
                    "HTTP listener planned in '{}' on port {} (dry-run)",
                    app.ns, app.port
                ),
            }
        }
        Commands::StopApp { vpc, ns, pid } => {
            let stopped = manager.stop_app(&vpc, ns.as_deref(), pid)?;
            if stopped.is_empty() {
                println!("No matching apps found to stop");
            } else {
                for app in stopped {
                    println!("Stopped app in '{}' (port {})", app.ns, app.port);
                }
            }
        }
        Commands::Delete { name } => {
            manager.delete(&name)?;
            println!("Deleted VPC '{name}' and cleaned up resources");
        }
        Commands::CleanupAll => {
            let deleted = manager.cleanup_all()?;
            if deleted.is_empty() {
                println!("No VPCs to clean up");
            } else {
                println!("Cleaned up {} VPC(s): {}", deleted.len(), deleted.join(", "));
            }
        }
        Commands::List => {
            let names = manager.list()?;
            if names.is_empty() {
                println!("No VPCs found");
            } else {
                for name in names {
                    println!("{name}");
                }
            }
        }
        Commands::Inspect { name } => {
            let doc = manager.inspect(&name)?;
            println!("{}", serde_json::to_string_pretty(&doc)?);
        }
        Commands::Verify => {
            let report = manager.verify()?;
            println!("Accounted resources: {}", report.accounted.len());
            for item in &report.accounted {
                println!("  {item}");
            }
            if report.is_clean() {
                println!("No orphans detected");
            } else {
                println!("Orphans:");
                for orphan in &report.orphans {
                    let state = match orphan.state {
                        OrphanState::LiveUnaccounted => "live but unaccounted",
                        OrphanState::MissingLive => "recorded but missing",
                    };
                    println!("  {} {} ({state})", orphan.kind.label(), orphan.name);
                }
            }
        }
        Commands::TestConnectivity {
            target,
            port,
            from_ns,
        } => {
            let body = manager.test_connectivity(target, port, from_ns.as_deref())?;
            let snippet: String = body.chars().take(200).collect();
            println!("Connectivity OK — response snapshot:\n{snippet}");
        }
    }
    Ok(())
}

fn mutates(command: &Commands) -> bool {
    !matches!(
        command,
        Commands::List
            | Commands::Inspect { .. }
            | Commands::Verify
            | Commands::TestConnectivity { .. }
    )
}
