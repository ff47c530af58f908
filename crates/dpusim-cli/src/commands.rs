use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;

use dpusim_core::config::{self, MGMT_NETWORK_TYPE, SimConfig};
use dpusim_core::poll::PollPolicy;
use dpusim_core::topology::Topology;
use dpusim_runtime::Session;
use dpusim_runtime::cleanup::CleanupCoordinator;
use dpusim_runtime::k8s::{ClusterBootstrapper, KubectlCni};
use dpusim_runtime::requirements;

use crate::display::{self, ClusterRow, IpRow, NetworkRow, TopologyVmRow, VmRow};
use crate::logging::{self, LogFormat};
use crate::output::{self, OutputFormat};
use crate::ui;

#[derive(Parser)]
#[command(
    name = "dpu-sim",
    version,
    about = "Libvirt-based DPU topology simulator with Kubernetes bootstrap"
)]
struct Cli {
    /// Config file [default: $DPUSIM_CONFIG or ./config.yaml]
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    /// Output format for command results
    #[arg(long, short = 'o', global = true, value_enum, default_value_t = OutputFormat::Table)]
    output: OutputFormat,

    /// Log format on stderr
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Human)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Clean up, create networks and VMs, then bootstrap Kubernetes
    Deploy {
        /// Keep existing VMs and networks instead of removing them first
        #[arg(long)]
        skip_cleanup: bool,
        /// Only remove existing VMs, networks and kubeconfigs
        #[arg(long, conflicts_with_all = ["skip_cleanup", "skip_k8s"])]
        cleanup_only: bool,
        /// Stop after the VMs are created
        #[arg(long)]
        skip_k8s: bool,
    },
    /// Remove every configured VM and network, plus saved kubeconfigs
    Cleanup {
        /// Do not ask for confirmation
        #[arg(long, short = 'y')]
        yes: bool,
    },
    /// Manage individual VMs
    Vm {
        #[command(subcommand)]
        action: VmCmd,
    },
    /// Manage the configured networks and host-to-DPU links
    Net {
        #[command(subcommand)]
        action: NetCmd,
    },
    /// Show the networks, VMs and links derived from the config
    Topology,
    /// Check that every host tool a deploy needs is installed
    Check,
}

#[derive(Subcommand)]
enum VmCmd {
    /// List configured VMs that exist in libvirt
    List,
    /// Start a stopped VM
    Start { name: String },
    /// Gracefully shut down a running VM
    Stop { name: String },
    /// Force off a running VM
    Destroy { name: String },
    /// Reboot a running VM
    Reboot { name: String },
    /// Remove a VM with its disk, seed ISO and NVRAM
    Delete { name: String },
    /// Wait for and print a VM's address on a network
    Ip {
        name: String,
        /// Network type to look up
        #[arg(long, default_value = MGMT_NETWORK_TYPE)]
        network: String,
    },
    /// Show state, resources and management IP
    Info { name: String },
    /// Enable or disable start on host boot
    Autostart {
        name: String,
        #[arg(long)]
        disable: bool,
    },
}

#[derive(Subcommand)]
enum NetCmd {
    /// Create every configured network and host-to-DPU link
    Create,
    /// Remove every configured network and host-to-DPU link
    Delete,
}

// ============================================================================
// Command dispatch
// ============================================================================

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.log_format);

    let config_path = cli.config.unwrap_or_else(config::config_path);
    let out = cli.output;

    match cli.command {
        Commands::Deploy {
            skip_cleanup,
            cleanup_only,
            skip_k8s,
        } => cmd_deploy(
            load_config(&config_path)?,
            DeployOptions {
                skip_cleanup,
                cleanup_only,
                skip_k8s,
            },
            out,
        ),
        Commands::Cleanup { yes } => cmd_cleanup(load_config(&config_path)?, yes),
        Commands::Vm { action } => cmd_vm(load_config(&config_path)?, action, out),
        Commands::Net { action } => cmd_net(load_config(&config_path)?, action),
        Commands::Topology => cmd_topology(&load_config(&config_path)?, out),
        Commands::Check => cmd_check(&load_config(&config_path)?),
    }
}

fn load_config(path: &Path) -> Result<SimConfig> {
    let cfg = SimConfig::from_file(path)?;
    tracing::debug!(path = %path.display(), "loaded config");
    Ok(cfg)
}

// ============================================================================
// deploy / cleanup
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct DeployOptions {
    skip_cleanup: bool,
    cleanup_only: bool,
    skip_k8s: bool,
}

impl DeployOptions {
    fn step_count(&self, has_clusters: bool) -> u32 {
        if self.cleanup_only {
            return 1;
        }
        let mut n = 3;
        if !self.skip_cleanup {
            n += 1;
        }
        if !self.skip_k8s && has_clusters {
            n += 2;
        }
        n
    }
}

fn cmd_deploy(cfg: SimConfig, opts: DeployOptions, out: OutputFormat) -> Result<()> {
    requirements::check_requirements(&cfg)?;
    let has_clusters = !cfg.kubernetes.clusters.is_empty();
    let total = opts.step_count(has_clusters);
    let mut n = 0;
    let mut step = |msg: &str| {
        n += 1;
        ui::step(n, total, msg);
    };

    let session = Session::open(cfg)?;
    let networks = session.networks();
    let vms = session.vms();
    let cleanup = CleanupCoordinator::new(&networks, &vms, session.paths());

    if opts.cleanup_only {
        step("Removing existing VMs, networks and kubeconfigs");
        cleanup.cleanup_all()?;
        cleanup.cleanup_kubeconfigs()?;
        ui::success("Cleanup complete.");
        return Ok(());
    }

    if !opts.skip_cleanup {
        step("Removing existing VMs, networks and kubeconfigs");
        if let Err(e) = cleanup.cleanup_all() {
            ui::warn(&format!("Cleanup was incomplete: {:#}", e));
        }
        if let Err(e) = cleanup.cleanup_kubeconfigs() {
            ui::warn(&format!("Kubeconfig cleanup was incomplete: {:#}", e));
        }
    }

    step("Creating networks");
    networks.create_all_networks()?;

    step("Creating VMs");
    vms.create_all_vms()?;

    step("Waiting for VMs to boot");
    let ready = ui::with_spinner("Waiting for management IPs and SSH", || {
        vms.wait_for_all_vms(session.ssh(), PollPolicy::ssh_ready())
    })?;
    for (name, ip) in &ready {
        ui::info(&format!("{} is up at {}", name, ip));
    }

    if opts.skip_k8s || !has_clusters {
        ui::banner(&["VMs are up.", "Kubernetes setup skipped."]);
        return Ok(());
    }

    let cni = KubectlCni;
    let bootstrapper = ClusterBootstrapper::new(
        &vms,
        session.ssh(),
        &cni,
        session.config(),
        session.topology(),
        session.paths(),
    );

    step("Preparing Kubernetes nodes");
    bootstrapper.prepare_nodes()?;

    step("Bootstrapping clusters");
    let outcomes = bootstrapper.setup_all_clusters()?;

    ui::banner(&["Deployment complete."]);
    let rows: Vec<ClusterRow> = outcomes.iter().map(ClusterRow::from).collect();
    output::render_list(&rows, out)
}

fn cmd_cleanup(cfg: SimConfig, yes: bool) -> Result<()> {
    if !yes
        && !ui::confirm(&format!(
            "Remove {} VM(s) and {} network(s)?",
            cfg.vms.len(),
            cfg.networks.len()
        ))
    {
        ui::info("Aborted.");
        return Ok(());
    }

    let session = Session::open(cfg)?;
    let networks = session.networks();
    let vms = session.vms();
    let cleanup = CleanupCoordinator::new(&networks, &vms, session.paths());

    let result = cleanup.cleanup_all();
    if let Err(e) = cleanup.cleanup_kubeconfigs() {
        ui::warn(&format!("Kubeconfig cleanup was incomplete: {:#}", e));
    }
    result?;
    ui::success("Cleanup complete.");
    Ok(())
}

// ============================================================================
// vm / net
// ============================================================================

fn cmd_vm(cfg: SimConfig, action: VmCmd, out: OutputFormat) -> Result<()> {
    let session = Session::open(cfg)?;
    let vms = session.vms();

    match action {
        VmCmd::List => {
            let existing = vms.list_vms()?;
            let mut rows = Vec::new();
            for vm in &session.config().vms {
                if existing.contains(&vm.name) {
                    rows.push(VmRow::from(&vms.vm_info(&vm.name)?));
                }
            }
            if out == OutputFormat::Table && rows.is_empty() {
                ui::info("No VMs found.");
                return Ok(());
            }
            output::render_list(&rows, out)
        }
        VmCmd::Start { name } => {
            vms.start_vm(&name)?;
            ui::success(&format!("Started {}.", name));
            Ok(())
        }
        VmCmd::Stop { name } => {
            vms.stop_vm(&name)?;
            ui::success(&format!("Shutdown requested for {}.", name));
            Ok(())
        }
        VmCmd::Destroy { name } => {
            vms.destroy_vm(&name)?;
            ui::success(&format!("Forced off {}.", name));
            Ok(())
        }
        VmCmd::Reboot { name } => {
            vms.reboot_vm(&name)?;
            ui::success(&format!("Rebooting {}.", name));
            Ok(())
        }
        VmCmd::Delete { name } => {
            vms.delete_vm(&name)?;
            ui::success(&format!("Deleted {}.", name));
            Ok(())
        }
        VmCmd::Ip { name, network } => {
            let ip = ui::with_spinner(
                &format!("Waiting for {} address of {}...", network, name),
                || vms.wait_for_ip(&name, &network),
            )?;
            output::render_one(
                &IpRow {
                    vm: name,
                    network,
                    ip: ip.to_string(),
                },
                out,
            )
        }
        VmCmd::Info { name } => output::render_one(&VmRow::from(&vms.vm_info(&name)?), out),
        VmCmd::Autostart { name, disable } => {
            vms.set_autostart(&name, !disable)?;
            let state = if disable { "disabled" } else { "enabled" };
            ui::success(&format!("Autostart {} for {}.", state, name));
            Ok(())
        }
    }
}

fn cmd_net(cfg: SimConfig, action: NetCmd) -> Result<()> {
    let session = Session::open(cfg)?;
    let networks = session.networks();
    match action {
        NetCmd::Create => {
            networks.create_all_networks()?;
            ui::success("Networks created.");
        }
        NetCmd::Delete => {
            networks.cleanup_networks()?;
            ui::success("Networks removed.");
        }
    }
    Ok(())
}

// ============================================================================
// topology / check
// ============================================================================

#[derive(Serialize)]
struct TopologyView {
    networks: Vec<NetworkRow>,
    vms: Vec<TopologyVmRow>,
}

fn cmd_topology(cfg: &SimConfig, out: OutputFormat) -> Result<()> {
    let topology = Topology::resolve(cfg);
    let (networks, vms) = display::topology_rows(cfg, &topology);

    if out == OutputFormat::Table {
        output::render_list(&networks, out)?;
        println!();
        return output::render_list(&vms, out);
    }
    if let Some(text) = output::format_structured(&TopologyView { networks, vms }, out)? {
        println!("{}", text.trim_end());
    }
    Ok(())
}

fn cmd_check(cfg: &SimConfig) -> Result<()> {
    let missing = requirements::missing_tools(cfg, None);
    if missing.is_empty() {
        ui::success("All required tools found.");
        return Ok(());
    }
    for req in &missing {
        ui::error(&format!("{} not found on PATH ({})", req.tool, req.purpose));
    }
    bail!("{} required tool(s) missing", missing.len())
}
