// SPDX-License-Identifier: GPL-2.0-only
use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use vmm_lib::config::Config;
use vmm_lib::vm::{parse_mount_spec, CreateVmParams, Protocol, VmRecord};
use vmm_lib::vm_service::{BatchOutcome, BatchReport, Backends, VmService, VmServiceError};

mod config;
mod logging;

const EXIT_GENERAL_ERROR: u8 = 1;
const EXIT_NOT_FOUND: u8 = 4;
const EXIT_CONFLICT: u8 = 5;

#[derive(Parser)]
#[command(name = "vmm", about = "Firecracker microVM manager", version)]
struct Cli {
    /// Path to configuration file
    /// [default: $XDG_CONFIG_HOME/vmm/config.yaml]
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new VM
    Create {
        /// VM name
        name: String,
        /// vCPU count [default: from config]
        #[arg(long)]
        cpus: Option<u32>,
        /// Memory in MiB [default: from config]
        #[arg(long)]
        memory: Option<u32>,
        /// Root disk size in MiB [default: from config]
        #[arg(long)]
        disk: Option<u64>,
        /// Base image name [default: rootfs]
        #[arg(long)]
        image: Option<String>,
        /// Kernel name [default: vmlinux.bin]
        #[arg(long)]
        kernel: Option<String>,
        /// Public key file authorized for root
        #[arg(long)]
        ssh_key: Option<PathBuf>,
        /// DNS server for the guest (repeatable)
        #[arg(long = "dns")]
        dns: Vec<String>,
        /// Host directory to attach, as /host/path:tag[:ro|rw] (repeatable)
        #[arg(long = "mount")]
        mounts: Vec<String>,
        /// Leave the VM out of autostart
        #[arg(long)]
        no_autostart: bool,
    },
    /// Boot a VM
    Start {
        /// VM name
        name: String,
    },
    /// Shut a VM down
    Stop {
        /// VM name
        name: String,
    },
    /// Delete a VM and its disks
    Delete {
        /// VM name
        name: String,
        /// Stop the VM first if it is running
        #[arg(short, long)]
        force: bool,
    },
    /// List all VMs
    List,
    /// Manage base images
    Image {
        #[command(subcommand)]
        action: ImageAction,
    },
    /// Manage kernels
    Kernel {
        #[command(subcommand)]
        action: KernelAction,
    },
    /// Manage host directory mounts
    Mount {
        #[command(subcommand)]
        action: MountAction,
    },
    /// Forward a host port to a running VM
    PortForward {
        /// VM name
        name: String,
        /// Host port
        host_port: u16,
        /// Guest port
        guest_port: u16,
        /// tcp or udp
        #[arg(long, default_value = "tcp")]
        protocol: Protocol,
    },
    /// Show or initialize configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Start every VM marked for autostart
    #[command(hide = true)]
    Autostart,
    /// Stop every running VM
    #[command(hide = true)]
    Autostop,
}

#[derive(Subcommand)]
enum ImageAction {
    /// List base images
    List,
    /// Download the default kernel and rootfs
    Pull,
    /// Import a container image as a base image
    Import {
        /// Container image reference, e.g. ubuntu:24.04
        image_ref: String,
        /// Name for the base image
        #[arg(long)]
        name: String,
        /// Image size in MiB
        #[arg(long)]
        size: Option<u64>,
    },
    /// Delete a base image
    Delete {
        /// Image name
        name: String,
    },
}

#[derive(Subcommand)]
enum KernelAction {
    /// List kernels
    List,
    /// Import a kernel binary
    Import {
        /// Path to an uncompressed vmlinux
        path: PathBuf,
        /// Name for the kernel
        #[arg(long)]
        name: String,
        /// Replace an existing kernel of the same name
        #[arg(long)]
        force: bool,
    },
    /// Delete a kernel
    Delete {
        /// Kernel name
        name: String,
    },
}

#[derive(Subcommand)]
enum MountAction {
    /// List a VM's mounts
    List {
        /// VM name
        name: String,
    },
    /// Rebuild a mount image from its host directory
    Sync {
        /// VM name
        name: String,
        /// Mount tag
        tag: String,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(exit_code(&e))
        }
    }
}

fn exit_code(e: &anyhow::Error) -> u8 {
    match e.downcast_ref::<VmServiceError>() {
        Some(VmServiceError::NotFound(_)) => EXIT_NOT_FOUND,
        Some(
            VmServiceError::AlreadyExists(_)
            | VmServiceError::AlreadyRunning(_)
            | VmServiceError::NotRunning(_)
            | VmServiceError::Conflict(_)
            | VmServiceError::ResourceBusy(_),
        ) => EXIT_CONFLICT,
        _ => EXIT_GENERAL_ERROR,
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config_path = cli.config.unwrap_or_else(config::default_config_path);

    let command = match cli.command {
        Commands::Config { action } => return cmd_config(&config_path, action),
        other => other,
    };

    let cfg = config::load(&config_path)?;
    let service = VmService::new(&cfg, Backends::host(&cfg)).context("cannot initialize")?;

    match command {
        Commands::Create {
            name,
            cpus,
            memory,
            disk,
            image,
            kernel,
            ssh_key,
            dns,
            mounts,
            no_autostart,
        } => {
            let mut params = CreateVmParams::new(name.clone());
            params.cpus = cpus.unwrap_or(cfg.defaults.cpus);
            params.memory_mb = memory.unwrap_or(cfg.defaults.memory_mb);
            params.disk_size_mb = disk.unwrap_or(cfg.defaults.disk_size_mb);
            params.image = image;
            params.kernel = kernel;
            params.dns_servers = if dns.is_empty() {
                cfg.defaults.dns_servers.clone()
            } else {
                dns
            };
            params.auto_start = !no_autostart;
            if let Some(path) = ssh_key.or_else(|| cfg.defaults.ssh_key_path.clone()) {
                params.ssh_public_key = Some(read_public_key(&path)?);
            }
            for spec in &mounts {
                let mount = parse_mount_spec(spec).map_err(anyhow::Error::msg)?;
                params.mounts.push(mount);
            }

            let vm = service
                .create(params)
                .with_context(|| format!("cannot create VM \"{name}\""))?;
            println!("Created VM \"{}\"", vm.name);
            println!("  ID:     {}", vm.id);
            println!("  TAP:    {}", vm.tap_device);
            println!("  MAC:    {}", vm.mac_address);
            println!("\n  Start it: vmm start {}", vm.name);
        }
        Commands::Start { name } => {
            let vm = service
                .start(&name)
                .await
                .with_context(|| format!("cannot start VM \"{name}\""))?;
            println!("Started VM \"{}\"", vm.name);
            if let Some(ip) = vm.live_ip() {
                println!("  IP:     {ip}");
            }
            println!("  PID:    {}", vm.pid);
        }
        Commands::Stop { name } => {
            service
                .stop(&name)
                .await
                .with_context(|| format!("cannot stop VM \"{name}\""))?;
            println!("Stopped VM \"{name}\"");
        }
        Commands::Delete { name, force } => {
            service
                .delete(&name, force)
                .await
                .with_context(|| format!("cannot delete VM \"{name}\""))?;
            println!("Deleted VM \"{name}\"");
        }
        Commands::List => {
            let vms = service.list().context("cannot list VMs")?;
            print_vm_table(&vms);
        }
        Commands::Image { action } => cmd_image(&service, action).await?,
        Commands::Kernel { action } => cmd_kernel(&service, action)?,
        Commands::Mount { action } => cmd_mount(&service, action)?,
        Commands::PortForward {
            name,
            host_port,
            guest_port,
            protocol,
        } => {
            let pf = service
                .add_port_forward(&name, host_port, guest_port, protocol)
                .with_context(|| format!("cannot forward port {host_port} to VM \"{name}\""))?;
            println!(
                "Forwarding host port {}/{} to VM \"{name}\" port {}",
                pf.host_port, pf.protocol, pf.guest_port
            );
        }
        Commands::Autostart => {
            let report = service.autostart().await.context("autostart failed")?;
            print_batch(&report);
            println!("Auto-started {} VMs", report.succeeded());
            if report.failed() > 0 {
                bail!("{} VM(s) failed to start", report.failed());
            }
        }
        Commands::Autostop => {
            let report = service.autostop().await.context("autostop failed")?;
            print_batch(&report);
            println!("Stopped {} VMs", report.succeeded());
            if report.failed() > 0 {
                bail!("{} VM(s) failed to stop", report.failed());
            }
        }
        Commands::Config { action } => cmd_config(&config_path, action)?,
    }
    Ok(())
}

fn read_public_key(path: &Path) -> anyhow::Result<String> {
    let key = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read SSH key {}", path.display()))?;
    let key = key.trim();
    if key.is_empty() {
        bail!("SSH key {} is empty", path.display());
    }
    Ok(key.to_string())
}

fn print_vm_table(vms: &[VmRecord]) {
    if vms.is_empty() {
        println!("No VMs found.");
        return;
    }
    println!(
        "{:<20} {:<10} {:<16} {:<5} {:<8} {:<9}",
        "NAME", "STATE", "IP", "CPUS", "MEM", "AUTOSTART"
    );
    for vm in vms {
        println!(
            "{:<20} {:<10} {:<16} {:<5} {:<8} {:<9}",
            vm.name,
            vm.state,
            vm.live_ip().unwrap_or("-"),
            vm.cpus,
            format!("{}M", vm.memory_mb),
            if vm.auto_start { "yes" } else { "no" },
        );
        if let Some(err) = &vm.last_error {
            println!("  last error: {err}");
        }
    }
}

fn print_batch(report: &BatchReport) {
    for entry in &report.entries {
        match &entry.outcome {
            BatchOutcome::Started => println!("  {}: started", entry.name),
            BatchOutcome::Stopped => println!("  {}: stopped", entry.name),
            BatchOutcome::Skipped(reason) => println!("  {}: skipped ({reason})", entry.name),
            BatchOutcome::Failed(msg) => println!("  {}: failed: {msg}", entry.name),
        }
    }
}

async fn cmd_image(service: &VmService, action: ImageAction) -> anyhow::Result<()> {
    match action {
        ImageAction::Pull => {
            let base = service
                .pull_base_images()
                .await
                .context("cannot download default images")?;
            println!("Default images are ready");
            println!("  Kernel: {}", base.kernel.display());
            println!("  Rootfs: {}", base.rootfs.display());
        }
        ImageAction::List => {
            let images = service.list_images().context("cannot list images")?;
            if images.is_empty() {
                println!("No images found.");
                return Ok(());
            }
            println!("{:<20} {:>10}  {}", "NAME", "SIZE", "PATH");
            for img in &images {
                let name = if img.is_default {
                    format!("{} (default)", img.name)
                } else {
                    img.name.clone()
                };
                println!("{:<20} {:>10}  {}", name, format_size(img.size), img.path.display());
            }
        }
        ImageAction::Import { image_ref, name, size } => {
            let img = service
                .import_image(&image_ref, &name, size)
                .with_context(|| format!("cannot import image \"{name}\""))?;
            println!("Imported image \"{}\" from {image_ref}", img.name);
            println!("  Path: {}", img.path.display());
            println!("\n  Create a VM: vmm create my-vm --image {}", img.name);
        }
        ImageAction::Delete { name } => {
            service
                .delete_image(&name)
                .with_context(|| format!("cannot delete image \"{name}\""))?;
            println!("Deleted image \"{name}\"");
        }
    }
    Ok(())
}

fn cmd_kernel(service: &VmService, action: KernelAction) -> anyhow::Result<()> {
    match action {
        KernelAction::List => {
            let kernels = service.list_kernels().context("cannot list kernels")?;
            if kernels.is_empty() {
                println!("No kernels found.");
                return Ok(());
            }
            println!("{:<24} {:>10}", "NAME", "SIZE");
            for k in &kernels {
                let name = if k.is_default {
                    format!("{} (default)", k.name)
                } else {
                    k.name.clone()
                };
                println!("{:<24} {:>10}", name, format_size(k.size));
            }
        }
        KernelAction::Import { path, name, force } => {
            let k = service
                .import_kernel(&path, &name, force)
                .with_context(|| format!("cannot import kernel \"{name}\""))?;
            println!("Imported kernel \"{}\" ({})", k.name, format_size(k.size));
        }
        KernelAction::Delete { name } => {
            service
                .delete_kernel(&name)
                .with_context(|| format!("cannot delete kernel \"{name}\""))?;
            println!("Deleted kernel \"{name}\"");
        }
    }
    Ok(())
}

fn cmd_mount(service: &VmService, action: MountAction) -> anyhow::Result<()> {
    match action {
        MountAction::List { name } => {
            let mounts = service
                .list_mounts(&name)
                .with_context(|| format!("cannot list mounts of VM \"{name}\""))?;
            if mounts.is_empty() {
                println!("VM \"{name}\" has no mounts.");
                return Ok(());
            }
            println!("Mounts of VM \"{name}\":");
            for m in &mounts {
                println!(
                    "  {}: {} -> {} ({}) [{}]",
                    m.tag,
                    m.host_path.display(),
                    m.guest_path,
                    if m.read_only { "ro" } else { "rw" },
                    m.device
                );
            }
        }
        MountAction::Sync { name, tag } => {
            let path = service
                .sync_mount(&name, &tag)
                .with_context(|| format!("cannot sync mount \"{tag}\" of VM \"{name}\""))?;
            println!("Synced mount \"{tag}\" into {}", path.display());
        }
    }
    Ok(())
}

fn cmd_config(path: &Path, action: ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            let cfg = config::load(path)?;
            println!("# {}", path.display());
            print!("{}", cfg.to_yaml().context("cannot render config")?);
        }
        ConfigAction::Init { force } => {
            if path.exists() && !force {
                bail!(
                    "config {} already exists (use --force to overwrite)",
                    path.display()
                );
            }
            Config::default()
                .save(path)
                .with_context(|| format!("cannot write config {}", path.display()))?;
            println!("Wrote default config to {}", path.display());
        }
    }
    Ok(())
}

fn format_size(bytes: u64) -> String {
    const MIB: u64 = 1024 * 1024;
    if bytes >= 1024 * MIB {
        format!("{:.1}G", bytes as f64 / (1024 * MIB) as f64)
    } else {
        format!("{}M", bytes.div_ceil(MIB))
    }
}
