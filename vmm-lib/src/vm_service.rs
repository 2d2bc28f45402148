// SPDX-License-Identifier: GPL-2.0-only

//! Lifecycle orchestration.
//!
//! `VmService` sequences storage, networking, and the hypervisor for every
//! VM operation and owns the state transitions. Each operation reconciles
//! the persisted record against the live process before acting on it.

use crate::backend::{
    BackendError, ContainerExporter, DockerExporter, Ext4Tools, FilesystemFormatter,
    FilesystemResizer, LoopImageMounter, LoopMounter,
};
use crate::config::{Config, FirecrackerConfig, Paths, DEFAULT_DNS_SERVERS};
use crate::hypervisor::{
    BootRequest, DriveSpec, FirecrackerSupervisor, HypervisorError, HypervisorSupervisor, Liveness,
};
use crate::image_lock::{self, ImageLocks};
use crate::image_service::{ImageError, ImageInfo, ImageService, KernelInfo, DEFAULT_IMAGE};
use crate::mount_service::{MountError, MountService};
use crate::network_service::{IpCommandController, NetworkDeviceController, NetworkError, NetworkService};
use crate::storage_service::{FstabEntry, StorageError, StorageService};
use crate::store::{FileStore, StoreError, VmStore};
use crate::tool::ToolError;
use crate::vm::{device_for_mount, CreateVmParams, PortForward, Protocol, VmRecord, VmState};
use chrono::Utc;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Errors from lifecycle operations.
#[derive(Debug)]
pub enum VmServiceError {
    /// A VM, image, kernel, mount tag, or host directory is absent
    NotFound(String),
    AlreadyExists(String),
    AlreadyRunning(String),
    NotRunning(String),
    /// The resource is in use
    Conflict(String),
    AddressSpaceExhausted(String),
    /// Another operation holds the image
    ResourceBusy(String),
    /// A host tool or the hypervisor failed
    ExternalTool { tool: String, output: String },
    Validation(String),
    Io(String),
}

impl std::fmt::Display for VmServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmServiceError::NotFound(e) => write!(f, "{e}"),
            VmServiceError::AlreadyExists(e) => write!(f, "{e}"),
            VmServiceError::AlreadyRunning(name) => write!(f, "VM '{name}' is already running"),
            VmServiceError::NotRunning(name) => write!(f, "VM '{name}' is not running"),
            VmServiceError::Conflict(e) => write!(f, "{e}"),
            VmServiceError::AddressSpaceExhausted(e) => write!(f, "{e}"),
            VmServiceError::ResourceBusy(e) => write!(f, "{e}"),
            VmServiceError::ExternalTool { tool, output } => write!(f, "{tool} failed: {output}"),
            VmServiceError::Validation(e) => write!(f, "{e}"),
            VmServiceError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for VmServiceError {}

impl From<StoreError> for VmServiceError {
    fn from(e: StoreError) -> Self {
        let msg = e.to_string();
        match e {
            StoreError::NotFound(_) => VmServiceError::NotFound(msg),
            StoreError::AlreadyExists(_) => VmServiceError::AlreadyExists(msg),
            StoreError::Corrupt(_) | StoreError::Io(_) => VmServiceError::Io(msg),
        }
    }
}

impl From<ToolError> for VmServiceError {
    fn from(e: ToolError) -> Self {
        VmServiceError::ExternalTool {
            tool: e.tool,
            output: e.output,
        }
    }
}

impl From<BackendError> for VmServiceError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::Tool(t) => t.into(),
            BackendError::NotFound(m) => VmServiceError::NotFound(format!("{m} not found")),
            BackendError::Io(m) => VmServiceError::Io(m),
        }
    }
}

impl From<NetworkError> for VmServiceError {
    fn from(e: NetworkError) -> Self {
        let msg = e.to_string();
        match e {
            NetworkError::InvalidConfig(_) => VmServiceError::Validation(msg),
            NetworkError::AddressSpaceExhausted { .. } => VmServiceError::AddressSpaceExhausted(msg),
            NetworkError::Tool(t) => t.into(),
        }
    }
}

impl From<ImageError> for VmServiceError {
    fn from(e: ImageError) -> Self {
        let msg = e.to_string();
        match e {
            ImageError::ImageNotFound(_)
            | ImageError::DefaultImageMissing(_)
            | ImageError::KernelNotFound(_)
            | ImageError::DefaultKernelMissing(_) => VmServiceError::NotFound(msg),
            ImageError::AlreadyExists(_) => VmServiceError::AlreadyExists(msg),
            ImageError::Conflict(_) => VmServiceError::Conflict(msg),
            ImageError::InvalidName(_) | ImageError::InvalidKernel(_) | ImageError::UnsupportedImage(_) => {
                VmServiceError::Validation(msg)
            }
            ImageError::Download(_) => VmServiceError::Io(msg),
            ImageError::Backend(b) => b.into(),
            ImageError::Io(m) => VmServiceError::Io(m),
        }
    }
}

impl From<StorageError> for VmServiceError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::Image(i) => i.into(),
            StorageError::Busy(b) => VmServiceError::ResourceBusy(b.to_string()),
            StorageError::Backend(b) => b.into(),
            StorageError::Io(m) => VmServiceError::Io(m),
        }
    }
}

impl From<MountError> for VmServiceError {
    fn from(e: MountError) -> Self {
        let msg = e.to_string();
        match e {
            MountError::HostPathMissing(_) => VmServiceError::NotFound(msg),
            MountError::Busy(_) => VmServiceError::ResourceBusy(msg),
            MountError::Storage(s) => s.into(),
            MountError::Backend(b) => b.into(),
            MountError::Io(m) => VmServiceError::Io(m),
        }
    }
}

impl From<HypervisorError> for VmServiceError {
    fn from(e: HypervisorError) -> Self {
        match e {
            HypervisorError::Io(m) => VmServiceError::Io(m),
            other => VmServiceError::ExternalTool {
                tool: "firecracker".to_string(),
                output: other.to_string(),
            },
        }
    }
}

/// The host capabilities a `VmService` drives.
pub struct Backends {
    pub network: Arc<dyn NetworkDeviceController>,
    pub mounter: Arc<dyn LoopImageMounter>,
    pub resizer: Arc<dyn FilesystemResizer>,
    pub formatter: Arc<dyn FilesystemFormatter>,
    pub exporter: Arc<dyn ContainerExporter>,
    pub supervisor: Arc<dyn HypervisorSupervisor>,
}

impl Backends {
    /// Real host tools: `ip`/`iptables`, loop mounts, e2fsprogs, docker,
    /// and Firecracker.
    pub fn host(config: &Config) -> Self {
        let ext4 = Arc::new(Ext4Tools);
        Backends {
            network: Arc::new(IpCommandController),
            mounter: Arc::new(LoopMounter),
            resizer: ext4.clone(),
            formatter: ext4,
            exporter: Arc::new(DockerExporter::default()),
            supervisor: Arc::new(FirecrackerSupervisor::new(
                config.firecracker.binary.clone(),
                config.paths().logs,
                Duration::from_secs(config.firecracker.boot_timeout_secs),
            )),
        }
    }
}

/// Stop timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleSettings {
    /// How long a guest gets to shut down after Ctrl+Alt+Del.
    pub stop_timeout: Duration,
    /// How long to wait for the process to disappear after SIGKILL.
    pub kill_grace: Duration,
    pub poll_interval: Duration,
}

impl LifecycleSettings {
    pub fn from_config(config: &FirecrackerConfig) -> Self {
        LifecycleSettings {
            stop_timeout: Duration::from_secs(config.stop_timeout_secs),
            kill_grace: Duration::from_secs(2),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Where the default kernel and rootfs live once downloaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseImages {
    pub kernel: PathBuf,
    pub rootfs: PathBuf,
}

/// A mount declaration as the guest sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountInfo {
    pub tag: String,
    pub host_path: PathBuf,
    pub guest_path: String,
    pub device: String,
    pub read_only: bool,
    pub image_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    Started,
    Stopped,
    Skipped(String),
    Failed(String),
}

impl BatchOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(self, BatchOutcome::Started | BatchOutcome::Stopped)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchEntry {
    pub name: String,
    pub outcome: BatchOutcome,
}

/// Per-VM results of autostart or autostop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub entries: Vec<BatchEntry>,
}

impl BatchReport {
    fn push(&mut self, name: String, outcome: BatchOutcome) {
        self.entries.push(BatchEntry { name, outcome });
    }

    pub fn succeeded(&self) -> usize {
        self.entries.iter().filter(|e| e.outcome.succeeded()).count()
    }

    pub fn failed(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e.outcome, BatchOutcome::Failed(_)))
            .count()
    }

    pub fn outcome(&self, name: &str) -> Option<&BatchOutcome> {
        self.entries.iter().find(|e| e.name == name).map(|e| &e.outcome)
    }
}

fn mark_stopped(record: &mut VmRecord) {
    record.state = VmState::Stopped;
    record.pid = 0;
    record.ip_address = None;
    record.stopped_at = Some(Utc::now());
}

fn remove_quietly(path: &Path, what: &str) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to remove {what}"),
    }
}

pub struct VmService {
    paths: Paths,
    store: Arc<dyn VmStore>,
    network: NetworkService,
    images: Arc<ImageService>,
    storage: Arc<StorageService>,
    mounts: MountService,
    supervisor: Arc<dyn HypervisorSupervisor>,
    lifecycle: LifecycleSettings,
}

impl VmService {
    pub fn new(config: &Config, backends: Backends) -> Result<Self, VmServiceError> {
        let paths = config.paths();
        paths.ensure_directories().map_err(|e| {
            VmServiceError::Io(format!("cannot create {}: {e}", config.data_dir.display()))
        })?;

        let network = NetworkService::new(backends.network, config.network.clone())?;
        let images = Arc::new(ImageService::new(
            paths.clone(),
            config.images.clone(),
            backends.exporter,
            backends.formatter.clone(),
        )?);
        let default_dns = if config.network.dns_servers.is_empty() {
            DEFAULT_DNS_SERVERS.iter().map(|s| s.to_string()).collect()
        } else {
            config.network.dns_servers.clone()
        };
        let storage = Arc::new(StorageService::new(
            paths.clone(),
            images.clone(),
            backends.mounter,
            backends.resizer,
            ImageLocks::new(paths.locks.clone(), image_lock::DEFAULT_TIMEOUT),
            default_dns,
        ));
        let mounts = MountService::new(paths.clone(), storage.clone(), backends.formatter);

        Ok(VmService {
            store: Arc::new(FileStore::new(paths.vms.clone())),
            paths,
            network,
            images,
            storage,
            mounts,
            supervisor: backends.supervisor,
            lifecycle: LifecycleSettings::from_config(&config.firecracker),
        })
    }

    pub fn with_lifecycle(mut self, lifecycle: LifecycleSettings) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    pub fn images(&self) -> &ImageService {
        &self.images
    }

    pub fn network(&self) -> &NetworkService {
        &self.network
    }

    // --- Records ---

    /// Validate `params` and persist a new record in the `created` state.
    ///
    /// Named images and kernels must already exist; the defaults are fetched
    /// on first start.
    pub fn create(&self, params: CreateVmParams) -> Result<VmRecord, VmServiceError> {
        params.validate().map_err(VmServiceError::Validation)?;
        if let Some(image) = params.image.as_deref().filter(|s| !s.is_empty()) {
            self.images.resolve_image(Some(image))?;
        }
        if let Some(kernel) = params.kernel.as_deref().filter(|s| !s.is_empty()) {
            self.images.resolve_kernel(Some(kernel))?;
        }
        for mount in &params.mounts {
            if !mount.host_path.is_dir() {
                return Err(VmServiceError::Validation(format!(
                    "mount source {} is not a directory",
                    mount.host_path.display()
                )));
            }
        }

        let record = VmRecord::new(&params, &self.paths.sockets);
        self.store.create(&record)?;
        tracing::info!(vm_name = %record.name, id = %record.id, tap = %record.tap_device, "created VM");
        Ok(record)
    }

    pub fn get(&self, name: &str) -> Result<VmRecord, VmServiceError> {
        let record = self.store.load(name)?;
        Ok(self.reconcile(record))
    }

    /// Every record, reconciled, oldest first.
    pub fn list(&self) -> Result<Vec<VmRecord>, VmServiceError> {
        Ok(self
            .store
            .list()?
            .into_iter()
            .map(|record| self.reconcile(record))
            .collect())
    }

    /// Mark a record whose hypervisor process has gone away as stopped and
    /// release what it held. An `Unknown` probe leaves the record alone.
    fn reconcile(&self, mut record: VmRecord) -> VmRecord {
        if !record.state.expects_process() {
            return record;
        }
        let liveness = if record.pid == 0 {
            Liveness::Dead
        } else {
            self.supervisor.is_alive(record.pid)
        };
        if liveness != Liveness::Dead {
            return record;
        }

        tracing::info!(vm_name = %record.name, pid = record.pid, "hypervisor process is gone, marking VM stopped");
        self.release_runtime(&record);
        mark_stopped(&mut record);
        if let Err(e) = self.store.save(&record) {
            tracing::warn!(vm_name = %record.name, error = %e, "failed to persist reconciled state");
        }
        record
    }

    /// Best-effort removal of the port forwards, tap, and control socket.
    fn release_runtime(&self, record: &VmRecord) {
        if let Some(ip) = record.ip_address.as_deref().and_then(|ip| ip.parse::<Ipv4Addr>().ok()) {
            for pf in &record.port_forwards {
                if let Err(e) =
                    self.network
                        .remove_port_forward(pf.host_port, pf.guest_port, ip, pf.protocol)
                {
                    tracing::warn!(vm_name = %record.name, host_port = pf.host_port, error = %e, "failed to remove port forward");
                }
            }
        }
        if let Err(e) = self.network.delete_interface(&record.tap_device) {
            tracing::warn!(vm_name = %record.name, tap = %record.tap_device, error = %e, "failed to delete tap interface");
        }
        remove_quietly(&record.socket_path, "control socket");
    }

    // --- Start ---

    /// Provision and boot a VM.
    ///
    /// Any failure after the record enters `starting` leaves it persisted in
    /// `error` with the message in `last_error`.
    pub async fn start(&self, name: &str) -> Result<VmRecord, VmServiceError> {
        let mut record = self.get(name)?;
        if record.state.expects_process() {
            return Err(VmServiceError::AlreadyRunning(name.to_string()));
        }
        record.state = VmState::Starting;
        record.last_error = None;
        self.store.save(&record)?;
        tracing::info!(vm_name = %name, "starting VM");

        if let Err(e) = self.provision_and_boot(&mut record).await {
            tracing::warn!(vm_name = %name, error = %e, "VM failed to start");
            record.state = VmState::Error;
            record.last_error = Some(e.to_string());
            record.pid = 0;
            record.ip_address = None;
            if let Err(save) = self.store.save(&record) {
                tracing::warn!(vm_name = %name, error = %save, "failed to persist error state");
            }
            return Err(e);
        }
        Ok(record)
    }

    async fn provision_and_boot(&self, record: &mut VmRecord) -> Result<(), VmServiceError> {
        if record.image.is_none() || record.kernel.is_none() {
            self.images.ensure_base_images().await?;
        }
        let kernel_path = self.images.resolve_kernel(record.kernel.as_deref())?;
        let rootfs = self.storage.materialize_instance(
            &record.name,
            record.image.as_deref(),
            record.disk_size_mb,
        )?;
        record.kernel_path = Some(kernel_path.clone());
        record.rootfs_path = Some(rootfs.clone());

        self.storage
            .inject_ssh_key(&rootfs, record.ssh_public_key.as_deref())?;
        self.storage.inject_dns_config(&rootfs, &record.dns_servers)?;
        let drives = self.attach_mounts(record, &rootfs)?;
        self.store.save(record)?;

        self.network.ensure_bridge()?;
        self.network.create_interface(&record.tap_device)?;
        if let Err(e) = self.boot(record, kernel_path, rootfs, drives) {
            if let Err(cleanup) = self.network.delete_interface(&record.tap_device) {
                tracing::warn!(tap = %record.tap_device, error = %cleanup, "failed to remove tap after failed boot");
            }
            return Err(e);
        }
        self.apply_port_forwards(record);
        Ok(())
    }

    /// Build missing mount images and rewrite the guest fstab. Returns the
    /// extra drives in slot order.
    fn attach_mounts(&self, record: &mut VmRecord, rootfs: &Path) -> Result<Vec<DriveSpec>, VmServiceError> {
        if record.mounts.is_empty() {
            return Ok(Vec::new());
        }
        let mut drives = Vec::with_capacity(record.mounts.len());
        let mut entries = Vec::with_capacity(record.mounts.len());
        for (index, mount) in record.mounts.iter_mut().enumerate() {
            let path = self.mounts.create_mount_image(mount, &record.name)?;
            drives.push(DriveSpec {
                drive_id: format!("mount_{}", mount.tag),
                path,
                read_only: mount.read_only,
            });
            entries.push(FstabEntry {
                device: device_for_mount(index),
                mount_point: mount.guest_mount_point(),
                read_only: mount.read_only,
            });
        }
        self.storage.inject_mount_table(rootfs, &entries)?;
        Ok(drives)
    }

    fn boot(
        &self,
        record: &mut VmRecord,
        kernel_path: PathBuf,
        rootfs_path: PathBuf,
        drives: Vec<DriveSpec>,
    ) -> Result<(), VmServiceError> {
        // The address follows the record's position in creation order, so it
        // moves when an older VM is deleted
        let index = self
            .store
            .list()?
            .iter()
            .position(|r| r.name == record.name)
            .ok_or_else(|| VmServiceError::NotFound(format!("VM '{}' not found", record.name)))?;
        let guest_ip = self.network.allocate_address(index)?;
        record.ip_address = Some(guest_ip.to_string());

        let request = BootRequest {
            vm_name: record.name.clone(),
            kernel_path,
            rootfs_path,
            cpus: record.cpus,
            memory_mb: record.memory_mb,
            tap_device: record.tap_device.clone(),
            mac_address: record.mac_address.clone(),
            guest_ip,
            gateway: self.network.gateway(),
            netmask: self.network.netmask(),
            drives,
            socket_path: record.socket_path.clone(),
        };
        let handle = self.supervisor.start(&request)?;

        record.pid = handle.pid;
        record.socket_path = handle.socket_path;
        record.state = VmState::Running;
        record.started_at = Some(Utc::now());
        record.stopped_at = None;
        if let Err(e) = self.store.save(record) {
            if let Err(kill) = self.supervisor.kill(handle.pid) {
                tracing::warn!(pid = handle.pid, error = %kill, "failed to kill unrecorded hypervisor");
            }
            return Err(e.into());
        }
        tracing::info!(vm_name = %record.name, pid = record.pid, ip = %guest_ip, "VM running");
        Ok(())
    }

    /// Install every recorded port forward for the current address.
    fn apply_port_forwards(&self, record: &VmRecord) {
        let Some(ip) = record.live_ip().and_then(|ip| ip.parse::<Ipv4Addr>().ok()) else {
            return;
        };
        for pf in &record.port_forwards {
            if let Err(e) = self
                .network
                .add_port_forward(pf.host_port, pf.guest_port, ip, pf.protocol)
            {
                tracing::warn!(vm_name = %record.name, host_port = pf.host_port, error = %e, "failed to restore port forward");
            }
        }
    }

    // --- Stop ---

    /// Ask the guest to shut down, kill it if it does not, then release its
    /// tap, forwards, and socket.
    pub async fn stop(&self, name: &str) -> Result<VmRecord, VmServiceError> {
        let mut record = self.get(name)?;
        if !record.state.expects_process() {
            return Err(VmServiceError::NotRunning(name.to_string()));
        }
        record.state = VmState::Stopping;
        self.store.save(&record)?;
        tracing::info!(vm_name = %name, pid = record.pid, "stopping VM");

        if let Err(e) = self
            .supervisor
            .stop(&record.socket_path, self.lifecycle.stop_timeout)
            .await
        {
            tracing::warn!(vm_name = %name, error = %e, "graceful shutdown request failed");
        }
        if !self.wait_for_exit(record.pid, self.lifecycle.stop_timeout).await {
            tracing::warn!(vm_name = %name, pid = record.pid, "guest did not shut down in time, killing");
            if let Err(e) = self.supervisor.kill(record.pid) {
                tracing::warn!(vm_name = %name, error = %e, "failed to kill hypervisor");
            }
            if !self.wait_for_exit(record.pid, self.lifecycle.kill_grace).await {
                return Err(VmServiceError::ExternalTool {
                    tool: "firecracker".to_string(),
                    output: format!("process {} is still alive after SIGKILL", record.pid),
                });
            }
        }

        self.release_runtime(&record);
        mark_stopped(&mut record);
        self.store.save(&record)?;
        tracing::info!(vm_name = %name, "VM stopped");
        Ok(record)
    }

    async fn wait_for_exit(&self, pid: u32, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.supervisor.is_alive(pid) == Liveness::Dead {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(self.lifecycle.poll_interval).await;
        }
    }

    // --- Delete ---

    /// Remove a VM and everything it owns. A running VM needs `force`.
    ///
    /// Artifact cleanup is best-effort; only failing to remove the record
    /// itself is an error.
    pub async fn delete(&self, name: &str, force: bool) -> Result<(), VmServiceError> {
        let mut record = self.get(name)?;
        if record.state.expects_process() {
            if !force {
                return Err(VmServiceError::AlreadyRunning(name.to_string()));
            }
            record = self.stop(name).await?;
        }

        self.release_runtime(&record);
        if let Err(e) = self.storage.delete_instance(name) {
            tracing::warn!(vm_name = %name, error = %e, "failed to remove root filesystem");
        }
        self.mounts.delete_mount_images(name, &record.mounts);
        remove_quietly(&self.paths.logs.join(format!("{name}.log")), "log file");
        remove_quietly(&self.paths.logs.join(format!("{name}.json")), "hypervisor config");

        self.store.delete(name)?;
        tracing::info!(vm_name = %name, "deleted VM");
        Ok(())
    }

    // --- Port forwards ---

    pub fn add_port_forward(
        &self,
        name: &str,
        host_port: u16,
        guest_port: u16,
        protocol: Protocol,
    ) -> Result<PortForward, VmServiceError> {
        if host_port == 0 || guest_port == 0 {
            return Err(VmServiceError::Validation("ports must be between 1 and 65535".to_string()));
        }
        let mut record = self.get(name)?;
        let Some(ip) = record.live_ip().and_then(|ip| ip.parse::<Ipv4Addr>().ok()) else {
            return Err(VmServiceError::NotRunning(name.to_string()));
        };
        for other in self.store.list()? {
            let taken = other
                .port_forwards
                .iter()
                .any(|pf| pf.host_port == host_port && pf.protocol == protocol);
            if taken {
                return Err(VmServiceError::Conflict(format!(
                    "host port {host_port}/{protocol} is already forwarded to VM '{}'",
                    other.name
                )));
            }
        }

        self.network
            .add_port_forward(host_port, guest_port, ip, protocol)?;
        let forward = PortForward {
            host_port,
            guest_port,
            protocol,
        };
        record.port_forwards.push(forward.clone());
        if let Err(e) = self.store.save(&record) {
            if let Err(undo) = self.network.remove_port_forward(host_port, guest_port, ip, protocol) {
                tracing::warn!(vm_name = %name, error = %undo, "failed to roll back port forward");
            }
            return Err(e.into());
        }
        tracing::info!(vm_name = %name, host_port, guest_port, protocol = %protocol, "added port forward");
        Ok(forward)
    }

    // --- Mounts ---

    pub fn list_mounts(&self, name: &str) -> Result<Vec<MountInfo>, VmServiceError> {
        let record = self.get(name)?;
        Ok(record
            .mounts
            .iter()
            .enumerate()
            .map(|(index, m)| MountInfo {
                tag: m.tag.clone(),
                host_path: m.host_path.clone(),
                guest_path: m.guest_mount_point(),
                device: device_for_mount(index),
                read_only: m.read_only,
                image_path: m.image_path.clone(),
            })
            .collect())
    }

    /// Rebuild one mount image from its host directory. The VM must be
    /// stopped since the image may be attached as a live block device.
    pub fn sync_mount(&self, name: &str, tag: &str) -> Result<PathBuf, VmServiceError> {
        let mut record = self.get(name)?;
        if record.state.expects_process() {
            return Err(VmServiceError::AlreadyRunning(name.to_string()));
        }
        let mount = record
            .mounts
            .iter_mut()
            .find(|m| m.tag == tag)
            .ok_or_else(|| VmServiceError::NotFound(format!("mount '{tag}' not found on VM '{name}'")))?;
        let path = self.mounts.sync_mount_image(mount, name)?;
        self.store.save(&record)?;
        tracing::info!(vm_name = %name, tag = %tag, "synced mount image");
        Ok(path)
    }

    // --- Batch ---

    /// Start every stopped VM flagged for auto-start. One VM's failure does
    /// not keep the rest from being attempted.
    pub async fn autostart(&self) -> Result<BatchReport, VmServiceError> {
        if let Err(e) = self.network.ensure_bridge() {
            tracing::warn!(error = %e, "failed to set up bridge before autostart");
        }
        let mut report = BatchReport::default();
        for record in self.list()? {
            let outcome = if !record.auto_start {
                BatchOutcome::Skipped("auto-start disabled".to_string())
            } else if record.state.expects_process() {
                BatchOutcome::Skipped("already running".to_string())
            } else {
                match self.start(&record.name).await {
                    Ok(_) => BatchOutcome::Started,
                    Err(e) => BatchOutcome::Failed(e.to_string()),
                }
            };
            report.push(record.name, outcome);
        }
        Ok(report)
    }

    /// Stop every running VM, whatever its auto-start flag.
    pub async fn autostop(&self) -> Result<BatchReport, VmServiceError> {
        let mut report = BatchReport::default();
        for record in self.list()? {
            if !record.state.expects_process() {
                continue;
            }
            let outcome = match self.stop(&record.name).await {
                Ok(_) => BatchOutcome::Stopped,
                Err(e) => BatchOutcome::Failed(e.to_string()),
            };
            report.push(record.name, outcome);
        }
        Ok(report)
    }

    // --- Images and kernels ---

    pub fn list_images(&self) -> Result<Vec<ImageInfo>, VmServiceError> {
        Ok(self.images.list_images()?)
    }

    /// Download the default kernel and rootfs if they are missing.
    pub async fn pull_base_images(&self) -> Result<BaseImages, VmServiceError> {
        self.images.ensure_base_images().await?;
        Ok(BaseImages {
            kernel: self.images.default_kernel_path(),
            rootfs: self.images.default_rootfs_path(),
        })
    }

    pub fn import_image(
        &self,
        image_ref: &str,
        name: &str,
        size_mb: Option<u64>,
    ) -> Result<ImageInfo, VmServiceError> {
        Ok(self.images.import_container(image_ref, name, size_mb)?)
    }

    /// Delete a base image no VM refers to. VMs without an image refer to
    /// the default one.
    pub fn delete_image(&self, name: &str) -> Result<(), VmServiceError> {
        let users: Vec<String> = self
            .store
            .list()?
            .into_iter()
            .filter(|r| r.image.as_deref().unwrap_or(DEFAULT_IMAGE) == name)
            .map(|r| r.name)
            .collect();
        self.images.delete_image(name, &users)?;
        Ok(())
    }

    pub fn list_kernels(&self) -> Result<Vec<KernelInfo>, VmServiceError> {
        Ok(self.images.list_kernels()?)
    }

    pub fn import_kernel(&self, source: &Path, name: &str, force: bool) -> Result<KernelInfo, VmServiceError> {
        Ok(self.images.import_kernel(source, name, force)?)
    }

    pub fn delete_kernel(&self, name: &str) -> Result<(), VmServiceError> {
        let users: Vec<String> = self
            .store
            .list()?
            .into_iter()
            .filter(|r| r.kernel.as_deref() == Some(name))
            .map(|r| r.name)
            .collect();
        if !users.is_empty() {
            return Err(VmServiceError::Conflict(format!(
                "kernel '{name}' is used by VM(s): {}",
                users.join(", ")
            )));
        }
        self.images.delete_kernel(name)?;
        Ok(())
    }
}
