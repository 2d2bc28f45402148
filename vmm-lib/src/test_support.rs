// SPDX-License-Identifier: GPL-2.0-only

//! In-process fakes for every host capability, and a `TestEnv` that wires a
//! `VmService` over them in a temporary data directory.

use crate::backend::{
    BackendError, ContainerExporter, FilesystemFormatter, FilesystemResizer, LoopImageMounter,
};
use crate::config::{Config, ImagesConfig, NetworkConfig, Paths};
use crate::hypervisor::{BootHandle, BootRequest, HypervisorError, HypervisorSupervisor, Liveness};
use crate::image_service::{DEFAULT_KERNEL_NAME, DEFAULT_ROOTFS_NAME};
use crate::network_service::{FirewallRule, NetworkDeviceController, NetworkError};
use crate::tool::ToolError;
use crate::vm::{CreateVmParams, VmRecord};
use crate::vm_service::{Backends, LifecycleSettings, VmService};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn injected(tool: &str) -> ToolError {
    ToolError::new(tool, "injected failure")
}

// --- Network ---

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FakeLink {
    pub is_bridge: bool,
    pub up: bool,
    pub master: Option<String>,
    pub address: Option<String>,
}

#[derive(Default)]
struct NetState {
    links: HashMap<String, FakeLink>,
    rules: Vec<FirewallRule>,
    bridges_created: usize,
    taps_created: usize,
    forwarding_enabled: usize,
    fail_on: HashSet<String>,
}

/// Records link and firewall state in memory.
#[derive(Default)]
pub struct FakeNetworkController {
    state: Mutex<NetState>,
}

impl FakeNetworkController {
    /// Make every later call of operation `op` fail.
    pub fn fail_on(&self, op: &str) {
        locked(&self.state).fail_on.insert(op.to_string());
    }

    pub fn clear_failures(&self) {
        locked(&self.state).fail_on.clear();
    }

    pub fn link(&self, name: &str) -> Option<FakeLink> {
        locked(&self.state).links.get(name).cloned()
    }

    pub fn bridge_address(&self, name: &str) -> Option<String> {
        self.link(name).and_then(|l| l.address)
    }

    pub fn bridges_created(&self) -> usize {
        locked(&self.state).bridges_created
    }

    pub fn taps_created(&self) -> usize {
        locked(&self.state).taps_created
    }

    pub fn forwarding_enabled_count(&self) -> usize {
        locked(&self.state).forwarding_enabled
    }

    pub fn rules(&self) -> Vec<FirewallRule> {
        locked(&self.state).rules.clone()
    }

    /// Port-forward rules only.
    pub fn port_forwards(&self) -> Vec<FirewallRule> {
        self.rules()
            .into_iter()
            .filter(|r| matches!(r, FirewallRule::PortForward { .. }))
            .collect()
    }

    /// Simulate an external `iptables -F`.
    pub fn flush_rules(&self) {
        locked(&self.state).rules.clear();
    }

    fn check(&self, state: &NetState, op: &str) -> Result<(), NetworkError> {
        if state.fail_on.contains(op) {
            return Err(injected(op).into());
        }
        Ok(())
    }
}

impl NetworkDeviceController for FakeNetworkController {
    fn link_exists(&self, name: &str) -> Result<bool, NetworkError> {
        let state = locked(&self.state);
        self.check(&state, "link_exists")?;
        Ok(state.links.contains_key(name))
    }

    fn create_bridge(&self, name: &str, address: &str) -> Result<(), NetworkError> {
        let mut state = locked(&self.state);
        self.check(&state, "create_bridge")?;
        state.bridges_created += 1;
        state.links.insert(
            name.to_string(),
            FakeLink {
                is_bridge: true,
                address: Some(address.to_string()),
                ..FakeLink::default()
            },
        );
        Ok(())
    }

    fn create_tap(&self, name: &str) -> Result<(), NetworkError> {
        let mut state = locked(&self.state);
        self.check(&state, "create_tap")?;
        state.taps_created += 1;
        state.links.insert(name.to_string(), FakeLink::default());
        Ok(())
    }

    fn set_master(&self, name: &str, bridge: &str) -> Result<(), NetworkError> {
        let mut state = locked(&self.state);
        self.check(&state, "set_master")?;
        let link = state
            .links
            .get_mut(name)
            .ok_or_else(|| NetworkError::Tool(ToolError::new("ip", format!("no device {name}"))))?;
        link.master = Some(bridge.to_string());
        Ok(())
    }

    fn set_up(&self, name: &str) -> Result<(), NetworkError> {
        let mut state = locked(&self.state);
        self.check(&state, "set_up")?;
        let link = state
            .links
            .get_mut(name)
            .ok_or_else(|| NetworkError::Tool(ToolError::new("ip", format!("no device {name}"))))?;
        link.up = true;
        Ok(())
    }

    fn delete_link(&self, name: &str) -> Result<(), NetworkError> {
        let mut state = locked(&self.state);
        self.check(&state, "delete_link")?;
        state.links.remove(name);
        Ok(())
    }

    fn enable_ip_forwarding(&self) -> Result<(), NetworkError> {
        let mut state = locked(&self.state);
        self.check(&state, "enable_ip_forwarding")?;
        state.forwarding_enabled += 1;
        Ok(())
    }

    fn rule_exists(&self, rule: &FirewallRule) -> Result<bool, NetworkError> {
        let state = locked(&self.state);
        self.check(&state, "rule_exists")?;
        Ok(state.rules.contains(rule))
    }

    fn append_rule(&self, rule: &FirewallRule) -> Result<(), NetworkError> {
        let mut state = locked(&self.state);
        self.check(&state, "append_rule")?;
        state.rules.push(rule.clone());
        Ok(())
    }

    fn delete_rule(&self, rule: &FirewallRule) -> Result<(), NetworkError> {
        let mut state = locked(&self.state);
        self.check(&state, "delete_rule")?;
        match state.rules.iter().position(|r| r == rule) {
            Some(i) => {
                state.rules.remove(i);
                Ok(())
            }
            None => Err(ToolError::new("iptables", "Bad rule (does a matching rule exist in that chain?)").into()),
        }
    }
}

// --- Storage ---

#[derive(Default)]
struct MountState {
    mounts: usize,
    unmounts: usize,
    active: HashMap<PathBuf, PathBuf>,
    fail_mount: bool,
    fail_unmount: bool,
}

/// Stands in for loop mounts with symlinks.
///
/// Each image path owns a persistent contents directory. Mounting replaces
/// the (empty) mount point with a symlink to it; unmounting puts the empty
/// directory back.
pub struct FakeLoopMounter {
    root: tempfile::TempDir,
    state: Mutex<MountState>,
}

impl Default for FakeLoopMounter {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeLoopMounter {
    pub fn new() -> Self {
        FakeLoopMounter {
            root: tempfile::tempdir().expect("failed to create fake mount root"),
            state: Mutex::new(MountState::default()),
        }
    }

    /// The directory holding `image`'s filesystem contents.
    pub fn contents(&self, image: &Path) -> PathBuf {
        let key = image.to_string_lossy().replace('/', "_");
        let dir = self.root.path().join(key);
        std::fs::create_dir_all(&dir).expect("failed to create fake image contents");
        dir
    }

    pub fn mount_count(&self) -> usize {
        locked(&self.state).mounts
    }

    pub fn unmount_count(&self) -> usize {
        locked(&self.state).unmounts
    }

    pub fn active_mounts(&self) -> usize {
        locked(&self.state).active.len()
    }

    pub fn fail_mount(&self, fail: bool) {
        locked(&self.state).fail_mount = fail;
    }

    /// Make unmounts fail while leaving the image mounted.
    pub fn fail_unmount(&self, fail: bool) {
        locked(&self.state).fail_unmount = fail;
    }
}

impl LoopImageMounter for FakeLoopMounter {
    fn mount(&self, image: &Path, mount_point: &Path) -> Result<(), BackendError> {
        if locked(&self.state).fail_mount {
            return Err(injected("mount").into());
        }
        let contents = self.contents(image);
        std::fs::remove_dir(mount_point)
            .and_then(|_| std::os::unix::fs::symlink(&contents, mount_point))
            .map_err(|e| BackendError::Io(format!("fake mount {}: {e}", mount_point.display())))?;
        let mut state = locked(&self.state);
        state.mounts += 1;
        state.active.insert(mount_point.to_path_buf(), image.to_path_buf());
        Ok(())
    }

    fn unmount(&self, mount_point: &Path) -> Result<(), BackendError> {
        let mut state = locked(&self.state);
        if state.fail_unmount {
            return Err(injected("umount").into());
        }
        if state.active.remove(mount_point).is_none() {
            return Err(ToolError::new("umount", format!("{}: not mounted", mount_point.display())).into());
        }
        state.unmounts += 1;
        std::fs::remove_file(mount_point)
            .and_then(|_| std::fs::create_dir(mount_point))
            .map_err(|e| BackendError::Io(format!("fake unmount {}: {e}", mount_point.display())))
    }
}

#[derive(Default)]
struct ResizerState {
    checked: Vec<PathBuf>,
    grown: Vec<PathBuf>,
    fail_check: bool,
    fail_grow: bool,
}

#[derive(Default)]
pub struct FakeFilesystemResizer {
    state: Mutex<ResizerState>,
}

impl FakeFilesystemResizer {
    pub fn checked(&self) -> Vec<PathBuf> {
        locked(&self.state).checked.clone()
    }

    pub fn grown(&self) -> Vec<PathBuf> {
        locked(&self.state).grown.clone()
    }

    pub fn fail_check(&self, fail: bool) {
        locked(&self.state).fail_check = fail;
    }

    pub fn fail_grow(&self, fail: bool) {
        locked(&self.state).fail_grow = fail;
    }
}

impl FilesystemResizer for FakeFilesystemResizer {
    fn check(&self, image: &Path) -> Result<(), BackendError> {
        let mut state = locked(&self.state);
        state.checked.push(image.to_path_buf());
        if state.fail_check {
            return Err(injected("e2fsck").into());
        }
        Ok(())
    }

    fn grow(&self, image: &Path) -> Result<(), BackendError> {
        let mut state = locked(&self.state);
        if state.fail_grow {
            return Err(injected("resize2fs").into());
        }
        state.grown.push(image.to_path_buf());
        Ok(())
    }
}

#[derive(Default)]
struct FormatterState {
    formatted: Vec<(PathBuf, String)>,
    builds: Vec<(PathBuf, u64)>,
    fail_format: bool,
}

/// Records formats; `build_from_dir` produces a sparse file of the
/// requested size.
#[derive(Default)]
pub struct FakeFilesystemFormatter {
    state: Mutex<FormatterState>,
}

impl FakeFilesystemFormatter {
    pub fn formatted(&self) -> Vec<(PathBuf, String)> {
        locked(&self.state).formatted.clone()
    }

    pub fn builds(&self) -> Vec<(PathBuf, u64)> {
        locked(&self.state).builds.clone()
    }

    pub fn fail_format(&self, fail: bool) {
        locked(&self.state).fail_format = fail;
    }
}

impl FilesystemFormatter for FakeFilesystemFormatter {
    fn format(&self, image: &Path, label: &str) -> Result<(), BackendError> {
        let mut state = locked(&self.state);
        if state.fail_format {
            return Err(injected("mkfs.ext4").into());
        }
        state.formatted.push((image.to_path_buf(), label.to_string()));
        Ok(())
    }

    fn build_from_dir(&self, source_dir: &Path, image: &Path, size_bytes: u64) -> Result<(), BackendError> {
        if !source_dir.is_dir() {
            return Err(BackendError::NotFound(source_dir.display().to_string()));
        }
        let mut state = locked(&self.state);
        if state.fail_format {
            return Err(injected("mke2fs").into());
        }
        std::fs::File::create(image)
            .and_then(|f| f.set_len(size_bytes))
            .map_err(|e| BackendError::Io(format!("fake build {}: {e}", image.display())))?;
        state.builds.push((image.to_path_buf(), size_bytes));
        Ok(())
    }
}

/// Writes a fixed file set into the export directory.
pub struct FakeContainerExporter {
    files: Mutex<Vec<(String, String)>>,
    exported: Mutex<Vec<String>>,
    fail: Mutex<bool>,
}

impl FakeContainerExporter {
    /// A minimal Debian tree with systemd's ssh unit and sshd config.
    pub fn debian() -> Self {
        let files = [
            ("etc/debian_version", "12.5\n"),
            ("etc/ssh/sshd_config", "#PermitRootLogin prohibit-password\n"),
            ("etc/shadow", "root:*:19000:0:99999:7:::\n"),
            ("lib/systemd/system/ssh.service", "[Unit]\nDescription=OpenBSD Secure Shell server\n"),
        ];
        FakeContainerExporter {
            files: Mutex::new(files.iter().map(|(p, c)| (p.to_string(), c.to_string())).collect()),
            exported: Mutex::new(Vec::new()),
            fail: Mutex::new(false),
        }
    }

    /// Replace the exported tree.
    pub fn set_files(&self, files: Vec<(&str, &str)>) {
        *locked(&self.files) = files.into_iter().map(|(p, c)| (p.to_string(), c.to_string())).collect();
    }

    pub fn fail_export(&self, fail: bool) {
        *locked(&self.fail) = fail;
    }

    pub fn exported(&self) -> Vec<String> {
        locked(&self.exported).clone()
    }
}

impl ContainerExporter for FakeContainerExporter {
    fn export(&self, image_ref: &str, dest_dir: &Path) -> Result<(), BackendError> {
        if *locked(&self.fail) {
            return Err(ToolError::new("docker", format!("Unable to find image '{image_ref}' locally")).into());
        }
        for (rel, content) in locked(&self.files).iter() {
            let path = dest_dir.join(rel);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| BackendError::Io(format!("{}: {e}", parent.display())))?;
            }
            std::fs::write(&path, content)
                .map_err(|e| BackendError::Io(format!("{}: {e}", path.display())))?;
        }
        locked(&self.exported).push(image_ref.to_string());
        Ok(())
    }
}

// --- Hypervisor ---

struct SupervisorState {
    next_pid: u32,
    processes: HashMap<u32, PathBuf>,
    starts: Vec<BootRequest>,
    stops: Vec<PathBuf>,
    kills: Vec<u32>,
    fail_start: HashSet<String>,
    unknown: HashSet<u32>,
    ignore_shutdown: bool,
}

/// Fake guests: a pid is alive from `start` until a graceful stop, a kill,
/// or `crash`.
pub struct FakeSupervisor {
    state: Mutex<SupervisorState>,
}

impl Default for FakeSupervisor {
    fn default() -> Self {
        FakeSupervisor {
            state: Mutex::new(SupervisorState {
                next_pid: 1000,
                processes: HashMap::new(),
                starts: Vec::new(),
                stops: Vec::new(),
                kills: Vec::new(),
                fail_start: HashSet::new(),
                unknown: HashSet::new(),
                ignore_shutdown: false,
            }),
        }
    }
}

impl FakeSupervisor {
    /// Make boots of `vm_name` fail.
    pub fn fail_start(&self, vm_name: &str) {
        locked(&self.state).fail_start.insert(vm_name.to_string());
    }

    /// Guests keep running after Ctrl+Alt+Del until killed.
    pub fn ignore_shutdown(&self, ignore: bool) {
        locked(&self.state).ignore_shutdown = ignore;
    }

    /// Probes of `pid` fail without saying whether it lives.
    pub fn obscure(&self, pid: u32) {
        locked(&self.state).unknown.insert(pid);
    }

    /// The process dies behind the manager's back.
    pub fn crash(&self, pid: u32) {
        locked(&self.state).processes.remove(&pid);
    }

    pub fn starts(&self) -> Vec<BootRequest> {
        locked(&self.state).starts.clone()
    }

    pub fn stops(&self) -> Vec<PathBuf> {
        locked(&self.state).stops.clone()
    }

    pub fn kills(&self) -> Vec<u32> {
        locked(&self.state).kills.clone()
    }

    pub fn running(&self) -> usize {
        locked(&self.state).processes.len()
    }
}

#[async_trait::async_trait]
impl HypervisorSupervisor for FakeSupervisor {
    fn start(&self, request: &BootRequest) -> Result<BootHandle, HypervisorError> {
        let mut state = locked(&self.state);
        state.starts.push(request.clone());
        if state.fail_start.contains(&request.vm_name) {
            return Err(HypervisorError::BootFailed(format!(
                "{}: injected failure",
                request.vm_name
            )));
        }
        if let Some(parent) = request.socket_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| HypervisorError::Io(e.to_string()))?;
        }
        std::fs::write(&request.socket_path, b"").map_err(|e| HypervisorError::Io(e.to_string()))?;
        let pid = state.next_pid;
        state.next_pid += 1;
        state.processes.insert(pid, request.socket_path.clone());
        Ok(BootHandle {
            pid,
            socket_path: request.socket_path.clone(),
        })
    }

    async fn stop(&self, socket_path: &Path, _timeout: Duration) -> Result<(), HypervisorError> {
        let mut state = locked(&self.state);
        state.stops.push(socket_path.to_path_buf());
        if !state.ignore_shutdown {
            state.processes.retain(|_, sock| sock != socket_path);
        }
        Ok(())
    }

    fn is_alive(&self, pid: u32) -> Liveness {
        let state = locked(&self.state);
        if state.unknown.contains(&pid) {
            Liveness::Unknown
        } else if state.processes.contains_key(&pid) {
            Liveness::Alive
        } else {
            Liveness::Dead
        }
    }

    fn kill(&self, pid: u32) -> Result<(), HypervisorError> {
        let mut state = locked(&self.state);
        state.kills.push(pid);
        state.processes.remove(&pid);
        Ok(())
    }
}

// --- Wiring ---

/// A `VmService` over fakes in a temporary data directory, with the default
/// kernel and rootfs already present so no download happens.
pub struct TestEnv {
    pub dir: tempfile::TempDir,
    pub config: Config,
    pub network: Arc<FakeNetworkController>,
    pub mounter: Arc<FakeLoopMounter>,
    pub resizer: Arc<FakeFilesystemResizer>,
    pub formatter: Arc<FakeFilesystemFormatter>,
    pub exporter: Arc<FakeContainerExporter>,
    pub supervisor: Arc<FakeSupervisor>,
    pub service: VmService,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::build(None)
    }

    /// No base images on disk; downloads go to the URLs in `images`.
    pub fn unseeded(images: ImagesConfig) -> Self {
        Self::build(Some(images))
    }

    fn build(images: Option<ImagesConfig>) -> Self {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let mut config = Config {
            data_dir: dir.path().join("data"),
            network: NetworkConfig {
                bridge_name: "testbr0".to_string(),
                subnet: "192.168.100.0/24".to_string(),
                gateway: "192.168.100.1".to_string(),
                host_interface: "eth9".to_string(),
                dns_servers: vec!["1.1.1.1".to_string()],
            },
            ..Config::default()
        };
        let seed = images.is_none();
        match images {
            Some(images) => config.images = images,
            None => {
                // Nothing listens here; base images are seeded below
                config.images.github_api = "http://127.0.0.1:9".to_string();
                config.images.fallback_kernel_url = "http://127.0.0.1:9/vmlinux.bin".to_string();
                config.images.rootfs_url = "http://127.0.0.1:9/rootfs.ext4".to_string();
            }
        }

        let paths = config.paths();
        paths.ensure_directories().expect("failed to create data dirs");
        if seed {
            std::fs::write(paths.kernels.join(DEFAULT_KERNEL_NAME), b"\x7fELF-kernel")
                .expect("failed to seed kernel");
            std::fs::write(paths.rootfs.join(DEFAULT_ROOTFS_NAME), vec![0u8; 4096])
                .expect("failed to seed rootfs");
        }

        let network = Arc::new(FakeNetworkController::default());
        let mounter = Arc::new(FakeLoopMounter::new());
        let resizer = Arc::new(FakeFilesystemResizer::default());
        let formatter = Arc::new(FakeFilesystemFormatter::default());
        let exporter = Arc::new(FakeContainerExporter::debian());
        let supervisor = Arc::new(FakeSupervisor::default());
        let backends = Backends {
            network: network.clone(),
            mounter: mounter.clone(),
            resizer: resizer.clone(),
            formatter: formatter.clone(),
            exporter: exporter.clone(),
            supervisor: supervisor.clone(),
        };
        let service = VmService::new(&config, backends)
            .expect("failed to build VmService")
            .with_lifecycle(LifecycleSettings {
                stop_timeout: Duration::from_millis(100),
                kill_grace: Duration::from_millis(100),
                poll_interval: Duration::from_millis(5),
            });

        TestEnv {
            dir,
            config,
            network,
            mounter,
            resizer,
            formatter,
            exporter,
            supervisor,
            service,
        }
    }

    pub fn paths(&self) -> Paths {
        self.config.paths()
    }

    /// Create a VM with default sizing.
    pub fn create(&self, name: &str) -> VmRecord {
        self.service
            .create(CreateVmParams::new(name))
            .unwrap_or_else(|e| panic!("create {name}: {e}"))
    }

    /// A host directory with a couple of files, for mount declarations.
    pub fn host_dir(&self, name: &str) -> PathBuf {
        let dir = self.dir.path().join("host").join(name);
        std::fs::create_dir_all(&dir).expect("failed to create host dir");
        std::fs::write(dir.join("README"), format!("{name}\n")).expect("failed to write host file");
        dir
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}
