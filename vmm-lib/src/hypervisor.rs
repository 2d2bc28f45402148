// SPDX-License-Identifier: GPL-2.0-only

//! Boot and control of guest hypervisor processes.

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{ACCEPT, CONTENT_TYPE, HOST};
use hyper::Request;
use hyper_util::rt::TokioIo;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use serde_json::json;
use std::net::Ipv4Addr;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

#[derive(Debug)]
pub enum HypervisorError {
    /// The hypervisor binary could not be executed.
    Spawn(String),
    /// The process exited before its control socket appeared.
    BootFailed(String),
    /// The control socket did not appear in time.
    Timeout(String),
    /// The control API rejected or failed a request.
    Control(String),
    Signal(String),
    Io(String),
}

impl std::fmt::Display for HypervisorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HypervisorError::Spawn(e) => write!(f, "cannot start hypervisor: {e}"),
            HypervisorError::BootFailed(e) => write!(f, "hypervisor exited during boot: {e}"),
            HypervisorError::Timeout(e) => write!(f, "hypervisor boot timed out: {e}"),
            HypervisorError::Control(e) => write!(f, "control socket error: {e}"),
            HypervisorError::Signal(e) => write!(f, "cannot signal hypervisor: {e}"),
            HypervisorError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for HypervisorError {}

/// Result of probing a process handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Dead,
    /// The probe failed in a way that says nothing about the process.
    Unknown,
}

/// An extra block device attached after the root filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveSpec {
    pub drive_id: String,
    pub path: PathBuf,
    pub read_only: bool,
}

/// Everything needed to boot one guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootRequest {
    pub vm_name: String,
    pub kernel_path: PathBuf,
    pub rootfs_path: PathBuf,
    pub cpus: u32,
    pub memory_mb: u32,
    pub tap_device: String,
    pub mac_address: String,
    pub guest_ip: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub netmask: Ipv4Addr,
    /// Attached in order as `/dev/vdb`, `/dev/vdc`, ...
    pub drives: Vec<DriveSpec>,
    pub socket_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootHandle {
    pub pid: u32,
    pub socket_path: PathBuf,
}

#[async_trait::async_trait]
pub trait HypervisorSupervisor: Send + Sync {
    /// Boot the guest and return once its control socket is up.
    fn start(&self, request: &BootRequest) -> Result<BootHandle, HypervisorError>;
    /// Ask the guest to shut down. A missing or dead socket counts as stopped.
    async fn stop(&self, socket_path: &Path, timeout: Duration) -> Result<(), HypervisorError>;
    fn is_alive(&self, pid: u32) -> Liveness;
    /// SIGKILL the process. Already gone is success.
    fn kill(&self, pid: u32) -> Result<(), HypervisorError>;
}

pub fn boot_args(request: &BootRequest) -> String {
    format!(
        "console=ttyS0 reboot=k panic=1 pci=off ip={}::{}:{}::eth0:off",
        request.guest_ip, request.gateway, request.netmask
    )
}

/// Generates the Firecracker JSON config for a guest.
pub fn firecracker_config(request: &BootRequest) -> serde_json::Value {
    let mut drives = vec![json!({
        "drive_id": "rootfs",
        "path_on_host": request.rootfs_path,
        "is_root_device": true,
        "is_read_only": false,
    })];
    drives.extend(request.drives.iter().map(|d| {
        json!({
            "drive_id": d.drive_id,
            "path_on_host": d.path,
            "is_root_device": false,
            "is_read_only": d.read_only,
        })
    }));

    json!({
        "boot-source": {
            "kernel_image_path": request.kernel_path,
            "boot_args": boot_args(request),
        },
        "drives": drives,
        "machine-config": {
            "vcpu_count": request.cpus,
            "mem_size_mib": request.memory_mb,
            "smt": false,
        },
        "network-interfaces": [{
            "iface_id": "eth0",
            "host_dev_name": request.tap_device,
            "guest_mac": request.mac_address,
        }],
    })
}

/// Runs guests with the `firecracker` binary.
///
/// The process is detached into its own process group so it outlives the
/// invoking command. Console output goes to `<logs>/<name>.log` and the
/// generated config to `<logs>/<name>.json`.
pub struct FirecrackerSupervisor {
    binary: String,
    logs_dir: PathBuf,
    boot_timeout: Duration,
}

impl FirecrackerSupervisor {
    pub fn new(binary: impl Into<String>, logs_dir: impl Into<PathBuf>, boot_timeout: Duration) -> Self {
        FirecrackerSupervisor {
            binary: binary.into(),
            logs_dir: logs_dir.into(),
            boot_timeout,
        }
    }

    pub fn log_path(&self, vm_name: &str) -> PathBuf {
        self.logs_dir.join(format!("{vm_name}.log"))
    }

    pub fn config_path(&self, vm_name: &str) -> PathBuf {
        self.logs_dir.join(format!("{vm_name}.json"))
    }
}

#[async_trait::async_trait]
impl HypervisorSupervisor for FirecrackerSupervisor {
    fn start(&self, request: &BootRequest) -> Result<BootHandle, HypervisorError> {
        let io = |what: &str, e: std::io::Error| HypervisorError::Io(format!("{what}: {e}"));
        std::fs::create_dir_all(&self.logs_dir).map_err(|e| io("cannot create log dir", e))?;
        if let Some(parent) = request.socket_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io("cannot create socket dir", e))?;
        }
        // Stale socket from a previous run
        let _ = std::fs::remove_file(&request.socket_path);

        let config_path = self.config_path(&request.vm_name);
        let config = serde_json::to_string_pretty(&firecracker_config(request))
            .map_err(|e| HypervisorError::Io(format!("cannot serialize config: {e}")))?;
        std::fs::write(&config_path, config).map_err(|e| io("cannot write config", e))?;

        let log_path = self.log_path(&request.vm_name);
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|e| io("cannot open console log", e))?;
        let log_err = log.try_clone().map_err(|e| io("cannot open console log", e))?;

        let mut child = Command::new(&self.binary)
            .arg("--api-sock")
            .arg(&request.socket_path)
            .arg("--config-file")
            .arg(&config_path)
            .stdin(Stdio::null())
            .stdout(log)
            .stderr(log_err)
            .process_group(0)
            .spawn()
            .map_err(|e| HypervisorError::Spawn(format!("'{}': {e}", self.binary)))?;
        let pid = child.id();

        let deadline = Instant::now() + self.boot_timeout;
        loop {
            if request.socket_path.exists() {
                tracing::info!(vm_name = %request.vm_name, pid, "hypervisor started");
                return Ok(BootHandle {
                    pid,
                    socket_path: request.socket_path.clone(),
                });
            }
            if let Ok(Some(status)) = child.try_wait() {
                return Err(HypervisorError::BootFailed(format!(
                    "{status}; console log {}:\n{}",
                    log_path.display(),
                    log_tail(&log_path, 20)
                )));
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                return Err(HypervisorError::Timeout(format!(
                    "control socket {} did not appear within {:?}",
                    request.socket_path.display(),
                    self.boot_timeout
                )));
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    async fn stop(&self, socket_path: &Path, timeout: Duration) -> Result<(), HypervisorError> {
        send_ctrl_alt_del(socket_path, timeout).await
    }

    fn is_alive(&self, pid: u32) -> Liveness {
        probe_pid(pid)
    }

    fn kill(&self, pid: u32) -> Result<(), HypervisorError> {
        kill_pid(pid)
    }
}

/// `PUT /actions {"action_type": "SendCtrlAltDel"}` over the control socket.
pub async fn send_ctrl_alt_del(socket_path: &Path, timeout: Duration) -> Result<(), HypervisorError> {
    match tokio::time::timeout(timeout, put_action(socket_path, "SendCtrlAltDel")).await {
        Ok(result) => result,
        Err(_) => Err(HypervisorError::Control(format!(
            "no response from {} within {timeout:?}",
            socket_path.display()
        ))),
    }
}

async fn put_action(socket_path: &Path, action: &str) -> Result<(), HypervisorError> {
    let stream = match tokio::net::UnixStream::connect(socket_path).await {
        Ok(stream) => stream,
        Err(e)
            if matches!(
                e.kind(),
                std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused
            ) =>
        {
            tracing::debug!(socket = %socket_path.display(), "control socket gone, guest already stopped");
            return Ok(());
        }
        Err(e) => {
            return Err(HypervisorError::Control(format!(
                "cannot connect to {}: {e}",
                socket_path.display()
            )))
        }
    };
    let control = |e: hyper::Error| HypervisorError::Control(e.to_string());
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(control)?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            tracing::debug!(error = %e, "control connection closed");
        }
    });

    let body = json!({ "action_type": action }).to_string();
    let request = Request::put("/actions")
        .header(HOST, "localhost")
        .header(ACCEPT, "application/json")
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)))
        .map_err(|e| HypervisorError::Control(e.to_string()))?;
    let response = sender.send_request(request).await.map_err(control)?;
    let status = response.status();
    let body = response.into_body().collect().await.map_err(control)?.to_bytes();
    if !status.is_success() {
        return Err(HypervisorError::Control(format!(
            "{action} rejected: {status} {}",
            String::from_utf8_lossy(&body).trim()
        )));
    }
    tracing::debug!(socket = %socket_path.display(), action, "control action accepted");
    Ok(())
}

/// Permission-denied means the process exists but belongs to someone else,
/// so it reports `Alive`.
pub fn probe_pid(pid: u32) -> Liveness {
    let Ok(raw) = i32::try_from(pid) else {
        return Liveness::Dead;
    };
    if raw == 0 {
        return Liveness::Dead;
    }
    let pid = Pid::from_raw(raw);
    // A child of this process lingers as a zombie, which still answers signal 0
    match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::Exited(..) | WaitStatus::Signaled(..)) => return Liveness::Dead,
        Ok(_) | Err(_) => {}
    }
    match signal::kill(pid, None) {
        Ok(()) | Err(Errno::EPERM) => Liveness::Alive,
        Err(Errno::ESRCH) => Liveness::Dead,
        Err(_) => Liveness::Unknown,
    }
}

pub fn kill_pid(pid: u32) -> Result<(), HypervisorError> {
    let raw = match i32::try_from(pid) {
        Ok(raw) if raw > 0 => raw,
        _ => return Ok(()),
    };
    match signal::kill(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(HypervisorError::Signal(format!("pid {pid}: {e}"))),
    }
}

fn log_tail(path: &Path, lines: usize) -> String {
    let content = std::fs::read_to_string(path).unwrap_or_default();
    let all: Vec<&str> = content.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}
