// SPDX-License-Identifier: GPL-2.0-only
use crate::id::VmId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// VM lifecycle state.
///
/// `created -> starting -> running -> stopping -> stopped`, with `error`
/// reachable from `starting` when provisioning or boot fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl VmState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VmState::Created => "created",
            VmState::Starting => "starting",
            VmState::Running => "running",
            VmState::Stopping => "stopping",
            VmState::Stopped => "stopped",
            VmState::Error => "error",
        }
    }

    /// States in which a hypervisor process is expected and has not been
    /// confirmed gone. A `starting` VM has no recorded pid yet.
    pub fn expects_process(&self) -> bool {
        matches!(self, VmState::Running | VmState::Stopping)
    }
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for VmState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(VmState::Created),
            "starting" => Ok(VmState::Starting),
            "running" => Ok(VmState::Running),
            "stopping" => Ok(VmState::Stopping),
            "stopped" => Ok(VmState::Stopped),
            "error" => Ok(VmState::Error),
            _ => Err(format!("invalid VM state: '{s}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            _ => Err(format!("invalid protocol: '{s}' (expected: tcp, udp)")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortForward {
    pub host_port: u16,
    pub guest_port: u16,
    pub protocol: Protocol,
}

/// A host directory exposed to the guest as an attached ext4 image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountDeclaration {
    pub host_path: PathBuf,
    pub tag: String,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_path: Option<PathBuf>,
}

impl MountDeclaration {
    /// Guest mount point: always `/mnt/<tag>`.
    pub fn guest_mount_point(&self) -> String {
        format!("/mnt/{}", self.tag)
    }
}

/// Guest block device for a drive slot. Slot 0 is the root filesystem.
pub fn device_for_slot(slot: usize) -> String {
    let mut suffix = String::new();
    let mut n = slot;
    loop {
        suffix.insert(0, (b'a' + (n % 26) as u8) as char);
        if n < 26 {
            break;
        }
        n = n / 26 - 1;
    }
    format!("/dev/vd{suffix}")
}

/// Guest device of the mount at `index` in declaration order.
pub fn device_for_mount(index: usize) -> String {
    device_for_slot(index + 1)
}

/// The persisted unit of truth for one VM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmRecord {
    pub name: String,
    pub id: VmId,
    pub state: VmState,
    pub cpus: u32,
    pub memory_mb: u32,
    pub disk_size_mb: u64,
    /// Base image name. `None` selects the default image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Kernel name. `None` selects the default kernel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel: Option<String>,
    /// Only authoritative while `state` is `starting` or `running`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    pub tap_device: String,
    pub mac_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_public_key: Option<String>,
    /// Empty means the configured default list.
    #[serde(default)]
    pub dns_servers: Vec<String>,
    pub socket_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rootfs_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel_path: Option<PathBuf>,
    #[serde(default = "default_auto_start")]
    pub auto_start: bool,
    /// 0 when no hypervisor process is attached.
    #[serde(default)]
    pub pid: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default)]
    pub port_forwards: Vec<PortForward>,
    #[serde(default)]
    pub mounts: Vec<MountDeclaration>,
}

fn default_auto_start() -> bool {
    true
}

impl VmRecord {
    /// Build a fresh record in the `created` state. The interface name and
    /// hardware address are fixed here for the life of the record.
    pub fn new(params: &CreateVmParams, socket_dir: &std::path::Path) -> Self {
        let id = VmId::generate();
        VmRecord {
            name: params.name.clone(),
            id,
            state: VmState::Created,
            cpus: params.cpus,
            memory_mb: params.memory_mb,
            disk_size_mb: params.disk_size_mb,
            image: params.image.clone().filter(|s| !s.is_empty()),
            kernel: params.kernel.clone().filter(|s| !s.is_empty()),
            ip_address: None,
            tap_device: id.tap_name(),
            mac_address: id.mac_address(),
            ssh_public_key: params.ssh_public_key.clone().filter(|s| !s.trim().is_empty()),
            dns_servers: params.dns_servers.clone(),
            socket_path: socket_dir.join(format!("{}.sock", params.name)),
            rootfs_path: None,
            kernel_path: None,
            auto_start: params.auto_start,
            pid: 0,
            created_at: Utc::now(),
            started_at: None,
            stopped_at: None,
            last_error: None,
            port_forwards: Vec::new(),
            mounts: params.mounts.clone(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == VmState::Running
    }

    /// The IP address, but only while the VM is running.
    pub fn live_ip(&self) -> Option<&str> {
        if self.is_running() {
            self.ip_address.as_deref()
        } else {
            None
        }
    }
}

/// Parameters for creating a new VM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateVmParams {
    pub name: String,
    pub cpus: u32,
    pub memory_mb: u32,
    pub disk_size_mb: u64,
    pub image: Option<String>,
    pub kernel: Option<String>,
    pub ssh_public_key: Option<String>,
    pub dns_servers: Vec<String>,
    pub auto_start: bool,
    pub mounts: Vec<MountDeclaration>,
}

impl CreateVmParams {
    pub fn new(name: impl Into<String>) -> Self {
        CreateVmParams {
            name: name.into(),
            cpus: 1,
            memory_mb: 512,
            disk_size_mb: 1024,
            image: None,
            kernel: None,
            ssh_public_key: None,
            dns_servers: Vec::new(),
            auto_start: true,
            mounts: Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        validate_name(&self.name)?;
        if self.cpus == 0 {
            return Err("cpus must be at least 1".to_string());
        }
        if self.memory_mb < 128 {
            return Err(format!("memory must be at least 128 MB (got {})", self.memory_mb));
        }
        if self.disk_size_mb == 0 {
            return Err("disk size must be at least 1 MB".to_string());
        }
        for server in &self.dns_servers {
            if server.parse::<std::net::IpAddr>().is_err() {
                return Err(format!("invalid DNS server address '{server}'"));
            }
        }
        let mut seen = std::collections::HashSet::new();
        for mount in &self.mounts {
            validate_tag(&mount.tag)?;
            if !seen.insert(mount.tag.as_str()) {
                return Err(format!("duplicate mount tag '{}'", mount.tag));
            }
        }
        Ok(())
    }
}

pub fn validate_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("VM name must not be empty".to_string());
    }
    if name.len() > 64 {
        return Err(format!("VM name '{name}' is longer than 64 characters"));
    }
    let mut chars = name.chars();
    let first_ok = chars.next().is_some_and(|c| c.is_ascii_alphanumeric());
    let rest_ok = chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !first_ok || !rest_ok {
        return Err(format!(
            "invalid VM name '{name}' (letters, digits, '-', '_', '.'; must start with a letter or digit)"
        ));
    }
    Ok(())
}

/// Mount tags match `[A-Za-z0-9_-]+`.
pub fn validate_tag(tag: &str) -> Result<(), String> {
    if tag.is_empty() || !tag.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return Err(format!("invalid mount tag '{tag}' (expected [A-Za-z0-9_-]+)"));
    }
    Ok(())
}

/// Parse a `/host/path:tag[:ro|rw]` mount specification.
pub fn parse_mount_spec(spec: &str) -> Result<MountDeclaration, String> {
    let parts: Vec<&str> = spec.split(':').collect();
    let (host, tag, mode) = match parts.as_slice() {
        [host, tag] => (*host, *tag, "rw"),
        [host, tag, mode] => (*host, *tag, *mode),
        _ => {
            return Err(format!(
                "invalid mount specification '{spec}' (expected /host/path:tag[:ro|rw])"
            ))
        }
    };
    if !host.starts_with('/') {
        return Err(format!("mount host path '{host}' must be absolute"));
    }
    validate_tag(tag)?;
    let read_only = match mode {
        "ro" => true,
        "rw" => false,
        other => return Err(format!("invalid mount mode '{other}' (expected ro or rw)")),
    };
    Ok(MountDeclaration {
        host_path: PathBuf::from(host),
        tag: tag.to_string(),
        read_only,
        image_path: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn sample_record() -> VmRecord {
        let mut params = CreateVmParams::new("web");
        params.image = Some("ubuntu".to_string());
        params.ssh_public_key = Some("ssh-ed25519 AAAA test".to_string());
        params.dns_servers = vec!["9.9.9.9".to_string()];
        params.mounts = vec![parse_mount_spec("/srv/code:code:ro").unwrap()];
        let mut vm = VmRecord::new(&params, Path::new("/var/lib/vmm/sockets"));
        vm.port_forwards.push(PortForward {
            host_port: 8080,
            guest_port: 80,
            protocol: Protocol::Tcp,
        });
        vm.last_error = Some("boom".to_string());
        vm
    }

    #[test]
    fn state_roundtrip() {
        for state in [
            VmState::Created,
            VmState::Starting,
            VmState::Running,
            VmState::Stopping,
            VmState::Stopped,
            VmState::Error,
        ] {
            assert_eq!(state.as_str().parse::<VmState>().unwrap(), state);
        }
        assert!("bogus".parse::<VmState>().is_err());
    }

    #[test]
    fn only_running_and_stopping_expect_a_process() {
        assert!(VmState::Running.expects_process());
        assert!(VmState::Stopping.expects_process());
        for state in [VmState::Created, VmState::Starting, VmState::Stopped, VmState::Error] {
            assert!(!state.expects_process(), "{state}");
        }
    }

    #[test]
    fn protocols_hash_distinctly() {
        let set: std::collections::HashSet<Protocol> =
            [Protocol::Tcp, Protocol::Udp, Protocol::Tcp].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn new_record_derives_network_identity_from_id() {
        let vm = sample_record();
        assert_eq!(vm.state, VmState::Created);
        assert_eq!(vm.tap_device, vm.id.tap_name());
        assert_eq!(vm.mac_address, vm.id.mac_address());
        assert_eq!(vm.socket_path, PathBuf::from("/var/lib/vmm/sockets/web.sock"));
        assert_eq!(vm.pid, 0);
        assert!(vm.ip_address.is_none());
        assert!(vm.auto_start);
    }

    #[test]
    fn record_json_roundtrip() {
        let vm = sample_record();
        let json = serde_json::to_string_pretty(&vm).unwrap();
        let back: VmRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, vm);
    }

    #[test]
    fn record_ignores_unknown_fields() {
        let vm = sample_record();
        let mut value = serde_json::to_value(&vm).unwrap();
        value["future_field"] = serde_json::json!({"nested": true});
        let back: VmRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back, vm);
    }

    #[test]
    fn live_ip_requires_running_state() {
        let mut vm = sample_record();
        vm.ip_address = Some("172.16.0.2".to_string());
        vm.state = VmState::Stopped;
        assert_eq!(vm.live_ip(), None);
        vm.state = VmState::Running;
        assert_eq!(vm.live_ip(), Some("172.16.0.2"));
    }

    #[test]
    fn parse_mount_spec_variants() {
        let m = parse_mount_spec("/home/me/src:src").unwrap();
        assert_eq!(m.host_path, PathBuf::from("/home/me/src"));
        assert_eq!(m.tag, "src");
        assert!(!m.read_only);

        let m = parse_mount_spec("/data:my_data-1:ro").unwrap();
        assert!(m.read_only);
        assert_eq!(m.guest_mount_point(), "/mnt/my_data-1");
    }

    #[test]
    fn parse_mount_spec_rejects_malformed() {
        assert!(parse_mount_spec("/data").is_err());
        assert!(parse_mount_spec("relative:tag").is_err());
        assert!(parse_mount_spec("/data:bad tag").is_err());
        assert!(parse_mount_spec("/data:tag:rx").is_err());
        assert!(parse_mount_spec("/data:tag:ro:extra").is_err());
        assert!(parse_mount_spec("/data:").is_err());
    }

    #[test]
    fn validate_rejects_duplicate_tags() {
        let mut params = CreateVmParams::new("dup");
        params.mounts = vec![
            parse_mount_spec("/a:code").unwrap(),
            parse_mount_spec("/b:code").unwrap(),
        ];
        assert!(params.validate().unwrap_err().contains("duplicate"));
    }

    #[test]
    fn validate_checks_name_and_sizes() {
        assert!(CreateVmParams::new("ok-name_1.2").validate().is_ok());
        assert!(CreateVmParams::new("").validate().is_err());
        assert!(CreateVmParams::new("-leading").validate().is_err());
        assert!(CreateVmParams::new("has/slash").validate().is_err());

        let mut params = CreateVmParams::new("small");
        params.memory_mb = 64;
        assert!(params.validate().is_err());

        let mut params = CreateVmParams::new("dns");
        params.dns_servers = vec!["not-an-ip".to_string()];
        assert!(params.validate().is_err());
    }

    #[test]
    fn device_slots_follow_declaration_order() {
        assert_eq!(device_for_slot(0), "/dev/vda");
        assert_eq!(device_for_mount(0), "/dev/vdb");
        assert_eq!(device_for_mount(1), "/dev/vdc");
        assert_eq!(device_for_slot(25), "/dev/vdz");
        assert_eq!(device_for_slot(26), "/dev/vdaa");
    }
}
