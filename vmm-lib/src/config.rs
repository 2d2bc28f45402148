// SPDX-License-Identifier: GPL-2.0-only
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub enum ConfigError {
    NotFound(std::io::Error),
    Invalid(String),
    Io(std::io::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::NotFound(e) => write!(f, "config file not found: {e}"),
            ConfigError::Invalid(e) => write!(f, "invalid config: {e}"),
            ConfigError::Io(e) => write!(f, "cannot write config: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl ConfigError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ConfigError::NotFound(_))
    }
}

/// Built-in resolver list used when neither the VM nor the config names one.
pub const DEFAULT_DNS_SERVERS: [&str; 3] = ["8.8.8.8", "8.8.4.4", "1.1.1.1"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data_dir: PathBuf,
    pub network: NetworkConfig,
    pub defaults: VmDefaults,
    pub images: ImagesConfig,
    pub firecracker: FirecrackerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_dir: PathBuf::from("/var/lib/vmm"),
            network: NetworkConfig::default(),
            defaults: VmDefaults::default(),
            images: ImagesConfig::default(),
            firecracker: FirecrackerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub bridge_name: String,
    pub subnet: String,
    pub gateway: String,
    pub host_interface: String,
    pub dns_servers: Vec<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            bridge_name: "vmm-br0".to_string(),
            subnet: "172.16.0.0/16".to_string(),
            gateway: "172.16.0.1".to_string(),
            host_interface: "eth0".to_string(),
            dns_servers: DEFAULT_DNS_SERVERS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Values `create` falls back to when a flag is omitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmDefaults {
    pub cpus: u32,
    pub memory_mb: u32,
    pub disk_size_mb: u64,
    pub ssh_key_path: Option<PathBuf>,
    pub dns_servers: Vec<String>,
}

impl Default for VmDefaults {
    fn default() -> Self {
        VmDefaults {
            cpus: 1,
            memory_mb: 512,
            disk_size_mb: 1024,
            ssh_key_path: None,
            dns_servers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImagesConfig {
    pub github_api: String,
    pub kernel_release_repo: String,
    pub kernel_release_prefix: String,
    pub fallback_kernel_url: String,
    pub rootfs_url: String,
}

impl Default for ImagesConfig {
    fn default() -> Self {
        ImagesConfig {
            github_api: "https://api.github.com".to_string(),
            kernel_release_repo: "raesene/baremetalvmm".to_string(),
            kernel_release_prefix: "kernel-".to_string(),
            fallback_kernel_url: "https://s3.amazonaws.com/spec.ccfc.min/img/quickstart_guide/x86_64/kernels/vmlinux.bin".to_string(),
            rootfs_url: "https://s3.amazonaws.com/spec.ccfc.min/img/quickstart_guide/x86_64/rootfs/bionic.rootfs.ext4".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FirecrackerConfig {
    pub binary: String,
    pub boot_timeout_secs: u64,
    pub stop_timeout_secs: u64,
}

impl Default for FirecrackerConfig {
    fn default() -> Self {
        FirecrackerConfig {
            binary: "firecracker".to_string(),
            boot_timeout_secs: 5,
            stop_timeout_secs: 5,
        }
    }
}

/// Directory layout under `data_dir`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    pub vms: PathBuf,
    pub kernels: PathBuf,
    pub rootfs: PathBuf,
    pub mounts: PathBuf,
    pub sockets: PathBuf,
    pub logs: PathBuf,
    pub state: PathBuf,
    /// Per-image lock files shared by every `vmm` process.
    pub locks: PathBuf,
}

impl Paths {
    pub fn new(data_dir: &Path) -> Self {
        Paths {
            vms: data_dir.join("vms"),
            kernels: data_dir.join("images").join("kernels"),
            rootfs: data_dir.join("images").join("rootfs"),
            mounts: data_dir.join("mounts"),
            sockets: data_dir.join("sockets"),
            logs: data_dir.join("logs"),
            state: data_dir.join("state"),
            locks: data_dir.join("locks"),
        }
    }

    pub fn ensure_directories(&self) -> std::io::Result<()> {
        for dir in [
            &self.vms,
            &self.kernels,
            &self.rootfs,
            &self.mounts,
            &self.sockets,
            &self.logs,
            &self.state,
            &self.locks,
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

impl Config {
    pub fn paths(&self) -> Paths {
        Paths::new(&self.data_dir)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound(e)
            } else {
                ConfigError::Invalid(e.to_string())
            }
        })?;
        let config: Config =
            serde_norway::from_str(&content).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        serde_norway::to_string(self).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(ConfigError::Io)?;
        }
        std::fs::write(path, self.to_yaml()?).map_err(ConfigError::Io)
    }
}

/// Resolve the config file location from explicit inputs.
///
/// `$XDG_CONFIG_HOME/vmm/config.yaml` wins; otherwise the file lives in the
/// invoking user's home, which under `sudo` is `/home/$SUDO_USER` rather
/// than root's.
pub fn config_path_for(
    xdg_config_home: Option<&Path>,
    home: &Path,
    sudo_user: Option<&str>,
) -> PathBuf {
    if let Some(xdg) = xdg_config_home.filter(|p| !p.as_os_str().is_empty()) {
        return xdg.join("vmm").join("config.yaml");
    }
    let home = match sudo_user {
        Some(user) if !user.is_empty() && user != "root" => PathBuf::from("/home").join(user),
        _ => home.to_path_buf(),
    };
    home.join(".config").join("vmm").join("config.yaml")
}
