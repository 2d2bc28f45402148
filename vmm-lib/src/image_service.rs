// SPDX-License-Identifier: GPL-2.0-only
use crate::backend::{BackendError, ContainerExporter, FilesystemFormatter};
use crate::config::{ImagesConfig, Paths};
use crate::download::{DownloadError, Downloader};
use crate::github::GitHubReleaseClient;
use crate::mount_service::tree_image_size;
use std::io::Read;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const DEFAULT_KERNEL_NAME: &str = "vmlinux.bin";
pub const DEFAULT_ROOTFS_NAME: &str = "rootfs.ext4";
/// Name under which the default rootfs appears in listings.
pub const DEFAULT_IMAGE: &str = "rootfs";
const KERNEL_ASSET: &str = "vmlinux.bin";
const DEFAULT_IMPORT_SIZE_MB: u64 = 2048;

#[derive(Debug)]
pub enum ImageError {
    ImageNotFound(String),
    /// The default rootfs has not been downloaded.
    DefaultImageMissing(PathBuf),
    KernelNotFound(String),
    DefaultKernelMissing(PathBuf),
    AlreadyExists(String),
    /// The image or kernel is in use and cannot be removed.
    Conflict(String),
    InvalidName(String),
    InvalidKernel(String),
    UnsupportedImage(String),
    Download(DownloadError),
    Backend(BackendError),
    Io(String),
}

impl std::fmt::Display for ImageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImageError::ImageNotFound(name) => write!(f, "image '{name}' not found"),
            ImageError::DefaultImageMissing(p) => {
                write!(f, "default rootfs not found at {}", p.display())
            }
            ImageError::KernelNotFound(name) => write!(f, "kernel '{name}' not found"),
            ImageError::DefaultKernelMissing(p) => {
                write!(f, "default kernel not found at {}", p.display())
            }
            ImageError::AlreadyExists(e) => write!(f, "{e} already exists"),
            ImageError::Conflict(e) => write!(f, "{e}"),
            ImageError::InvalidName(e) => write!(f, "invalid name: {e}"),
            ImageError::InvalidKernel(e) => write!(f, "invalid kernel binary: {e}"),
            ImageError::UnsupportedImage(e) => write!(f, "unsupported image: {e}"),
            ImageError::Download(e) => write!(f, "{e}"),
            ImageError::Backend(e) => write!(f, "{e}"),
            ImageError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for ImageError {}

impl From<DownloadError> for ImageError {
    fn from(e: DownloadError) -> Self {
        ImageError::Download(e)
    }
}

impl From<BackendError> for ImageError {
    fn from(e: BackendError) -> Self {
        ImageError::Backend(e)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    pub is_default: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelInfo {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    pub is_default: bool,
}

/// Base root filesystems and kernels under `images/`.
pub struct ImageService {
    paths: Paths,
    config: ImagesConfig,
    downloader: Downloader,
    exporter: Arc<dyn ContainerExporter>,
    formatter: Arc<dyn FilesystemFormatter>,
}

impl ImageService {
    pub fn new(
        paths: Paths,
        config: ImagesConfig,
        exporter: Arc<dyn ContainerExporter>,
        formatter: Arc<dyn FilesystemFormatter>,
    ) -> Result<Self, ImageError> {
        Ok(ImageService {
            paths,
            config,
            downloader: Downloader::new()?,
            exporter,
            formatter,
        })
    }

    pub fn default_kernel_path(&self) -> PathBuf {
        self.paths.kernels.join(DEFAULT_KERNEL_NAME)
    }

    pub fn default_rootfs_path(&self) -> PathBuf {
        self.paths.rootfs.join(DEFAULT_ROOTFS_NAME)
    }

    fn image_path(&self, name: &str) -> PathBuf {
        self.paths.rootfs.join(format!("{name}.ext4"))
    }

    /// Download the default kernel and rootfs if they are missing.
    ///
    /// Existing files are never touched and no request is made for them.
    pub async fn ensure_base_images(&self) -> Result<(), ImageError> {
        let kernel = self.default_kernel_path();
        if !kernel.exists() {
            let url = self.kernel_url().await;
            tracing::info!(url = %url, "downloading default kernel");
            self.downloader.fetch(&url, &kernel).await?;
        }

        let rootfs = self.default_rootfs_path();
        if !rootfs.exists() {
            tracing::info!(url = %self.config.rootfs_url, "downloading default rootfs");
            self.downloader.fetch(&self.config.rootfs_url, &rootfs).await?;
        }
        Ok(())
    }

    /// `vmlinux.bin` of the newest `kernel-*` release, else the fallback URL.
    async fn kernel_url(&self) -> String {
        let github = GitHubReleaseClient::new(
            self.downloader.client().clone(),
            self.config.github_api.as_str(),
        );
        match github
            .latest_asset_url(
                &self.config.kernel_release_repo,
                &self.config.kernel_release_prefix,
                KERNEL_ASSET,
            )
            .await
        {
            Ok(url) => url,
            Err(e) => {
                tracing::warn!(error = %e, "kernel release lookup failed, using fallback kernel");
                self.config.fallback_kernel_url.clone()
            }
        }
    }

    // --- Root filesystem images ---

    pub fn list_images(&self) -> Result<Vec<ImageInfo>, ImageError> {
        let mut images: Vec<ImageInfo> = list_files(&self.paths.rootfs)?
            .into_iter()
            .filter_map(|(file_name, path, size)| {
                let name = file_name.strip_suffix(".ext4")?.to_string();
                Some(ImageInfo {
                    is_default: file_name == DEFAULT_ROOTFS_NAME,
                    name,
                    path,
                    size,
                })
            })
            .collect();
        images.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(images)
    }

    /// Path of the base image for `image`; `None` or empty selects the default.
    pub fn resolve_image(&self, image: Option<&str>) -> Result<PathBuf, ImageError> {
        match image.filter(|s| !s.is_empty()) {
            Some(name) => {
                validate_image_name(name)?;
                let path = self.image_path(name);
                if path.is_file() {
                    Ok(path)
                } else {
                    Err(ImageError::ImageNotFound(name.to_string()))
                }
            }
            None => {
                let path = self.default_rootfs_path();
                if path.is_file() {
                    Ok(path)
                } else {
                    Err(ImageError::DefaultImageMissing(path))
                }
            }
        }
    }

    /// Delete a named base image. `referenced_by` lists the VMs using it.
    pub fn delete_image(&self, name: &str, referenced_by: &[String]) -> Result<(), ImageError> {
        validate_image_name(name)?;
        let path = self.image_path(name);
        if !path.is_file() {
            return Err(ImageError::ImageNotFound(name.to_string()));
        }
        if !referenced_by.is_empty() {
            return Err(ImageError::Conflict(format!(
                "image '{name}' is used by VM(s): {}",
                referenced_by.join(", ")
            )));
        }
        std::fs::remove_file(&path)
            .map_err(|e| ImageError::Io(format!("cannot remove {}: {e}", path.display())))?;
        tracing::info!(image = %name, "deleted image");
        Ok(())
    }

    /// Flatten a container image into a bootable ext4 base image named `name`.
    ///
    /// The image is sized at `size_mb` (2048 when `None`) or the exported
    /// tree's size plus 50 %, whichever is larger.
    pub fn import_container(
        &self,
        image_ref: &str,
        name: &str,
        size_mb: Option<u64>,
    ) -> Result<ImageInfo, ImageError> {
        validate_image_name(name)?;
        let dest = self.image_path(name);
        if dest.exists() {
            return Err(ImageError::AlreadyExists(format!("image '{name}'")));
        }

        let staging = self
            .paths
            .state
            .join(format!("import-{}", uuid::Uuid::new_v4().simple()));
        std::fs::create_dir_all(&staging)
            .map_err(|e| ImageError::Io(format!("cannot create {}: {e}", staging.display())))?;

        let result = self.build_imported(image_ref, &staging, &dest, size_mb);
        if let Err(e) = std::fs::remove_dir_all(&staging) {
            tracing::warn!(path = %staging.display(), error = %e, "failed to remove import staging");
        }
        if result.is_err() {
            let _ = std::fs::remove_file(&dest);
        }
        result?;

        let size = std::fs::metadata(&dest)
            .map_err(|e| ImageError::Io(format!("cannot stat {}: {e}", dest.display())))?
            .len();
        tracing::info!(image = %name, source = %image_ref, size, "imported container image");
        Ok(ImageInfo {
            name: name.to_string(),
            path: dest,
            size,
            is_default: false,
        })
    }

    fn build_imported(
        &self,
        image_ref: &str,
        staging: &Path,
        dest: &Path,
        size_mb: Option<u64>,
    ) -> Result<(), ImageError> {
        self.exporter.export(image_ref, staging)?;
        prepare_guest_tree(staging)?;

        let requested = size_mb.unwrap_or(DEFAULT_IMPORT_SIZE_MB) * 1024 * 1024;
        let needed = tree_image_size(staging)
            .map_err(|e| ImageError::Io(format!("cannot size {}: {e}", staging.display())))?;
        std::fs::create_dir_all(&self.paths.rootfs).map_err(|e| {
            ImageError::Io(format!("cannot create {}: {e}", self.paths.rootfs.display()))
        })?;
        self.formatter
            .build_from_dir(staging, dest, requested.max(needed))?;
        Ok(())
    }

    // --- Kernels ---

    pub fn list_kernels(&self) -> Result<Vec<KernelInfo>, ImageError> {
        let mut kernels: Vec<KernelInfo> = list_files(&self.paths.kernels)?
            .into_iter()
            .map(|(name, path, size)| KernelInfo {
                is_default: name == DEFAULT_KERNEL_NAME,
                name,
                path,
                size,
            })
            .collect();
        kernels.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(kernels)
    }

    /// Path of `kernel`; `None` or empty selects the default.
    pub fn resolve_kernel(&self, kernel: Option<&str>) -> Result<PathBuf, ImageError> {
        match kernel.filter(|s| !s.is_empty()) {
            Some(name) => {
                validate_kernel_name(name)?;
                let path = self.paths.kernels.join(name);
                if path.is_file() {
                    Ok(path)
                } else {
                    Err(ImageError::KernelNotFound(name.to_string()))
                }
            }
            None => {
                let path = self.default_kernel_path();
                if path.is_file() {
                    Ok(path)
                } else {
                    Err(ImageError::DefaultKernelMissing(path))
                }
            }
        }
    }

    /// Copy a kernel binary into the store after validating its ELF header.
    pub fn import_kernel(&self, source: &Path, name: &str, force: bool) -> Result<KernelInfo, ImageError> {
        validate_kernel_name(name)?;
        let dest = self.paths.kernels.join(name);
        if dest.exists() && !force {
            return Err(ImageError::AlreadyExists(format!(
                "kernel '{name}' (use --force to overwrite)"
            )));
        }
        validate_kernel_binary(source)?;

        std::fs::create_dir_all(&self.paths.kernels).map_err(|e| {
            ImageError::Io(format!("cannot create {}: {e}", self.paths.kernels.display()))
        })?;
        let tmp = self.paths.kernels.join(format!(".{name}.tmp"));
        std::fs::copy(source, &tmp)
            .and_then(|_| std::fs::rename(&tmp, &dest))
            .map_err(|e| {
                let _ = std::fs::remove_file(&tmp);
                ImageError::Io(format!("cannot copy kernel to {}: {e}", dest.display()))
            })?;

        let size = std::fs::metadata(&dest)
            .map_err(|e| ImageError::Io(format!("cannot stat {}: {e}", dest.display())))?
            .len();
        tracing::info!(kernel = %name, size, "imported kernel");
        Ok(KernelInfo {
            is_default: name == DEFAULT_KERNEL_NAME,
            name: name.to_string(),
            path: dest,
            size,
        })
    }

    pub fn delete_kernel(&self, name: &str) -> Result<(), ImageError> {
        validate_kernel_name(name)?;
        if name == DEFAULT_KERNEL_NAME {
            return Err(ImageError::Conflict(format!(
                "cannot delete the default kernel '{DEFAULT_KERNEL_NAME}'"
            )));
        }
        let path = self.paths.kernels.join(name);
        if !path.is_file() {
            return Err(ImageError::KernelNotFound(name.to_string()));
        }
        std::fs::remove_file(&path)
            .map_err(|e| ImageError::Io(format!("cannot remove {}: {e}", path.display())))
    }
}

/// Regular, non-hidden files in `dir` as (file name, path, size).
fn list_files(dir: &Path) -> Result<Vec<(String, PathBuf, u64)>, ImageError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(ImageError::Io(format!("cannot read {}: {e}", dir.display()))),
    };
    let mut files = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') || name.ends_with(".tmp") {
            continue;
        }
        let Ok(meta) = entry.metadata() else { continue };
        if meta.is_file() {
            files.push((name, entry.path(), meta.len()));
        }
    }
    Ok(files)
}

pub fn validate_image_name(name: &str) -> Result<(), ImageError> {
    crate::vm::validate_name(name).map_err(ImageError::InvalidName)
}

pub fn validate_kernel_name(name: &str) -> Result<(), ImageError> {
    if name.is_empty() || name.starts_with('.') || name.contains('/') {
        return Err(ImageError::InvalidName(format!("invalid kernel name '{name}'")));
    }
    Ok(())
}

const ET_EXEC: u16 = 2;
const EM_X86_64: u16 = 62;
const EM_AARCH64: u16 = 183;

fn host_machine() -> Option<u16> {
    if cfg!(target_arch = "x86_64") {
        Some(EM_X86_64)
    } else if cfg!(target_arch = "aarch64") {
        Some(EM_AARCH64)
    } else {
        None
    }
}

/// Check that `path` is an ELF64 executable for the host architecture.
pub fn validate_kernel_binary(path: &Path) -> Result<(), ImageError> {
    let mut header = [0u8; 20];
    std::fs::File::open(path)
        .and_then(|mut f| f.read_exact(&mut header))
        .map_err(|e| ImageError::InvalidKernel(format!("cannot read {}: {e}", path.display())))?;
    check_elf_header(&header, host_machine())
}

fn check_elf_header(header: &[u8; 20], host: Option<u16>) -> Result<(), ImageError> {
    if &header[..4] != b"\x7fELF" {
        return Err(ImageError::InvalidKernel("not an ELF binary".to_string()));
    }
    if header[4] != 2 {
        return Err(ImageError::InvalidKernel("not a 64-bit ELF binary".to_string()));
    }
    let read_u16 = |bytes: [u8; 2]| match header[5] {
        2 => u16::from_be_bytes(bytes),
        _ => u16::from_le_bytes(bytes),
    };
    let e_type = read_u16([header[16], header[17]]);
    let e_machine = read_u16([header[18], header[19]]);
    if e_type != ET_EXEC {
        return Err(ImageError::InvalidKernel(format!("not an executable (type {e_type})")));
    }
    let host = host.ok_or_else(|| {
        ImageError::InvalidKernel(format!("unsupported host architecture {}", std::env::consts::ARCH))
    })?;
    if e_machine != host {
        return Err(ImageError::InvalidKernel(format!(
            "architecture mismatch: kernel machine {e_machine}, host machine {host}"
        )));
    }
    Ok(())
}

const SERIAL_GETTY_UNIT: &str = "[Unit]
Description=Serial Console on ttyS0
After=systemd-user-sessions.service

[Service]
ExecStart=/sbin/agetty -o '-p -- \\\\u' --keep-baud 115200,38400,9600 ttyS0 xterm-256color
Type=idle
Restart=always
RestartSec=0
UtmpIdentifier=ttyS0
TTYPath=/dev/ttyS0
TTYReset=yes
TTYVHangup=yes

[Install]
WantedBy=multi-user.target
";

const ETH0_NETWORK_UNIT: &str = "[Match]
Name=eth0

[Network]
DHCP=no
";

/// Adjust an exported container tree so it boots as a microVM guest.
///
/// Only Debian-family trees are accepted; the tree must already carry
/// systemd and an SSH server.
pub fn prepare_guest_tree(root: &Path) -> Result<(), ImageError> {
    let etc = root.join("etc");
    if !etc.join("debian_version").exists() && !etc.join("apt").exists() {
        return Err(ImageError::UnsupportedImage(
            "only Debian/Ubuntu-based images are supported".to_string(),
        ));
    }
    let io = |what: &str, e: std::io::Error| ImageError::Io(format!("{what}: {e}"));

    for dir in ["dev", "dev/pts", "proc", "sys", "run", "tmp", "var/run", "var/log"] {
        std::fs::create_dir_all(root.join(dir)).map_err(|e| io(dir, e))?;
    }

    let system = etc.join("systemd").join("system");
    let wants = system.join("multi-user.target.wants");
    std::fs::create_dir_all(&wants).map_err(|e| io("systemd wants dir", e))?;
    std::fs::write(system.join("serial-getty@ttyS0.service"), SERIAL_GETTY_UNIT)
        .map_err(|e| io("serial getty unit", e))?;
    replace_symlink(
        Path::new("/etc/systemd/system/serial-getty@ttyS0.service"),
        &wants.join("serial-getty@ttyS0.service"),
    )?;

    let ssh_unit = if root.join("lib/systemd/system/ssh.service").exists() {
        "/lib/systemd/system/ssh.service"
    } else {
        "/lib/systemd/system/sshd.service"
    };
    replace_symlink(Path::new(ssh_unit), &wants.join("ssh.service"))?;

    let sshd_config = etc.join("ssh").join("sshd_config");
    if let Ok(content) = std::fs::read_to_string(&sshd_config) {
        std::fs::write(&sshd_config, permit_root_login_with_keys(&content))
            .map_err(|e| io("sshd_config", e))?;
    }

    std::fs::write(etc.join("fstab"), "# /etc/fstab - VMM generated\n/dev/vda / ext4 defaults 0 1\n")
        .map_err(|e| io("fstab", e))?;
    std::fs::write(etc.join("hostname"), "vmm-guest\n").map_err(|e| io("hostname", e))?;

    let network = etc.join("systemd").join("network");
    std::fs::create_dir_all(&network).map_err(|e| io("network dir", e))?;
    std::fs::write(network.join("10-eth0.network"), ETH0_NETWORK_UNIT)
        .map_err(|e| io("network unit", e))?;
    replace_symlink(
        Path::new("/lib/systemd/system/systemd-networkd.service"),
        &wants.join("systemd-networkd.service"),
    )?;

    let shadow = etc.join("shadow");
    if let Ok(content) = std::fs::read_to_string(&shadow) {
        std::fs::write(&shadow, lock_root_password(&content)).map_err(|e| io("shadow", e))?;
    }
    Ok(())
}

fn replace_symlink(target: &Path, link: &Path) -> Result<(), ImageError> {
    let _ = std::fs::remove_file(link);
    symlink(target, link)
        .map_err(|e| ImageError::Io(format!("cannot link {}: {e}", link.display())))
}

/// Key-only root login for sshd.
fn permit_root_login_with_keys(content: &str) -> String {
    if !content.contains("PermitRootLogin") {
        return format!("{content}\nPermitRootLogin prohibit-password\n");
    }
    content
        .replace("PermitRootLogin no", "PermitRootLogin prohibit-password")
        .replace("#PermitRootLogin", "PermitRootLogin")
}

/// Lock root's password (`*`) so only key-based login works.
fn lock_root_password(shadow: &str) -> String {
    shadow
        .split('\n')
        .map(|line| match line.strip_prefix("root:") {
            Some(rest) => match rest.split_once(':') {
                Some((_, tail)) => format!("root:*:{tail}"),
                None => line.to_string(),
            },
            None => line.to_string(),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeContainerExporter, FakeFilesystemFormatter};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Fixture {
        _tmp: tempfile::TempDir,
        paths: Paths,
        exporter: Arc<FakeContainerExporter>,
        formatter: Arc<FakeFilesystemFormatter>,
        service: ImageService,
    }

    fn fixture_with(config: ImagesConfig) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::new(tmp.path());
        paths.ensure_directories().unwrap();
        let exporter = Arc::new(FakeContainerExporter::debian());
        let formatter = Arc::new(FakeFilesystemFormatter::default());
        let service =
            ImageService::new(paths.clone(), config, exporter.clone(), formatter.clone()).unwrap();
        Fixture {
            _tmp: tmp,
            paths,
            exporter,
            formatter,
            service,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(ImagesConfig::default())
    }

    fn elf_header(e_type: u16, machine: u16) -> [u8; 20] {
        let mut h = [0u8; 20];
        h[..4].copy_from_slice(b"\x7fELF");
        h[4] = 2;
        h[5] = 1;
        h[16..18].copy_from_slice(&e_type.to_le_bytes());
        h[18..20].copy_from_slice(&machine.to_le_bytes());
        h
    }

    #[test]
    fn resolve_image_distinguishes_named_and_default() {
        let f = fixture();
        let err = f.service.resolve_image(None).unwrap_err();
        assert!(matches!(err, ImageError::DefaultImageMissing(_)));
        let err = f.service.resolve_image(Some("ubuntu")).unwrap_err();
        assert!(matches!(err, ImageError::ImageNotFound(ref n) if n == "ubuntu"));

        std::fs::write(f.paths.rootfs.join("rootfs.ext4"), b"base").unwrap();
        std::fs::write(f.paths.rootfs.join("ubuntu.ext4"), b"named").unwrap();
        assert_eq!(f.service.resolve_image(Some("")).unwrap(), f.paths.rootfs.join("rootfs.ext4"));
        assert_eq!(
            f.service.resolve_image(Some("ubuntu")).unwrap(),
            f.paths.rootfs.join("ubuntu.ext4")
        );
    }

    #[test]
    fn list_images_marks_default() {
        let f = fixture();
        std::fs::write(f.paths.rootfs.join("rootfs.ext4"), b"base").unwrap();
        std::fs::write(f.paths.rootfs.join("debian.ext4"), b"named!").unwrap();
        std::fs::write(f.paths.rootfs.join("notes.txt"), b"skip").unwrap();

        let images = f.service.list_images().unwrap();
        assert_eq!(images.len(), 2);
        assert_eq!(images[0].name, "debian");
        assert_eq!(images[0].size, 6);
        assert!(!images[0].is_default);
        assert_eq!(images[1].name, "rootfs");
        assert!(images[1].is_default);
    }

    #[test]
    fn delete_referenced_image_conflicts() {
        let f = fixture();
        std::fs::write(f.paths.rootfs.join("ubuntu.ext4"), b"named").unwrap();
        let err = f
            .service
            .delete_image("ubuntu", &["web".to_string()])
            .unwrap_err();
        assert!(matches!(err, ImageError::Conflict(ref m) if m.contains("web")));
        assert!(f.paths.rootfs.join("ubuntu.ext4").exists());

        f.service.delete_image("ubuntu", &[]).unwrap();
        assert!(!f.paths.rootfs.join("ubuntu.ext4").exists());
        assert!(matches!(
            f.service.delete_image("ubuntu", &[]),
            Err(ImageError::ImageNotFound(_))
        ));
    }

    #[test]
    fn import_container_builds_image_and_cleans_staging() {
        let f = fixture();
        let info = f.service.import_container("debian:12", "deb", Some(128)).unwrap();
        assert_eq!(info.path, f.paths.rootfs.join("deb.ext4"));
        assert!(info.path.exists());
        assert_eq!(f.exporter.exported(), vec!["debian:12".to_string()]);

        let builds = f.formatter.builds();
        assert_eq!(builds.len(), 1);
        assert_eq!(builds[0].1, 128 * 1024 * 1024);
        let leftovers: Vec<_> = std::fs::read_dir(&f.paths.state).unwrap().collect();
        assert!(leftovers.is_empty());

        let err = f.service.import_container("debian:12", "deb", None).unwrap_err();
        assert!(matches!(err, ImageError::AlreadyExists(_)));
    }

    #[test]
    fn import_rejects_non_debian_tree() {
        let f = fixture();
        f.exporter.set_files(vec![("etc/alpine-release", "3.19\n")]);
        let err = f.service.import_container("alpine", "alp", None).unwrap_err();
        assert!(matches!(err, ImageError::UnsupportedImage(_)));
        assert!(!f.paths.rootfs.join("alp.ext4").exists());
    }

    #[test]
    fn prepare_guest_tree_installs_console_and_ssh_settings() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        std::fs::create_dir_all(root.join("etc/ssh")).unwrap();
        std::fs::write(root.join("etc/debian_version"), "12\n").unwrap();
        std::fs::write(root.join("etc/ssh/sshd_config"), "#PermitRootLogin no\n").unwrap();
        std::fs::write(root.join("etc/shadow"), "root:$6$hash:19000:0:::::\nuser:x:1:::::\n")
            .unwrap();

        prepare_guest_tree(root).unwrap();
        prepare_guest_tree(root).unwrap();

        let wants = root.join("etc/systemd/system/multi-user.target.wants");
        assert_eq!(
            std::fs::read_link(wants.join("serial-getty@ttyS0.service")).unwrap(),
            PathBuf::from("/etc/systemd/system/serial-getty@ttyS0.service")
        );
        assert_eq!(std::fs::read_to_string(root.join("etc/hostname")).unwrap(), "vmm-guest\n");
        assert_eq!(
            std::fs::read_to_string(root.join("etc/ssh/sshd_config")).unwrap(),
            "PermitRootLogin prohibit-password\n"
        );
        assert!(std::fs::read_to_string(root.join("etc/shadow"))
            .unwrap()
            .starts_with("root:*:19000"));
        assert!(root.join("var/log").is_dir());
    }

    #[test]
    fn permit_root_login_appended_when_absent() {
        assert_eq!(
            permit_root_login_with_keys("Port 22\n"),
            "Port 22\n\nPermitRootLogin prohibit-password\n"
        );
    }

    #[test]
    fn elf_header_checks() {
        assert!(check_elf_header(&elf_header(ET_EXEC, EM_X86_64), Some(EM_X86_64)).is_ok());
        assert!(check_elf_header(&elf_header(3, EM_X86_64), Some(EM_X86_64)).is_err());
        let err = check_elf_header(&elf_header(ET_EXEC, EM_AARCH64), Some(EM_X86_64)).unwrap_err();
        assert!(err.to_string().contains("architecture mismatch"));
        let mut not_elf = elf_header(ET_EXEC, EM_X86_64);
        not_elf[0] = 0;
        assert!(check_elf_header(&not_elf, Some(EM_X86_64)).is_err());
    }

    #[test]
    fn import_kernel_requires_force_to_overwrite() {
        let Some(machine) = host_machine() else { return };
        let f = fixture();
        let src = f.paths.state.join("custom-vmlinux");
        let mut bytes = elf_header(ET_EXEC, machine).to_vec();
        bytes.extend_from_slice(&[0u8; 64]);
        std::fs::write(&src, &bytes).unwrap();

        let info = f.service.import_kernel(&src, "custom", false).unwrap();
        assert_eq!(info.size, bytes.len() as u64);
        assert!(matches!(
            f.service.import_kernel(&src, "custom", false),
            Err(ImageError::AlreadyExists(_))
        ));
        assert!(f.service.import_kernel(&src, "custom", true).is_ok());
        assert_eq!(f.service.resolve_kernel(Some("custom")).unwrap(), f.paths.kernels.join("custom"));
    }

    #[test]
    fn import_kernel_rejects_non_elf() {
        let f = fixture();
        let src = f.paths.state.join("not-a-kernel");
        std::fs::write(&src, b"#!/bin/sh\necho hi\n0000000000").unwrap();
        assert!(matches!(
            f.service.import_kernel(&src, "bad", false),
            Err(ImageError::InvalidKernel(_))
        ));
        assert!(!f.paths.kernels.join("bad").exists());
    }

    #[test]
    fn default_kernel_cannot_be_deleted() {
        let f = fixture();
        std::fs::write(f.paths.kernels.join(DEFAULT_KERNEL_NAME), b"k").unwrap();
        std::fs::write(f.paths.kernels.join("old"), b"k").unwrap();
        assert!(matches!(
            f.service.delete_kernel(DEFAULT_KERNEL_NAME),
            Err(ImageError::Conflict(_))
        ));
        f.service.delete_kernel("old").unwrap();
        assert!(matches!(f.service.delete_kernel("old"), Err(ImageError::KernelNotFound(_))));

        let kernels = f.service.list_kernels().unwrap();
        assert_eq!(kernels.len(), 1);
        assert!(kernels[0].is_default);
    }

    #[tokio::test]
    async fn ensure_base_images_downloads_latest_kernel_release() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/owner/repo/releases"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([{
                "tag_name": "kernel-6.1",
                "assets": [{
                    "name": "vmlinux.bin",
                    "browser_download_url": format!("{}/dl/vmlinux.bin", server.uri()),
                }],
            }])))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/dl/vmlinux.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"kernel".to_vec()))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/dl/rootfs.ext4"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"rootfs".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let f = fixture_with(ImagesConfig {
            github_api: server.uri(),
            kernel_release_repo: "owner/repo".to_string(),
            kernel_release_prefix: "kernel-".to_string(),
            fallback_kernel_url: format!("{}/fallback", server.uri()),
            rootfs_url: format!("{}/dl/rootfs.ext4", server.uri()),
        });

        f.service.ensure_base_images().await.unwrap();
        assert_eq!(std::fs::read(f.service.default_kernel_path()).unwrap(), b"kernel");
        assert_eq!(std::fs::read(f.service.default_rootfs_path()).unwrap(), b"rootfs");

        // Second call finds both files and makes no requests
        f.service.ensure_base_images().await.unwrap();
    }

    #[tokio::test]
    async fn ensure_base_images_falls_back_when_release_lookup_fails() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/owner/repo/releases"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/fallback"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"fallback".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let f = fixture_with(ImagesConfig {
            github_api: server.uri(),
            kernel_release_repo: "owner/repo".to_string(),
            kernel_release_prefix: "kernel-".to_string(),
            fallback_kernel_url: format!("{}/fallback", server.uri()),
            rootfs_url: format!("{}/missing-rootfs", server.uri()),
        });

        let err = f.service.ensure_base_images().await.unwrap_err();
        assert!(matches!(err, ImageError::Download(_)));
        assert_eq!(std::fs::read(f.service.default_kernel_path()).unwrap(), b"fallback");
        assert!(!f.service.default_rootfs_path().exists());
    }
}
