// SPDX-License-Identifier: GPL-2.0-only
use crate::backend::{BackendError, FilesystemResizer, LoopImageMounter};
use crate::config::Paths;
use crate::image_lock::{ImageBusy, ImageLockGuard, ImageLocks, LockError};
use crate::image_service::{ImageError, ImageService};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Sentinel appended to every fstab line this crate writes.
pub const FSTAB_MARKER: &str = "# vmm-mount";

#[derive(Debug)]
pub enum StorageError {
    Image(ImageError),
    Busy(ImageBusy),
    Backend(BackendError),
    Io(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Image(e) => write!(f, "{e}"),
            StorageError::Busy(e) => write!(f, "{e}"),
            StorageError::Backend(e) => write!(f, "{e}"),
            StorageError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<ImageError> for StorageError {
    fn from(e: ImageError) -> Self {
        StorageError::Image(e)
    }
}

impl From<LockError> for StorageError {
    fn from(e: LockError) -> Self {
        match e {
            LockError::Busy(busy) => StorageError::Busy(busy),
            io @ LockError::Io { .. } => StorageError::Io(io.to_string()),
        }
    }
}

impl From<BackendError> for StorageError {
    fn from(e: BackendError) -> Self {
        StorageError::Backend(e)
    }
}

fn io_err(what: impl std::fmt::Display, e: impl std::fmt::Display) -> StorageError {
    StorageError::Io(format!("{what}: {e}"))
}

/// One injected fstab line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FstabEntry {
    pub device: String,
    pub mount_point: String,
    pub read_only: bool,
}

impl FstabEntry {
    pub fn to_line(&self) -> String {
        let options = if self.read_only {
            "defaults,nofail,ro"
        } else {
            "defaults,nofail"
        };
        format!(
            "{} {} ext4 {options} 0 2 {FSTAB_MARKER}",
            self.device, self.mount_point
        )
    }
}

/// Drop every marked line from `existing`, then append `entries`.
pub fn rewrite_fstab(existing: &str, entries: &[FstabEntry]) -> String {
    let mut out = String::new();
    for line in existing.lines() {
        if line.contains(FSTAB_MARKER) {
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }
    for entry in entries {
        out.push_str(&entry.to_line());
        out.push('\n');
    }
    out
}

pub fn resolver_config(servers: &[String]) -> String {
    let mut out = String::from("# Generated by vmm\n");
    for server in servers {
        out.push_str(&format!("nameserver {server}\n"));
    }
    out
}

/// A loop-mounted image, held under its image lock.
///
/// Dropping it unmounts, removes the mount directory, and only then
/// releases the lock. An image that fails to unmount stays locked for the
/// rest of the process.
pub struct MountedImage {
    mounter: Arc<dyn LoopImageMounter>,
    mount_point: PathBuf,
    lock: Option<ImageLockGuard>,
}

impl std::fmt::Debug for MountedImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountedImage")
            .field("mount_point", &self.mount_point)
            .finish_non_exhaustive()
    }
}

impl MountedImage {
    pub fn root(&self) -> &Path {
        &self.mount_point
    }
}

impl Drop for MountedImage {
    fn drop(&mut self) {
        if let Err(e) = self.mounter.unmount(&self.mount_point) {
            let image = self.lock.take().map(|lock| {
                let image = lock.path().to_path_buf();
                std::mem::forget(lock);
                image
            });
            tracing::warn!(
                mount_point = %self.mount_point.display(),
                image = ?image,
                error = %e,
                "failed to unmount image, keeping it locked"
            );
            return;
        }
        if let Err(e) = std::fs::remove_dir(&self.mount_point) {
            tracing::warn!(mount_point = %self.mount_point.display(), error = %e, "failed to remove mount point");
        }
    }
}

/// Per-VM root filesystems and boot-time guest configuration.
pub struct StorageService {
    paths: Paths,
    images: Arc<ImageService>,
    mounter: Arc<dyn LoopImageMounter>,
    resizer: Arc<dyn FilesystemResizer>,
    locks: ImageLocks,
    default_dns: Vec<String>,
}

impl StorageService {
    pub fn new(
        paths: Paths,
        images: Arc<ImageService>,
        mounter: Arc<dyn LoopImageMounter>,
        resizer: Arc<dyn FilesystemResizer>,
        locks: ImageLocks,
        default_dns: Vec<String>,
    ) -> Self {
        StorageService {
            paths,
            images,
            mounter,
            resizer,
            locks,
            default_dns,
        }
    }

    pub fn locks(&self) -> &ImageLocks {
        &self.locks
    }

    pub fn instance_path(&self, vm_name: &str) -> PathBuf {
        self.paths.vms.join(format!("{vm_name}.ext4"))
    }

    /// Return the VM's root filesystem, creating it from the base image on
    /// first use.
    ///
    /// An existing instance is returned untouched. A new one is a byte copy
    /// of the base image, grown to `disk_size_mb` only when that is larger.
    pub fn materialize_instance(
        &self,
        vm_name: &str,
        image: Option<&str>,
        disk_size_mb: u64,
    ) -> Result<PathBuf, StorageError> {
        let dest = self.instance_path(vm_name);
        let _lock = self.locks.acquire(&dest)?;
        if dest.exists() {
            return Ok(dest);
        }
        let source = self.images.resolve_image(image)?;

        std::fs::create_dir_all(&self.paths.vms)
            .map_err(|e| io_err(format!("cannot create {}", self.paths.vms.display()), e))?;
        let tmp = self.paths.vms.join(format!(".{vm_name}.ext4.tmp"));
        let built = self.copy_and_grow(&source, &tmp, disk_size_mb);
        if let Err(e) = built {
            let _ = std::fs::remove_file(&tmp);
            return Err(e);
        }
        std::fs::rename(&tmp, &dest).map_err(|e| {
            let _ = std::fs::remove_file(&tmp);
            io_err(format!("cannot rename to {}", dest.display()), e)
        })?;
        tracing::info!(vm_name = %vm_name, source = %source.display(), path = %dest.display(), "materialized root filesystem");
        Ok(dest)
    }

    fn copy_and_grow(&self, source: &Path, tmp: &Path, disk_size_mb: u64) -> Result<(), StorageError> {
        let copied = std::fs::copy(source, tmp)
            .map_err(|e| io_err(format!("cannot copy {}", source.display()), e))?;
        let requested = disk_size_mb.saturating_mul(1024 * 1024);
        if requested <= copied {
            return Ok(());
        }

        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(tmp)
            .map_err(|e| io_err(format!("cannot open {}", tmp.display()), e))?;
        file.set_len(requested)
            .map_err(|e| io_err(format!("cannot extend {}", tmp.display()), e))?;
        drop(file);

        if let Err(e) = self.resizer.check(tmp) {
            tracing::warn!(path = %tmp.display(), error = %e, "filesystem check before resize failed");
        }
        self.resizer.grow(tmp)?;
        tracing::debug!(path = %tmp.display(), size_mb = disk_size_mb, "grew root filesystem");
        Ok(())
    }

    /// Loop-mount `image` under its exclusive lock.
    pub fn mount_image(&self, image: &Path) -> Result<MountedImage, StorageError> {
        let lock = self.locks.acquire(image)?;
        self.mount_locked(image, lock)
    }

    /// Loop-mount `image` under a lock the caller already holds for it.
    pub fn mount_locked(&self, image: &Path, lock: ImageLockGuard) -> Result<MountedImage, StorageError> {
        debug_assert_eq!(lock.path(), image);
        let mount_point = self
            .paths
            .state
            .join(format!("mnt-{}", uuid::Uuid::new_v4().simple()));
        std::fs::create_dir_all(&mount_point)
            .map_err(|e| io_err(format!("cannot create {}", mount_point.display()), e))?;
        if let Err(e) = self.mounter.mount(image, &mount_point) {
            let _ = std::fs::remove_dir(&mount_point);
            return Err(e.into());
        }
        Ok(MountedImage {
            mounter: Arc::clone(&self.mounter),
            mount_point,
            lock: Some(lock),
        })
    }

    /// Authorize `public_key` for root. No key means nothing is mounted.
    pub fn inject_ssh_key(&self, image: &Path, public_key: Option<&str>) -> Result<(), StorageError> {
        let Some(key) = public_key.map(str::trim).filter(|k| !k.is_empty()) else {
            return Ok(());
        };
        let mounted = self.mount_image(image)?;
        let root_home = mounted.root().join("root");
        let ssh_dir = root_home.join(".ssh");
        let keys = ssh_dir.join("authorized_keys");

        std::fs::create_dir_all(&ssh_dir)
            .map_err(|e| io_err(format!("cannot create {}", ssh_dir.display()), e))?;
        std::fs::set_permissions(&ssh_dir, std::fs::Permissions::from_mode(0o700))
            .map_err(|e| io_err(format!("cannot chmod {}", ssh_dir.display()), e))?;
        std::fs::write(&keys, format!("{key}\n"))
            .map_err(|e| io_err(format!("cannot write {}", keys.display()), e))?;
        std::fs::set_permissions(&keys, std::fs::Permissions::from_mode(0o600))
            .map_err(|e| io_err(format!("cannot chmod {}", keys.display()), e))?;

        // Hand the files to whoever owns the guest's /root
        let owner = std::fs::metadata(&root_home)
            .map_err(|e| io_err(format!("cannot stat {}", root_home.display()), e))?;
        let uid = Some(nix::unistd::Uid::from_raw(owner.uid()));
        let gid = Some(nix::unistd::Gid::from_raw(owner.gid()));
        for path in [&ssh_dir, &keys] {
            nix::unistd::chown(path.as_path(), uid, gid)
                .map_err(|e| io_err(format!("cannot chown {}", path.display()), e))?;
        }
        tracing::debug!(image = %image.display(), "injected SSH key");
        Ok(())
    }

    /// Overwrite the guest's `/etc/resolv.conf`. An empty list selects the
    /// configured defaults.
    pub fn inject_dns_config(&self, image: &Path, servers: &[String]) -> Result<(), StorageError> {
        let servers = if servers.is_empty() {
            self.default_dns.as_slice()
        } else {
            servers
        };
        let mounted = self.mount_image(image)?;
        let etc = mounted.root().join("etc");
        std::fs::create_dir_all(&etc)
            .map_err(|e| io_err(format!("cannot create {}", etc.display()), e))?;
        let resolv = etc.join("resolv.conf");
        // Often a symlink into /run; replace it with a regular file
        if std::fs::symlink_metadata(&resolv).is_ok_and(|m| m.file_type().is_symlink()) {
            std::fs::remove_file(&resolv)
                .map_err(|e| io_err(format!("cannot remove {}", resolv.display()), e))?;
        }
        std::fs::write(&resolv, resolver_config(servers))
            .map_err(|e| io_err(format!("cannot write {}", resolv.display()), e))?;
        tracing::debug!(image = %image.display(), servers = ?servers, "injected DNS config");
        Ok(())
    }

    /// Replace every marked fstab entry with `entries` and create their
    /// mount points.
    pub fn inject_mount_table(&self, image: &Path, entries: &[FstabEntry]) -> Result<(), StorageError> {
        let mounted = self.mount_image(image)?;
        let root = mounted.root();
        let fstab = root.join("etc").join("fstab");
        let existing = match std::fs::read_to_string(&fstab) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(io_err(format!("cannot read {}", fstab.display()), e)),
        };
        if let Some(parent) = fstab.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| io_err(format!("cannot create {}", parent.display()), e))?;
        }
        std::fs::write(&fstab, rewrite_fstab(&existing, entries))
            .map_err(|e| io_err(format!("cannot write {}", fstab.display()), e))?;

        for entry in entries {
            let dir = root.join(entry.mount_point.trim_start_matches('/'));
            std::fs::create_dir_all(&dir)
                .map_err(|e| io_err(format!("cannot create {}", dir.display()), e))?;
        }
        Ok(())
    }

    /// Remove the VM's root filesystem if present.
    pub fn delete_instance(&self, vm_name: &str) -> Result<(), StorageError> {
        let path = self.instance_path(vm_name);
        let _lock = self.locks.acquire(&path)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(format!("cannot remove {}", path.display()), e)),
        }
    }
}
