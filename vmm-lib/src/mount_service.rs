// SPDX-License-Identifier: GPL-2.0-only
use crate::backend::{BackendError, FilesystemFormatter};
use crate::config::Paths;
use crate::image_lock::{ImageBusy, LockError};
use crate::storage_service::{StorageError, StorageService};
use crate::vm::MountDeclaration;
use std::io;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const BLOCK: u64 = 4096;
const INODE_OVERHEAD: u64 = 256;
const MIN_IMAGE_BYTES: u64 = 64 * 1024 * 1024;
const MIB: u64 = 1024 * 1024;

#[derive(Debug)]
pub enum MountError {
    /// The host directory behind a mount does not exist.
    HostPathMissing(PathBuf),
    Busy(ImageBusy),
    Storage(StorageError),
    Backend(BackendError),
    Io(String),
}

impl std::fmt::Display for MountError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MountError::HostPathMissing(p) => {
                write!(f, "host directory {} does not exist", p.display())
            }
            MountError::Busy(e) => write!(f, "{e}"),
            MountError::Storage(e) => write!(f, "{e}"),
            MountError::Backend(e) => write!(f, "{e}"),
            MountError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for MountError {}

impl From<StorageError> for MountError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::Busy(busy) => MountError::Busy(busy),
            other => MountError::Storage(other),
        }
    }
}

impl From<BackendError> for MountError {
    fn from(e: BackendError) -> Self {
        MountError::Backend(e)
    }
}

impl From<LockError> for MountError {
    fn from(e: LockError) -> Self {
        match e {
            LockError::Busy(busy) => MountError::Busy(busy),
            io @ LockError::Io { .. } => MountError::Io(io.to_string()),
        }
    }
}

/// Bytes needed for an ext4 image holding `dir`: block-rounded contents plus
/// inode overhead, with 50 % headroom, at least 64 MiB, rounded to 1 MiB.
pub fn tree_image_size(dir: &Path) -> io::Result<u64> {
    let mut used = 0u64;
    for entry in walkdir::WalkDir::new(dir).follow_links(false) {
        let entry = entry.map_err(io::Error::other)?;
        let meta = entry.metadata().map_err(io::Error::other)?;
        let data = if meta.is_file() { meta.len() } else { 0 };
        used += data.div_ceil(BLOCK).max(1) * BLOCK + INODE_OVERHEAD;
    }
    let padded = (used + used / 2).max(MIN_IMAGE_BYTES);
    Ok(padded.div_ceil(MIB) * MIB)
}

/// Stream `src` into `dst` as a tar archive, preserving permissions,
/// symlinks, and special files.
pub fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    let (reader, writer) = UnixStream::pair()?;
    std::thread::scope(|scope| {
        let producer = scope.spawn(move || -> io::Result<()> {
            let mut builder = tar::Builder::new(writer);
            builder.follow_symlinks(false);
            builder.append_dir_all(".", src)?;
            builder.into_inner()?;
            Ok(())
        });

        let mut archive = tar::Archive::new(reader);
        archive.set_preserve_permissions(true);
        archive.set_preserve_mtime(true);
        let unpacked = archive.unpack(dst);
        let mut rest = archive.into_inner();
        if unpacked.is_ok() {
            // Consume the end-of-archive padding so the producer never blocks
            let _ = io::copy(&mut rest, &mut io::sink());
        }
        drop(rest);

        let produced = producer
            .join()
            .map_err(|_| io::Error::other("archive producer panicked"))?;
        unpacked?;
        produced
    })
}

/// Host-directory mount images under `mounts/`.
pub struct MountService {
    paths: Paths,
    storage: Arc<StorageService>,
    formatter: Arc<dyn FilesystemFormatter>,
}

impl MountService {
    pub fn new(paths: Paths, storage: Arc<StorageService>, formatter: Arc<dyn FilesystemFormatter>) -> Self {
        MountService {
            paths,
            storage,
            formatter,
        }
    }

    pub fn image_path(&self, vm_name: &str, tag: &str) -> PathBuf {
        self.paths.mounts.join(format!("{vm_name}-{tag}.ext4"))
    }

    /// Build the mount's image unless it already exists, and record its path
    /// on the declaration.
    pub fn create_mount_image(
        &self,
        mount: &mut MountDeclaration,
        vm_name: &str,
    ) -> Result<PathBuf, MountError> {
        let dest = self.image_path(vm_name, &mount.tag);
        if !dest.exists() {
            self.build(mount, &dest)?;
        }
        mount.image_path = Some(dest.clone());
        Ok(dest)
    }

    /// Rebuild the mount's image from the host directory's current contents.
    /// The owning VM must not be running.
    pub fn sync_mount_image(
        &self,
        mount: &mut MountDeclaration,
        vm_name: &str,
    ) -> Result<PathBuf, MountError> {
        let dest = self.image_path(vm_name, &mount.tag);
        self.build(mount, &dest)?;
        mount.image_path = Some(dest.clone());
        Ok(dest)
    }

    pub fn delete_mount_images(&self, vm_name: &str, mounts: &[MountDeclaration]) {
        for mount in mounts {
            let path = mount
                .image_path
                .clone()
                .unwrap_or_else(|| self.image_path(vm_name, &mount.tag));
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "failed to remove mount image");
                }
            }
        }
    }

    fn build(&self, mount: &MountDeclaration, dest: &Path) -> Result<(), MountError> {
        if !mount.host_path.is_dir() {
            return Err(MountError::HostPathMissing(mount.host_path.clone()));
        }
        let size = tree_image_size(&mount.host_path).map_err(|e| {
            MountError::Io(format!("cannot size {}: {e}", mount.host_path.display()))
        })?;
        std::fs::create_dir_all(&self.paths.mounts).map_err(|e| {
            MountError::Io(format!("cannot create {}: {e}", self.paths.mounts.display()))
        })?;

        let lock = self.storage.locks().acquire(dest)?;
        let result = self.fill(mount, dest, size, lock);
        if result.is_err() {
            let _ = std::fs::remove_file(dest);
        }
        result?;
        tracing::info!(tag = %mount.tag, host_path = %mount.host_path.display(), image = %dest.display(), size, "built mount image");
        Ok(())
    }

    fn fill(
        &self,
        mount: &MountDeclaration,
        dest: &Path,
        size: u64,
        lock: crate::image_lock::ImageLockGuard,
    ) -> Result<(), MountError> {
        let _ = std::fs::remove_file(dest);
        let file = std::fs::File::create(dest)
            .map_err(|e| MountError::Io(format!("cannot create {}: {e}", dest.display())))?;
        file.set_len(size)
            .map_err(|e| MountError::Io(format!("cannot size {}: {e}", dest.display())))?;
        drop(file);

        self.formatter.format(dest, &mount.tag)?;
        let mounted = self.storage.mount_locked(dest, lock)?;
        copy_tree(&mount.host_path, mounted.root()).map_err(|e| {
            MountError::Io(format!("cannot copy {}: {e}", mount.host_path.display()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ImagesConfig;
    use crate::image_lock::ImageLocks;
    use crate::image_service::ImageService;
    use crate::test_support::{
        FakeContainerExporter, FakeFilesystemFormatter, FakeFilesystemResizer, FakeLoopMounter,
    };
    use crate::vm::parse_mount_spec;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;

    struct Fixture {
        tmp: tempfile::TempDir,
        mounter: Arc<FakeLoopMounter>,
        formatter: Arc<FakeFilesystemFormatter>,
        service: MountService,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::new(&tmp.path().join("data"));
        paths.ensure_directories().unwrap();
        let formatter = Arc::new(FakeFilesystemFormatter::default());
        let images = Arc::new(
            ImageService::new(
                paths.clone(),
                ImagesConfig::default(),
                Arc::new(FakeContainerExporter::debian()),
                formatter.clone(),
            )
            .unwrap(),
        );
        let mounter = Arc::new(FakeLoopMounter::new());
        let storage = Arc::new(StorageService::new(
            paths.clone(),
            images,
            mounter.clone(),
            Arc::new(FakeFilesystemResizer::default()),
            ImageLocks::new(paths.locks.clone(), Duration::from_millis(50)),
            Vec::new(),
        ));
        let service = MountService::new(paths, storage, formatter.clone());
        Fixture {
            tmp,
            mounter,
            formatter,
            service,
        }
    }

    fn host_dir(f: &Fixture) -> PathBuf {
        let dir = f.tmp.path().join("host-src");
        std::fs::create_dir_all(dir.join("sub")).unwrap();
        std::fs::write(dir.join("main.rs"), "fn main() {}\n").unwrap();
        std::fs::write(dir.join("sub/run.sh"), "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(dir.join("sub/run.sh"), std::fs::Permissions::from_mode(0o755))
            .unwrap();
        std::os::unix::fs::symlink("main.rs", dir.join("link")).unwrap();
        dir
    }

    #[test]
    fn tree_image_size_has_floor_and_mib_rounding() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("small"), b"x").unwrap();
        assert_eq!(tree_image_size(tmp.path()).unwrap(), 64 * MIB);

        let big = std::fs::File::create(tmp.path().join("big")).unwrap();
        big.set_len(100 * MIB).unwrap();
        let size = tree_image_size(tmp.path()).unwrap();
        assert!(size >= 150 * MIB);
        assert_eq!(size % MIB, 0);
    }

    #[test]
    fn copy_tree_preserves_modes_and_symlinks() {
        let f = fixture();
        let src = host_dir(&f);
        let dst = f.tmp.path().join("copy");
        std::fs::create_dir_all(&dst).unwrap();

        copy_tree(&src, &dst).unwrap();
        assert_eq!(std::fs::read_to_string(dst.join("main.rs")).unwrap(), "fn main() {}\n");
        let mode = std::fs::metadata(dst.join("sub/run.sh")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
        assert_eq!(std::fs::read_link(dst.join("link")).unwrap(), PathBuf::from("main.rs"));
    }

    #[test]
    fn create_builds_image_and_records_path() {
        let f = fixture();
        let src = host_dir(&f);
        let mut mount = parse_mount_spec(&format!("{}:code", src.display())).unwrap();

        let path = f.service.create_mount_image(&mut mount, "web").unwrap();
        assert_eq!(path, f.service.image_path("web", "code"));
        assert_eq!(mount.image_path.as_deref(), Some(path.as_path()));
        assert!(path.exists());
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 64 * MIB);
        assert_eq!(f.formatter.formatted(), vec![(path.clone(), "code".to_string())]);

        let contents = f.mounter.contents(&path);
        assert_eq!(std::fs::read_to_string(contents.join("main.rs")).unwrap(), "fn main() {}\n");
        assert_eq!(f.mounter.active_mounts(), 0);
    }

    #[test]
    fn create_reuses_existing_image() {
        let f = fixture();
        let src = host_dir(&f);
        let mut mount = parse_mount_spec(&format!("{}:code", src.display())).unwrap();
        f.service.create_mount_image(&mut mount, "web").unwrap();
        f.service.create_mount_image(&mut mount, "web").unwrap();
        assert_eq!(f.formatter.formatted().len(), 1);
    }

    #[test]
    fn sync_rebuilds_from_current_contents() {
        let f = fixture();
        let src = host_dir(&f);
        let mut mount = parse_mount_spec(&format!("{}:code", src.display())).unwrap();
        let path = f.service.create_mount_image(&mut mount, "web").unwrap();

        std::fs::write(src.join("new.txt"), "fresh").unwrap();
        f.service.sync_mount_image(&mut mount, "web").unwrap();
        assert_eq!(f.formatter.formatted().len(), 2);
        let contents = f.mounter.contents(&path);
        assert_eq!(std::fs::read_to_string(contents.join("new.txt")).unwrap(), "fresh");
    }

    #[test]
    fn missing_host_dir_is_reported() {
        let f = fixture();
        let mut mount = parse_mount_spec("/definitely/not/here:code").unwrap();
        let err = f.service.create_mount_image(&mut mount, "web").unwrap_err();
        assert!(matches!(err, MountError::HostPathMissing(_)));
        assert!(mount.image_path.is_none());
    }

    #[test]
    fn failed_format_removes_partial_image() {
        let f = fixture();
        let src = host_dir(&f);
        f.formatter.fail_format(true);
        let mut mount = parse_mount_spec(&format!("{}:code", src.display())).unwrap();
        assert!(f.service.create_mount_image(&mut mount, "web").is_err());
        assert!(!f.service.image_path("web", "code").exists());
    }

    #[test]
    fn delete_mount_images_ignores_missing() {
        let f = fixture();
        let src = host_dir(&f);
        let mut mount = parse_mount_spec(&format!("{}:code", src.display())).unwrap();
        let path = f.service.create_mount_image(&mut mount, "web").unwrap();
        let other = parse_mount_spec("/nowhere:other").unwrap();
        f.service.delete_mount_images("web", &[mount, other]);
        assert!(!path.exists());
    }
}
