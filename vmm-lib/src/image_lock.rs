// SPDX-License-Identifier: GPL-2.0-only

//! Exclusive, path-keyed locks over filesystem images.
//!
//! Every operation that loop-mounts an image or rewrites it holds the lock
//! for that image's path for its whole duration. The lock is an `flock` on a
//! per-image file under the lock directory, so it excludes other `vmm`
//! processes as well as other threads of this one.

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

const RETRY_INTERVAL: Duration = Duration::from_millis(25);

/// The image stayed locked for longer than the acquire timeout.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("image {} is busy", path.display())]
pub struct ImageBusy {
    pub path: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error(transparent)]
    Busy(#[from] ImageBusy),
    #[error("cannot open lock file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Default)]
struct LockTable {
    held: Mutex<HashSet<PathBuf>>,
    released: Condvar,
}

impl LockTable {
    fn lock(&self) -> MutexGuard<'_, HashSet<PathBuf>> {
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn release(&self, path: &Path) {
        self.lock().remove(path);
        self.released.notify_all();
    }
}

/// Shared lock table. Clones refer to the same table and lock directory.
#[derive(Clone)]
pub struct ImageLocks {
    table: Arc<LockTable>,
    dir: PathBuf,
    timeout: Duration,
}

impl ImageLocks {
    pub fn new(dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        ImageLocks {
            table: Arc::new(LockTable::default()),
            dir: dir.into(),
            timeout,
        }
    }

    /// The lock file guarding `image`.
    pub fn lock_file(&self, image: &Path) -> PathBuf {
        let digest = data_encoding::HEXLOWER.encode(&Sha256::digest(image.as_os_str().as_bytes()));
        let stem = image
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.dir.join(format!("{stem}-{}.lock", &digest[..16]))
    }

    /// Block until `path` is free, then hold it until the guard drops.
    pub fn acquire(&self, path: &Path) -> Result<ImageLockGuard, LockError> {
        let key = path.to_path_buf();
        let deadline = Instant::now() + self.timeout;
        self.claim_local(&key, deadline)?;
        match self.claim_file(&key, deadline) {
            Ok(flock) => Ok(ImageLockGuard {
                table: Arc::clone(&self.table),
                path: key,
                _flock: flock,
            }),
            Err(e) => {
                self.table.release(&key);
                Err(e)
            }
        }
    }

    /// Threads of this process queue on the table before touching the file.
    fn claim_local(&self, key: &Path, deadline: Instant) -> Result<(), ImageBusy> {
        let mut held = self.table.lock();
        while held.contains(key) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ImageBusy { path: key.to_path_buf() });
            }
            let (guard, _) = self
                .table
                .released
                .wait_timeout(held, remaining)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            held = guard;
        }
        held.insert(key.to_path_buf());
        Ok(())
    }

    fn claim_file(&self, key: &Path, deadline: Instant) -> Result<Flock<File>, LockError> {
        let lock_path = self.lock_file(key);
        let io_err = |source: std::io::Error| LockError::Io {
            path: lock_path.clone(),
            source,
        };
        std::fs::create_dir_all(&self.dir).map_err(io_err)?;
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(io_err)?;
        loop {
            match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                Ok(flock) => {
                    tracing::debug!(image = %key.display(), lock = %lock_path.display(), "acquired image lock");
                    return Ok(flock);
                }
                Err((returned, Errno::EAGAIN | Errno::EINTR)) => file = returned,
                Err((_, errno)) => return Err(io_err(std::io::Error::from(errno))),
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ImageBusy { path: key.to_path_buf() }.into());
            }
            std::thread::sleep(remaining.min(RETRY_INTERVAL));
        }
    }

    /// Whether this process currently holds the lock for `path`.
    pub fn is_locked(&self, path: &Path) -> bool {
        self.table.lock().contains(path)
    }
}

/// Releases the image path on drop, on every exit path including unwinding.
pub struct ImageLockGuard {
    table: Arc<LockTable>,
    path: PathBuf,
    _flock: Flock<File>,
}

impl ImageLockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ImageLockGuard {
    fn drop(&mut self) {
        // The flock field drops after this body, so the file unlocks last.
        self.table.release(&self.path);
        tracing::debug!(image = %self.path.display(), "released image lock");
    }
}

impl std::fmt::Debug for ImageLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageLockGuard").field("path", &self.path).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn locks(dir: &tempfile::TempDir, timeout: Duration) -> ImageLocks {
        ImageLocks::new(dir.path().join("locks"), timeout)
    }

    #[test]
    fn guard_releases_on_drop() {
        let tmp = tempfile::tempdir().unwrap();
        let locks = locks(&tmp, DEFAULT_TIMEOUT);
        let path = Path::new("/images/a.ext4");
        {
            let guard = locks.acquire(path).unwrap();
            assert_eq!(guard.path(), path);
            assert!(locks.is_locked(path));
            assert!(locks.lock_file(path).exists());
        }
        assert!(!locks.is_locked(path));
    }

    #[test]
    fn different_paths_do_not_contend() {
        let tmp = tempfile::tempdir().unwrap();
        let locks = locks(&tmp, Duration::from_millis(10));
        let _a = locks.acquire(Path::new("/images/a.ext4")).unwrap();
        assert!(locks.acquire(Path::new("/images/b.ext4")).is_ok());
    }

    #[test]
    fn same_name_in_different_directories_gets_different_lock_files() {
        let tmp = tempfile::tempdir().unwrap();
        let locks = locks(&tmp, DEFAULT_TIMEOUT);
        let a = locks.lock_file(Path::new("/data/vms/web.ext4"));
        let b = locks.lock_file(Path::new("/other/vms/web.ext4"));
        assert_ne!(a, b);
        assert!(a.file_name().unwrap().to_string_lossy().starts_with("web.ext4-"));
    }

    #[test]
    fn same_path_times_out_as_busy() {
        let tmp = tempfile::tempdir().unwrap();
        let locks = locks(&tmp, Duration::from_millis(20));
        let path = Path::new("/images/a.ext4");
        let _held = locks.acquire(path).unwrap();
        match locks.acquire(path) {
            Err(LockError::Busy(busy)) => assert_eq!(busy.path, path),
            other => panic!("expected busy, got {other:?}"),
        }
    }

    #[test]
    fn independent_tables_exclude_each_other() {
        // Two tables over one directory stand in for two vmm processes.
        let tmp = tempfile::tempdir().unwrap();
        let first = locks(&tmp, Duration::from_millis(50));
        let second = locks(&tmp, Duration::from_millis(50));
        let path = Path::new("/images/shared.ext4");

        let held = first.acquire(path).unwrap();
        assert!(!second.is_locked(path));
        assert!(matches!(second.acquire(path), Err(LockError::Busy(_))));
        assert!(!second.is_locked(path));

        drop(held);
        assert!(second.acquire(path).is_ok());
    }

    #[test]
    fn waiter_in_other_table_gets_lock_after_release() {
        let tmp = tempfile::tempdir().unwrap();
        let first = locks(&tmp, DEFAULT_TIMEOUT);
        let second = locks(&tmp, Duration::from_secs(5));
        let path = PathBuf::from("/images/handoff.ext4");

        let held = first.acquire(&path).unwrap();
        let p = path.clone();
        let waiter = std::thread::spawn(move || second.acquire(&p).map(|_| ()));
        std::thread::sleep(Duration::from_millis(60));
        drop(held);
        assert!(waiter.join().unwrap().is_ok());
    }

    #[test]
    fn unwritable_lock_directory_is_an_io_error() {
        let tmp = tempfile::tempdir().unwrap();
        let blocker = tmp.path().join("locks");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let locks = ImageLocks::new(&blocker, Duration::from_millis(10));
        let path = Path::new("/images/a.ext4");
        assert!(matches!(locks.acquire(path), Err(LockError::Io { .. })));
        assert!(!locks.is_locked(path));
    }

    #[test]
    fn released_on_panic() {
        let tmp = tempfile::tempdir().unwrap();
        let locks = locks(&tmp, Duration::from_millis(50));
        let path = PathBuf::from("/images/panic.ext4");
        let inner = locks.clone();
        let p = path.clone();
        let result = std::thread::spawn(move || {
            let _guard = inner.acquire(&p).unwrap();
            panic!("mutation failed");
        })
        .join();
        assert!(result.is_err());
        assert!(locks.acquire(&path).is_ok());
    }

    #[test]
    fn holders_are_mutually_exclusive() {
        let tmp = tempfile::tempdir().unwrap();
        let locks = locks(&tmp, DEFAULT_TIMEOUT);
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let locks = locks.clone();
                let active = Arc::clone(&active);
                let max_seen = Arc::clone(&max_seen);
                std::thread::spawn(move || {
                    let _guard = locks.acquire(Path::new("/images/shared.ext4")).unwrap();
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(5));
                    active.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }
}
