// SPDX-License-Identifier: GPL-2.0-only
use crate::tool::ToolError;
use std::path::Path;

/// Errors from host storage operations.
#[derive(Debug)]
pub enum BackendError {
    /// The source path does not exist or is inaccessible
    NotFound(String),
    /// Filesystem operation failed
    Io(String),
    /// A host tool exited unsuccessfully
    Tool(ToolError),
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendError::NotFound(e) => write!(f, "not found: {e}"),
            BackendError::Io(e) => write!(f, "I/O error: {e}"),
            BackendError::Tool(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for BackendError {}

impl From<ToolError> for BackendError {
    fn from(e: ToolError) -> Self {
        BackendError::Tool(e)
    }
}

/// Attach a filesystem image at a host directory.
///
/// Callers never use this directly; `StorageService::mount_image` pairs it
/// with the per-image lock and guarantees the unmount.
pub trait LoopImageMounter: Send + Sync {
    fn mount(&self, image: &Path, mount_point: &Path) -> Result<(), BackendError>;
    fn unmount(&self, mount_point: &Path) -> Result<(), BackendError>;
}

/// In-place growth of an ext4 image whose file has already been extended.
pub trait FilesystemResizer: Send + Sync {
    /// Forced check with automatic repair.
    fn check(&self, image: &Path) -> Result<(), BackendError>;
    /// Expand the filesystem to fill its file.
    fn grow(&self, image: &Path) -> Result<(), BackendError>;
}

/// Creation of ext4 images.
pub trait FilesystemFormatter: Send + Sync {
    /// Make an empty ext4 filesystem over an existing, pre-sized file.
    fn format(&self, image: &Path, label: &str) -> Result<(), BackendError>;
    /// Create `image` of `size_bytes` populated from `source_dir`.
    fn build_from_dir(&self, source_dir: &Path, image: &Path, size_bytes: u64) -> Result<(), BackendError>;
}

/// Flattens a container image into a plain directory tree.
pub trait ContainerExporter: Send + Sync {
    fn export(&self, image_ref: &str, dest_dir: &Path) -> Result<(), BackendError>;
}
