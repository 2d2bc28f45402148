// SPDX-License-Identifier: GPL-2.0-only
pub mod host;
pub mod traits;

pub use host::{DockerExporter, Ext4Tools, LoopMounter};
pub use traits::{BackendError, ContainerExporter, FilesystemFormatter, FilesystemResizer, LoopImageMounter};
