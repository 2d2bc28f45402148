// SPDX-License-Identifier: GPL-2.0-only
use crate::backend::traits::{
    BackendError, ContainerExporter, FilesystemFormatter, FilesystemResizer, LoopImageMounter,
};
use crate::tool::{self, ToolError};
use std::path::Path;
use std::process::{Command, Stdio};

/// `mount -o loop` / `umount`. Requires CAP_SYS_ADMIN.
#[derive(Debug, Default, Clone)]
pub struct LoopMounter;

impl LoopImageMounter for LoopMounter {
    fn mount(&self, image: &Path, mount_point: &Path) -> Result<(), BackendError> {
        tool::run("mount", [
            "-o".as_ref(),
            "loop".as_ref(),
            image.as_os_str(),
            mount_point.as_os_str(),
        ])?;
        Ok(())
    }

    fn unmount(&self, mount_point: &Path) -> Result<(), BackendError> {
        tool::run("umount", [mount_point])?;
        Ok(())
    }
}

/// e2fsprogs-backed formatter and resizer.
#[derive(Debug, Default, Clone)]
pub struct Ext4Tools;

impl FilesystemResizer for Ext4Tools {
    fn check(&self, image: &Path) -> Result<(), BackendError> {
        // e2fsck exits 1 when it corrected errors; only >= 4 is a failure
        let output = Command::new("e2fsck")
            .arg("-f")
            .arg("-y")
            .arg(image)
            .output()
            .map_err(|e| ToolError::new("e2fsck", format!("cannot execute: {e}")))?;
        match output.status.code() {
            Some(code) if code < 4 => Ok(()),
            _ => Err(ToolError::new(
                "e2fsck",
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            )
            .into()),
        }
    }

    fn grow(&self, image: &Path) -> Result<(), BackendError> {
        tool::run("resize2fs", [image])?;
        Ok(())
    }
}

/// ext4 volume labels are limited to 16 bytes.
fn ext4_label(label: &str) -> &str {
    let mut end = label.len().min(16);
    while !label.is_char_boundary(end) {
        end -= 1;
    }
    &label[..end]
}

impl FilesystemFormatter for Ext4Tools {
    fn format(&self, image: &Path, label: &str) -> Result<(), BackendError> {
        tool::run("mkfs.ext4", [
            "-F".as_ref(),
            "-q".as_ref(),
            "-L".as_ref(),
            ext4_label(label).as_ref(),
            image.as_os_str(),
        ])?;
        Ok(())
    }

    fn build_from_dir(&self, source_dir: &Path, image: &Path, size_bytes: u64) -> Result<(), BackendError> {
        // mke2fs -d <dir> -t ext4 <output> <size>
        let size_kb = format!("{}k", size_bytes.div_ceil(1024));
        tool::run("mke2fs", [
            "-q".as_ref(),
            "-d".as_ref(),
            source_dir.as_os_str(),
            "-t".as_ref(),
            "ext4".as_ref(),
            "-L".as_ref(),
            "rootfs".as_ref(),
            image.as_os_str(),
            size_kb.as_ref(),
        ])?;
        Ok(())
    }
}

/// Flattens images with `docker create` + `docker export`.
#[derive(Debug, Clone)]
pub struct DockerExporter {
    binary: String,
}

impl Default for DockerExporter {
    fn default() -> Self {
        DockerExporter {
            binary: "docker".to_string(),
        }
    }
}

impl DockerExporter {
    pub fn with_binary(binary: impl Into<String>) -> Self {
        DockerExporter { binary: binary.into() }
    }

    fn stream_export(&self, container: &str, dest_dir: &Path) -> Result<(), BackendError> {
        let mut child = Command::new(&self.binary)
            .args(["export", container])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ToolError::new(&self.binary, format!("cannot execute: {e}")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BackendError::Io("docker export produced no stdout".to_string()))?;

        let mut archive = tar::Archive::new(stdout);
        archive.set_preserve_permissions(true);
        let unpacked = archive.unpack(dest_dir);

        let output = child
            .wait_with_output()
            .map_err(|e| BackendError::Io(format!("cannot wait for docker export: {e}")))?;
        if !output.status.success() {
            return Err(ToolError::new(
                format!("{} export", self.binary),
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            )
            .into());
        }
        unpacked.map_err(|e| BackendError::Io(format!("cannot unpack container export: {e}")))
    }
}

impl ContainerExporter for DockerExporter {
    fn export(&self, image_ref: &str, dest_dir: &Path) -> Result<(), BackendError> {
        let container = tool::run(&self.binary, ["create", image_ref])?.trim().to_string();
        if container.is_empty() {
            return Err(BackendError::Io(format!("docker create returned no id for '{image_ref}'")));
        }
        let result = self.stream_export(&container, dest_dir);
        if let Err(e) = tool::run(&self.binary, ["rm", container.as_str()]) {
            tracing::warn!(container = %container, error = %e, "failed to remove export container");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ext4_label_is_truncated_to_sixteen_bytes() {
        assert_eq!(ext4_label("code"), "code");
        assert_eq!(ext4_label("a-very-long-mount-tag-name"), "a-very-long-moun");
    }

    #[test]
    fn docker_exporter_reports_missing_binary() {
        let tmp = tempfile::tempdir().unwrap();
        let exporter = DockerExporter::with_binary("/nonexistent/docker");
        let err = exporter.export("alpine", tmp.path()).unwrap_err();
        assert!(matches!(err, BackendError::Tool(ref t) if t.tool == "/nonexistent/docker"));
    }

    #[test]
    fn loop_mounter_surfaces_tool_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let image = tmp.path().join("missing.ext4");
        // Fails either for lack of privileges or because the image is missing
        assert!(LoopMounter.mount(&image, tmp.path()).is_err());
    }
}
