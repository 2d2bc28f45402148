// SPDX-License-Identifier: GPL-2.0-only
use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Errors from artifact downloads.
#[derive(Debug)]
pub enum DownloadError {
    /// HTTP request failed or returned a non-success status.
    Http(String),
    /// Filesystem operation failed.
    Io(String),
}

impl std::fmt::Display for DownloadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DownloadError::Http(e) => write!(f, "download failed: {e}"),
            DownloadError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for DownloadError {}

/// A completed download.
#[derive(Debug)]
pub struct Downloaded {
    pub path: PathBuf,
    pub sha256: String,
    pub size: u64,
}

/// Streams HTTP artifacts to disk.
///
/// Bytes go to `<dest>.tmp` while a SHA-256 is computed per chunk; the file
/// is renamed onto `dest` only after the stream completes, so a failed or
/// interrupted transfer never leaves a partial file under the final name.
#[derive(Clone)]
pub struct Downloader {
    client: reqwest::Client,
}

impl Downloader {
    pub fn new() -> Result<Self, DownloadError> {
        let client = reqwest::Client::builder()
            .user_agent("vmm-image-downloader")
            .build()
            .map_err(|e| DownloadError::Http(format!("cannot build HTTP client: {e}")))?;
        Ok(Downloader { client })
    }

    /// Access the underlying HTTP client (for GitHub API calls).
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub async fn fetch(&self, url: &str, dest: &Path) -> Result<Downloaded, DownloadError> {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DownloadError::Io(format!("cannot create directory {}: {e}", parent.display()))
            })?;
        }
        let temp_path = temp_path_for(dest);
        let result = self.stream_to(url, &temp_path).await;
        let (sha256, size) = match result {
            Ok(done) => done,
            Err(e) => {
                let _ = std::fs::remove_file(&temp_path);
                return Err(e);
            }
        };

        std::fs::rename(&temp_path, dest).map_err(|e| {
            let _ = std::fs::remove_file(&temp_path);
            DownloadError::Io(format!("cannot rename to {}: {e}", dest.display()))
        })?;

        tracing::info!(url = %url, dest = %dest.display(), size, sha256 = %sha256, "download complete");
        Ok(Downloaded {
            path: dest.to_path_buf(),
            sha256,
            size,
        })
    }

    async fn stream_to(&self, url: &str, temp_path: &Path) -> Result<(String, u64), DownloadError> {
        tracing::info!(url = %url, "downloading");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| DownloadError::Http(e.to_string()))?;

        if !response.status().is_success() {
            return Err(DownloadError::Http(format!("HTTP {} from {}", response.status(), url)));
        }

        let mut hasher = Sha256::new();
        let mut size = 0u64;
        let mut file = std::fs::File::create(temp_path)
            .map_err(|e| DownloadError::Io(format!("cannot create temp file: {e}")))?;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| DownloadError::Http(format!("stream error: {e}")))?;
            hasher.update(&chunk);
            size += chunk.len() as u64;
            std::io::Write::write_all(&mut file, &chunk)
                .map_err(|e| DownloadError::Io(format!("write error: {e}")))?;
        }
        file.sync_all()
            .map_err(|e| DownloadError::Io(format!("sync error: {e}")))?;

        Ok((format!("{:x}", hasher.finalize()), size))
    }
}

fn temp_path_for(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const HELLO_WORLD_SHA256: &str =
        "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[test]
    fn temp_path_appends_suffix() {
        assert_eq!(
            temp_path_for(Path::new("/data/rootfs.ext4")),
            PathBuf::from("/data/rootfs.ext4.tmp")
        );
    }

    #[tokio::test]
    async fn fetch_streams_body_and_hashes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/vmlinux.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello world".to_vec()))
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("kernels").join("vmlinux.bin");
        let downloader = Downloader::new().unwrap();
        let done = downloader
            .fetch(&format!("{}/vmlinux.bin", server.uri()), &dest)
            .await
            .unwrap();

        assert_eq!(done.size, 11);
        assert_eq!(done.sha256, HELLO_WORLD_SHA256);
        assert_eq!(std::fs::read(&dest).unwrap(), b"hello world");
        assert!(!temp_path_for(&dest).exists());
    }

    #[tokio::test]
    async fn failed_fetch_leaves_no_partial_file() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("rootfs.ext4");
        let downloader = Downloader::new().unwrap();
        let err = downloader
            .fetch(&format!("{}/missing", server.uri()), &dest)
            .await
            .unwrap_err();

        assert!(matches!(err, DownloadError::Http(_)));
        assert!(!dest.exists());
        assert!(!temp_path_for(&dest).exists());
    }
}
