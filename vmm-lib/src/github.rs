// SPDX-License-Identifier: GPL-2.0-only
use serde::Deserialize;

/// A GitHub release.
#[derive(Debug, Clone, Deserialize)]
pub struct GitHubRelease {
    pub tag_name: String,
    #[serde(default)]
    pub published_at: Option<String>,
    #[serde(default)]
    pub prerelease: bool,
    #[serde(default)]
    pub draft: bool,
    #[serde(default)]
    pub assets: Vec<GitHubAsset>,
}

/// A GitHub release asset (downloadable file).
#[derive(Debug, Clone, Deserialize)]
pub struct GitHubAsset {
    pub name: String,
    pub browser_download_url: String,
    #[serde(default)]
    pub size: u64,
}

/// Errors from GitHub API operations.
#[derive(Debug)]
pub enum GitHubError {
    /// HTTP request failed.
    Http(String),
    /// API returned an error.
    Api(String),
    /// Release or asset not found.
    NotFound(String),
    /// JSON parsing error.
    Parse(String),
}

impl std::fmt::Display for GitHubError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GitHubError::Http(e) => write!(f, "GitHub API request failed: {e}"),
            GitHubError::Api(e) => write!(f, "GitHub API error: {e}"),
            GitHubError::NotFound(e) => write!(f, "not found: {e}"),
            GitHubError::Parse(e) => write!(f, "failed to parse GitHub response: {e}"),
        }
    }
}

impl std::error::Error for GitHubError {}

/// Client for the GitHub Releases API.
pub struct GitHubReleaseClient {
    client: reqwest::Client,
    api_base: String,
}

impl GitHubReleaseClient {
    pub fn new(client: reqwest::Client, api_base: impl Into<String>) -> Self {
        GitHubReleaseClient {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }

    /// List published releases for a repository (e.g., "raesene/baremetalvmm").
    pub async fn list_releases(&self, repo: &str) -> Result<Vec<GitHubRelease>, GitHubError> {
        let url = format!("{}/repos/{}/releases", self.api_base, repo);
        let resp = self
            .client
            .get(&url)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "vmm-image-downloader")
            .send()
            .await
            .map_err(|e| GitHubError::Http(e.to_string()))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(GitHubError::NotFound(format!("repository '{repo}' not found")));
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(GitHubError::Api(format!("HTTP {status}: {body}")));
        }

        let releases: Vec<GitHubRelease> = resp
            .json()
            .await
            .map_err(|e| GitHubError::Parse(e.to_string()))?;

        Ok(releases.into_iter().filter(|r| !r.draft).collect())
    }

    /// Download URL of `asset_name` in the newest release whose tag starts
    /// with `tag_prefix`. The API returns releases newest first.
    pub async fn latest_asset_url(
        &self,
        repo: &str,
        tag_prefix: &str,
        asset_name: &str,
    ) -> Result<String, GitHubError> {
        let releases = self.list_releases(repo).await?;
        let release = releases
            .iter()
            .find(|r| r.tag_name.starts_with(tag_prefix) && !r.prerelease)
            .ok_or_else(|| {
                GitHubError::NotFound(format!("no '{tag_prefix}*' release in '{repo}'"))
            })?;
        Self::find_asset(release, asset_name)
            .map(|a| a.browser_download_url.clone())
            .ok_or_else(|| {
                GitHubError::NotFound(format!(
                    "asset '{asset_name}' not found in release '{}'",
                    release.tag_name
                ))
            })
    }

    /// Find an asset by name in a release.
    pub fn find_asset<'a>(release: &'a GitHubRelease, name: &str) -> Option<&'a GitHubAsset> {
        release.assets.iter().find(|a| a.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn release(tag: &str, assets: &[&str]) -> serde_json::Value {
        serde_json::json!({
            "tag_name": tag,
            "prerelease": false,
            "draft": false,
            "assets": assets.iter().map(|name| serde_json::json!({
                "name": name,
                "browser_download_url": format!("https://example.com/{tag}/{name}"),
                "size": 100,
            })).collect::<Vec<_>>(),
        })
    }

    #[test]
    fn github_release_deserializes() {
        let json = r#"{"tag_name":"kernel-6.1","published_at":"2026-02-15T12:00:00Z","prerelease":false,"draft":false,"assets":[{"name":"vmlinux.bin","browser_download_url":"https://example.com/download","size":5000000,"content_type":"application/octet-stream"}]}"#;
        let release: GitHubRelease = serde_json::from_str(json).unwrap();
        assert_eq!(release.tag_name, "kernel-6.1");
        assert_eq!(release.assets.len(), 1);
        assert_eq!(release.assets[0].name, "vmlinux.bin");
    }

    #[tokio::test]
    async fn latest_asset_url_picks_newest_matching_tag() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/owner/repo/releases"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                release("v2.0", &["vmm"]),
                release("kernel-6.2", &["vmlinux.bin"]),
                release("kernel-6.1", &["vmlinux.bin"]),
            ])))
            .mount(&server)
            .await;

        let client = GitHubReleaseClient::new(reqwest::Client::new(), server.uri());
        let url = client
            .latest_asset_url("owner/repo", "kernel-", "vmlinux.bin")
            .await
            .unwrap();
        assert_eq!(url, "https://example.com/kernel-6.2/vmlinux.bin");
    }

    #[tokio::test]
    async fn latest_asset_url_reports_missing_asset() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/owner/repo/releases"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!([release("kernel-6.2", &["other"])])),
            )
            .mount(&server)
            .await;

        let client = GitHubReleaseClient::new(reqwest::Client::new(), server.uri());
        let err = client
            .latest_asset_url("owner/repo", "kernel-", "vmlinux.bin")
            .await
            .unwrap_err();
        assert!(matches!(err, GitHubError::NotFound(_)));
    }

    #[tokio::test]
    async fn missing_repository_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/owner/missing/releases"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = GitHubReleaseClient::new(reqwest::Client::new(), server.uri());
        let err = client.list_releases("owner/missing").await.unwrap_err();
        assert!(matches!(err, GitHubError::NotFound(_)));
    }

    #[test]
    fn github_error_display() {
        let err = GitHubError::NotFound("repo 'foo' not found".to_string());
        assert!(err.to_string().contains("not found"));

        let err = GitHubError::Http("connection refused".to_string());
        assert!(err.to_string().contains("request failed"));
    }
}
