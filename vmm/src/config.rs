// SPDX-License-Identifier: GPL-2.0-only
use anyhow::Context;
use std::path::{Path, PathBuf};
use vmm_lib::config::{config_path_for, Config};

/// The config file for this invocation, honoring `XDG_CONFIG_HOME` and
/// `SUDO_USER`.
pub fn default_config_path() -> PathBuf {
    let xdg = std::env::var_os("XDG_CONFIG_HOME").map(PathBuf::from);
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/root"));
    let sudo_user = std::env::var("SUDO_USER").ok();
    config_path_for(xdg.as_deref(), &home, sudo_user.as_deref())
}

/// Load the config at `path`. A missing file means defaults.
pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Config> {
    let path = path.as_ref();
    match Config::load(path) {
        Ok(config) => Ok(config),
        Err(e) if e.is_not_found() => {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            Ok(Config::default())
        }
        Err(e) => Err(e).with_context(|| format!("cannot load config {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_nonexistent_returns_default() {
        let config = load("/nonexistent/path/config.yaml").unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/vmm"));
    }

    #[test]
    fn load_invalid_yaml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "network: [not, a, map]\n").unwrap();
        let err = load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("cannot load config"));
    }

    #[test]
    fn load_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "data_dir: /srv/vmm\n").unwrap();
        let config = load(&path).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/srv/vmm"));
        assert_eq!(config.network.bridge_name, "vmm-br0");
    }
}
