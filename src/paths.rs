/// Centralized platform-specific path computation
///
/// Everything blobdex persists lives under one data directory:
///
/// ```text
/// <data_dir>/
///   git/<org>/<project>/<repo>.git   mirrored repositories
///   conf/<org>.json                  organization settings
///   indexed/<org>/<project>/<repo>.json  last-indexed ref state
///   index/                           tantivy index
/// ```
use std::path::{Path, PathBuf};

#[cfg(not(test))]
const APP_DIR: &str = "blobdex";
#[cfg(test)]
const APP_DIR: &str = "blobdex-test";

/// Platform-agnostic path utilities
pub struct PlatformPaths;

impl PlatformPaths {
    /// Default data directory
    ///
    /// - Windows: %LOCALAPPDATA%\blobdex
    /// - macOS: ~/Library/Application Support/blobdex
    /// - Linux/Unix: $XDG_DATA_HOME/blobdex or ~/.local/share/blobdex
    pub fn default_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
    }

    /// Default config file location
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
            .join("config.toml")
    }

    /// Directory holding mirrored git repositories
    pub fn git_dir(data_dir: &Path) -> PathBuf {
        data_dir.join("git")
    }

    /// Directory holding one settings JSON file per organization
    pub fn conf_dir(data_dir: &Path) -> PathBuf {
        data_dir.join("conf")
    }

    /// Directory holding per-repository indexed state
    pub fn indexed_dir(data_dir: &Path) -> PathBuf {
        data_dir.join("indexed")
    }

    /// Directory holding the full-text index
    pub fn index_dir(data_dir: &Path) -> PathBuf {
        data_dir.join("index")
    }

    /// Path of a mirrored repository
    pub fn repository_path(data_dir: &Path, organization: &str, project: &str, repository: &str) -> PathBuf {
        Self::git_dir(data_dir)
            .join(organization)
            .join(project)
            .join(format!("{}.git", repository))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_data_dir_ends_with_app_dir() {
        let dir = PlatformPaths::default_data_dir();
        assert!(dir.ends_with(APP_DIR));
    }

    #[test]
    fn test_default_config_path() {
        let path = PlatformPaths::default_config_path();
        assert!(path.ends_with("config.toml"));
        assert!(path.parent().unwrap().ends_with(APP_DIR));
    }

    #[test]
    fn test_layout_under_data_dir() {
        let data = Path::new("/srv/blobdex");
        assert_eq!(PlatformPaths::git_dir(data), PathBuf::from("/srv/blobdex/git"));
        assert_eq!(PlatformPaths::conf_dir(data), PathBuf::from("/srv/blobdex/conf"));
        assert_eq!(
            PlatformPaths::indexed_dir(data),
            PathBuf::from("/srv/blobdex/indexed")
        );
        assert_eq!(PlatformPaths::index_dir(data), PathBuf::from("/srv/blobdex/index"));
    }

    #[test]
    fn test_repository_path() {
        let path =
            PlatformPaths::repository_path(Path::new("/srv/blobdex"), "acme", "webapp", "origin");
        assert_eq!(path, PathBuf::from("/srv/blobdex/git/acme/webapp/origin.git"));
    }
}
