/// Configuration system for blobdex
///
/// Supports loading from multiple sources with priority:
/// CLI args > Environment variables > Config file > Defaults
use crate::error::{BlobdexError, ConfigError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Where mirrors, settings, indexed state and the index live
    #[serde(default)]
    pub storage: StorageConfig,

    /// Indexing pipeline configuration
    #[serde(default)]
    pub indexing: IndexingConfig,

    /// Git plumbing configuration
    #[serde(default)]
    pub git: GitConfig,

    /// Scheduled sync configuration
    #[serde(default)]
    pub sync: SyncConfig,

    /// Search configuration
    #[serde(default)]
    pub search: SearchConfig,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root data directory
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Indexing pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexingConfig {
    /// Global maximum blob size to index in bytes (0 disables the limit)
    #[serde(default = "default_size_limit")]
    pub size_limit: u64,

    /// Number of blocking workers reading and classifying blobs
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Capacity of the work and results queues
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Flush a batch once its cumulative content reaches this many bytes
    #[serde(default = "default_batch_bytes")]
    pub batch_bytes: usize,

    /// Group add candidates by (blob, path) across refs before reading them
    #[serde(default)]
    pub prefetch_across_refs: bool,

    /// Character encodings tried in order when decoding a text blob
    #[serde(default = "default_encodings")]
    pub encodings: Vec<String>,
}

/// Git plumbing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    /// Deadline for remote fetches and for each ref's tree walk or diff
    #[serde(default = "default_git_timeout")]
    pub timeout_secs: u64,

    /// Index the local mirrors as they are without contacting remotes
    #[serde(default)]
    pub skip_fetch: bool,

    /// git executable used for mirroring
    #[serde(default = "default_git_binary")]
    pub git_binary: String,
}

/// Scheduled sync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Six-field cron expression (seconds first)
    #[serde(default = "default_schedule")]
    pub schedule: String,

    /// How many repositories sync at the same time
    #[serde(default = "default_repository_concurrency")]
    pub repository_concurrency: usize,
}

/// Search configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Hits per page
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Lines of context before a matched line in previews
    #[serde(default = "default_preview_context")]
    pub preview_before: usize,

    /// Lines of context after a matched line in previews
    #[serde(default = "default_preview_context")]
    pub preview_after: usize,
}

// Default value functions
fn default_data_dir() -> PathBuf {
    crate::paths::PlatformPaths::default_data_dir()
}

fn default_size_limit() -> u64 {
    1_048_576 // 1 MB
}

fn default_workers() -> usize {
    3
}

fn default_queue_capacity() -> usize {
    100
}

fn default_batch_bytes() -> usize {
    512 * 1024
}

fn default_encodings() -> Vec<String> {
    vec!["Shift_JIS".to_string(), "UTF-8".to_string()]
}

fn default_git_timeout() -> u64 {
    600
}

fn default_git_binary() -> String {
    "git".to_string()
}

fn default_schedule() -> String {
    "0 */10 * * * *".to_string()
}

fn default_repository_concurrency() -> usize {
    2
}

fn default_page_size() -> usize {
    20
}

fn default_preview_context() -> usize {
    3
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            size_limit: default_size_limit(),
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            batch_bytes: default_batch_bytes(),
            prefetch_across_refs: false,
            encodings: default_encodings(),
        }
    }
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_git_timeout(),
            skip_fetch: false,
            git_binary: default_git_binary(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            schedule: default_schedule(),
            repository_concurrency: default_repository_concurrency(),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            preview_before: default_preview_context(),
            preview_after: default_preview_context(),
        }
    }
}

fn invalid(key: &str, reason: impl Into<String>) -> BlobdexError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        reason: reason.into(),
    }
    .into()
}

impl Config {
    /// Load configuration from file
    pub fn from_file(path: &Path) -> Result<Self, BlobdexError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()).into());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::LoadFailed(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| ConfigError::ParseFailed(format!("Invalid TOML: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the given path, the default location, or defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, BlobdexError> {
        if let Some(path) = path {
            tracing::info!("Loading config from: {}", path.display());
            return Self::from_file(path);
        }

        let config_path = crate::paths::PlatformPaths::default_config_path();
        if config_path.exists() {
            tracing::info!("Loading config from: {}", config_path.display());
            Self::from_file(&config_path)
        } else {
            tracing::info!("No config file found, using defaults");
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<(), BlobdexError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ConfigError::SaveFailed(format!("Failed to create config directory: {}", e))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SaveFailed(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| ConfigError::SaveFailed(format!("Failed to write config file: {}", e)))?;

        tracing::info!("Saved config to: {}", path.display());
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), BlobdexError> {
        if self.indexing.workers == 0 {
            return Err(invalid("indexing.workers", "must be greater than 0"));
        }

        if self.indexing.queue_capacity == 0 {
            return Err(invalid("indexing.queue_capacity", "must be greater than 0"));
        }

        if self.indexing.batch_bytes == 0 {
            return Err(invalid("indexing.batch_bytes", "must be greater than 0"));
        }

        if self.indexing.encodings.is_empty() {
            return Err(invalid("indexing.encodings", "must name at least one encoding"));
        }

        for label in &self.indexing.encodings {
            if encoding_rs::Encoding::for_label(label.as_bytes()).is_none() {
                return Err(invalid(
                    "indexing.encodings",
                    format!("unknown encoding '{}'", label),
                ));
            }
        }

        if self.git.timeout_secs == 0 {
            return Err(invalid("git.timeout_secs", "must be greater than 0"));
        }

        if let Err(e) = cron::Schedule::from_str(&self.sync.schedule) {
            return Err(invalid(
                "sync.schedule",
                format!("invalid cron expression '{}': {}", self.sync.schedule, e),
            ));
        }

        if self.sync.repository_concurrency == 0 {
            return Err(invalid("sync.repository_concurrency", "must be greater than 0"));
        }

        if self.search.page_size == 0 {
            return Err(invalid("search.page_size", "must be greater than 0"));
        }

        Ok(())
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("BLOBDEX_DATA_DIR") {
            self.storage.data_dir = PathBuf::from(path);
        }

        if let Ok(schedule) = std::env::var("BLOBDEX_SCHEDULE") {
            self.sync.schedule = schedule;
        }

        if let Ok(workers) = std::env::var("BLOBDEX_WORKERS")
            && let Ok(workers) = workers.parse()
        {
            self.indexing.workers = workers;
        }

        if let Ok(limit) = std::env::var("BLOBDEX_SIZE_LIMIT")
            && let Ok(limit) = limit.parse()
        {
            self.indexing.size_limit = limit;
        }

        if let Ok(skip) = std::env::var("BLOBDEX_SKIP_FETCH") {
            self.git.skip_fetch = matches!(skip.as_str(), "1" | "true" | "yes");
        }
    }

    /// Create a new Config from the file, environment overrides, and validation
    pub fn new(path: Option<&Path>) -> Result<Self, BlobdexError> {
        let mut config = Self::load_or_default(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }
}
