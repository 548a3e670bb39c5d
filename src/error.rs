/// Centralized error types for blobdex using thiserror
///
/// Provides domain-specific error types so callers can tell a fatal
/// repository failure from a ref or file that can simply be skipped.
use thiserror::Error;

/// Main error type for the indexing system
#[derive(Error, Debug)]
pub enum BlobdexError {
    #[error("Git error: {0}")]
    Git(#[from] GitError),

    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Indexed state error: {0}")]
    State(#[from] StateError),

    #[error("Settings error: {0}")]
    Settings(#[from] SettingsError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Errors related to git plumbing
#[derive(Error, Debug)]
pub enum GitError {
    #[error("Failed to open git repository '{path}': {reason}")]
    OpenFailed { path: String, reason: String },

    #[error("Failed to list refs: {0}")]
    RefListFailed(String),

    #[error("Commit not found: {0}")]
    CommitNotFound(String),

    #[error("Blob not found: {0}")]
    BlobNotFound(String),

    #[error("Invalid object id: {0}")]
    InvalidObjectId(String),

    #[error("Failed to walk tree of commit {commit}: {reason}")]
    TreeWalkFailed { commit: String, reason: String },

    #[error("Failed to diff {from}..{to}: {reason}")]
    DiffFailed {
        from: String,
        to: String,
        reason: String,
    },

    #[error("Failed to fetch '{url}': {reason}")]
    FetchFailed { url: String, reason: String },

    #[error("{operation} timed out after {secs} seconds")]
    Timeout { operation: String, secs: u64 },
}

/// Errors related to the full-text index
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Failed to open index at '{path}': {reason}")]
    OpenFailed { path: String, reason: String },

    #[error("Failed to write documents: {0}")]
    WriteFailed(String),

    #[error("Failed to commit index: {0}")]
    CommitFailed(String),

    #[error("Failed to search index: {0}")]
    SearchFailed(String),

    #[error("Invalid query '{query}': {reason}")]
    InvalidQuery { query: String, reason: String },

    #[error("Stored document '{0}' is incomplete")]
    CorruptDocument(String),

    #[error("Index lock was poisoned: {0}")]
    LockPoisoned(String),
}

/// Errors related to configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration file: {0}")]
    LoadFailed(String),

    #[error("Failed to parse configuration: {0}")]
    ParseFailed(String),

    #[error("Invalid configuration value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("Failed to save configuration: {0}")]
    SaveFailed(String),

    #[error("Configuration file not found: {0}")]
    FileNotFound(String),
}

/// Errors related to the persisted ref -> commit state
#[derive(Error, Debug)]
pub enum StateError {
    #[error("Failed to load indexed state from '{path}': {reason}")]
    LoadFailed { path: String, reason: String },

    #[error("Failed to save indexed state to '{path}': {reason}")]
    SaveFailed { path: String, reason: String },
}

/// Errors related to organization settings
#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("The \"{0}\" setting already exists")]
    AlreadyExists(String),

    #[error("The repository already exists: {0}")]
    RepositoryExists(String),

    #[error("Not found setting for \"{0}\"")]
    NotFound(String),

    #[error("Failed to load settings from '{path}': {reason}")]
    LoadFailed { path: String, reason: String },

    #[error("Failed to save settings to '{path}': {reason}")]
    SaveFailed { path: String, reason: String },

    #[error("Repository discovery failed for \"{organization}\": {reason}")]
    DiscoveryFailed {
        organization: String,
        reason: String,
    },
}

// Conversion from anyhow::Error to BlobdexError
impl From<anyhow::Error> for BlobdexError {
    fn from(err: anyhow::Error) -> Self {
        BlobdexError::Other(format!("{:#}", err))
    }
}

impl BlobdexError {
    /// Create a new error from a string message
    pub fn other(msg: impl Into<String>) -> Self {
        BlobdexError::Other(msg.into())
    }

    /// Check if this is a user error (bad configuration or settings input)
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            BlobdexError::Config(ConfigError::InvalidValue { .. })
                | BlobdexError::Settings(SettingsError::AlreadyExists(_))
                | BlobdexError::Settings(SettingsError::RepositoryExists(_))
                | BlobdexError::Index(IndexError::InvalidQuery { .. })
        )
    }

    /// Check if this error is worth retrying on the next scheduled sync
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BlobdexError::Git(GitError::Timeout { .. })
                | BlobdexError::Git(GitError::FetchFailed { .. })
                | BlobdexError::Index(IndexError::CommitFailed(_))
                | BlobdexError::Io(_)
        )
    }
}

impl GitError {
    /// Ref-scoped failures skip a single ref instead of the whole repository
    pub fn is_ref_scoped(&self) -> bool {
        matches!(
            self,
            GitError::CommitNotFound(_)
                | GitError::TreeWalkFailed { .. }
                | GitError::DiffFailed { .. }
                | GitError::Timeout { .. }
        )
    }
}
