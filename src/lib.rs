//! # blobdex - incremental code search over git repositories
//!
//! Keeps a full-text index in step with every branch and tag of a set of
//! mirrored git repositories. Content is indexed once per (blob, path): a
//! file that is identical on ten branches is one document listing ten refs,
//! and a document disappears when the last ref holding it goes away.
//!
//! ## Architecture
//!
//! ```text
//!  SyncScheduler (cron)
//!        │
//!  SyncService ── SettingsStore (conf/*.json)
//!        │    └── StateStore (indexed/<org>/<project>/<repo>.json)
//!        │
//!  planner::plan ──► IndexingPipeline ──► ContentIndex (tantivy)
//!                       │        │
//!                   GitRepo   ContentClassifier
//! ```
//!
//! ## Modules
//!
//! - [`git`]: ref listing, tree walks, diffs and blob reads over `git2`, plus
//!   remote mirroring
//! - [`classifier`]: content sniffing, size limits and encoding detection
//! - [`planner`]: created / updated / removed refs since the last sync
//! - [`pipeline`]: bounded worker pool producing batched index operations
//! - [`index`]: the content-addressable document model and its tantivy store
//! - [`sync`]: per-repository sync orchestration
//! - [`scheduler`]: cron-driven sync lifecycle
//! - [`search`] and [`preview`]: queries with line previews
//! - [`settings`], [`state`], [`config`]: persisted settings and state
//!
//! ## Usage Example
//!
//! ```no_run
//! use blobdex::config::Config;
//! use blobdex::sync::SyncService;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let service = SyncService::open(Config::new(None)?)?;
//!     service
//!         .import("acme", "webapp", "https://git.example.com/acme/origin.git")
//!         .await?;
//!     Ok(())
//! }
//! ```

/// Content-type sniffing and text decoding of blobs
pub mod classifier;

/// Configuration management with environment variable overrides
pub mod config;

/// Error types and utilities
pub mod error;

/// Git plumbing and remote mirroring
pub mod git;

/// Content-addressable documents and the tantivy index
pub mod index;

/// Platform directories and the data directory layout
pub mod paths;

/// Ref sync plans and the indexing worker pool
pub mod pipeline;
pub mod planner;

/// Line previews around search matches
pub mod preview;

/// Cron-driven sync scheduler
pub mod scheduler;

pub mod search;

/// Organization, project and repository settings
pub mod settings;

/// Last indexed commit of every ref
pub mod state;

/// Per-repository sync orchestration
pub mod sync;

#[cfg(test)]
mod test_support;
