//! Git plumbing over mirrored repositories
//!
//! Read-only views of refs, trees and blobs (`reader`) plus the subprocess
//! side that keeps local mirrors up to date (`remote`).

/// In-process repository reader backed by git2
pub mod reader;
/// Mirroring of remote repositories through the git CLI
pub mod remote;

pub use reader::{GitRepo, TreeFiles};
pub use remote::{mirror, repo_name_from_url};

use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Short ref name -> commit id
pub type RefMap = BTreeMap<String, String>;

/// Kind of a ref
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RefKind {
    Branch,
    Tag,
}

impl fmt::Display for RefKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefKind::Branch => write!(f, "branch"),
            RefKind::Tag => write!(f, "tag"),
        }
    }
}

/// A live branch or tag, annotated tags already peeled to their commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitRef {
    /// Short name (`master`, `v1.0`)
    pub name: String,
    pub kind: RefKind,
    pub commit_id: String,
}

/// A file reachable from a commit's tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub blob: String,
    pub path: String,
    pub size: u64,
}

/// Side of a normalized tree diff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffStatus {
    Added,
    Deleted,
}

/// One normalized change between two commits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffEntry {
    pub blob: String,
    pub path: String,
    pub status: DiffStatus,
}

impl DiffEntry {
    pub fn added(blob: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            blob: blob.into(),
            path: path.into(),
            status: DiffStatus::Added,
        }
    }

    pub fn deleted(blob: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            blob: blob.into(),
            path: path.into(),
            status: DiffStatus::Deleted,
        }
    }
}

/// Include/exclude patterns applied to branch and tag short names
///
/// A missing include pattern matches everything; a missing exclude pattern
/// matches nothing.
#[derive(Debug, Clone, Default)]
pub struct RefFilters {
    pub include_branches: Option<Regex>,
    pub exclude_branches: Option<Regex>,
    pub include_tags: Option<Regex>,
    pub exclude_tags: Option<Regex>,
}

impl RefFilters {
    /// Whether a ref of the given kind should be indexed
    pub fn allows(&self, kind: RefKind, name: &str) -> bool {
        let (include, exclude) = match kind {
            RefKind::Branch => (&self.include_branches, &self.exclude_branches),
            RefKind::Tag => (&self.include_tags, &self.exclude_tags),
        };

        let included = include.as_ref().is_none_or(|re| re.is_match(name));
        let excluded = exclude.as_ref().is_some_and(|re| re.is_match(name));
        included && !excluded
    }
}

/// Collapse live refs into a name -> commit map
///
/// Branches are inserted first, so a tag sharing a branch's short name is
/// dropped.
pub fn ref_map(refs: &[GitRef]) -> RefMap {
    let mut map = RefMap::new();

    for git_ref in refs.iter().filter(|r| r.kind == RefKind::Branch) {
        map.insert(git_ref.name.clone(), git_ref.commit_id.clone());
    }

    for git_ref in refs.iter().filter(|r| r.kind == RefKind::Tag) {
        if map.contains_key(&git_ref.name) {
            tracing::warn!(
                "Tag '{}' has the same name as a branch, skipping the tag",
                git_ref.name
            );
            continue;
        }
        map.insert(git_ref.name.clone(), git_ref.commit_id.clone());
    }

    map
}

/// Split live refs into separate branch and tag maps, applying the same
/// branch-wins rule as [`ref_map`]
pub fn split_ref_maps(refs: &[GitRef]) -> (RefMap, RefMap) {
    let mut branches = RefMap::new();
    let mut tags = RefMap::new();

    for git_ref in refs {
        match git_ref.kind {
            RefKind::Branch => {
                branches.insert(git_ref.name.clone(), git_ref.commit_id.clone());
            }
            RefKind::Tag => {
                tags.insert(git_ref.name.clone(), git_ref.commit_id.clone());
            }
        }
    }
    tags.retain(|name, _| !branches.contains_key(name));

    (branches, tags)
}

/// Locates mirrored repositories under `<data_dir>/git`
#[derive(Debug, Clone)]
pub struct RepoLocator {
    data_dir: PathBuf,
}

impl RepoLocator {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn path(&self, organization: &str, project: &str, repository: &str) -> PathBuf {
        crate::paths::PlatformPaths::repository_path(
            &self.data_dir,
            organization,
            project,
            repository,
        )
    }
}
