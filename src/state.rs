use crate::error::StateError;
use crate::git::{RefKind, RefMap};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Last indexed commit of every ref of one repository
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IndexedState {
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
    pub organization: String,
    pub project: String,
    pub repository: String,
    #[serde(default)]
    pub branches: RefMap,
    #[serde(default)]
    pub tags: RefMap,
    /// Refs whose indexing started but did not confirm completion
    #[serde(default)]
    pub dirty: BTreeSet<String>,
}

impl IndexedState {
    pub fn new(
        organization: impl Into<String>,
        project: impl Into<String>,
        repository: impl Into<String>,
    ) -> Self {
        Self {
            last_updated: None,
            organization: organization.into(),
            project: project.into(),
            repository: repository.into(),
            branches: RefMap::new(),
            tags: RefMap::new(),
            dirty: BTreeSet::new(),
        }
    }

    /// Branches and tags as one map; a branch shadows a tag of the same name
    pub fn ref_map(&self) -> RefMap {
        let mut map = self.tags.clone();
        map.extend(self.branches.iter().map(|(k, v)| (k.clone(), v.clone())));
        map
    }

    /// Record `commit` as the indexed state of a ref
    pub fn set_ref(&mut self, kind: RefKind, name: &str, commit: &str) {
        match kind {
            RefKind::Branch => {
                self.tags.remove(name);
                self.branches.insert(name.to_string(), commit.to_string());
            }
            RefKind::Tag => {
                self.branches.remove(name);
                self.tags.insert(name.to_string(), commit.to_string());
            }
        }
    }

    /// Forget a ref entirely
    pub fn remove_ref(&mut self, name: &str) -> bool {
        let branch = self.branches.remove(name).is_some();
        let tag = self.tags.remove(name).is_some();
        self.dirty.remove(name);
        branch || tag
    }

    pub fn mark_dirty<'a>(&mut self, names: impl IntoIterator<Item = &'a String>) {
        self.dirty.extend(names.into_iter().cloned());
    }

    pub fn clear_dirty(&mut self, name: &str) {
        self.dirty.remove(name);
    }

    pub fn is_empty(&self) -> bool {
        self.branches.is_empty() && self.tags.is_empty() && self.dirty.is_empty()
    }
}

/// JSON files under `<data_dir>/indexed/<org>/<project>/<repo>.json`
pub struct StateStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl StateStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            root: crate::paths::PlatformPaths::indexed_dir(data_dir),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self, organization: &str, project: &str, repository: &str) -> PathBuf {
        self.root
            .join(organization)
            .join(project)
            .join(format!("{}.json", repository))
    }

    /// Load the state of a repository; an empty state when never indexed
    pub fn get(
        &self,
        organization: &str,
        project: &str,
        repository: &str,
    ) -> Result<IndexedState, StateError> {
        let path = self.path(organization, project, repository);
        if !path.exists() {
            tracing::debug!("No indexed state at {}, starting empty", path.display());
            return Ok(IndexedState::new(organization, project, repository));
        }

        let load_failed = |reason: String| StateError::LoadFailed {
            path: path.display().to_string(),
            reason,
        };
        let content = fs::read_to_string(&path).map_err(|e| load_failed(e.to_string()))?;
        let state: IndexedState =
            serde_json::from_str(&content).map_err(|e| load_failed(e.to_string()))?;

        tracing::debug!(
            "Loaded indexed state for {}/{}/{}: {} branches, {} tags, {} dirty",
            organization,
            project,
            repository,
            state.branches.len(),
            state.tags.len(),
            state.dirty.len()
        );
        Ok(state)
    }

    /// Persist a state atomically, stamping `last_updated`
    pub fn put(&self, state: &mut IndexedState) -> Result<(), StateError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        state.last_updated = Some(Utc::now());
        self.write(state)
    }

    /// Remove refs from the persisted state of a repository
    pub fn delete_refs(
        &self,
        organization: &str,
        project: &str,
        repository: &str,
        refs: &BTreeSet<String>,
    ) -> Result<IndexedState, StateError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut state = self.get(organization, project, repository)?;
        for name in refs {
            state.remove_ref(name);
        }
        state.last_updated = Some(Utc::now());
        self.write(&state)?;
        Ok(state)
    }

    fn write(&self, state: &IndexedState) -> Result<(), StateError> {
        let path = self.path(&state.organization, &state.project, &state.repository);
        let save_failed = |reason: String| StateError::SaveFailed {
            path: path.display().to_string(),
            reason,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| save_failed(e.to_string()))?;
        }

        let content =
            serde_json::to_string_pretty(state).map_err(|e| save_failed(e.to_string()))?;
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, content).map_err(|e| save_failed(e.to_string()))?;
        fs::rename(&tmp_path, &path).map_err(|e| save_failed(e.to_string()))?;

        tracing::debug!("Saved indexed state to {:?}", path);
        Ok(())
    }
}
