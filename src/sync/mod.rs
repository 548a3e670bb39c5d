//! Per-repository sync: fetch, plan, index, persist

use crate::classifier::ContentClassifier;
use crate::config::Config;
use crate::error::{BlobdexError, SettingsError};
use crate::git::{GitRef, GitRepo, RefKind, RefMap, RepoLocator, mirror, ref_map};
use crate::index::{BatchStats, ContentIndex, TantivyIndex};
use crate::pipeline::{IndexingPipeline, PipelineConfig, PipelineScope};
use crate::planner::plan;
use crate::settings::{RepositoryTarget, SettingsStore};
use crate::state::{IndexedState, StateStore};
use futures::StreamExt;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// How a repository sync ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// Every ref was already indexed at its live commit
    UpToDate,
    /// The plan ran; see `failed_refs` for refs left behind
    Completed,
    /// Another sync of the same repository was in flight
    AlreadyRunning,
}

/// Summary of one repository sync
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub repository: String,
    pub status: SyncStatus,
    pub created: usize,
    pub updated: usize,
    pub removed: usize,
    /// Dirty refs from an earlier sync retired before planning
    pub retired_dirty: usize,
    pub adds: usize,
    pub deletes: usize,
    pub skipped_files: usize,
    pub completed_refs: BTreeSet<String>,
    pub failed_refs: BTreeMap<String, String>,
    pub elapsed: Duration,
}

impl SyncReport {
    fn new(repository: String, status: SyncStatus) -> Self {
        Self {
            repository,
            status,
            created: 0,
            updated: 0,
            removed: 0,
            retired_dirty: 0,
            adds: 0,
            deletes: 0,
            skipped_files: 0,
            completed_refs: BTreeSet::new(),
            failed_refs: BTreeMap::new(),
            elapsed: Duration::ZERO,
        }
    }
}

/// Marks a repository as syncing until dropped
struct InProgressGuard {
    id: String,
    running: Arc<Mutex<HashSet<String>>>,
}

impl InProgressGuard {
    fn try_acquire(running: &Arc<Mutex<HashSet<String>>>, id: &str) -> Option<Self> {
        let mut set = running.lock().unwrap_or_else(|e| e.into_inner());
        if !set.insert(id.to_string()) {
            return None;
        }
        Some(Self {
            id: id.to_string(),
            running: running.clone(),
        })
    }
}

impl Drop for InProgressGuard {
    fn drop(&mut self) {
        let mut set = self.running.lock().unwrap_or_else(|e| e.into_inner());
        set.remove(&self.id);
    }
}

/// Keeps the index in step with every configured repository
#[derive(Clone)]
pub struct SyncService {
    config: Arc<Config>,
    settings: Arc<SettingsStore>,
    states: Arc<StateStore>,
    index: Arc<dyn ContentIndex>,
    classifier: Arc<ContentClassifier>,
    locator: RepoLocator,
    running: Arc<Mutex<HashSet<String>>>,
}

impl SyncService {
    /// Open the settings, state and on-disk index under `config.storage.data_dir`
    pub fn open(config: Config) -> Result<Self, BlobdexError> {
        let data_dir = config.storage.data_dir.clone();
        let settings = SettingsStore::open(&data_dir, config.indexing.size_limit)?;
        let index_path = crate::paths::PlatformPaths::index_dir(&data_dir);
        let index = TantivyIndex::open(&index_path)?;

        Self::new(Arc::new(config), Arc::new(settings), Arc::new(index))
    }

    pub fn new(
        config: Arc<Config>,
        settings: Arc<SettingsStore>,
        index: Arc<dyn ContentIndex>,
    ) -> Result<Self, BlobdexError> {
        let classifier = ContentClassifier::new(&config.indexing.encodings)?;
        let data_dir = config.storage.data_dir.clone();

        Ok(Self {
            states: Arc::new(StateStore::new(&data_dir)),
            locator: RepoLocator::new(data_dir),
            classifier: Arc::new(classifier),
            config,
            settings,
            index,
            running: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn settings(&self) -> &Arc<SettingsStore> {
        &self.settings
    }

    pub fn states(&self) -> &Arc<StateStore> {
        &self.states
    }

    pub fn index(&self) -> &Arc<dyn ContentIndex> {
        &self.index
    }

    pub fn locator(&self) -> &RepoLocator {
        &self.locator
    }

    /// Refresh settings, then sync every repository with bounded concurrency
    ///
    /// A failing repository is logged and never stops the others.
    pub async fn sync_all(&self) -> Vec<(String, Result<SyncReport, BlobdexError>)> {
        if let Err(e) = self.settings.sync().await {
            tracing::warn!("Failed to refresh settings, using the loaded ones: {}", e);
        }

        let targets = self.settings.list_repositories().await;
        let concurrency = self.config.sync.repository_concurrency.max(1);
        tracing::info!(
            "Syncing {} repositories ({} at a time)",
            targets.len(),
            concurrency
        );

        let results: Vec<(String, Result<SyncReport, BlobdexError>)> =
            futures::stream::iter(targets.into_iter().map(|target| {
                let service = self.clone();
                async move {
                    let result = service.sync_repository(&target).await;
                    (target.to_string(), result)
                }
            }))
            .buffer_unordered(concurrency)
            .collect()
            .await;

        for (repository, result) in &results {
            if let Err(e) = result {
                tracing::error!("Sync of {} failed: {}", repository, e);
            }
        }
        results
    }

    /// Sync one configured repository by name
    pub async fn sync_one(
        &self,
        organization: &str,
        project: &str,
        repository: &str,
    ) -> Result<SyncReport, BlobdexError> {
        let target = self
            .settings
            .find_repository(organization, project, repository)
            .await
            .ok_or_else(|| {
                SettingsError::NotFound(format!("{}:{}/{}", organization, project, repository))
            })?;
        self.sync_repository(&target).await
    }

    /// Register a repository and sync it right away
    pub async fn import(
        &self,
        organization: &str,
        project: &str,
        url: &str,
    ) -> Result<SyncReport, BlobdexError> {
        let target = self.settings.add_repository(organization, project, url).await?;
        self.sync_repository(&target).await
    }

    /// Bring the index in line with the live refs of one repository
    pub async fn sync_repository(&self, target: &RepositoryTarget) -> Result<SyncReport, BlobdexError> {
        let start = Instant::now();
        let id = target.to_string();

        let Some(_guard) = InProgressGuard::try_acquire(&self.running, &id) else {
            tracing::info!("Sync of {} is already running, skipping", id);
            return Ok(SyncReport::new(id, SyncStatus::AlreadyRunning));
        };

        let repo_path = self
            .locator
            .path(&target.organization, &target.project, &target.repository);

        if self.config.git.skip_fetch {
            tracing::debug!("Skipping fetch of {}", id);
        } else {
            tracing::info!("Fetching {} from {}", id, target.url);
            mirror(
                &self.config.git.git_binary,
                &target.url,
                &repo_path,
                Duration::from_secs(self.config.git.timeout_secs),
            )
            .await?;
        }

        let live_refs: Vec<GitRef> = tokio::task::spawn_blocking({
            let path = repo_path.clone();
            let filters = target.filters.clone();
            move || GitRepo::open(&path)?.list_refs(&filters)
        })
        .await
        .map_err(|e| BlobdexError::other(format!("Ref listing task failed: {}", e)))??;

        let live = ref_map(&live_refs);
        let branches: HashSet<&str> = live_refs
            .iter()
            .filter(|r| r.kind == RefKind::Branch)
            .map(|r| r.name.as_str())
            .collect();

        let mut state = self
            .states
            .get(&target.organization, &target.project, &target.repository)?;

        let mut report = SyncReport::new(id.clone(), SyncStatus::Completed);
        report.retired_dirty = self.retire_dirty(target, &mut state).await?;

        let sync_plan = plan(&live, &state.ref_map());
        if sync_plan.is_empty() {
            tracing::info!(
                "{} is up to date ({} refs) in {:?}",
                id,
                sync_plan.up_to_date.len(),
                start.elapsed()
            );
            report.status = SyncStatus::UpToDate;
            report.elapsed = start.elapsed();
            return Ok(report);
        }

        report.created = sync_plan.created.len();
        report.updated = sync_plan.updated.len();
        report.removed = sync_plan.removed.len();
        tracing::info!(
            "Sync plan for {}: {} created, {} updated, {} removed, {} up to date",
            id,
            report.created,
            report.updated,
            report.removed,
            sync_plan.up_to_date.len()
        );

        let active = sync_plan.active_refs();
        if !active.is_empty() {
            state.mark_dirty(&active);
            self.states.put(&mut state)?;

            let pipeline = IndexingPipeline::new(
                PipelineConfig::from_config(&self.config, target.size_limit),
                self.classifier.clone(),
                self.index.clone(),
            );
            let scope = PipelineScope {
                organization: target.organization.clone(),
                project: target.project.clone(),
                repository: target.repository.clone(),
                repo_path: repo_path.clone(),
            };
            let outcome = pipeline.run(scope, &sync_plan, &live).await;

            advance_completed(&mut state, &outcome.completed_refs, &live, &branches);
            self.states.put(&mut state)?;

            for (name, reason) in &outcome.failed_refs {
                tracing::warn!("Ref '{}' of {} was not indexed: {}", name, id, reason);
            }

            report.adds = outcome.adds;
            report.deletes = outcome.deletes;
            report.skipped_files = outcome.skipped_files;
            report.completed_refs = outcome.completed_refs;
            report.failed_refs = outcome.failed_refs;
        }

        if !sync_plan.removed.is_empty() {
            let stats = self.delete_refs_from_index(target, sync_plan.removed.clone()).await?;
            self.states.delete_refs(
                &target.organization,
                &target.project,
                &target.repository,
                &sync_plan.removed,
            )?;
            tracing::info!(
                "Retired refs {:?} of {}: {} documents rewritten, {} removed",
                sync_plan.removed,
                id,
                stats.written,
                stats.removed
            );
        }

        report.elapsed = start.elapsed();
        tracing::info!(
            "Synced {} in {:?}: {} adds, {} deletes, {} skipped files, {} refs completed, {} refs failed",
            id,
            report.elapsed,
            report.adds,
            report.deletes,
            report.skipped_files,
            report.completed_refs.len(),
            report.failed_refs.len()
        );
        Ok(report)
    }

    /// Drop every document ref of refs left dirty by an interrupted sync
    ///
    /// The refs are forgotten so the plan rebuilds them from a full walk.
    async fn retire_dirty(
        &self,
        target: &RepositoryTarget,
        state: &mut IndexedState,
    ) -> Result<usize, BlobdexError> {
        if state.dirty.is_empty() {
            return Ok(0);
        }

        let dirty = state.dirty.clone();
        tracing::warn!(
            "Retiring refs {:?} of {} left dirty by an earlier sync",
            dirty,
            target
        );

        self.delete_refs_from_index(target, dirty.clone()).await?;
        for name in &dirty {
            state.remove_ref(name);
        }
        self.states.put(state)?;
        Ok(dirty.len())
    }

    async fn delete_refs_from_index(
        &self,
        target: &RepositoryTarget,
        refs: BTreeSet<String>,
    ) -> Result<BatchStats, BlobdexError> {
        let index = self.index.clone();
        let organization = target.organization.clone();
        let project = target.project.clone();
        let repository = target.repository.clone();

        let stats = tokio::task::spawn_blocking(move || {
            index.delete_by_refs(&organization, &project, &repository, &refs)
        })
        .await
        .map_err(|e| BlobdexError::other(format!("Ref retirement task failed: {}", e)))??;
        Ok(stats)
    }
}

/// Record the live commit of every completed ref and clear its dirty flag
fn advance_completed(
    state: &mut IndexedState,
    completed: &BTreeSet<String>,
    live: &RefMap,
    branches: &HashSet<&str>,
) {
    for name in completed {
        let Some(commit) = live.get(name) else {
            continue;
        };
        let kind = if branches.contains(name.as_str()) {
            RefKind::Branch
        } else {
            RefKind::Tag
        };
        state.set_ref(kind, name, commit);
        state.clear_dirty(name);
    }
}

#[cfg(test)]
mod tests;
