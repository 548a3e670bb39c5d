//! Turns a ref sync plan into batched index operations
//!
//! One producer walks created refs and diffs updated refs on a blocking
//! thread. Blobs to read go through a bounded work queue to `workers`
//! blocking threads, each holding its own repository handle. Operations
//! flow through a bounded results queue to a single accumulator that
//! commits them in batches bounded by content bytes. Shutdown propagates
//! by closing the queues.
//!
//! The per-ref deadline only counts time spent in git plumbing: tree walk
//! steps and diffs. Time the producer spends blocked on full queues is not
//! charged to the ref.

use crate::classifier::{Classification, ContentClassifier};
use crate::config::Config;
use crate::error::GitError;
use crate::git::{DiffEntry, DiffStatus, GitRepo, RefMap};
use crate::index::{ContentIndex, DocumentKey, IndexDocument, IndexOperation, extension_of};
use crate::planner::{RefSyncPlan, RefUpdate};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::mpsc::{RecvTimeoutError, sync_channel};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Tuning knobs for one pipeline run
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub batch_bytes: usize,
    /// Maximum blob size in bytes, 0 disables the limit
    pub size_limit: u64,
    pub prefetch_across_refs: bool,
    /// Plumbing time allowed for each ref's tree walk or diff
    pub ref_timeout: Duration,
}

impl PipelineConfig {
    /// Pipeline settings from the application config with a resolved size limit
    pub fn from_config(config: &Config, size_limit: u64) -> Self {
        Self {
            workers: config.indexing.workers.max(1),
            queue_capacity: config.indexing.queue_capacity.max(1),
            batch_bytes: config.indexing.batch_bytes.max(1),
            size_limit,
            prefetch_across_refs: config.indexing.prefetch_across_refs,
            ref_timeout: Duration::from_secs(config.git.timeout_secs),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from_config(&Config::default(), Config::default().indexing.size_limit)
    }
}

/// Repository the pipeline reads from and the key prefix of its documents
#[derive(Debug, Clone)]
pub struct PipelineScope {
    pub organization: String,
    pub project: String,
    pub repository: String,
    pub repo_path: PathBuf,
}

impl PipelineScope {
    fn key(&self, blob: &str, path: &str) -> DocumentKey {
        DocumentKey::new(
            &self.organization,
            &self.project,
            &self.repository,
            blob,
            path,
        )
    }
}

/// Outcome of one pipeline run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineReport {
    /// Add operations committed
    pub adds: usize,
    /// Delete operations committed
    pub deletes: usize,
    /// Files skipped for size, type or read errors
    pub skipped_files: usize,
    pub batches: usize,
    pub failed_batches: usize,
    /// Refs whose every operation was committed
    pub completed_refs: BTreeSet<String>,
    /// Refs that must not advance, with the first failure seen
    pub failed_refs: BTreeMap<String, String>,
}

/// A blob to read and classify, on behalf of `refs`
#[derive(Debug)]
struct ReadItem {
    blob: String,
    path: String,
    /// Known from the tree walk; diff entries are sized by the worker
    size: Option<u64>,
    refs: BTreeSet<String>,
}

#[derive(Debug)]
enum PipelineEvent {
    Operation(IndexOperation),
    Skipped,
    RefFailed { name: String, reason: String },
}

/// Bounded worker pool feeding a content-addressable index
pub struct IndexingPipeline {
    config: PipelineConfig,
    classifier: Arc<ContentClassifier>,
    index: Arc<dyn ContentIndex>,
}

impl IndexingPipeline {
    pub fn new(
        config: PipelineConfig,
        classifier: Arc<ContentClassifier>,
        index: Arc<dyn ContentIndex>,
    ) -> Self {
        Self {
            config,
            classifier,
            index,
        }
    }

    /// Index every created and updated ref of `plan`
    ///
    /// `live` is the full live ref map, consulted when pre-fetching across
    /// refs. Failures never abort the run; they are reported per ref.
    pub async fn run(&self, scope: PipelineScope, plan: &RefSyncPlan, live: &RefMap) -> PipelineReport {
        let active = plan.active_refs();
        let mut report = PipelineReport::default();
        if active.is_empty() {
            return report;
        }

        tracing::info!(
            "Indexing {}/{}/{}: {} created, {} updated refs",
            scope.organization,
            scope.project,
            scope.repository,
            plan.created.len(),
            plan.updated.len()
        );

        let (work_tx, work_rx) = mpsc::channel::<ReadItem>(self.config.queue_capacity);
        let (results_tx, mut results_rx) = mpsc::channel::<PipelineEvent>(self.config.queue_capacity);
        let work_rx = Arc::new(Mutex::new(work_rx));

        let producer = Producer {
            scope: scope.clone(),
            size_limit: self.config.size_limit,
            prefetch: self.config.prefetch_across_refs,
            ref_timeout: self.config.ref_timeout,
            runtime: tokio::runtime::Handle::current(),
            live: live.clone(),
            work_tx,
            results_tx: results_tx.clone(),
            dispatched: BTreeMap::new(),
        };
        let producer_plan = plan.clone();
        let mut handles = vec![tokio::task::spawn_blocking(move || producer.run(&producer_plan))];

        for worker_id in 0..self.config.workers {
            let worker = Worker {
                id: worker_id,
                scope: scope.clone(),
                classifier: self.classifier.clone(),
                size_limit: self.config.size_limit,
                work_rx: work_rx.clone(),
                results_tx: results_tx.clone(),
            };
            handles.push(tokio::task::spawn_blocking(move || worker.run()));
        }
        drop(results_tx);
        drop(work_rx);

        let mut pending: Vec<IndexOperation> = Vec::new();
        let mut pending_bytes = 0usize;
        let mut failed: BTreeMap<String, String> = BTreeMap::new();

        while let Some(event) = results_rx.recv().await {
            match event {
                PipelineEvent::Operation(op) => {
                    pending_bytes += op.content_len();
                    pending.push(op);
                    if pending_bytes >= self.config.batch_bytes {
                        self.flush(std::mem::take(&mut pending), &mut report, &mut failed)
                            .await;
                        pending_bytes = 0;
                    }
                }
                PipelineEvent::Skipped => report.skipped_files += 1,
                PipelineEvent::RefFailed { name, reason } => {
                    failed.entry(name).or_insert(reason);
                }
            }
        }
        if !pending.is_empty() {
            self.flush(pending, &mut report, &mut failed).await;
        }

        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!("Indexing task for {} failed: {}", scope.repository, e);
                for name in &active {
                    failed
                        .entry(name.clone())
                        .or_insert_with(|| format!("indexing task failed: {}", e));
                }
            }
        }

        failed.retain(|name, _| active.contains(name));
        report.completed_refs = active
            .into_iter()
            .filter(|name| !failed.contains_key(name))
            .collect();
        report.failed_refs = failed;
        report
    }

    async fn flush(
        &self,
        ops: Vec<IndexOperation>,
        report: &mut PipelineReport,
        failed: &mut BTreeMap<String, String>,
    ) {
        let refs: BTreeSet<String> = ops.iter().flat_map(|op| op.refs().iter().cloned()).collect();
        let adds = ops
            .iter()
            .filter(|op| matches!(op, IndexOperation::Add(_)))
            .count();
        let deletes = ops.len() - adds;

        let index = self.index.clone();
        let result = tokio::task::spawn_blocking(move || index.batch(ops)).await;

        let error = match result {
            Ok(Ok(stats)) => {
                tracing::debug!(
                    "Flushed batch: {} adds, {} deletes ({} written, {} removed)",
                    adds,
                    deletes,
                    stats.written,
                    stats.removed
                );
                report.batches += 1;
                report.adds += adds;
                report.deletes += deletes;
                return;
            }
            Ok(Err(e)) => format!("{:#}", e),
            Err(e) => e.to_string(),
        };

        tracing::error!(
            "Failed to write batch of {} operations for refs {:?}: {}",
            adds + deletes,
            refs,
            error
        );
        report.failed_batches += 1;
        for name in refs {
            failed
                .entry(name)
                .or_insert_with(|| format!("batch write failed: {}", error));
        }
    }
}

/// Plumbing time charged to one ref
struct PlumbingClock {
    budget: Duration,
    spent: Duration,
}

impl PlumbingClock {
    fn new(budget: Duration) -> Self {
        Self {
            budget,
            spent: Duration::ZERO,
        }
    }

    fn time<T>(&mut self, f: impl FnOnce() -> T) -> T {
        let started = Instant::now();
        let value = f();
        self.spent += started.elapsed();
        value
    }

    fn expired(&self) -> bool {
        self.spent >= self.budget
    }
}

/// Walks and diffs refs on a blocking thread
struct Producer {
    scope: PipelineScope,
    size_limit: u64,
    prefetch: bool,
    ref_timeout: Duration,
    runtime: tokio::runtime::Handle,
    live: RefMap,
    work_tx: mpsc::Sender<ReadItem>,
    results_tx: mpsc::Sender<PipelineEvent>,
    /// (blob, path) -> refs it was already read for, only filled when pre-fetching
    dispatched: BTreeMap<(String, String), BTreeSet<String>>,
}

impl Producer {
    fn run(mut self, plan: &RefSyncPlan) {
        let repo = match GitRepo::open(&self.scope.repo_path) {
            Ok(repo) => repo,
            Err(e) => {
                tracing::error!("{}", e);
                for name in plan.active_refs() {
                    if !self.fail(&name, &e) {
                        return;
                    }
                }
                return;
            }
        };

        for (name, commit) in &plan.created {
            match self.walk_created(&repo, name, commit) {
                Ok(true) => {}
                Ok(false) => return,
                Err(e) => {
                    tracing::warn!("Skipping ref {} of {}: {}", name, self.scope.repository, e);
                    if !self.fail(name, &e) {
                        return;
                    }
                }
            }
        }

        for (name, update) in &plan.updated {
            match self.diff_updated(&repo, name, update) {
                Ok(true) => {}
                Ok(false) => return,
                Err(e) => {
                    tracing::warn!("Skipping ref {} of {}: {}", name, self.scope.repository, e);
                    if !self.fail(name, &e) {
                        return;
                    }
                }
            }
        }

        if self.prefetch {
            tracing::debug!(
                "Read {} unique blobs of {}",
                self.dispatched.len(),
                self.scope.repository
            );
        }
    }

    fn timeout(&self, name: &str, operation: &str) -> GitError {
        GitError::Timeout {
            operation: format!("{} of {}", operation, name),
            secs: self.ref_timeout.as_secs(),
        }
    }

    /// Returns Ok(false) when the pipeline is shutting down
    fn walk_created(&mut self, repo: &GitRepo, name: &str, commit: &str) -> Result<bool, GitError> {
        let mut clock = PlumbingClock::new(self.ref_timeout);
        let mut files = clock.time(|| repo.list_files(commit))?;

        while let Some(entry) = clock.time(|| files.next()) {
            if clock.expired() {
                return Err(self.timeout(name, "Tree walk"));
            }
            let entry = entry?;

            if ContentClassifier::exceeds_limit(entry.size, self.size_limit) {
                tracing::debug!(
                    "Skipping {} ({} bytes): over size limit {}",
                    entry.path,
                    entry.size,
                    self.size_limit
                );
                if !self.send_event(PipelineEvent::Skipped) {
                    return Ok(false);
                }
                continue;
            }

            if !self.emit_read(repo, entry.blob, entry.path, Some(entry.size), name) {
                return Ok(false);
            }
        }

        Ok(true)
    }

    /// Returns Ok(false) when the pipeline is shutting down
    fn diff_updated(&mut self, repo: &GitRepo, name: &str, update: &RefUpdate) -> Result<bool, GitError> {
        let entries = self.diff_within_deadline(name, update)?;

        for entry in entries {
            let keep_going = match entry.status {
                DiffStatus::Deleted => {
                    let op = IndexOperation::Delete {
                        key: self.scope.key(&entry.blob, &entry.path),
                        refs: BTreeSet::from([name.to_string()]),
                    };
                    self.send_event(PipelineEvent::Operation(op))
                }
                DiffStatus::Added => self.emit_read(repo, entry.blob, entry.path, None, name),
            };
            if !keep_going {
                return Ok(false);
            }
        }

        Ok(true)
    }

    /// Run the diff on its own blocking task and give up on it once the
    /// deadline passes; an abandoned diff finishes in the background and
    /// its result is dropped
    fn diff_within_deadline(&self, name: &str, update: &RefUpdate) -> Result<Vec<DiffEntry>, GitError> {
        let started = Instant::now();
        let (tx, rx) = sync_channel(1);
        let repo_path = self.scope.repo_path.clone();
        let (from, to) = (update.from.clone(), update.to.clone());
        self.runtime.spawn_blocking(move || {
            let result = GitRepo::open(&repo_path).and_then(|repo| repo.diff(&from, &to));
            let _ = tx.send(result);
        });

        let entries = match rx.recv_timeout(self.ref_timeout) {
            Ok(result) => result?,
            Err(RecvTimeoutError::Timeout) => return Err(self.timeout(name, "Diff")),
            Err(RecvTimeoutError::Disconnected) => {
                return Err(GitError::DiffFailed {
                    from: update.from.clone(),
                    to: update.to.clone(),
                    reason: "diff task ended without a result".to_string(),
                });
            }
        };
        if started.elapsed() >= self.ref_timeout {
            return Err(self.timeout(name, "Diff"));
        }
        Ok(entries)
    }

    /// Queue a blob read for `name`
    ///
    /// When pre-fetching, each (blob, path) is read once and the read also
    /// carries every other live ref whose commit holds the same file.
    fn emit_read(&mut self, repo: &GitRepo, blob: String, path: String, size: Option<u64>, name: &str) -> bool {
        let mut refs = BTreeSet::from([name.to_string()]);

        if self.prefetch {
            let key = (blob.clone(), path.clone());
            match self.dispatched.get_mut(&key) {
                Some(covered) if covered.contains(name) => return true,
                Some(covered) => {
                    covered.insert(name.to_string());
                }
                None => {
                    for (other, commit) in &self.live {
                        if other == name {
                            continue;
                        }
                        match repo.exists_at_commit(commit, &path, &blob) {
                            Ok(true) => {
                                refs.insert(other.clone());
                            }
                            Ok(false) => {}
                            Err(e) => tracing::debug!("Could not check {} at {}: {}", path, other, e),
                        }
                    }
                    self.dispatched.insert(key, refs.clone());
                }
            }
        }

        self.work_tx
            .blocking_send(ReadItem {
                blob,
                path,
                size,
                refs,
            })
            .is_ok()
    }

    fn send_event(&self, event: PipelineEvent) -> bool {
        self.results_tx.blocking_send(event).is_ok()
    }

    fn fail(&self, name: &str, error: &GitError) -> bool {
        self.send_event(PipelineEvent::RefFailed {
            name: name.to_string(),
            reason: error.to_string(),
        })
    }
}

/// Reads and classifies blobs on a blocking thread
struct Worker {
    id: usize,
    scope: PipelineScope,
    classifier: Arc<ContentClassifier>,
    size_limit: u64,
    work_rx: Arc<Mutex<mpsc::Receiver<ReadItem>>>,
    results_tx: mpsc::Sender<PipelineEvent>,
}

impl Worker {
    fn run(self) {
        let repo = match GitRepo::open(&self.scope.repo_path) {
            Ok(repo) => Some(repo),
            Err(e) => {
                tracing::error!("Worker {} cannot open repository: {}", self.id, e);
                None
            }
        };

        loop {
            let item = {
                let mut rx = self.work_rx.lock().unwrap_or_else(|e| e.into_inner());
                rx.blocking_recv()
            };
            let Some(item) = item else {
                break;
            };

            let events = match &repo {
                Some(repo) => vec![self.process(repo, item)],
                None => item
                    .refs
                    .into_iter()
                    .map(|name| PipelineEvent::RefFailed {
                        name,
                        reason: "worker could not open repository".to_string(),
                    })
                    .collect(),
            };

            for event in events {
                if self.results_tx.blocking_send(event).is_err() {
                    return;
                }
            }
        }

        tracing::debug!("Worker {} finished", self.id);
    }

    fn process(&self, repo: &GitRepo, item: ReadItem) -> PipelineEvent {
        let size = match item.size {
            Some(size) => size,
            None => match repo.blob_size(&item.blob) {
                Ok(size) => size,
                Err(e) => {
                    tracing::warn!("Skipping {}: {}", item.path, e);
                    return PipelineEvent::Skipped;
                }
            },
        };

        if ContentClassifier::exceeds_limit(size, self.size_limit) {
            tracing::debug!("Skipping {} ({} bytes): over size limit", item.path, size);
            return PipelineEvent::Skipped;
        }

        let (mime, bytes) = match repo.detect_content_type(&item.blob) {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!("Skipping {}: {}", item.path, e);
                return PipelineEvent::Skipped;
            }
        };

        match self.classifier.classify(mime, &bytes, size, self.size_limit) {
            Classification::Accept { text, encoding } => {
                let document = IndexDocument {
                    key: self.scope.key(&item.blob, &item.path),
                    content: text,
                    encoding,
                    size,
                    extension: extension_of(&item.path),
                    refs: item.refs,
                };
                PipelineEvent::Operation(IndexOperation::Add(document))
            }
            Classification::Reject(reason) => {
                tracing::debug!("Skipping {}: {}", item.path, reason);
                PipelineEvent::Skipped
            }
        }
    }
}
