//! Upstream repositories and mirrors for integration tests

#![allow(dead_code)]

use blobdex::config::Config;
use blobdex::index::TantivyIndex;
use blobdex::settings::SettingsStore;
use blobdex::sync::SyncService;
use git2::{Oid, Repository, Signature};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// A non-bare repository that commits are written to
pub struct Upstream {
    pub repo: Repository,
    pub dir: PathBuf,
}

impl Upstream {
    pub fn init(dir: &Path) -> Self {
        let repo = Repository::init(dir).unwrap();
        Self {
            repo,
            dir: dir.to_path_buf(),
        }
    }

    /// Commit a tree holding exactly `files` onto `branch`
    pub fn commit(&self, branch: &str, files: &[(&str, &str)]) -> String {
        let mut index = self.repo.index().unwrap();
        index.clear().unwrap();

        for (path, content) in files {
            let full = self.dir.join(path);
            if let Some(parent) = full.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::write(&full, content).unwrap();
            index.add_path(Path::new(path)).unwrap();
        }
        index.write().unwrap();

        let tree = self.repo.find_tree(index.write_tree().unwrap()).unwrap();
        let sig = Signature::now("Upstream", "upstream@example.com").unwrap();
        let refname = format!("refs/heads/{}", branch);
        let parent = self
            .repo
            .find_reference(&refname)
            .ok()
            .and_then(|r| r.peel_to_commit().ok());
        let parents: Vec<&git2::Commit> = parent.iter().collect();

        self.repo
            .commit(Some(&refname), &sig, &sig, "upstream commit", &tree, &parents)
            .unwrap()
            .to_string()
    }

    pub fn branch(&self, name: &str, commit: &str) {
        self.repo
            .reference(
                &format!("refs/heads/{}", name),
                Oid::from_str(commit).unwrap(),
                true,
                "branch",
            )
            .unwrap();
    }

    pub fn tag(&self, name: &str, commit: &str) {
        self.repo
            .reference(
                &format!("refs/tags/{}", name),
                Oid::from_str(commit).unwrap(),
                true,
                "tag",
            )
            .unwrap();
    }

    pub fn delete_ref(&self, refname: &str) {
        self.repo.find_reference(refname).unwrap().delete().unwrap();
    }

    pub fn url(&self) -> String {
        format!("file://{}", self.dir.display())
    }
}

/// Mirror every branch and tag of `upstream` into the bare repository at
/// `mirror`, pruning refs that no longer exist upstream
pub fn mirror_locally(upstream: &Upstream, mirror: &Path) {
    let repo = if mirror.join("HEAD").exists() {
        Repository::open_bare(mirror).unwrap()
    } else {
        fs::create_dir_all(mirror).unwrap();
        Repository::init_bare(mirror).unwrap()
    };

    let mut remote = repo
        .remote_anonymous(upstream.dir.to_str().unwrap())
        .unwrap();
    remote
        .fetch(
            &["+refs/heads/*:refs/heads/*", "+refs/tags/*:refs/tags/*"],
            None,
            None,
        )
        .unwrap();

    let mut stale = Vec::new();
    for reference in repo.references().unwrap() {
        let reference = reference.unwrap();
        let Some(name) = reference.name() else {
            continue;
        };
        if (name.starts_with("refs/heads/") || name.starts_with("refs/tags/"))
            && upstream.repo.find_reference(name).is_err()
        {
            stale.push(name.to_string());
        }
    }
    for name in stale {
        repo.find_reference(&name).unwrap().delete().unwrap();
    }
}

pub fn git_available() -> bool {
    std::process::Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// A data directory with one registered repository and an in-memory index
pub struct Workspace {
    pub temp_dir: TempDir,
    pub upstream: Upstream,
    pub service: SyncService,
    pub index: Arc<TantivyIndex>,
}

impl Workspace {
    pub async fn new(skip_fetch: bool) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let upstream = Upstream::init(&temp_dir.path().join("upstream/origin"));

        let mut config = Config::default();
        config.storage.data_dir = temp_dir.path().join("data");
        config.git.skip_fetch = skip_fetch;
        config.indexing.workers = 2;

        let settings =
            SettingsStore::open(&config.storage.data_dir, config.indexing.size_limit).unwrap();
        settings
            .add_repository("acme", "webapp", &upstream.url())
            .await
            .unwrap();

        let index = Arc::new(TantivyIndex::in_memory().unwrap());
        let service =
            SyncService::new(Arc::new(config), Arc::new(settings), index.clone()).unwrap();

        Self {
            temp_dir,
            upstream,
            service,
            index,
        }
    }

    pub fn mirror_path(&self) -> PathBuf {
        self.service.locator().path("acme", "webapp", "origin")
    }

    /// Bring the mirror up to date with the upstream without a git binary
    pub fn fetch(&self) {
        mirror_locally(&self.upstream, &self.mirror_path());
    }
}

pub fn blob_id(content: &str) -> String {
    Oid::hash_object(git2::ObjectType::Blob, content.as_bytes())
        .unwrap()
        .to_string()
}
