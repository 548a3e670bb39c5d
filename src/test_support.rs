//! Fixture repositories built in-process with git2

use git2::{ObjectType, Oid, Repository, Signature};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const FILE_MODE: i32 = 0o100644;
const TREE_MODE: i32 = 0o040000;
const GITLINK_MODE: i32 = 0o160000;

/// A bare repository with helpers to write commits, branches and tags
pub struct FixtureRepo {
    pub repo: Repository,
    pub path: PathBuf,
}

impl FixtureRepo {
    pub fn init(path: &Path) -> Self {
        std::fs::create_dir_all(path).unwrap();
        let repo = Repository::init_bare(path).unwrap();
        Self {
            repo,
            path: path.to_path_buf(),
        }
    }

    /// Write a commit whose tree holds exactly `files`
    pub fn commit(&self, files: &[(&str, &[u8])], parent: Option<&str>) -> String {
        let tree_id = write_tree(&self.repo, files, &[]);
        self.commit_tree(tree_id, parent)
    }

    /// Write a commit that also carries gitlink entries
    pub fn commit_with_gitlinks(
        &self,
        files: &[(&str, &[u8])],
        gitlinks: &[(&str, &str)],
        parent: Option<&str>,
    ) -> String {
        let tree_id = write_tree(&self.repo, files, gitlinks);
        self.commit_tree(tree_id, parent)
    }

    fn commit_tree(&self, tree_id: Oid, parent: Option<&str>) -> String {
        let tree = self.repo.find_tree(tree_id).unwrap();
        let sig = Signature::now("Fixture", "fixture@example.com").unwrap();
        let parent_commit = parent.map(|id| self.repo.find_commit(Oid::from_str(id).unwrap()).unwrap());
        let parents: Vec<&git2::Commit> = parent_commit.iter().collect();

        self.repo
            .commit(None, &sig, &sig, "fixture commit", &tree, &parents)
            .unwrap()
            .to_string()
    }

    pub fn set_branch(&self, name: &str, commit: &str) {
        self.repo
            .reference(
                &format!("refs/heads/{}", name),
                Oid::from_str(commit).unwrap(),
                true,
                "fixture branch",
            )
            .unwrap();
    }

    pub fn delete_branch(&self, name: &str) {
        self.repo
            .find_reference(&format!("refs/heads/{}", name))
            .unwrap()
            .delete()
            .unwrap();
    }

    pub fn lightweight_tag(&self, name: &str, commit: &str) {
        self.repo
            .reference(
                &format!("refs/tags/{}", name),
                Oid::from_str(commit).unwrap(),
                true,
                "fixture tag",
            )
            .unwrap();
    }

    pub fn annotated_tag(&self, name: &str, commit: &str) {
        let target = self
            .repo
            .find_object(Oid::from_str(commit).unwrap(), Some(ObjectType::Commit))
            .unwrap();
        let sig = Signature::now("Fixture", "fixture@example.com").unwrap();
        self.repo
            .tag(name, &target, &sig, "fixture annotated tag", true)
            .unwrap();
    }
}

/// Blob id git would assign to `content`
pub fn blob_id(content: &[u8]) -> String {
    Oid::hash_object(ObjectType::Blob, content).unwrap().to_string()
}

fn write_tree(repo: &Repository, files: &[(&str, &[u8])], gitlinks: &[(&str, &str)]) -> Oid {
    let mut builder = repo.treebuilder(None).unwrap();
    let mut subdirs: BTreeMap<&str, (Vec<(&str, &[u8])>, Vec<(&str, &str)>)> = BTreeMap::new();

    for (path, content) in files {
        match path.split_once('/') {
            Some((dir, rest)) => subdirs.entry(dir).or_default().0.push((rest, *content)),
            None => {
                let oid = repo.blob(content).unwrap();
                builder.insert(path, oid, FILE_MODE).unwrap();
            }
        }
    }

    for (path, commit) in gitlinks {
        match path.split_once('/') {
            Some((dir, rest)) => subdirs.entry(dir).or_default().1.push((rest, *commit)),
            None => {
                builder
                    .insert(path, Oid::from_str(commit).unwrap(), GITLINK_MODE)
                    .unwrap();
            }
        }
    }

    for (dir, (entries, links)) in subdirs {
        let oid = write_tree(repo, &entries, &links);
        builder.insert(dir, oid, TREE_MODE).unwrap();
    }

    builder.write().unwrap()
}

/// Index whose writes always fail
pub struct FailingIndex;

impl crate::index::ContentIndex for FailingIndex {
    fn batch(&self, _ops: Vec<crate::index::IndexOperation>) -> anyhow::Result<crate::index::BatchStats> {
        anyhow::bail!("disk full")
    }

    fn delete_by_refs(
        &self,
        _organization: &str,
        _project: &str,
        _repository: &str,
        _refs: &std::collections::BTreeSet<String>,
    ) -> anyhow::Result<crate::index::BatchStats> {
        anyhow::bail!("disk full")
    }

    fn get(&self, _key: &crate::index::DocumentKey) -> anyhow::Result<Option<crate::index::IndexDocument>> {
        Ok(None)
    }

    fn search(&self, _query: &crate::index::SearchQuery) -> anyhow::Result<crate::index::SearchHits> {
        anyhow::bail!("not searchable")
    }

    fn stats(&self) -> anyhow::Result<crate::index::IndexStats> {
        Ok(crate::index::IndexStats { total_documents: 0 })
    }
}
