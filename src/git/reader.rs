use super::{DiffEntry, FileEntry, GitRef, RefFilters, RefKind};
use crate::classifier::sniff;
use crate::error::GitError;
use git2::{Delta, DiffFile, DiffFindOptions, DiffOptions, FileMode, ObjectType, Odb, Oid, Repository, Tree};
use std::path::{Path, PathBuf};

const BRANCH_PREFIX: &str = "refs/heads/";
const TAG_PREFIX: &str = "refs/tags/";

/// Read-only handle on one bare or mirrored repository
///
/// `Repository` is not `Sync`; every worker thread opens its own `GitRepo`.
pub struct GitRepo {
    repo: Repository,
    path: PathBuf,
}

impl GitRepo {
    /// Open the repository at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, GitError> {
        let path = path.as_ref().to_path_buf();
        let repo = Repository::open(&path).map_err(|e| GitError::OpenFailed {
            path: path.display().to_string(),
            reason: e.message().to_string(),
        })?;

        tracing::debug!("Opened git repository at: {}", path.display());
        Ok(Self { repo, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// List branches and tags that pass `filters`
    pub fn list_refs(&self, filters: &RefFilters) -> Result<Vec<GitRef>, GitError> {
        let references = self
            .repo
            .references()
            .map_err(|e| GitError::RefListFailed(e.message().to_string()))?;

        let mut refs = Vec::new();
        for reference in references {
            let reference =
                reference.map_err(|e| GitError::RefListFailed(e.message().to_string()))?;

            let Some(full_name) = reference.name() else {
                tracing::warn!("Skipping ref with a non UTF-8 name");
                continue;
            };

            let (kind, name) = if let Some(name) = full_name.strip_prefix(BRANCH_PREFIX) {
                (RefKind::Branch, name)
            } else if let Some(name) = full_name.strip_prefix(TAG_PREFIX) {
                (RefKind::Tag, name)
            } else {
                continue;
            };

            if !filters.allows(kind, name) {
                tracing::debug!("Ref {} {} excluded by filters", kind, name);
                continue;
            }

            let commit = match reference.peel_to_commit() {
                Ok(commit) => commit,
                Err(e) => {
                    tracing::warn!("Skipping {} {}: does not point to a commit ({})", kind, name, e.message());
                    continue;
                }
            };

            refs.push(GitRef {
                name: name.to_string(),
                kind,
                commit_id: commit.id().to_string(),
            });
        }

        tracing::debug!("Listed {} refs in {}", refs.len(), self.path.display());
        Ok(refs)
    }

    /// Lazily walk every file of a commit's tree
    pub fn list_files(&self, commit: &str) -> Result<TreeFiles<'_>, GitError> {
        let tree = self.commit_tree(commit)?;
        let odb = self.repo.odb().map_err(|e| GitError::TreeWalkFailed {
            commit: commit.to_string(),
            reason: e.message().to_string(),
        })?;

        Ok(TreeFiles::new(&self.repo, odb, commit.to_string(), tree))
    }

    /// Normalized tree diff between two commits with rename and copy detection
    pub fn diff(&self, from: &str, to: &str) -> Result<Vec<DiffEntry>, GitError> {
        let old_tree = self.commit_tree(from)?;
        let new_tree = self.commit_tree(to)?;
        let diff_failed = |e: git2::Error| GitError::DiffFailed {
            from: from.to_string(),
            to: to.to_string(),
            reason: e.message().to_string(),
        };

        let mut opts = DiffOptions::new();
        opts.include_typechange(true);
        let mut diff = self
            .repo
            .diff_tree_to_tree(Some(&old_tree), Some(&new_tree), Some(&mut opts))
            .map_err(diff_failed)?;

        let mut find = DiffFindOptions::new();
        find.renames(true).copies(true);
        diff.find_similar(Some(&mut find)).map_err(diff_failed)?;

        let mut entries = Vec::new();
        for delta in diff.deltas() {
            let old = file_side(&delta.old_file());
            let new = file_side(&delta.new_file());

            match delta.status() {
                Delta::Added | Delta::Copied => {
                    if let Some((blob, path)) = new {
                        entries.push(DiffEntry::added(blob, path));
                    }
                }
                Delta::Deleted => {
                    if let Some((blob, path)) = old {
                        entries.push(DiffEntry::deleted(blob, path));
                    }
                }
                Delta::Modified | Delta::Typechange | Delta::Renamed => {
                    if old == new {
                        continue;
                    }
                    if let Some((blob, path)) = old {
                        entries.push(DiffEntry::deleted(blob, path));
                    }
                    if let Some((blob, path)) = new {
                        entries.push(DiffEntry::added(blob, path));
                    }
                }
                Delta::Conflicted => {
                    tracing::warn!(
                        "Ignoring unmerged entry {:?} in diff {}..{}",
                        delta.new_file().path(),
                        from,
                        to
                    );
                }
                _ => {}
            }
        }

        Ok(entries)
    }

    /// Size of a blob read from the object header
    pub fn blob_size(&self, blob: &str) -> Result<u64, GitError> {
        let oid = parse_oid(blob)?;
        let odb = self
            .repo
            .odb()
            .map_err(|_| GitError::BlobNotFound(blob.to_string()))?;
        let (size, _) = odb
            .read_header(oid)
            .map_err(|_| GitError::BlobNotFound(blob.to_string()))?;
        Ok(size as u64)
    }

    /// Full content of a blob
    pub fn blob_bytes(&self, blob: &str) -> Result<Vec<u8>, GitError> {
        let oid = parse_oid(blob)?;
        let blob_obj = self
            .repo
            .find_blob(oid)
            .map_err(|_| GitError::BlobNotFound(blob.to_string()))?;
        Ok(blob_obj.content().to_vec())
    }

    /// Sniffed content type of a blob together with its bytes
    pub fn detect_content_type(&self, blob: &str) -> Result<(&'static str, Vec<u8>), GitError> {
        let bytes = self.blob_bytes(blob)?;
        let mime = sniff::detect_content_type(&bytes);
        Ok((mime, bytes))
    }

    /// Whether `path` holds exactly `blob` in the tree of `commit`
    pub fn exists_at_commit(&self, commit: &str, path: &str, blob: &str) -> Result<bool, GitError> {
        let tree = self.commit_tree(commit)?;
        let blob_oid = parse_oid(blob)?;

        match tree.get_path(Path::new(path)) {
            Ok(entry) => Ok(entry.id() == blob_oid && entry.kind() == Some(ObjectType::Blob)),
            Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(false),
            Err(e) => Err(GitError::TreeWalkFailed {
                commit: commit.to_string(),
                reason: e.message().to_string(),
            }),
        }
    }

    fn commit_tree(&self, commit: &str) -> Result<Tree<'_>, GitError> {
        let oid = parse_oid(commit)?;
        let commit_obj = self
            .repo
            .find_commit(oid)
            .map_err(|_| GitError::CommitNotFound(commit.to_string()))?;
        commit_obj.tree().map_err(|e| GitError::TreeWalkFailed {
            commit: commit.to_string(),
            reason: e.message().to_string(),
        })
    }
}

fn parse_oid(id: &str) -> Result<Oid, GitError> {
    Oid::from_str(id).map_err(|_| GitError::InvalidObjectId(id.to_string()))
}

/// (blob, path) of one side of a delta, or None for gitlinks and absent sides
fn file_side(file: &DiffFile<'_>) -> Option<(String, String)> {
    if file.id().is_zero() || file.mode() == FileMode::Commit || file.mode() == FileMode::Unreadable {
        return None;
    }
    let path = file.path()?.to_string_lossy().into_owned();
    Some((file.id().to_string(), path))
}

struct Frame<'repo> {
    tree: Tree<'repo>,
    prefix: String,
    next: usize,
}

/// Depth-first iterator over the files of one commit
///
/// Trees are loaded on demand; gitlink entries are skipped. `restart`
/// rewinds to the root so the same walk can be replayed.
pub struct TreeFiles<'repo> {
    repo: &'repo Repository,
    odb: Odb<'repo>,
    commit: String,
    root: Oid,
    stack: Vec<Frame<'repo>>,
}

impl<'repo> TreeFiles<'repo> {
    fn new(repo: &'repo Repository, odb: Odb<'repo>, commit: String, root: Tree<'repo>) -> Self {
        let root_id = root.id();
        Self {
            repo,
            odb,
            commit,
            root: root_id,
            stack: vec![Frame {
                tree: root,
                prefix: String::new(),
                next: 0,
            }],
        }
    }

    /// Commit being walked
    pub fn commit(&self) -> &str {
        &self.commit
    }

    /// Rewind the walk to the root tree
    pub fn restart(&mut self) -> Result<(), GitError> {
        let tree = self
            .repo
            .find_tree(self.root)
            .map_err(|e| self.walk_error(e))?;
        self.stack.clear();
        self.stack.push(Frame {
            tree,
            prefix: String::new(),
            next: 0,
        });
        Ok(())
    }

    fn walk_error(&self, e: git2::Error) -> GitError {
        GitError::TreeWalkFailed {
            commit: self.commit.clone(),
            reason: e.message().to_string(),
        }
    }
}

impl Iterator for TreeFiles<'_> {
    type Item = Result<FileEntry, GitError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let frame = self.stack.last_mut()?;
            if frame.next >= frame.tree.len() {
                self.stack.pop();
                continue;
            }

            let index = frame.next;
            frame.next += 1;

            let (id, kind, path) = {
                let Some(entry) = frame.tree.get(index) else {
                    continue;
                };
                let name = String::from_utf8_lossy(entry.name_bytes()).into_owned();
                let path = if frame.prefix.is_empty() {
                    name
                } else {
                    format!("{}/{}", frame.prefix, name)
                };
                (entry.id(), entry.kind(), path)
            };

            match kind {
                Some(ObjectType::Tree) => match self.repo.find_tree(id) {
                    Ok(tree) => self.stack.push(Frame {
                        tree,
                        prefix: path,
                        next: 0,
                    }),
                    Err(e) => return Some(Err(self.walk_error(e))),
                },
                Some(ObjectType::Blob) => {
                    return Some(match self.odb.read_header(id) {
                        Ok((size, _)) => Ok(FileEntry {
                            blob: id.to_string(),
                            path,
                            size: size as u64,
                        }),
                        Err(e) => Err(self.walk_error(e)),
                    });
                }
                // gitlink
                _ => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::DiffStatus;
    use crate::test_support::{FixtureRepo, blob_id};
    use regex::Regex;
    use tempfile::TempDir;

    fn fixture() -> (TempDir, FixtureRepo) {
        let temp_dir = TempDir::new().unwrap();
        let fixture = FixtureRepo::init(&temp_dir.path().join("origin.git"));
        (temp_dir, fixture)
    }

    #[test]
    fn test_list_refs_branches_and_tags() {
        let (_temp_dir, fixture) = fixture();
        let c1 = fixture.commit(&[("README.md", b"hello")], None);
        let c2 = fixture.commit(&[("README.md", b"hello again")], Some(&c1));
        fixture.set_branch("master", &c2);
        fixture.set_branch("develop", &c1);
        fixture.lightweight_tag("v1.0", &c1);
        fixture.annotated_tag("v2.0", &c2);

        let repo = GitRepo::open(&fixture.path).unwrap();
        let mut refs = repo.list_refs(&RefFilters::default()).unwrap();
        refs.sort_by(|a, b| a.name.cmp(&b.name));

        let summary: Vec<(&str, RefKind, &str)> = refs
            .iter()
            .map(|r| (r.name.as_str(), r.kind, r.commit_id.as_str()))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("develop", RefKind::Branch, c1.as_str()),
                ("master", RefKind::Branch, c2.as_str()),
                ("v1.0", RefKind::Tag, c1.as_str()),
                ("v2.0", RefKind::Tag, c2.as_str()),
            ]
        );
    }

    #[test]
    fn test_list_refs_applies_filters() {
        let (_temp_dir, fixture) = fixture();
        let c1 = fixture.commit(&[("a.txt", b"a")], None);
        fixture.set_branch("master", &c1);
        fixture.set_branch("feature/x", &c1);
        fixture.lightweight_tag("v1.0", &c1);

        let filters = RefFilters {
            include_branches: Some(Regex::new("^master$").unwrap()),
            exclude_tags: Some(Regex::new(".*").unwrap()),
            ..Default::default()
        };

        let repo = GitRepo::open(&fixture.path).unwrap();
        let refs = repo.list_refs(&filters).unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].name, "master");
    }

    #[test]
    fn test_open_missing_repository() {
        let temp_dir = TempDir::new().unwrap();
        let result = GitRepo::open(temp_dir.path().join("missing.git"));
        assert!(matches!(result, Err(GitError::OpenFailed { .. })));
    }

    #[test]
    fn test_list_files_walks_nested_trees_with_sizes() {
        let (_temp_dir, fixture) = fixture();
        let c1 = fixture.commit(
            &[
                ("README.md", b"readme"),
                ("src/main.rs", b"fn main() {}"),
                ("src/util/mod.rs", b"pub mod x;"),
            ],
            None,
        );

        let repo = GitRepo::open(&fixture.path).unwrap();
        let mut files: Vec<FileEntry> = repo
            .list_files(&c1)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        files.sort_by(|a, b| a.path.cmp(&b.path));

        let paths: Vec<&str> = files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["README.md", "src/main.rs", "src/util/mod.rs"]);
        assert_eq!(files[1].size, 12);
        assert_eq!(files[1].blob, blob_id(b"fn main() {}"));
    }

    #[test]
    fn test_list_files_skips_gitlinks() {
        let (_temp_dir, fixture) = fixture();
        let c1 = fixture.commit(&[("a.txt", b"a")], None);
        let c2 = fixture.commit_with_gitlinks(&[("a.txt", b"a")], &[("vendor/lib", c1.as_str())], Some(&c1));

        let repo = GitRepo::open(&fixture.path).unwrap();
        let files: Vec<FileEntry> = repo
            .list_files(&c2)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();

        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, "a.txt");
    }

    #[test]
    fn test_list_files_restart() {
        let (_temp_dir, fixture) = fixture();
        let c1 = fixture.commit(&[("a.txt", b"a"), ("b/c.txt", b"c")], None);

        let repo = GitRepo::open(&fixture.path).unwrap();
        let mut walk = repo.list_files(&c1).unwrap();
        let first: Vec<String> = walk.by_ref().map(|f| f.unwrap().path).collect();
        assert_eq!(walk.next().map(|f| f.is_ok()), None);

        walk.restart().unwrap();
        let second: Vec<String> = walk.map(|f| f.unwrap().path).collect();
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
    }

    #[test]
    fn test_list_files_missing_commit() {
        let (_temp_dir, fixture) = fixture();
        fixture.commit(&[("a.txt", b"a")], None);

        let repo = GitRepo::open(&fixture.path).unwrap();
        let missing = "0123456789012345678901234567890123456789";
        assert!(matches!(
            repo.list_files(missing),
            Err(GitError::CommitNotFound(_))
        ));
        assert!(matches!(
            repo.list_files("not-a-sha"),
            Err(GitError::InvalidObjectId(_))
        ));
    }

    #[test]
    fn test_diff_modified_file_yields_delete_and_add() {
        let (_temp_dir, fixture) = fixture();
        let c1 = fixture.commit(&[("foo.txt", b"version one\n"), ("keep.txt", b"same\n")], None);
        let c2 = fixture.commit(&[("foo.txt", b"version two\n"), ("keep.txt", b"same\n")], Some(&c1));

        let repo = GitRepo::open(&fixture.path).unwrap();
        let diff = repo.diff(&c1, &c2).unwrap();

        assert_eq!(
            diff,
            vec![
                DiffEntry::deleted(blob_id(b"version one\n"), "foo.txt"),
                DiffEntry::added(blob_id(b"version two\n"), "foo.txt"),
            ]
        );
    }

    #[test]
    fn test_diff_added_and_deleted_files() {
        let (_temp_dir, fixture) = fixture();
        let c1 = fixture.commit(&[("old.txt", b"old content that goes away\n")], None);
        let c2 = fixture.commit(&[("new.txt", b"completely different text\n")], Some(&c1));

        let repo = GitRepo::open(&fixture.path).unwrap();
        let diff = repo.diff(&c1, &c2).unwrap();

        assert_eq!(diff.len(), 2);
        assert!(diff.contains(&DiffEntry::deleted(blob_id(b"old content that goes away\n"), "old.txt")));
        assert!(diff.contains(&DiffEntry::added(blob_id(b"completely different text\n"), "new.txt")));
    }

    #[test]
    fn test_diff_rename_becomes_delete_and_add() {
        let (_temp_dir, fixture) = fixture();
        let content: &[u8] = b"line one\nline two\nline three\nline four\n";
        let c1 = fixture.commit(&[("docs/guide.md", content)], None);
        let c2 = fixture.commit(&[("docs/manual.md", content)], Some(&c1));

        let repo = GitRepo::open(&fixture.path).unwrap();
        let diff = repo.diff(&c1, &c2).unwrap();

        let deleted: Vec<&DiffEntry> = diff.iter().filter(|d| d.status == DiffStatus::Deleted).collect();
        let added: Vec<&DiffEntry> = diff.iter().filter(|d| d.status == DiffStatus::Added).collect();
        assert_eq!(deleted.len(), 1);
        assert_eq!(added.len(), 1);
        assert_eq!(deleted[0].path, "docs/guide.md");
        assert_eq!(added[0].path, "docs/manual.md");
        assert_eq!(deleted[0].blob, added[0].blob);
    }

    #[test]
    fn test_diff_identical_commits_is_empty() {
        let (_temp_dir, fixture) = fixture();
        let c1 = fixture.commit(&[("a.txt", b"a")], None);

        let repo = GitRepo::open(&fixture.path).unwrap();
        assert!(repo.diff(&c1, &c1).unwrap().is_empty());
    }

    #[test]
    fn test_blob_access() {
        let (_temp_dir, fixture) = fixture();
        fixture.commit(&[("a.txt", b"plain text"), ("img.png", b"\x89PNG\r\n\x1a\nrest")], None);

        let repo = GitRepo::open(&fixture.path).unwrap();
        let text = blob_id(b"plain text");
        assert_eq!(repo.blob_size(&text).unwrap(), 10);
        assert_eq!(repo.blob_bytes(&text).unwrap(), b"plain text");

        let (mime, bytes) = repo.detect_content_type(&text).unwrap();
        assert_eq!(mime, "text/plain; charset=utf-8");
        assert_eq!(bytes, b"plain text");

        let (mime, _) = repo.detect_content_type(&blob_id(b"\x89PNG\r\n\x1a\nrest")).unwrap();
        assert_eq!(mime, "image/png");

        let missing = "0123456789012345678901234567890123456789";
        assert!(matches!(repo.blob_bytes(missing), Err(GitError::BlobNotFound(_))));
    }

    #[test]
    fn test_exists_at_commit() {
        let (_temp_dir, fixture) = fixture();
        let c1 = fixture.commit(&[("src/lib.rs", b"one")], None);
        let c2 = fixture.commit(&[("src/lib.rs", b"two")], Some(&c1));

        let repo = GitRepo::open(&fixture.path).unwrap();
        assert!(repo.exists_at_commit(&c1, "src/lib.rs", &blob_id(b"one")).unwrap());
        assert!(!repo.exists_at_commit(&c2, "src/lib.rs", &blob_id(b"one")).unwrap());
        assert!(!repo.exists_at_commit(&c1, "src/missing.rs", &blob_id(b"one")).unwrap());
    }
}
