//! Content-addressable document model and the index abstraction
//!
//! One document exists per (organization, project, repository, blob, path).
//! Its `refs` set lists every live ref whose indexed tree holds exactly that
//! blob at that path; the document is removed when the set becomes empty.

/// tantivy-backed implementation
pub mod tantivy_index;

pub use tantivy_index::TantivyIndex;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;

/// Identity of an index document
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentKey {
    pub organization: String,
    pub project: String,
    pub repository: String,
    pub blob: String,
    pub path: String,
}

impl DocumentKey {
    pub fn new(
        organization: impl Into<String>,
        project: impl Into<String>,
        repository: impl Into<String>,
        blob: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            organization: organization.into(),
            project: project.into(),
            repository: repository.into(),
            blob: blob.into(),
            path: path.into(),
        }
    }

    /// `org:project:repo:blob:path`
    pub fn id(&self) -> String {
        self.to_string()
    }

    /// Facet value for a ref of this document's repository
    pub fn full_ref(&self, git_ref: &str) -> String {
        full_ref(&self.organization, &self.project, &self.repository, git_ref)
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}:{}",
            self.organization, self.project, self.repository, self.blob, self.path
        )
    }
}

/// `org:project/repository:ref`
pub fn full_ref(organization: &str, project: &str, repository: &str, git_ref: &str) -> String {
    format!("{}:{}/{}:{}", organization, project, repository, git_ref)
}

/// File extension without the dot, empty when the file name has none
pub fn extension_of(path: &str) -> String {
    Path::new(path)
        .extension()
        .map(|ext| ext.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// A searchable file version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDocument {
    pub key: DocumentKey,
    pub content: String,
    pub encoding: String,
    pub size: u64,
    pub extension: String,
    pub refs: BTreeSet<String>,
}

impl IndexDocument {
    pub fn id(&self) -> String {
        self.key.id()
    }

    /// Hierarchical facet values derived from `refs`
    pub fn full_refs(&self) -> Vec<String> {
        self.refs.iter().map(|r| self.key.full_ref(r)).collect()
    }

    fn with_refs(&self, refs: BTreeSet<String>) -> Self {
        Self {
            refs,
            ..self.clone()
        }
    }
}

/// A unit of work for the index
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexOperation {
    /// Add `doc.refs` to the document, creating it when absent
    Add(IndexDocument),
    /// Remove `refs` from the document, dropping it when none remain
    Delete {
        key: DocumentKey,
        refs: BTreeSet<String>,
    },
}

impl IndexOperation {
    pub fn key(&self) -> &DocumentKey {
        match self {
            IndexOperation::Add(doc) => &doc.key,
            IndexOperation::Delete { key, .. } => key,
        }
    }

    pub fn refs(&self) -> &BTreeSet<String> {
        match self {
            IndexOperation::Add(doc) => &doc.refs,
            IndexOperation::Delete { refs, .. } => refs,
        }
    }

    /// Bytes of content carried, used to size batches
    pub fn content_len(&self) -> usize {
        match self {
            IndexOperation::Add(doc) => doc.content.len(),
            IndexOperation::Delete { .. } => 0,
        }
    }
}

/// Result of applying one operation to the current document state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentChange {
    Unchanged,
    Put(IndexDocument),
    Remove,
}

/// Pure document state transition
///
/// Content of an existing document is never replaced; only its ref set
/// changes.
pub fn apply_operation(existing: Option<&IndexDocument>, op: &IndexOperation) -> DocumentChange {
    match (existing, op) {
        (None, IndexOperation::Add(doc)) => {
            if doc.refs.is_empty() {
                DocumentChange::Unchanged
            } else {
                DocumentChange::Put(doc.clone())
            }
        }
        (Some(current), IndexOperation::Add(doc)) => {
            if doc.refs.is_subset(&current.refs) {
                return DocumentChange::Unchanged;
            }
            let merged = current.refs.union(&doc.refs).cloned().collect();
            DocumentChange::Put(current.with_refs(merged))
        }
        (None, IndexOperation::Delete { .. }) => DocumentChange::Unchanged,
        (Some(current), IndexOperation::Delete { refs, .. }) => {
            if current.refs.is_disjoint(refs) {
                return DocumentChange::Unchanged;
            }
            let remaining: BTreeSet<String> = current.refs.difference(refs).cloned().collect();
            if remaining.is_empty() {
                DocumentChange::Remove
            } else {
                DocumentChange::Put(current.with_refs(remaining))
            }
        }
    }
}

/// Counts from one committed batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    /// Documents created or rewritten
    pub written: usize,
    /// Documents dropped
    pub removed: usize,
    /// Operations that changed nothing
    pub unchanged: usize,
}

/// Equality filters intersected with the query
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchFilters {
    pub extensions: Vec<String>,
    pub organizations: Vec<String>,
    pub projects: Vec<String>,
    pub repositories: Vec<String>,
    pub refs: Vec<String>,
}

/// A paginated search request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    /// Query-parser expression over `content` and `path`; empty matches all
    pub query: String,
    pub filters: SearchFilters,
    /// Zero-based page number
    pub page: usize,
    pub page_size: usize,
}

impl SearchQuery {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            filters: SearchFilters::default(),
            page: 0,
            page_size: 20,
        }
    }
}

/// One document matching a query
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub document: IndexDocument,
    pub score: f32,
    /// Distinct lowercase words highlighted in the content
    pub highlights: Vec<String>,
}

/// Count of hits sharing a facet value
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FacetCount {
    pub value: String,
    pub count: u64,
}

/// One page of results with facet breakdowns over all matches
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHits {
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
    pub hits: Vec<SearchHit>,
    pub extension_facets: Vec<FacetCount>,
    pub ref_facets: Vec<FacetCount>,
}

/// Index statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    pub total_documents: u64,
}

/// Storage for content-addressable documents
///
/// Implementations serialize every read-merge-write so operations on the
/// same document id never interleave.
pub trait ContentIndex: Send + Sync {
    /// Merge `doc.refs` into the stored document, creating it when absent
    fn upsert(&self, doc: IndexDocument) -> Result<BatchStats> {
        self.batch(vec![IndexOperation::Add(doc)])
    }

    /// Remove `refs` from a document, dropping it when none remain
    fn delete(&self, key: &DocumentKey, refs: &BTreeSet<String>) -> Result<BatchStats> {
        self.batch(vec![IndexOperation::Delete {
            key: key.clone(),
            refs: refs.clone(),
        }])
    }

    /// Apply operations in order and commit once
    fn batch(&self, ops: Vec<IndexOperation>) -> Result<BatchStats>;

    /// Remove `refs` from every document of one repository
    fn delete_by_refs(
        &self,
        organization: &str,
        project: &str,
        repository: &str,
        refs: &BTreeSet<String>,
    ) -> Result<BatchStats>;

    fn get(&self, key: &DocumentKey) -> Result<Option<IndexDocument>>;

    fn search(&self, query: &SearchQuery) -> Result<SearchHits>;

    fn stats(&self) -> Result<IndexStats>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refs(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn doc(blob: &str, path: &str, ref_names: &[&str]) -> IndexDocument {
        IndexDocument {
            key: DocumentKey::new("acme", "webapp", "origin", blob, path),
            content: format!("content of {}", blob),
            encoding: "utf-8".to_string(),
            size: 12,
            extension: extension_of(path),
            refs: refs(ref_names),
        }
    }

    fn delete(blob: &str, path: &str, ref_names: &[&str]) -> IndexOperation {
        IndexOperation::Delete {
            key: DocumentKey::new("acme", "webapp", "origin", blob, path),
            refs: refs(ref_names),
        }
    }

    #[test]
    fn test_document_id_and_full_refs() {
        let document = doc("b1", "src/foo.txt", &["master", "v1.0"]);
        assert_eq!(document.id(), "acme:webapp:origin:b1:src/foo.txt");
        assert_eq!(
            document.full_refs(),
            vec!["acme:webapp/origin:master", "acme:webapp/origin:v1.0"]
        );
    }

    #[test]
    fn test_extension_of() {
        assert_eq!(extension_of("src/main.rs"), "rs");
        assert_eq!(extension_of("archive.tar.gz"), "gz");
        assert_eq!(extension_of("Makefile"), "");
        assert_eq!(extension_of(".gitignore"), "");
        assert_eq!(extension_of("dir.d/README"), "");
    }

    #[test]
    fn test_add_to_absent_creates() {
        let document = doc("b1", "foo.txt", &["master"]);
        let change = apply_operation(None, &IndexOperation::Add(document.clone()));
        assert_eq!(change, DocumentChange::Put(document));
    }

    #[test]
    fn test_add_merges_refs_and_keeps_content() {
        let existing = doc("b1", "foo.txt", &["master"]);
        let mut incoming = doc("b1", "foo.txt", &["develop"]);
        incoming.content = "should not replace".to_string();

        let change = apply_operation(Some(&existing), &IndexOperation::Add(incoming));
        let DocumentChange::Put(merged) = change else {
            panic!("expected a put");
        };
        assert_eq!(merged.refs, refs(&["develop", "master"]));
        assert_eq!(merged.content, existing.content);
    }

    #[test]
    fn test_add_known_refs_is_noop() {
        let existing = doc("b1", "foo.txt", &["master", "develop"]);
        let incoming = doc("b1", "foo.txt", &["master"]);
        assert_eq!(
            apply_operation(Some(&existing), &IndexOperation::Add(incoming)),
            DocumentChange::Unchanged
        );
    }

    #[test]
    fn test_delete_shrinks_then_removes() {
        let existing = doc("b1", "foo.txt", &["branchA", "branchB"]);

        let change = apply_operation(Some(&existing), &delete("b1", "foo.txt", &["branchB"]));
        let DocumentChange::Put(shrunk) = change else {
            panic!("expected a put");
        };
        assert_eq!(shrunk.refs, refs(&["branchA"]));

        assert_eq!(
            apply_operation(Some(&shrunk), &delete("b1", "foo.txt", &["branchA"])),
            DocumentChange::Remove
        );
    }

    #[test]
    fn test_delete_absent_or_unrelated_is_noop() {
        assert_eq!(
            apply_operation(None, &delete("b1", "foo.txt", &["master"])),
            DocumentChange::Unchanged
        );

        let existing = doc("b1", "foo.txt", &["master"]);
        assert_eq!(
            apply_operation(Some(&existing), &delete("b1", "foo.txt", &["develop"])),
            DocumentChange::Unchanged
        );
    }

    #[test]
    fn test_operations_commute_per_document() {
        let add_a = IndexOperation::Add(doc("b1", "foo.txt", &["a"]));
        let add_b = IndexOperation::Add(doc("b1", "foo.txt", &["b"]));

        let step = |state: Option<IndexDocument>, op: &IndexOperation| match apply_operation(state.as_ref(), op) {
            DocumentChange::Unchanged => state,
            DocumentChange::Put(d) => Some(d),
            DocumentChange::Remove => None,
        };

        let ab = step(step(None, &add_a), &add_b).unwrap();
        let ba = step(step(None, &add_b), &add_a).unwrap();
        assert_eq!(ab.refs, ba.refs);
        assert_eq!(ab.refs, refs(&["a", "b"]));
    }

    #[test]
    fn test_operation_accessors() {
        let add = IndexOperation::Add(doc("b1", "foo.txt", &["master"]));
        assert_eq!(add.content_len(), "content of b1".len());
        assert_eq!(add.key().path, "foo.txt");

        let del = delete("b1", "foo.txt", &["master"]);
        assert_eq!(del.content_len(), 0);
        assert_eq!(del.refs(), &refs(&["master"]));
    }
}
