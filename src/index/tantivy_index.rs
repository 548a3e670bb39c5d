use super::{
    BatchStats, ContentIndex, DocumentChange, DocumentKey, FacetCount, IndexDocument,
    IndexOperation, IndexStats, SearchFilters, SearchHit, SearchHits, SearchQuery,
    apply_operation,
};
use crate::error::IndexError;
use anyhow::{Context, Result};
use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Mutex;
use tantivy::collector::{Count, DocSetCollector, FacetCollector, FacetCounts, TopDocs};
use tantivy::query::{AllQuery, BooleanQuery, Occur, Query, QueryParser, TermQuery};
use tantivy::schema::{
    FacetOptions, Facet, Field, IndexRecordOption, STORED, STRING, Schema, TEXT, Term, Value,
};
use tantivy::snippet::SnippetGenerator;
use tantivy::{Index, IndexReader, IndexWriter, ReloadPolicy, Searcher, TantivyDocument};

const WRITER_MEMORY_BUDGET: usize = 50_000_000;
/// Snippets only look this far into a document; hits whose match lies
/// further in are highlighted with the query's own terms
const SNIPPET_MAX_CHARS: usize = 100_000;
const FULL_REFS_FACET: &str = "full_refs";
const EXTENSION_FACET: &str = "extension_facet";

struct Fields {
    id: Field,
    organization: Field,
    project: Field,
    repository: Field,
    blob: Field,
    path: Field,
    content: Field,
    encoding: Field,
    size: Field,
    extension: Field,
    refs: Field,
    full_refs: Field,
    extension_facet: Field,
}

impl Fields {
    fn resolve(schema: &Schema) -> Result<Self> {
        let field = |name: &str| {
            schema
                .get_field(name)
                .with_context(|| format!("index schema has no '{}' field", name))
        };

        Ok(Self {
            id: field("id")?,
            organization: field("organization")?,
            project: field("project")?,
            repository: field("repository")?,
            blob: field("blob")?,
            path: field("path")?,
            content: field("content")?,
            encoding: field("encoding")?,
            size: field("size")?,
            extension: field("extension")?,
            refs: field("refs")?,
            full_refs: field(FULL_REFS_FACET)?,
            extension_facet: field(EXTENSION_FACET)?,
        })
    }
}

fn build_schema() -> Schema {
    let mut schema_builder = Schema::builder();
    schema_builder.add_text_field("id", STRING | STORED);
    schema_builder.add_text_field("organization", STRING | STORED);
    schema_builder.add_text_field("project", STRING | STORED);
    schema_builder.add_text_field("repository", STRING | STORED);
    schema_builder.add_text_field("blob", STRING | STORED);
    schema_builder.add_text_field("path", TEXT | STORED);
    schema_builder.add_text_field("content", TEXT | STORED);
    schema_builder.add_text_field("encoding", STORED);
    schema_builder.add_u64_field("size", STORED);
    schema_builder.add_text_field("extension", STRING | STORED);
    schema_builder.add_text_field("refs", STRING | STORED);
    schema_builder.add_facet_field(FULL_REFS_FACET, FacetOptions::default());
    schema_builder.add_facet_field(EXTENSION_FACET, FacetOptions::default());
    schema_builder.build()
}

/// Content-addressable index stored with tantivy
///
/// Every batch holds `writer_lock` from the first lookup to the commit, so
/// read-merge-write of a document id never races another batch.
pub struct TantivyIndex {
    index: Index,
    fields: Fields,
    writer_lock: Mutex<()>,
}

impl TantivyIndex {
    /// Open the index at `index_path`, creating it when missing
    pub fn open<P: AsRef<Path>>(index_path: P) -> Result<Self> {
        let index_path = index_path.as_ref().to_path_buf();
        let open_failed = |reason: String| IndexError::OpenFailed {
            path: index_path.display().to_string(),
            reason,
        };

        std::fs::create_dir_all(&index_path)
            .map_err(|e| open_failed(format!("failed to create index directory: {}", e)))?;

        let index = if index_path.join("meta.json").exists() {
            Index::open_in_dir(&index_path).map_err(|e| open_failed(e.to_string()))?
        } else {
            Index::create_in_dir(&index_path, build_schema())
                .map_err(|e| open_failed(e.to_string()))?
        };

        let fields = Fields::resolve(&index.schema())?;
        tracing::info!("Opened index at {}", index_path.display());

        Ok(Self {
            index,
            fields,
            writer_lock: Mutex::new(()),
        })
    }

    /// In-memory index, used by tests and benchmarks
    pub fn in_memory() -> Result<Self> {
        let index = Index::create_in_ram(build_schema());
        let fields = Fields::resolve(&index.schema())?;
        Ok(Self {
            index,
            fields,
            writer_lock: Mutex::new(()),
        })
    }

    fn reader(&self) -> Result<IndexReader> {
        self.index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()
            .context("Failed to create index reader")
    }

    fn id_query(&self, id: &str) -> TermQuery {
        TermQuery::new(
            Term::from_field_text(self.fields.id, id),
            IndexRecordOption::Basic,
        )
    }

    fn lookup(&self, searcher: &Searcher, id: &str) -> Result<Option<IndexDocument>> {
        let top_docs = searcher
            .search(&self.id_query(id), &TopDocs::with_limit(1))
            .context("Failed to look up document")?;

        match top_docs.first() {
            Some((_, address)) => {
                let doc: TantivyDocument = searcher
                    .doc(*address)
                    .context("Failed to retrieve document")?;
                Ok(Some(self.to_document(&doc)?))
            }
            None => Ok(None),
        }
    }

    fn to_tantivy(&self, document: &IndexDocument) -> TantivyDocument {
        let f = &self.fields;
        let key = &document.key;
        let mut doc = TantivyDocument::default();

        doc.add_text(f.id, key.id());
        doc.add_text(f.organization, &key.organization);
        doc.add_text(f.project, &key.project);
        doc.add_text(f.repository, &key.repository);
        doc.add_text(f.blob, &key.blob);
        doc.add_text(f.path, &key.path);
        doc.add_text(f.content, &document.content);
        doc.add_text(f.encoding, &document.encoding);
        doc.add_u64(f.size, document.size);
        doc.add_text(f.extension, &document.extension);
        for git_ref in &document.refs {
            doc.add_text(f.refs, git_ref);
        }
        for full_ref in document.full_refs() {
            doc.add_facet(f.full_refs, Facet::from_path([full_ref]));
        }
        if !document.extension.is_empty() {
            doc.add_facet(f.extension_facet, Facet::from_path([document.extension.as_str()]));
        }

        doc
    }

    fn to_document(&self, doc: &TantivyDocument) -> Result<IndexDocument> {
        let f = &self.fields;
        let text = |field: Field| {
            doc.get_first(field)
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
        };

        let id = text(f.id).unwrap_or_default();
        let required = |field: Field| text(field).ok_or_else(|| IndexError::CorruptDocument(id.clone()));

        let key = DocumentKey {
            organization: required(f.organization)?,
            project: required(f.project)?,
            repository: required(f.repository)?,
            blob: required(f.blob)?,
            path: required(f.path)?,
        };

        Ok(IndexDocument {
            key,
            content: text(f.content).unwrap_or_default(),
            encoding: text(f.encoding).unwrap_or_default(),
            size: doc.get_first(f.size).and_then(|v| v.as_u64()).unwrap_or(0),
            extension: text(f.extension).unwrap_or_default(),
            refs: doc
                .get_all(f.refs)
                .filter_map(|v| v.as_str())
                .map(|s| s.to_string())
                .collect(),
        })
    }

    fn term_disjunction(field: Field, values: &[String]) -> Box<dyn Query> {
        let shoulds: Vec<(Occur, Box<dyn Query>)> = values
            .iter()
            .map(|value| {
                let query: Box<dyn Query> = Box::new(TermQuery::new(
                    Term::from_field_text(field, value),
                    IndexRecordOption::Basic,
                ));
                (Occur::Should, query)
            })
            .collect();
        Box::new(BooleanQuery::new(shoulds))
    }

    fn build_query(&self, query: &SearchQuery) -> Result<Box<dyn Query>> {
        let text = query.query.trim();
        let main: Box<dyn Query> = if text.is_empty() {
            Box::new(AllQuery)
        } else {
            let mut parser =
                QueryParser::for_index(&self.index, vec![self.fields.content, self.fields.path]);
            parser.set_conjunction_by_default();
            parser.parse_query(text).map_err(|e| IndexError::InvalidQuery {
                query: text.to_string(),
                reason: e.to_string(),
            })?
        };

        let SearchFilters {
            extensions,
            organizations,
            projects,
            repositories,
            refs,
        } = &query.filters;
        let f = &self.fields;

        let mut clauses: Vec<(Occur, Box<dyn Query>)> = vec![(Occur::Must, main)];
        for (field, values) in [
            (f.extension, extensions),
            (f.organization, organizations),
            (f.project, projects),
            (f.repository, repositories),
            (f.refs, refs),
        ] {
            if !values.is_empty() {
                clauses.push((Occur::Must, Self::term_disjunction(field, values)));
            }
        }

        if clauses.len() == 1 {
            let (_, main) = clauses.remove(0);
            return Ok(main);
        }
        Ok(Box::new(BooleanQuery::new(clauses)))
    }

    fn facet_counts(counts: &FacetCounts) -> Vec<FacetCount> {
        let mut result: Vec<FacetCount> = counts
            .get("/")
            .map(|(facet, count)| FacetCount {
                value: facet.to_path().join("/"),
                count,
            })
            .collect();
        result.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.value.cmp(&b.value)));
        result
    }
}

/// Distinct lowercase highlighted words, in order of first appearance
fn highlighted_words(fragment: &str, ranges: &[std::ops::Range<usize>]) -> Vec<String> {
    let mut words: Vec<String> = Vec::new();
    for range in ranges {
        let Some(word) = fragment.get(range.clone()) else {
            continue;
        };
        let word = word.to_lowercase();
        if !word.is_empty() && !words.contains(&word) {
            words.push(word);
        }
    }
    words
}

impl ContentIndex for TantivyIndex {
    fn batch(&self, ops: Vec<IndexOperation>) -> Result<BatchStats> {
        let mut stats = BatchStats::default();
        if ops.is_empty() {
            return Ok(stats);
        }

        let _guard = self
            .writer_lock
            .lock()
            .map_err(|e| IndexError::LockPoisoned(e.to_string()))?;

        let searcher = self.reader()?.searcher();
        let mut overlay: HashMap<String, Option<IndexDocument>> = HashMap::new();
        let mut touched: BTreeSet<String> = BTreeSet::new();

        for op in &ops {
            let id = op.key().id();
            let state = match overlay.entry(id.clone()) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => {
                    let committed = self.lookup(&searcher, &id)?;
                    entry.insert(committed)
                }
            };

            match apply_operation(state.as_ref(), op) {
                DocumentChange::Unchanged => stats.unchanged += 1,
                DocumentChange::Put(doc) => {
                    *state = Some(doc);
                    touched.insert(id);
                }
                DocumentChange::Remove => {
                    *state = None;
                    touched.insert(id);
                }
            }
        }

        if touched.is_empty() {
            return Ok(stats);
        }

        let mut index_writer: IndexWriter<TantivyDocument> = self
            .index
            .writer(WRITER_MEMORY_BUDGET)
            .context("Failed to create index writer")?;

        for id in &touched {
            index_writer.delete_term(Term::from_field_text(self.fields.id, id));
            match overlay.get(id) {
                Some(Some(doc)) => {
                    index_writer
                        .add_document(self.to_tantivy(doc))
                        .map_err(|e| IndexError::WriteFailed(e.to_string()))?;
                    stats.written += 1;
                }
                _ => stats.removed += 1,
            }
        }

        index_writer
            .commit()
            .map_err(|e| IndexError::CommitFailed(e.to_string()))?;

        tracing::debug!(
            "Committed batch of {} operations: {} written, {} removed, {} unchanged",
            ops.len(),
            stats.written,
            stats.removed,
            stats.unchanged
        );
        Ok(stats)
    }

    fn delete_by_refs(
        &self,
        organization: &str,
        project: &str,
        repository: &str,
        refs: &BTreeSet<String>,
    ) -> Result<BatchStats> {
        if refs.is_empty() {
            return Ok(BatchStats::default());
        }

        let f = &self.fields;
        let exact = |field: Field, value: &str| -> Box<dyn Query> {
            Box::new(TermQuery::new(
                Term::from_field_text(field, value),
                IndexRecordOption::Basic,
            ))
        };
        let ref_list: Vec<String> = refs.iter().cloned().collect();
        let query = BooleanQuery::new(vec![
            (Occur::Must, exact(f.organization, organization)),
            (Occur::Must, exact(f.project, project)),
            (Occur::Must, exact(f.repository, repository)),
            (Occur::Must, Self::term_disjunction(f.refs, &ref_list)),
        ]);

        let searcher = self.reader()?.searcher();
        let addresses = searcher
            .search(&query, &DocSetCollector)
            .context("Failed to find documents by refs")?;

        let mut ops = Vec::with_capacity(addresses.len());
        for address in addresses {
            let doc: TantivyDocument = searcher
                .doc(address)
                .context("Failed to retrieve document")?;
            let document = self.to_document(&doc)?;
            ops.push(IndexOperation::Delete {
                key: document.key,
                refs: refs.clone(),
            });
        }

        tracing::info!(
            "Removing refs {:?} from {} documents of {}/{}/{}",
            refs,
            ops.len(),
            organization,
            project,
            repository
        );
        self.batch(ops)
    }

    fn get(&self, key: &DocumentKey) -> Result<Option<IndexDocument>> {
        let searcher = self.reader()?.searcher();
        self.lookup(&searcher, &key.id())
    }

    fn search(&self, query: &SearchQuery) -> Result<SearchHits> {
        let page_size = query.page_size.max(1);
        let tantivy_query = self.build_query(query)?;
        let searcher = self.reader()?.searcher();

        let mut extension_facets = FacetCollector::for_field(EXTENSION_FACET);
        extension_facets.add_facet("/");
        let mut ref_facets = FacetCollector::for_field(FULL_REFS_FACET);
        ref_facets.add_facet("/");

        let collector = (
            Count,
            TopDocs::with_limit(page_size).and_offset(query.page * page_size),
            extension_facets,
            ref_facets,
        );
        let (total, top_docs, extension_counts, ref_counts) = searcher
            .search(&*tantivy_query, &collector)
            .map_err(|e| IndexError::SearchFailed(e.to_string()))?;

        let mut snippets =
            SnippetGenerator::create(&searcher, &*tantivy_query, self.fields.content)
                .map_err(|e| IndexError::SearchFailed(e.to_string()))?;
        snippets.set_max_num_chars(SNIPPET_MAX_CHARS);

        let mut hits = Vec::with_capacity(top_docs.len());
        for (score, address) in top_docs {
            let doc: TantivyDocument = searcher
                .doc(address)
                .context("Failed to retrieve document")?;
            let snippet = snippets.snippet_from_doc(&doc);
            let mut highlights = highlighted_words(snippet.fragment(), snippet.highlighted());
            if highlights.is_empty() {
                highlights = snippets.terms_text().keys().cloned().collect();
            }
            hits.push(SearchHit {
                document: self.to_document(&doc)?,
                score,
                highlights,
            });
        }

        Ok(SearchHits {
            total,
            page: query.page,
            page_size,
            hits,
            extension_facets: Self::facet_counts(&extension_counts),
            ref_facets: Self::facet_counts(&ref_counts),
        })
    }

    fn stats(&self) -> Result<IndexStats> {
        let searcher = self.reader()?.searcher();
        Ok(IndexStats {
            total_documents: searcher.num_docs(),
        })
    }
}
