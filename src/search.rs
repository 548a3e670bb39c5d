//! Search over the index with line previews read from the mirrors

use crate::classifier::ContentClassifier;
use crate::config::SearchConfig;
use crate::git::{GitRepo, RepoLocator};
use crate::index::{ContentIndex, FacetCount, IndexDocument, SearchQuery};
use crate::preview::{TextPreview, preview_terms};
use anyhow::{Context, Result};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

/// One matching file with its previews
#[derive(Debug, Clone, Serialize)]
pub struct SearchResultHit {
    pub organization: String,
    pub project: String,
    pub repository: String,
    pub blob: String,
    pub path: String,
    pub extension: String,
    pub refs: Vec<String>,
    pub score: f32,
    pub previews: Vec<TextPreview>,
}

/// One page of search results
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
    pub hits: Vec<SearchResultHit>,
    pub extension_facets: Vec<FacetCount>,
    pub ref_facets: Vec<FacetCount>,
    pub duration_ms: u64,
}

/// Runs queries and decorates hits with previews
#[derive(Clone)]
pub struct SearchService {
    index: Arc<dyn ContentIndex>,
    locator: RepoLocator,
    classifier: Arc<ContentClassifier>,
    config: SearchConfig,
}

impl SearchService {
    pub fn new(
        index: Arc<dyn ContentIndex>,
        locator: RepoLocator,
        classifier: Arc<ContentClassifier>,
        config: SearchConfig,
    ) -> Self {
        Self {
            index,
            locator,
            classifier,
            config,
        }
    }

    /// Run `query`; a zero page size falls back to the configured one
    pub async fn search(&self, mut query: SearchQuery) -> Result<SearchResult> {
        let start = Instant::now();
        if query.page_size == 0 {
            query.page_size = self.config.page_size;
        }

        tracing::info!(
            "Search: query='{}', page={}, page_size={}",
            query.query,
            query.page,
            query.page_size
        );

        let service = self.clone();
        let result = tokio::task::spawn_blocking(move || service.search_blocking(&query))
            .await
            .context("Search task failed")??;

        let duration_ms = start.elapsed().as_millis() as u64;
        tracing::info!(
            "Search returned {} of {} hits in {}ms",
            result.hits.len(),
            result.total,
            duration_ms
        );
        Ok(SearchResult {
            duration_ms,
            ..result
        })
    }

    fn search_blocking(&self, query: &SearchQuery) -> Result<SearchResult> {
        let found = self.index.search(query)?;

        let hits = found
            .hits
            .into_iter()
            .map(|hit| {
                let text = self.current_text(&hit.document);
                let previews = preview_terms(
                    &text,
                    &hit.highlights,
                    self.config.preview_before,
                    self.config.preview_after,
                );
                let key = hit.document.key;
                SearchResultHit {
                    organization: key.organization,
                    project: key.project,
                    repository: key.repository,
                    blob: key.blob,
                    path: key.path,
                    extension: hit.document.extension,
                    refs: hit.document.refs.into_iter().collect(),
                    score: hit.score,
                    previews,
                }
            })
            .collect();

        Ok(SearchResult {
            total: found.total,
            page: found.page,
            page_size: found.page_size,
            hits,
            extension_facets: found.extension_facets,
            ref_facets: found.ref_facets,
            duration_ms: 0,
        })
    }

    /// Blob text from the mirror, or the stored copy when the mirror or
    /// blob is gone
    fn current_text(&self, document: &IndexDocument) -> String {
        let key = &document.key;
        let path = self
            .locator
            .path(&key.organization, &key.project, &key.repository);

        let bytes = GitRepo::open(&path).and_then(|repo| repo.blob_bytes(&key.blob));
        match bytes {
            Ok(bytes) => self.classifier.decode(&bytes).0,
            Err(e) => {
                tracing::debug!(
                    "Using stored content for {}: {}",
                    key,
                    e
                );
                document.content.clone()
            }
        }
    }
}
