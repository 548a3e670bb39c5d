/// Benchmarks for blob classification, index batches and search
use blobdex::classifier::ContentClassifier;
use blobdex::classifier::sniff::detect_content_type;
use blobdex::git::RepoLocator;
use blobdex::index::{
    ContentIndex, DocumentKey, IndexDocument, IndexOperation, SearchQuery, TantivyIndex,
    extension_of,
};
use blobdex::search::SearchService;
use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use std::collections::BTreeSet;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::runtime::Runtime;

fn source_file(i: usize) -> String {
    format!(
        r#"/// Module {i}
pub mod module_{i} {{
    pub fn function_{i}(x: i32) -> i32 {{
        x * {i}
    }}

    pub fn authenticate_{i}(token: &str) -> bool {{
        !token.is_empty()
    }}
}}
"#
    )
}

fn documents(count: usize) -> Vec<IndexOperation> {
    (0..count)
        .map(|i| {
            let path = format!("src/module_{}.rs", i);
            let content = source_file(i);
            IndexOperation::Add(IndexDocument {
                key: DocumentKey::new("acme", "webapp", "origin", format!("blob{}", i), &path),
                size: content.len() as u64,
                content,
                encoding: "utf-8".to_string(),
                extension: extension_of(&path),
                refs: BTreeSet::from(["master".to_string(), "develop".to_string()]),
            })
        })
        .collect()
}

fn benchmark_classify(c: &mut Criterion) {
    let classifier = ContentClassifier::default();
    let mut group = c.benchmark_group("classify");

    let utf8 = source_file(1).repeat(50).into_bytes();
    let (shift_jis, _, _) = encoding_rs::SHIFT_JIS.encode(&"日本語のテキスト\n".repeat(200));
    let binary: Vec<u8> = (0..8192u32).map(|i| (i % 256) as u8).collect();

    for (name, bytes) in [
        ("utf8", utf8.as_slice()),
        ("shift_jis", shift_jis.as_ref()),
        ("binary", binary.as_slice()),
    ] {
        group.bench_with_input(BenchmarkId::from_parameter(name), bytes, |b, bytes| {
            b.iter(|| {
                let mime = detect_content_type(black_box(bytes));
                classifier.classify(mime, bytes, bytes.len() as u64, 1_048_576)
            });
        });
    }

    group.finish();
}

fn benchmark_index_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("index_batch");

    for count in [10, 100, 500].iter() {
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{}_documents", count)),
            count,
            |b, &count| {
                b.iter(|| {
                    let index = TantivyIndex::in_memory().unwrap();
                    index.batch(black_box(documents(count))).unwrap()
                });
            },
        );
    }

    group.finish();
}

fn benchmark_search(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let temp_dir = TempDir::new().unwrap();
    let index = Arc::new(TantivyIndex::in_memory().unwrap());
    index.batch(documents(500)).unwrap();

    let search = SearchService::new(
        index,
        RepoLocator::new(temp_dir.path()),
        Arc::new(ContentClassifier::default()),
        Default::default(),
    );

    c.bench_function("search_with_previews", |b| {
        b.iter(|| {
            rt.block_on(async {
                search
                    .search(black_box(SearchQuery::new("authenticate token")))
                    .await
                    .unwrap()
            })
        });
    });
}

criterion_group!(benches, benchmark_classify, benchmark_index_batch, benchmark_search);
criterion_main!(benches);
