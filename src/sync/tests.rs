use super::*;
use crate::index::{DocumentKey, IndexDocument, IndexOperation, extension_of};
use crate::test_support::{FailingIndex, FixtureRepo, blob_id};
use tempfile::TempDir;

struct Harness {
    _temp_dir: TempDir,
    fixture: FixtureRepo,
    service: SyncService,
    index: Arc<TantivyIndex>,
}

fn test_config(temp_dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.storage.data_dir = temp_dir.path().to_path_buf();
    config.git.skip_fetch = true;
    config.indexing.workers = 2;
    config
}

async fn harness() -> Harness {
    let temp_dir = TempDir::new().unwrap();
    let config = test_config(&temp_dir);
    let fixture = FixtureRepo::init(&crate::paths::PlatformPaths::repository_path(
        temp_dir.path(),
        "acme",
        "webapp",
        "origin",
    ));

    let settings = SettingsStore::open(temp_dir.path(), config.indexing.size_limit).unwrap();
    settings
        .add_repository("acme", "webapp", "https://git.example.com/acme/origin.git")
        .await
        .unwrap();

    let index = Arc::new(TantivyIndex::in_memory().unwrap());
    let service = SyncService::new(Arc::new(config), Arc::new(settings), index.clone()).unwrap();

    Harness {
        _temp_dir: temp_dir,
        fixture,
        service,
        index,
    }
}

fn key(blob: &str, path: &str) -> DocumentKey {
    DocumentKey::new("acme", "webapp", "origin", blob, path)
}

fn refs(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|n| n.to_string()).collect()
}

#[tokio::test]
async fn test_first_sync_indexes_and_records_state() {
    let h = harness().await;
    let c1 = h.fixture.commit(&[("README.md", b"# webapp\n")], None);
    h.fixture.set_branch("master", &c1);
    h.fixture.lightweight_tag("v1.0", &c1);

    let report = h.service.sync_one("acme", "webapp", "origin").await.unwrap();

    assert_eq!(report.status, SyncStatus::Completed);
    assert_eq!(report.created, 2);
    assert_eq!(report.completed_refs, refs(&["master", "v1.0"]));
    let readme = h.index.get(&key(&blob_id(b"# webapp\n"), "README.md")).unwrap().unwrap();
    assert_eq!(readme.refs, refs(&["master", "v1.0"]));

    let state = h.service.states().get("acme", "webapp", "origin").unwrap();
    assert_eq!(state.branches["master"], c1);
    assert_eq!(state.tags["v1.0"], c1);
    assert!(state.dirty.is_empty());
}

#[tokio::test]
async fn test_resync_without_changes_is_up_to_date() {
    let h = harness().await;
    let c1 = h.fixture.commit(&[("a.txt", b"a\n")], None);
    h.fixture.set_branch("master", &c1);

    h.service.sync_one("acme", "webapp", "origin").await.unwrap();
    let report = h.service.sync_one("acme", "webapp", "origin").await.unwrap();

    assert_eq!(report.status, SyncStatus::UpToDate);
    assert_eq!(report.adds, 0);
    assert_eq!(h.index.stats().unwrap().total_documents, 1);
}

#[tokio::test]
async fn test_deleted_branch_is_retired() {
    let h = harness().await;
    let c1 = h.fixture.commit(&[("shared.txt", b"shared\n")], None);
    let c2 = h
        .fixture
        .commit(&[("shared.txt", b"shared\n"), ("feature.txt", b"feature\n")], Some(&c1));
    h.fixture.set_branch("master", &c1);
    h.fixture.set_branch("feature", &c2);
    h.service.sync_one("acme", "webapp", "origin").await.unwrap();

    h.fixture.delete_branch("feature");
    let report = h.service.sync_one("acme", "webapp", "origin").await.unwrap();

    assert_eq!(report.removed, 1);
    assert!(h.index.get(&key(&blob_id(b"feature\n"), "feature.txt")).unwrap().is_none());
    assert_eq!(
        h.index
            .get(&key(&blob_id(b"shared\n"), "shared.txt"))
            .unwrap()
            .unwrap()
            .refs,
        refs(&["master"])
    );
    let state = h.service.states().get("acme", "webapp", "origin").unwrap();
    assert!(!state.branches.contains_key("feature"));
}

#[tokio::test]
async fn test_dirty_ref_is_rebuilt_from_scratch() {
    let h = harness().await;
    let c1 = h.fixture.commit(&[("a.txt", b"a\n")], None);
    h.fixture.set_branch("master", &c1);

    // an interrupted sync left a stray document and a dirty flag behind
    h.index
        .batch(vec![IndexOperation::Add(IndexDocument {
            key: key("deadbeef", "stale.txt"),
            content: "stale".to_string(),
            encoding: "utf-8".to_string(),
            size: 5,
            extension: extension_of("stale.txt"),
            refs: refs(&["master"]),
        })])
        .unwrap();
    let mut state = h.service.states().get("acme", "webapp", "origin").unwrap();
    state.set_ref(RefKind::Branch, "master", &c1);
    state.mark_dirty(&refs(&["master"]));
    h.service.states().put(&mut state).unwrap();

    let report = h.service.sync_one("acme", "webapp", "origin").await.unwrap();

    assert_eq!(report.retired_dirty, 1);
    assert_eq!(report.created, 1);
    assert!(h.index.get(&key("deadbeef", "stale.txt")).unwrap().is_none());
    assert!(h.index.get(&key(&blob_id(b"a\n"), "a.txt")).unwrap().is_some());
    let state = h.service.states().get("acme", "webapp", "origin").unwrap();
    assert!(state.dirty.is_empty());
    assert_eq!(state.branches["master"], c1);
}

#[tokio::test]
async fn test_failed_ref_stays_dirty_and_does_not_advance() {
    let temp_dir = TempDir::new().unwrap();
    let config = test_config(&temp_dir);
    let fixture = FixtureRepo::init(&crate::paths::PlatformPaths::repository_path(
        temp_dir.path(),
        "acme",
        "webapp",
        "origin",
    ));
    let c1 = fixture.commit(&[("a.txt", b"a\n")], None);
    fixture.set_branch("master", &c1);

    let settings = SettingsStore::open(temp_dir.path(), config.indexing.size_limit).unwrap();
    let target = settings
        .add_repository("acme", "webapp", "https://git.example.com/acme/origin.git")
        .await
        .unwrap();
    let service =
        SyncService::new(Arc::new(config), Arc::new(settings), Arc::new(FailingIndex)).unwrap();

    let report = service.sync_repository(&target).await.unwrap();

    assert!(report.failed_refs.contains_key("master"));
    let state = service.states().get("acme", "webapp", "origin").unwrap();
    assert!(state.branches.is_empty());
    assert_eq!(state.dirty, refs(&["master"]));
}

#[tokio::test]
async fn test_ref_filters_limit_indexed_refs() {
    let h = harness().await;
    let c1 = h.fixture.commit(&[("a.txt", b"a\n")], None);
    h.fixture.set_branch("master", &c1);
    h.fixture.set_branch("wip/spike", &c1);

    let mut target = h
        .service
        .settings()
        .find_repository("acme", "webapp", "origin")
        .await
        .unwrap();
    target.filters.exclude_branches = Some(regex::Regex::new("^wip/").unwrap());

    let report = h.service.sync_repository(&target).await.unwrap();
    assert_eq!(report.completed_refs, refs(&["master"]));
}

#[tokio::test]
async fn test_concurrent_sync_of_same_repository_is_skipped() {
    let h = harness().await;
    let target = h
        .service
        .settings()
        .find_repository("acme", "webapp", "origin")
        .await
        .unwrap();

    let _held = InProgressGuard::try_acquire(&h.service.running, &target.to_string()).unwrap();
    let report = h.service.sync_repository(&target).await.unwrap();
    assert_eq!(report.status, SyncStatus::AlreadyRunning);
}

#[tokio::test]
async fn test_sync_all_continues_past_a_broken_repository() {
    let h = harness().await;
    let c1 = h.fixture.commit(&[("a.txt", b"a\n")], None);
    h.fixture.set_branch("master", &c1);
    // registered but never mirrored
    h.service
        .settings()
        .add_repository("acme", "webapp", "https://git.example.com/acme/missing.git")
        .await
        .unwrap();

    let results = h.service.sync_all().await;
    assert_eq!(results.len(), 2);

    let by_name: BTreeMap<String, bool> = results
        .into_iter()
        .map(|(name, result)| (name, result.is_ok()))
        .collect();
    assert!(by_name["acme:webapp/origin"]);
    assert!(!by_name["acme:webapp/missing"]);
}

#[tokio::test]
async fn test_sync_unknown_repository() {
    let h = harness().await;
    let err = h.service.sync_one("acme", "webapp", "nope").await.unwrap_err();
    assert!(matches!(err, BlobdexError::Settings(SettingsError::NotFound(_))));
}
