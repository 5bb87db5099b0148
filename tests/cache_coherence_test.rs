//! Cross-replica cache behavior: shared state reads, invalidation fan-out.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use common::{FakeFactory, noop_chunk, session_req, stream_req, test_config};
use unichat::cache::MemoryBus;
use unichat::files::FileLoader;
use unichat::store::{MemoryStore, Store};
use unichat::worker::{Manager, WorkerError};

fn node(
    store: Arc<MemoryStore>,
    bus: Arc<MemoryBus>,
    base_dir: &std::path::Path,
) -> Arc<Manager> {
    Manager::with_cache(
        store,
        FakeFactory::new("shared title"),
        FileLoader::new(base_dir),
        test_config(1, 2, 10),
        bus,
    )
}

/// A sibling node can prime a session from the distributed cache without
/// touching its own (empty) store.
#[tokio::test]
async fn sibling_node_inits_from_distributed_cache() {
    let dir = TempDir::new().unwrap();
    let bus = Arc::new(MemoryBus::new());

    let store_a = Arc::new(MemoryStore::new());
    let node_a = node(store_a.clone(), bus.clone(), dir.path());
    let session = node_a.init_session(session_req(1, 0, "fast")).await.unwrap();

    // Node B shares only the bus, not the store.
    let store_b = Arc::new(MemoryStore::new());
    let node_b = node(store_b, bus, dir.path());
    let found = node_b
        .init_session(session_req(1, session.id, "fast"))
        .await
        .unwrap();
    assert_eq!(found.id, session.id);
    assert_eq!(found.title, session.title);

    node_a.shutdown();
    node_b.shutdown();
}

/// `reset_user` on one node invalidates the session on every replica.
#[tokio::test]
async fn reset_user_fans_out_to_siblings() {
    let dir = TempDir::new().unwrap();
    let bus = Arc::new(MemoryBus::new());

    let store_a = Arc::new(MemoryStore::new());
    let node_a = node(store_a, bus.clone(), dir.path());
    let session = node_a.init_session(session_req(1, 0, "fast")).await.unwrap();

    let store_b = Arc::new(MemoryStore::new());
    let node_b = node(store_b, bus, dir.path());
    node_b
        .init_session(session_req(1, session.id, "fast"))
        .await
        .unwrap();

    node_a.reset_user(1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // B's local copy is gone and the distributed entry was deleted; with an
    // empty local store nothing is left to resume.
    let err = node_b
        .init_session(session_req(1, session.id, "fast"))
        .await
        .unwrap_err();
    assert!(matches!(err, WorkerError::NotFound(_)));

    node_a.shutdown();
    node_b.shutdown();
}

/// After `invalidate_temp_files` on node A, a stream served by node B sees
/// the latest attachment list from persistence.
#[tokio::test]
async fn file_invalidation_keeps_attachments_fresh() {
    let dir = TempDir::new().unwrap();
    let content = "shared attachment body".to_string();
    tokio::fs::write(dir.path().join("doc.txt"), &content).await.unwrap();

    let bus = Arc::new(MemoryBus::new());
    let store = Arc::new(MemoryStore::new());
    let node_a = node(store.clone(), bus.clone(), dir.path());
    let node_b = node(store.clone(), bus, dir.path());

    let session = node_a.init_session(session_req(1, 0, "fast")).await.unwrap();

    // B serves a first turn so its caches are warm.
    node_b
        .init_session(session_req(1, session.id, "fast"))
        .await
        .unwrap();
    node_b
        .stream(stream_req(1, session.id, "fast", "warm-up", noop_chunk()))
        .await
        .unwrap();

    // A new upload lands (recorded by the HTTP layer on node A) and A
    // broadcasts the invalidation.
    let file_id = store
        .record_temp_file(
            1,
            session.id,
            "doc.txt",
            "doc.txt",
            "text/plain",
            content.len() as i64,
            chrono::Utc::now() + chrono::Duration::hours(1),
        )
        .await
        .unwrap();
    node_a.invalidate_temp_files(1, session.id).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // B's next turn references the new file and succeeds.
    let mut req = stream_req(1, session.id, "fast", "use the doc", noop_chunk());
    req.file_ids = vec![file_id];
    node_b.stream(req).await.unwrap();

    let files = store.list_session_temp_files(1, session.id).await.unwrap();
    assert!(!files[0].summary.is_empty());

    node_a.shutdown();
    node_b.shutdown();
}

/// A title generated on one node reaches a sibling through the cache bus.
#[tokio::test]
async fn title_update_propagates_to_siblings() {
    let dir = TempDir::new().unwrap();
    let bus = Arc::new(MemoryBus::new());
    let store = Arc::new(MemoryStore::new());

    let node_a = node(store.clone(), bus.clone(), dir.path());
    let node_b = node(store, bus, dir.path());

    let session = node_a.init_session(session_req(1, 0, "fast")).await.unwrap();
    node_b
        .init_session(session_req(1, session.id, "fast"))
        .await
        .unwrap();

    // First turn on A generates and persists the title, invalidating B.
    node_a
        .stream(stream_req(1, session.id, "fast", "hello", noop_chunk()))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let refreshed = node_b
        .init_session(session_req(1, session.id, "fast"))
        .await
        .unwrap();
    assert_eq!(refreshed.title, "shared title");

    node_a.shutdown();
    node_b.shutdown();
}
