//! Sync state store tests

use pisync::filesys::file::File;
use pisync::sync::state::{JsonStateStore, LocalSyncState, SyncStateStore};

const H1: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";
const H2: &str = "a948904f2f0f479b8f8197694b30184b0d2ed1c1cd2a1ec0fb85d299a192a447";

#[tokio::test]
async fn test_missing_state_loads_empty() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonStateStore::new(File::new(dir.path().join("state.json")));

    let state = store.load().await.unwrap();
    assert!(state.is_empty());
    assert!(!store.file().path().exists());
}

#[tokio::test]
async fn test_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");

    let mut state = LocalSyncState::new();
    state.record("model.bin", H1);
    state.record("install.sh", H2);
    JsonStateStore::new(File::new(&path))
        .save(&state)
        .await
        .unwrap();

    // a fresh store, as after a process restart
    let loaded = JsonStateStore::new(File::new(&path)).load().await.unwrap();
    assert_eq!(loaded, state);
    assert_eq!(loaded.version("model.bin"), Some(H1));
    assert_eq!(loaded.version("missing.bin"), None);
}

#[tokio::test]
async fn test_unchanged_state_is_byte_stable() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonStateStore::new(File::new(dir.path().join("state.json")));

    let mut state = LocalSyncState::new();
    state.record("b.bin", H2);
    state.record("a.bin", H1);
    store.save(&state).await.unwrap();
    let first = std::fs::read(store.file().path()).unwrap();

    let reloaded = store.load().await.unwrap();
    store.save(&reloaded).await.unwrap();
    let second = std::fs::read(store.file().path()).unwrap();

    assert_eq!(first, second);
}

#[tokio::test]
async fn test_forget_removes_entry() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonStateStore::new(File::new(dir.path().join("state.json")));

    let mut state = LocalSyncState::new();
    state.record("a.bin", H1);
    state.record("old.bin", H2);
    assert_eq!(state.forget("old.bin"), Some(H2.to_string()));
    store.save(&state).await.unwrap();

    let loaded = store.load().await.unwrap();
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded.iter().collect::<Vec<_>>(), vec![("a.bin", H1)]);
}
