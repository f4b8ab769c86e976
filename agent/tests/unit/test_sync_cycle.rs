//! End-to-end sync cycle tests against a mock update server

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::StreamExt;
use httpmock::prelude::*;
use httpmock::Mock;
use tokio::sync::{mpsc, Notify, RwLock};

use pisync::app::options::AppOptions;
use pisync::app::state::AppState;
use pisync::authn::credential::{Credential, CredentialStore};
use pisync::authn::identity::DeviceIdentity;
use pisync::errors::{exit_code, ErrorKind, SyncError};
use pisync::filesys::file::File;
use pisync::http::client::{DownloadBody, HttpClient, HttpOptions};
use pisync::http::manifest::ManifestSource;
use pisync::models::manifest::{Manifest, ManifestEntry};
use pisync::storage::layout::StorageLayout;
use pisync::storage::settings::Settings;
use pisync::sync::download::{DownloadJob, Downloader};
use pisync::sync::fsm::{SchedulerEvent, SchedulerFsm, SchedulerState};
use pisync::sync::state::{JsonStateStore, LocalSyncState, SyncStateStore};
use pisync::sync::syncer::{SyncOptions, Syncer};
use pisync::utils::CooldownOptions;
use pisync::workers::scheduler::{self, CheckRequest, SchedulerStatus};

const DEVICE: &str = "rpi-42";
const BODY: &str = "hello world";
const BODY_HASH: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

type BoxedSleep = Pin<Box<dyn Future<Output = ()> + Send>>;

struct Harness {
    server: MockServer,
    dir: tempfile::TempDir,
    client: Arc<HttpClient>,
    store: Arc<JsonStateStore>,
}

impl Harness {
    fn new() -> Self {
        let server = MockServer::start();
        let dir = tempfile::tempdir().unwrap();
        let client = HttpClient::new(
            &server.base_url(),
            DeviceIdentity::new(DEVICE).unwrap(),
            Credential::new("device-secret").unwrap(),
            HttpOptions::default(),
        )
        .unwrap();
        let store = JsonStateStore::new(File::new(dir.path().join("state.json")));
        Self {
            server,
            dir,
            client: Arc::new(client),
            store: Arc::new(store),
        }
    }

    fn download_dir(&self) -> std::path::PathBuf {
        self.dir.path().join("files")
    }

    fn state_path(&self) -> &Path {
        self.store.file().path()
    }

    fn syncer(&self) -> Syncer {
        Syncer::new(
            DeviceIdentity::new(DEVICE).unwrap(),
            self.client.clone(),
            self.store.clone(),
            SyncOptions::new(self.download_dir()),
        )
    }

    fn mock_manifest(&self) -> Mock<'_> {
        self.server.mock(|when, then| {
            when.method(GET)
                .path("/manifest")
                .query_param("device_id", DEVICE);
            then.status(200).json_body(serde_json::json!([
                {"file_name": "a.bin", "hash": BODY_HASH, "size": 11, "uri": "/files/a.bin"}
            ]));
        })
    }

    fn mock_file(&self, body: &str) -> Mock<'_> {
        let body = body.to_string();
        self.server.mock(move |when, then| {
            when.method(GET).path("/files/a.bin");
            then.status(200).body(body);
        })
    }

    fn part_files(&self) -> Vec<String> {
        match std::fs::read_dir(self.download_dir()) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().to_string())
                .filter(|name| name.ends_with(".part"))
                .collect(),
            Err(_) => Vec::new(),
        }
    }
}

fn cooldown() -> CooldownOptions {
    CooldownOptions {
        base_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(3),
        multiplier: 2.0,
    }
}

fn status() -> scheduler::StatusHandle {
    Arc::new(RwLock::new(SchedulerStatus::new(DEVICE)))
}

#[tokio::test]
async fn test_first_cycle_downloads_and_records() {
    let harness = Harness::new();
    let manifest = harness.mock_manifest();
    let file = harness.mock_file(BODY);

    let mut syncer = harness.syncer();
    let mut fsm = SchedulerFsm::new(cooldown());
    let mut state = LocalSyncState::new();

    let report = syncer
        .run_cycle(&mut fsm, SchedulerEvent::TimerFired, &mut state, None)
        .await
        .unwrap();

    manifest.assert();
    file.assert();
    assert_eq!(report.applied.len(), 1);
    assert!(report.is_clean());
    assert_eq!(fsm.state(), SchedulerState::Idle);
    assert_eq!(state.version("a.bin"), Some(BODY_HASH));
    assert_eq!(
        std::fs::read_to_string(harness.download_dir().join("a.bin")).unwrap(),
        BODY
    );

    let persisted: serde_json::Value =
        serde_json::from_slice(&std::fs::read(harness.state_path()).unwrap()).unwrap();
    assert_eq!(persisted, serde_json::json!({ "a.bin": BODY_HASH }));
    assert!(harness.part_files().is_empty());
}

#[tokio::test]
async fn test_second_cycle_is_a_no_op() {
    let harness = Harness::new();
    let manifest = harness.mock_manifest();
    let file = harness.mock_file(BODY);

    let mut syncer = harness.syncer();
    let mut fsm = SchedulerFsm::new(cooldown());
    let mut state = LocalSyncState::new();
    syncer
        .run_cycle(&mut fsm, SchedulerEvent::TimerFired, &mut state, None)
        .await
        .unwrap();
    let persisted = std::fs::read(harness.state_path()).unwrap();

    // reload as a restarted agent would
    let mut state = harness.store.load().await.unwrap();
    let report = syncer
        .run_cycle(&mut fsm, SchedulerEvent::TimerFired, &mut state, None)
        .await
        .unwrap();

    assert_eq!(report.downloads(), 0);
    assert_eq!(report.unchanged, 1);
    assert_eq!(manifest.hits(), 2);
    assert_eq!(file.hits(), 1);
    assert_eq!(std::fs::read(harness.state_path()).unwrap(), persisted);
}

#[tokio::test]
async fn test_integrity_mismatch_keeps_old_file_and_retries() {
    let harness = Harness::new();
    harness.mock_manifest();
    let mut corrupt = harness.mock_file("hello worle");

    std::fs::create_dir_all(harness.download_dir()).unwrap();
    std::fs::write(harness.download_dir().join("a.bin"), "old contents").unwrap();

    let mut syncer = harness.syncer();
    let mut fsm = SchedulerFsm::new(cooldown());
    let mut state = LocalSyncState::new();

    let report = syncer
        .run_cycle(&mut fsm, SchedulerEvent::TimerFired, &mut state, None)
        .await
        .unwrap();

    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].kind, ErrorKind::IntegrityMismatch);
    assert_eq!(report.failed[0].attempts, 1);
    assert!(!report.is_clean());
    // per-file failures do not fail the cycle
    assert_eq!(fsm.state(), SchedulerState::Idle);
    assert!(state.is_empty());
    assert!(!harness.state_path().exists());
    assert!(harness.part_files().is_empty());
    assert_eq!(
        std::fs::read_to_string(harness.download_dir().join("a.bin")).unwrap(),
        "old contents"
    );

    corrupt.delete();
    let fixed = harness.mock_file(BODY);

    let report = syncer
        .run_cycle(&mut fsm, SchedulerEvent::TimerFired, &mut state, None)
        .await
        .unwrap();
    fixed.assert();
    assert_eq!(report.applied.len(), 1);
    assert_eq!(state.version("a.bin"), Some(BODY_HASH));
    assert_eq!(
        std::fs::read_to_string(harness.download_dir().join("a.bin")).unwrap(),
        BODY
    );
}

#[tokio::test]
async fn test_check_single_file() {
    let harness = Harness::new();
    harness.mock_manifest();
    let file = harness.mock_file(BODY);

    let mut syncer = harness.syncer();
    let mut fsm = SchedulerFsm::new(cooldown());
    let mut state = LocalSyncState::new();

    let err = syncer
        .run_cycle(
            &mut fsm,
            SchedulerEvent::CheckRequested,
            &mut state,
            Some("missing.bin"),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Client);
    // an unknown name is the caller's mistake, not a failed check
    assert_eq!(fsm.state(), SchedulerState::Idle);
    assert_eq!(fsm.err_streak(), 0);
    assert_eq!(file.hits(), 0);
    assert!(state.is_empty());

    let report = syncer
        .run_cycle(
            &mut fsm,
            SchedulerEvent::CheckRequested,
            &mut state,
            Some("a.bin"),
        )
        .await
        .unwrap();
    assert_eq!(report.applied.len(), 1);
    assert_eq!(fsm.err_streak(), 0);
}

#[tokio::test]
async fn test_rejected_credential_halts_worker() {
    let harness = Harness::new();
    let manifest = harness.server.mock(|when, then| {
        when.method(GET).path("/manifest");
        then.status(401).body("Invalid signature");
    });

    let mut syncer = harness.syncer();
    let mut fsm = SchedulerFsm::new(cooldown());
    let (_check_tx, check_rx) = mpsc::channel(1);
    let sleeps = Arc::new(Mutex::new(Vec::new()));
    let recorded = sleeps.clone();

    let options = scheduler::Options {
        interval: Duration::from_secs(3600),
        initial_delay: Duration::from_secs(5),
    };
    let status = status();
    let result = scheduler::run(
        &options,
        &mut syncer,
        &mut fsm,
        LocalSyncState::new(),
        status.clone(),
        check_rx,
        move |wait| {
            recorded.lock().unwrap().push(wait);
            std::future::ready(())
        },
        Box::pin(std::future::pending::<()>()),
    )
    .await;

    let err = result.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Auth);
    assert_eq!(err.exit_code(), exit_code::AUTH);
    assert!(fsm.is_halted());
    assert_eq!(*sleeps.lock().unwrap(), vec![Duration::from_secs(5)]);
    assert_eq!(manifest.hits(), 1);
    assert_eq!(status.read().await.state, SchedulerState::Halted);
}

#[tokio::test]
async fn test_transient_failures_back_off_exponentially() {
    let harness = Harness::new();
    let manifest = harness.server.mock(|when, then| {
        when.method(GET).path("/manifest");
        then.status(503);
    });

    let mut syncer = harness.syncer();
    let mut fsm = SchedulerFsm::new(cooldown());
    let (_check_tx, check_rx) = mpsc::channel(1);
    let sleeps = Arc::new(Mutex::new(Vec::new()));
    let recorded = sleeps.clone();
    let shutdown = Arc::new(Notify::new());
    let trigger = shutdown.clone();

    let sleep_fn = move |wait: Duration| -> BoxedSleep {
        let mut sleeps = recorded.lock().unwrap();
        if sleeps.len() == 5 {
            trigger.notify_one();
            return Box::pin(std::future::pending::<()>());
        }
        sleeps.push(wait);
        Box::pin(std::future::ready(()))
    };

    let options = scheduler::Options {
        interval: Duration::from_secs(3600),
        initial_delay: Duration::from_millis(10),
    };
    let status = status();
    let state = scheduler::run(
        &options,
        &mut syncer,
        &mut fsm,
        LocalSyncState::new(),
        status.clone(),
        check_rx,
        sleep_fn,
        Box::pin(async move { shutdown.notified().await }),
    )
    .await
    .unwrap();

    assert!(state.is_empty());
    assert_eq!(
        *sleeps.lock().unwrap(),
        vec![
            Duration::from_millis(10),
            Duration::from_secs(1),
            Duration::from_secs(2),
            Duration::from_secs(3),
            Duration::from_secs(3),
        ]
    );
    assert_eq!(manifest.hits(), 5);
    assert_eq!(fsm.state(), SchedulerState::Backoff);

    let status = status.read().await;
    assert_eq!(status.err_streak, 5);
    assert!(status.last_error.is_some());
    assert!(status.last_success_at.is_none());
}

#[tokio::test]
async fn test_crash_before_promotion_leaves_destination_untouched() {
    let harness = Harness::new();
    harness.mock_file(BODY);

    let layout = StorageLayout::new(harness.dir.path());
    let settings = Settings {
        server_url: harness.server.base_url(),
        device_id: Some(DEVICE.to_string()),
        ..Default::default()
    };
    let options = AppOptions::from_settings(&settings, layout.clone());
    CredentialStore::new(layout.credential_file())
        .save(&Credential::new("device-secret").unwrap())
        .await
        .unwrap();

    let destination_dir = &options.sync.download_dir;
    std::fs::create_dir_all(destination_dir).unwrap();
    std::fs::write(destination_dir.join("a.bin"), "old contents").unwrap();

    let entry = ManifestEntry {
        file_name: "a.bin".to_string(),
        hash: BODY_HASH.to_string(),
        size: 11,
        uri: "/files/a.bin".to_string(),
    };
    let downloader = Downloader::new(harness.client.clone());
    let staged = downloader
        .stage(&DownloadJob::new(entry, destination_dir))
        .await
        .unwrap();
    let temp_path = staged.temp_path().to_path_buf();
    assert!(temp_path.exists());

    // the process dies between verification and rename
    std::mem::forget(staged);
    assert_eq!(
        std::fs::read_to_string(destination_dir.join("a.bin")).unwrap(),
        "old contents"
    );

    // restart sweeps the leftover
    let app_state = AppState::init(&options).await.unwrap();
    assert!(!temp_path.exists());
    assert_eq!(app_state.identity.as_str(), DEVICE);
    assert!(app_state.state_store.load().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_upstream_download_failure_backs_off() {
    let harness = Harness::new();
    harness.mock_manifest();
    harness.server.mock(|when, then| {
        when.method(GET).path("/files/a.bin");
        then.status(503);
    });

    let mut syncer = harness.syncer();
    let mut fsm = SchedulerFsm::new(cooldown());
    let mut state = LocalSyncState::new();

    let report = syncer
        .run_cycle(&mut fsm, SchedulerEvent::TimerFired, &mut state, None)
        .await
        .unwrap();

    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].kind, ErrorKind::Server);
    assert_eq!(fsm.state(), SchedulerState::Backoff);
    assert_eq!(fsm.err_streak(), 1);
    assert_eq!(
        fsm.next_wait(Duration::from_secs(3600)),
        Some(Duration::from_secs(1))
    );
    assert!(state.is_empty());
    assert!(harness.part_files().is_empty());
}

#[tokio::test]
async fn test_rejected_download_halts() {
    let harness = Harness::new();
    harness.mock_manifest();
    harness.server.mock(|when, then| {
        when.method(GET).path("/files/a.bin");
        then.status(403).body("Invalid signature");
    });

    let mut syncer = harness.syncer();
    let mut fsm = SchedulerFsm::new(cooldown());
    let mut state = LocalSyncState::new();

    let err = syncer
        .run_cycle(&mut fsm, SchedulerEvent::TimerFired, &mut state, None)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Auth);
    assert_eq!(err.exit_code(), exit_code::AUTH);
    assert!(fsm.is_halted());
    assert_eq!(fsm.next_wait(Duration::from_secs(3600)), None);
    assert!(state.is_empty());
    assert!(harness.part_files().is_empty());
}

#[tokio::test]
async fn test_check_requests_queue_behind_running_cycle() {
    let harness = Harness::new();
    let manifest = harness.server.mock(|when, then| {
        when.method(GET).path("/manifest");
        then.status(200)
            .delay(Duration::from_millis(300))
            .json_body(serde_json::json!([
                {"file_name": "a.bin", "hash": BODY_HASH, "size": 11, "uri": "/files/a.bin"}
            ]));
    });
    let file = harness.mock_file(BODY);

    let mut syncer = harness.syncer();
    let mut fsm = SchedulerFsm::new(cooldown());
    let (check_tx, check_rx) = mpsc::channel(4);
    let shutdown = Arc::new(Notify::new());
    let stop = shutdown.clone();
    let status = status();

    let options = scheduler::Options {
        interval: Duration::from_secs(3600),
        initial_delay: Duration::from_secs(3600),
    };
    let worker = scheduler::run(
        &options,
        &mut syncer,
        &mut fsm,
        LocalSyncState::new(),
        status.clone(),
        check_rx,
        |_: Duration| std::future::pending::<()>(),
        Box::pin(async move { stop.notified().await }),
    );

    let requester = async {
        let (first, first_rx) = CheckRequest::new(None);
        check_tx.send(first).await.unwrap();
        while status.read().await.state != SchedulerState::Checking {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // both arrive while the first cycle waits on the manifest
        let (second, second_rx) = CheckRequest::new(None);
        let (third, third_rx) = CheckRequest::new(None);
        check_tx.send(second).await.unwrap();
        check_tx.send(third).await.unwrap();

        let first = first_rx.await.unwrap().unwrap();
        let second = second_rx.await.unwrap().unwrap();
        let third = third_rx.await.unwrap().unwrap();
        shutdown.notify_one();
        (first, second, third)
    };

    let (state, (first, second, third)) = tokio::join!(worker, requester);
    let state = state.unwrap();

    assert_eq!(first.applied.len(), 1);
    assert_eq!(second.downloads(), 0);
    assert_eq!(second.started_at, third.started_at);
    assert!(second.started_at >= first.finished_at.unwrap());
    assert_eq!(manifest.hits(), 2);
    assert_eq!(file.hits(), 1);
    assert_eq!(state.version("a.bin"), Some(BODY_HASH));
}

/// Serves one fixed body and records how many downloads of it overlap
struct SlowSource {
    active: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl ManifestSource for SlowSource {
    async fn fetch_manifest(&self, _: &DeviceIdentity) -> Result<Manifest, SyncError> {
        Manifest::from_entries(Vec::new())
    }

    async fn download(&self, _: &ManifestEntry) -> Result<DownloadBody, SyncError> {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);

        let chunks = vec![Ok(Bytes::from_static(BODY.as_bytes()))];
        Ok(DownloadBody::new(
            Some(BODY.len() as u64),
            futures::stream::iter(chunks).boxed(),
        ))
    }
}

#[tokio::test]
async fn test_one_writer_per_file() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(SlowSource {
        active: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
    });
    let downloader = Downloader::new(source.clone());

    let entry = ManifestEntry {
        file_name: "a.bin".to_string(),
        hash: BODY_HASH.to_string(),
        size: 11,
        uri: "/files/a.bin".to_string(),
    };
    let (first, second) = tokio::join!(
        downloader.apply(DownloadJob::new(entry.clone(), dir.path())),
        downloader.apply(DownloadJob::new(entry, dir.path())),
    );

    assert!(first.is_ok());
    assert!(second.is_ok());
    assert_eq!(source.peak.load(Ordering::SeqCst), 1);
    assert_eq!(
        std::fs::read_to_string(dir.path().join("a.bin")).unwrap(),
        BODY
    );
}

#[cfg(unix)]
#[tokio::test]
async fn test_leftover_lock_file_does_not_block_restart() {
    let harness = Harness::new();
    let layout = StorageLayout::new(harness.dir.path());
    let settings = Settings {
        server_url: harness.server.base_url(),
        device_id: Some(DEVICE.to_string()),
        ..Default::default()
    };
    let options = AppOptions::from_settings(&settings, layout.clone());
    CredentialStore::new(layout.credential_file())
        .save(&Credential::new("device-secret").unwrap())
        .await
        .unwrap();

    // written before a power loss; after reboot PID 1 is some other process
    std::fs::write(layout.lock_file().path(), "1\n").unwrap();

    let app_state = AppState::init(&options).await.unwrap();
    assert_eq!(app_state.identity.as_str(), DEVICE);

    // while it runs, a second engine on the same directory is refused
    let err = match AppState::init(&options).await {
        Ok(_) => panic!("second instance started"),
        Err(e) => e,
    };
    assert_eq!(err.exit_code(), exit_code::CONFIGURATION);

    drop(app_state);
    AppState::init(&options).await.unwrap();
}
