//! File synchronization: one check-and-apply cycle

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::authn::identity::DeviceIdentity;
use crate::errors::{ErrorKind, SyncError};
use crate::filesys::file::File;
use crate::http::manifest::ManifestSource;
use crate::models::manifest::{validate_file_name, Manifest};
use crate::sync::download::{DownloadJob, Downloader};
use crate::sync::fsm::{SchedulerEvent, SchedulerFsm};
use crate::sync::hooks::{run_install_script, HookOptions};
use crate::sync::state::{LocalSyncState, SyncStateStore};

/// Syncer options
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub download_dir: PathBuf,
    pub max_parallel_downloads: usize,
    pub prune_removed: bool,
    pub hooks: HookOptions,
}

impl SyncOptions {
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            max_parallel_downloads: 2,
            prune_removed: false,
            hooks: HookOptions::default(),
        }
    }
}

/// Work derived from one manifest snapshot
#[derive(Debug, Clone, Default)]
pub struct SyncPlan {
    pub manifest_files: usize,
    pub unchanged: usize,
    pub jobs: Vec<DownloadJob>,

    /// Tracked files the manifest no longer lists
    pub removed: Vec<String>,
}

impl SyncPlan {
    /// Diff a manifest against the applied versions
    pub fn new(manifest: &Manifest, state: &LocalSyncState, download_dir: &Path) -> Self {
        let mut plan = SyncPlan {
            manifest_files: manifest.len(),
            ..Default::default()
        };

        for entry in manifest.entries() {
            if state.is_current(entry) {
                plan.unchanged += 1;
            } else {
                plan.jobs.push(DownloadJob::new(entry.clone(), download_dir));
            }
        }

        plan.removed = state
            .file_names()
            .filter(|name| !manifest.contains(name))
            .map(str::to_string)
            .collect();
        plan
    }

    pub fn has_changes(&self, prune: bool) -> bool {
        !self.jobs.is_empty() || (prune && !self.removed.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedFile {
    pub file_name: String,
    pub version: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedFile {
    pub file_name: String,
    pub kind: ErrorKind,
    pub message: String,

    /// Consecutive cycles this file has failed in
    pub attempts: u32,
}

/// Outcome of one check cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub manifest_files: usize,
    pub unchanged: usize,
    pub applied: Vec<AppliedFile>,
    pub failed: Vec<FailedFile>,
    pub pruned: Vec<String>,
}

impl CycleReport {
    fn start() -> Self {
        Self {
            started_at: Utc::now(),
            finished_at: None,
            manifest_files: 0,
            unchanged: 0,
            applied: Vec::new(),
            failed: Vec::new(),
            pruned: Vec::new(),
        }
    }

    /// Downloads attempted in this cycle
    pub fn downloads(&self) -> usize {
        self.applied.len() + self.failed.len()
    }

    /// No file failed
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// File syncer
pub struct Syncer {
    identity: DeviceIdentity,
    source: Arc<dyn ManifestSource>,
    store: Arc<dyn SyncStateStore>,
    downloader: Downloader,
    options: SyncOptions,
    attempts: HashMap<String, u32>,
}

impl Syncer {
    /// Create a new syncer
    pub fn new(
        identity: DeviceIdentity,
        source: Arc<dyn ManifestSource>,
        store: Arc<dyn SyncStateStore>,
        options: SyncOptions,
    ) -> Self {
        Self {
            identity,
            downloader: Downloader::new(source.clone()),
            source,
            store,
            options,
            attempts: HashMap::new(),
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn download_dir(&self) -> &Path {
        &self.options.download_dir
    }

    /// Work out what has to change.
    ///
    /// A narrowed plan only covers `only` and never lists removed files.
    fn plan(
        &self,
        mut manifest: Manifest,
        state: &LocalSyncState,
        only: Option<&str>,
    ) -> Result<SyncPlan, SyncError> {
        if let Some(name) = only {
            if !manifest.contains(name) {
                return Err(SyncError::ClientError(format!(
                    "{} is not in the manifest for {}",
                    name, self.identity
                )));
            }
            manifest.retain_file(name);
        }

        let mut plan = SyncPlan::new(&manifest, state, &self.options.download_dir);
        if only.is_some() {
            plan.removed.clear();
        }
        debug!(
            "Plan: {} to download, {} unchanged, {} removed upstream",
            plan.jobs.len(),
            plan.unchanged,
            plan.removed.len()
        );
        Ok(plan)
    }

    /// Run one full check cycle, driving `fsm` through it.
    ///
    /// `state` is updated and persisted after every promoted file. A fatal error
    /// leaves the FSM halted; any other cycle failure leaves it in backoff. So
    /// does a cycle whose downloads failed on the network or the server, even
    /// though its report is still returned.
    pub async fn run_cycle(
        &mut self,
        fsm: &mut SchedulerFsm,
        trigger: SchedulerEvent,
        state: &mut LocalSyncState,
        only: Option<&str>,
    ) -> Result<CycleReport, SyncError> {
        fsm.process(trigger).map_err(SyncError::Internal)?;
        let mut report = CycleReport::start();
        info!("Checking for updates ({})", self.identity);

        let manifest = match self.source.fetch_manifest(&self.identity).await {
            Ok(manifest) => manifest,
            Err(e) => return Err(fail_cycle(fsm, e)),
        };
        let plan = match self.plan(manifest, state, only) {
            Ok(plan) => plan,
            Err(e) => {
                // the server answered; a bad request is not a failed check
                fsm.process(SchedulerEvent::ManifestFetched { changed: false })
                    .map_err(SyncError::Internal)?;
                return Err(e);
            }
        };
        report.manifest_files = plan.manifest_files;
        report.unchanged = plan.unchanged;

        let changed = plan.has_changes(self.options.prune_removed);
        fsm.process(SchedulerEvent::ManifestFetched { changed })
            .map_err(SyncError::Internal)?;

        if changed {
            if let Err(e) = self.apply_plan(plan, state, &mut report).await {
                return Err(fail_cycle(fsm, e));
            }
            let event = match report.failed.iter().find(|f| is_backoff_kind(f.kind)) {
                Some(failed) => {
                    warn!(
                        file_name = %failed.file_name,
                        kind = %failed.kind,
                        "Downloads failed upstream, backing off: {}",
                        failed.message
                    );
                    SchedulerEvent::CycleFailed(format!("{}: {}", failed.file_name, failed.message))
                }
                None => SchedulerEvent::JobsResolved,
            };
            fsm.process(event).map_err(SyncError::Internal)?;
        }

        report.finished_at = Some(Utc::now());
        if report.downloads() == 0 && report.pruned.is_empty() {
            info!("Up to date ({} files)", report.manifest_files);
        } else {
            info!(
                "Check finished: {} applied, {} failed, {} pruned",
                report.applied.len(),
                report.failed.len(),
                report.pruned.len()
            );
        }
        Ok(report)
    }

    /// Download the plan's jobs with bounded parallelism.
    ///
    /// Per-file failures are recorded in `report`; only a fatal error or a
    /// failure to persist `state` fails the whole call.
    pub async fn apply_plan(
        &mut self,
        plan: SyncPlan,
        state: &mut LocalSyncState,
        report: &mut CycleReport,
    ) -> Result<(), SyncError> {
        let planned: HashSet<&str> = plan.jobs.iter().map(|job| job.file_name()).collect();
        self.attempts.retain(|name, _| planned.contains(name.as_str()));
        drop(planned);

        let parallel = self.options.max_parallel_downloads.max(1);
        let downloader = &self.downloader;
        let mut results = stream::iter(plan.jobs)
            .map(|job| downloader.apply(job))
            .buffer_unordered(parallel);

        let mut fatal = None;
        let mut persist_error = None;
        let mut scripts = Vec::new();

        while let Some(result) = results.next().await {
            match result {
                Ok(applied) => {
                    state.record(&applied.file_name, &applied.version);
                    if let Err(e) = self.store.save(state).await {
                        error!("Applied {} but could not record it: {}", applied.file_name, e);
                        persist_error.get_or_insert(e);
                    }
                    self.attempts.remove(&applied.file_name);
                    if self.options.hooks.wants(&applied.file_name) {
                        scripts.push(applied.path.clone());
                    }
                    report.applied.push(AppliedFile {
                        file_name: applied.file_name,
                        version: applied.version,
                        bytes: applied.bytes,
                    });
                }
                Err(failed) => {
                    let attempts = self.attempts.entry(failed.file_name.clone()).or_insert(0);
                    *attempts += 1;
                    warn!(
                        file_name = %failed.file_name,
                        kind = %failed.kind(),
                        attempts = *attempts,
                        "Download failed, retrying next cycle: {}",
                        failed.source
                    );
                    report.failed.push(FailedFile {
                        file_name: failed.file_name.clone(),
                        kind: failed.kind(),
                        message: failed.source.to_string(),
                        attempts: *attempts,
                    });
                    if failed.source.is_fatal() {
                        fatal = Some(failed.source);
                        break;
                    }
                }
            }
        }
        // cancels in-flight downloads; their temporary files are removed on drop
        drop(results);

        if let Some(err) = fatal {
            return Err(err);
        }

        for script in scripts {
            if let Err(e) = run_install_script(&script, self.options.hooks.script_timeout).await {
                warn!("Install hook failed: {}", e);
            }
        }

        if self.options.prune_removed {
            for name in plan.removed {
                self.prune(&name, state, report).await;
            }
            if !report.pruned.is_empty() {
                if let Err(e) = self.store.save(state).await {
                    persist_error.get_or_insert(e);
                }
            }
        }

        match persist_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn prune(&self, name: &str, state: &mut LocalSyncState, report: &mut CycleReport) {
        if validate_file_name(name).is_err() {
            warn!("Not pruning suspicious tracked name {:?}", name);
            return;
        }
        let file = File::new(self.options.download_dir.join(name));
        match file.delete().await {
            Ok(()) => {
                info!("Pruned {} (no longer in the manifest)", name);
                state.forget(name);
                report.pruned.push(name.to_string());
            }
            Err(e) => warn!("Unable to prune {}: {}", name, e),
        }
    }
}

/// Per-file failures that mean the server or the network is unwell
fn is_backoff_kind(kind: ErrorKind) -> bool {
    matches!(kind, ErrorKind::TransientNetwork | ErrorKind::Server)
}

/// Move the FSM out of a failed cycle and pass the error on
fn fail_cycle(fsm: &mut SchedulerFsm, err: SyncError) -> SyncError {
    let event = if err.is_fatal() {
        error!(
            kind = %err.kind(),
            "Scheduler halted, operator intervention required: {}",
            err
        );
        SchedulerEvent::Halt(err.to_string())
    } else {
        warn!(kind = %err.kind(), "Check failed: {}", err);
        SchedulerEvent::CycleFailed(err.to_string())
    };
    if let Err(e) = fsm.process(event) {
        warn!("{}", e);
    }
    err
}
