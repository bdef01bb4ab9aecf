//! High-level sync entry points.
//!
//! `CacheCoordinator` turns a plan into downloads, extractions and cache
//! writes. A component is stamped at a version only after every item of the
//! sync landed; anything less leaves the previous stamp in place so the next
//! sync plans the remaining work again.

use crate::cache::{
    ArchiveCache, ArchiveCacheEntry, CacheDatabase, ComponentKind, FileState, ReconcileAction,
    ReconcileItem, ReconcileSummary, Reconciler,
};
use crate::cancel::CancellationToken;
use crate::config::SyncOptions;
use crate::download::{
    DownloadOrchestrator, DownloadRequest, DownloadState, HttpTransport, Priority, TaskHandle,
    Transport, VerificationMethod,
};
use crate::error::{KeelError, Result};
use crate::extract::extract_archive;
use crate::hashing::file_matches_blake3;
use crate::layout::{key_to_path, PathResolver};
use crate::manifest::{ContentHash, Manifest, ManifestArchive};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome class of a coordinator call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStatus {
    UpToDate,
    UpdateRequired,
    UpdateApplied,
    CheckFailed,
    UpdateFailed,
}

/// One item a sync could not bring up to date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncFailure {
    pub path: String,
    pub url: String,
    pub cause: String,
}

impl SyncFailure {
    fn new(item: &ReconcileItem, cause: impl Into<String>) -> Self {
        Self {
            path: item.path.clone(),
            url: item.url.clone(),
            cause: cause.into(),
        }
    }
}

impl fmt::Display for SyncFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.url.is_empty() {
            write!(f, "{}: {}", self.path, self.cause)
        } else {
            write!(f, "{} ({}): {}", self.path, self.url, self.cause)
        }
    }
}

/// Structured result of `check` and the sync operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheResult {
    pub status: CacheStatus,
    pub summary: ReconcileSummary,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<SyncFailure>,
}

impl CacheResult {
    fn new(status: CacheStatus, summary: ReconcileSummary) -> Self {
        Self {
            status,
            summary,
            error: None,
            failures: Vec::new(),
        }
    }

    fn check_failed(error: &KeelError) -> Self {
        Self {
            status: CacheStatus::CheckFailed,
            summary: ReconcileSummary::default(),
            error: Some(error.to_string()),
            failures: Vec::new(),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self.status,
            CacheStatus::CheckFailed | CacheStatus::UpdateFailed
        )
    }
}

/// A planned component inside one sync.
struct Job<'a> {
    manifest: &'a Manifest,
    component: ComponentKind,
    version: &'a str,
    items: Vec<ReconcileItem>,
    /// Verifiable BLAKE3 digests by item path.
    digests: HashMap<String, String>,
}

impl<'a> Job<'a> {
    fn plan(
        reconciler: &Reconciler,
        manifest: &'a Manifest,
        component: ComponentKind,
        version: &'a str,
    ) -> Result<Self> {
        let items = reconciler.plan(manifest, component, version)?;

        let mut digests = HashMap::new();
        let mut record = |path: PathBuf, hash: &ContentHash| {
            if hash.is_verifiable() {
                digests.insert(reconciler.key(&path), hash.value.to_lowercase());
            }
        };
        for file in manifest.loose_files() {
            record(reconciler.resolve_file(file), &file.hash);
        }
        for archive in &manifest.archives {
            record(reconciler.resolve_archive(archive), &archive.hash);
        }

        Ok(Self {
            manifest,
            component,
            version,
            items,
            digests,
        })
    }

    fn digest(&self, item: &ReconcileItem) -> Option<&str> {
        self.digests.get(&item.path).map(String::as_str)
    }

    fn archive(&self, item: &ReconcileItem) -> Option<&'a ManifestArchive> {
        item.archive
            .as_deref()
            .and_then(|name| self.manifest.archive(name))
    }

    fn pending_work(&self) -> usize {
        self.items
            .iter()
            .filter(|i| i.action != ReconcileAction::None)
            .count()
    }
}

/// Drives plans to completion for one installation.
pub struct CacheCoordinator {
    reconciler: Reconciler,
    orchestrator: DownloadOrchestrator,
    options: SyncOptions,
    /// Serializes syncs; the orchestrator's task list is per sync.
    sync_lock: tokio::sync::Mutex<()>,
}

impl CacheCoordinator {
    pub fn new(
        mut reconciler: Reconciler,
        transport: Arc<dyn Transport>,
        options: SyncOptions,
    ) -> Self {
        reconciler.set_strategy(options.strategy);
        reconciler.set_auto_prune(options.auto_prune);
        Self {
            reconciler,
            orchestrator: DownloadOrchestrator::with_max_parallel(transport, options.max_parallel),
            options,
            sync_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Open the cache stores under `root` and wire them to `transport`.
    pub fn open(
        root: impl Into<PathBuf>,
        options: SyncOptions,
        layout: Arc<dyn PathResolver>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        options.validate()?;
        let root = root.into();
        let db = CacheDatabase::open_in(&root, &options.data_dir_name)?;
        let archives = Arc::new(ArchiveCache::load_in(&root, &options.data_dir_name));
        let reconciler = Reconciler::new(root, db, archives, layout);
        Ok(Self::new(reconciler, transport, options))
    }

    /// `open` with an HTTP transport built from `options`.
    pub fn open_http(
        root: impl Into<PathBuf>,
        options: SyncOptions,
        layout: Arc<dyn PathResolver>,
    ) -> Result<Self> {
        let transport =
            HttpTransport::with_settings(&options.user_agent, options.connect_timeout())?;
        Self::open(root, options, layout, Arc::new(transport))
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn orchestrator(&self) -> &DownloadOrchestrator {
        &self.orchestrator
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    /// Token that stops the downloads of the sync in progress. The sync then
    /// reports `update_failed` and stamps nothing; the token is re-armed
    /// when the next sync starts.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.orchestrator.cancellation_token()
    }

    /// Report what a sync would do. Never writes.
    pub fn check(
        &self,
        manifest: &Manifest,
        component: ComponentKind,
        version: &str,
    ) -> CacheResult {
        let planned = Job::plan(&self.reconciler, manifest, component, version)
            .and_then(|job| Ok((self.reconciler.outdated(component, version)?, job)));
        match planned {
            Ok((outdated, job)) => {
                let summary = ReconcileSummary::from_items(&job.items);
                let status = if job.pending_work() == 0 && !outdated {
                    CacheStatus::UpToDate
                } else {
                    CacheStatus::UpdateRequired
                };
                CacheResult::new(status, summary)
            }
            Err(e) => {
                warn!("Check of {} failed: {}", component, e);
                CacheResult::check_failed(&e)
            }
        }
    }

    /// Bring `component` to `version`.
    pub async fn sync(
        &self,
        manifest: &Manifest,
        component: ComponentKind,
        version: &str,
    ) -> Result<CacheResult> {
        let _guard = self.sync_lock.lock().await;
        let job = Job::plan(&self.reconciler, manifest, component, version)?;
        self.run(vec![job]).await
    }

    /// Skip planning entirely when the stamp matches `tag` and every tracked
    /// file of the component still checks out.
    pub async fn smart_sync(
        &self,
        manifest: &Manifest,
        component: ComponentKind,
        tag: &str,
    ) -> Result<CacheResult> {
        if !self.reconciler.outdated(component, tag)? {
            let audit = self.reconciler.audit(component)?;
            let changed = audit
                .iter()
                .filter(|(_, state)| *state != FileState::Valid)
                .count();
            if changed == 0 {
                debug!("{} is at {} and intact", component, tag);
                let summary = ReconcileSummary {
                    files_valid: audit.len(),
                    ..ReconcileSummary::default()
                };
                return Ok(CacheResult::new(CacheStatus::UpToDate, summary));
            }
            info!("{} of {} tracked {} files changed on disk", changed, audit.len(), component);
        }
        self.sync(manifest, component, tag).await
    }

    /// Sync several components with one download batch. Nothing is stamped
    /// unless the whole batch succeeds.
    pub async fn sync_all(
        &self,
        targets: &[(&Manifest, ComponentKind, &str)],
    ) -> Result<CacheResult> {
        let _guard = self.sync_lock.lock().await;
        let jobs = targets
            .iter()
            .map(|(manifest, component, version)| {
                Job::plan(&self.reconciler, manifest, *component, version)
            })
            .collect::<Result<Vec<_>>>()?;
        self.run(jobs).await
    }

    async fn run(&self, jobs: Vec<Job<'_>>) -> Result<CacheResult> {
        let mut summary = ReconcileSummary::default();
        for job in &jobs {
            summary.merge(&ReconcileSummary::from_items(&job.items));
        }
        let work: usize = jobs.iter().map(Job::pending_work).sum();

        if work == 0 {
            let mut stamped = false;
            for job in &jobs {
                if self.reconciler.outdated(job.component, job.version)? {
                    self.finish(job)?;
                    stamped = true;
                }
            }
            let status = if stamped {
                CacheStatus::UpdateApplied
            } else {
                CacheStatus::UpToDate
            };
            return Ok(CacheResult::new(status, summary));
        }

        let failures = self.apply(&jobs).await?;
        if !failures.is_empty() {
            let details: Vec<String> = failures.iter().map(ToString::to_string).collect();
            let message = format!(
                "{} of {} downloads failed: {}",
                failures.len(),
                work,
                details.join("; ")
            );
            warn!("{}", message);
            return Ok(CacheResult {
                status: CacheStatus::UpdateFailed,
                summary,
                error: Some(message),
                failures,
            });
        }

        for job in &jobs {
            self.finish(job)?;
        }
        Ok(CacheResult::new(CacheStatus::UpdateApplied, summary))
    }

    /// Download, extract and track everything the jobs need. Returns the
    /// items that could not be brought up to date.
    async fn apply(&self, jobs: &[Job<'_>]) -> Result<Vec<SyncFailure>> {
        let mut failures = Vec::new();
        let mut queued: Vec<(usize, usize, TaskHandle)> = Vec::new();
        self.orchestrator.clear();

        for (j, job) in jobs.iter().enumerate() {
            for (i, item) in job.items.iter().enumerate() {
                if !item.needs_download() {
                    continue;
                }
                if item.url.is_empty() {
                    failures.push(SyncFailure::new(item, "no download URL"));
                    continue;
                }
                let target = key_to_path(self.reconciler.root(), &item.path);
                if let Some(parent) = target.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|e| KeelError::io_with_path(e, parent))?;
                }
                match self.orchestrator.queue(self.request_for(job, item, target)) {
                    Ok(task) => queued.push((j, i, task)),
                    Err(e) => failures.push(SyncFailure::new(item, e.to_string())),
                }
            }
        }

        if !queued.is_empty() {
            self.orchestrator.execute_all().await;
        }

        let mut to_extract: Vec<(usize, usize)> = Vec::new();
        for (j, i, task) in &queued {
            let job = &jobs[*j];
            let item = &job.items[*i];
            if task.state() != DownloadState::Completed {
                let cause = task
                    .error()
                    .map(|e| e.message)
                    .unwrap_or_else(|| format!("download {:?}", task.state()).to_lowercase());
                failures.push(SyncFailure::new(item, cause));
            } else if item.archive.is_some() {
                to_extract.push((*j, *i));
            } else {
                self.reconciler.track(
                    &task.request().target,
                    job.component,
                    job.version,
                    job.digest(item).unwrap_or_default(),
                )?;
            }
        }

        for (j, job) in jobs.iter().enumerate() {
            for (i, item) in job.items.iter().enumerate() {
                if item.action != ReconcileAction::Verify {
                    continue;
                }
                if item.archive.is_some() {
                    to_extract.push((j, i));
                } else if let Some(failure) = self.confirm_local(job, item)? {
                    failures.push(failure);
                }
            }
        }

        for (j, i) in to_extract {
            let job = &jobs[j];
            let item = &job.items[i];
            let Some(archive) = job.archive(item) else {
                failures.push(SyncFailure::new(item, "archive not in manifest"));
                continue;
            };
            match self.extract(archive, job.component, job.version).await {
                Ok(entry) => debug!(
                    "{} produced {} files",
                    entry.archive_name,
                    entry.files.len()
                ),
                Err(e @ KeelError::Database { .. }) => return Err(e),
                Err(e) => {
                    warn!("Extraction of {} failed: {}", archive.name, e);
                    failures.push(SyncFailure::new(item, e.to_string()));
                }
            }
        }

        Ok(failures)
    }

    fn request_for(
        &self,
        job: &Job<'_>,
        item: &ReconcileItem,
        target: PathBuf,
    ) -> DownloadRequest {
        let mut request = DownloadRequest::new(item.url.clone(), target)
            .with_expected_size(item.expected_size)
            .with_timeouts(self.options.connect_timeout(), self.options.transfer_timeout())
            .with_description(format!("{} {}", job.component, job.version));
        if let Some(digest) = job.digest(item) {
            request = request.with_verification(VerificationMethod::Blake3, digest);
        }
        if item.archive.is_some() {
            request = request.with_priority(Priority::High);
        }
        request
    }

    /// A sourceless item is acceptable only if the file on disk already is
    /// what the manifest describes; it is then tracked as is.
    fn confirm_local(&self, job: &Job<'_>, item: &ReconcileItem) -> Result<Option<SyncFailure>> {
        let path = key_to_path(self.reconciler.root(), &item.path);
        let size_ok = std::fs::metadata(&path)
            .map(|m| m.is_file() && m.len() == item.expected_size)
            .unwrap_or(false);
        let digest = job.digest(item);
        let content_ok = size_ok && digest.map_or(true, |d| file_matches_blake3(&path, d));

        if !content_ok {
            return Ok(Some(SyncFailure::new(
                item,
                "no download source and the local copy does not match",
            )));
        }
        self.reconciler
            .track(&path, job.component, job.version, digest.unwrap_or_default())?;
        debug!("Adopted local copy of {}", item.path);
        Ok(None)
    }

    async fn extract(
        &self,
        archive: &ManifestArchive,
        component: ComponentKind,
        version: &str,
    ) -> Result<ArchiveCacheEntry> {
        let reconciler = self.reconciler.clone();
        let archive = archive.clone();
        let version = version.to_string();
        tokio::task::spawn_blocking(move || {
            let path = reconciler.resolve_archive(&archive);
            let entry = extract_archive(&reconciler, &archive, &path, component, &version)?;
            remove_artifact(&path);
            Ok(entry)
        })
        .await
        .map_err(|e| KeelError::Other(format!("Extraction task failed: {}", e)))?
    }

    fn finish(&self, job: &Job<'_>) -> Result<()> {
        self.reconciler.stamp(job.component, job.version)?;
        if self.reconciler.auto_prune() {
            self.reconciler
                .clean(job.manifest, job.component, self.options.prune_files)?;
        }
        Ok(())
    }

    /// Drop cache rows of `component` the manifest no longer lists.
    pub fn clean(&self, manifest: &Manifest, component: ComponentKind) -> Result<Vec<String>> {
        self.reconciler
            .clean(manifest, component, self.options.prune_files)
    }

    /// Forget all tracked files, stamps and extraction records.
    pub fn clear(&self) -> Result<()> {
        self.reconciler.database().clear()?;
        let archives = self.reconciler.archive_cache();
        archives.clear();
        archives.save()?;
        info!("Cleared local cache state");
        Ok(())
    }

    pub fn vacuum(&self) -> Result<()> {
        self.reconciler.database().vacuum()
    }

    pub fn check_integrity(&self) -> bool {
        self.reconciler.database().check_integrity()
    }
}

/// Downloaded archives are removed once extracted.
fn remove_artifact(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!("Removed download artifact {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
    }
}
