//! Bounded-concurrency batch downloader.
//!
//! Tasks are queued, then run together by [`DownloadOrchestrator::execute_all`]
//! in priority order with at most `max_parallel` transfers in flight. Each
//! transfer writes to `<target>.part`, is checked for size and digest, and is
//! only then renamed onto the target, so a failed or cancelled download never
//! leaves a corrupt file at the target path. Failed tasks are not retried.
//!
//! Partial files carry a prefix of the expected digest in their name, so a
//! `.part` left by a download of different content is discarded rather than
//! resumed.

use super::task::{DownloadTask, TaskHandle, TaskProgressCallback};
use super::transport::Transport;
use super::types::{
    DownloadError, DownloadRequest, DownloadState, ExecutionReport, VerificationMethod,
};
use crate::cancel::{CancellationToken, TransferSignal};
use crate::config::NetworkConfig;
use crate::error::{KeelError, Result};
use crate::hashing::{compute_blake3, compute_sha256, hashes_match};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

pub struct DownloadOrchestrator {
    transport: Arc<dyn Transport>,
    max_parallel: usize,
    tasks: Mutex<Vec<TaskHandle>>,
    next_id: AtomicU64,
    /// Shared by every queued task; cancelling it stops the whole batch.
    cancel: CancellationToken,
}

impl DownloadOrchestrator {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_max_parallel(transport, NetworkConfig::DEFAULT_MAX_PARALLEL)
    }

    /// Values below one are raised to one.
    pub fn with_max_parallel(transport: Arc<dyn Transport>, max_parallel: usize) -> Self {
        Self {
            transport,
            max_parallel: max_parallel.max(1),
            tasks: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            cancel: CancellationToken::new(),
        }
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    /// Token observed by every task of this orchestrator. Cancelling it
    /// from anywhere has the same effect as [`Self::cancel_all`] on tasks
    /// that are running or about to run.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Queue a request. Invalid requests are rejected here, not at run time.
    pub fn queue(&self, request: DownloadRequest) -> Result<TaskHandle> {
        self.queue_inner(request, None)
    }

    /// Queue a request with a per-task progress callback.
    pub fn queue_with_progress(
        &self,
        request: DownloadRequest,
        callback: TaskProgressCallback,
    ) -> Result<TaskHandle> {
        self.queue_inner(request, Some(callback))
    }

    fn queue_inner(
        &self,
        request: DownloadRequest,
        callback: Option<TaskProgressCallback>,
    ) -> Result<TaskHandle> {
        request.validate()?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        debug!("Queued download {} -> {}", id, request.target.display());
        let signal = TransferSignal::with_token(self.cancel.clone());
        let task = Arc::new(DownloadTask::new(id, request, signal, callback));
        self.lock_tasks().push(task.clone());
        Ok(task)
    }

    pub fn tasks(&self) -> Vec<TaskHandle> {
        self.lock_tasks().clone()
    }

    pub fn task(&self, id: u64) -> Option<TaskHandle> {
        self.lock_tasks().iter().find(|t| t.id() == id).cloned()
    }

    /// Run every pending task to completion, failure, or pause.
    ///
    /// Higher priorities start first; equal priorities keep queue order.
    pub async fn execute_all(&self) -> ExecutionReport {
        let mut pending: Vec<TaskHandle> = self
            .lock_tasks()
            .iter()
            .filter(|t| t.state() == DownloadState::Pending)
            .cloned()
            .collect();
        pending.sort_by(|a, b| {
            b.request()
                .priority
                .cmp(&a.request().priority)
                .then(a.id().cmp(&b.id()))
        });

        if pending.is_empty() {
            return ExecutionReport::default();
        }
        info!(
            "Starting {} downloads ({} at a time)",
            pending.len(),
            self.max_parallel
        );

        let mut finished: Vec<TaskHandle> = futures::stream::iter(pending)
            .map(|task| async move {
                self.run_task(&task).await;
                task
            })
            .buffer_unordered(self.max_parallel)
            .collect()
            .await;
        finished.sort_by_key(|t| t.id());

        let mut report = ExecutionReport::default();
        for task in finished {
            let outcome = task.outcome();
            match outcome.state {
                DownloadState::Completed => report.completed += 1,
                DownloadState::Paused => report.paused += 1,
                _ => report.failed += 1,
            }
            report.outcomes.push(outcome);
        }
        info!(
            "Downloads finished: {} completed, {} failed, {} paused",
            report.completed, report.failed, report.paused
        );
        report
    }

    async fn run_task(&self, task: &DownloadTask) {
        let request = task.request();
        let mut last_error: Option<(KeelError, String)> = None;

        for (index, url) in request.urls.iter().enumerate() {
            task.set_state(DownloadState::Connecting);
            match self.transfer(task, url).await {
                Ok(()) => {
                    task.set_successful_url(index);
                    task.set_state(DownloadState::Completed);
                    task.notify_progress();
                    info!(
                        "Downloaded {} ({} bytes)",
                        request.target.display(),
                        task.downloaded_bytes()
                    );
                    return;
                }
                Err(KeelError::DownloadPaused) => {
                    info!("Download {} paused", request.name);
                    task.set_state(DownloadState::Paused);
                    return;
                }
                Err(KeelError::DownloadCancelled) => {
                    remove_quietly(&part_path(request)).await;
                    task.set_error(DownloadError {
                        message: "cancelled".into(),
                        url: url.clone(),
                        code: None,
                        verification: false,
                    });
                    return;
                }
                Err(e) => {
                    warn!("Download of {} from {} failed: {}", request.name, url, e);
                    last_error = Some((e, url.clone()));
                }
            }
        }

        let (error, url) = last_error.unwrap_or_else(|| {
            (
                KeelError::Other("no URL attempted".into()),
                String::new(),
            )
        });
        let code = match &error {
            KeelError::DownloadFailed { message, .. } => message
                .strip_prefix("HTTP ")
                .and_then(|status| status.parse().ok()),
            _ => None,
        };
        task.set_error(DownloadError {
            message: error.to_string(),
            url,
            code,
            verification: error.is_verification(),
        });
    }

    /// One attempt against one URL. On success the target holds the
    /// verified file.
    async fn transfer(&self, task: &DownloadTask, url: &str) -> Result<()> {
        let request = task.request();
        task.signal().checkpoint()?;

        let part = part_path(request);
        discard_stale_parts(&request.target, &part).await;
        let mut resume_from = if request.resume {
            existing_len(&part).await
        } else {
            remove_quietly(&part).await;
            0
        };
        if let Some(expected) = request.expected_size {
            if resume_from > expected {
                debug!("Discarding oversized partial file {}", part.display());
                remove_quietly(&part).await;
                resume_from = 0;
            }
        }

        let already_complete =
            resume_from > 0 && request.expected_size == Some(resume_from);
        if already_complete {
            debug!("Partial file {} is already complete", part.display());
            task.set_total(Some(resume_from));
            task.reset_progress(resume_from);
        } else {
            self.stream_to_part(task, url, &part, resume_from).await?;
        }

        task.set_state(DownloadState::Verifying);
        if let Err(e) = verify_part(request, &part).await {
            remove_quietly(&part).await;
            return Err(e);
        }

        tokio::fs::rename(&part, &request.target)
            .await
            .map_err(|e| KeelError::io_with_path(e, &request.target))?;
        Ok(())
    }

    async fn stream_to_part(
        &self,
        task: &DownloadTask,
        url: &str,
        part: &Path,
        resume_from: u64,
    ) -> Result<()> {
        let request = task.request();
        let response = tokio::time::timeout(
            request.connect_timeout,
            self.transport.open(url, resume_from),
        )
        .await
        .map_err(|_| KeelError::Timeout(request.connect_timeout))??;
        task.set_http_status(response.status);

        let resuming = resume_from > 0 && response.partial;
        if resume_from > 0 && !resuming {
            warn!("Server does not support Range requests, restarting from zero");
        }
        let total = if resuming {
            request
                .expected_size
                .or(response.content_length.map(|len| len + resume_from))
        } else {
            response.content_length.or(request.expected_size)
        };
        task.set_total(total);

        let mut file = if resuming {
            tokio::fs::OpenOptions::new()
                .append(true)
                .open(part)
                .await
                .map_err(|e| KeelError::io_with_path(e, part))?
        } else {
            tokio::fs::File::create(part)
                .await
                .map_err(|e| KeelError::io_with_path(e, part))?
        };

        let mut downloaded = if resuming { resume_from } else { 0 };
        task.reset_progress(downloaded);
        task.set_state(DownloadState::Downloading);
        task.notify_progress();

        let started = Instant::now();
        let mut session_bytes: u64 = 0;
        let mut last_notify = Instant::now();
        let mut body = response.body;

        loop {
            if let Err(interrupt) = task.signal().checkpoint() {
                file.flush().await?;
                return Err(interrupt.into());
            }

            // The transfer timeout bounds each wait for data, not the whole body.
            let next = tokio::time::timeout(request.transfer_timeout, body.next())
                .await
                .map_err(|_| KeelError::Timeout(request.transfer_timeout))?;
            let chunk = match next {
                Some(chunk) => chunk?,
                None => break,
            };

            file.write_all(&chunk)
                .await
                .map_err(|e| KeelError::io_with_path(e, part))?;
            let len = chunk.len() as u64;
            downloaded = task.update_progress(len);
            session_bytes += len;

            if last_notify.elapsed() >= NetworkConfig::DOWNLOAD_PROGRESS_INTERVAL {
                task.notify_progress();
                last_notify = Instant::now();
            }

            if let Some(limit) = request.rate_limit_bytes_per_second {
                let allowed = Duration::from_secs_f64(session_bytes as f64 / limit as f64);
                let elapsed = started.elapsed();
                if allowed > elapsed {
                    tokio::time::sleep(allowed - elapsed).await;
                }
            }
        }

        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        task.notify_progress();

        if let Some(total) = total {
            if downloaded < total {
                return Err(KeelError::Network {
                    message: format!(
                        "Incomplete download: got {} of {} bytes",
                        downloaded, total
                    ),
                    cause: None,
                });
            }
        }
        Ok(())
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<TaskHandle>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Aggregates are summed over the task list on demand.

    pub fn total_bytes(&self) -> u64 {
        self.lock_tasks().iter().filter_map(|t| t.total_bytes()).sum()
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.lock_tasks().iter().map(|t| t.downloaded_bytes()).sum()
    }

    pub fn completed_count(&self) -> usize {
        self.count_where(|s| s == DownloadState::Completed)
    }

    pub fn failed_count(&self) -> usize {
        self.count_where(|s| s == DownloadState::Failed)
    }

    pub fn active_count(&self) -> usize {
        self.count_where(|s| s.is_active())
    }

    pub fn pending_count(&self) -> usize {
        self.count_where(|s| s == DownloadState::Pending)
    }

    pub fn paused_count(&self) -> usize {
        self.count_where(|s| s == DownloadState::Paused)
    }

    fn count_where(&self, predicate: impl Fn(DownloadState) -> bool) -> usize {
        self.lock_tasks()
            .iter()
            .filter(|t| predicate(t.state()))
            .count()
    }

    /// Percentage of known bytes transferred (0-100).
    pub fn overall_progress(&self) -> f64 {
        let total = self.total_bytes();
        if total == 0 {
            return 0.0;
        }
        (self.downloaded_bytes() as f64 / total as f64 * 100.0).min(100.0)
    }

    pub fn cancel_all(&self) {
        self.cancel.cancel();
        for task in self.lock_tasks().iter() {
            if !task.state().is_terminal() {
                task.cancel();
            }
        }
    }

    pub fn pause_all(&self) {
        for task in self.lock_tasks().iter() {
            if !task.state().is_terminal() {
                task.pause();
            }
        }
    }

    pub fn resume_all(&self) {
        for task in self.lock_tasks().iter() {
            task.resume();
        }
    }

    /// Forget every task that is not currently transferring. Once nothing
    /// is left running, a cancelled token is re-armed for the next batch.
    pub fn clear(&self) {
        let mut tasks = self.lock_tasks();
        tasks.retain(|t| t.state().is_active());
        if tasks.is_empty() {
            self.cancel.reset();
        }
    }
}

const PART_TAG_LEN: usize = 16;

/// `<target>.<digest prefix>.part` for verified requests, else `<target>.part`.
pub fn part_path(request: &DownloadRequest) -> PathBuf {
    let mut name = request.target.as_os_str().to_os_string();
    if let Some(tag) = part_tag(request) {
        name.push(".");
        name.push(tag);
    }
    name.push(NetworkConfig::DOWNLOAD_TEMP_SUFFIX);
    PathBuf::from(name)
}

fn part_tag(request: &DownloadRequest) -> Option<String> {
    if request.verification_method == VerificationMethod::None {
        return None;
    }
    let prefix = request.verification_value.get(..PART_TAG_LEN)?;
    is_part_tag(prefix).then(|| prefix.to_ascii_lowercase())
}

fn is_part_tag(tag: &str) -> bool {
    tag.len() == PART_TAG_LEN && tag.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Whether `file_name` is a partial file of `target_name`, tagged or not.
fn is_partial_of(file_name: &str, target_name: &str) -> bool {
    let Some(rest) = file_name
        .strip_prefix(target_name)
        .and_then(|rest| rest.strip_suffix(NetworkConfig::DOWNLOAD_TEMP_SUFFIX))
    else {
        return false;
    };
    rest.is_empty() || rest.strip_prefix('.').is_some_and(is_part_tag)
}

/// Remove partial files of `target` other than `keep`.
async fn discard_stale_parts(target: &Path, keep: &Path) {
    let (Some(dir), Some(target_name), Some(keep_name)) = (
        target.parent(),
        target.file_name().and_then(|n| n.to_str()),
        keep.file_name(),
    ) else {
        return;
    };
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let file_name = entry.file_name();
        if file_name.as_os_str() == keep_name {
            continue;
        }
        if file_name
            .to_str()
            .is_some_and(|name| is_partial_of(name, target_name))
        {
            debug!("Discarding partial file of other content {}", entry.path().display());
            remove_quietly(&entry.path()).await;
        }
    }
}

async fn existing_len(path: &Path) -> u64 {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.len())
        .unwrap_or(0)
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove {}: {}", path.display(), e);
        }
    }
}

async fn verify_part(request: &DownloadRequest, part: &Path) -> Result<()> {
    let actual_size = existing_len(part).await;
    if let Some(expected) = request.expected_size {
        if actual_size != expected {
            return Err(KeelError::SizeMismatch {
                expected,
                actual: actual_size,
            });
        }
    }

    let method = request.verification_method;
    if method == VerificationMethod::None {
        return Ok(());
    }
    let path = part.to_path_buf();
    let actual = tokio::task::spawn_blocking(move || match method {
        VerificationMethod::Sha256 => compute_sha256(&path),
        _ => compute_blake3(&path),
    })
    .await
    .map_err(|e| KeelError::Other(format!("Hash task failed: {}", e)))??;

    if !hashes_match(&actual, &request.verification_value) {
        return Err(KeelError::HashMismatch {
            expected: request.verification_value.clone(),
            actual,
        });
    }
    Ok(())
}
