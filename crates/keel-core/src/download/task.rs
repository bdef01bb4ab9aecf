//! A single queued download and its shared progress state.

use super::orchestrator::part_path;
use super::types::{
    DownloadError, DownloadOutcome, DownloadProgress, DownloadRequest, DownloadState,
};
use crate::cancel::TransferSignal;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Callback invoked with `(bytes_transferred, bytes_total)`.
pub type TaskProgressCallback = Arc<dyn Fn(u64, Option<u64>) + Send + Sync>;

/// Shared handle to a queued task.
pub type TaskHandle = Arc<DownloadTask>;

#[derive(Debug, Default)]
struct Timing {
    started: Option<Instant>,
    finished: Option<Instant>,
}

#[derive(Debug, Default)]
struct Attempt {
    error: Option<DownloadError>,
    successful_url_index: Option<usize>,
    http_status: Option<u16>,
}

/// One download, observable from any thread while it runs.
pub struct DownloadTask {
    id: u64,
    request: DownloadRequest,
    state: AtomicU8,
    downloaded: AtomicU64,
    /// Zero while the size is unknown.
    total: AtomicU64,
    signal: TransferSignal,
    speed: Mutex<SpeedTracker>,
    timing: Mutex<Timing>,
    attempt: Mutex<Attempt>,
    progress_callback: Option<TaskProgressCallback>,
}

impl std::fmt::Debug for DownloadTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadTask")
            .field("id", &self.id)
            .field("name", &self.request.name)
            .field("state", &self.state())
            .finish()
    }
}

impl DownloadTask {
    pub(crate) fn new(
        id: u64,
        request: DownloadRequest,
        signal: TransferSignal,
        progress_callback: Option<TaskProgressCallback>,
    ) -> Self {
        let total = request.expected_size.unwrap_or(0);
        Self {
            id,
            request,
            state: AtomicU8::new(DownloadState::Pending as u8),
            downloaded: AtomicU64::new(0),
            total: AtomicU64::new(total),
            signal,
            speed: Mutex::new(SpeedTracker::new()),
            timing: Mutex::new(Timing::default()),
            attempt: Mutex::new(Attempt::default()),
            progress_callback,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn request(&self) -> &DownloadRequest {
        &self.request
    }

    pub fn state(&self) -> DownloadState {
        DownloadState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn signal(&self) -> &TransferSignal {
        &self.signal
    }

    /// Move to `state`. Terminal states are final.
    pub(crate) fn set_state(&self, state: DownloadState) {
        let current = self.state();
        if current.is_terminal() {
            return;
        }
        if current != state {
            debug!("Download {} ({}): {:?} -> {:?}", self.id, self.request.name, current, state);
        }
        self.state.store(state as u8, Ordering::SeqCst);
        let mut timing = self.timing.lock().unwrap_or_else(PoisonError::into_inner);
        match state {
            DownloadState::Connecting if timing.started.is_none() => {
                timing.started = Some(Instant::now());
            }
            DownloadState::Completed | DownloadState::Failed | DownloadState::Paused => {
                timing.finished = Some(Instant::now());
            }
            _ => {}
        }
    }

    pub(crate) fn set_total(&self, total: Option<u64>) {
        self.total.store(total.unwrap_or(0), Ordering::SeqCst);
    }

    /// Restart the byte counters, e.g. when a server ignores a range request.
    pub(crate) fn reset_progress(&self, downloaded: u64) {
        self.downloaded.store(downloaded, Ordering::SeqCst);
        *self.speed.lock().unwrap_or_else(PoisonError::into_inner) = SpeedTracker::new();
    }

    /// Record `chunk` newly written bytes.
    pub(crate) fn update_progress(&self, chunk: u64) -> u64 {
        self.speed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(chunk);
        self.downloaded.fetch_add(chunk, Ordering::SeqCst) + chunk
    }

    pub(crate) fn notify_progress(&self) {
        if let Some(callback) = &self.progress_callback {
            callback(self.downloaded_bytes(), self.total_bytes());
        }
    }

    pub(crate) fn set_error(&self, error: DownloadError) {
        self.attempt
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .error = Some(error);
        self.set_state(DownloadState::Failed);
    }

    pub(crate) fn set_http_status(&self, status: u16) {
        self.attempt
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .http_status = Some(status);
    }

    pub(crate) fn set_successful_url(&self, index: usize) {
        self.attempt
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .successful_url_index = Some(index);
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.downloaded.load(Ordering::SeqCst)
    }

    pub fn total_bytes(&self) -> Option<u64> {
        match self.total.load(Ordering::SeqCst) {
            0 => None,
            total => Some(total),
        }
    }

    pub fn progress(&self) -> DownloadProgress {
        let speed = self
            .speed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .speed();
        DownloadProgress::new(self.downloaded_bytes(), self.total_bytes(), speed)
    }

    pub fn error(&self) -> Option<DownloadError> {
        self.attempt
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .error
            .clone()
    }

    pub fn duration(&self) -> Duration {
        let timing = self.timing.lock().unwrap_or_else(PoisonError::into_inner);
        match (timing.started, timing.finished) {
            (Some(start), Some(end)) if end >= start => end - start,
            (Some(start), None) => start.elapsed(),
            _ => Duration::ZERO,
        }
    }

    /// Stop the task. Pending and paused tasks fail without touching the
    /// network and lose any partial file; a running transfer cleans up at
    /// its next chunk.
    pub fn cancel(&self) {
        self.signal.cancel();
        if matches!(self.state(), DownloadState::Pending | DownloadState::Paused) {
            self.set_error(DownloadError {
                message: "cancelled".into(),
                url: String::new(),
                code: None,
                verification: false,
            });
            let part = part_path(&self.request);
            match std::fs::remove_file(&part) {
                Ok(()) => debug!("Removed partial file {}", part.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove {}: {}", part.display(), e),
            }
        }
    }

    /// Pause the task, keeping any partial data for a later resume.
    pub fn pause(&self) {
        self.signal.pause();
        if self.state() == DownloadState::Pending {
            self.set_state(DownloadState::Paused);
        }
    }

    /// Make a paused task eligible to run again.
    pub fn resume(&self) {
        self.signal.resume();
        if self.state() == DownloadState::Paused {
            self.state
                .store(DownloadState::Pending as u8, Ordering::SeqCst);
        }
    }

    pub fn outcome(&self) -> DownloadOutcome {
        let attempt = self.attempt.lock().unwrap_or_else(PoisonError::into_inner);
        DownloadOutcome {
            id: self.id,
            name: self.request.name.clone(),
            target: self.request.target.clone(),
            state: self.state(),
            progress: self.progress(),
            error: attempt.error.clone(),
            successful_url_index: attempt.successful_url_index,
            http_status: attempt.http_status,
            duration: self.duration(),
        }
    }
}

/// Average throughput since the tracker was created.
#[derive(Debug)]
struct SpeedTracker {
    start_time: Instant,
    total_bytes: u64,
}

impl SpeedTracker {
    fn new() -> Self {
        Self {
            start_time: Instant::now(),
            total_bytes: 0,
        }
    }

    fn record(&mut self, bytes: u64) {
        self.total_bytes += bytes;
    }

    fn speed(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.total_bytes as f64 / elapsed
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn task() -> DownloadTask {
        DownloadTask::new(
            7,
            DownloadRequest::new("https://cdn.example/a.bin", "/nonexistent/keel/a.bin")
                .with_expected_size(10),
            TransferSignal::new(),
            None,
        )
    }

    #[test]
    fn test_terminal_state_is_final() {
        let t = task();
        t.set_state(DownloadState::Connecting);
        t.set_state(DownloadState::Completed);
        t.set_state(DownloadState::Downloading);
        assert_eq!(t.state(), DownloadState::Completed);
    }

    #[test]
    fn test_progress_counts_bytes() {
        let t = task();
        assert_eq!(t.total_bytes(), Some(10));
        assert_eq!(t.update_progress(4), 4);
        assert_eq!(t.update_progress(6), 10);
        assert_eq!(t.progress().percent, Some(100.0));

        t.reset_progress(0);
        assert_eq!(t.downloaded_bytes(), 0);
    }

    #[test]
    fn test_cancel_pending_fails_immediately() {
        let t = task();
        t.cancel();
        assert_eq!(t.state(), DownloadState::Failed);
        assert_eq!(t.error().unwrap().message, "cancelled");
        assert!(t.signal().is_cancelled());
    }

    #[test]
    fn test_cancel_paused_removes_partial_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let request = DownloadRequest::new("https://cdn.example/a.bin", tmp.path().join("a.bin"));
        let part = part_path(&request);
        std::fs::write(&part, b"half").unwrap();

        let t = DownloadTask::new(3, request, TransferSignal::new(), None);
        t.set_state(DownloadState::Downloading);
        t.set_state(DownloadState::Paused);
        t.cancel();
        assert_eq!(t.state(), DownloadState::Failed);
        assert!(!part.exists());
    }

    #[test]
    fn test_pause_and_resume_pending() {
        let t = task();
        t.pause();
        assert_eq!(t.state(), DownloadState::Paused);
        t.resume();
        assert_eq!(t.state(), DownloadState::Pending);
        assert!(t.signal().checkpoint().is_ok());
    }

    #[test]
    fn test_progress_callback() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let t = DownloadTask::new(
            1,
            DownloadRequest::new("https://cdn.example/a.bin", "/tmp/a.bin"),
            TransferSignal::new(),
            Some(Arc::new(move |done: u64, total: Option<u64>| {
                assert_eq!(done, 3);
                assert_eq!(total, None);
                seen.fetch_add(1, Ordering::SeqCst);
            })),
        );
        t.update_progress(3);
        t.notify_progress();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_outcome_snapshot() {
        let t = task();
        t.set_state(DownloadState::Connecting);
        t.set_http_status(200);
        t.set_successful_url(0);
        t.update_progress(10);
        t.set_state(DownloadState::Completed);

        let outcome = t.outcome();
        assert!(outcome.completed());
        assert_eq!(outcome.http_status, Some(200));
        assert_eq!(outcome.successful_url_index, Some(0));
        assert_eq!(outcome.progress.downloaded_bytes, 10);
    }
}
