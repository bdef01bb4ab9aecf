//! Download request, state and result types.

use crate::config::NetworkConfig;
use crate::error::{KeelError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Lifecycle of a download task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum DownloadState {
    Pending = 0,
    Connecting = 1,
    Downloading = 2,
    Verifying = 3,
    Completed = 4,
    Failed = 5,
    Paused = 6,
}

impl DownloadState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => DownloadState::Connecting,
            2 => DownloadState::Downloading,
            3 => DownloadState::Verifying,
            4 => DownloadState::Completed,
            5 => DownloadState::Failed,
            6 => DownloadState::Paused,
            _ => DownloadState::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DownloadState::Completed | DownloadState::Failed)
    }

    /// A transfer is on the wire or being verified.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            DownloadState::Connecting | DownloadState::Downloading | DownloadState::Verifying
        )
    }
}

/// Scheduling order; higher runs first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Post-download content check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationMethod {
    #[default]
    None,
    Blake3,
    Sha256,
}

/// Everything needed to fetch one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    /// Candidate URLs, tried in order.
    pub urls: Vec<String>,
    pub target: PathBuf,
    pub expected_size: Option<u64>,
    pub verification_method: VerificationMethod,
    pub verification_value: String,
    pub priority: Priority,
    /// Continue an existing `.part` file with a ranged request.
    pub resume: bool,
    pub rate_limit_bytes_per_second: Option<u64>,
    pub connect_timeout: Duration,
    /// Fail the attempt when no data arrives for this long.
    pub transfer_timeout: Duration,
    pub name: String,
    pub description: String,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>, target: impl Into<PathBuf>) -> Self {
        let target = target.into();
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            urls: vec![url.into()],
            target,
            expected_size: None,
            verification_method: VerificationMethod::None,
            verification_value: String::new(),
            priority: Priority::Normal,
            resume: true,
            rate_limit_bytes_per_second: None,
            connect_timeout: NetworkConfig::CONNECT_TIMEOUT,
            transfer_timeout: NetworkConfig::TRANSFER_TIMEOUT,
            name,
            description: String::new(),
        }
    }

    pub fn with_mirror(mut self, url: impl Into<String>) -> Self {
        self.urls.push(url.into());
        self
    }

    pub fn with_expected_size(mut self, size: u64) -> Self {
        self.expected_size = Some(size);
        self
    }

    pub fn with_verification(
        mut self,
        method: VerificationMethod,
        value: impl Into<String>,
    ) -> Self {
        self.verification_method = method;
        self.verification_value = value.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    pub fn with_rate_limit(mut self, bytes_per_second: u64) -> Self {
        self.rate_limit_bytes_per_second = Some(bytes_per_second);
        self
    }

    pub fn with_timeouts(mut self, connect: Duration, transfer: Duration) -> Self {
        self.connect_timeout = connect;
        self.transfer_timeout = transfer;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Reject requests that cannot possibly succeed.
    pub fn validate(&self) -> Result<()> {
        if self.urls.is_empty() || self.urls.iter().any(|u| u.trim().is_empty()) {
            return Err(KeelError::Validation {
                field: "urls".into(),
                message: format!("no usable URL for {}", self.target.display()),
            });
        }
        if self.target.as_os_str().is_empty() {
            return Err(KeelError::Validation {
                field: "target".into(),
                message: "empty target path".into(),
            });
        }
        if self.verification_method != VerificationMethod::None
            && self.verification_value.is_empty()
        {
            return Err(KeelError::Validation {
                field: "verification_value".into(),
                message: format!(
                    "{:?} verification requested without a digest",
                    self.verification_method
                ),
            });
        }
        if self.rate_limit_bytes_per_second == Some(0) {
            return Err(KeelError::Validation {
                field: "rate_limit_bytes_per_second".into(),
                message: "rate limit must be positive".into(),
            });
        }
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }
}

/// Progress snapshot of one task or of a whole batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DownloadProgress {
    pub downloaded_bytes: u64,
    /// Total bytes, if known.
    pub total_bytes: Option<u64>,
    pub speed_bytes_per_sec: f64,
    /// Percentage complete (0-100).
    pub percent: Option<f64>,
}

impl DownloadProgress {
    pub fn new(downloaded_bytes: u64, total_bytes: Option<u64>, speed: f64) -> Self {
        let percent = total_bytes.map(|total| {
            if total > 0 {
                (downloaded_bytes as f64 / total as f64 * 100.0).min(100.0)
            } else {
                0.0
            }
        });
        Self {
            downloaded_bytes,
            total_bytes,
            speed_bytes_per_sec: speed,
            percent,
        }
    }

    /// Estimated seconds remaining at the current speed.
    pub fn eta_seconds(&self) -> Option<f64> {
        let total = self.total_bytes?;
        if self.speed_bytes_per_sec > 0.0 && self.downloaded_bytes < total {
            Some((total - self.downloaded_bytes) as f64 / self.speed_bytes_per_sec)
        } else {
            None
        }
    }
}

/// Why a task failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadError {
    pub message: String,
    /// URL of the last attempt, if any was made.
    pub url: String,
    /// HTTP status of the last attempt, if a response arrived.
    pub code: Option<u16>,
    /// The bytes arrived but failed verification.
    pub verification: bool,
}

impl std::fmt::Display for DownloadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.url.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{} ({})", self.message, self.url)
        }
    }
}

/// Final report for one task.
#[derive(Debug, Clone)]
pub struct DownloadOutcome {
    pub id: u64,
    pub name: String,
    pub target: PathBuf,
    pub state: DownloadState,
    pub progress: DownloadProgress,
    pub error: Option<DownloadError>,
    /// Index into the request's URLs that delivered the file.
    pub successful_url_index: Option<usize>,
    pub http_status: Option<u16>,
    pub duration: Duration,
}

impl DownloadOutcome {
    pub fn completed(&self) -> bool {
        self.state == DownloadState::Completed
    }

    pub fn failed(&self) -> bool {
        self.state == DownloadState::Failed
    }

    pub fn average_speed_bps(&self) -> u64 {
        let millis = self.duration.as_millis() as u64;
        if millis == 0 {
            0
        } else {
            self.progress.downloaded_bytes * 1000 / millis
        }
    }
}

/// Result of one `execute_all` pass.
#[derive(Debug, Clone, Default)]
pub struct ExecutionReport {
    pub completed: usize,
    pub failed: usize,
    /// Tasks that stopped because they were paused.
    pub paused: usize,
    pub outcomes: Vec<DownloadOutcome>,
}

impl ExecutionReport {
    pub fn all_completed(&self) -> bool {
        self.failed == 0 && self.paused == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_roundtrip_through_u8() {
        for state in [
            DownloadState::Pending,
            DownloadState::Connecting,
            DownloadState::Downloading,
            DownloadState::Verifying,
            DownloadState::Completed,
            DownloadState::Failed,
            DownloadState::Paused,
        ] {
            assert_eq!(DownloadState::from_u8(state as u8), state);
        }
    }

    #[test]
    fn test_priority_order() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
    }

    #[test]
    fn test_request_defaults() {
        let req = DownloadRequest::new("https://cdn.example/a.bin", "/tmp/a.bin");
        assert!(req.resume);
        assert_eq!(req.name, "a.bin");
        assert_eq!(req.connect_timeout, Duration::from_secs(30));
        assert_eq!(req.transfer_timeout, Duration::from_secs(300));
        assert!(req.is_valid());
    }

    #[test]
    fn test_request_validation() {
        let mut req = DownloadRequest::new("", "/tmp/a.bin");
        assert!(!req.is_valid());

        req.urls = vec!["https://cdn.example/a.bin".into()];
        req.verification_method = VerificationMethod::Blake3;
        assert!(matches!(
            req.validate(),
            Err(KeelError::Validation { field, .. }) if field == "verification_value"
        ));

        req.verification_value = "abc".into();
        assert!(req.is_valid());
        assert!(!req.with_rate_limit(0).is_valid());
    }

    #[test]
    fn test_progress_percent_and_eta() {
        let p = DownloadProgress::new(50, Some(200), 25.0);
        assert_eq!(p.percent, Some(25.0));
        assert_eq!(p.eta_seconds(), Some(6.0));

        let unknown = DownloadProgress::new(50, None, 25.0);
        assert!(unknown.percent.is_none());
        assert!(unknown.eta_seconds().is_none());
    }

    #[test]
    fn test_average_speed() {
        let outcome = DownloadOutcome {
            id: 1,
            name: "a".into(),
            target: PathBuf::from("a"),
            state: DownloadState::Completed,
            progress: DownloadProgress::new(4000, Some(4000), 0.0),
            error: None,
            successful_url_index: Some(0),
            http_status: Some(200),
            duration: Duration::from_secs(2),
        };
        assert_eq!(outcome.average_speed_bps(), 2000);
        assert!(outcome.completed());
    }
}
