//! Types shared by the cache database, the reconciler and the coordinator.

use crate::error::{KeelError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::UNIX_EPOCH;

/// A named group of files with its own version tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentKind {
    Client,
    Rawfiles,
    Dlc,
    Helper,
    Launcher,
}

impl ComponentKind {
    pub const ALL: [ComponentKind; 5] = [
        ComponentKind::Client,
        ComponentKind::Rawfiles,
        ComponentKind::Dlc,
        ComponentKind::Helper,
        ComponentKind::Launcher,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentKind::Client => "client",
            ComponentKind::Rawfiles => "rawfiles",
            ComponentKind::Dlc => "dlc",
            ComponentKind::Helper => "helper",
            ComponentKind::Launcher => "launcher",
        }
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ComponentKind {
    type Err = KeelError;

    fn from_str(s: &str) -> Result<Self> {
        ComponentKind::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| KeelError::Validation {
                field: "component".into(),
                message: format!("unknown component: {}", s),
            })
    }
}

/// How much evidence is required before a tracked file is trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Modification time only.
    #[default]
    Mtime,
    /// Modification time and size.
    Mixed,
    /// Size and content hash. Modification time is consulted only when
    /// no digest is known.
    Hash,
}

/// Result of comparing one path against its expectations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileState {
    Valid,
    Stale,
    Missing,
    /// Present on disk but not tracked.
    Unknown,
}

/// What the coordinator should do about one manifest entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconcileAction {
    None,
    Download,
    /// Needs attention but has no source to fetch from.
    Verify,
    Remove,
}

/// One tracked file (a `cached_files` row).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedFile {
    /// Install-root-relative path with `/` separators.
    pub path: String,
    pub mtime: i64,
    pub version: String,
    pub component: ComponentKind,
    pub size: u64,
    pub hash: String,
}

/// The installed version tag of a component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentVersion {
    pub component: ComponentKind,
    pub tag: String,
    /// Unix seconds.
    pub installed_at: i64,
}

/// A unit of work produced by planning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileItem {
    pub action: ReconcileAction,
    /// Observed state of the target when planned.
    pub state: FileState,
    /// Install-root-relative key.
    pub path: String,
    pub url: String,
    pub expected_hash: String,
    pub expected_size: u64,
    pub component: ComponentKind,
    pub version: String,
    /// Set when the item is an archive download.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive: Option<String>,
}

impl ReconcileItem {
    pub fn needs_download(&self) -> bool {
        self.action == ReconcileAction::Download
    }
}

/// Aggregate counts over a plan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileSummary {
    pub files_valid: usize,
    pub files_stale: usize,
    pub files_missing: usize,
    pub files_unknown: usize,
    pub downloads_required: usize,
    /// Items with no source that must be confirmed locally.
    pub verifications_required: usize,
    pub bytes_to_download: u64,
}

impl ReconcileSummary {
    pub fn up_to_date(&self) -> bool {
        self.downloads_required == 0
            && self.verifications_required == 0
            && self.files_stale == 0
            && self.files_missing == 0
    }

    /// Reduce a plan to counts.
    pub fn from_items(items: &[ReconcileItem]) -> Self {
        let mut summary = Self::default();
        for item in items {
            match item.state {
                FileState::Valid => summary.files_valid += 1,
                FileState::Stale => summary.files_stale += 1,
                FileState::Missing => summary.files_missing += 1,
                FileState::Unknown => summary.files_unknown += 1,
            }
            match item.action {
                ReconcileAction::Download => {
                    summary.downloads_required += 1;
                    summary.bytes_to_download += item.expected_size;
                }
                ReconcileAction::Verify => summary.verifications_required += 1,
                ReconcileAction::None | ReconcileAction::Remove => {}
            }
        }
        summary
    }

    pub fn merge(&mut self, other: &ReconcileSummary) {
        self.files_valid += other.files_valid;
        self.files_stale += other.files_stale;
        self.files_missing += other.files_missing;
        self.files_unknown += other.files_unknown;
        self.downloads_required += other.downloads_required;
        self.verifications_required += other.verifications_required;
        self.bytes_to_download += other.bytes_to_download;
    }
}

/// Modification time of `path` in nanoseconds since the Unix epoch, or
/// `None` if the file is absent or the platform cannot report it.
pub fn file_mtime(path: &Path) -> Option<i64> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    let nanos = match modified.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_nanos() as i64,
        Err(e) => -(e.duration().as_nanos() as i64),
    };
    Some(nanos)
}

/// Current time in Unix seconds.
pub fn current_timestamp() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(state: FileState, action: ReconcileAction, size: u64) -> ReconcileItem {
        ReconcileItem {
            action,
            state,
            path: "a".into(),
            url: String::new(),
            expected_hash: String::new(),
            expected_size: size,
            component: ComponentKind::Client,
            version: "v1".into(),
            archive: None,
        }
    }

    #[test]
    fn test_summary_counts() {
        let items = vec![
            item(FileState::Valid, ReconcileAction::None, 5),
            item(FileState::Missing, ReconcileAction::Download, 10),
            item(FileState::Stale, ReconcileAction::Download, 20),
            item(FileState::Unknown, ReconcileAction::Verify, 40),
        ];
        let summary = ReconcileSummary::from_items(&items);
        assert_eq!(summary.files_valid, 1);
        assert_eq!(summary.files_missing, 1);
        assert_eq!(summary.files_stale, 1);
        assert_eq!(summary.files_unknown, 1);
        assert_eq!(summary.downloads_required, 2);
        assert_eq!(summary.verifications_required, 1);
        assert_eq!(summary.bytes_to_download, 30);
        assert!(!summary.up_to_date());
    }

    #[test]
    fn test_empty_summary_is_up_to_date() {
        assert!(ReconcileSummary::from_items(&[]).up_to_date());
        let untracked_valid = [item(FileState::Unknown, ReconcileAction::None, 1)];
        assert!(ReconcileSummary::from_items(&untracked_valid).up_to_date());
        let unverified = [item(FileState::Unknown, ReconcileAction::Verify, 1)];
        assert!(!ReconcileSummary::from_items(&unverified).up_to_date());
    }

    #[test]
    fn test_component_parse() {
        assert_eq!("DLC".parse::<ComponentKind>().unwrap(), ComponentKind::Dlc);
        assert!("engine".parse::<ComponentKind>().is_err());
        for c in ComponentKind::ALL {
            assert_eq!(c.as_str().parse::<ComponentKind>().unwrap(), c);
        }
    }

    #[test]
    fn test_strategy_serde_names() {
        assert_eq!(serde_json::to_string(&Strategy::Mixed).unwrap(), "\"mixed\"");
        let s: Strategy = serde_json::from_str("\"hash\"").unwrap();
        assert_eq!(s, Strategy::Hash);
    }

    #[test]
    fn test_file_mtime_missing() {
        assert!(file_mtime(Path::new("/nonexistent/keel/file")).is_none());
    }
}
