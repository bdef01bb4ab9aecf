//! Archive extraction cache.
//!
//! Remembers which files each archive produced so an archive whose extracted
//! files all still verify on disk can be skipped without downloading it
//! again. Persisted as one JSON document that is rewritten on every save.
//! Losing this file only costs work: a load failure yields an empty cache.

use crate::config::PathsConfig;
use crate::error::Result;
use crate::hashing::file_matches_blake3;
use crate::layout::key_to_path;
use crate::metadata::{atomic_read_json, atomic_write_json};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};
use thiserror::Error;
use tracing::{debug, warn};

/// One file produced by extracting an archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedFile {
    /// Install-root-relative key.
    pub path: String,
    /// BLAKE3 hex digest; empty when unknown.
    #[serde(default)]
    pub hash: String,
    pub size: u64,
}

/// Record of a completed extraction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveCacheEntry {
    pub archive_name: String,
    pub archive_hash: String,
    pub archive_size: u64,
    #[serde(default)]
    pub files: Vec<ExtractedFile>,
    /// Unix seconds; filled in on `add` when zero.
    #[serde(default)]
    pub timestamp: i64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ArchiveCacheDocument {
    #[serde(default)]
    entries: Vec<ArchiveCacheEntry>,
}

/// The archive cache file existed but could not be used.
#[derive(Debug, Error)]
#[error("archive cache at {path:?} is unusable: {reason}")]
pub struct CorruptCacheWarning {
    pub path: PathBuf,
    pub reason: String,
}

/// In-memory view of the archive cache document.
#[derive(Debug)]
pub struct ArchiveCache {
    path: PathBuf,
    entries: RwLock<Vec<ArchiveCacheEntry>>,
    dirty: AtomicBool,
}

impl ArchiveCache {
    /// An empty cache that will be saved to `path`.
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: RwLock::new(Vec::new()),
            dirty: AtomicBool::new(false),
        }
    }

    /// Load the document at `path`. A missing file is an empty cache.
    pub fn load(path: impl Into<PathBuf>) -> std::result::Result<Self, CorruptCacheWarning> {
        let path = path.into();
        match atomic_read_json::<ArchiveCacheDocument>(&path) {
            Ok(Some(doc)) => {
                debug!(
                    "Loaded {} archive cache entries from {}",
                    doc.entries.len(),
                    path.display()
                );
                Ok(Self {
                    path,
                    entries: RwLock::new(doc.entries),
                    dirty: AtomicBool::new(false),
                })
            }
            Ok(None) => Ok(Self::empty(path)),
            Err(e) => Err(CorruptCacheWarning {
                path,
                reason: e.to_string(),
            }),
        }
    }

    /// Load, degrading to an empty cache when the document is unusable.
    pub fn load_or_default(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        match Self::load(path.clone()) {
            Ok(cache) => cache,
            Err(warning) => {
                warn!("{}; starting with an empty archive cache", warning);
                Self::empty(path)
            }
        }
    }

    /// Load from the default location under an install root.
    pub fn load_in(install_root: &Path, data_dir_name: &str) -> Self {
        Self::load_or_default(
            install_root
                .join(data_dir_name)
                .join(PathsConfig::ARCHIVE_CACHE_FILENAME),
        )
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Overwrite the document with the current entries.
    pub fn save(&self) -> Result<()> {
        let doc = ArchiveCacheDocument {
            entries: self.entries(),
        };
        atomic_write_json(&self.path, &doc)?;
        self.dirty.store(false, Ordering::SeqCst);
        debug!(
            "Saved {} archive cache entries to {}",
            doc.entries.len(),
            self.path.display()
        );
        Ok(())
    }

    /// Entry for `name` whose recorded hash equals `hash` (case-insensitive).
    pub fn find(&self, name: &str, hash: &str) -> Option<ArchiveCacheEntry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|e| e.archive_name == name && e.archive_hash.eq_ignore_ascii_case(hash))
            .cloned()
    }

    /// Insert `entry`, replacing any entry with the same archive name.
    pub fn add(&self, mut entry: ArchiveCacheEntry) {
        if entry.timestamp == 0 {
            entry.timestamp = chrono::Utc::now().timestamp();
        }
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|e| e.archive_name != entry.archive_name);
        entries.push(entry);
        self.dirty.store(true, Ordering::SeqCst);
    }

    pub fn remove(&self, name: &str) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|e| e.archive_name != name);
        let removed = entries.len() < before;
        if removed {
            self.dirty.store(true, Ordering::SeqCst);
        }
        removed
    }

    pub fn clear(&self) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if !entries.is_empty() {
            entries.clear();
            self.dirty.store(true, Ordering::SeqCst);
        }
    }

    pub fn entries(&self) -> Vec<ArchiveCacheEntry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Check every extracted file of `entry` under `install_dir`.
    ///
    /// Stops at the first file that is missing, has the wrong size, or has a
    /// recorded hash that no longer matches. Not memoized.
    pub fn verify_entry(entry: &ArchiveCacheEntry, install_dir: &Path) -> bool {
        entry.files.iter().all(|file| {
            let path = key_to_path(install_dir, &file.path);
            let size = match std::fs::metadata(&path) {
                Ok(meta) if meta.is_file() => meta.len(),
                _ => {
                    debug!("Archive {} member missing: {}", entry.archive_name, file.path);
                    return false;
                }
            };
            if size != file.size {
                debug!(
                    "Archive {} member {} size {} != {}",
                    entry.archive_name, file.path, size, file.size
                );
                return false;
            }
            file.hash.is_empty() || file_matches_blake3(&path, &file.hash)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashing::blake3_bytes;
    use tempfile::TempDir;

    fn entry(name: &str, hash: &str, files: Vec<ExtractedFile>) -> ArchiveCacheEntry {
        ArchiveCacheEntry {
            archive_name: name.into(),
            archive_hash: hash.into(),
            archive_size: 100,
            files,
            timestamp: 0,
        }
    }

    fn write(root: &Path, key: &str, content: &[u8]) -> ExtractedFile {
        let path = key_to_path(root, key);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, content).unwrap();
        ExtractedFile {
            path: key.into(),
            hash: blake3_bytes(content),
            size: content.len() as u64,
        }
    }

    #[test]
    fn test_add_find_replace() {
        let tmp = TempDir::new().unwrap();
        let cache = ArchiveCache::empty(tmp.path().join("archives.json"));

        cache.add(entry("a.zip", "AAAA", vec![]));
        assert!(cache.is_dirty());
        assert!(cache.find("a.zip", "aaaa").is_some());
        assert!(cache.find("a.zip", "bbbb").is_none());
        assert!(cache.find("a.zip", "aaaa").unwrap().timestamp > 0);

        cache.add(entry("a.zip", "bbbb", vec![]));
        assert_eq!(cache.len(), 1);
        assert!(cache.find("a.zip", "bbbb").is_some());

        assert!(cache.remove("a.zip"));
        assert!(!cache.remove("a.zip"));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_save_and_reload() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("archives.json");
        let cache = ArchiveCache::empty(&path);
        cache.add(entry("a.zip", "aa", vec![]));
        cache.add(entry("b.zip", "bb", vec![]));
        cache.save().unwrap();
        assert!(!cache.is_dirty());

        let reloaded = ArchiveCache::load(&path).unwrap();
        assert_eq!(reloaded.len(), 2);
        assert!(reloaded.find("b.zip", "BB").is_some());
    }

    #[test]
    fn test_missing_file_is_empty_cache() {
        let tmp = TempDir::new().unwrap();
        let cache = ArchiveCache::load(tmp.path().join("nope.json")).unwrap();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_corrupt_file_is_warning_then_empty() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("archives.json");
        std::fs::write(&path, "{\"entries\": [oops").unwrap();

        assert!(ArchiveCache::load(&path).is_err());
        let cache = ArchiveCache::load_or_default(&path);
        assert!(cache.is_empty());
        assert_eq!(cache.path(), path.as_path());
    }

    #[test]
    fn test_empty_file_degrades() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("archives.json");
        std::fs::write(&path, "").unwrap();
        assert!(ArchiveCache::load_or_default(&path).is_empty());
    }

    #[test]
    fn test_verify_entry_all_present() {
        let tmp = TempDir::new().unwrap();
        let files = vec![
            write(tmp.path(), "zone/a.ff", b"alpha"),
            write(tmp.path(), "iw4x/b.iwd", b"bravo"),
        ];
        let e = entry("c.zip", "cc", files);
        assert!(ArchiveCache::verify_entry(&e, tmp.path()));
    }

    #[test]
    fn test_verify_entry_single_missing_invalidates() {
        let tmp = TempDir::new().unwrap();
        let mut files = vec![write(tmp.path(), "zone/a.ff", b"alpha")];
        files.push(ExtractedFile {
            path: "zone/gone.ff".into(),
            hash: String::new(),
            size: 3,
        });
        assert!(!ArchiveCache::verify_entry(&entry("c.zip", "cc", files), tmp.path()));
    }

    #[test]
    fn test_verify_entry_size_and_hash() {
        let tmp = TempDir::new().unwrap();
        let mut file = write(tmp.path(), "zone/a.ff", b"alpha");

        file.size = 99;
        assert!(!ArchiveCache::verify_entry(
            &entry("c.zip", "cc", vec![file.clone()]),
            tmp.path()
        ));

        file.size = 5;
        file.hash = blake3_bytes(b"other");
        assert!(!ArchiveCache::verify_entry(
            &entry("c.zip", "cc", vec![file.clone()]),
            tmp.path()
        ));

        file.hash = String::new();
        assert!(ArchiveCache::verify_entry(
            &entry("c.zip", "cc", vec![file]),
            tmp.path()
        ));
    }
}
