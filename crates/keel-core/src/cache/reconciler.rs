//! Diff engine between a manifest, the cache database and the filesystem.
//!
//! Planning is synchronous: each manifest entry is stat'ed (and hashed under
//! [`Strategy::Hash`]) in turn. The write side (`track`, `stamp`, `forget`)
//! goes straight to the database so later lookups see it immediately.

use super::archive::ArchiveCache;
use super::database::CacheDatabase;
use super::types::{
    file_mtime, CachedFile, ComponentKind, FileState, ReconcileAction, ReconcileItem,
    ReconcileSummary, Strategy,
};
use crate::error::{KeelError, Result};
use crate::hashing::{compute_blake3, hashes_match};
use crate::layout::{cache_key, key_to_path, PathResolver};
use crate::manifest::{ContentHash, Manifest, ManifestArchive, ManifestFile};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Progress callback: `(entries_done, entries_total)`.
pub type ProgressCallback = Arc<dyn Fn(usize, usize) + Send + Sync>;

/// What a file on disk is expected to look like.
#[derive(Debug, Clone, Copy)]
struct Expectation<'a> {
    size: u64,
    /// Manifest digest, or the tracked digest when auditing.
    hash: &'a str,
}

/// Plans and records the local state of an installation.
#[derive(Clone)]
pub struct Reconciler {
    root: PathBuf,
    db: CacheDatabase,
    archives: Arc<ArchiveCache>,
    layout: Arc<dyn PathResolver>,
    strategy: Strategy,
    auto_prune: bool,
    progress: Option<ProgressCallback>,
}

impl Reconciler {
    pub fn new(
        root: impl Into<PathBuf>,
        db: CacheDatabase,
        archives: Arc<ArchiveCache>,
        layout: Arc<dyn PathResolver>,
    ) -> Self {
        Self {
            root: root.into(),
            db,
            archives,
            layout,
            strategy: Strategy::default(),
            auto_prune: true,
            progress: None,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn database(&self) -> &CacheDatabase {
        &self.db
    }

    pub fn archive_cache(&self) -> &Arc<ArchiveCache> {
        &self.archives
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn set_strategy(&mut self, strategy: Strategy) {
        self.strategy = strategy;
    }

    pub fn auto_prune(&self) -> bool {
        self.auto_prune
    }

    pub fn set_auto_prune(&mut self, enabled: bool) {
        self.auto_prune = enabled;
    }

    pub fn set_progress(&mut self, callback: Option<ProgressCallback>) {
        self.progress = callback;
    }

    fn report(&self, done: usize, total: usize) {
        if let Some(progress) = &self.progress {
            progress(done, total);
        }
    }

    // Versions

    /// Whether the stamped version of `component` differs from `tag`.
    ///
    /// Metadata only: never touches the filesystem.
    pub fn outdated(&self, component: ComponentKind, tag: &str) -> Result<bool> {
        Ok(match self.db.version(component)? {
            Some(v) => v.tag != tag,
            None => true,
        })
    }

    pub fn version(&self, component: ComponentKind) -> Result<Option<String>> {
        Ok(self.db.version(component)?.map(|v| v.tag))
    }

    // Inspection

    /// State of `path` according to its cache row, if any.
    pub fn stat(&self, path: &Path) -> Result<FileState> {
        match self.db.find(&self.key(path))? {
            Some(entry) => Ok(self.stat_entry(path, &entry)),
            None if path.is_file() => Ok(FileState::Unknown),
            None => Ok(FileState::Missing),
        }
    }

    /// State of `path` judged against its own cache row.
    pub fn stat_entry(&self, path: &Path, entry: &CachedFile) -> FileState {
        self.evaluate(
            path,
            Some(entry),
            Expectation {
                size: entry.size,
                hash: &entry.hash,
            },
        )
    }

    /// Whether `path` still matches `entry` under the active strategy.
    pub fn matches(&self, path: &Path, entry: &CachedFile) -> bool {
        self.stat_entry(path, entry) == FileState::Valid
    }

    fn evaluate(
        &self,
        path: &Path,
        entry: Option<&CachedFile>,
        expected: Expectation<'_>,
    ) -> FileState {
        let meta = match std::fs::metadata(path) {
            Ok(meta) if meta.is_file() => meta,
            _ => return FileState::Missing,
        };
        let Some(entry) = entry else {
            return FileState::Unknown;
        };

        // A tracked digest that disagrees with the wanted one means the
        // file belongs to another release, whatever the disk says.
        if !entry.hash.is_empty()
            && !expected.hash.is_empty()
            && !hashes_match(&entry.hash, expected.hash)
        {
            return FileState::Stale;
        }

        let mtime_matches = || file_mtime(path) == Some(entry.mtime);
        let valid = match self.strategy {
            Strategy::Mtime => mtime_matches(),
            Strategy::Mixed => mtime_matches() && meta.len() == expected.size,
            Strategy::Hash => {
                let digest = if expected.hash.is_empty() {
                    entry.hash.as_str()
                } else {
                    expected.hash
                };
                meta.len() == expected.size
                    && if digest.is_empty() {
                        mtime_matches()
                    } else {
                        content_matches(path, digest)
                    }
            }
        };

        if valid {
            FileState::Valid
        } else {
            FileState::Stale
        }
    }

    /// Stat every tracked file of `component`.
    pub fn audit(&self, component: ComponentKind) -> Result<Vec<(CachedFile, FileState)>> {
        let rows = self.db.files(Some(component))?;
        let total = rows.len();
        let mut out = Vec::with_capacity(total);

        for (i, row) in rows.into_iter().enumerate() {
            let path = key_to_path(&self.root, &row.path);
            let state = self.stat_entry(&path, &row);
            if state != FileState::Valid {
                debug!("Audit {}: {} is {:?}", component, row.path, state);
            }
            out.push((row, state));
            self.report(i + 1, total);
        }

        Ok(out)
    }

    // Planning

    /// Compare `manifest` with local state and list the work needed.
    pub fn plan(
        &self,
        manifest: &Manifest,
        component: ComponentKind,
        version: &str,
    ) -> Result<Vec<ReconcileItem>> {
        warn_on_conflicts(&self.root, self.layout.as_ref(), manifest);

        let mut items = self.plan_archives(&manifest.archives, component, version)?;
        items.extend(self.plan_files(&manifest.files, component, version)?);

        let summary = ReconcileSummary::from_items(&items);
        info!(
            "Planned {} {}: {} valid, {} stale, {} missing, {} unknown, {} downloads ({} bytes)",
            component,
            version,
            summary.files_valid,
            summary.files_stale,
            summary.files_missing,
            summary.files_unknown,
            summary.downloads_required,
            summary.bytes_to_download
        );
        Ok(items)
    }

    /// Plan archive downloads and pending extractions.
    ///
    /// An archive whose recorded extraction still verifies needs nothing,
    /// even when the archive file itself is gone. An archive present on disk
    /// without a usable extraction record gets a `verify` item (extract
    /// locally); otherwise it is downloaded.
    pub fn plan_archives(
        &self,
        archives: &[ManifestArchive],
        component: ComponentKind,
        version: &str,
    ) -> Result<Vec<ReconcileItem>> {
        let total = archives.len();
        let mut items = Vec::with_capacity(total);

        for (i, archive) in archives.iter().enumerate() {
            let path = self.resolve_archive(archive);
            let extracted = self.extraction_verified(archive);

            let (state, action) = if extracted {
                (FileState::Valid, ReconcileAction::None)
            } else if self.archive_file_matches(&path, archive) {
                (FileState::Stale, ReconcileAction::Verify)
            } else if path.exists() {
                (FileState::Stale, ReconcileAction::Download)
            } else {
                (FileState::Missing, ReconcileAction::Download)
            };

            if action == ReconcileAction::Download && archive.url.is_empty() {
                warn!("Archive {} has no download URL", archive.name);
            }

            items.push(ReconcileItem {
                action,
                state,
                path: self.key(&path),
                url: archive.url.clone(),
                expected_hash: archive.hash.value.clone(),
                expected_size: archive.size,
                component,
                version: version.to_string(),
                archive: Some(archive.name.clone()),
            });
            self.report(i + 1, total);
        }

        Ok(items)
    }

    /// Plan loose files. Archive members are covered by their archive.
    pub fn plan_files(
        &self,
        files: &[ManifestFile],
        component: ComponentKind,
        version: &str,
    ) -> Result<Vec<ReconcileItem>> {
        let loose: Vec<&ManifestFile> = files.iter().filter(|f| !f.is_archive_member()).collect();
        let total = loose.len();
        let mut items = Vec::with_capacity(total);

        for (i, file) in loose.into_iter().enumerate() {
            let path = self.resolve_file(file);
            let key = self.key(&path);
            let entry = self.db.find(&key)?;
            let state = self.evaluate(
                &path,
                entry.as_ref(),
                Expectation {
                    size: file.size,
                    hash: verifiable_digest(&file.hash),
                },
            );

            let action = match state {
                FileState::Valid => ReconcileAction::None,
                _ if file.asset_name.is_some() || file.url.is_some() => ReconcileAction::Download,
                _ => ReconcileAction::Verify,
            };

            items.push(ReconcileItem {
                action,
                state,
                path: key,
                url: file.url.clone().unwrap_or_default(),
                expected_hash: file.hash.value.clone(),
                expected_size: file.size,
                component,
                version: version.to_string(),
                archive: None,
            });
            self.report(i + 1, total);
        }

        Ok(items)
    }

    pub fn summarize(&self, items: &[ReconcileItem]) -> ReconcileSummary {
        ReconcileSummary::from_items(items)
    }

    fn extraction_verified(&self, archive: &ManifestArchive) -> bool {
        match self.archives.find(&archive.name, &archive.hash.value) {
            Some(entry) => ArchiveCache::verify_entry(&entry, &self.root),
            None => false,
        }
    }

    fn archive_file_matches(&self, path: &Path, archive: &ManifestArchive) -> bool {
        let size = match std::fs::metadata(path) {
            Ok(meta) if meta.is_file() => meta.len(),
            _ => return false,
        };
        if size != archive.size {
            return false;
        }
        match self.strategy {
            Strategy::Hash if archive.hash.is_verifiable() => {
                content_matches(path, &archive.hash.value)
            }
            _ => true,
        }
    }

    // Manifest inventory

    /// Loose files absent from disk or with the wrong size (and, when
    /// `verify_hashes` is set, the wrong content).
    pub fn missing_files(&self, manifest: &Manifest, verify_hashes: bool) -> Vec<ManifestFile> {
        manifest
            .loose_files()
            .filter(|file| {
                let path = self.resolve_file(file);
                let size_ok = std::fs::metadata(&path)
                    .map(|m| m.is_file() && m.len() == file.size)
                    .unwrap_or(false);
                if !size_ok {
                    return true;
                }
                verify_hashes
                    && file.hash.is_verifiable()
                    && !content_matches(&path, &file.hash.value)
            })
            .cloned()
            .collect()
    }

    /// Archives that must be downloaded: no verifying extraction record and
    /// no correctly sized archive file on disk.
    pub fn missing_archives(&self, manifest: &Manifest) -> Vec<ManifestArchive> {
        manifest
            .archives
            .iter()
            .filter(|archive| {
                !self.extraction_verified(archive)
                    && !self.archive_file_matches(&self.resolve_archive(archive), archive)
            })
            .cloned()
            .collect()
    }

    /// Bytes that would be fetched to complete `manifest`.
    pub fn download_size(&self, manifest: &Manifest) -> u64 {
        let files: u64 = self.missing_files(manifest, false).iter().map(|f| f.size).sum();
        let archives: u64 = self.missing_archives(manifest).iter().map(|a| a.size).sum();
        files + archives
    }

    // Write side

    /// Record the current on-disk state of `path`.
    pub fn track(
        &self,
        path: &Path,
        component: ComponentKind,
        version: &str,
        hash: &str,
    ) -> Result<CachedFile> {
        let row = self.snapshot(path, component, version, hash)?;
        self.db.store(&row)?;
        Ok(row)
    }

    /// Record many files in a single transaction.
    pub fn track_batch(
        &self,
        files: &[(PathBuf, String)],
        component: ComponentKind,
        version: &str,
    ) -> Result<usize> {
        let rows = files
            .iter()
            .map(|(path, hash)| self.snapshot(path, component, version, hash))
            .collect::<Result<Vec<_>>>()?;
        self.db.store_batch(&rows)
    }

    fn snapshot(
        &self,
        path: &Path,
        component: ComponentKind,
        version: &str,
        hash: &str,
    ) -> Result<CachedFile> {
        let meta = std::fs::metadata(path).map_err(|e| KeelError::io_with_path(e, path))?;
        let mtime = file_mtime(path).ok_or_else(|| KeelError::Io {
            message: "modification time unavailable".into(),
            path: Some(path.to_path_buf()),
            source: None,
        })?;

        Ok(CachedFile {
            path: self.key(path),
            mtime,
            version: version.to_string(),
            component,
            size: meta.len(),
            hash: hash.to_lowercase(),
        })
    }

    /// Mark `component` as fully synced at `tag`.
    pub fn stamp(&self, component: ComponentKind, tag: &str) -> Result<()> {
        self.db.set_version(component, tag)?;
        info!("Stamped {} at {}", component, tag);
        Ok(())
    }

    /// Stop tracking `path`. The file itself is left alone.
    pub fn forget(&self, path: &Path) -> Result<bool> {
        self.db.erase(&self.key(path))
    }

    /// Drop cache rows of `component` that `manifest` no longer lists.
    ///
    /// Returns the removed keys. Files are deleted from disk only when
    /// `delete_files` is set.
    pub fn clean(
        &self,
        manifest: &Manifest,
        component: ComponentKind,
        delete_files: bool,
    ) -> Result<Vec<String>> {
        let wanted = self.manifest_keys(manifest);
        let orphans: Vec<String> = self
            .db
            .files(Some(component))?
            .into_iter()
            .map(|row| row.path)
            .filter(|key| !wanted.contains(key))
            .collect();

        if orphans.is_empty() {
            return Ok(orphans);
        }

        self.db.erase_batch(&orphans)?;

        if delete_files {
            for key in &orphans {
                let path = key_to_path(&self.root, key);
                match std::fs::remove_file(&path) {
                    Ok(()) => debug!("Removed orphaned file {}", path.display()),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
                }
            }
        }

        info!("Pruned {} orphaned {} entries", orphans.len(), component);
        Ok(orphans)
    }

    fn manifest_keys(&self, manifest: &Manifest) -> HashSet<String> {
        let mut keys = HashSet::new();
        for file in &manifest.files {
            keys.insert(self.key(&self.resolve_file(file)));
        }
        for archive in &manifest.archives {
            keys.insert(self.key(&self.resolve_archive(archive)));
            for file in &archive.files {
                keys.insert(self.key(&self.resolve_file(file)));
            }
            if let Some(entry) = self.archives.find(&archive.name, &archive.hash.value) {
                keys.extend(entry.files.into_iter().map(|f| f.path));
            }
        }
        keys
    }

    // Paths

    pub fn resolve_file(&self, file: &ManifestFile) -> PathBuf {
        self.layout.resolve_file(&self.root, file)
    }

    pub fn resolve_archive(&self, archive: &ManifestArchive) -> PathBuf {
        self.layout.resolve_archive(&self.root, archive)
    }

    /// Cache key of an absolute or root-relative path.
    pub fn key(&self, path: &Path) -> String {
        cache_key(&self.root, path)
    }
}

fn verifiable_digest(hash: &ContentHash) -> &str {
    if hash.is_verifiable() {
        &hash.value
    } else {
        ""
    }
}

fn content_matches(path: &Path, expected: &str) -> bool {
    match compute_blake3(path) {
        Ok(actual) => hashes_match(&actual, expected),
        Err(e) => {
            warn!("Failed to hash {}: {}", path.display(), e);
            false
        }
    }
}

/// Log manifest entries that resolve to one path with different digests.
fn warn_on_conflicts(root: &Path, layout: &dyn PathResolver, manifest: &Manifest) {
    let mut seen: HashMap<PathBuf, &str> = HashMap::new();
    for file in manifest.loose_files() {
        let path = layout.resolve_file(root, file);
        if let Some(previous) = seen.insert(path.clone(), &file.hash.value) {
            if !previous.eq_ignore_ascii_case(&file.hash.value) {
                warn!(
                    "Manifest lists {} more than once with different hashes",
                    path.display()
                );
            }
        }
    }
}
