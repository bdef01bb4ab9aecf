//! Local state tracking.
//!
//! This module provides:
//! - `CacheDatabase`: SQLite store of tracked files and component versions
//! - `ArchiveCache`: JSON record of completed archive extractions
//! - `Reconciler`: the manifest/cache/filesystem diff engine

pub mod archive;
mod database;
mod reconciler;
mod types;

pub use archive::{ArchiveCache, ArchiveCacheEntry, CorruptCacheWarning, ExtractedFile};
pub use database::{CacheDatabase, CacheTransaction};
pub use reconciler::{ProgressCallback, Reconciler};
pub use types::{
    current_timestamp, file_mtime, CachedFile, ComponentKind, ComponentVersion, FileState,
    ReconcileAction, ReconcileItem, ReconcileSummary, Strategy,
};
