//! Keel Core - local state reconciliation and sync engine for game content.
//!
//! Given a release manifest, the engine works out which files of an
//! installation are current, downloads what is missing or stale, unpacks
//! archives, and records what landed so the next run can skip it. The
//! crate has no UI or release-discovery layer; callers supply manifests and
//! URLs.
//!
//! # Example
//!
//! ```rust,ignore
//! use keel_core::{CacheCoordinator, ComponentKind, GameLayout, Manifest, SyncOptions};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> keel_core::Result<()> {
//!     let coordinator = CacheCoordinator::open_http(
//!         "/games/mw2",
//!         SyncOptions::default(),
//!         Arc::new(GameLayout),
//!     )?;
//!
//!     let manifest = Manifest::load("release.json".as_ref())?;
//!     let result = coordinator
//!         .smart_sync(&manifest, ComponentKind::Client, "r4432")
//!         .await?;
//!     println!("{:?}: {:?}", result.status, result.summary);
//!
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod cancel;
pub mod config;
pub mod coordinator;
pub mod download;
pub mod error;
pub mod extract;
pub mod hashing;
pub mod layout;
pub mod manifest;
pub mod metadata;

// Re-export commonly used types
pub use cache::{
    ArchiveCache, ArchiveCacheEntry, CacheDatabase, CachedFile, ComponentKind, FileState,
    ReconcileAction, ReconcileItem, ReconcileSummary, Reconciler, Strategy,
};
pub use cancel::{CancellationToken, TransferSignal};
pub use config::SyncOptions;
pub use coordinator::{CacheCoordinator, CacheResult, CacheStatus, SyncFailure};
pub use download::{
    DownloadOrchestrator, DownloadRequest, DownloadState, ExecutionReport, HttpTransport,
    Transport,
};
pub use error::{KeelError, Result};
pub use extract::extract_archive;
pub use layout::{FlatLayout, GameLayout, PathResolver};
pub use manifest::{CompressionKind, ContentHash, Manifest, ManifestArchive, ManifestFile};
