//! End-to-end sync scenarios against an in-memory transport.
//!
//! Each test drives `CacheCoordinator` the way a launcher would: plan,
//! download, extract, stamp, then sync again and check that nothing is
//! repeated that did not need repeating.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use keel_core::download::{part_path, DownloadRequest, TransferResponse, VerificationMethod};
use keel_core::hashing::blake3_bytes;
use keel_core::{
    CacheCoordinator, CacheStatus, CancellationToken, ComponentKind, CompressionKind,
    ContentHash, FlatLayout, KeelError, Manifest, ManifestArchive, ManifestFile, ReconcileAction,
    Result, Strategy, SyncOptions, Transport,
};
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

/// Serves bodies from memory and records every request.
#[derive(Default)]
struct MockTransport {
    bodies: Mutex<HashMap<String, Vec<u8>>>,
    broken: Mutex<HashSet<String>>,
    requests: Mutex<Vec<String>>,
}

impl MockTransport {
    fn serve(&self, url: &str, body: &[u8]) {
        self.bodies
            .lock()
            .unwrap()
            .insert(url.to_string(), body.to_vec());
    }

    fn break_url(&self, url: &str) {
        self.broken.lock().unwrap().insert(url.to_string());
    }

    fn repair_url(&self, url: &str) {
        self.broken.lock().unwrap().remove(url);
    }

    fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    fn reset_requests(&self) {
        self.requests.lock().unwrap().clear();
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self, url: &str, _resume_from: u64) -> Result<TransferResponse> {
        self.requests.lock().unwrap().push(url.to_string());
        if self.broken.lock().unwrap().contains(url) {
            return Err(KeelError::Network {
                message: "connection reset".into(),
                cause: None,
            });
        }
        let body = self
            .bodies
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| KeelError::DownloadFailed {
                url: url.to_string(),
                message: "HTTP 404".into(),
            })?;
        Ok(TransferResponse {
            status: 200,
            partial: false,
            content_length: Some(body.len() as u64),
            body: futures::stream::iter(vec![Ok(Bytes::from(body))]).boxed(),
        })
    }
}

/// Trips a cancellation token whenever a transfer opens.
#[derive(Default)]
struct CancellingTransport {
    token: Mutex<Option<CancellationToken>>,
}

#[async_trait]
impl Transport for CancellingTransport {
    async fn open(&self, _url: &str, _resume_from: u64) -> Result<TransferResponse> {
        if let Some(token) = self.token.lock().unwrap().as_ref() {
            token.cancel();
        }
        Ok(TransferResponse {
            status: 200,
            partial: false,
            content_length: Some(4),
            body: futures::stream::iter(vec![Ok(Bytes::from_static(b"data"))]).boxed(),
        })
    }
}

struct Env {
    _tmp: TempDir,
    root: std::path::PathBuf,
    transport: Arc<MockTransport>,
}

impl Env {
    fn new() -> Self {
        let tmp = TempDir::new().expect("Failed to create temp dir");
        let root = tmp.path().join("game");
        std::fs::create_dir_all(&root).unwrap();
        Self {
            _tmp: tmp,
            root,
            transport: Arc::new(MockTransport::default()),
        }
    }

    fn coordinator(&self, strategy: Strategy) -> CacheCoordinator {
        let options = SyncOptions {
            strategy,
            max_parallel: 4,
            ..SyncOptions::default()
        };
        CacheCoordinator::open(
            &self.root,
            options,
            Arc::new(FlatLayout),
            self.transport.clone(),
        )
        .unwrap()
    }

    /// A loose manifest file served by the mock transport.
    fn file(&self, path: &str, content: &[u8]) -> ManifestFile {
        let url = format!("mem://files/{}", path);
        self.transport.serve(&url, content);
        let mut file = ManifestFile::new(
            path,
            content.len() as u64,
            ContentHash::blake3(blake3_bytes(content)),
        );
        file.url = Some(url);
        file
    }

    fn read(&self, key: &str) -> Vec<u8> {
        std::fs::read(self.root.join(key)).unwrap()
    }
}

fn zip_bytes(members: &[(&str, &[u8])]) -> Vec<u8> {
    let mut zip = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    for (name, data) in members {
        zip.start_file(*name, zip::write::SimpleFileOptions::default())
            .unwrap();
        zip.write_all(data).unwrap();
    }
    zip.finish().unwrap().into_inner()
}

fn touch(path: &Path) {
    let file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
    file.set_modified(SystemTime::now() + Duration::from_secs(300))
        .unwrap();
}

#[tokio::test]
async fn test_fresh_install_then_idempotent_resync() {
    let env = Env::new();
    let c = env.coordinator(Strategy::Mtime);
    let manifest = Manifest {
        archives: vec![],
        files: vec![
            env.file("bin/client.exe", b"client v1"),
            env.file("zone/english/patch.ff", b"patch data"),
            env.file("readme.txt", b"hello"),
        ],
    };

    let first = c.sync(&manifest, ComponentKind::Client, "v1").await.unwrap();
    assert_eq!(first.status, CacheStatus::UpdateApplied);
    assert_eq!(first.summary.downloads_required, 3);
    assert_eq!(env.read("zone/english/patch.ff"), b"patch data");
    assert_eq!(env.transport.requests().len(), 3);

    env.transport.reset_requests();
    let second = c.sync(&manifest, ComponentKind::Client, "v1").await.unwrap();
    assert_eq!(second.status, CacheStatus::UpToDate);
    assert_eq!(second.summary.files_valid, 3);
    assert!(env.transport.requests().is_empty());
}

#[tokio::test]
async fn test_manual_tamper_depends_on_strategy() {
    let env = Env::new();
    let manifest = Manifest {
        archives: vec![],
        files: vec![env.file("a.bin", b"aaaa"), env.file("b.bin", b"bbbb")],
    };
    env.coordinator(Strategy::Mtime)
        .sync(&manifest, ComponentKind::Client, "v1")
        .await
        .unwrap();

    touch(&env.root.join("a.bin"));

    // Content is unchanged, so hashing trusts it.
    let hashing = env.coordinator(Strategy::Hash);
    let items = hashing
        .reconciler()
        .plan(&manifest, ComponentKind::Client, "v1")
        .unwrap();
    assert!(items.iter().all(|i| i.action == ReconcileAction::None));

    let mtime = env.coordinator(Strategy::Mtime);
    let items = mtime
        .reconciler()
        .plan(&manifest, ComponentKind::Client, "v1")
        .unwrap();
    let redownload: Vec<&str> = items
        .iter()
        .filter(|i| i.action == ReconcileAction::Download)
        .map(|i| i.path.as_str())
        .collect();
    assert_eq!(redownload, vec!["a.bin"]);

    env.transport.reset_requests();
    let result = mtime.sync(&manifest, ComponentKind::Client, "v1").await.unwrap();
    assert_eq!(result.status, CacheStatus::UpdateApplied);
    assert_eq!(env.transport.requests(), vec!["mem://files/a.bin"]);
}

#[tokio::test]
async fn test_interrupted_sync_does_not_stamp() {
    let env = Env::new();
    let c = env.coordinator(Strategy::Mtime);
    let manifest = Manifest {
        archives: vec![],
        files: vec![
            env.file("a.bin", b"aaaa"),
            env.file("b.bin", b"bbbb"),
            env.file("c.bin", b"cccc"),
        ],
    };
    env.transport.break_url("mem://files/b.bin");

    let result = c.sync(&manifest, ComponentKind::Client, "v2").await.unwrap();
    assert_eq!(result.status, CacheStatus::UpdateFailed);
    assert!(result
        .error
        .as_deref()
        .unwrap()
        .starts_with("1 of 3 downloads failed: b.bin (mem://files/b.bin)"));
    assert!(c.reconciler().outdated(ComponentKind::Client, "v2").unwrap());
    assert!(!env.root.join("b.bin").exists());

    // The two files that landed are tracked, so only the third is replanned.
    let items = c
        .reconciler()
        .plan(&manifest, ComponentKind::Client, "v2")
        .unwrap();
    let pending: Vec<&str> = items
        .iter()
        .filter(|i| i.action != ReconcileAction::None)
        .map(|i| i.path.as_str())
        .collect();
    assert_eq!(pending, vec!["b.bin"]);

    env.transport.repair_url("mem://files/b.bin");
    let retry = c.sync(&manifest, ComponentKind::Client, "v2").await.unwrap();
    assert_eq!(retry.status, CacheStatus::UpdateApplied);
    assert!(!c.reconciler().outdated(ComponentKind::Client, "v2").unwrap());
}

#[tokio::test]
async fn test_smart_sync_skips_planning_when_intact() {
    let env = Env::new();
    let c = env.coordinator(Strategy::Mtime);
    let manifest = Manifest {
        archives: vec![],
        files: vec![env.file("a.bin", b"aaaa"), env.file("b.bin", b"bbbb")],
    };

    let first = c.smart_sync(&manifest, ComponentKind::Rawfiles, "r1").await.unwrap();
    assert_eq!(first.status, CacheStatus::UpdateApplied);

    env.transport.reset_requests();
    let again = c.smart_sync(&manifest, ComponentKind::Rawfiles, "r1").await.unwrap();
    assert_eq!(again.status, CacheStatus::UpToDate);
    assert_eq!(again.summary.files_valid, 2);
    assert!(env.transport.requests().is_empty());

    std::fs::remove_file(env.root.join("b.bin")).unwrap();
    let repaired = c.smart_sync(&manifest, ComponentKind::Rawfiles, "r1").await.unwrap();
    assert_eq!(repaired.status, CacheStatus::UpdateApplied);
    assert_eq!(env.transport.requests(), vec!["mem://files/b.bin"]);
    assert_eq!(env.read("b.bin"), b"bbbb");
}

#[tokio::test]
async fn test_version_change_replaces_changed_files_only() {
    let env = Env::new();
    let c = env.coordinator(Strategy::Mixed);
    let v1 = Manifest {
        archives: vec![],
        files: vec![env.file("same.bin", b"same"), env.file("changes.bin", b"old!")],
    };
    c.sync(&v1, ComponentKind::Client, "v1").await.unwrap();

    let mut changed = ManifestFile::new(
        "changes.bin",
        4,
        ContentHash::blake3(blake3_bytes(b"new!")),
    );
    changed.url = Some("mem://files/v2/changes.bin".into());
    env.transport.serve("mem://files/v2/changes.bin", b"new!");
    let v2 = Manifest {
        archives: vec![],
        files: vec![v1.files[0].clone(), changed],
    };

    env.transport.reset_requests();
    let result = c.sync(&v2, ComponentKind::Client, "v2").await.unwrap();
    assert_eq!(result.status, CacheStatus::UpdateApplied);
    assert_eq!(env.transport.requests(), vec!["mem://files/v2/changes.bin"]);
    assert_eq!(env.read("changes.bin"), b"new!");
    assert_eq!(
        c.reconciler().version(ComponentKind::Client).unwrap().as_deref(),
        Some("v2")
    );
}

#[tokio::test]
async fn test_archive_extracted_once_and_reused() {
    let env = Env::new();
    let c = env.coordinator(Strategy::Mtime);
    let data = zip_bytes(&[("zone/dlc/a.ff", b"alpha"), ("zone/dlc/b.ff", b"bravo")]);
    env.transport.serve("mem://archives/dlc.zip", &data);

    let member = |path: &str, content: &[u8]| {
        let mut f = ManifestFile::new(
            path,
            content.len() as u64,
            ContentHash::blake3(blake3_bytes(content)),
        );
        f.archive_name = Some("dlc.zip".into());
        f
    };
    let manifest = Manifest {
        archives: vec![ManifestArchive {
            hash: ContentHash::blake3(blake3_bytes(&data)),
            size: data.len() as u64,
            name: "dlc.zip".into(),
            url: "mem://archives/dlc.zip".into(),
            compression: CompressionKind::Zip,
            files: vec![member("zone/dlc/a.ff", b"alpha"), member("zone/dlc/b.ff", b"bravo")],
        }],
        files: vec![],
    };

    let result = c.sync(&manifest, ComponentKind::Dlc, "d1").await.unwrap();
    assert_eq!(result.status, CacheStatus::UpdateApplied);
    assert_eq!(env.read("zone/dlc/b.ff"), b"bravo");
    assert!(!env.root.join("dlc.zip").exists());
    assert_eq!(c.reconciler().database().count(Some(ComponentKind::Dlc)).unwrap(), 2);

    // The archive itself is gone, but its extraction still verifies.
    env.transport.reset_requests();
    let again = c.sync(&manifest, ComponentKind::Dlc, "d1").await.unwrap();
    assert_eq!(again.status, CacheStatus::UpToDate);
    assert!(env.transport.requests().is_empty());

    // A reopened coordinator reads the same extraction record from disk.
    drop(c);
    let reopened = env.coordinator(Strategy::Mtime);
    let check = reopened.check(&manifest, ComponentKind::Dlc, "d1");
    assert_eq!(check.status, CacheStatus::UpToDate);

    // Losing one extracted file brings the archive back.
    std::fs::remove_file(env.root.join("zone/dlc/a.ff")).unwrap();
    let repaired = reopened.sync(&manifest, ComponentKind::Dlc, "d1").await.unwrap();
    assert_eq!(repaired.status, CacheStatus::UpdateApplied);
    assert_eq!(env.transport.requests(), vec!["mem://archives/dlc.zip"]);
    assert_eq!(env.read("zone/dlc/a.ff"), b"alpha");
}

#[tokio::test]
async fn test_sync_all_partial_failure_stamps_nothing() {
    let env = Env::new();
    let c = env.coordinator(Strategy::Mtime);
    let client = Manifest {
        archives: vec![],
        files: vec![env.file("client.bin", b"client")],
    };
    let helper = Manifest {
        archives: vec![],
        files: vec![env.file("helper.bin", b"helper")],
    };
    env.transport.break_url("mem://files/helper.bin");

    let result = c
        .sync_all(&[
            (&client, ComponentKind::Client, "v1"),
            (&helper, ComponentKind::Helper, "v1"),
        ])
        .await
        .unwrap();
    assert_eq!(result.status, CacheStatus::UpdateFailed);
    assert_eq!(result.failures.len(), 1);
    assert!(c.reconciler().version(ComponentKind::Client).unwrap().is_none());
    assert!(c.reconciler().version(ComponentKind::Helper).unwrap().is_none());

    env.transport.repair_url("mem://files/helper.bin");
    let result = c
        .sync_all(&[
            (&client, ComponentKind::Client, "v1"),
            (&helper, ComponentKind::Helper, "v1"),
        ])
        .await
        .unwrap();
    assert_eq!(result.status, CacheStatus::UpdateApplied);
    assert_eq!(
        c.reconciler().version(ComponentKind::Helper).unwrap().as_deref(),
        Some("v1")
    );
}

#[tokio::test]
async fn test_corrupt_download_is_rejected() {
    let env = Env::new();
    let c = env.coordinator(Strategy::Mtime);
    let file = env.file("a.bin", b"good");
    env.transport.serve(file.url.as_deref().unwrap(), b"evil");

    let manifest = Manifest {
        archives: vec![],
        files: vec![file],
    };
    let result = c.sync(&manifest, ComponentKind::Client, "v1").await.unwrap();
    assert_eq!(result.status, CacheStatus::UpdateFailed);
    assert!(!env.root.join("a.bin").exists());
    assert!(c.reconciler().database().find("a.bin").unwrap().is_none());
}

#[tokio::test]
async fn test_auto_prune_drops_removed_files() {
    let env = Env::new();
    let c = env.coordinator(Strategy::Mtime);
    let v1 = Manifest {
        archives: vec![],
        files: vec![env.file("keep.bin", b"keep"), env.file("old.bin", b"old")],
    };
    c.sync(&v1, ComponentKind::Client, "v1").await.unwrap();

    let v2 = Manifest {
        archives: vec![],
        files: vec![v1.files[0].clone()],
    };
    let result = c.sync(&v2, ComponentKind::Client, "v2").await.unwrap();
    assert_eq!(result.status, CacheStatus::UpdateApplied);
    assert!(c.reconciler().database().find("old.bin").unwrap().is_none());
    // Pruning only forgets the file unless prune_files is set.
    assert!(env.root.join("old.bin").exists());
}

#[tokio::test]
async fn test_cancelled_sync_stamps_nothing() {
    let tmp = TempDir::new().unwrap();
    let transport = Arc::new(CancellingTransport::default());
    let c = CacheCoordinator::open(
        tmp.path(),
        SyncOptions::default(),
        Arc::new(FlatLayout),
        transport.clone(),
    )
    .unwrap();
    *transport.token.lock().unwrap() = Some(c.cancellation_token());

    let mut file = ManifestFile::new("a.bin", 4, ContentHash::blake3(blake3_bytes(b"data")));
    file.url = Some("mem://a".into());
    let manifest = Manifest {
        archives: vec![],
        files: vec![file],
    };

    let result = c.sync(&manifest, ComponentKind::Client, "v1").await.unwrap();
    assert_eq!(result.status, CacheStatus::UpdateFailed);
    assert_eq!(result.failures[0].cause, "cancelled");
    assert!(c.reconciler().version(ComponentKind::Client).unwrap().is_none());
    let leftovers: Vec<_> = std::fs::read_dir(tmp.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("a.bin"))
        .collect();
    assert!(leftovers.is_empty());

    // The next sync starts with a fresh token.
    *transport.token.lock().unwrap() = None;
    let retry = c.sync(&manifest, ComponentKind::Client, "v1").await.unwrap();
    assert_eq!(retry.status, CacheStatus::UpdateApplied);
    assert!(!c.cancellation_token().is_cancelled());
}

#[tokio::test]
async fn test_partial_from_previous_release_is_not_resumed() {
    let env = Env::new();
    let c = env.coordinator(Strategy::Mtime);
    let target = env.root.join("zone/patch.ff");
    std::fs::create_dir_all(target.parent().unwrap()).unwrap();

    // An interrupted download of the previous release left half a file.
    let previous = DownloadRequest::new("mem://files/zone/patch.ff", &target)
        .with_verification(VerificationMethod::Blake3, blake3_bytes(b"old patch!"));
    std::fs::write(part_path(&previous), b"old ").unwrap();

    let manifest = Manifest {
        archives: vec![],
        files: vec![env.file("zone/patch.ff", b"new patch!")],
    };
    let result = c.sync(&manifest, ComponentKind::Client, "v2").await.unwrap();

    assert_eq!(result.status, CacheStatus::UpdateApplied);
    assert_eq!(env.read("zone/patch.ff"), b"new patch!");
    assert!(!part_path(&previous).exists());
}
