//! Atomic JSON persistence.
//!
//! Writes go to a uniquely named sibling temp file which is synced and then
//! renamed over the target, so readers only ever see a complete document.

use crate::error::{KeelError, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Read and parse a JSON file.
///
/// Returns `None` if the file doesn't exist, or an error if it cannot be
/// read or parsed.
pub fn atomic_read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(KeelError::Io {
                message: format!("Failed to read {}", path.display()),
                path: Some(path.to_path_buf()),
                source: Some(e),
            })
        }
    };

    let data: T = serde_json::from_str(&contents).map_err(|e| KeelError::Json {
        message: format!("Failed to parse {}: {}", path.display(), e),
        source: Some(e),
    })?;

    Ok(Some(data))
}

/// Serialize `data` and atomically replace the file at `path`.
///
/// The whole document is rewritten on every call.
pub fn atomic_write_json<T: Serialize>(path: &Path, data: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| KeelError::Io {
                message: format!("Failed to create directory {}", parent.display()),
                path: Some(parent.to_path_buf()),
                source: Some(e),
            })?;
        }
    }

    let serialized = serde_json::to_string_pretty(data).map_err(|e| KeelError::Json {
        message: format!("Failed to serialize {}: {}", path.display(), e),
        source: Some(e),
    })?;

    let temp_path = temp_path_for(path);
    if let Err(e) = write_synced(&temp_path, serialized.as_bytes()) {
        let _ = fs::remove_file(&temp_path);
        return Err(e);
    }

    fs::rename(&temp_path, path).map_err(|e| {
        let _ = fs::remove_file(&temp_path);
        KeelError::Io {
            message: format!(
                "Failed to rename {} to {}",
                temp_path.display(),
                path.display()
            ),
            path: Some(path.to_path_buf()),
            source: Some(e),
        }
    })?;

    debug!("Atomically wrote {}", path.display());
    Ok(())
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(|e| KeelError::io_with_path(e, path))?;

    file.write_all(bytes)
        .map_err(|e| KeelError::io_with_path(e, path))?;
    file.sync_all()
        .map_err(|e| KeelError::io_with_path(e, path))?;
    Ok(())
}

fn temp_path_for(path: &Path) -> PathBuf {
    let seq = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.{}.{}.tmp", name, process::id(), seq))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Doc {
        name: String,
        value: i32,
    }

    #[test]
    fn test_write_then_read() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("doc.json");
        let doc = Doc {
            name: "first".into(),
            value: 1,
        };

        atomic_write_json(&path, &doc).unwrap();
        let read: Option<Doc> = atomic_read_json(&path).unwrap();
        assert_eq!(read, Some(doc));
    }

    #[test]
    fn test_overwrite_leaves_no_temp_files() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("doc.json");

        for value in 0..3 {
            atomic_write_json(
                &path,
                &Doc {
                    name: "x".into(),
                    value,
                },
            )
            .unwrap();
        }

        let names: Vec<_> = fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names.len(), 1);
        let read: Option<Doc> = atomic_read_json(&path).unwrap();
        assert_eq!(read.unwrap().value, 2);
    }

    #[test]
    fn test_read_missing_is_none() {
        let tmp = TempDir::new().unwrap();
        let read: Option<Doc> = atomic_read_json(&tmp.path().join("nope.json")).unwrap();
        assert!(read.is_none());
    }

    #[test]
    fn test_read_garbage_is_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("doc.json");
        fs::write(&path, "{not json").unwrap();

        let read: Result<Option<Doc>> = atomic_read_json(&path);
        assert!(matches!(read, Err(KeelError::Json { .. })));
    }

    #[test]
    fn test_write_creates_directories() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("a").join("b").join("doc.json");

        atomic_write_json(
            &path,
            &Doc {
                name: "nested".into(),
                value: 9,
            },
        )
        .unwrap();
        assert!(path.exists());
    }
}
