//! Mapping manifest paths onto an installation directory.
//!
//! Where a file lands is a contract with the consuming application, so the
//! mapping is pluggable through [`PathResolver`]. [`GameLayout`] reproduces
//! the directory layout the game expects; [`FlatLayout`] joins paths under
//! the root unchanged.

use crate::manifest::{ManifestArchive, ManifestFile};
use std::path::{Component, Path, PathBuf};

/// Resolves manifest entries to absolute paths under an install root.
pub trait PathResolver: Send + Sync {
    fn resolve_file(&self, root: &Path, file: &ManifestFile) -> PathBuf;

    fn resolve_archive(&self, root: &Path, archive: &ManifestArchive) -> PathBuf;
}

/// Game directory layout.
///
/// - `codo/` prefixes are rewritten to `zone/`
/// - paths under `zone/` or `iw4x/` are trusted as given
/// - `*.iwd` goes to `iw4x/`, `*.ff` goes to `zone/dlc/`
/// - `*.zip` archives land directly under the root
#[derive(Debug, Clone, Copy, Default)]
pub struct GameLayout;

impl GameLayout {
    fn map(&self, path: &str) -> String {
        let path = normalize_separators(path);
        let path = match path.strip_prefix("codo/") {
            Some(rest) => format!("zone/{}", rest),
            None => path,
        };

        if path.starts_with("zone/") || path.starts_with("iw4x/") {
            return path;
        }

        let filename = file_name(&path);
        match extension(&filename).as_deref() {
            Some("iwd") => format!("iw4x/{}", filename),
            Some("ff") => format!("zone/dlc/{}", filename),
            _ => path,
        }
    }
}

impl PathResolver for GameLayout {
    fn resolve_file(&self, root: &Path, file: &ManifestFile) -> PathBuf {
        join_relative(root, &self.map(&file.path))
    }

    fn resolve_archive(&self, root: &Path, archive: &ManifestArchive) -> PathBuf {
        let name = normalize_separators(&archive.name);
        let filename = file_name(&name);
        if extension(&filename).as_deref() == Some("zip") {
            return join_relative(root, &filename);
        }
        join_relative(root, &self.map(&name))
    }
}

/// Joins every path under the root after separator normalization.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlatLayout;

impl PathResolver for FlatLayout {
    fn resolve_file(&self, root: &Path, file: &ManifestFile) -> PathBuf {
        join_relative(root, &normalize_separators(&file.path))
    }

    fn resolve_archive(&self, root: &Path, archive: &ManifestArchive) -> PathBuf {
        join_relative(root, &normalize_separators(&archive.name))
    }
}

/// Derive the cache key for `path`: root-relative with `/` separators.
///
/// Paths outside the root keep their full form, normalized the same way.
pub fn cache_key(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    let parts: Vec<String> = relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    normalize_separators(&parts.join("/"))
}

/// Normalize a stored or user supplied key to the canonical form.
pub fn normalize_key(key: &str) -> String {
    normalize_separators(key)
}

/// Turn a cache key back into an absolute path under `root`.
pub fn key_to_path(root: &Path, key: &str) -> PathBuf {
    join_relative(root, &normalize_separators(key))
}

fn normalize_separators(path: &str) -> String {
    path.replace('\\', "/")
        .split('/')
        .filter(|part| !part.is_empty() && *part != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// Join a `/`-separated relative path, dropping anything that would escape
/// the root.
fn join_relative(root: &Path, relative: &str) -> PathBuf {
    let mut out = root.to_path_buf();
    for part in relative.split('/') {
        match part {
            "" | "." | ".." => continue,
            part => out.push(part),
        }
    }
    out
}

fn file_name(path: &str) -> String {
    path.rsplit('/').next().unwrap_or(path).to_string()
}

fn extension(filename: &str) -> Option<String> {
    filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
}
