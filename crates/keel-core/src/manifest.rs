//! Manifest data model.
//!
//! A manifest is produced by the release-discovery client and describes the
//! files and archives an installation should contain. Unknown hash
//! algorithms and compression kinds are kept as `Unknown` instead of failing
//! the parse.

use crate::error::{KeelError, Result};
use crate::hashing::hashes_match;
use crate::metadata::atomic_read_json;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Digest algorithm named by a manifest hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(from = "String", into = "String")]
pub enum HashAlgorithm {
    #[default]
    Blake3,
    Unknown(String),
}

impl From<String> for HashAlgorithm {
    fn from(s: String) -> Self {
        if s.eq_ignore_ascii_case("blake3") {
            HashAlgorithm::Blake3
        } else {
            HashAlgorithm::Unknown(s)
        }
    }
}

impl From<HashAlgorithm> for String {
    fn from(algorithm: HashAlgorithm) -> Self {
        algorithm.to_string()
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HashAlgorithm::Blake3 => f.write_str("blake3"),
            HashAlgorithm::Unknown(name) => f.write_str(name),
        }
    }
}

/// Container format of a manifest archive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(from = "String", into = "String")]
pub enum CompressionKind {
    #[default]
    None,
    Zip,
    TarGz,
    TarBz2,
    Unknown(String),
}

impl From<String> for CompressionKind {
    fn from(s: String) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "" | "none" => CompressionKind::None,
            "zip" => CompressionKind::Zip,
            "tar_gz" | "tar.gz" | "tgz" => CompressionKind::TarGz,
            "tar_bz2" | "tar.bz2" => CompressionKind::TarBz2,
            _ => CompressionKind::Unknown(s),
        }
    }
}

impl From<CompressionKind> for String {
    fn from(kind: CompressionKind) -> Self {
        kind.to_string()
    }
}

impl fmt::Display for CompressionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompressionKind::None => f.write_str("none"),
            CompressionKind::Zip => f.write_str("zip"),
            CompressionKind::TarGz => f.write_str("tar_gz"),
            CompressionKind::TarBz2 => f.write_str("tar_bz2"),
            CompressionKind::Unknown(name) => f.write_str(name),
        }
    }
}

/// A hex digest tagged with its algorithm.
///
/// Equality ignores the case of `value`. An empty value means no hash is
/// available and content checks are skipped.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContentHash {
    #[serde(default)]
    pub algorithm: HashAlgorithm,
    #[serde(default)]
    pub value: String,
}

impl ContentHash {
    pub fn blake3(value: impl Into<String>) -> Self {
        Self {
            algorithm: HashAlgorithm::Blake3,
            value: value.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    /// Whether this hash can be checked against file content.
    pub fn is_verifiable(&self) -> bool {
        !self.is_empty() && self.algorithm == HashAlgorithm::Blake3
    }

    /// Compare against a hex digest of the same algorithm.
    pub fn matches(&self, digest: &str) -> bool {
        hashes_match(&self.value, digest)
    }
}

impl PartialEq for ContentHash {
    fn eq(&self, other: &Self) -> bool {
        self.algorithm == other.algorithm && self.value.eq_ignore_ascii_case(&other.value)
    }
}

impl Eq for ContentHash {}

/// One file the installation should contain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFile {
    #[serde(default)]
    pub hash: ContentHash,
    pub size: u64,
    pub path: String,
    /// Release asset the file is downloaded from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_name: Option<String>,
    /// Archive the file is extracted from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_name: Option<String>,
    /// Download URL filled in by the discovery client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl ManifestFile {
    pub fn new(path: impl Into<String>, size: u64, hash: ContentHash) -> Self {
        Self {
            hash,
            size,
            path: path.into(),
            asset_name: None,
            archive_name: None,
            url: None,
        }
    }

    pub fn is_archive_member(&self) -> bool {
        self.archive_name.is_some()
    }
}

/// A downloadable container of files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestArchive {
    #[serde(default)]
    pub hash: ContentHash,
    pub size: u64,
    pub name: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub compression: CompressionKind,
    /// Files to extract. Empty means extract everything.
    #[serde(default)]
    pub files: Vec<ManifestFile>,
}

/// The desired state of one component at one release.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub archives: Vec<ManifestArchive>,
    #[serde(default)]
    pub files: Vec<ManifestFile>,
}

impl Manifest {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| KeelError::Manifest {
            message: format!("Invalid manifest: {}", e),
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        atomic_read_json(path)?.ok_or_else(|| KeelError::Manifest {
            message: format!("Manifest not found: {}", path.display()),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.archives.is_empty() && self.files.is_empty()
    }

    /// Loose files plus every file listed by an archive.
    pub fn file_count(&self) -> usize {
        self.files.len() + self.archives.iter().map(|a| a.files.len()).sum::<usize>()
    }

    /// Files that are downloaded directly rather than extracted.
    pub fn loose_files(&self) -> impl Iterator<Item = &ManifestFile> {
        self.files.iter().filter(|f| !f.is_archive_member())
    }

    pub fn archive(&self, name: &str) -> Option<&ManifestArchive> {
        self.archives.iter().find(|a| a.name == name)
    }

    /// Total bytes of every archive and loose file, ignoring local state.
    pub fn total_size(&self) -> u64 {
        let archives: u64 = self.archives.iter().map(|a| a.size).sum();
        let loose: u64 = self.loose_files().map(|f| f.size).sum();
        archives + loose
    }
}
