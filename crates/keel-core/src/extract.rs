//! Archive extraction into an installation.
//!
//! Listed members are extracted to where the layout puts them; an archive
//! that lists nothing is unpacked whole under the install root. Every
//! extracted file is tracked in the cache database in batches as it lands,
//! and the archive cache entry is written only once the whole archive is
//! done. A crash in between leaves tracked rows without an entry, so the
//! next sync extracts again.

use crate::cache::{ArchiveCacheEntry, ComponentKind, ExtractedFile, Reconciler};
use crate::config::CacheConfig;
use crate::error::{KeelError, Result};
use crate::hashing::{compute_blake3, file_matches_blake3, hashes_match};
use crate::layout::{key_to_path, normalize_key};
use crate::manifest::{CompressionKind, ManifestArchive, ManifestFile};
use flate2::read::GzDecoder;
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArchiveFormat {
    Zip,
    TarGz,
}

/// Extract `archive` from the file at `archive_path`.
///
/// Returns the archive cache entry that was recorded.
pub fn extract_archive(
    reconciler: &Reconciler,
    archive: &ManifestArchive,
    archive_path: &Path,
    component: ComponentKind,
    version: &str,
) -> Result<ArchiveCacheEntry> {
    let format = archive_format(archive)?;
    info!(
        "Extracting {} ({}) into {}",
        archive.name,
        format_name(format),
        reconciler.root().display()
    );

    let mut extraction = Extraction::new(reconciler, component, version);
    match format {
        ArchiveFormat::Zip => extract_zip(&mut extraction, archive, archive_path)?,
        ArchiveFormat::TarGz => extract_tar_gz(&mut extraction, archive, archive_path)?,
    }
    extraction.flush()?;

    let entry = ArchiveCacheEntry {
        archive_name: archive.name.clone(),
        archive_hash: archive.hash.value.to_lowercase(),
        archive_size: archive.size,
        files: extraction.files,
        timestamp: 0,
    };
    let cache = reconciler.archive_cache();
    cache.add(entry.clone());
    cache.save()?;

    info!(
        "Extracted {} files from {}",
        entry.files.len(),
        archive.name
    );
    Ok(entry)
}

fn archive_format(archive: &ManifestArchive) -> Result<ArchiveFormat> {
    match &archive.compression {
        CompressionKind::Zip => Ok(ArchiveFormat::Zip),
        CompressionKind::TarGz => Ok(ArchiveFormat::TarGz),
        CompressionKind::None => {
            let name = archive.name.to_ascii_lowercase();
            if name.ends_with(".zip") {
                Ok(ArchiveFormat::Zip)
            } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
                Ok(ArchiveFormat::TarGz)
            } else {
                Err(unsupported(archive))
            }
        }
        CompressionKind::TarBz2 | CompressionKind::Unknown(_) => Err(unsupported(archive)),
    }
}

fn format_name(format: ArchiveFormat) -> &'static str {
    match format {
        ArchiveFormat::Zip => "zip",
        ArchiveFormat::TarGz => "tar.gz",
    }
}

fn unsupported(archive: &ManifestArchive) -> KeelError {
    KeelError::Archive {
        archive: archive.name.clone(),
        message: format!("unsupported compression '{}'", archive.compression),
    }
}

fn archive_error(archive: &ManifestArchive, message: impl Into<String>) -> KeelError {
    KeelError::Archive {
        archive: archive.name.clone(),
        message: message.into(),
    }
}

/// Running state of one extraction.
struct Extraction<'a> {
    reconciler: &'a Reconciler,
    component: ComponentKind,
    version: &'a str,
    pending: Vec<(PathBuf, String)>,
    files: Vec<ExtractedFile>,
}

impl<'a> Extraction<'a> {
    fn new(reconciler: &'a Reconciler, component: ComponentKind, version: &'a str) -> Self {
        Self {
            reconciler,
            component,
            version,
            pending: Vec::new(),
            files: Vec::new(),
        }
    }

    /// Where an unlisted member with archive path `name` goes.
    fn unlisted_destination(&self, name: &str) -> PathBuf {
        key_to_path(self.reconciler.root(), name)
    }

    fn write_member(
        &mut self,
        reader: &mut dyn Read,
        dest: &Path,
        expected: Option<&ManifestFile>,
    ) -> Result<()> {
        let expected_hash = expected
            .filter(|f| f.hash.is_verifiable())
            .map(|f| f.hash.value.as_str());

        let hash = match expected_hash {
            Some(digest) if file_matches_blake3(dest, digest) => {
                debug!("{} is already up to date", dest.display());
                digest.to_lowercase()
            }
            _ => {
                write_file(reader, dest)?;
                let actual = compute_blake3(dest)?;
                if let Some(digest) = expected_hash {
                    if !hashes_match(&actual, digest) {
                        let _ = std::fs::remove_file(dest);
                        return Err(KeelError::HashMismatch {
                            expected: digest.to_string(),
                            actual,
                        });
                    }
                }
                actual
            }
        };

        let size = std::fs::metadata(dest)
            .map_err(|e| KeelError::io_with_path(e, dest))?
            .len();
        self.files.push(ExtractedFile {
            path: self.reconciler.key(dest),
            hash: hash.clone(),
            size,
        });
        self.pending.push((dest.to_path_buf(), hash));
        if self.pending.len() >= CacheConfig::TRACK_BATCH_SIZE {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let stored = self
            .reconciler
            .track_batch(&self.pending, self.component, self.version)?;
        debug!("Tracked {} extracted files", stored);
        self.pending.clear();
        Ok(())
    }
}

fn write_file(reader: &mut dyn Read, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent).map_err(|e| KeelError::io_with_path(e, parent))?;
    }
    let mut out = File::create(dest).map_err(|e| KeelError::io_with_path(e, dest))?;
    std::io::copy(reader, &mut out).map_err(|e| KeelError::io_with_path(e, dest))?;
    Ok(())
}

fn open_archive(path: &Path) -> Result<BufReader<File>> {
    let file = File::open(path).map_err(|e| KeelError::io_with_path(e, path))?;
    Ok(BufReader::new(file))
}

fn extract_zip(
    extraction: &mut Extraction<'_>,
    archive: &ManifestArchive,
    archive_path: &Path,
) -> Result<()> {
    let mut zip = zip::ZipArchive::new(open_archive(archive_path)?)
        .map_err(|e| archive_error(archive, format!("Invalid zip archive: {}", e)))?;

    if archive.files.is_empty() {
        for i in 0..zip.len() {
            let mut entry = zip
                .by_index(i)
                .map_err(|e| archive_error(archive, format!("Failed to read entry {}: {}", i, e)))?;
            if entry.is_dir() {
                continue;
            }
            let Some(name) = entry.enclosed_name() else {
                warn!("Skipping unsafe entry '{}' in {}", entry.name(), archive.name);
                continue;
            };
            let dest = extraction.unlisted_destination(&name.to_string_lossy());
            extraction.write_member(&mut entry, &dest, None)?;
        }
        return Ok(());
    }

    for file in &archive.files {
        let name = normalize_key(&file.path);
        let mut entry = zip
            .by_name(&name)
            .map_err(|_| archive_error(archive, format!("member {} not found", name)))?;
        let dest = extraction.reconciler.resolve_file(file);
        extraction.write_member(&mut entry, &dest, Some(file))?;
    }
    Ok(())
}

fn extract_tar_gz(
    extraction: &mut Extraction<'_>,
    archive: &ManifestArchive,
    archive_path: &Path,
) -> Result<()> {
    let mut tar = tar::Archive::new(GzDecoder::new(open_archive(archive_path)?));
    let wanted: HashMap<String, &ManifestFile> = archive
        .files
        .iter()
        .map(|f| (normalize_key(&f.path), f))
        .collect();
    let mut found: HashSet<String> = HashSet::new();

    let entries = tar
        .entries()
        .map_err(|e| archive_error(archive, format!("Invalid tar.gz archive: {}", e)))?;
    for entry in entries {
        let mut entry =
            entry.map_err(|e| archive_error(archive, format!("Failed to read entry: {}", e)))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let raw = entry
            .path()
            .map_err(|e| archive_error(archive, format!("Bad entry path: {}", e)))?
            .to_string_lossy()
            .into_owned();
        if raw.starts_with('/') || raw.split(['/', '\\']).any(|part| part == "..") {
            warn!("Skipping unsafe entry '{}' in {}", raw, archive.name);
            continue;
        }
        let key = normalize_key(&raw);

        if wanted.is_empty() {
            let dest = extraction.unlisted_destination(&key);
            extraction.write_member(&mut entry, &dest, None)?;
        } else if let Some(&file) = wanted.get(&key) {
            let dest = extraction.reconciler.resolve_file(file);
            extraction.write_member(&mut entry, &dest, Some(file))?;
            found.insert(key);
        }
    }

    if let Some(missing) = wanted.keys().find(|k| !found.contains(*k)) {
        return Err(archive_error(archive, format!("member {} not found", missing)));
    }
    Ok(())
}
