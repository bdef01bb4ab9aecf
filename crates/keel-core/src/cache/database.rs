//! SQLite-backed cache database.
//!
//! Holds one row per tracked file and one row per installed component
//! version. The connection runs in WAL mode so a companion process can read
//! while the updater writes. Every multi-row mutation goes through
//! [`CacheDatabase::transact`].

use super::types::{current_timestamp, CachedFile, ComponentKind, ComponentVersion};
use crate::config::{CacheConfig, PathsConfig};
use crate::error::{KeelError, Result};
use crate::layout::normalize_key;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

const FILE_COLUMNS: &str = "path, mtime, version, component, size, hash";

/// Persistent store of tracked files and component versions.
///
/// Cloning is cheap; clones share the same connection.
#[derive(Clone)]
pub struct CacheDatabase {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl std::fmt::Debug for CacheDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheDatabase")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl CacheDatabase {
    /// Open (or create) the database at `db_path`.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| KeelError::Io {
                message: format!("Failed to create cache directory: {}", e),
                path: Some(parent.to_path_buf()),
                source: Some(e),
            })?;
        }

        let conn = Connection::open(db_path).map_err(|e| KeelError::Database {
            message: format!("Failed to open cache database {}: {}", db_path.display(), e),
            source: Some(e),
        })?;

        Self::from_connection(conn, db_path.to_path_buf())
    }

    /// Open the database in the default location under an install root.
    pub fn open_in(install_root: &Path, data_dir_name: &str) -> Result<Self> {
        Self::open(
            install_root
                .join(data_dir_name)
                .join(PathsConfig::DATABASE_FILENAME),
        )
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, PathBuf::from(":memory:"))
    }

    fn from_connection(conn: Connection, path: PathBuf) -> Result<Self> {
        configure_connection(&conn)?;
        init_schema(&conn)?;
        debug!("Opened cache database at {}", path.display());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(KeelError::lock_poisoned)
    }

    /// Run `body` inside a write transaction.
    ///
    /// Commits when `body` returns `Ok`; rolls back every change it made when
    /// it returns `Err`.
    pub fn transact<T, F>(&self, body: F) -> Result<T>
    where
        F: FnOnce(&CacheTransaction<'_>) -> Result<T>,
    {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| KeelError::Database {
                message: format!("Failed to begin transaction: {}", e),
                source: Some(e),
            })?;
        let handle = CacheTransaction { tx };

        match body(&handle) {
            Ok(value) => {
                handle.tx.commit().map_err(|e| KeelError::Database {
                    message: format!("Failed to commit transaction: {}", e),
                    source: Some(e),
                })?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = handle.tx.rollback() {
                    warn!("Rollback failed after error '{}': {}", e, rollback);
                }
                Err(e)
            }
        }
    }

    // Files

    /// Look up a tracked file by key. Separators are normalized first.
    pub fn find(&self, path: &str) -> Result<Option<CachedFile>> {
        let conn = self.lock()?;
        select_file(&conn, &normalize_key(path))
    }

    /// Insert or update one file row.
    pub fn store(&self, file: &CachedFile) -> Result<()> {
        self.transact(|tx| tx.store(file))
    }

    /// Insert or update many rows in a single transaction.
    ///
    /// Either every row is written or none is.
    pub fn store_batch(&self, files: &[CachedFile]) -> Result<usize> {
        if files.is_empty() {
            return Ok(0);
        }
        let stored = self.transact(|tx| {
            for file in files {
                tx.store(file)?;
            }
            Ok(files.len())
        })?;
        debug!("Stored {} cache rows", stored);
        Ok(stored)
    }

    /// Remove one row. Returns whether it existed.
    pub fn erase(&self, path: &str) -> Result<bool> {
        self.transact(|tx| tx.erase(path))
    }

    /// Remove many rows in one transaction. Returns the number removed.
    pub fn erase_batch(&self, paths: &[String]) -> Result<usize> {
        self.transact(|tx| {
            let mut removed = 0;
            for path in paths {
                if tx.erase(path)? {
                    removed += 1;
                }
            }
            Ok(removed)
        })
    }

    /// Remove every row owned by `component`.
    pub fn erase_by_component(&self, component: ComponentKind) -> Result<usize> {
        self.transact(|tx| tx.erase_component(component))
    }

    /// All tracked files, optionally restricted to one component.
    pub fn files(&self, component: Option<ComponentKind>) -> Result<Vec<CachedFile>> {
        let conn = self.lock()?;
        match component {
            Some(c) => select_files(
                &conn,
                &format!(
                    "SELECT {} FROM cached_files WHERE component = ?1 ORDER BY path",
                    FILE_COLUMNS
                ),
                params![c.as_str()],
            ),
            None => select_files(
                &conn,
                &format!("SELECT {} FROM cached_files ORDER BY path", FILE_COLUMNS),
                params![],
            ),
        }
    }

    /// Tracked files recorded at a given version tag.
    pub fn files_by_version(&self, tag: &str) -> Result<Vec<CachedFile>> {
        let conn = self.lock()?;
        select_files(
            &conn,
            &format!(
                "SELECT {} FROM cached_files WHERE version = ?1 ORDER BY path",
                FILE_COLUMNS
            ),
            params![tag],
        )
    }

    /// Number of tracked files, optionally restricted to one component.
    pub fn count(&self, component: Option<ComponentKind>) -> Result<u64> {
        let conn = self.lock()?;
        let count: i64 = match component {
            Some(c) => conn.query_row(
                "SELECT COUNT(*) FROM cached_files WHERE component = ?1",
                params![c.as_str()],
                |row| row.get(0),
            )?,
            None => conn.query_row("SELECT COUNT(*) FROM cached_files", [], |row| row.get(0))?,
        };
        Ok(count as u64)
    }

    // Versions

    pub fn version(&self, component: ComponentKind) -> Result<Option<ComponentVersion>> {
        let conn = self.lock()?;
        select_version(&conn, component)
    }

    /// Record `tag` as the installed version of `component`.
    pub fn set_version(&self, component: ComponentKind, tag: &str) -> Result<()> {
        self.transact(|tx| tx.set_version(component, tag))
    }

    pub fn erase_version(&self, component: ComponentKind) -> Result<bool> {
        self.transact(|tx| tx.erase_version(component))
    }

    pub fn versions(&self) -> Result<Vec<ComponentVersion>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT component, tag, installed_at FROM component_versions ORDER BY component",
        )?;
        let rows = stmt
            .query_map([], row_to_version)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // Maintenance

    /// Drop every file and version row.
    pub fn clear(&self) -> Result<()> {
        self.transact(|tx| {
            tx.tx.execute("DELETE FROM cached_files", [])?;
            tx.tx.execute("DELETE FROM component_versions", [])?;
            Ok(())
        })?;
        info!("Cleared cache database {}", self.path.display());
        Ok(())
    }

    /// Rebuild the database file to reclaim free pages.
    pub fn vacuum(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch("VACUUM;").map_err(|e| KeelError::Database {
            message: format!("Failed to vacuum cache database: {}", e),
            source: Some(e),
        })
    }

    /// Run SQLite's integrity check. Any failure reports `false`.
    pub fn check_integrity(&self) -> bool {
        let conn = match self.lock() {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Integrity check could not lock database: {}", e);
                return false;
            }
        };

        match conn.query_row("PRAGMA integrity_check", [], |row| row.get::<_, String>(0)) {
            Ok(result) if result == "ok" => true,
            Ok(result) => {
                warn!("Cache database integrity check failed: {}", result);
                false
            }
            Err(e) => {
                warn!("Cache database integrity check errored: {}", e);
                false
            }
        }
    }
}

/// Typed access to an open write transaction.
pub struct CacheTransaction<'conn> {
    tx: rusqlite::Transaction<'conn>,
}

impl CacheTransaction<'_> {
    pub fn find(&self, path: &str) -> Result<Option<CachedFile>> {
        select_file(&self.tx, &normalize_key(path))
    }

    pub fn store(&self, file: &CachedFile) -> Result<()> {
        let size = i64::try_from(file.size).map_err(|_| KeelError::Validation {
            field: "size".into(),
            message: format!("{} bytes does not fit the cache schema", file.size),
        })?;

        self.tx
            .execute(
                r#"
                INSERT INTO cached_files (path, mtime, version, component, size, hash)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT(path) DO UPDATE SET
                    mtime = excluded.mtime,
                    version = excluded.version,
                    component = excluded.component,
                    size = excluded.size,
                    hash = excluded.hash
                "#,
                params![
                    normalize_key(&file.path),
                    file.mtime,
                    file.version,
                    file.component.as_str(),
                    size,
                    file.hash,
                ],
            )
            .map_err(|e| KeelError::Database {
                message: format!("Failed to store {}: {}", file.path, e),
                source: Some(e),
            })?;
        Ok(())
    }

    pub fn erase(&self, path: &str) -> Result<bool> {
        let deleted = self.tx.execute(
            "DELETE FROM cached_files WHERE path = ?1",
            params![normalize_key(path)],
        )?;
        Ok(deleted > 0)
    }

    pub fn erase_component(&self, component: ComponentKind) -> Result<usize> {
        let deleted = self.tx.execute(
            "DELETE FROM cached_files WHERE component = ?1",
            params![component.as_str()],
        )?;
        Ok(deleted)
    }

    pub fn version(&self, component: ComponentKind) -> Result<Option<ComponentVersion>> {
        select_version(&self.tx, component)
    }

    pub fn set_version(&self, component: ComponentKind, tag: &str) -> Result<()> {
        self.tx.execute(
            r#"
            INSERT INTO component_versions (component, tag, installed_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(component) DO UPDATE SET
                tag = excluded.tag,
                installed_at = excluded.installed_at
            "#,
            params![component.as_str(), tag, current_timestamp()],
        )?;
        Ok(())
    }

    pub fn erase_version(&self, component: ComponentKind) -> Result<bool> {
        let deleted = self.tx.execute(
            "DELETE FROM component_versions WHERE component = ?1",
            params![component.as_str()],
        )?;
        Ok(deleted > 0)
    }
}

fn configure_connection(conn: &Connection) -> Result<()> {
    conn.execute_batch(&format!(
        "
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        PRAGMA busy_timeout={};
        PRAGMA temp_store=MEMORY;
        ",
        CacheConfig::BUSY_TIMEOUT_MS
    ))
    .map_err(|e| KeelError::Database {
        message: format!("Failed to set pragmas: {}", e),
        source: Some(e),
    })
}

fn init_schema(conn: &Connection) -> Result<()> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if version > CacheConfig::SCHEMA_VERSION {
        return Err(KeelError::Database {
            message: format!(
                "Cache database schema {} is newer than supported {}",
                version,
                CacheConfig::SCHEMA_VERSION
            ),
            source: None,
        });
    }

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS cached_files (
            path TEXT PRIMARY KEY NOT NULL CHECK (length(path) > 0),
            mtime INTEGER NOT NULL,
            version TEXT NOT NULL,
            component TEXT NOT NULL,
            size INTEGER NOT NULL CHECK (size >= 0),
            hash TEXT NOT NULL DEFAULT ''
        );

        CREATE INDEX IF NOT EXISTS idx_cached_files_version
            ON cached_files(version);

        CREATE INDEX IF NOT EXISTS idx_cached_files_component
            ON cached_files(component);

        CREATE TABLE IF NOT EXISTS component_versions (
            component TEXT PRIMARY KEY NOT NULL,
            tag TEXT NOT NULL,
            installed_at INTEGER NOT NULL
        );
        "#,
    )
    .map_err(|e| KeelError::Database {
        message: format!("Failed to initialize cache schema: {}", e),
        source: Some(e),
    })?;

    if version < CacheConfig::SCHEMA_VERSION {
        conn.execute_batch(&format!(
            "PRAGMA user_version = {};",
            CacheConfig::SCHEMA_VERSION
        ))?;
    }
    Ok(())
}

fn select_file(conn: &Connection, key: &str) -> Result<Option<CachedFile>> {
    conn.query_row(
        &format!("SELECT {} FROM cached_files WHERE path = ?1", FILE_COLUMNS),
        params![key],
        row_to_file,
    )
    .optional()
    .map_err(|e| KeelError::Database {
        message: format!("Failed to query {}: {}", key, e),
        source: Some(e),
    })
}

fn select_files(
    conn: &Connection,
    sql: &str,
    params: &[&dyn rusqlite::ToSql],
) -> Result<Vec<CachedFile>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, row_to_file)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn select_version(
    conn: &Connection,
    component: ComponentKind,
) -> Result<Option<ComponentVersion>> {
    conn.query_row(
        "SELECT component, tag, installed_at FROM component_versions WHERE component = ?1",
        params![component.as_str()],
        row_to_version,
    )
    .optional()
    .map_err(KeelError::from)
}

fn parse_component(row: &Row<'_>, idx: usize) -> rusqlite::Result<ComponentKind> {
    let raw: String = row.get(idx)?;
    raw.parse::<ComponentKind>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn row_to_file(row: &Row<'_>) -> rusqlite::Result<CachedFile> {
    Ok(CachedFile {
        path: row.get(0)?,
        mtime: row.get(1)?,
        version: row.get(2)?,
        component: parse_component(row, 3)?,
        size: row.get::<_, i64>(4)? as u64,
        hash: row.get(5)?,
    })
}

fn row_to_version(row: &Row<'_>) -> rusqlite::Result<ComponentVersion> {
    Ok(ComponentVersion {
        component: parse_component(row, 0)?,
        tag: row.get(1)?,
        installed_at: row.get(2)?,
    })
}
