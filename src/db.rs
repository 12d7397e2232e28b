//! SQLite-backed mapping store
//!
//! One row per routing rule: a domain plus a path prefix (`front_uri`)
//! routes to a loopback port, optionally rewriting the prefix to
//! `back_uri`. WAL journaling keeps readers unblocked while the admin
//! tooling writes, and `hot_replace` swaps the whole database file under
//! a running worker without dropping requests.

use crate::error::StoreError;
use anyhow::{anyhow, Context};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

/// One routing rule
#[derive(Debug, Clone, Serialize)]
pub struct Mapping {
    pub id: String,
    pub domain: String,
    pub front_uri: String,
    pub back_port: u16,
    pub back_uri: String,
    pub backend: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

const SCHEMA_SQL: &str = "CREATE TABLE IF NOT EXISTS mappings (
    id TEXT PRIMARY KEY,
    domain TEXT NOT NULL,
    front_uri TEXT NOT NULL,
    back_port INTEGER NOT NULL,
    back_uri TEXT NOT NULL,
    backend TEXT DEFAULT NULL,
    created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
    updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
)";

const INDEX_SQL: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_mappings_domain ON mappings(domain)",
    "CREATE INDEX IF NOT EXISTS idx_mappings_front_uri ON mappings(front_uri)",
    "CREATE INDEX IF NOT EXISTS idx_mappings_domain_front_uri ON mappings(domain, front_uri)",
];

const SELECT_COLUMNS: &str =
    "id, domain, front_uri, back_port, back_uri, backend, created_at, updated_at";

fn row_to_mapping(row: &rusqlite::Row<'_>) -> rusqlite::Result<Mapping> {
    Ok(Mapping {
        id: row.get(0)?,
        domain: row.get(1)?,
        front_uri: row.get(2)?,
        back_port: row.get(3)?,
        back_uri: row.get(4)?,
        backend: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

/// Strip leading and trailing slashes so stored URIs are comparable.
fn normalize_uri(uri: &str) -> &str {
    uri.trim_start_matches('/').trim_end_matches('/')
}

/// Mapping store over a single SQLite file.
///
/// The connection sits behind a mutex as an `Option` so `hot_replace`
/// can pass through a closed state while the file is swapped. Every
/// worker owns its own store; cross-process consistency comes from WAL.
pub struct MappingStore {
    conn: Mutex<Option<Connection>>,
    db_path: PathBuf,
}

impl MappingStore {
    /// Open or create the store, enable WAL, ensure schema and indexes.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db_path = path.as_ref().to_path_buf();

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))
                    .map_err(StoreError::StorageInit)?;
            }
        }

        let conn = Self::open_connection(&db_path).map_err(StoreError::StorageInit)?;

        let store = Self {
            conn: Mutex::new(Some(conn)),
            db_path,
        };

        info!(path = %store.db_path.display(), "Mapping store opened");
        Ok(store)
    }

    fn open_connection(path: &Path) -> anyhow::Result<Connection> {
        let conn = Connection::open(path)
            .with_context(|| format!("opening {}", path.display()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .context("enabling WAL journal mode")?;
        conn.execute(SCHEMA_SQL, []).context("creating mappings table")?;
        for sql in INDEX_SQL {
            conn.execute(sql, []).context("creating index")?;
        }
        Ok(conn)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let guard = self.conn.lock();
        let conn = guard
            .as_ref()
            .ok_or_else(|| StoreError::StorageUnavailable(anyhow!("store is closed")))?;
        f(conn)
    }

    /// Longest-prefix lookup: the mapping whose `front_uri` is the
    /// longest prefix of `request_path` (an empty `front_uri` matches
    /// any path). Ties on length break on `front_uri` ordering so the
    /// result is stable for a given database state.
    pub fn find(&self, domain: &str, request_path: &str) -> Result<Option<Mapping>, StoreError> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {SELECT_COLUMNS} FROM mappings
                 WHERE domain = ?1
                 AND (front_uri = '' OR ?2 LIKE '/' || front_uri || '%')
                 ORDER BY LENGTH(front_uri) DESC, front_uri ASC, id ASC
                 LIMIT 1"
            );
            let mut stmt = conn.prepare_cached(&sql)?;
            let mapping = stmt
                .query_row(params![domain, request_path], row_to_mapping)
                .optional()?;
            Ok(mapping)
        })
    }

    /// All mappings, ordered by `(domain, front_uri)`; optionally
    /// restricted to one domain.
    pub fn list(&self, domain: Option<&str>) -> Result<Vec<Mapping>, StoreError> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {SELECT_COLUMNS} FROM mappings {} ORDER BY domain, front_uri",
                if domain.is_some() { "WHERE domain = ?1" } else { "" }
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = match domain {
                Some(d) => stmt.query_map(params![d], row_to_mapping)?,
                None => stmt.query_map([], row_to_mapping)?,
            };
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    /// Insert a new rule with a fresh id. Duplicate `(domain, front_uri)`
    /// keys are permitted; lookups then pick deterministically.
    pub fn add(
        &self,
        domain: &str,
        front_uri: &str,
        back_port: u16,
        back_uri: &str,
        backend: Option<&str>,
    ) -> Result<Mapping, StoreError> {
        let id = Uuid::new_v4().to_string();
        let front_uri = normalize_uri(front_uri);
        let back_uri = normalize_uri(back_uri);

        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO mappings (id, domain, front_uri, back_port, back_uri, backend)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![id, domain, front_uri, back_port as i64, back_uri, backend],
            )?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {SELECT_COLUMNS} FROM mappings WHERE id = ?1"
            ))?;
            Ok(stmt.query_row(params![id], row_to_mapping)?)
        })
    }

    /// Update fields of an existing rule by id. `None` leaves a field
    /// untouched. Returns whether a row was changed.
    pub fn update(
        &self,
        id: &str,
        front_uri: Option<&str>,
        back_uri: Option<&str>,
        back_port: Option<u16>,
        backend: Option<&str>,
    ) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let mut sets: Vec<String> = Vec::new();
            let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

            if let Some(uri) = front_uri {
                values.push(Box::new(normalize_uri(uri).to_string()));
                sets.push(format!("front_uri = ?{}", values.len()));
            }
            if let Some(uri) = back_uri {
                values.push(Box::new(normalize_uri(uri).to_string()));
                sets.push(format!("back_uri = ?{}", values.len()));
            }
            if let Some(port) = back_port {
                values.push(Box::new(port as i64));
                sets.push(format!("back_port = ?{}", values.len()));
            }
            if let Some(url) = backend {
                values.push(Box::new(url.to_string()));
                sets.push(format!("backend = ?{}", values.len()));
            }

            if sets.is_empty() {
                return Ok(false);
            }
            sets.push("updated_at = CURRENT_TIMESTAMP".to_string());
            values.push(Box::new(id.to_string()));

            let sql = format!(
                "UPDATE mappings SET {} WHERE id = ?{}",
                sets.join(", "),
                values.len()
            );
            let refs: Vec<&dyn rusqlite::ToSql> = values.iter().map(|v| v.as_ref()).collect();
            let affected = conn.execute(&sql, refs.as_slice())?;
            Ok(affected > 0)
        })
    }

    /// Delete by domain, optionally narrowed to one front URI. Returns
    /// the number of rows removed.
    pub fn delete(&self, domain: &str, front_uri: Option<&str>) -> Result<usize, StoreError> {
        self.with_conn(|conn| {
            let affected = match front_uri {
                Some(uri) => conn.execute(
                    "DELETE FROM mappings WHERE domain = ?1 AND front_uri = ?2",
                    params![domain, normalize_uri(uri)],
                )?,
                None => conn.execute("DELETE FROM mappings WHERE domain = ?1", params![domain])?,
            };
            Ok(affected)
        })
    }

    /// Exact lookup on the logical routing key.
    pub fn find_exact(&self, domain: &str, front_uri: &str) -> Result<Option<Mapping>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SELECT_COLUMNS} FROM mappings WHERE domain = ?1 AND front_uri = ?2"
            ))?;
            Ok(stmt
                .query_row(params![domain, normalize_uri(front_uri)], row_to_mapping)
                .optional()?)
        })
    }

    pub fn get_by_id(&self, id: &str) -> Result<Option<Mapping>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SELECT_COLUMNS} FROM mappings WHERE id = ?1"
            ))?;
            Ok(stmt.query_row(params![id], row_to_mapping).optional()?)
        })
    }

    /// Whether any rule exists for the domain. Drives TLS authorization:
    /// only mapped hosts may trigger ACME issuance.
    pub fn domain_exists(&self, domain: &str) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM mappings WHERE domain = ?1",
                params![domain],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
    }

    /// Replace the backing database file with `new_path` without
    /// restarting the worker.
    ///
    /// The candidate is validated before the current connection closes.
    /// If anything fails after the close, the original file is reopened
    /// and the error surfaces as `HotReplaceFailed`; if even the reopen
    /// fails the store is dead (`StorageUnavailable`) and the worker
    /// must exit.
    pub fn hot_replace<P: AsRef<Path>>(&self, new_path: P) -> Result<(), StoreError> {
        let new_path = new_path.as_ref();

        // Validate the candidate before touching the live connection.
        Self::verify_candidate(new_path).map_err(StoreError::HotReplaceFailed)?;

        let mut guard = self.conn.lock();
        // Close: flush and drop the current connection.
        guard.take();

        let result = std::fs::copy(new_path, &self.db_path)
            .map(|_| ())
            .with_context(|| {
                format!(
                    "copying {} over {}",
                    new_path.display(),
                    self.db_path.display()
                )
            })
            .and_then(|_| Self::open_connection(&self.db_path));

        match result {
            Ok(conn) => {
                *guard = Some(conn);
                info!(path = %new_path.display(), "Mapping database hot-swapped");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Hot replace failed, reopening original database");
                match Self::open_connection(&self.db_path) {
                    Ok(conn) => {
                        *guard = Some(conn);
                        Err(StoreError::HotReplaceFailed(e))
                    }
                    Err(reopen_err) => Err(StoreError::StorageUnavailable(
                        reopen_err.context(format!("after failed hot replace: {e}")),
                    )),
                }
            }
        }
    }

    fn verify_candidate(path: &Path) -> anyhow::Result<()> {
        let conn = Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
        )
        .with_context(|| format!("opening candidate {}", path.display()))?;
        let has_table: bool = conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='mappings'",
                [],
                |row| row.get(0),
            )
            .context("inspecting candidate schema")?;
        if !has_table {
            anyhow::bail!("candidate {} has no mappings table", path.display());
        }
        Ok(())
    }

    /// Flush and release the connection.
    pub fn close(&self) {
        self.conn.lock().take();
    }
}
