//! Durable, resumable optimization log: one SQLite file per session.
//!
//! Every public method opens its own connection, so a store handle can be
//! kept for the whole session without holding the file open between
//! evaluations.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use indexmap::IndexMap;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, warn};

use crate::errors::{CalResult, CalibrationError};
use crate::models::{OptimizationLogEntry, SimulationRunRecord};
use crate::store::schema;

/// File extension of session stores.
pub const SESSION_EXTENSION: &str = "sqlite3";

const META_NAME: &str = "session_name";
const META_ID: &str = "session_id";
const META_CASE: &str = "case_name";
const META_DIGEST: &str = "contract_digest";

/// Identity of a session as recorded in `session_meta`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub name: String,
    pub id: String,
    pub case_name: String,
    /// SHA-256 of the contract file the session was started from.
    pub contract_digest: String,
}

/// Summary row for [`list_sessions`].
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    pub path: PathBuf,
    pub info: Option<SessionInfo>,
    pub observations: u64,
    pub best_target: Option<f64>,
}

/// `<logs_dir>/<id>_<name>.sqlite3`
pub fn session_path(logs_dir: &Path, id: &str, name: &str) -> PathBuf {
    logs_dir.join(format!("{id}_{name}.{SESSION_EXTENSION}"))
}

pub struct SessionStore {
    db_path: PathBuf,
}

impl SessionStore {
    /// Open the store at `path`, creating and migrating it when needed.
    pub fn open(path: impl Into<PathBuf>) -> CalResult<Self> {
        let db_path = path.into();
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let store = Self { db_path };
        let conn = store.connect()?;
        for stmt in schema::SCHEMA_STATEMENTS {
            conn.execute_batch(stmt)?;
        }
        schema::migrate_schema(&conn)?;
        debug!(path = %store.db_path.display(), "opened session store");
        Ok(store)
    }

    /// Open an existing store without creating one.
    pub fn open_existing(path: &Path) -> CalResult<Self> {
        if !path.is_file() {
            return Err(CalibrationError::Config(format!(
                "session store '{}' does not exist",
                path.display()
            )));
        }
        Self::open(path)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn connect(&self) -> CalResult<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(conn)
    }

    // -- session_meta ---------------------------------------------------------

    fn set_meta(conn: &Connection, key: &str, value: &str) -> CalResult<()> {
        conn.execute(
            "INSERT INTO session_meta(key, value) VALUES(?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value;",
            params![key, value],
        )?;
        Ok(())
    }

    fn get_meta(conn: &Connection, key: &str) -> CalResult<Option<String>> {
        let value = conn
            .query_row(
                "SELECT value FROM session_meta WHERE key = ?1;",
                params![key],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?;
        Ok(value.flatten())
    }

    /// Record the session identity. A store that already carries one keeps
    /// its name, id and case; a differing contract digest is logged and the
    /// new digest recorded.
    pub fn bind_session(&self, info: &SessionInfo) -> CalResult<SessionInfo> {
        let conn = self.connect()?;
        let previous_digest = Self::get_meta(&conn, META_DIGEST)?;
        if let Some(previous) = &previous_digest {
            if previous != &info.contract_digest {
                warn!(
                    store = %self.db_path.display(),
                    "contract file changed since the session was recorded"
                );
            }
        }
        for (key, value) in [(META_NAME, &info.name), (META_ID, &info.id), (META_CASE, &info.case_name)] {
            if Self::get_meta(&conn, key)?.is_none() {
                Self::set_meta(&conn, key, value)?;
            }
        }
        Self::set_meta(&conn, META_DIGEST, &info.contract_digest)?;
        Ok(Self::read_info(&conn)?.unwrap_or_else(|| info.clone()))
    }

    pub fn info(&self) -> CalResult<Option<SessionInfo>> {
        let conn = self.connect()?;
        Self::read_info(&conn)
    }

    fn read_info(conn: &Connection) -> CalResult<Option<SessionInfo>> {
        let (Some(name), Some(id)) = (Self::get_meta(conn, META_NAME)?, Self::get_meta(conn, META_ID)?) else {
            return Ok(None);
        };
        Ok(Some(SessionInfo {
            name,
            id,
            case_name: Self::get_meta(conn, META_CASE)?.unwrap_or_default(),
            contract_digest: Self::get_meta(conn, META_DIGEST)?.unwrap_or_default(),
        }))
    }

    // -- observations ---------------------------------------------------------

    /// Append one completed evaluation. Sequence numbers are unique.
    pub fn append_observation(&self, entry: &OptimizationLogEntry) -> CalResult<()> {
        let conn = self.connect()?;
        let params_json = serde_json::to_string(&entry.params)?;
        conn.execute(
            "INSERT INTO observations(seq, target, params_json) VALUES (?1, ?2, ?3);",
            params![entry.seq as i64, entry.target, params_json],
        )?;
        debug!(seq = entry.seq, target = entry.target, "logged observation");
        Ok(())
    }

    /// All observations in sequence order.
    pub fn load_observations(&self) -> CalResult<Vec<OptimizationLogEntry>> {
        let conn = self.connect()?;
        let mut stmt =
            conn.prepare("SELECT seq, target, params_json FROM observations ORDER BY seq ASC;")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, f64>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut entries = Vec::new();
        for row in rows {
            let (seq, target, params_json) = row?;
            let params: IndexMap<String, f64> = serde_json::from_str(&params_json)?;
            entries.push(OptimizationLogEntry {
                seq: seq as u64,
                target,
                params,
            });
        }
        Ok(entries)
    }

    pub fn observation_count(&self) -> CalResult<u64> {
        let conn = self.connect()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM observations;", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn best_target(&self) -> CalResult<Option<f64>> {
        let conn = self.connect()?;
        let best: Option<f64> = conn.query_row("SELECT MAX(target) FROM observations;", [], |row| row.get(0))?;
        Ok(best)
    }

    // -- simulation_runs ------------------------------------------------------

    pub fn record_run(&self, record: &SimulationRunRecord) -> CalResult<()> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO simulation_runs(batch_index, run_id, case_name, document_path, \
             started_at, duration_secs, artifact_path, peak_memory_bytes) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8);",
            params![
                record.batch_index as i64,
                record.run_id,
                record.case_name,
                record.document_path.to_string_lossy().into_owned(),
                record.started_at.to_rfc3339(),
                record.duration.as_secs_f64(),
                record.artifact_path.to_string_lossy().into_owned(),
                record.peak_memory_bytes.map(|b| b as i64),
            ],
        )?;
        Ok(())
    }

    pub fn run_count(&self) -> CalResult<u64> {
        let conn = self.connect()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM simulation_runs;", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Wall-clock seconds spent in the simulation across all recorded runs.
    pub fn total_run_secs(&self) -> CalResult<f64> {
        let conn = self.connect()?;
        let total: Option<f64> =
            conn.query_row("SELECT SUM(duration_secs) FROM simulation_runs;", [], |row| row.get(0))?;
        Ok(total.unwrap_or(0.0))
    }

    // -- snapshot ---------------------------------------------------------------

    /// Copy the store to `destination` with the SQLite backup API, so a
    /// session still being written can be exported consistently.
    pub fn backup_to(&self, destination: &Path) -> CalResult<PathBuf> {
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }
        let src_conn = self.connect()?;
        let mut dst_conn = Connection::open(destination)?;
        let backup = rusqlite::backup::Backup::new(&src_conn, &mut dst_conn)?;
        backup.run_to_completion(100, Duration::from_millis(10), None)?;
        debug!(from = %self.db_path.display(), to = %destination.display(), "session store copied");
        Ok(destination.to_path_buf())
    }
}

/// Session stores under `logs_dir`, sorted by file name.
pub fn list_sessions(logs_dir: &Path) -> CalResult<Vec<SessionSummary>> {
    if !logs_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut paths: Vec<PathBuf> = fs::read_dir(logs_dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == SESSION_EXTENSION))
        .collect();
    paths.sort();

    let mut sessions = Vec::with_capacity(paths.len());
    for path in paths {
        let store = SessionStore::open(&path)?;
        sessions.push(SessionSummary {
            info: store.info()?,
            observations: store.observation_count()?,
            best_target: store.best_target()?,
            path,
        });
    }
    Ok(sessions)
}
