//! SQLite schema DDL and migration framework for session stores.

use rusqlite::{params, Connection};
use tracing::debug;

use crate::errors::CalResult;

/// Current schema version. Migrations run from whatever the store currently
/// reports up to this value.
pub const SCHEMA_VERSION: i32 = 2;

/// Base DDL, safe to replay on an already-initialised store.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS session_meta (
        key TEXT PRIMARY KEY,
        value TEXT
    );",
    "CREATE TABLE IF NOT EXISTS observations (
        seq INTEGER PRIMARY KEY,
        target REAL NOT NULL,
        params_json TEXT NOT NULL,
        created_at TEXT DEFAULT CURRENT_TIMESTAMP
    );",
    "CREATE TABLE IF NOT EXISTS simulation_runs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        batch_index INTEGER NOT NULL,
        run_id TEXT NOT NULL,
        case_name TEXT NOT NULL,
        document_path TEXT NOT NULL,
        started_at TEXT NOT NULL,
        duration_secs REAL NOT NULL,
        artifact_path TEXT NOT NULL,
        peak_memory_bytes INTEGER,
        created_at TEXT DEFAULT CURRENT_TIMESTAMP
    );",
    "CREATE TABLE IF NOT EXISTS migration_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        from_version INTEGER NOT NULL,
        to_version INTEGER NOT NULL,
        status TEXT NOT NULL,
        error_message TEXT,
        created_at TEXT DEFAULT CURRENT_TIMESTAMP
    );",
];

// ─── Migrations ─────────────────────────────────────────────────────────────

type MigrationStep = fn(&Connection) -> CalResult<()>;

/// `STEPS[i]` upgrades a store from version `i` to `i + 1`.
const STEPS: [MigrationStep; SCHEMA_VERSION as usize] = [baseline, index_runs_by_batch];

const SAVEPOINT: &str = "sphcal_migrate_step";

/// Bring the store up to [`SCHEMA_VERSION`], one SAVEPOINT per step. A failed
/// step is rolled back on its own, recorded in `migration_history`, and
/// returned.
pub fn migrate_schema(conn: &Connection) -> CalResult<()> {
    let start = get_schema_version(conn).max(0);
    for from in start..SCHEMA_VERSION {
        let to = from + 1;
        conn.execute_batch(&format!("SAVEPOINT {SAVEPOINT};"))?;
        let applied = STEPS[from as usize](conn)
            .and_then(|_| set_schema_version(conn, to))
            .and_then(|_| record_step(conn, from, to, None));
        match applied {
            Ok(()) => conn.execute_batch(&format!("RELEASE SAVEPOINT {SAVEPOINT};"))?,
            Err(e) => {
                let _ = conn.execute_batch(&format!(
                    "ROLLBACK TO SAVEPOINT {SAVEPOINT}; RELEASE SAVEPOINT {SAVEPOINT};"
                ));
                let _ = record_step(conn, from, to, Some(&e.to_string()));
                return Err(e);
            }
        }
        debug!(from, to, "session store migrated");
    }
    Ok(())
}

/// Stored schema version; 0 when absent or unparseable.
pub fn get_schema_version(conn: &Connection) -> i32 {
    conn.query_row(
        "SELECT value FROM session_meta WHERE key = 'schema_version';",
        [],
        |row| row.get::<_, String>(0),
    )
    .ok()
    .and_then(|v| v.parse().ok())
    .unwrap_or(0)
}

fn set_schema_version(conn: &Connection, version: i32) -> CalResult<()> {
    conn.execute(
        "INSERT INTO session_meta(key, value) VALUES('schema_version', ?1) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value;",
        params![version.to_string()],
    )?;
    Ok(())
}

fn record_step(conn: &Connection, from: i32, to: i32, error: Option<&str>) -> CalResult<()> {
    let status = if error.is_some() { "failed" } else { "success" };
    conn.execute(
        "INSERT INTO migration_history(from_version, to_version, status, error_message) \
         VALUES (?1, ?2, ?3, ?4);",
        params![from, to, status, error],
    )?;
    Ok(())
}

/// v0 -> v1: tables come from [`SCHEMA_STATEMENTS`].
fn baseline(_conn: &Connection) -> CalResult<()> {
    Ok(())
}

/// v1 -> v2: per-batch run lookups.
fn index_runs_by_batch(conn: &Connection) -> CalResult<()> {
    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_simulation_runs_batch ON simulation_runs(batch_index);",
    )?;
    Ok(())
}
