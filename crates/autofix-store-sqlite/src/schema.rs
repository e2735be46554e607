use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, TransactionBehavior};
use serde::{Deserialize, Serialize};

use crate::now_rfc3339;

pub const LATEST_SCHEMA_VERSION: i64 = 2;

pub(crate) const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

pub(crate) const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS fix_history (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  timestamp TEXT NOT NULL,
  model_name TEXT NOT NULL,
  issue_type TEXT NOT NULL,
  issue_signature TEXT NOT NULL CHECK (length(issue_signature) = 16),
  description TEXT NOT NULL,
  analysis TEXT NOT NULL,
  commands_json TEXT NOT NULL,
  fix_applied INTEGER NOT NULL CHECK (fix_applied IN (0, 1)),
  verified INTEGER NOT NULL CHECK (verified IN (0, 1)),
  duration_seconds REAL NOT NULL CHECK (duration_seconds >= 0),
  environment_json TEXT NOT NULL,
  notes TEXT,
  CHECK (verified = 0 OR fix_applied = 1)
);

CREATE TABLE IF NOT EXISTS model_characteristics (
  model_name TEXT PRIMARY KEY,
  total_tests INTEGER NOT NULL DEFAULT 0,
  successful_tests INTEGER NOT NULL DEFAULT 0,
  success_rate REAL NOT NULL DEFAULT 0.0,
  common_issues_json TEXT NOT NULL DEFAULT '[]',
  effective_fixes_json TEXT NOT NULL DEFAULT '[]',
  last_updated TEXT,
  performance_notes TEXT
);

CREATE TABLE IF NOT EXISTS issue_patterns (
  issue_signature TEXT PRIMARY KEY,
  pattern_name TEXT NOT NULL,
  success_count INTEGER NOT NULL DEFAULT 0,
  failure_count INTEGER NOT NULL DEFAULT 0,
  confidence_score REAL NOT NULL DEFAULT 0.0,
  best_fix_json TEXT,
  last_seen TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_fix_history_signature ON fix_history(issue_signature);
CREATE INDEX IF NOT EXISTS idx_fix_history_model_type ON fix_history(model_name, issue_type);
CREATE INDEX IF NOT EXISTS idx_fix_history_type ON fix_history(issue_type);
CREATE INDEX IF NOT EXISTS idx_fix_history_timestamp ON fix_history(timestamp);
";

const MIGRATION_002_SQL: &str = r"
ALTER TABLE fix_history ADD COLUMN backend TEXT NOT NULL DEFAULT 'claude';
CREATE INDEX IF NOT EXISTS idx_fix_history_backend ON fix_history(backend);
";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
}

pub(crate) fn schema_status(conn: &Connection) -> Result<SchemaStatus> {
    conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
        .context("failed to apply schema_migrations table")?;
    let (current_version, inferred_from_legacy) = detect_effective_schema_version(conn)?;
    let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
        ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
    } else {
        Vec::new()
    };

    Ok(SchemaStatus {
        current_version,
        target_version: LATEST_SCHEMA_VERSION,
        pending_versions,
        inferred_from_legacy,
    })
}

/// Bring the attempt log up to [`LATEST_SCHEMA_VERSION`].
///
/// Runs under an immediate transaction so concurrent openers serialize on the
/// write lock instead of racing on `ALTER TABLE`.
pub(crate) fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
        .context("failed to apply schema_migrations table")?;

    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .context("failed to start migration transaction")?;

    let mut version = current_schema_version(&tx)?;
    if version == 0 {
        version = bootstrap_schema_version(&tx)?;
    }

    if version < 2 {
        apply_migration_2(&tx)?;
        version = current_schema_version(&tx)?;
    }

    if version != LATEST_SCHEMA_VERSION {
        return Err(anyhow!(
            "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
        ));
    }

    tx.commit().context("failed to commit schema migrations")?;
    Ok(())
}

fn bootstrap_schema_version(conn: &Connection) -> Result<i64> {
    if !table_exists(conn, "fix_history")? {
        conn.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
        record_schema_version(conn, 1)?;
        return Ok(1);
    }

    if table_has_column(conn, "fix_history", "backend")? {
        // Log already carries per-backend rows but was never versioned.
        record_schema_version(conn, 1)?;
        record_schema_version(conn, 2)?;
        return Ok(2);
    }

    if table_has_column(conn, "fix_history", "issue_signature")? {
        // Single-backend log from before backends were recorded.
        conn.execute_batch(MIGRATION_001_SQL)
            .context("failed to complete legacy v1 tables")?;
        record_schema_version(conn, 1)?;
        return Ok(1);
    }

    Err(anyhow!("database schema is invalid: fix_history has no issue_signature column"))
}

fn apply_migration_2(conn: &Connection) -> Result<()> {
    if !table_has_column(conn, "fix_history", "backend")? {
        conn.execute_batch(MIGRATION_002_SQL).context("failed to apply migration v2")?;
    }
    record_schema_version(conn, 2)
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    if !table_exists(conn, table)? {
        return Ok(false);
    }

    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .with_context(|| format!("failed to inspect table_info for {table}"))?;
    let mut rows = stmt.query([])?;

    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }

    Ok(false)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
        row.get::<_, i64>(0)
    })
    .context("failed to read current schema version")
}

fn detect_effective_schema_version(conn: &Connection) -> Result<(i64, bool)> {
    let recorded = current_schema_version(conn)?;
    if recorded > 0 {
        return Ok((recorded, false));
    }

    if !table_exists(conn, "fix_history")? {
        return Ok((0, false));
    }

    if table_has_column(conn, "fix_history", "backend")? {
        return Ok((2, true));
    }

    if table_has_column(conn, "fix_history", "issue_signature")? {
        return Ok((1, true));
    }

    Err(anyhow!("database schema is invalid: fix_history has no issue_signature column"))
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEGACY_V1_ROW_SQL: &str = r"
        INSERT INTO fix_history(
            timestamp, model_name, issue_type, issue_signature, description, analysis,
            commands_json, fix_applied, verified, duration_seconds, environment_json, notes
        ) VALUES (
            '2025-01-01T00:00:00Z', 'llama3:8b', 'timeout', '0123456789abcdef', 'slow',
            'raise timeout', '[]', 1, 0, 1.5, '{}', NULL
        );
    ";

    #[test]
    fn fresh_database_migrates_to_latest() -> Result<()> {
        let mut conn = Connection::open_in_memory()?;
        migrate(&mut conn)?;

        let status = schema_status(&conn)?;
        assert_eq!(status.current_version, LATEST_SCHEMA_VERSION);
        assert!(status.pending_versions.is_empty());
        assert!(!status.inferred_from_legacy);
        assert!(table_has_column(&conn, "fix_history", "backend")?);
        Ok(())
    }

    #[test]
    fn legacy_single_backend_log_gains_backend_column() -> Result<()> {
        let mut conn = Connection::open_in_memory()?;
        conn.execute_batch(MIGRATION_001_SQL)?;
        conn.execute_batch(LEGACY_V1_ROW_SQL)?;

        let status = schema_status(&conn)?;
        assert_eq!(status.current_version, 1);
        assert_eq!(status.pending_versions, vec![2]);
        assert!(status.inferred_from_legacy);

        migrate(&mut conn)?;

        let backend: String =
            conn.query_row("SELECT backend FROM fix_history WHERE id = 1", [], |row| row.get(0))?;
        assert_eq!(backend, "claude");
        assert_eq!(current_schema_version(&conn)?, 2);
        Ok(())
    }

    #[test]
    fn migrate_is_idempotent() -> Result<()> {
        let mut conn = Connection::open_in_memory()?;
        migrate(&mut conn)?;
        migrate(&mut conn)?;

        let rows: i64 =
            conn.query_row("SELECT COUNT(*) FROM schema_migrations", [], |row| row.get(0))?;
        assert_eq!(rows, 2);
        Ok(())
    }

    #[test]
    fn migrate_rejects_unrecognized_fix_history_table() -> Result<()> {
        let mut conn = Connection::open_in_memory()?;
        conn.execute_batch("CREATE TABLE fix_history(id INTEGER PRIMARY KEY, payload TEXT);")?;

        let err = match migrate(&mut conn) {
            Ok(()) => return Err(anyhow!("expected migration to fail on foreign schema")),
            Err(err) => err,
        };
        assert!(err.to_string().contains("fix_history has no issue_signature column"));
        Ok(())
    }
}
