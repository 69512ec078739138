use rusqlite::{params, Connection, TransactionBehavior};
use serde::{Deserialize, Serialize};
use sqltrie_core::{Result, TrieError};
use time::OffsetDateTime;

use crate::store::EngineContext;

pub(crate) const LATEST_SCHEMA_VERSION: i64 = 1;

pub(crate) const ROOT_ID: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const HAS_SCHEMA_MIGRATIONS_SQL: &str = r"
SELECT EXISTS (
  SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'schema_migrations'
)
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS nodes (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  pid INTEGER REFERENCES nodes(id),
  name TEXT,
  has_value INTEGER NOT NULL DEFAULT 0 CHECK (has_value IN (0, 1)),
  value BLOB,
  UNIQUE (pid, name)
);

INSERT OR IGNORE INTO nodes (id, pid, name, has_value, value) VALUES (1, NULL, NULL, 0, NULL);
";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

/// Bring a freshly opened connection's database up to the latest schema.
///
/// An up-to-date database is only read. Pending migrations run inside an
/// immediate transaction so concurrent first opens of the same file serialize
/// on the write lock, and the version is re-read once the lock is held.
pub(crate) fn migrate(conn: &mut Connection) -> Result<()> {
    let stored = stored_schema_version(conn)?;
    check_supported(stored)?;
    if stored == LATEST_SCHEMA_VERSION {
        return Ok(());
    }

    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .engine_context("failed to start migration transaction")?;
    tx.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
        .engine_context("failed to apply schema_migrations table")?;

    let version = current_schema_version(&tx)?;
    check_supported(version)?;

    if version < 1 {
        tx.execute_batch(MIGRATION_001_SQL).engine_context("failed to apply migration v1")?;
        record_schema_version(&tx, 1)?;
        tracing::debug!(version = 1, "applied sqltrie schema migration");
    }

    tx.commit().engine_context("failed to commit migration transaction")
}

pub(crate) fn schema_status(conn: &Connection) -> Result<SchemaStatus> {
    let current_version = current_schema_version(conn)?;
    let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
        ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
    } else {
        Vec::new()
    };

    Ok(SchemaStatus { current_version, target_version: LATEST_SCHEMA_VERSION, pending_versions })
}

fn check_supported(version: i64) -> Result<()> {
    if version > LATEST_SCHEMA_VERSION {
        return Err(TrieError::Engine(anyhow::anyhow!(
            "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
        )));
    }
    Ok(())
}

/// Version recorded in the database, 0 when it has never been migrated.
fn stored_schema_version(conn: &Connection) -> Result<i64> {
    let has_migrations: bool = conn
        .query_row(HAS_SCHEMA_MIGRATIONS_SQL, [], |row| row.get(0))
        .engine_context("failed to inspect schema tables")?;
    if !has_migrations {
        return Ok(0);
    }
    current_schema_version(conn)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
        row.get::<_, i64>(0)
    })
    .engine_context("failed to read current schema version")
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| TrieError::Engine(anyhow::Error::new(err)))?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .engine_context("failed to record migration version")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use super::*;

    #[test]
    fn migrate_creates_root_node_once() -> Result<()> {
        let mut conn = Connection::open_in_memory()?;
        migrate(&mut conn)?;
        migrate(&mut conn)?;

        let (count, root_pid): (i64, Option<i64>) = conn.query_row(
            "SELECT COUNT(*), MAX(pid) FROM nodes WHERE id = ?1",
            params![ROOT_ID],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        assert_eq!(count, 1);
        assert_eq!(root_pid, None);

        let status = schema_status(&conn)?;
        assert_eq!(status.current_version, LATEST_SCHEMA_VERSION);
        assert!(status.pending_versions.is_empty());
        Ok(())
    }

    #[test]
    fn migrate_rejects_newer_schema_version() -> Result<()> {
        let mut conn = Connection::open_in_memory()?;
        migrate(&mut conn)?;
        conn.execute(
            "INSERT INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![LATEST_SCHEMA_VERSION + 1, "2030-01-01T00:00:00Z"],
        )?;

        let Err(err) = migrate(&mut conn) else {
            return Err(anyhow::anyhow!("expected migration failure for newer schema"));
        };
        assert!(err.to_string().contains("unsupported schema version"));
        Ok(())
    }

    #[test]
    fn up_to_date_schema_needs_no_write_lock() -> Result<()> {
        let mut conn = Connection::open_in_memory()?;
        migrate(&mut conn)?;

        conn.execute_batch("BEGIN IMMEDIATE")?;
        migrate(&mut conn)?;
        conn.execute_batch("COMMIT")?;

        let mut fresh = Connection::open_in_memory()?;
        assert_eq!(stored_schema_version(&fresh)?, 0);
        migrate(&mut fresh)?;
        assert_eq!(stored_schema_version(&fresh)?, LATEST_SCHEMA_VERSION);
        Ok(())
    }

    #[test]
    fn sibling_names_are_unique() -> Result<()> {
        let mut conn = Connection::open_in_memory()?;
        migrate(&mut conn)?;
        conn.execute("INSERT INTO nodes (pid, name) VALUES (1, 'a')", [])?;
        assert!(conn.execute("INSERT INTO nodes (pid, name) VALUES (1, 'a')", []).is_err());
        Ok(())
    }
}
