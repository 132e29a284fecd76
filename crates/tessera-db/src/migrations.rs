//! Schema migrations for the site database.
//!
//! Each migration is an SQL file compiled into the binary. A migration is
//! recorded in `_tessera_migrations` in the same transaction that applies
//! it, so a failed migration leaves neither its tables nor its record.

use rusqlite::Connection;
use std::collections::BTreeSet;
use thiserror::Error;

/// Migrations in application order, by name and SQL.
const MIGRATIONS: &[(&str, &str)] = &[
    ("000_init", include_str!("migrations/000_init.sql")),
    (
        "001_replica_state",
        include_str!("migrations/001_replica_state.sql"),
    ),
    (
        "002_canonical_stores",
        include_str!("migrations/002_canonical_stores.sql"),
    ),
];

const TRACKING_TABLE: &str = "CREATE TABLE IF NOT EXISTS _tessera_migrations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
)";

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("migration '{name}' failed: {source}")]
    ExecutionFailed {
        name: String,
        source: rusqlite::Error,
    },
    #[error("failed to read migration state: {0}")]
    StateQuery(rusqlite::Error),
}

/// Names of the migrations already applied to `conn`.
pub fn applied_migrations(conn: &Connection) -> Result<BTreeSet<String>, MigrationError> {
    conn.execute_batch(TRACKING_TABLE)
        .map_err(MigrationError::StateQuery)?;
    let mut stmt = conn
        .prepare("SELECT name FROM _tessera_migrations")
        .map_err(MigrationError::StateQuery)?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(MigrationError::StateQuery)?
        .collect::<Result<BTreeSet<_>, _>>()
        .map_err(MigrationError::StateQuery)?;
    Ok(names)
}

/// Applies every pending migration. Returns how many were applied.
pub fn run_migrations(conn: &Connection) -> Result<usize, MigrationError> {
    apply(conn, MIGRATIONS)
}

fn apply(conn: &Connection, migrations: &[(&str, &str)]) -> Result<usize, MigrationError> {
    let done = applied_migrations(conn)?;
    let pending: Vec<_> = migrations
        .iter()
        .filter(|(name, _)| !done.contains(*name))
        .collect();

    for &&(name, sql) in &pending {
        tracing::info!(migration = name, "applying migration");
        let failed = |source| MigrationError::ExecutionFailed {
            name: name.to_string(),
            source,
        };
        let tx = conn.unchecked_transaction().map_err(failed)?;
        tx.execute_batch(sql).map_err(failed)?;
        tx.execute("INSERT INTO _tessera_migrations (name) VALUES (?1)", [name])
            .map_err(failed)?;
        tx.commit().map_err(failed)?;
    }
    Ok(pending.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn has_table(conn: &Connection, name: &str) -> bool {
        conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            [name],
            |row| row.get(0),
        )
        .expect("sqlite_master")
    }

    #[test]
    fn fresh_database_gets_every_table() {
        let conn = Connection::open_in_memory().expect("in-memory db");
        assert_eq!(run_migrations(&conn).expect("migrate"), MIGRATIONS.len());
        assert!(has_table(&conn, "replica_state"));
        assert!(has_table(&conn, "canonical_stores"));

        let names = applied_migrations(&conn).expect("applied");
        assert!(names.contains("002_canonical_stores"));
    }

    #[test]
    fn second_run_applies_nothing() {
        let conn = Connection::open_in_memory().expect("in-memory db");
        run_migrations(&conn).expect("first run");
        assert_eq!(run_migrations(&conn).expect("second run"), 0);
    }

    #[test]
    fn failing_migration_leaves_no_trace() {
        let conn = Connection::open_in_memory().expect("in-memory db");
        let broken = [(
            "900_conflicting_record",
            "CREATE TABLE half_applied (id INTEGER PRIMARY KEY);
             INSERT INTO _tessera_migrations (name) VALUES ('900_conflicting_record');",
        )];

        match apply(&conn, &broken) {
            Err(MigrationError::ExecutionFailed { name, .. }) => {
                assert_eq!(name, "900_conflicting_record")
            }
            other => panic!("expected an execution failure, got {other:?}"),
        }
        assert!(!has_table(&conn, "half_applied"));
        assert!(applied_migrations(&conn).expect("applied").is_empty());
    }
}
