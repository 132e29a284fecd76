//! Connection pool creation and configuration.

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OpenFlags};
use thiserror::Error;

use crate::migrations::{run_migrations, MigrationError};

/// Runtime tunables for SQLite connection behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbRuntimeSettings {
    /// Milliseconds a connection waits on a locked database.
    pub busy_timeout_ms: u64,
    pub pool_max_size: u32,
}

impl Default for DbRuntimeSettings {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
            pool_max_size: 8,
        }
    }
}

/// Pool of connections to a site database.
pub type DbPool = Pool<SqliteConnectionManager>;

/// Errors raised while opening a site database.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to create database connection pool: {0}")]
    PoolInit(#[from] r2d2::Error),
    #[error("failed to check out a connection for migrations: {0}")]
    Checkout(r2d2::Error),
    #[error(transparent)]
    Migration(#[from] MigrationError),
}

/// Journal modes a site accepts. In-memory databases cannot use WAL.
const ACCEPTED_JOURNAL_MODES: [&str; 2] = ["wal", "memory"];

fn configure_connection(conn: &mut Connection, busy_timeout_ms: u64) -> rusqlite::Result<()> {
    let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    if !ACCEPTED_JOURNAL_MODES.contains(&mode.as_str()) {
        return Err(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
            Some(format!("site database refused WAL journal mode ({mode})")),
        ));
    }
    conn.pragma_update(None, "foreign_keys", true)?;
    conn.pragma_update(None, "busy_timeout", busy_timeout_ms)?;
    Ok(())
}

/// Creates a pool over the SQLite database at `db_path`.
///
/// With `:memory:` every pooled connection sees a private database, so
/// tests sharing state across connections need a pool of one or a file.
pub fn create_pool(db_path: &str, settings: DbRuntimeSettings) -> Result<DbPool, PoolError> {
    let manager = SqliteConnectionManager::file(db_path)
        .with_flags(
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        )
        .with_init(move |conn| configure_connection(conn, settings.busy_timeout_ms));

    let pool = Pool::builder()
        .max_size(settings.pool_max_size)
        .build(manager)?;
    tracing::debug!(
        path = db_path,
        pool_max_size = settings.pool_max_size,
        "site database pool created"
    );
    Ok(pool)
}

/// Creates the pool and brings the schema up to date.
pub fn open_site_db(db_path: &str, settings: DbRuntimeSettings) -> Result<DbPool, PoolError> {
    let pool = create_pool(db_path, settings)?;
    let applied = {
        let conn = pool.get().map_err(PoolError::Checkout)?;
        run_migrations(&conn)?
    };
    if applied > 0 {
        tracing::info!(path = db_path, count = applied, "applied database migrations");
    }
    Ok(pool)
}
