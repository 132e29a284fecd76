//! Database layer for Tessera sites.
//!
//! A site persists two things: the state of every replica it holds, so it
//! can resume after a restart without trusting stale data, and the archives
//! of the canonical stores it serves. This crate owns the SQLite pool and
//! the schema; the replication crate reads and writes the rows.

mod migrations;
mod pool;

pub use migrations::{applied_migrations, run_migrations, MigrationError};
pub use pool::{create_pool, open_site_db, DbPool, DbRuntimeSettings, PoolError};
