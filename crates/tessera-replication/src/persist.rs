//! SQLite persistence for replicas and canonical stores.
//!
//! Object sets are stored as JSON blobs; they hold low-velocity data
//! (rules, party and site descriptions) and are always read and written as a
//! whole.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::ReplicationError;
use crate::replica::ReplicaState;
use crate::store::{Replicable, StoreArchive};

/// Saves the state of the replica named `name`, replacing any earlier state.
pub fn save_replica_state<T: Replicable>(
    conn: &Connection,
    name: &str,
    state: &ReplicaState<T>,
) -> Result<(), ReplicationError> {
    let objects_json = serde_json::to_string(&state.objects)?;
    conn.execute(
        "INSERT INTO replica_state (name, version, valid_until, objects_json, updated_at)
         VALUES (?1, ?2, ?3, ?4, datetime('now'))
         ON CONFLICT(name) DO UPDATE SET
            version = excluded.version,
            valid_until = excluded.valid_until,
            objects_json = excluded.objects_json,
            updated_at = excluded.updated_at",
        params![
            name,
            state.version as i64,
            state.valid_until.to_rfc3339(),
            objects_json
        ],
    )?;
    Ok(())
}

/// Loads the persisted state of the replica named `name`, if any.
pub fn load_replica_state<T: Replicable>(
    conn: &Connection,
    name: &str,
) -> Result<Option<ReplicaState<T>>, ReplicationError> {
    let row: Option<(i64, String, String)> = conn
        .query_row(
            "SELECT version, valid_until, objects_json FROM replica_state WHERE name = ?1",
            [name],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;

    let Some((version, valid_until, objects_json)) = row else {
        return Ok(None);
    };

    let valid_until = DateTime::parse_from_rfc3339(&valid_until)
        .map_err(|e| ReplicationError::Corrupt(format!("replica '{name}' valid_until: {e}")))?
        .with_timezone(&Utc);
    let version = u64::try_from(version)
        .map_err(|_| ReplicationError::Corrupt(format!("replica '{name}' version {version}")))?;

    Ok(Some(ReplicaState {
        version,
        valid_until,
        objects: serde_json::from_str(&objects_json)?,
    }))
}

/// Saves the archive of the canonical store for `domain`.
pub fn save_archive<T: Replicable>(
    conn: &Connection,
    domain: &str,
    archive: &StoreArchive<T>,
) -> Result<(), ReplicationError> {
    let archive_json = serde_json::to_string(archive)?;
    conn.execute(
        "INSERT INTO canonical_stores (domain, version, archive_json, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(domain) DO UPDATE SET
            version = excluded.version,
            archive_json = excluded.archive_json,
            updated_at = excluded.updated_at",
        params![domain, archive.version() as i64, archive_json],
    )?;
    Ok(())
}

/// Loads the archive of the canonical store for `domain`, if any.
pub fn load_archive<T: Replicable>(
    conn: &Connection,
    domain: &str,
) -> Result<Option<StoreArchive<T>>, ReplicationError> {
    let json: Option<String> = conn
        .query_row(
            "SELECT archive_json FROM canonical_stores WHERE domain = ?1",
            [domain],
            |row| row.get(0),
        )
        .optional()?;
    json.map(|j| serde_json::from_str(&j).map_err(ReplicationError::from))
        .transpose()
}
