//! Versioned replication of object sets.
//!
//! A [`CanonicalStore`] is the single writable copy of a set of objects. It
//! numbers every mutation and answers "what changed since version N" with a
//! [`ReplicaUpdate`]. A [`Replica`] pulls those updates through a
//! [`ReplicaSource`], validates them, applies them atomically, and tells its
//! [`ReplicaSink`]s what changed.
//!
//! Every update carries a lease (`valid_until`). A replica past its lease is
//! not trusted: [`Replica::snapshot_checked`] refuses to serve it and
//! [`Replica::ensure_fresh`] refreshes it first. [`run_refresh_loop`] keeps
//! a replica fresh in the background.
//!
//! The same machinery distributes policy rules and the party/site registry.

mod error;
pub mod persist;
mod refresh;
mod replica;
mod store;

pub use error::ReplicationError;
pub use refresh::{run_refresh_loop, RefreshSettings};
pub use replica::{
    ObjectValidator, Replica, ReplicaSink, ReplicaSource, ReplicaState, UpdateOutcome,
};
pub use store::{CanonicalStore, Replicable, ReplicaUpdate, StoreArchive};
