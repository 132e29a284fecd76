//! The authoritative side of replication.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Mutex;

use crate::error::ReplicationError;
use crate::replica::ReplicaSource;

/// An object that can be distributed through replication.
///
/// Objects are identified by `replica_key`; two objects with the same key
/// are versions of the same thing.
pub trait Replicable: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    fn replica_key(&self) -> String;
}

/// A versioned diff between two states of a canonical store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: DeserializeOwned"))]
pub struct ReplicaUpdate<T> {
    /// The version this update applies to. Zero means the update carries the
    /// full inventory and replaces whatever the replica holds.
    pub from_version: u64,
    pub to_version: u64,
    /// Replicas must refresh again before this instant.
    pub valid_until: DateTime<Utc>,
    pub created: Vec<T>,
    pub deleted: Vec<T>,
}

impl<T> ReplicaUpdate<T> {
    pub fn is_full_resync(&self) -> bool {
        self.from_version == 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: DeserializeOwned"))]
struct Record<T> {
    created: u64,
    deleted: Option<u64>,
    object: T,
}

impl<T> Record<T> {
    fn alive_at(&self, version: u64) -> bool {
        self.created <= version && self.deleted.map_or(true, |d| version < d)
    }
}

/// The persisted form of a [`CanonicalStore`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: DeserializeOwned"))]
pub struct StoreArchive<T> {
    records: Vec<Record<T>>,
    version: u64,
    /// History of deletions at or below this version has been discarded.
    compacted_below: u64,
}

impl<T> Default for StoreArchive<T> {
    fn default() -> Self {
        Self {
            records: Vec::new(),
            version: 0,
            compacted_below: 0,
        }
    }
}

impl<T> StoreArchive<T> {
    pub fn version(&self) -> u64 {
        self.version
    }
}

/// A writable, versioned set of objects that replicas copy from.
///
/// Every insertion and deletion advances the version by one, so mutations
/// are totally ordered. The store keeps deleted records so it can tell
/// replicas what disappeared since their version, until compacted.
#[derive(Debug, Clone)]
pub struct CanonicalStore<T> {
    archive: StoreArchive<T>,
    max_lag: Duration,
}

impl<T: Replicable> CanonicalStore<T> {
    /// Creates an empty store whose replicas may lag by at most `max_lag`.
    pub fn new(max_lag: Duration) -> Self {
        Self::from_archive(StoreArchive::default(), max_lag)
    }

    pub fn from_archive(archive: StoreArchive<T>, max_lag: Duration) -> Self {
        Self { archive, max_lag }
    }

    pub fn archive(&self) -> &StoreArchive<T> {
        &self.archive
    }

    pub fn version(&self) -> u64 {
        self.archive.version
    }

    pub fn max_lag(&self) -> Duration {
        self.max_lag
    }

    /// Live objects.
    pub fn objects(&self) -> impl Iterator<Item = &T> {
        self.archive
            .records
            .iter()
            .filter(|r| r.deleted.is_none())
            .map(|r| &r.object)
    }

    /// The live object with `key`, if any.
    pub fn get(&self, key: &str) -> Option<&T> {
        self.objects().find(|o| o.replica_key() == key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Adds an object, returning the new version.
    ///
    /// Returns `None` without changing anything if a live object with the
    /// same key already exists.
    pub fn insert(&mut self, object: T) -> Option<u64> {
        if self.contains(&object.replica_key()) {
            return None;
        }
        let version = self.archive.version + 1;
        self.archive.records.push(Record {
            created: version,
            deleted: None,
            object,
        });
        self.archive.version = version;
        Some(version)
    }

    /// Removes the live object with `key`, returning it and the new version.
    pub fn delete(&mut self, key: &str) -> Result<(T, u64), ReplicationError> {
        let version = self.archive.version + 1;
        let record = self
            .archive
            .records
            .iter_mut()
            .find(|r| r.deleted.is_none() && r.object.replica_key() == key)
            .ok_or_else(|| ReplicationError::NotFound(key.to_string()))?;
        record.deleted = Some(version);
        let object = record.object.clone();
        self.archive.version = version;
        Ok((object, version))
    }

    /// Returns what changed after `from_version`, up to the current version.
    ///
    /// If the caller's version is older than the retained history, or newer
    /// than anything this store has issued, the answer is a full resync:
    /// `from_version` is 0, `created` is the whole inventory and `deleted`
    /// is empty. A key never appears in both `created` and `deleted`.
    pub fn get_updates_since(&self, from_version: u64) -> ReplicaUpdate<T> {
        let to_version = self.archive.version;
        let valid_until = Utc::now() + self.max_lag;

        if from_version < self.archive.compacted_below || from_version > to_version {
            tracing::debug!(
                from_version,
                to_version,
                compacted_below = self.archive.compacted_below,
                "serving full resync"
            );
            return ReplicaUpdate {
                from_version: 0,
                to_version,
                valid_until,
                created: self.objects().cloned().collect(),
                deleted: Vec::new(),
            };
        }

        let created: Vec<T> = self
            .archive
            .records
            .iter()
            .filter(|r| from_version < r.created && r.alive_at(to_version))
            .map(|r| r.object.clone())
            .collect();

        let created_keys: BTreeSet<String> = created.iter().map(|o| o.replica_key()).collect();

        let deleted = self
            .archive
            .records
            .iter()
            .filter(|r| r.alive_at(from_version) && !r.alive_at(to_version))
            .filter(|r| !created_keys.contains(&r.object.replica_key()))
            .map(|r| r.object.clone())
            .collect();

        ReplicaUpdate {
            from_version,
            to_version,
            valid_until,
            created,
            deleted,
        }
    }

    /// Drops records of objects deleted at or before `below`.
    ///
    /// Replicas at a version older than `below` can no longer be updated
    /// incrementally and will receive a full resync. Returns the number of
    /// records dropped.
    pub fn compact(&mut self, below: u64) -> usize {
        let below = below.min(self.archive.version);
        let before = self.archive.records.len();
        self.archive
            .records
            .retain(|r| r.deleted.map_or(true, |d| d > below));
        self.archive.compacted_below = self.archive.compacted_below.max(below);
        let dropped = before - self.archive.records.len();
        tracing::info!(below, dropped, "compacted canonical store");
        dropped
    }
}

#[async_trait]
impl<T: Replicable> ReplicaSource<T> for Mutex<CanonicalStore<T>> {
    async fn get_update(&self, from_version: u64) -> Result<ReplicaUpdate<T>, ReplicationError> {
        let store = self.lock().unwrap_or_else(|e| e.into_inner());
        Ok(store.get_updates_since(from_version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct Item(String, u32);

    impl Replicable for Item {
        fn replica_key(&self) -> String {
            self.0.clone()
        }
    }

    fn keys(items: &[Item]) -> Vec<String> {
        let mut keys: Vec<String> = items.iter().map(|i| i.0.clone()).collect();
        keys.sort();
        keys
    }

    #[test]
    fn versions_advance_per_mutation() {
        let mut store = CanonicalStore::new(Duration::seconds(10));
        assert_eq!(store.insert(Item("a".into(), 1)), Some(1));
        assert_eq!(store.insert(Item("b".into(), 1)), Some(2));
        assert_eq!(store.insert(Item("a".into(), 2)), None);
        assert_eq!(store.delete("a").unwrap().1, 3);
        assert!(matches!(store.delete("a"), Err(ReplicationError::NotFound(_))));
        assert_eq!(store.version(), 3);
    }

    #[test]
    fn diff_reports_creations_and_deletions() {
        let mut store = CanonicalStore::new(Duration::seconds(10));
        store.insert(Item("a".into(), 1));
        store.insert(Item("b".into(), 1));
        let v2 = store.get_updates_since(0);
        assert_eq!(keys(&v2.created), vec!["a", "b"]);
        assert!(v2.deleted.is_empty());

        store.delete("a").unwrap();
        store.insert(Item("c".into(), 1));
        let diff = store.get_updates_since(2);
        assert_eq!(diff.from_version, 2);
        assert_eq!(diff.to_version, 4);
        assert_eq!(keys(&diff.created), vec!["c"]);
        assert_eq!(keys(&diff.deleted), vec!["a"]);
    }

    #[test]
    fn readded_key_only_appears_as_created() {
        let mut store = CanonicalStore::new(Duration::seconds(10));
        store.insert(Item("a".into(), 1));
        store.delete("a").unwrap();
        store.insert(Item("a".into(), 2));

        let diff = store.get_updates_since(1);
        assert_eq!(diff.created, vec![Item("a".into(), 2)]);
        assert!(diff.deleted.is_empty());
    }

    #[test]
    fn created_then_deleted_within_window_is_invisible() {
        let mut store = CanonicalStore::new(Duration::seconds(10));
        store.insert(Item("a".into(), 1));
        store.insert(Item("b".into(), 1));
        store.delete("b").unwrap();
        let diff = store.get_updates_since(1);
        assert!(diff.created.is_empty());
        assert!(diff.deleted.is_empty());
    }

    #[test]
    fn compaction_forces_full_resync() {
        let mut store = CanonicalStore::new(Duration::seconds(10));
        for i in 0..6 {
            store.insert(Item(format!("k{i}"), i));
        }
        store.delete("k0").unwrap();
        store.delete("k1").unwrap();
        assert_eq!(store.compact(8), 2);

        let update = store.get_updates_since(5);
        assert!(update.is_full_resync());
        assert_eq!(update.to_version, 8);
        assert_eq!(keys(&update.created), vec!["k2", "k3", "k4", "k5"]);

        let current = store.get_updates_since(8);
        assert!(!current.is_full_resync());
        assert!(current.created.is_empty());
    }

    #[test]
    fn future_version_gets_resync() {
        let mut store = CanonicalStore::new(Duration::seconds(10));
        store.insert(Item("a".into(), 1));
        let update = store.get_updates_since(42);
        assert!(update.is_full_resync());
        assert_eq!(update.created.len(), 1);
    }

    #[test]
    fn archive_survives_serialization() {
        let mut store = CanonicalStore::new(Duration::seconds(10));
        store.insert(Item("a".into(), 1));
        store.delete("a").unwrap();
        store.insert(Item("b".into(), 1));

        let json = serde_json::to_string(store.archive()).unwrap();
        let archive: StoreArchive<Item> = serde_json::from_str(&json).unwrap();
        let restored = CanonicalStore::from_archive(archive, Duration::seconds(10));
        assert_eq!(restored.version(), 3);
        assert_eq!(
            restored.get_updates_since(1).deleted,
            store.get_updates_since(1).deleted
        );
    }
}
