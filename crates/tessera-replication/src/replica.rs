//! The client side of replication.
//!
//! A [`Replica`] holds a local copy of a remote [`CanonicalStore`] together
//! with the version it reflects and the lease (`valid_until`) granted by the
//! source. Readers always see a complete version: updates are validated in
//! full before anything is applied, and then swapped in under a short write
//! lock.
//!
//! [`CanonicalStore`]: crate::CanonicalStore

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::error::ReplicationError;
use crate::store::{Replicable, ReplicaUpdate};

/// Produces updates for a replica.
#[async_trait]
pub trait ReplicaSource<T: Replicable>: Send + Sync {
    /// Returns every change after `from_version`.
    async fn get_update(&self, from_version: u64) -> Result<ReplicaUpdate<T>, ReplicationError>;
}

/// Decides whether a received object may enter a replica.
pub trait ObjectValidator<T>: Send + Sync {
    /// Returns a description of the problem if `object` is not acceptable.
    fn validate(&self, object: &T) -> Result<(), String>;
}

/// Observes changes applied to a replica.
pub trait ReplicaSink<T>: Send + Sync {
    /// Called after a change has been applied, outside of any replica lock.
    fn on_update(&self, created: &[T], deleted: &[T]);
}

/// What a refresh did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The source reported no changes; only the lease was extended.
    Unchanged,
    /// An incremental diff was merged.
    Merged { created: usize, deleted: usize },
    /// The local copy was replaced by the full inventory.
    Resynced { objects: usize },
}

/// The state a replica persists across restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: DeserializeOwned"))]
pub struct ReplicaState<T> {
    pub version: u64,
    pub valid_until: DateTime<Utc>,
    pub objects: Vec<T>,
}

struct Inner<T> {
    version: u64,
    valid_until: DateTime<Utc>,
    objects: Arc<BTreeMap<String, T>>,
}

/// A local, lease-bounded copy of a remote object set.
pub struct Replica<T: Replicable> {
    name: String,
    source: Arc<dyn ReplicaSource<T>>,
    validator: Option<Arc<dyn ObjectValidator<T>>>,
    sinks: RwLock<Vec<Arc<dyn ReplicaSink<T>>>>,
    inner: RwLock<Inner<T>>,
    refreshing: tokio::sync::Mutex<()>,
}

impl<T: Replicable> Replica<T> {
    /// Creates an empty replica. It is invalid until its first refresh.
    pub fn new(name: impl Into<String>, source: Arc<dyn ReplicaSource<T>>) -> Self {
        Self {
            name: name.into(),
            source,
            validator: None,
            sinks: RwLock::new(Vec::new()),
            inner: RwLock::new(Inner {
                version: 0,
                valid_until: DateTime::<Utc>::UNIX_EPOCH,
                objects: Arc::new(BTreeMap::new()),
            }),
            refreshing: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn ObjectValidator<T>>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn with_sink(self, sink: Arc<dyn ReplicaSink<T>>) -> Self {
        self.add_sink(sink);
        self
    }

    pub fn add_sink(&self, sink: Arc<dyn ReplicaSink<T>>) {
        self.sinks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(sink);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> u64 {
        self.read_inner(|inner| inner.version)
    }

    pub fn valid_until(&self) -> DateTime<Utc> {
        self.read_inner(|inner| inner.valid_until)
    }

    /// True while the lease granted by the source has not run out.
    pub fn is_valid(&self) -> bool {
        Utc::now() < self.valid_until()
    }

    /// A consistent snapshot of the objects, keyed by replica key.
    ///
    /// The snapshot is unaffected by later refreshes.
    pub fn snapshot(&self) -> Arc<BTreeMap<String, T>> {
        self.read_inner(|inner| Arc::clone(&inner.objects))
    }

    /// Like [`snapshot`](Self::snapshot), but refuses to hand out data whose
    /// lease has expired.
    pub fn snapshot_checked(&self) -> Result<Arc<BTreeMap<String, T>>, ReplicationError> {
        self.read_inner(|inner| {
            if Utc::now() < inner.valid_until {
                Ok(Arc::clone(&inner.objects))
            } else {
                Err(ReplicationError::LeaseExpired {
                    name: self.name.clone(),
                    valid_until: inner.valid_until,
                })
            }
        })
    }

    pub fn objects(&self) -> Vec<T> {
        self.snapshot().values().cloned().collect()
    }

    pub fn get(&self, key: &str) -> Option<T> {
        self.snapshot().get(key).cloned()
    }

    /// The persistable state of this replica.
    pub fn state(&self) -> ReplicaState<T> {
        self.read_inner(|inner| ReplicaState {
            version: inner.version,
            valid_until: inner.valid_until,
            objects: inner.objects.values().cloned().collect(),
        })
    }

    /// Replaces the local state with previously persisted state.
    ///
    /// Sinks are told about the restored objects. If the persisted lease has
    /// already run out, the replica reports itself invalid and the next
    /// [`ensure_fresh`](Self::ensure_fresh) fetches from the source.
    pub fn restore(&self, state: ReplicaState<T>) {
        let objects: BTreeMap<String, T> = state
            .objects
            .into_iter()
            .map(|o| (o.replica_key(), o))
            .collect();
        let created: Vec<T> = objects.values().cloned().collect();
        let previous = {
            let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
            inner.version = state.version;
            inner.valid_until = state.valid_until;
            std::mem::replace(&mut inner.objects, Arc::new(objects))
        };
        tracing::info!(
            replica = %self.name,
            version = state.version,
            valid_until = %state.valid_until,
            objects = created.len(),
            "restored replica state"
        );
        let deleted: Vec<T> = previous.values().cloned().collect();
        self.notify(&created, &deleted);
    }

    /// Fetches and applies the changes since the local version.
    ///
    /// The update is applied only if every created and deleted object passes
    /// validation. An update whose `from_version` is 0 replaces the whole
    /// local copy; any other update must start at the local version.
    pub async fn refresh(&self) -> Result<UpdateOutcome, ReplicationError> {
        let _guard = self.refreshing.lock().await;

        let local_version = self.version();
        let update = self.source.get_update(local_version).await?;
        self.validate(&update)?;

        if !update.is_full_resync() && update.from_version != local_version {
            return Err(ReplicationError::VersionMismatch {
                local: local_version,
                received: update.from_version,
            });
        }

        let (outcome, created, deleted) = if update.is_full_resync() {
            self.replace_all(update)
        } else {
            self.merge(update)?
        };

        match outcome {
            UpdateOutcome::Unchanged => {
                tracing::trace!(replica = %self.name, "replica unchanged");
            }
            UpdateOutcome::Merged { created, deleted } => {
                tracing::debug!(replica = %self.name, created, deleted, "merged replica update");
            }
            UpdateOutcome::Resynced { objects } => {
                tracing::info!(replica = %self.name, objects, "replica fully resynchronized");
            }
        }

        self.notify(&created, &deleted);
        Ok(outcome)
    }

    /// Refreshes only if the lease has run out.
    pub async fn ensure_fresh(&self) -> Result<(), ReplicationError> {
        if !self.is_valid() {
            self.refresh().await?;
        }
        Ok(())
    }

    /// Like [`ensure_fresh`](Self::ensure_fresh), retrying failed refreshes
    /// with exponential backoff until `timeout` has elapsed.
    pub async fn ensure_fresh_within(
        &self,
        timeout: Duration,
        min_backoff: Duration,
    ) -> Result<(), ReplicationError> {
        let started = tokio::time::Instant::now();
        let mut backoff = min_backoff.max(Duration::from_millis(1));
        loop {
            let error = match self.ensure_fresh().await {
                Ok(()) => return Ok(()),
                Err(e @ ReplicationError::Validation { .. }) => return Err(e),
                Err(e) => e,
            };
            let elapsed = started.elapsed();
            if elapsed + backoff > timeout {
                return Err(ReplicationError::Timeout {
                    name: self.name.clone(),
                    waited_ms: elapsed.as_millis() as u64,
                    last_error: error.to_string(),
                });
            }
            tracing::warn!(replica = %self.name, error = %error, "replica refresh failed, retrying");
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(timeout);
        }
    }

    fn validate(&self, update: &ReplicaUpdate<T>) -> Result<(), ReplicationError> {
        let Some(validator) = &self.validator else {
            return Ok(());
        };
        for object in update.created.iter().chain(update.deleted.iter()) {
            if let Err(reason) = validator.validate(object) {
                let key = object.replica_key();
                tracing::error!(replica = %self.name, key = %key, reason = %reason, "rejected replica update");
                return Err(ReplicationError::Validation { key, reason });
            }
        }
        Ok(())
    }

    /// Applies an incremental update.
    ///
    /// The new map is built from a snapshot outside the write lock; the lock
    /// is held only to swap it in. The snapshot is compared by pointer
    /// before the swap, so a concurrent [`restore`](Self::restore) is not
    /// silently overwritten.
    fn merge(
        &self,
        update: ReplicaUpdate<T>,
    ) -> Result<(UpdateOutcome, Vec<T>, Vec<T>), ReplicationError> {
        if update.created.is_empty() && update.deleted.is_empty() {
            let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
            inner.version = update.to_version;
            inner.valid_until = update.valid_until;
            return Ok((UpdateOutcome::Unchanged, update.created, update.deleted));
        }

        let base = self.snapshot();
        let mut objects = BTreeMap::clone(&base);
        for object in &update.created {
            objects.insert(object.replica_key(), object.clone());
        }
        for object in &update.deleted {
            objects.remove(&object.replica_key());
        }

        let previous = {
            let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
            if !Arc::ptr_eq(&inner.objects, &base) {
                return Err(ReplicationError::VersionMismatch {
                    local: inner.version,
                    received: update.from_version,
                });
            }
            inner.version = update.to_version;
            inner.valid_until = update.valid_until;
            std::mem::replace(&mut inner.objects, Arc::new(objects))
        };
        drop(previous);
        drop(base);

        let outcome = UpdateOutcome::Merged {
            created: update.created.len(),
            deleted: update.deleted.len(),
        };
        Ok((outcome, update.created, update.deleted))
    }

    fn replace_all(&self, update: ReplicaUpdate<T>) -> (UpdateOutcome, Vec<T>, Vec<T>) {
        let incoming: Arc<BTreeMap<String, T>> = Arc::new(
            update
                .created
                .into_iter()
                .map(|o| (o.replica_key(), o))
                .collect(),
        );

        let previous = {
            let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
            inner.version = update.to_version;
            inner.valid_until = update.valid_until;
            std::mem::replace(&mut inner.objects, Arc::clone(&incoming))
        };

        let deleted: Vec<T> = previous
            .iter()
            .filter(|(key, _)| !incoming.contains_key(*key))
            .map(|(_, o)| o.clone())
            .collect();
        let created: Vec<T> = incoming
            .iter()
            .filter(|(key, _)| !previous.contains_key(*key))
            .map(|(_, o)| o.clone())
            .collect();

        (
            UpdateOutcome::Resynced {
                objects: incoming.len(),
            },
            created,
            deleted,
        )
    }

    fn notify(&self, created: &[T], deleted: &[T]) {
        if created.is_empty() && deleted.is_empty() {
            return;
        }
        let sinks = self
            .sinks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for sink in sinks {
            sink.on_update(created, deleted);
        }
    }

    fn read_inner<R>(&self, f: impl FnOnce(&Inner<T>) -> R) -> R {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        f(&inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::CanonicalStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct Item(String, u32);

    impl Replicable for Item {
        fn replica_key(&self) -> String {
            self.0.clone()
        }
    }

    struct RejectOdd;

    impl ObjectValidator<Item> for RejectOdd {
        fn validate(&self, object: &Item) -> Result<(), String> {
            if object.1 % 2 == 1 {
                Err("odd".into())
            } else {
                Ok(())
            }
        }
    }

    #[derive(Default)]
    struct Counter {
        created: AtomicUsize,
        deleted: AtomicUsize,
    }

    impl ReplicaSink<Item> for Counter {
        fn on_update(&self, created: &[Item], deleted: &[Item]) {
            self.created.fetch_add(created.len(), Ordering::SeqCst);
            self.deleted.fetch_add(deleted.len(), Ordering::SeqCst);
        }
    }

    fn store() -> Arc<Mutex<CanonicalStore<Item>>> {
        Arc::new(Mutex::new(CanonicalStore::new(chrono::Duration::seconds(60))))
    }

    #[tokio::test]
    async fn refresh_merges_and_notifies() {
        let source = store();
        source.lock().unwrap().insert(Item("a".into(), 0));
        let counter = Arc::new(Counter::default());
        let replica = Replica::new("items", source.clone()).with_sink(counter.clone());

        assert!(!replica.is_valid());
        let outcome = replica.refresh().await.unwrap();
        assert_eq!(outcome, UpdateOutcome::Resynced { objects: 1 });
        assert!(replica.is_valid());

        source.lock().unwrap().insert(Item("b".into(), 0));
        source.lock().unwrap().delete("a").unwrap();
        let outcome = replica.refresh().await.unwrap();
        assert_eq!(
            outcome,
            UpdateOutcome::Merged {
                created: 1,
                deleted: 1
            }
        );
        assert_eq!(replica.version(), 3);
        assert_eq!(replica.objects(), vec![Item("b".into(), 0)]);
        assert_eq!(counter.created.load(Ordering::SeqCst), 2);
        assert_eq!(counter.deleted.load(Ordering::SeqCst), 1);

        assert_eq!(replica.refresh().await.unwrap(), UpdateOutcome::Unchanged);
    }

    #[tokio::test]
    async fn invalid_update_is_rejected_whole() {
        let source = store();
        source.lock().unwrap().insert(Item("good".into(), 2));
        source.lock().unwrap().insert(Item("bad".into(), 3));
        let replica = Replica::new("items", source.clone()).with_validator(Arc::new(RejectOdd));

        let err = replica.refresh().await.unwrap_err();
        assert!(matches!(err, ReplicationError::Validation { ref key, .. } if key == "bad"));
        assert!(replica.objects().is_empty());
        assert_eq!(replica.version(), 0);
        assert!(!replica.is_valid());
    }

    #[tokio::test]
    async fn snapshots_are_isolated_from_refreshes() {
        let source = store();
        source.lock().unwrap().insert(Item("a".into(), 0));
        let replica = Replica::new("items", source.clone());
        replica.refresh().await.unwrap();

        let before = replica.snapshot();
        source.lock().unwrap().insert(Item("b".into(), 0));
        source.lock().unwrap().delete("a").unwrap();
        replica.refresh().await.unwrap();

        assert_eq!(before.keys().collect::<Vec<_>>(), vec!["a"]);
        let after = replica.snapshot();
        assert_eq!(after.keys().collect::<Vec<_>>(), vec!["b"]);
        assert!(!Arc::ptr_eq(&before, &after));

        // A refresh that changes nothing keeps handing out the same map.
        assert_eq!(replica.refresh().await.unwrap(), UpdateOutcome::Unchanged);
        assert!(Arc::ptr_eq(&after, &replica.snapshot()));
    }

    #[tokio::test]
    async fn expired_lease_blocks_checked_snapshot() {
        let source = store();
        let replica = Replica::new("items", source);
        let err = replica.snapshot_checked().unwrap_err();
        assert!(matches!(err, ReplicationError::LeaseExpired { .. }));

        replica.ensure_fresh().await.unwrap();
        assert!(replica.snapshot_checked().is_ok());
    }

    #[tokio::test]
    async fn restore_of_stale_state_forces_refresh() {
        let source = store();
        source.lock().unwrap().insert(Item("a".into(), 0));
        source.lock().unwrap().insert(Item("b".into(), 0));

        let replica = Replica::new("items", source.clone());
        replica.restore(ReplicaState {
            version: 1,
            valid_until: Utc::now() - chrono::Duration::seconds(1),
            objects: vec![Item("a".into(), 0)],
        });
        assert!(!replica.is_valid());
        assert_eq!(replica.objects().len(), 1);

        replica.ensure_fresh().await.unwrap();
        assert_eq!(replica.version(), 2);
        assert_eq!(replica.objects().len(), 2);
    }

    struct Failing;

    #[async_trait]
    impl ReplicaSource<Item> for Failing {
        async fn get_update(&self, _from: u64) -> Result<ReplicaUpdate<Item>, ReplicationError> {
            Err(ReplicationError::Source("unreachable".into()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ensure_fresh_within_times_out() {
        let replica = Replica::new("items", Arc::new(Failing));
        let err = replica
            .ensure_fresh_within(Duration::from_secs(1), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicationError::Timeout { .. }));
    }
}
