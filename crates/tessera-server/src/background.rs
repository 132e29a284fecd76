//! Background tasks for a Tessera site.
//!
//! Includes:
//! - Keeping the registry replica and every rule replica fresh.
//! - Following changes of this site's namespace authority.
//! - Persisting replica state and served archives.

use crate::AppState;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

use tessera_db::DbPool;
use tessera_policy::{RuleStore, SignedRule};
use tessera_registry::{RegisteredObject, RegistryClient};
use tessera_replication::persist::{load_replica_state, save_archive, save_replica_state};
use tessera_replication::{
    run_refresh_loop, RefreshSettings, Replica, ReplicaSink, Replicable, ReplicationError,
};
use tessera_types::Identifier;

/// Archive domain of the local rule store.
pub const RULES_DOMAIN: &str = "rules";
/// Archive domain of the hosted registry.
pub const REGISTRY_DOMAIN: &str = "registry";

const SUPERVISE_INTERVAL: Duration = Duration::from_secs(1);

/// Errors raised while persisting state.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("database connection failed: {0}")]
    Pool(String),
    #[error(transparent)]
    Replication(#[from] ReplicationError),
}

/// Loads the persisted state of `replica`, if any, unless it has already
/// been refreshed. Returns true if state was restored.
pub fn restore_replica<T: Replicable>(
    pool: &DbPool,
    replica: &Replica<T>,
) -> Result<bool, PersistError> {
    if replica.version() > 0 {
        return Ok(false);
    }
    let conn = pool.get().map_err(|e| PersistError::Pool(e.to_string()))?;
    match load_replica_state::<T>(&conn, replica.name())? {
        Some(state) => {
            tracing::info!(
                replica = replica.name(),
                version = state.version,
                valid_until = %state.valid_until,
                "restored persisted replica state"
            );
            replica.restore(state);
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Writes every replica's state and every served archive to the database.
pub fn persist_state(state: &AppState) -> Result<usize, PersistError> {
    let conn = state
        .pool
        .get()
        .map_err(|e| PersistError::Pool(e.to_string()))?;
    let mut written = 0;

    let registry = state.registry_client.replica();
    save_replica_state(&conn, registry.name(), &registry.state())?;
    written += 1;

    for replica in state.policy.replicas().values() {
        save_replica_state(&conn, replica.name(), &replica.state())?;
        written += 1;
    }
    if let Some(rules) = &state.rules {
        save_archive(&conn, RULES_DOMAIN, &rules.archive())?;
        written += 1;
    }
    if let Some(hosted) = &state.registry {
        save_archive(&conn, REGISTRY_DOMAIN, &hosted.archive())?;
        written += 1;
    }
    Ok(written)
}

async fn persist_in_background(state: &Arc<AppState>) {
    let state = Arc::clone(state);
    let res = tokio::task::spawn_blocking(move || persist_state(&state)).await;
    match res {
        Ok(Ok(written)) => tracing::debug!(written, "persisted site state"),
        Ok(Err(e)) => tracing::error!("failed to persist site state: {}", e),
        Err(e) => tracing::error!("persistence task join error: {}", e),
    }
}

/// Periodically persists site state until shutdown, then persists once
/// more.
pub async fn start_persistence_task(
    state: Arc<AppState>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::info!(
        interval_ms = interval.as_millis() as u64,
        "starting persistence task"
    );
    loop {
        tokio::select! {
            _ = sleep(interval) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
        persist_in_background(&state).await;
    }
    persist_in_background(&state).await;
    tracing::info!("persistence task stopped");
}

/// Keeps the registry replica fresh until shutdown.
pub async fn start_registry_refresh(
    state: Arc<AppState>,
    settings: RefreshSettings,
    shutdown: watch::Receiver<bool>,
) {
    let replica = Arc::clone(state.registry_client.replica());
    run_refresh_loop(replica, settings, shutdown).await;
}

/// Runs a refresh loop for every rule replica the policy client tracks.
///
/// Replicas come and go as policy-serving sites are registered and
/// removed; loops are started for new ones and aborted for removed ones.
/// A new replica first resumes from persisted state, if there is any.
pub async fn supervise_rule_replicas(
    state: Arc<AppState>,
    settings: RefreshSettings,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut running: BTreeMap<Identifier, (Arc<Replica<SignedRule>>, JoinHandle<()>)> =
        BTreeMap::new();

    loop {
        let current = state.policy.replicas();

        running.retain(|site, (replica, handle)| {
            let keep = current
                .get(site)
                .is_some_and(|tracked| Arc::ptr_eq(tracked, replica));
            if !keep {
                handle.abort();
                tracing::info!(site = %site, "stopped rule replica refresh loop");
            }
            keep
        });

        for (site, replica) in current {
            if running.contains_key(&site) {
                continue;
            }
            let pool = state.pool.clone();
            let restoring = Arc::clone(&replica);
            match tokio::task::spawn_blocking(move || restore_replica(&pool, &restoring)).await {
                Ok(Err(e)) => tracing::warn!(site = %site, "could not restore rule replica: {}", e),
                Err(e) => tracing::error!("restore task join error: {}", e),
                Ok(Ok(_)) => {}
            }
            let handle = tokio::spawn(run_refresh_loop(
                Arc::clone(&replica),
                settings,
                shutdown.clone(),
            ));
            running.insert(site, (replica, handle));
        }

        tokio::select! {
            _ = sleep(SUPERVISE_INTERVAL) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    for (_, handle) in running.into_values() {
        handle.abort();
    }
}

/// Keeps the authority of a local rule store in line with the registry.
///
/// Holds the registry replica weakly: the replica owns its sinks.
pub struct AuthorityFollower {
    registry: Weak<Replica<RegisteredObject>>,
    store: Arc<RuleStore>,
}

impl AuthorityFollower {
    /// Subscribes a follower for `store` to `registry`.
    pub fn attach(registry: &RegistryClient, store: Arc<RuleStore>) {
        registry.add_sink(Arc::new(Self {
            registry: Arc::downgrade(registry.replica()),
            store,
        }));
    }
}

impl ReplicaSink<RegisteredObject> for AuthorityFollower {
    fn on_update(&self, _created: &[RegisteredObject], _deleted: &[RegisteredObject]) {
        let Some(replica) = self.registry.upgrade() else {
            return;
        };
        let namespace = self.store.namespace();
        match RegistryClient::from_replica(replica).authority_for_namespace(&namespace) {
            Ok(Some(authority)) if authority != self.store.authority() => {
                tracing::info!(
                    namespace = %namespace,
                    owner = %authority.owner,
                    administrators = authority.administrators.len(),
                    "namespace authority changed"
                );
                self.store.set_authority(authority);
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(namespace = %namespace, "cannot look up namespace authority: {}", e),
        }
    }
}
