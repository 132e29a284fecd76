use async_trait::async_trait;
use std::sync::Mutex;

use tessera_replication::{
    CanonicalStore, ReplicaSource, ReplicaUpdate, ReplicationError, StoreArchive,
};
use tessera_types::{Identifier, PartyDescription, SiteDescription};

use crate::error::RegistryError;
use crate::object::RegisteredObject;

/// The writable directory of parties and sites.
///
/// There is one registry in a deployment; every site holds a
/// [`RegistryClient`](crate::RegistryClient) replica of it.
pub struct Registry {
    store: Mutex<CanonicalStore<RegisteredObject>>,
}

impl Registry {
    pub fn new(max_lag: chrono::Duration) -> Self {
        Self::from_archive(StoreArchive::default(), max_lag)
    }

    pub fn from_archive(archive: StoreArchive<RegisteredObject>, max_lag: chrono::Duration) -> Self {
        Self {
            store: Mutex::new(CanonicalStore::from_archive(archive, max_lag)),
        }
    }

    /// Registers a party. Each namespace has exactly one owner.
    pub fn register_party(&self, party: PartyDescription) -> Result<u64, RegistryError> {
        party.validate()?;
        let mut store = self.store.lock().unwrap_or_else(|e| e.into_inner());

        if store.contains(party.id.as_str()) {
            return Err(RegistryError::AlreadyRegistered(party.id));
        }
        if let Some(owner) = store
            .objects()
            .filter_map(RegisteredObject::as_party)
            .find(|p| p.namespace == party.namespace)
        {
            return Err(RegistryError::NamespaceTaken {
                namespace: party.namespace,
                owner: owner.id.clone(),
            });
        }

        let id = party.id.clone();
        let version = store
            .insert(RegisteredObject::Party(party))
            .ok_or_else(|| RegistryError::AlreadyRegistered(id.clone()))?;
        tracing::info!(party = %id, version, "registered party");
        Ok(version)
    }

    /// Registers a site. Its owner and admin must already be registered.
    pub fn register_site(&self, site: SiteDescription) -> Result<u64, RegistryError> {
        site.validate()?;
        let mut store = self.store.lock().unwrap_or_else(|e| e.into_inner());

        if store.contains(site.id.as_str()) {
            return Err(RegistryError::AlreadyRegistered(site.id));
        }
        for party in [&site.owner_id, &site.admin_id] {
            let registered = store
                .get(party.as_str())
                .and_then(RegisteredObject::as_party)
                .is_some();
            if !registered {
                return Err(RegistryError::MissingParty {
                    site: site.id.clone(),
                    party: party.clone(),
                });
            }
        }

        let id = site.id.clone();
        let version = store
            .insert(RegisteredObject::Site(site))
            .ok_or_else(|| RegistryError::AlreadyRegistered(id.clone()))?;
        tracing::info!(site = %id, version, "registered site");
        Ok(version)
    }

    /// Removes a party that no site refers to any more.
    pub fn deregister_party(&self, id: &Identifier) -> Result<u64, RegistryError> {
        let mut store = self.store.lock().unwrap_or_else(|e| e.into_inner());
        if store.get(id.as_str()).and_then(RegisteredObject::as_party).is_none() {
            return Err(RegistryError::NotFound(id.clone()));
        }
        if let Some(site) = store
            .objects()
            .filter_map(RegisteredObject::as_site)
            .find(|s| &s.owner_id == id || &s.admin_id == id)
        {
            return Err(RegistryError::InUse {
                party: id.clone(),
                site: site.id.clone(),
            });
        }
        let (_, version) = store.delete(id.as_str())?;
        tracing::info!(party = %id, version, "deregistered party");
        Ok(version)
    }

    pub fn deregister_site(&self, id: &Identifier) -> Result<u64, RegistryError> {
        let mut store = self.store.lock().unwrap_or_else(|e| e.into_inner());
        if store.get(id.as_str()).and_then(RegisteredObject::as_site).is_none() {
            return Err(RegistryError::NotFound(id.clone()));
        }
        let (_, version) = store.delete(id.as_str())?;
        tracing::info!(site = %id, version, "deregistered site");
        Ok(version)
    }

    pub fn objects(&self) -> Vec<RegisteredObject> {
        self.store
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .objects()
            .cloned()
            .collect()
    }

    pub fn version(&self) -> u64 {
        self.store.lock().unwrap_or_else(|e| e.into_inner()).version()
    }

    pub fn archive(&self) -> StoreArchive<RegisteredObject> {
        self.store
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .archive()
            .clone()
    }

    pub fn compact(&self, below: u64) -> usize {
        self.store
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .compact(below)
    }

    pub fn get_updates_since(&self, from_version: u64) -> ReplicaUpdate<RegisteredObject> {
        self.store
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_updates_since(from_version)
    }
}

#[async_trait]
impl ReplicaSource<RegisteredObject> for Registry {
    async fn get_update(
        &self,
        from_version: u64,
    ) -> Result<ReplicaUpdate<RegisteredObject>, ReplicationError> {
        Ok(self.get_updates_since(from_version))
    }
}
