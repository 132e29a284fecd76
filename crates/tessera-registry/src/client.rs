use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use tessera_replication::{Replica, ReplicaSink, ReplicaSource, UpdateOutcome};
use tessera_types::{Identifier, NamespaceAuthority, PartyDescription, SiteDescription};

use crate::error::RegistryError;
use crate::object::RegisteredObject;

/// A site's read-only view of the registry.
///
/// Lookups refuse to answer from a replica whose lease has run out.
#[derive(Clone)]
pub struct RegistryClient {
    replica: Arc<Replica<RegisteredObject>>,
}

impl RegistryClient {
    pub fn new(source: Arc<dyn ReplicaSource<RegisteredObject>>) -> Self {
        Self::from_replica(Arc::new(Replica::new("registry", source)))
    }

    pub fn from_replica(replica: Arc<Replica<RegisteredObject>>) -> Self {
        Self { replica }
    }

    pub fn replica(&self) -> &Arc<Replica<RegisteredObject>> {
        &self.replica
    }

    /// Subscribes to registry changes.
    pub fn add_sink(&self, sink: Arc<dyn ReplicaSink<RegisteredObject>>) {
        self.replica.add_sink(sink);
    }

    pub async fn refresh(&self) -> Result<UpdateOutcome, RegistryError> {
        Ok(self.replica.refresh().await?)
    }

    /// Refreshes if the lease has run out, retrying until `timeout`.
    pub async fn ensure_fresh_within(
        &self,
        timeout: Duration,
        min_backoff: Duration,
    ) -> Result<(), RegistryError> {
        Ok(self.replica.ensure_fresh_within(timeout, min_backoff).await?)
    }

    fn objects(&self) -> Result<Arc<BTreeMap<String, RegisteredObject>>, RegistryError> {
        Ok(self.replica.snapshot_checked()?)
    }

    pub fn parties(&self) -> Result<Vec<PartyDescription>, RegistryError> {
        Ok(self
            .objects()?
            .values()
            .filter_map(RegisteredObject::as_party)
            .cloned()
            .collect())
    }

    /// All sites, ordered by id.
    pub fn sites(&self) -> Result<Vec<SiteDescription>, RegistryError> {
        Ok(self
            .objects()?
            .values()
            .filter_map(RegisteredObject::as_site)
            .cloned()
            .collect())
    }

    pub fn party(&self, id: &Identifier) -> Result<PartyDescription, RegistryError> {
        self.objects()?
            .get(id.as_str())
            .and_then(RegisteredObject::as_party)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.clone()))
    }

    pub fn site(&self, id: &Identifier) -> Result<SiteDescription, RegistryError> {
        self.objects()?
            .get(id.as_str())
            .and_then(RegisteredObject::as_site)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.clone()))
    }

    /// Sites able to run workflow steps, ordered by id.
    pub fn sites_with_runners(&self) -> Result<Vec<SiteDescription>, RegistryError> {
        Ok(self
            .sites()?
            .into_iter()
            .filter(|s| s.capabilities.can_run_steps)
            .collect())
    }

    /// Sites that serve policy rules, ordered by id.
    pub fn policy_servers(&self) -> Result<Vec<SiteDescription>, RegistryError> {
        Ok(self
            .sites()?
            .into_iter()
            .filter(|s| s.capabilities.can_serve_policy)
            .collect())
    }

    /// Who may sign rules for `namespace`.
    ///
    /// The owner is the party owning the namespace; administrators are the
    /// admins of the owner's sites.
    pub fn authority_for_namespace(
        &self,
        namespace: &str,
    ) -> Result<Option<NamespaceAuthority>, RegistryError> {
        let objects = self.objects()?;
        let Some(owner) = objects
            .values()
            .filter_map(RegisteredObject::as_party)
            .find(|p| p.namespace == namespace)
        else {
            return Ok(None);
        };

        let administrators: BTreeSet<Identifier> = objects
            .values()
            .filter_map(RegisteredObject::as_site)
            .filter(|s| s.owner_id == owner.id)
            .map(|s| s.admin_id.clone())
            .collect();

        Ok(Some(NamespaceAuthority {
            namespace: namespace.to_string(),
            owner: owner.id.clone(),
            owner_key: owner.public_key.clone(),
            administrators,
        }))
    }
}
