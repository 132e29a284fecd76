//! A site's view of policy: its own rules plus replicas of every other
//! namespace's rules, discovered through the registry.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tessera_policy::{
    AuthorityLookup, Closure, PolicyError, PolicyEvaluator, ReplicatedRules, RuleStore,
    RuleValidator, SignatureVerifier, SignedRule,
};
use tessera_registry::{RegisteredObject, RegistryClient};
use tessera_replication::{Replica, ReplicaSink, ReplicaSource, ReplicationError};
use tessera_types::{Asset, Identifier, NamespaceAuthority, SiteDescription};

/// Current, trustworthy policy.
#[async_trait]
pub trait PolicyView: Send + Sync {
    /// The closure over every rule this site knows, refreshing first if
    /// any lease has run out.
    async fn current_closure(&self) -> Result<Arc<Closure>, PolicyError>;

    /// Makes the provenance of a derived asset known to policy evaluation.
    /// Returns true if it was not known before.
    fn record_provenance(&self, asset: &Asset) -> bool;
}

#[async_trait]
impl PolicyView for PolicyEvaluator {
    async fn current_closure(&self) -> Result<Arc<Closure>, PolicyError> {
        self.closure()
    }

    fn record_provenance(&self, asset: &Asset) -> bool {
        PolicyEvaluator::record_provenance(self, asset)
    }
}

/// Creates replica sources for policy-serving sites.
pub trait RuleSourceConnector: Send + Sync {
    fn connect(&self, site: &SiteDescription) -> Arc<dyn ReplicaSource<SignedRule>>;
}

/// Namespace authorities as recorded in the registry.
pub struct RegistryAuthorities(pub RegistryClient);

impl AuthorityLookup for RegistryAuthorities {
    fn authority_for(&self, namespace: &str) -> Option<NamespaceAuthority> {
        match self.0.authority_for_namespace(namespace) {
            Ok(authority) => authority,
            Err(e) => {
                tracing::warn!(namespace, error = %e, "cannot look up namespace authority");
                None
            }
        }
    }
}

/// How long to keep retrying when refreshing replicas before evaluation.
#[derive(Debug, Clone, Copy)]
pub struct FreshnessSettings {
    pub timeout: Duration,
    pub min_backoff: Duration,
}

impl Default for FreshnessSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            min_backoff: Duration::from_millis(250),
        }
    }
}

/// Combines the local rule store with a replica of every other
/// policy-serving site in the registry.
///
/// Replicas are added and removed as sites appear in and disappear from the
/// registry. Rules arriving through a replica are only accepted if they are
/// signed by the owner of the namespace that site serves.
pub struct PolicyClient {
    local: Option<Arc<RuleStore>>,
    registry: RegistryClient,
    connector: Arc<dyn RuleSourceConnector>,
    verifier: Arc<dyn SignatureVerifier>,
    evaluator: PolicyEvaluator,
    replicas: Mutex<BTreeMap<Identifier, Arc<Replica<SignedRule>>>>,
    freshness: FreshnessSettings,
}

struct RegistryWatcher(Weak<PolicyClient>);

impl ReplicaSink<RegisteredObject> for RegistryWatcher {
    fn on_update(&self, created: &[RegisteredObject], deleted: &[RegisteredObject]) {
        let Some(client) = self.0.upgrade() else {
            return;
        };
        for site in deleted.iter().filter_map(RegisteredObject::as_site) {
            client.drop_replica(&site.id);
        }
        for site in created.iter().filter_map(RegisteredObject::as_site) {
            client.track_site(site);
        }
    }
}

impl PolicyClient {
    pub fn new(
        local: Option<Arc<RuleStore>>,
        registry: RegistryClient,
        connector: Arc<dyn RuleSourceConnector>,
        verifier: Arc<dyn SignatureVerifier>,
        freshness: FreshnessSettings,
    ) -> Arc<Self> {
        let evaluator = PolicyEvaluator::new();
        if let Some(local) = &local {
            evaluator.add_source(Arc::clone(local) as _);
        }
        let client = Arc::new(Self {
            local,
            registry,
            connector,
            verifier,
            evaluator,
            replicas: Mutex::new(BTreeMap::new()),
            freshness,
        });

        client
            .registry
            .add_sink(Arc::new(RegistryWatcher(Arc::downgrade(&client))));
        if let Ok(sites) = client.registry.policy_servers() {
            for site in &sites {
                client.track_site(site);
            }
        }
        client
    }

    pub fn local_store(&self) -> Option<&Arc<RuleStore>> {
        self.local.as_ref()
    }

    pub fn registry(&self) -> &RegistryClient {
        &self.registry
    }

    pub fn evaluator(&self) -> &PolicyEvaluator {
        &self.evaluator
    }

    /// The rule replicas currently tracked, by serving site.
    pub fn replicas(&self) -> BTreeMap<Identifier, Arc<Replica<SignedRule>>> {
        self.replicas
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn track_site(&self, site: &SiteDescription) {
        let Some(namespace) = site.namespace.as_deref() else {
            return;
        };
        if !site.capabilities.can_serve_policy {
            return;
        }
        if self
            .local
            .as_ref()
            .is_some_and(|local| local.namespace() == namespace)
        {
            return;
        }

        let mut replicas = self.replicas.lock().unwrap_or_else(|e| e.into_inner());
        if replicas.contains_key(&site.id) {
            return;
        }
        let validator = RuleValidator::new(
            namespace,
            Arc::new(RegistryAuthorities(self.registry.clone())),
            Arc::clone(&self.verifier),
        );
        let replica = Arc::new(
            Replica::new(format!("rules:{}", site.id), self.connector.connect(site))
                .with_validator(Arc::new(validator)),
        );
        self.evaluator
            .add_source(Arc::new(ReplicatedRules::new(Arc::clone(&replica))));
        replicas.insert(site.id.clone(), replica);
        tracing::info!(site = %site.id, namespace, "tracking policy server");
    }

    fn drop_replica(&self, site: &Identifier) {
        let removed = self
            .replicas
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(site);
        if let Some(replica) = removed {
            self.evaluator.remove_source(replica.name());
            tracing::info!(site = %site, "stopped tracking policy server");
        }
    }

    /// Brings the registry and every rule replica within their leases.
    pub async fn ensure_fresh(&self) -> Result<(), PolicyError> {
        let FreshnessSettings {
            timeout,
            min_backoff,
        } = self.freshness;
        self.registry
            .replica()
            .ensure_fresh_within(timeout, min_backoff)
            .await?;
        for replica in self.replicas().into_values() {
            replica.ensure_fresh_within(timeout, min_backoff).await?;
        }
        Ok(())
    }

    /// Refreshes the registry and every rule replica regardless of leases.
    pub async fn refresh_all(&self) -> Result<(), ReplicationError> {
        self.registry.replica().refresh().await?;
        for replica in self.replicas().into_values() {
            replica.refresh().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl PolicyView for PolicyClient {
    async fn current_closure(&self) -> Result<Arc<Closure>, PolicyError> {
        self.ensure_fresh().await?;
        self.evaluator.closure()
    }

    fn record_provenance(&self, asset: &Asset) -> bool {
        let recorded = self.evaluator.record_provenance(asset);
        if let Some(local) = &self.local {
            local.record_provenance(asset);
        }
        recorded
    }
}
