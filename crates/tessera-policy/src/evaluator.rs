//! Policy evaluation over several rule sources.
//!
//! A site evaluates the union of its own rules and the rules it replicates
//! from other namespaces. [`PolicyEvaluator`] combines any number of
//! [`PolicySource`]s and caches one closure until some source changes.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tessera_replication::{Replica, ReplicaSink};
use tessera_types::{Asset, Identifier, Job};

use crate::closure::{Closure, UseDecision};
use crate::error::PolicyError;
use crate::rules::{Rule, SignedRule};
use crate::store::RuleStore;

/// A set of rules that the evaluator reads.
pub trait PolicySource: Send + Sync {
    /// A stable name used to identify the source.
    fn name(&self) -> String;

    /// Changes whenever the rules change.
    fn generation(&self) -> u64;

    /// The current rules.
    ///
    /// Fails if the rules cannot be trusted, e.g. a replica whose lease ran out.
    fn rules(&self) -> Result<Vec<Rule>, PolicyError>;
}

impl PolicySource for RuleStore {
    fn name(&self) -> String {
        format!("local:{}", self.namespace())
    }

    fn generation(&self) -> u64 {
        RuleStore::generation(self)
    }

    fn rules(&self) -> Result<Vec<Rule>, PolicyError> {
        Ok(RuleStore::rules(self))
    }
}

/// Rules held in a replica of another site's rule store.
pub struct ReplicatedRules {
    replica: Arc<Replica<SignedRule>>,
    generation: Arc<AtomicU64>,
}

struct GenerationCounter(Arc<AtomicU64>);

impl ReplicaSink<SignedRule> for GenerationCounter {
    fn on_update(&self, _created: &[SignedRule], _deleted: &[SignedRule]) {
        self.0.fetch_add(1, Ordering::AcqRel);
    }
}

impl ReplicatedRules {
    /// Wraps `replica`, subscribing to its updates.
    pub fn new(replica: Arc<Replica<SignedRule>>) -> Self {
        let generation = Arc::new(AtomicU64::new(0));
        replica.add_sink(Arc::new(GenerationCounter(Arc::clone(&generation))));
        Self {
            replica,
            generation,
        }
    }

    pub fn replica(&self) -> &Arc<Replica<SignedRule>> {
        &self.replica
    }
}

impl PolicySource for ReplicatedRules {
    fn name(&self) -> String {
        self.replica.name().to_string()
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn rules(&self) -> Result<Vec<Rule>, PolicyError> {
        let snapshot = self.replica.snapshot_checked()?;
        Ok(snapshot.values().map(|s| s.rule.clone()).collect())
    }
}

type CacheKey = (Vec<(String, u64)>, u64);

/// The lineage of a derived asset whose id matches it.
pub(crate) fn checked_lineage(asset: &Asset) -> Option<(Job, String)> {
    let (job, item) = asset.lineage()?;
    if let Err(e) = asset.validate() {
        tracing::warn!(asset = %asset.id, "ignoring provenance: {}", e);
        return None;
    }
    Some((job.clone(), item.to_string()))
}

/// Answers policy questions over the union of several sources.
#[derive(Default)]
pub struct PolicyEvaluator {
    sources: RwLock<Vec<Arc<dyn PolicySource>>>,
    provenance: RwLock<BTreeMap<Identifier, (Job, String)>>,
    provenance_generation: AtomicU64,
    cached: Mutex<Option<(CacheKey, Arc<Closure>)>>,
}

impl PolicyEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a source, replacing any source with the same name.
    pub fn add_source(&self, source: Arc<dyn PolicySource>) {
        let name = source.name();
        let mut sources = self.sources.write().unwrap_or_else(|e| e.into_inner());
        sources.retain(|s| s.name() != name);
        sources.push(source);
        tracing::debug!(source = %name, "added policy source");
    }

    /// Removes the source called `name`, returning whether it was present.
    pub fn remove_source(&self, name: &str) -> bool {
        let mut sources = self.sources.write().unwrap_or_else(|e| e.into_inner());
        let before = sources.len();
        sources.retain(|s| s.name() != name);
        let removed = sources.len() != before;
        if removed {
            tracing::debug!(source = %name, "removed policy source");
        }
        removed
    }

    pub fn source_names(&self) -> BTreeSet<String> {
        self.sources
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|s| s.name())
            .collect()
    }

    /// Records the provenance of a derived asset. Returns true if it was
    /// not known before.
    ///
    /// Assets whose id does not match their lineage are ignored, and a known
    /// lineage is never replaced.
    pub fn record_provenance(&self, asset: &Asset) -> bool {
        let Some(lineage) = checked_lineage(asset) else {
            return false;
        };
        let mut provenance = self.provenance.write().unwrap_or_else(|e| e.into_inner());
        match provenance.entry(asset.id.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(lineage);
                self.provenance_generation.fetch_add(1, Ordering::AcqRel);
                true
            }
            Entry::Occupied(_) => false,
        }
    }

    /// The closure over all sources.
    ///
    /// Fails if any source cannot supply trustworthy rules; evaluation never
    /// proceeds on a partial rule set.
    pub fn closure(&self) -> Result<Arc<Closure>, PolicyError> {
        let sources: Vec<Arc<dyn PolicySource>> = self
            .sources
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let key: CacheKey = (
            sources.iter().map(|s| (s.name(), s.generation())).collect(),
            self.provenance_generation.load(Ordering::Acquire),
        );

        let mut rules = Vec::new();
        for source in &sources {
            rules.extend(source.rules()?);
        }

        if let Some((cached_key, closure)) =
            &*self.cached.lock().unwrap_or_else(|e| e.into_inner())
        {
            if *cached_key == key {
                return Ok(Arc::clone(closure));
            }
        }

        let provenance = self
            .provenance
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let closure = Arc::new(Closure::new(&rules, provenance));
        tracing::debug!(
            sources = sources.len(),
            rules = rules.len(),
            "recomputed policy closure"
        );
        *self.cached.lock().unwrap_or_else(|e| e.into_inner()) = Some((key, Arc::clone(&closure)));
        Ok(closure)
    }

    pub fn may_access(&self, site: &Identifier, asset: &Identifier) -> Result<bool, PolicyError> {
        Ok(self.closure()?.may_access(site, asset))
    }

    pub fn may_use(
        &self,
        party: &Identifier,
        asset: &Identifier,
    ) -> Result<UseDecision, PolicyError> {
        Ok(self.closure()?.may_use(party, asset))
    }

    pub fn members_of(&self, collection: &Identifier) -> Result<BTreeSet<Identifier>, PolicyError> {
        Ok(self.closure()?.members_of(collection))
    }
}
