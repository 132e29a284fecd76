//! The writable rule store of one namespace.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, RwLock};

use tessera_replication::{CanonicalStore, ReplicaSource, ReplicaUpdate, ReplicationError, StoreArchive};
use tessera_types::{Asset, Identifier, Job, NamespaceAuthority};

use crate::closure::{Closure, UseDecision};
use crate::evaluator::checked_lineage;
use crate::error::PolicyError;
use crate::rules::{Rule, SignedRule};
use crate::signing::{verify_rule, SignatureVerifier};

struct State {
    rules: CanonicalStore<SignedRule>,
    provenance: BTreeMap<Identifier, (Job, String)>,
    generation: u64,
}

/// Signed policy facts for one namespace, and the closure derived from them.
///
/// Only rules signed by the namespace owner are accepted. The store is also
/// the canonical source that other sites replicate rules from.
pub struct RuleStore {
    authority: RwLock<NamespaceAuthority>,
    verifier: Arc<dyn SignatureVerifier>,
    state: RwLock<State>,
    cached: Mutex<Option<(u64, Arc<Closure>)>>,
}

impl RuleStore {
    /// Creates an empty store. Replicas may lag by at most `max_lag`.
    pub fn new(
        authority: NamespaceAuthority,
        verifier: Arc<dyn SignatureVerifier>,
        max_lag: chrono::Duration,
    ) -> Self {
        Self::from_archive(authority, verifier, StoreArchive::default(), max_lag)
    }

    /// Resumes a store from a persisted archive.
    pub fn from_archive(
        authority: NamespaceAuthority,
        verifier: Arc<dyn SignatureVerifier>,
        archive: StoreArchive<SignedRule>,
        max_lag: chrono::Duration,
    ) -> Self {
        Self {
            authority: RwLock::new(authority),
            verifier,
            state: RwLock::new(State {
                rules: CanonicalStore::from_archive(archive, max_lag),
                provenance: BTreeMap::new(),
                generation: 0,
            }),
            cached: Mutex::new(None),
        }
    }

    pub fn authority(&self) -> NamespaceAuthority {
        self.authority
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Replaces the authority, e.g. after the owner's key was rotated in the
    /// registry. Rules already stored are kept.
    pub fn set_authority(&self, authority: NamespaceAuthority) {
        *self.authority.write().unwrap_or_else(|e| e.into_inner()) = authority;
    }

    pub fn namespace(&self) -> String {
        self.authority().namespace
    }

    /// Adds a signed rule.
    ///
    /// Returns `Ok(false)` if the same fact is already present, in which
    /// case nothing changes.
    pub fn add(&self, signed: SignedRule) -> Result<bool, PolicyError> {
        let authority = self.authority();
        if let Err(e) = verify_rule(&signed, &authority, self.verifier.as_ref()) {
            tracing::warn!(
                rule = %signed.rule,
                issuer = %signed.issuer,
                error = %e,
                "rejected rule"
            );
            return Err(e);
        }

        let rule_id = signed.id();
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        match state.rules.insert(signed) {
            Some(version) => {
                state.generation += 1;
                tracing::info!(rule_id = %rule_id, version, "added rule");
                Ok(true)
            }
            None => {
                tracing::debug!(rule_id = %rule_id, "rule already present");
                Ok(false)
            }
        }
    }

    /// Retracts the rule with id `rule_id` on behalf of `acting_party`.
    ///
    /// The acting party must be the rule's issuer or have authority over
    /// the namespace.
    pub fn retract(&self, rule_id: &str, acting_party: &Identifier) -> Result<Rule, PolicyError> {
        let authority = self.authority();
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());

        let existing = state
            .rules
            .get(rule_id)
            .cloned()
            .ok_or_else(|| PolicyError::NotFound(rule_id.to_string()))?;

        if existing.issuer != *acting_party && !authority.has_authority(acting_party) {
            tracing::warn!(rule_id, party = %acting_party, "unauthorized retraction");
            return Err(PolicyError::Unauthorized {
                rule: rule_id.to_string(),
                party: acting_party.clone(),
            });
        }

        let (removed, version) = state.rules.delete(rule_id)?;
        state.generation += 1;
        tracing::info!(rule_id, version, party = %acting_party, "retracted rule");
        Ok(removed.rule)
    }

    /// Records which job produced a result asset, so `ResultOfIn` rules can
    /// apply to it. Uploaded and compute assets are ignored, as are results
    /// whose id does not match their lineage. The first lineage recorded for
    /// a result stays.
    pub fn record_provenance(&self, asset: &Asset) -> bool {
        let Some(lineage) = checked_lineage(asset) else {
            return false;
        };
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if state.provenance.contains_key(&asset.id) {
            return false;
        }
        state.provenance.insert(asset.id.clone(), lineage);
        state.generation += 1;
        true
    }

    /// Live signed rules.
    pub fn signed_rules(&self) -> Vec<SignedRule> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.rules.objects().cloned().collect()
    }

    pub fn rules(&self) -> Vec<Rule> {
        self.signed_rules().into_iter().map(|s| s.rule).collect()
    }

    pub fn version(&self) -> u64 {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .rules
            .version()
    }

    /// Counter that changes whenever rules or provenance change.
    pub fn generation(&self) -> u64 {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .generation
    }

    pub fn archive(&self) -> StoreArchive<SignedRule> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .rules
            .archive()
            .clone()
    }

    /// Forgets deleted rules at or below version `below`.
    pub fn compact(&self, below: u64) -> usize {
        self.state
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .rules
            .compact(below)
    }

    pub fn get_updates_since(&self, from_version: u64) -> ReplicaUpdate<SignedRule> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .rules
            .get_updates_since(from_version)
    }

    /// The closure of the current rules, computed at most once per change.
    pub fn closure(&self) -> Arc<Closure> {
        let (generation, rules, provenance) = {
            let state = self.state.read().unwrap_or_else(|e| e.into_inner());
            if let Some((cached_generation, closure)) =
                &*self.cached.lock().unwrap_or_else(|e| e.into_inner())
            {
                if *cached_generation == state.generation {
                    return Arc::clone(closure);
                }
            }
            let rules: Vec<Rule> = state.rules.objects().map(|s| s.rule.clone()).collect();
            (state.generation, rules, state.provenance.clone())
        };

        let closure = Arc::new(Closure::new(&rules, provenance));
        tracing::debug!(generation, rules = rules.len(), "recomputed rule closure");
        *self.cached.lock().unwrap_or_else(|e| e.into_inner()) =
            Some((generation, Arc::clone(&closure)));
        closure
    }

    pub fn may_access(&self, site: &Identifier, asset: &Identifier) -> bool {
        self.closure().may_access(site, asset)
    }

    pub fn may_use(&self, party: &Identifier, asset: &Identifier) -> UseDecision {
        self.closure().may_use(party, asset)
    }

    pub fn members_of(&self, collection: &Identifier) -> BTreeSet<Identifier> {
        self.closure().members_of(collection)
    }
}

#[async_trait]
impl ReplicaSource<SignedRule> for RuleStore {
    async fn get_update(
        &self,
        from_version: u64,
    ) -> Result<ReplicaUpdate<SignedRule>, ReplicationError> {
        Ok(self.get_updates_since(from_version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signing::{public_key_hex, sign_rule, Ed25519Verifier};
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    fn id(s: &str) -> Identifier {
        Identifier::parse(s).unwrap()
    }

    fn store(key: &SigningKey) -> RuleStore {
        let authority = NamespaceAuthority {
            namespace: "ns".into(),
            owner: id("party:ns:owner"),
            owner_key: public_key_hex(key),
            administrators: BTreeSet::from([id("party:ns:admin")]),
        };
        RuleStore::new(
            authority,
            Arc::new(Ed25519Verifier),
            chrono::Duration::seconds(60),
        )
    }

    fn grant(site: &str) -> Rule {
        Rule::MayAccess {
            site: id(site),
            asset: id("asset:ns:data:ns:s1"),
        }
    }

    #[test]
    fn closure_is_cached_until_mutation() {
        let key = SigningKey::generate(&mut OsRng);
        let store = store(&key);
        let first = store.closure();
        assert!(Arc::ptr_eq(&first, &store.closure()));

        store
            .add(sign_rule(grant("site:ns:s1"), id("party:ns:owner"), &key))
            .unwrap();
        let second = store.closure();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(store.may_access(&id("site:ns:s1"), &id("asset:ns:data:ns:s1")));
    }

    #[test]
    fn retraction_requires_authority() {
        let key = SigningKey::generate(&mut OsRng);
        let store = store(&key);
        let signed = sign_rule(grant("site:ns:s1"), id("party:ns:owner"), &key);
        let rule_id = signed.id();
        store.add(signed).unwrap();

        assert!(matches!(
            store.retract(&rule_id, &id("party:ns:stranger")),
            Err(PolicyError::Unauthorized { .. })
        ));
        assert!(matches!(
            store.retract("missing", &id("party:ns:owner")),
            Err(PolicyError::NotFound(_))
        ));

        let removed = store.retract(&rule_id, &id("party:ns:admin")).unwrap();
        assert_eq!(removed, grant("site:ns:s1"));
        assert!(!store.may_access(&id("site:ns:s1"), &id("asset:ns:data:ns:s1")));
        assert_eq!(store.version(), 2);
    }

    #[tokio::test]
    async fn serves_updates_as_replica_source() {
        let key = SigningKey::generate(&mut OsRng);
        let store = store(&key);
        store
            .add(sign_rule(grant("site:ns:s1"), id("party:ns:owner"), &key))
            .unwrap();
        store
            .add(sign_rule(grant("site:ns:s2"), id("party:ns:owner"), &key))
            .unwrap();

        let update = store.get_update(1).await.unwrap();
        assert_eq!(update.from_version, 1);
        assert_eq!(update.to_version, 2);
        assert_eq!(update.created.len(), 1);
        assert_eq!(update.created[0].rule, grant("site:ns:s2"));
    }
}
