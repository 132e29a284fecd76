//! Asset storage at a site, with policy-checked retrieval.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use tessera_types::{Asset, Identifier};

use crate::error::AssetError;
use crate::policy::PolicyView;

/// Where a site keeps its assets.
pub trait AssetStore: Send + Sync {
    fn store(&self, asset: Asset) -> Result<(), AssetError>;
    fn get(&self, id: &Identifier) -> Option<Asset>;
    fn ids(&self) -> Vec<Identifier>;

    fn contains(&self, id: &Identifier) -> bool {
        self.get(id).is_some()
    }
}

/// An asset store held in memory.
#[derive(Default)]
pub struct MemoryAssetStore {
    assets: RwLock<BTreeMap<Identifier, Asset>>,
}

impl MemoryAssetStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AssetStore for MemoryAssetStore {
    fn store(&self, asset: Asset) -> Result<(), AssetError> {
        asset.validate()?;
        self.assets
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(asset.id.clone(), asset);
        Ok(())
    }

    fn get(&self, id: &Identifier) -> Option<Asset> {
        self.assets
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    fn ids(&self) -> Vec<Identifier> {
        self.assets
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }
}

/// Hands out assets only to sites and parties that policy allows.
#[derive(Clone)]
pub struct AssetService {
    store: Arc<dyn AssetStore>,
    policy: Arc<dyn PolicyView>,
}

impl AssetService {
    pub fn new(store: Arc<dyn AssetStore>, policy: Arc<dyn PolicyView>) -> Self {
        Self { store, policy }
    }

    pub fn store(&self) -> &Arc<dyn AssetStore> {
        &self.store
    }

    /// Stores an asset, recording its provenance for policy evaluation.
    ///
    /// An asset whose id does not match its provenance is rejected before
    /// policy sees it.
    pub fn put(&self, asset: Asset) -> Result<(), AssetError> {
        asset.validate()?;
        self.policy.record_provenance(&asset);
        self.store.store(asset.clone())?;
        tracing::debug!(asset = %asset.id, "stored asset");
        Ok(())
    }

    /// Returns `id` to `site` if the site may access it.
    pub async fn retrieve_for_site(
        &self,
        id: &Identifier,
        site: &Identifier,
    ) -> Result<Asset, AssetError> {
        let asset = self
            .store
            .get(id)
            .ok_or_else(|| AssetError::NotFound(id.clone()))?;
        let closure = self.policy.current_closure().await?;
        if !closure.may_access(site, id) {
            tracing::warn!(asset = %id, site = %site, "asset access denied");
            return Err(AssetError::AccessDenied {
                asset: id.clone(),
                requester: site.clone(),
            });
        }
        Ok(asset)
    }

    /// Returns `id` to `party` if it may use it, with the conditions of use.
    pub async fn retrieve_for_party(
        &self,
        id: &Identifier,
        party: &Identifier,
    ) -> Result<(Asset, Vec<String>), AssetError> {
        let asset = self
            .store
            .get(id)
            .ok_or_else(|| AssetError::NotFound(id.clone()))?;
        let decision = self.policy.current_closure().await?.may_use(party, id);
        if !decision.allowed {
            tracing::warn!(asset = %id, party = %party, "asset use denied");
            return Err(AssetError::AccessDenied {
                asset: id.clone(),
                requester: party.clone(),
            });
        }
        Ok((asset, decision.conditions))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tessera_policy::{PolicyError, PolicyEvaluator, PolicySource, Rule};
    use tessera_types::{AssetPayload, Provenance};

    fn id(s: &str) -> Identifier {
        Identifier::parse(s).unwrap()
    }

    struct Fixed(Vec<Rule>, AtomicU64);

    impl PolicySource for Fixed {
        fn name(&self) -> String {
            "fixed".into()
        }
        fn generation(&self) -> u64 {
            self.1.load(Ordering::Acquire)
        }
        fn rules(&self) -> Result<Vec<Rule>, PolicyError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn retrieval_is_policy_checked() {
        let data = id("asset:ns:data:ns:s1");
        let evaluator = Arc::new(PolicyEvaluator::new());
        evaluator.add_source(Arc::new(Fixed(
            vec![
                Rule::MayAccess {
                    site: id("site:ns:s2"),
                    asset: data.clone(),
                },
                Rule::MayUse {
                    party: id("party:ns:alice"),
                    asset: data.clone(),
                    conditions: "research".into(),
                },
            ],
            AtomicU64::new(0),
        )));
        let service = AssetService::new(Arc::new(MemoryAssetStore::new()), evaluator);
        service
            .put(Asset::data(data.clone(), AssetPayload::Inline(serde_json::json!([1, 2]))).unwrap())
            .unwrap();

        assert!(service.retrieve_for_site(&data, &id("site:ns:s2")).await.is_ok());
        assert!(matches!(
            service.retrieve_for_site(&data, &id("site:ns:s3")).await,
            Err(AssetError::AccessDenied { .. })
        ));
        assert!(matches!(
            service
                .retrieve_for_site(&id("asset:ns:other:ns:s1"), &id("site:ns:s2"))
                .await,
            Err(AssetError::NotFound(_))
        ));

        let (_, conditions) = service
            .retrieve_for_party(&data, &id("party:ns:alice"))
            .await
            .unwrap();
        assert_eq!(conditions, vec!["research"]);
        assert!(service
            .retrieve_for_party(&data, &id("party:ns:bob"))
            .await
            .is_err());
    }

    fn single_step_job(data: &str) -> tessera_types::Job {
        use tessera_types::{Job, Workflow, WorkflowStep};
        let step = WorkflowStep::new("s", &[("x", "a")], &[("out", None)], "asset:ns:c:ns:s1")
            .unwrap();
        let wf = Workflow::new(&["a"], &[], vec![step]).unwrap();
        Job::new(
            id("party:ns:p"),
            wf,
            BTreeMap::from([("a".to_string(), id(data))]),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn forged_lineage_does_not_relabel_a_result() {
        let public = "asset:ns:public:ns:s1";
        let evaluator = Arc::new(PolicyEvaluator::new());
        evaluator.add_source(Arc::new(Fixed(
            vec![
                Rule::ResultOfIn {
                    data_asset: id(public),
                    compute_asset: Identifier::wildcard(),
                    output: "*".into(),
                    collection: id("asset_collection:ns:open"),
                },
                Rule::MayAccess {
                    site: Identifier::wildcard(),
                    asset: id("asset_collection:ns:open"),
                },
            ],
            AtomicU64::new(0),
        )));
        let service = AssetService::new(Arc::new(MemoryAssetStore::new()), evaluator.clone());

        let secret = Asset::derived(
            single_step_job("asset:ns:secret:ns:s1"),
            "s.out",
            AssetPayload::Inline(serde_json::json!(42)),
        )
        .unwrap();
        let result = secret.id.clone();
        service.put(secret).unwrap();
        let outsider = id("site:other:s9");
        assert!(!evaluator.may_access(&outsider, &result).unwrap());

        // Same id, lineage claiming public inputs.
        let forged = Asset {
            provenance: Provenance::Derived {
                job: Box::new(single_step_job(public)),
                item: "s.out".into(),
            },
            ..service.store().get(&result).unwrap()
        };
        assert!(matches!(service.put(forged.clone()), Err(AssetError::Invalid(_))));
        assert!(!evaluator.record_provenance(&forged));

        assert!(!evaluator.may_access(&outsider, &result).unwrap());
        assert!(matches!(
            service.retrieve_for_site(&result, &outsider).await,
            Err(AssetError::AccessDenied { .. })
        ));
    }

    #[test]
    fn known_lineage_is_kept() {
        let evaluator = PolicyEvaluator::new();
        let asset = Asset::derived(
            single_step_job("asset:ns:d:ns:s1"),
            "s.out",
            AssetPayload::Inline(serde_json::json!(1)),
        )
        .unwrap();
        assert!(evaluator.record_provenance(&asset));
        assert!(!evaluator.record_provenance(&asset));
    }
}
