use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tessera_policy::{
    public_key_hex, sign_rule, Closure, Ed25519Verifier, PolicyError, PolicyEvaluator,
    ReplicatedRules, Rule, RuleStore, RuleValidator, SignedRule,
};
use tessera_replication::{Replica, ReplicaSource, UpdateOutcome};
use tessera_types::{Asset, AssetPayload, Identifier, Job, NamespaceAuthority, Workflow, WorkflowStep};

fn id(s: &str) -> Identifier {
    Identifier::parse(s).unwrap()
}

struct Namespace {
    key: SigningKey,
    authority: NamespaceAuthority,
}

impl Namespace {
    fn new(ns: &str) -> Self {
        let key = SigningKey::generate(&mut OsRng);
        let authority = NamespaceAuthority {
            namespace: ns.to_string(),
            owner: id(&format!("party:{ns}:owner")),
            owner_key: public_key_hex(&key),
            administrators: BTreeSet::new(),
        };
        Self { key, authority }
    }

    fn sign(&self, rule: Rule) -> SignedRule {
        sign_rule(rule, self.authority.owner.clone(), &self.key)
    }

    fn store(&self) -> RuleStore {
        RuleStore::new(
            self.authority.clone(),
            Arc::new(Ed25519Verifier),
            chrono::Duration::seconds(60),
        )
    }
}

const DATASET_X: &str = "asset:hospital:dataset_x:hospital:site1";
const COMPUTE_Y: &str = "asset:lab:compute_y:lab:site2";
const COLLECTION_C: &str = "asset_collection:hospital:collection_c";

fn job_y_on_x() -> Job {
    let step = WorkflowStep::new("run", &[("data", "x")], &[("out", None)], COMPUTE_Y).unwrap();
    let workflow = Workflow::new(&["x"], &[("result", "run.out")], vec![step]).unwrap();
    Job::new(
        id("party:lab:owner"),
        workflow,
        BTreeMap::from([("x".to_string(), id(DATASET_X))]),
    )
    .unwrap()
}

#[test]
fn adding_twice_is_idempotent() {
    let hospital = Namespace::new("hospital");
    let store = hospital.store();
    let rule = hospital.sign(Rule::MayAccess {
        site: id("site:hospital:site1"),
        asset: id(DATASET_X),
    });

    assert!(store.add(rule.clone()).unwrap());
    let version = store.version();
    let rules = store.signed_rules();
    let closure = store.closure();

    assert!(!store.add(rule).unwrap());
    assert_eq!(store.version(), version);
    assert_eq!(store.signed_rules(), rules);
    assert_eq!(*store.closure(), *closure);
}

#[test]
fn rejects_unsigned_and_foreign_rules() {
    let hospital = Namespace::new("hospital");
    let lab = Namespace::new("lab");
    let store = hospital.store();

    let mut unsigned = hospital.sign(Rule::MayAccess {
        site: id("site:hospital:site1"),
        asset: id(DATASET_X),
    });
    unsigned.signature.clear();
    assert!(matches!(
        store.add(unsigned),
        Err(PolicyError::InvalidSignature { .. })
    ));

    let by_lab = lab.sign(Rule::MayAccess {
        site: id("site:lab:site2"),
        asset: id(DATASET_X),
    });
    assert!(matches!(
        store.add(by_lab),
        Err(PolicyError::UnauthorizedIssuer { .. })
    ));
    assert_eq!(store.version(), 0);
}

#[test]
fn results_inherit_collection_access() {
    let hospital = Namespace::new("hospital");
    let store = hospital.store();
    store
        .add(hospital.sign(Rule::ResultOfIn {
            data_asset: id(DATASET_X),
            compute_asset: id(COMPUTE_Y),
            output: "out".into(),
            collection: id(COLLECTION_C),
        }))
        .unwrap();
    store
        .add(hospital.sign(Rule::MayAccess {
            site: id("site:lab:site2"),
            asset: id(COLLECTION_C),
        }))
        .unwrap();

    let job = job_y_on_x();
    let result = Asset::derived(job, "run.out", AssetPayload::Inline(serde_json::json!(1))).unwrap();
    assert!(store.record_provenance(&result));

    assert!(store.may_access(&id("site:lab:site2"), &result.id));
    assert!(!store.may_access(&id("site:lab:site3"), &result.id));
    assert!(store.members_of(&id(COLLECTION_C)).contains(&result.id));
}

#[test]
fn mismatched_lineage_is_not_recorded() {
    let hospital = Namespace::new("hospital");
    let store = hospital.store();
    store
        .add(hospital.sign(Rule::ResultOfIn {
            data_asset: id(DATASET_X),
            compute_asset: id(COMPUTE_Y),
            output: "out".into(),
            collection: id(COLLECTION_C),
        }))
        .unwrap();

    let genuine =
        Asset::derived(job_y_on_x(), "run.out", AssetPayload::Inline(serde_json::json!(1))).unwrap();
    let mut forged = genuine.clone();
    forged.id = Identifier::from_id_hash(&"0".repeat(64)).unwrap();
    let generation = store.generation();

    assert!(!store.record_provenance(&forged));
    assert_eq!(store.generation(), generation);
    assert!(!store.members_of(&id(COLLECTION_C)).contains(&forged.id));

    assert!(store.record_provenance(&genuine));
    assert!(!store.record_provenance(&genuine));
}

#[test]
fn closure_does_not_depend_on_insertion_order() {
    let rules = vec![
        Rule::InAssetCollection {
            asset: id(DATASET_X),
            collection: id(COLLECTION_C),
        },
        Rule::InAssetCollection {
            asset: id(COLLECTION_C),
            collection: id("asset_collection:hospital:all"),
        },
        Rule::MayAccess {
            site: id("*"),
            asset: id("asset_collection:hospital:all"),
        },
        Rule::MayUse {
            party: id("party_collection:hospital:staff"),
            asset: id("asset_collection:hospital:all"),
            conditions: "audit".into(),
        },
    ];
    let forward = Closure::new(&rules, BTreeMap::new());
    let backward: Vec<Rule> = rules.iter().rev().cloned().collect();
    assert_eq!(forward, Closure::new(&backward, BTreeMap::new()));
    assert!(forward.may_access(&id("site:any:one"), &id(DATASET_X)));
    assert_eq!(
        forward.members_of(&id("asset_collection:hospital:all")),
        BTreeSet::from([id(DATASET_X), id(COLLECTION_C)])
    );
}

#[tokio::test]
async fn replicated_rules_feed_the_evaluator() {
    let hospital = Namespace::new("hospital");
    let lab = Namespace::new("lab");
    let hospital_store = Arc::new(hospital.store());
    let lab_store = Arc::new(lab.store());

    hospital_store
        .add(hospital.sign(Rule::InAssetCollection {
            asset: id(DATASET_X),
            collection: id(COLLECTION_C),
        }))
        .unwrap();
    hospital_store
        .add(hospital.sign(Rule::MayAccess {
            site: id("site:lab:site2"),
            asset: id(COLLECTION_C),
        }))
        .unwrap();

    let authorities: BTreeMap<String, NamespaceAuthority> =
        BTreeMap::from([("hospital".to_string(), hospital.authority.clone())]);
    let replica = Arc::new(
        Replica::new(
            "rules:hospital",
            Arc::clone(&hospital_store) as Arc<dyn ReplicaSource<SignedRule>>,
        )
        .with_validator(Arc::new(RuleValidator::new(
            "hospital",
            Arc::new(authorities),
            Arc::new(Ed25519Verifier),
        ))),
    );

    let evaluator = PolicyEvaluator::new();
    evaluator.add_source(lab_store.clone());
    evaluator.add_source(Arc::new(ReplicatedRules::new(Arc::clone(&replica))));

    // Not refreshed yet: the replica's lease has not been granted.
    assert!(matches!(
        evaluator.may_access(&id("site:lab:site2"), &id(DATASET_X)),
        Err(PolicyError::Replication(_))
    ));

    assert_eq!(
        replica.refresh().await.unwrap(),
        UpdateOutcome::Resynced { objects: 2 }
    );
    assert!(evaluator
        .may_access(&id("site:lab:site2"), &id(DATASET_X))
        .unwrap());

    let grant = hospital_store
        .signed_rules()
        .into_iter()
        .find(|s| matches!(s.rule, Rule::MayAccess { .. }))
        .unwrap();
    hospital_store
        .retract(&grant.id(), &hospital.authority.owner)
        .unwrap();
    replica.refresh().await.unwrap();
    assert!(!evaluator
        .may_access(&id("site:lab:site2"), &id(DATASET_X))
        .unwrap());
}
