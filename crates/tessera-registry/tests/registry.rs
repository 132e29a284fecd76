use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use tessera_registry::{RegisteredObject, Registry, RegistryClient, RegistryError};
use tessera_replication::{ReplicaSink, ReplicaSource, UpdateOutcome};
use tessera_types::{Identifier, PartyDescription, SiteCapabilities, SiteDescription};

fn id(s: &str) -> Identifier {
    Identifier::parse(s).unwrap()
}

fn party(ns: &str) -> PartyDescription {
    PartyDescription {
        id: id(&format!("party:{ns}:owner")),
        namespace: ns.into(),
        public_key: "11".repeat(32),
    }
}

fn site(ns: &str, name: &str, caps: SiteCapabilities) -> SiteDescription {
    SiteDescription {
        id: id(&format!("site:{ns}:{name}")),
        owner_id: id(&format!("party:{ns}:owner")),
        admin_id: id(&format!("party:{ns}:owner")),
        endpoint: format!("http://{name}.{ns}.example"),
        certificate: None,
        namespace: caps.can_serve_policy.then(|| ns.to_string()),
        capabilities: caps,
    }
}

const RUNNER: SiteCapabilities = SiteCapabilities {
    can_run_steps: true,
    can_store_assets: true,
    can_serve_policy: false,
};

const POLICY: SiteCapabilities = SiteCapabilities {
    can_run_steps: false,
    can_store_assets: false,
    can_serve_policy: true,
};

#[derive(Default)]
struct Recorder {
    created: Mutex<Vec<Identifier>>,
    deleted: Mutex<Vec<Identifier>>,
}

impl ReplicaSink<RegisteredObject> for Recorder {
    fn on_update(&self, created: &[RegisteredObject], deleted: &[RegisteredObject]) {
        self.created
            .lock()
            .unwrap()
            .extend(created.iter().map(|o| o.id().clone()));
        self.deleted
            .lock()
            .unwrap()
            .extend(deleted.iter().map(|o| o.id().clone()));
    }
}

#[tokio::test]
async fn client_follows_registry() {
    let registry = Arc::new(Registry::new(chrono::Duration::seconds(30)));
    let client = RegistryClient::new(Arc::clone(&registry) as Arc<dyn ReplicaSource<RegisteredObject>>);
    let recorder = Arc::new(Recorder::default());
    client.add_sink(recorder.clone());

    assert!(matches!(client.sites(), Err(RegistryError::Replication(_))));

    registry.register_party(party("hospital")).unwrap();
    registry.register_party(party("lab")).unwrap();
    registry.register_site(site("hospital", "b", RUNNER)).unwrap();
    registry.register_site(site("hospital", "a", RUNNER)).unwrap();
    registry.register_site(site("lab", "policy", POLICY)).unwrap();

    assert_eq!(
        client.refresh().await.unwrap(),
        UpdateOutcome::Resynced { objects: 5 }
    );
    let runners: Vec<Identifier> = client
        .sites_with_runners()
        .unwrap()
        .into_iter()
        .map(|s| s.id)
        .collect();
    assert_eq!(runners, vec![id("site:hospital:a"), id("site:hospital:b")]);
    assert_eq!(client.policy_servers().unwrap().len(), 1);

    registry.deregister_site(&id("site:hospital:b")).unwrap();
    assert_eq!(
        client.refresh().await.unwrap(),
        UpdateOutcome::Merged {
            created: 0,
            deleted: 1
        }
    );
    assert!(matches!(
        client.site(&id("site:hospital:b")),
        Err(RegistryError::NotFound(_))
    ));
    assert_eq!(recorder.created.lock().unwrap().len(), 5);
    assert_eq!(
        *recorder.deleted.lock().unwrap(),
        vec![id("site:hospital:b")]
    );
}

#[tokio::test]
async fn namespace_authority_comes_from_owner_and_site_admins() {
    let registry = Arc::new(Registry::new(chrono::Duration::seconds(30)));
    registry.register_party(party("hospital")).unwrap();
    registry
        .register_party(PartyDescription {
            id: id("party:ops:admin"),
            namespace: "ops".into(),
            public_key: "22".repeat(32),
        })
        .unwrap();
    registry
        .register_site(SiteDescription {
            admin_id: id("party:ops:admin"),
            ..site("hospital", "a", RUNNER)
        })
        .unwrap();

    let client = RegistryClient::new(registry.clone());
    client.refresh().await.unwrap();

    let authority = client.authority_for_namespace("hospital").unwrap().unwrap();
    assert_eq!(authority.owner, id("party:hospital:owner"));
    assert_eq!(authority.owner_key, "11".repeat(32));
    assert_eq!(
        authority.administrators,
        BTreeSet::from([id("party:ops:admin")])
    );
    assert!(client.authority_for_namespace("nobody").unwrap().is_none());
}
