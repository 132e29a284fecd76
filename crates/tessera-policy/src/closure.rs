//! The inference engine.
//!
//! A [`Closure`] is computed once from a fixed set of rules and provenance
//! facts and then answers access, use and membership questions. It is the
//! least fixpoint of the following:
//!
//! 1. Collection membership is transitive, within assets and within parties.
//!    Rules that make a collection a member of itself are ignored.
//! 2. A result asset's permissions come from the job that produced it. For
//!    each set of assets permitting an input, the result is in every
//!    collection named by a `ResultOfIn` rule whose data asset is (a
//!    collection of) one of those assets, whose compute asset matches the
//!    step's, and whose output matches the item.
//! 3. Access to an asset holds if some site grant names the asset, or a
//!    collection it is transitively in. Use follows the same pattern keyed
//!    on parties.
//!
//! Permissions are a conjunction of disjunctions: a site has access if, for
//! every set in the asset's [`Permissions`], it has access to at least one
//! member of that set. Primary assets have a single set containing only
//! themselves; results carry one set per input lineage.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use tessera_types::{base_item, step_item, Identifier, IdentifierKind, Job};

use crate::rules::Rule;

/// What permits access to or use of an asset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Permissions {
    sets: Vec<BTreeSet<Identifier>>,
}

impl Permissions {
    /// Permissions of an asset governed only by rules about itself.
    pub fn for_asset(asset: &Identifier) -> Self {
        Self {
            sets: vec![BTreeSet::from([asset.clone()])],
        }
    }

    pub fn from_sets(sets: Vec<BTreeSet<Identifier>>) -> Self {
        Self { sets }
    }

    pub fn sets(&self) -> &[BTreeSet<Identifier>] {
        &self.sets
    }
}

/// The answer to a use question.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UseDecision {
    pub allowed: bool,
    /// Conditions attached to the grants that allowed use, sorted and
    /// without duplicates. Empty when use is denied.
    pub conditions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ResultRule {
    data_asset: Identifier,
    compute_asset: Identifier,
    output: String,
    collection: Identifier,
}

/// Derived policy facts for a fixed rule set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Closure {
    /// Every asset or asset collection to all collections it is in,
    /// transitively, including itself.
    asset_collections: BTreeMap<Identifier, BTreeSet<Identifier>>,
    party_collections: BTreeMap<Identifier, BTreeSet<Identifier>>,
    /// Asset or collection to the sites granted access (may contain `*`).
    access: BTreeMap<Identifier, BTreeSet<Identifier>>,
    /// Asset or collection to (party, conditions) use grants.
    uses: BTreeMap<Identifier, BTreeSet<(Identifier, String)>>,
    results: Vec<ResultRule>,
    /// Result asset to the job and item that produced it.
    provenance: BTreeMap<Identifier, (Job, String)>,
}

impl Closure {
    /// Computes the closure of `rules` and `provenance`.
    ///
    /// The result depends only on the set of rules, not their order.
    pub fn new<'a>(
        rules: impl IntoIterator<Item = &'a Rule>,
        provenance: BTreeMap<Identifier, (Job, String)>,
    ) -> Self {
        let mut asset_edges: BTreeMap<Identifier, BTreeSet<Identifier>> = BTreeMap::new();
        let mut party_edges: BTreeMap<Identifier, BTreeSet<Identifier>> = BTreeMap::new();
        let mut access: BTreeMap<Identifier, BTreeSet<Identifier>> = BTreeMap::new();
        let mut uses: BTreeMap<Identifier, BTreeSet<(Identifier, String)>> = BTreeMap::new();
        let mut results = Vec::new();

        for rule in rules {
            match rule {
                Rule::InAssetCollection { asset, collection } => {
                    if asset != collection {
                        asset_edges
                            .entry(asset.clone())
                            .or_default()
                            .insert(collection.clone());
                    }
                }
                Rule::InPartyCollection { party, collection } => {
                    if party != collection {
                        party_edges
                            .entry(party.clone())
                            .or_default()
                            .insert(collection.clone());
                    }
                }
                Rule::MayAccess { site, asset } => {
                    access
                        .entry(asset.clone())
                        .or_default()
                        .insert(site.clone());
                }
                Rule::MayUse {
                    party,
                    asset,
                    conditions,
                } => {
                    uses.entry(asset.clone())
                        .or_default()
                        .insert((party.clone(), conditions.clone()));
                }
                Rule::ResultOfIn {
                    data_asset,
                    compute_asset,
                    output,
                    collection,
                } => results.push(ResultRule {
                    data_asset: data_asset.clone(),
                    compute_asset: compute_asset.clone(),
                    output: output.clone(),
                    collection: collection.clone(),
                }),
            }
        }

        results.sort_by(|a, b| {
            (&a.data_asset, &a.compute_asset, &a.output, &a.collection).cmp(&(
                &b.data_asset,
                &b.compute_asset,
                &b.output,
                &b.collection,
            ))
        });
        results.dedup();

        Self {
            asset_collections: transitive_closure(&asset_edges),
            party_collections: transitive_closure(&party_edges),
            access,
            uses,
            results,
            provenance,
        }
    }

    /// `asset` and every collection it is transitively in.
    pub fn asset_groups(&self, asset: &Identifier) -> BTreeSet<Identifier> {
        self.asset_collections
            .get(asset)
            .cloned()
            .unwrap_or_else(|| BTreeSet::from([asset.clone()]))
    }

    /// `party` and every party collection it is transitively in.
    pub fn party_groups(&self, party: &Identifier) -> BTreeSet<Identifier> {
        self.party_collections
            .get(party)
            .cloned()
            .unwrap_or_else(|| BTreeSet::from([party.clone()]))
    }

    fn groups_of_set(&self, set: &BTreeSet<Identifier>) -> BTreeSet<Identifier> {
        set.iter().flat_map(|a| self.asset_groups(a)).collect()
    }

    /// Permissions of any asset.
    ///
    /// Results whose provenance is known derive their permissions from the
    /// producing job; everything else is governed by rules about itself.
    pub fn permissions_for_asset(&self, asset: &Identifier) -> Permissions {
        self.asset_permissions(asset, &mut BTreeSet::new())
    }

    fn asset_permissions(
        &self,
        asset: &Identifier,
        visiting: &mut BTreeSet<Identifier>,
    ) -> Permissions {
        if asset.kind() == IdentifierKind::Result && visiting.insert(asset.clone()) {
            let derived = self
                .provenance
                .get(asset)
                .and_then(|(job, item)| self.job_permissions_inner(job, visiting).remove(item));
            visiting.remove(asset);
            if let Some(perms) = derived {
                return perms;
            }
        }
        Permissions::for_asset(asset)
    }

    /// Permissions of every item of `job`, keyed by item name.
    ///
    /// Workflow inputs use the permissions of their assets. A step input
    /// copies its source; the step itself and each output base asset are
    /// governed by their assets; a step output is propagated from the
    /// step's inputs and its base asset. Workflow outputs copy their source.
    pub fn job_permissions(&self, job: &Job) -> BTreeMap<String, Permissions> {
        self.job_permissions_inner(job, &mut BTreeSet::new())
    }

    fn job_permissions_inner(
        &self,
        job: &Job,
        visiting: &mut BTreeSet<Identifier>,
    ) -> BTreeMap<String, Permissions> {
        let mut perms: BTreeMap<String, Permissions> = BTreeMap::new();

        for (name, asset) in job.inputs() {
            perms.insert(name.clone(), self.asset_permissions(asset, visiting));
        }

        for step in job.workflow().topological_order() {
            let mut input_perms = Vec::with_capacity(step.inputs.len());
            for (input, source) in &step.inputs {
                let source_perms = perms.get(&source.to_string()).cloned().unwrap_or_default();
                input_perms.push(source_perms.clone());
                perms.insert(step_item(&step.name, input), source_perms);
            }

            perms.insert(
                step.name.clone(),
                Permissions::for_asset(&step.compute_asset),
            );

            for (output, base) in &step.outputs {
                let mut output_inputs = input_perms.clone();
                if let Some(base) = base {
                    let base_perms = self.asset_permissions(base, visiting);
                    output_inputs.push(base_perms.clone());
                    perms.insert(base_item(&step.name, output), base_perms);
                }
                perms.insert(
                    step_item(&step.name, output),
                    self.propagate(&output_inputs, &step.compute_asset, output),
                );
            }
        }

        for (name, source) in job.workflow().outputs() {
            if let Some(p) = perms.get(&source.to_string()).cloned() {
                perms.insert(name.clone(), p);
            }
        }
        perms
    }

    /// Permissions of output `output` of running `compute_asset` over inputs
    /// with the given permissions.
    ///
    /// Each set of each input becomes one set of the result, holding the
    /// collections that matching `ResultOfIn` rules place the result in.
    pub fn propagate(
        &self,
        inputs: &[Permissions],
        compute_asset: &Identifier,
        output: &str,
    ) -> Permissions {
        let compute_groups = self.asset_groups(compute_asset);
        let sets = inputs
            .iter()
            .flat_map(|p| p.sets.iter())
            .map(|set| {
                let data_groups = self.groups_of_set(set);
                self.results
                    .iter()
                    .filter(|r| data_groups.contains(&r.data_asset))
                    .filter(|r| {
                        r.compute_asset.is_wildcard() || compute_groups.contains(&r.compute_asset)
                    })
                    .filter(|r| r.output == "*" || r.output == output)
                    .map(|r| r.collection.clone())
                    .collect()
            })
            .collect();
        Permissions { sets }
    }

    /// True if `site` satisfies `permissions`.
    pub fn permits_access(&self, permissions: &Permissions, site: &Identifier) -> bool {
        permissions.sets.iter().all(|set| {
            self.groups_of_set(set).iter().any(|target| {
                self.access
                    .get(target)
                    .is_some_and(|sites| sites.iter().any(|s| s.matches(site)))
            })
        })
    }

    /// True if `site` may access `asset`.
    pub fn may_access(&self, site: &Identifier, asset: &Identifier) -> bool {
        self.permits_access(&self.permissions_for_asset(asset), site)
    }

    /// Whether `party` satisfies `permissions` for use, and on what conditions.
    pub fn permits_use(&self, permissions: &Permissions, party: &Identifier) -> UseDecision {
        let party_groups = self.party_groups(party);
        let mut conditions = BTreeSet::new();

        for set in &permissions.sets {
            let mut matched = false;
            for target in self.groups_of_set(set) {
                let Some(grants) = self.uses.get(&target) else {
                    continue;
                };
                for (grantee, condition) in grants {
                    if grantee.is_wildcard() || party_groups.contains(grantee) {
                        matched = true;
                        if !condition.is_empty() {
                            conditions.insert(condition.clone());
                        }
                    }
                }
            }
            if !matched {
                return UseDecision::default();
            }
        }

        UseDecision {
            allowed: true,
            conditions: conditions.into_iter().collect(),
        }
    }

    /// Whether `party` may use `asset`, and on what conditions.
    pub fn may_use(&self, party: &Identifier, asset: &Identifier) -> UseDecision {
        self.permits_use(&self.permissions_for_asset(asset), party)
    }

    /// Everything that is, directly or transitively, in `collection`.
    ///
    /// For asset collections this includes result assets with known
    /// provenance whose every permission set reaches the collection.
    pub fn members_of(&self, collection: &Identifier) -> BTreeSet<Identifier> {
        let table = match collection.kind() {
            IdentifierKind::PartyCollection => &self.party_collections,
            IdentifierKind::AssetCollection => &self.asset_collections,
            _ => return BTreeSet::new(),
        };

        let mut members: BTreeSet<Identifier> = table
            .iter()
            .filter(|(member, groups)| *member != collection && groups.contains(collection))
            .map(|(member, _)| member.clone())
            .collect();

        if collection.kind() == IdentifierKind::AssetCollection {
            for result in self.provenance.keys() {
                let perms = self.permissions_for_asset(result);
                let reaches = !perms.sets.is_empty()
                    && perms
                        .sets
                        .iter()
                        .all(|set| self.groups_of_set(set).contains(collection));
                if reaches {
                    members.insert(result.clone());
                }
            }
        }
        members
    }
}

fn transitive_closure(
    edges: &BTreeMap<Identifier, BTreeSet<Identifier>>,
) -> BTreeMap<Identifier, BTreeSet<Identifier>> {
    let mut closure = BTreeMap::new();
    for start in edges.keys() {
        let mut reached = BTreeSet::from([start.clone()]);
        let mut queue: VecDeque<&Identifier> = VecDeque::from([start]);
        while let Some(current) = queue.pop_front() {
            for next in edges.get(current).into_iter().flatten() {
                if reached.insert(next.clone()) {
                    queue.push_back(next);
                }
            }
        }
        closure.insert(start.clone(), reached);
    }
    closure
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_types::{Workflow, WorkflowStep};

    fn id(s: &str) -> Identifier {
        Identifier::parse(s).unwrap()
    }

    const DATA: &str = "asset:ns1:x:ns1:store";
    const COMPUTE: &str = "asset:ns2:y:ns2:store";

    fn single_step_job() -> Job {
        let step = WorkflowStep::new("s", &[("in", "data")], &[("out", None)], COMPUTE).unwrap();
        let wf = Workflow::new(&["data"], &[("result", "s.out")], vec![step]).unwrap();
        Job::new(
            id("party:ns1:p"),
            wf,
            BTreeMap::from([("data".to_string(), id(DATA))]),
        )
        .unwrap()
    }

    #[test]
    fn membership_is_transitive_and_ignores_self_loops() {
        let rules = vec![
            Rule::InAssetCollection {
                asset: id(DATA),
                collection: id("asset_collection:ns1:a"),
            },
            Rule::InAssetCollection {
                asset: id("asset_collection:ns1:a"),
                collection: id("asset_collection:ns1:b"),
            },
            Rule::InAssetCollection {
                asset: id("asset_collection:ns1:b"),
                collection: id("asset_collection:ns1:b"),
            },
            Rule::MayAccess {
                site: id("site:ns1:s"),
                asset: id("asset_collection:ns1:b"),
            },
        ];
        let closure = Closure::new(&rules, BTreeMap::new());
        assert!(closure.may_access(&id("site:ns1:s"), &id(DATA)));
        assert!(!closure.may_access(&id("site:ns1:other"), &id(DATA)));
        assert_eq!(
            closure.members_of(&id("asset_collection:ns1:b")),
            BTreeSet::from([id(DATA), id("asset_collection:ns1:a")])
        );
    }

    #[test]
    fn membership_cycles_terminate() {
        let rules = vec![
            Rule::InPartyCollection {
                party: id("party_collection:ns:a"),
                collection: id("party_collection:ns:b"),
            },
            Rule::InPartyCollection {
                party: id("party_collection:ns:b"),
                collection: id("party_collection:ns:a"),
            },
            Rule::InPartyCollection {
                party: id("party:ns:p"),
                collection: id("party_collection:ns:a"),
            },
        ];
        let closure = Closure::new(&rules, BTreeMap::new());
        assert!(closure
            .party_groups(&id("party:ns:p"))
            .contains(&id("party_collection:ns:b")));
    }

    #[test]
    fn wildcard_site_grant() {
        let rules = vec![Rule::MayAccess {
            site: id("*"),
            asset: id(COMPUTE),
        }];
        let closure = Closure::new(&rules, BTreeMap::new());
        assert!(closure.may_access(&id("site:any:where"), &id(COMPUTE)));
    }

    #[test]
    fn result_access_follows_result_of_in() {
        let job = single_step_job();
        let result = job.output_ids()["result"].clone();
        let rules = vec![
            Rule::ResultOfIn {
                data_asset: id(DATA),
                compute_asset: id(COMPUTE),
                output: "out".into(),
                collection: id("asset_collection:ns1:c"),
            },
            Rule::MayAccess {
                site: id("site:ns2:s2"),
                asset: id("asset_collection:ns1:c"),
            },
        ];
        let provenance = BTreeMap::from([(result.clone(), (job.clone(), "s.out".to_string()))]);
        let closure = Closure::new(&rules, provenance);

        assert!(closure.may_access(&id("site:ns2:s2"), &result));
        assert!(!closure.may_access(&id("site:ns2:s3"), &result));
        assert!(closure
            .members_of(&id("asset_collection:ns1:c"))
            .contains(&result));

        let without_provenance = Closure::new(&rules, BTreeMap::new());
        assert!(!without_provenance.may_access(&id("site:ns2:s2"), &result));
    }

    #[test]
    fn result_of_in_respects_output_name() {
        let job = single_step_job();
        let rules = vec![Rule::ResultOfIn {
            data_asset: id(DATA),
            compute_asset: id("*"),
            output: "other".into(),
            collection: id("asset_collection:ns1:c"),
        }];
        let closure = Closure::new(&rules, BTreeMap::new());
        let perms = closure.job_permissions(&job);
        assert_eq!(perms["s.out"].sets(), &[BTreeSet::new()]);
    }

    #[test]
    fn multi_input_results_need_every_lineage() {
        let other = "asset:ns3:z:ns3:store";
        let step = WorkflowStep::new(
            "s",
            &[("a", "left"), ("b", "right")],
            &[("out", None)],
            COMPUTE,
        )
        .unwrap();
        let wf = Workflow::new(&["left", "right"], &[], vec![step]).unwrap();
        let job = Job::new(
            id("party:ns1:p"),
            wf,
            BTreeMap::from([
                ("left".to_string(), id(DATA)),
                ("right".to_string(), id(other)),
            ]),
        )
        .unwrap();

        let mut rules = vec![
            Rule::ResultOfIn {
                data_asset: id(DATA),
                compute_asset: id("*"),
                output: "*".into(),
                collection: id("asset_collection:ns1:c"),
            },
            Rule::MayAccess {
                site: id("site:ns1:s"),
                asset: id("asset_collection:ns1:c"),
            },
        ];
        let closure = Closure::new(&rules, BTreeMap::new());
        let perms = closure.job_permissions(&job);
        assert!(!closure.permits_access(&perms["s.out"], &id("site:ns1:s")));

        rules.push(Rule::ResultOfIn {
            data_asset: id(other),
            compute_asset: id("*"),
            output: "*".into(),
            collection: id("asset_collection:ns1:c"),
        });
        let closure = Closure::new(&rules, BTreeMap::new());
        let perms = closure.job_permissions(&job);
        assert!(closure.permits_access(&perms["s.out"], &id("site:ns1:s")));
    }

    #[test]
    fn may_use_reports_conditions() {
        let rules = vec![
            Rule::InPartyCollection {
                party: id("party:ns1:alice"),
                collection: id("party_collection:ns1:researchers"),
            },
            Rule::MayUse {
                party: id("party_collection:ns1:researchers"),
                asset: id(DATA),
                conditions: "non-commercial".into(),
            },
            Rule::MayUse {
                party: id("*"),
                asset: id(DATA),
                conditions: "cite".into(),
            },
        ];
        let closure = Closure::new(&rules, BTreeMap::new());
        let decision = closure.may_use(&id("party:ns1:alice"), &id(DATA));
        assert!(decision.allowed);
        assert_eq!(decision.conditions, vec!["cite", "non-commercial"]);

        let decision = closure.may_use(&id("party:ns1:bob"), &id(DATA));
        assert_eq!(decision.conditions, vec!["cite"]);

        let decision = closure.may_use(&id("party:ns1:bob"), &id(COMPUTE));
        assert!(!decision.allowed);
    }

    #[test]
    fn closure_is_order_independent_and_idempotent() {
        let rules = vec![
            Rule::InAssetCollection {
                asset: id(DATA),
                collection: id("asset_collection:ns1:a"),
            },
            Rule::MayAccess {
                site: id("site:ns1:s"),
                asset: id("asset_collection:ns1:a"),
            },
            Rule::ResultOfIn {
                data_asset: id("asset_collection:ns1:a"),
                compute_asset: id("*"),
                output: "*".into(),
                collection: id("asset_collection:ns1:a"),
            },
        ];
        let first = Closure::new(&rules, BTreeMap::new());
        let again = Closure::new(&rules, BTreeMap::new());
        let reversed: Vec<Rule> = rules.iter().rev().cloned().collect();
        let third = Closure::new(&reversed, BTreeMap::new());
        assert_eq!(first, again);
        assert_eq!(first, third);
    }
}
