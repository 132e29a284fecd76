//! Per-item permissions of a job and placement legality.

use std::collections::BTreeMap;
use thiserror::Error;

use tessera_types::{base_item, step_item, Identifier, Job, Plan};

use crate::closure::{Closure, Permissions};

/// Why a site may not run a step.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Denial {
    #[error("no access to input '{input}' ({asset})")]
    InputAccessDenied { input: String, asset: String },

    #[error("no access to compute asset {asset}")]
    ComputeAccessDenied { asset: Identifier },

    #[error("no access to base asset {asset} of output '{output}'")]
    BaseAccessDenied { output: String, asset: Identifier },

    #[error("no access to output '{output}'")]
    OutputAccessDenied { output: String },

    #[error("submitter {party} may not use workflow output '{output}'")]
    OutputUseDenied { output: String, party: Identifier },

    #[error("step '{0}' is not part of the workflow")]
    UnknownStep(String),
}

/// Evaluates whole jobs against a closure.
pub struct PermissionCalculator<'a> {
    closure: &'a Closure,
    output_checks: bool,
}

impl<'a> PermissionCalculator<'a> {
    pub fn new(closure: &'a Closure) -> Self {
        Self {
            closure,
            output_checks: false,
        }
    }

    /// Also requires that a site may access the outputs of the steps it
    /// runs, and that the submitter may use every workflow output.
    pub fn with_output_checks(mut self, enabled: bool) -> Self {
        self.output_checks = enabled;
        self
    }

    /// Permissions of every item of `job`.
    pub fn calculate_permissions(&self, job: &Job) -> BTreeMap<String, Permissions> {
        self.closure.job_permissions(job)
    }

    /// Checks that `site` may run `step`: it needs access to every input,
    /// to the compute asset and to every output base asset. With output
    /// checks enabled it also needs access to every output it produces.
    pub fn check_step(
        &self,
        job: &Job,
        permissions: &BTreeMap<String, Permissions>,
        step: &str,
        site: &Identifier,
    ) -> Result<(), Denial> {
        let Some(workflow_step) = job.workflow().step(step) else {
            return Err(Denial::UnknownStep(step.to_string()));
        };
        let input_assets = job.step_input_assets(step);

        for input in workflow_step.inputs.keys() {
            let item = step_item(step, input);
            let allowed = permissions
                .get(&item)
                .is_some_and(|p| self.closure.permits_access(p, site));
            if !allowed {
                return Err(Denial::InputAccessDenied {
                    input: item,
                    asset: input_assets
                        .get(input)
                        .map(ToString::to_string)
                        .unwrap_or_else(|| "unresolved".to_string()),
                });
            }
        }

        let compute_allowed = permissions
            .get(step)
            .is_some_and(|p| self.closure.permits_access(p, site));
        if !compute_allowed {
            return Err(Denial::ComputeAccessDenied {
                asset: workflow_step.compute_asset.clone(),
            });
        }

        for (output, base) in &workflow_step.outputs {
            let Some(base) = base else { continue };
            let allowed = permissions
                .get(&base_item(step, output))
                .is_some_and(|p| self.closure.permits_access(p, site));
            if !allowed {
                return Err(Denial::BaseAccessDenied {
                    output: output.clone(),
                    asset: base.clone(),
                });
            }
        }

        if self.output_checks {
            for output in workflow_step.outputs.keys() {
                let item = step_item(step, output);
                let allowed = permissions
                    .get(&item)
                    .is_some_and(|p| self.closure.permits_access(p, site));
                if !allowed {
                    return Err(Denial::OutputAccessDenied { output: item });
                }
            }
        }
        Ok(())
    }

    /// For every step, the subset of `sites` allowed to run it, in the
    /// order given.
    pub fn permitted_sites(
        &self,
        job: &Job,
        sites: &[Identifier],
    ) -> BTreeMap<String, Vec<Identifier>> {
        let permissions = self.calculate_permissions(job);
        job.workflow()
            .steps()
            .keys()
            .map(|step| {
                let allowed = sites
                    .iter()
                    .filter(|site| self.check_step(job, &permissions, step, site).is_ok())
                    .cloned()
                    .collect();
                (step.clone(), allowed)
            })
            .collect()
    }

    /// Checks every assignment of `plan`, returning the first offending
    /// step, its site and the reason.
    pub fn check_plan(&self, job: &Job, plan: &Plan) -> Result<(), (String, Identifier, Denial)> {
        let permissions = self.calculate_permissions(job);
        for step in job.workflow().topological_order() {
            let Some(site) = plan.site_of(&step.name) else {
                return Err((
                    step.name.clone(),
                    Identifier::wildcard(),
                    Denial::UnknownStep(step.name.clone()),
                ));
            };
            self.check_step(job, &permissions, &step.name, site)
                .map_err(|denial| (step.name.clone(), site.clone(), denial))?;
        }

        if self.output_checks {
            for (output, source) in job.workflow().outputs() {
                let allowed = permissions
                    .get(output)
                    .is_some_and(|p| self.closure.permits_use(p, job.submitter()).allowed);
                if !allowed {
                    let step = source.step().unwrap_or(output.as_str());
                    let site = plan.site_of(step).cloned().unwrap_or_else(Identifier::wildcard);
                    return Err((
                        step.to_string(),
                        site,
                        Denial::OutputUseDenied {
                            output: output.clone(),
                            party: job.submitter().clone(),
                        },
                    ));
                }
            }
        }
        Ok(())
    }

    /// True if every step of `job` is assigned to a site allowed to run it.
    pub fn is_legal(&self, job: &Job, plan: &Plan) -> bool {
        plan.covers(job.workflow()) && self.check_plan(job, plan).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::Rule;
    use tessera_types::{Workflow, WorkflowStep};

    fn id(s: &str) -> Identifier {
        Identifier::parse(s).unwrap()
    }

    const DATA: &str = "asset:ns1:x:ns1:s1";
    const COMPUTE: &str = "asset:ns2:y:ns2:s2";
    const BASE: &str = "asset:ns2:base:ns2:s2";

    fn two_step_job() -> Job {
        let first = WorkflowStep::new(
            "first",
            &[("in", "data")],
            &[("out", Some(BASE))],
            COMPUTE,
        )
        .unwrap();
        let second =
            WorkflowStep::new("second", &[("in", "first.out")], &[("out", None)], COMPUTE)
                .unwrap();
        let wf = Workflow::new(&["data"], &[("result", "second.out")], vec![first, second])
            .unwrap();
        Job::new(
            id("party:ns1:p"),
            wf,
            BTreeMap::from([("data".to_string(), id(DATA))]),
        )
        .unwrap()
    }

    fn rules() -> Vec<Rule> {
        vec![
            Rule::MayAccess {
                site: id("site:ns1:s1"),
                asset: id(DATA),
            },
            Rule::MayAccess {
                site: id("*"),
                asset: id(COMPUTE),
            },
            Rule::MayAccess {
                site: id("*"),
                asset: id(BASE),
            },
            Rule::ResultOfIn {
                data_asset: id(DATA),
                compute_asset: id(COMPUTE),
                output: "*".into(),
                collection: id("asset_collection:ns1:derived"),
            },
            Rule::ResultOfIn {
                data_asset: id(BASE),
                compute_asset: id("*"),
                output: "*".into(),
                collection: id("asset_collection:ns1:derived"),
            },
            Rule::MayAccess {
                site: id("site:ns1:s1"),
                asset: id("asset_collection:ns1:derived"),
            },
        ]
    }

    #[test]
    fn permissions_cover_every_item() {
        let closure = Closure::new(&rules(), BTreeMap::new());
        let perms = PermissionCalculator::new(&closure).calculate_permissions(&two_step_job());
        for item in [
            "data",
            "first",
            "first.in",
            "first.@out",
            "first.out",
            "second",
            "second.in",
            "second.out",
            "result",
        ] {
            assert!(perms.contains_key(item), "missing {item}");
        }
        assert_eq!(perms["second.in"], perms["first.out"]);
        assert_eq!(perms["result"], perms["second.out"]);
    }

    #[test]
    fn permitted_sites_follow_inputs() {
        let closure = Closure::new(&rules(), BTreeMap::new());
        let calc = PermissionCalculator::new(&closure);
        let sites = vec![id("site:ns1:s1"), id("site:ns2:s2")];
        let permitted = calc.permitted_sites(&two_step_job(), &sites);
        assert_eq!(permitted["first"], vec![id("site:ns1:s1")]);
        assert_eq!(permitted["second"], vec![id("site:ns1:s1")]);
    }

    #[test]
    fn illegal_plan_names_step_and_reason() {
        let closure = Closure::new(&rules(), BTreeMap::new());
        let calc = PermissionCalculator::new(&closure);
        let job = two_step_job();

        let legal = Plan::new(BTreeMap::from([
            ("first".to_string(), id("site:ns1:s1")),
            ("second".to_string(), id("site:ns1:s1")),
        ]));
        assert!(calc.is_legal(&job, &legal));

        let illegal = Plan::new(BTreeMap::from([
            ("first".to_string(), id("site:ns1:s1")),
            ("second".to_string(), id("site:ns2:s2")),
        ]));
        assert!(!calc.is_legal(&job, &illegal));
        let (step, site, denial) = calc.check_plan(&job, &illegal).unwrap_err();
        assert_eq!(step, "second");
        assert_eq!(site, id("site:ns2:s2"));
        assert!(matches!(denial, Denial::InputAccessDenied { .. }));
    }

    fn legal_plan() -> Plan {
        Plan::new(BTreeMap::from([
            ("first".to_string(), id("site:ns1:s1")),
            ("second".to_string(), id("site:ns1:s1")),
        ]))
    }

    #[test]
    fn unreadable_output_blocks_the_step_producing_it() {
        let closure = Closure::new(&rules(), BTreeMap::new());
        let job = two_step_job();

        // Nothing places results derived from the collection anywhere.
        assert!(PermissionCalculator::new(&closure).is_legal(&job, &legal_plan()));

        let calc = PermissionCalculator::new(&closure).with_output_checks(true);
        let perms = calc.calculate_permissions(&job);
        assert_eq!(calc.check_step(&job, &perms, "first", &id("site:ns1:s1")), Ok(()));
        assert_eq!(
            calc.check_step(&job, &perms, "second", &id("site:ns1:s1")),
            Err(Denial::OutputAccessDenied {
                output: "second.out".into()
            })
        );
        assert!(!calc.is_legal(&job, &legal_plan()));
    }

    #[test]
    fn submitter_must_be_allowed_to_use_workflow_outputs() {
        let mut rules = rules();
        rules.push(Rule::ResultOfIn {
            data_asset: id("asset_collection:ns1:derived"),
            compute_asset: id("*"),
            output: "*".into(),
            collection: id("asset_collection:ns1:derived"),
        });
        let job = two_step_job();

        let closure = Closure::new(&rules, BTreeMap::new());
        let calc = PermissionCalculator::new(&closure).with_output_checks(true);
        let (step, site, denial) = calc.check_plan(&job, &legal_plan()).unwrap_err();
        assert_eq!(step, "second");
        assert_eq!(site, id("site:ns1:s1"));
        assert_eq!(
            denial,
            Denial::OutputUseDenied {
                output: "result".into(),
                party: id("party:ns1:p"),
            }
        );

        rules.push(Rule::MayUse {
            party: id("party:ns1:p"),
            asset: id("asset_collection:ns1:derived"),
            conditions: String::new(),
        });
        let closure = Closure::new(&rules, BTreeMap::new());
        let calc = PermissionCalculator::new(&closure).with_output_checks(true);
        assert!(calc.is_legal(&job, &legal_plan()));
    }

    #[test]
    fn missing_compute_grant_is_reported() {
        let rules = vec![Rule::MayAccess {
            site: id("site:ns1:s1"),
            asset: id(DATA),
        }];
        let closure = Closure::new(&rules, BTreeMap::new());
        let calc = PermissionCalculator::new(&closure);
        let job = two_step_job();
        let perms = calc.calculate_permissions(&job);
        assert_eq!(
            calc.check_step(&job, &perms, "first", &id("site:ns1:s1")),
            Err(Denial::ComputeAccessDenied {
                asset: id(COMPUTE)
            })
        );
    }
}
