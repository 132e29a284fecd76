//! Assigning workflow steps to sites.

use std::collections::BTreeMap;
use std::sync::Arc;

use tessera_policy::{Closure, Denial, PermissionCalculator};
use tessera_registry::RegistryClient;
use tessera_types::{Identifier, Job, Plan, SourceRef};

use crate::error::{InfeasibleReason, PlanningError};
use crate::policy::PolicyView;

/// Produces plans for jobs from current policy and the registry.
pub struct Planner {
    policy: Arc<dyn PolicyView>,
    registry: RegistryClient,
    output_checks: bool,
}

impl Planner {
    pub fn new(policy: Arc<dyn PolicyView>, registry: RegistryClient) -> Self {
        Self {
            policy,
            registry,
            output_checks: false,
        }
    }

    /// Only places steps where their outputs may be accessed, and only
    /// plans jobs whose submitter may use every workflow output.
    pub fn with_output_checks(mut self, enabled: bool) -> Self {
        self.output_checks = enabled;
        self
    }

    /// Plans `job` against the current policy and the registered runners.
    pub async fn plan(&self, job: &Job) -> Result<Plan, PlanningError> {
        let closure = self.policy.current_closure().await?;
        let runners: Vec<Identifier> = self
            .registry
            .sites_with_runners()?
            .into_iter()
            .map(|site| site.id)
            .collect();
        let calculator =
            PermissionCalculator::new(&closure).with_output_checks(self.output_checks);
        place_steps(&calculator, job, &runners)
    }
}

/// Places every step of `job` on one of `runners`.
///
/// Steps are placed in topological order. A runner is a candidate for a
/// step if it may access every input, the compute asset and every output
/// base asset. Among candidates, the runner already holding the most of
/// the step's inputs wins; ties go to the smallest site id. The result
/// depends only on the closure, the job and the set of runners.
pub fn plan_job(
    closure: &Closure,
    job: &Job,
    runners: &[Identifier],
) -> Result<Plan, PlanningError> {
    place_steps(&PermissionCalculator::new(closure), job, runners)
}

fn place_steps(
    calculator: &PermissionCalculator<'_>,
    job: &Job,
    runners: &[Identifier],
) -> Result<Plan, PlanningError> {
    let mut runners = runners.to_vec();
    runners.sort();
    runners.dedup();

    let permissions = calculator.calculate_permissions(job);
    let mut step_sites: BTreeMap<String, Identifier> = BTreeMap::new();

    for step in job.workflow().topological_order() {
        if runners.is_empty() {
            return Err(infeasible(&step.name, InfeasibleReason::NoRunnerSites));
        }

        let mut candidates = Vec::new();
        let mut denials: BTreeMap<Identifier, Denial> = BTreeMap::new();
        for site in &runners {
            match calculator.check_step(job, &permissions, &step.name, site) {
                Ok(()) => candidates.push(site),
                Err(denial) => {
                    denials.insert(site.clone(), denial);
                }
            }
        }

        if candidates.is_empty() {
            let mut distinct = denials.values();
            let first = distinct.next().cloned();
            let reason = match first {
                Some(first) if distinct.all(|d| *d == first) => InfeasibleReason::Blocked(first),
                _ => InfeasibleReason::NoSiteSatisfiesAll(denials),
            };
            return Err(infeasible(&step.name, reason));
        }

        let holders: Vec<Option<Identifier>> = step
            .inputs
            .values()
            .map(|source| match source {
                SourceRef::WorkflowInput(name) => {
                    job.inputs().get(name).and_then(Identifier::location)
                }
                SourceRef::StepOutput { step, .. } => step_sites.get(step).cloned(),
            })
            .collect();

        let mut best: Option<(&Identifier, usize)> = None;
        for site in candidates {
            let held = holders
                .iter()
                .filter(|holder| holder.as_ref() == Some(site))
                .count();
            if best.map_or(true, |(_, most)| held > most) {
                best = Some((site, held));
            }
        }

        if let Some((site, held)) = best {
            tracing::debug!(step = %step.name, site = %site, inputs_held = held, "placed step");
            step_sites.insert(step.name.clone(), site.clone());
        }
    }

    let plan = Plan::new(step_sites);
    if let Err((step, _, denial)) = calculator.check_plan(job, &plan) {
        return Err(infeasible(&step, InfeasibleReason::Blocked(denial)));
    }
    Ok(plan)
}

fn infeasible(step: &str, reason: InfeasibleReason) -> PlanningError {
    tracing::info!(step, reason = %reason, "planning infeasible");
    PlanningError::Infeasible {
        step: step.to_string(),
        reason,
    }
}
