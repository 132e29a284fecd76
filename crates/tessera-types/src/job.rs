//! Jobs, plans, execution requests and results.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::TypeError;
use crate::identifier::Identifier;
use crate::workflow::{step_item, SourceRef, Workflow};

#[derive(Serialize, Deserialize)]
struct RawJob {
    submitter: Identifier,
    workflow: Workflow,
    inputs: BTreeMap<String, Identifier>,
}

/// A workflow together with concrete assets bound to its inputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawJob", into = "RawJob")]
pub struct Job {
    submitter: Identifier,
    workflow: Workflow,
    inputs: BTreeMap<String, Identifier>,
}

impl Job {
    /// Creates a job, checking that exactly the workflow's inputs are bound.
    pub fn new(
        submitter: Identifier,
        workflow: Workflow,
        inputs: BTreeMap<String, Identifier>,
    ) -> Result<Self, TypeError> {
        for name in workflow.inputs() {
            if !inputs.contains_key(name) {
                return Err(TypeError::InvalidJob(format!(
                    "workflow input '{name}' is not bound"
                )));
            }
        }
        if let Some(extra) = inputs.keys().find(|k| !workflow.inputs().contains(*k)) {
            return Err(TypeError::InvalidJob(format!(
                "binding for unknown input '{extra}'"
            )));
        }
        Ok(Self {
            submitter,
            workflow,
            inputs,
        })
    }

    pub fn submitter(&self) -> &Identifier {
        &self.submitter
    }

    pub fn workflow(&self) -> &Workflow {
        &self.workflow
    }

    pub fn inputs(&self) -> &BTreeMap<String, Identifier> {
        &self.inputs
    }

    /// The minimal job that computes the outputs of `step`.
    pub fn subjob(&self, step: &str) -> Result<Job, TypeError> {
        let workflow = self.workflow.subworkflow(step)?;
        let inputs = self
            .inputs
            .iter()
            .filter(|(name, _)| workflow.inputs().contains(*name))
            .map(|(name, id)| (name.clone(), id.clone()))
            .collect();
        Job::new(self.submitter.clone(), workflow, inputs)
    }

    /// Content hashes of every item in the workflow.
    ///
    /// A workflow input hashes the id of the asset bound to it. A step input
    /// takes the hash of its source. A step output hashes the step's input
    /// hashes in input-name order, then the compute asset id, then the
    /// output name. A workflow output takes the hash of its source.
    ///
    /// Identical sub-computations therefore produce identical hashes, no
    /// matter which workflow they are embedded in.
    pub fn id_hashes(&self) -> BTreeMap<String, String> {
        let mut hashes = BTreeMap::new();

        for (name, asset) in &self.inputs {
            hashes.insert(name.clone(), hex::encode(Sha256::digest(asset.as_str())));
        }

        for step in self.workflow.topological_order() {
            let mut step_hash = Sha256::new();
            for (input, source) in &step.inputs {
                let source_hash = hashes
                    .get(&source.to_string())
                    .cloned()
                    .unwrap_or_default();
                step_hash.update(source_hash.as_bytes());
                hashes.insert(step_item(&step.name, input), source_hash);
            }
            step_hash.update(step.compute_asset.as_str().as_bytes());

            for output in step.outputs.keys() {
                let mut output_hash = step_hash.clone();
                output_hash.update(output.as_bytes());
                hashes.insert(
                    step_item(&step.name, output),
                    hex::encode(output_hash.finalize()),
                );
            }
        }

        for (name, source) in self.workflow.outputs() {
            if let Some(hash) = hashes.get(&source.to_string()).cloned() {
                hashes.insert(name.clone(), hash);
            }
        }
        hashes
    }

    /// The concrete asset id for a source reference.
    ///
    /// Workflow inputs resolve to their binding; step outputs to their
    /// content-addressed `result:` id.
    pub fn resolve(&self, source: &SourceRef) -> Option<Identifier> {
        match source {
            SourceRef::WorkflowInput(name) => self.inputs.get(name).cloned(),
            SourceRef::StepOutput { .. } => self
                .id_hashes()
                .get(&source.to_string())
                .and_then(|hash| Identifier::from_id_hash(hash).ok()),
        }
    }

    /// The concrete asset ids a step reads, by input name.
    pub fn step_input_assets(&self, step: &str) -> BTreeMap<String, Identifier> {
        let Some(step) = self.workflow.step(step) else {
            return BTreeMap::new();
        };
        let hashes = self.id_hashes();
        step.inputs
            .iter()
            .filter_map(|(name, source)| {
                let id = match source {
                    SourceRef::WorkflowInput(input) => self.inputs.get(input).cloned(),
                    SourceRef::StepOutput { .. } => hashes
                        .get(&source.to_string())
                        .and_then(|h| Identifier::from_id_hash(h).ok()),
                };
                id.map(|id| (name.clone(), id))
            })
            .collect()
    }

    /// The `result:` ids of every workflow output, by output name.
    pub fn output_ids(&self) -> BTreeMap<String, Identifier> {
        let hashes = self.id_hashes();
        self.workflow
            .outputs()
            .keys()
            .filter_map(|name| {
                hashes
                    .get(name)
                    .and_then(|h| Identifier::from_id_hash(h).ok())
                    .map(|id| (name.clone(), id))
            })
            .collect()
    }
}

impl TryFrom<RawJob> for Job {
    type Error = TypeError;

    fn try_from(raw: RawJob) -> Result<Self, Self::Error> {
        Job::new(raw.submitter, raw.workflow, raw.inputs)
    }
}

impl From<Job> for RawJob {
    fn from(job: Job) -> Self {
        Self {
            submitter: job.submitter,
            workflow: job.workflow,
            inputs: job.inputs,
        }
    }
}

/// Which site executes each step of a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub step_sites: BTreeMap<String, Identifier>,
}

impl Plan {
    pub fn new(step_sites: BTreeMap<String, Identifier>) -> Self {
        Self { step_sites }
    }

    pub fn site_of(&self, step: &str) -> Option<&Identifier> {
        self.step_sites.get(step)
    }

    /// Every site that executes at least one step.
    pub fn sites(&self) -> BTreeSet<&Identifier> {
        self.step_sites.values().collect()
    }

    /// Steps assigned to `site`.
    pub fn steps_at(&self, site: &Identifier) -> BTreeSet<&str> {
        self.step_sites
            .iter()
            .filter(|(_, s)| *s == site)
            .map(|(step, _)| step.as_str())
            .collect()
    }

    /// True if every step of `workflow` is assigned exactly once and no
    /// unknown steps are assigned.
    pub fn covers(&self, workflow: &Workflow) -> bool {
        self.step_sites.len() == workflow.steps().len()
            && workflow
                .steps()
                .keys()
                .all(|name| self.step_sites.contains_key(name))
    }
}

/// A request for one site to execute some of a job's steps under a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub job: Job,
    pub plan: Plan,
    /// The steps to run now. Every one of them is assigned to the receiving
    /// site in `plan`. Empty means all steps assigned to that site.
    #[serde(default)]
    pub steps: BTreeSet<String>,
}

impl ExecutionRequest {
    pub fn new(job: Job, plan: Plan) -> Self {
        Self {
            job,
            plan,
            steps: BTreeSet::new(),
        }
    }

    pub fn for_steps(job: Job, plan: Plan, steps: BTreeSet<String>) -> Self {
        Self { job, plan, steps }
    }

    /// The steps `site` should run for this request, in topological order.
    pub fn steps_for(&self, site: &Identifier) -> Vec<String> {
        self.job
            .workflow()
            .topological_order()
            .into_iter()
            .filter(|step| self.plan.site_of(&step.name) == Some(site))
            .filter(|step| self.steps.is_empty() || self.steps.contains(&step.name))
            .map(|step| step.name.clone())
            .collect()
    }
}

/// The outcome of executing (part of) a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    pub job: Job,
    pub plan: Plan,
    pub is_done: bool,
    /// Produced outputs by item name. May be partial while `is_done` is false.
    pub outputs: BTreeMap<String, Identifier>,
}

impl JobResult {
    pub fn pending(job: Job, plan: Plan) -> Self {
        Self {
            job,
            plan,
            is_done: false,
            outputs: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::WorkflowStep;

    fn id(s: &str) -> Identifier {
        Identifier::parse(s).unwrap()
    }

    fn job_for(compute: &str) -> Job {
        let s1 = WorkflowStep::new("s1", &[("x", "a")], &[("y", None)], compute).unwrap();
        let s2 = WorkflowStep::new("s2", &[("x", "s1.y")], &[("y", None)], compute).unwrap();
        let wf = Workflow::new(&["a"], &[("out", "s2.y")], vec![s1, s2]).unwrap();
        Job::new(
            id("party:ns:alice"),
            wf,
            BTreeMap::from([("a".to_string(), id("asset:ns:data:ns:site1"))]),
        )
        .unwrap()
    }

    #[test]
    fn job_requires_exact_bindings() {
        let job = job_for("asset:ns:c:ns:site1");
        let wf = job.workflow().clone();
        assert!(Job::new(id("party:ns:alice"), wf.clone(), BTreeMap::new()).is_err());
        let extra = BTreeMap::from([
            ("a".to_string(), id("asset:ns:d:ns:s")),
            ("b".to_string(), id("asset:ns:d:ns:s")),
        ]);
        assert!(Job::new(id("party:ns:alice"), wf, extra).is_err());
    }

    #[test]
    fn id_hashes_follow_lineage() {
        let job = job_for("asset:ns:c:ns:site1");
        let hashes = job.id_hashes();

        let input_hash = hex::encode(Sha256::digest("asset:ns:data:ns:site1"));
        assert_eq!(hashes["a"], input_hash);
        assert_eq!(hashes["s1.x"], input_hash);
        assert_eq!(hashes["s2.x"], hashes["s1.y"]);
        assert_eq!(hashes["out"], hashes["s2.y"]);

        let mut expected = Sha256::new();
        expected.update(input_hash.as_bytes());
        expected.update(b"asset:ns:c:ns:site1");
        expected.update(b"y");
        assert_eq!(hashes["s1.y"], hex::encode(expected.finalize()));
    }

    #[test]
    fn identical_subcomputations_share_hashes() {
        let job = job_for("asset:ns:c:ns:site1");
        let sub = job.subjob("s1").unwrap();
        assert_eq!(job.id_hashes()["s1.y"], sub.id_hashes()["s1.y"]);

        let other = job_for("asset:ns:other:ns:site1");
        assert_ne!(job.id_hashes()["s1.y"], other.id_hashes()["s1.y"]);
    }

    #[test]
    fn step_inputs_resolve_to_results() {
        let job = job_for("asset:ns:c:ns:site1");
        let inputs = job.step_input_assets("s2");
        let expected = Identifier::from_id_hash(&job.id_hashes()["s1.y"]).unwrap();
        assert_eq!(inputs["x"], expected);
        assert_eq!(job.output_ids()["out"], job.resolve(&"s2.y".parse().unwrap()).unwrap());
    }

    #[test]
    fn request_selects_site_steps_in_order() {
        let job = job_for("asset:ns:c:ns:site1");
        let plan = Plan::new(BTreeMap::from([
            ("s1".to_string(), id("site:ns:site1")),
            ("s2".to_string(), id("site:ns:site1")),
        ]));
        assert!(plan.covers(job.workflow()));
        let request = ExecutionRequest::new(job.clone(), plan.clone());
        assert_eq!(request.steps_for(&id("site:ns:site1")), vec!["s1", "s2"]);
        assert!(request.steps_for(&id("site:ns:site2")).is_empty());

        let partial = ExecutionRequest::for_steps(job, plan, BTreeSet::from(["s2".to_string()]));
        assert_eq!(partial.steps_for(&id("site:ns:site1")), vec!["s2"]);
    }
}
