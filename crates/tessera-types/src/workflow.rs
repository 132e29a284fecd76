//! Workflow definitions.
//!
//! A [`Workflow`] is a directed acyclic graph of [`WorkflowStep`]s. Values
//! flowing through it are named by workflow items, which are scoped to one
//! workflow rather than globally unique:
//!
//! * `name` for a workflow input, workflow output, or step,
//! * `step.input` for a step input,
//! * `step.output` for a step output,
//! * `step.@output` for the base asset of a step output.
//!
//! All structural invariants (unique names, resolvable references, no
//! cycles) are checked when a workflow is built or deserialized, so a
//! `Workflow` value is always well formed.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::str::FromStr;

use crate::error::TypeError;
use crate::identifier::Identifier;

/// Returns true if `name` is usable as a workflow, step, input, or output name.
pub fn is_valid_item_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// The item name of a step input or output, `step.name`.
pub fn step_item(step: &str, name: &str) -> String {
    format!("{step}.{name}")
}

/// The item name of the base asset of a step output, `step.@output`.
pub fn base_item(step: &str, output: &str) -> String {
    format!("{step}.@{output}")
}

/// Where a step input or workflow output takes its value from.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SourceRef {
    /// A workflow input, referenced by its name.
    WorkflowInput(String),
    /// An output of another step, referenced as `step.output`.
    StepOutput { step: String, output: String },
}

impl SourceRef {
    /// Parses a source reference.
    pub fn parse(text: &str) -> Result<Self, TypeError> {
        match text.split_once('.') {
            None if is_valid_item_name(text) => Ok(Self::WorkflowInput(text.to_string())),
            Some((step, output)) if is_valid_item_name(step) && is_valid_item_name(output) => {
                Ok(Self::StepOutput {
                    step: step.to_string(),
                    output: output.to_string(),
                })
            }
            _ => Err(TypeError::InvalidItem(text.to_string())),
        }
    }

    /// The step this reference depends on, if any.
    pub fn step(&self) -> Option<&str> {
        match self {
            Self::WorkflowInput(_) => None,
            Self::StepOutput { step, .. } => Some(step),
        }
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WorkflowInput(name) => f.write_str(name),
            Self::StepOutput { step, output } => write!(f, "{step}.{output}"),
        }
    }
}

impl FromStr for SourceRef {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for SourceRef {
    type Error = TypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<SourceRef> for String {
    fn from(source: SourceRef) -> Self {
        source.to_string()
    }
}

/// One step of a workflow: a compute asset applied to named inputs,
/// producing named outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub name: String,
    /// Input name to the source it is read from.
    pub inputs: BTreeMap<String, SourceRef>,
    /// Output name to the base asset used to package it, if any.
    pub outputs: BTreeMap<String, Option<Identifier>>,
    pub compute_asset: Identifier,
}

impl WorkflowStep {
    /// Builds a step from textual parts.
    ///
    /// # Errors
    ///
    /// Fails if a name is invalid, an input and an output share a name, or a
    /// reference or identifier does not parse.
    pub fn new(
        name: &str,
        inputs: &[(&str, &str)],
        outputs: &[(&str, Option<&str>)],
        compute_asset: &str,
    ) -> Result<Self, TypeError> {
        let mut input_map = BTreeMap::new();
        for (input, source) in inputs {
            if input_map
                .insert(input.to_string(), SourceRef::parse(source)?)
                .is_some()
            {
                return Err(TypeError::InvalidWorkflow(format!(
                    "duplicate input '{input}' in step '{name}'"
                )));
            }
        }

        let mut output_map = BTreeMap::new();
        for (output, base) in outputs {
            let base = base.map(Identifier::parse).transpose()?;
            if output_map.insert(output.to_string(), base).is_some() {
                return Err(TypeError::InvalidWorkflow(format!(
                    "duplicate output '{output}' in step '{name}'"
                )));
            }
        }

        let step = Self {
            name: name.to_string(),
            inputs: input_map,
            outputs: output_map,
            compute_asset: Identifier::parse(compute_asset)?,
        };
        step.validate()?;
        Ok(step)
    }

    fn validate(&self) -> Result<(), TypeError> {
        if !is_valid_item_name(&self.name) {
            return Err(TypeError::InvalidItem(self.name.clone()));
        }
        for name in self.inputs.keys().chain(self.outputs.keys()) {
            if !is_valid_item_name(name) {
                return Err(TypeError::InvalidItem(step_item(&self.name, name)));
            }
        }
        if let Some(name) = self.inputs.keys().find(|n| self.outputs.contains_key(*n)) {
            return Err(TypeError::InvalidWorkflow(format!(
                "step '{}' uses '{name}' as both input and output",
                self.name
            )));
        }
        Ok(())
    }

    /// Names of the steps this step reads outputs from.
    pub fn upstream_steps(&self) -> BTreeSet<&str> {
        self.inputs.values().filter_map(SourceRef::step).collect()
    }
}

#[derive(Serialize, Deserialize)]
struct RawWorkflow {
    inputs: Vec<String>,
    outputs: BTreeMap<String, SourceRef>,
    steps: Vec<WorkflowStep>,
}

/// A validated workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawWorkflow", into = "RawWorkflow")]
pub struct Workflow {
    inputs: BTreeSet<String>,
    outputs: BTreeMap<String, SourceRef>,
    steps: BTreeMap<String, WorkflowStep>,
    order: Vec<String>,
}

impl Workflow {
    /// Builds and validates a workflow.
    ///
    /// `outputs` maps each workflow output name to a `step.output` reference.
    pub fn new(
        inputs: &[&str],
        outputs: &[(&str, &str)],
        steps: Vec<WorkflowStep>,
    ) -> Result<Self, TypeError> {
        let mut output_map = BTreeMap::new();
        for (name, source) in outputs {
            if output_map
                .insert(name.to_string(), SourceRef::parse(source)?)
                .is_some()
            {
                return Err(TypeError::InvalidWorkflow(format!(
                    "duplicate output '{name}'"
                )));
            }
        }
        Self::from_parts(
            inputs.iter().map(|s| s.to_string()).collect(),
            output_map,
            steps,
        )
    }

    fn from_parts(
        inputs: Vec<String>,
        outputs: BTreeMap<String, SourceRef>,
        steps: Vec<WorkflowStep>,
    ) -> Result<Self, TypeError> {
        let mut names = BTreeSet::new();
        let all_names = inputs
            .iter()
            .chain(steps.iter().map(|s| &s.name))
            .chain(outputs.keys());
        for name in all_names {
            if !is_valid_item_name(name) {
                return Err(TypeError::InvalidItem(name.clone()));
            }
            if !names.insert(name.as_str()) {
                return Err(TypeError::InvalidWorkflow(format!(
                    "duplicate name '{name}' among inputs, steps and outputs"
                )));
            }
        }

        let inputs: BTreeSet<String> = inputs.into_iter().collect();
        let mut step_map = BTreeMap::new();
        for step in steps {
            step.validate()?;
            step_map.insert(step.name.clone(), step);
        }

        let resolves = |source: &SourceRef| match source {
            SourceRef::WorkflowInput(name) => inputs.contains(name),
            SourceRef::StepOutput { step, output } => step_map
                .get(step)
                .is_some_and(|s: &WorkflowStep| s.outputs.contains_key(output)),
        };

        for step in step_map.values() {
            for (input, source) in &step.inputs {
                if !resolves(source) {
                    return Err(TypeError::InvalidWorkflow(format!(
                        "input '{}' refers to unknown source '{source}'",
                        step_item(&step.name, input)
                    )));
                }
            }
        }
        for (name, source) in &outputs {
            if source.step().is_none() || !resolves(source) {
                return Err(TypeError::InvalidWorkflow(format!(
                    "output '{name}' must refer to an existing step output, got '{source}'"
                )));
            }
        }

        let order = sort_steps(&step_map)?;
        Ok(Self {
            inputs,
            outputs,
            steps: step_map,
            order,
        })
    }

    pub fn inputs(&self) -> &BTreeSet<String> {
        &self.inputs
    }

    pub fn outputs(&self) -> &BTreeMap<String, SourceRef> {
        &self.outputs
    }

    pub fn steps(&self) -> &BTreeMap<String, WorkflowStep> {
        &self.steps
    }

    pub fn step(&self, name: &str) -> Option<&WorkflowStep> {
        self.steps.get(name)
    }

    /// Steps in a deterministic topological order.
    ///
    /// Every step comes after all the steps it reads from; among steps that
    /// are ready at the same time the lexicographically smallest comes first.
    pub fn topological_order(&self) -> Vec<&WorkflowStep> {
        self.order
            .iter()
            .filter_map(|name| self.steps.get(name))
            .collect()
    }

    /// All steps that depend, directly or indirectly, on `step`.
    pub fn downstream_steps(&self, step: &str) -> BTreeSet<String> {
        let mut found = BTreeSet::new();
        let mut queue = VecDeque::from([step.to_string()]);
        while let Some(current) = queue.pop_front() {
            for candidate in self.steps.values() {
                if candidate.upstream_steps().contains(current.as_str())
                    && found.insert(candidate.name.clone())
                {
                    queue.push_back(candidate.name.clone());
                }
            }
        }
        found
    }

    /// The minimal workflow that computes `step`.
    ///
    /// Contains `step`, every step it depends on directly or indirectly, and
    /// the workflow inputs those steps read. The result has no outputs.
    pub fn subworkflow(&self, step: &str) -> Result<Workflow, TypeError> {
        let root = self
            .steps
            .get(step)
            .ok_or_else(|| TypeError::InvalidItem(step.to_string()))?;

        let mut selected: BTreeMap<String, WorkflowStep> = BTreeMap::new();
        let mut inputs = BTreeSet::new();
        let mut queue = VecDeque::from([root]);
        while let Some(current) = queue.pop_front() {
            if selected.contains_key(&current.name) {
                continue;
            }
            for source in current.inputs.values() {
                match source {
                    SourceRef::WorkflowInput(name) => {
                        inputs.insert(name.clone());
                    }
                    SourceRef::StepOutput { step, .. } => {
                        if let Some(upstream) = self.steps.get(step) {
                            queue.push_back(upstream);
                        }
                    }
                }
            }
            selected.insert(current.name.clone(), current.clone());
        }

        Self::from_parts(
            inputs.into_iter().collect(),
            BTreeMap::new(),
            selected.into_values().collect(),
        )
    }
}

fn sort_steps(steps: &BTreeMap<String, WorkflowStep>) -> Result<Vec<String>, TypeError> {
    let mut pending: BTreeMap<&str, BTreeSet<&str>> = steps
        .values()
        .map(|s| (s.name.as_str(), s.upstream_steps()))
        .collect();
    let mut order = Vec::with_capacity(steps.len());

    while !pending.is_empty() {
        let ready = pending
            .iter()
            .find(|(_, deps)| deps.is_empty())
            .map(|(name, _)| *name);
        let Some(ready) = ready else {
            let stuck: Vec<&str> = pending.keys().copied().collect();
            return Err(TypeError::InvalidWorkflow(format!(
                "cycle among steps {}",
                stuck.join(", ")
            )));
        };
        pending.remove(ready);
        for deps in pending.values_mut() {
            deps.remove(ready);
        }
        order.push(ready.to_string());
    }
    Ok(order)
}

impl TryFrom<RawWorkflow> for Workflow {
    type Error = TypeError;

    fn try_from(raw: RawWorkflow) -> Result<Self, Self::Error> {
        Self::from_parts(raw.inputs, raw.outputs, raw.steps)
    }
}

impl From<Workflow> for RawWorkflow {
    fn from(wf: Workflow) -> Self {
        let mut steps = wf.steps;
        Self {
            inputs: wf.inputs.into_iter().collect(),
            outputs: wf.outputs,
            steps: wf
                .order
                .iter()
                .filter_map(|name| steps.remove(name))
                .collect(),
        }
    }
}
