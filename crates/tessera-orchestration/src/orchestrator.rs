//! Driving jobs from submission to completion.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinSet;
use uuid::Uuid;

use tessera_registry::RegistryClient;
use tessera_types::{ExecutionRequest, Identifier, Job, JobResult, Plan, SourceRef};

use crate::error::{OrchestrationError, SiteError};
use crate::planner::Planner;
use crate::site::{SiteClient, SiteConnector};

/// Handle of a submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Where a job is in its life cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Received,
    Planning,
    Planned,
    Infeasible,
    Dispatching,
    Executing,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Infeasible | Self::Completed | Self::Failed)
    }
}

/// A snapshot of a job's progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatus {
    pub id: JobId,
    pub state: JobState,
    pub plan: Option<Plan>,
    /// Present once planned. Outputs fill in as steps finish.
    pub result: Option<JobResult>,
    pub error: Option<String>,
}

struct JobEntry {
    job: Job,
    status: Mutex<JobStatus>,
    state_tx: watch::Sender<JobState>,
}

impl JobEntry {
    fn status(&self) -> JobStatus {
        self.status
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn update(&self, f: impl FnOnce(&mut JobStatus)) {
        let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
        let before = status.state;
        f(&mut status);
        if status.state != before {
            tracing::info!(job = %status.id, from = ?before, to = ?status.state, "job state changed");
            self.state_tx.send_replace(status.state);
        }
    }
}

/// Plans submitted jobs and drives their execution across sites.
pub struct Orchestrator {
    planner: Planner,
    registry: RegistryClient,
    sites: Arc<dyn SiteConnector>,
    jobs: RwLock<HashMap<JobId, Arc<JobEntry>>>,
}

impl Orchestrator {
    pub fn new(
        planner: Planner,
        registry: RegistryClient,
        sites: Arc<dyn SiteConnector>,
    ) -> Arc<Self> {
        Arc::new(Self {
            planner,
            registry,
            sites,
            jobs: RwLock::new(HashMap::new()),
        })
    }

    fn entry(&self, id: JobId) -> Result<Arc<JobEntry>, OrchestrationError> {
        self.jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
            .ok_or_else(|| OrchestrationError::UnknownJob(id.to_string()))
    }

    /// Plans `job` and starts executing it in the background.
    ///
    /// Planning failures are returned here; the job stays visible in state
    /// `Infeasible`. Execution progress is observed through [`poll`] and
    /// [`wait`].
    ///
    /// [`poll`]: Self::poll
    /// [`wait`]: Self::wait
    pub async fn submit(self: &Arc<Self>, job: Job) -> Result<JobId, OrchestrationError> {
        let id = JobId::new();
        let (state_tx, _) = watch::channel(JobState::Received);
        let entry = Arc::new(JobEntry {
            job: job.clone(),
            status: Mutex::new(JobStatus {
                id,
                state: JobState::Received,
                plan: None,
                result: None,
                error: None,
            }),
            state_tx,
        });
        self.jobs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, Arc::clone(&entry));
        tracing::info!(job = %id, submitter = %job.submitter(), "job received");

        entry.update(|s| s.state = JobState::Planning);
        let plan = match self.planner.plan(&job).await {
            Ok(plan) => plan,
            Err(e) => {
                entry.update(|s| {
                    s.state = JobState::Infeasible;
                    s.error = Some(e.to_string());
                });
                return Err(e.into());
            }
        };
        entry.update(|s| {
            s.state = JobState::Planned;
            s.plan = Some(plan.clone());
            s.result = Some(JobResult::pending(job.clone(), plan.clone()));
        });

        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            orchestrator.execute(entry, plan).await;
        });
        Ok(id)
    }

    pub fn poll(&self, id: JobId) -> Result<JobStatus, OrchestrationError> {
        Ok(self.entry(id)?.status())
    }

    pub fn plan_of(&self, id: JobId) -> Result<Option<Plan>, OrchestrationError> {
        Ok(self.entry(id)?.status().plan)
    }

    pub fn job_of(&self, id: JobId) -> Result<Job, OrchestrationError> {
        Ok(self.entry(id)?.job.clone())
    }

    /// Waits until the job reaches a terminal state.
    pub async fn wait(&self, id: JobId) -> Result<JobStatus, OrchestrationError> {
        let entry = self.entry(id)?;
        let mut state_rx = entry.state_tx.subscribe();
        while !state_rx.borrow_and_update().is_terminal() {
            if state_rx.changed().await.is_err() {
                break;
            }
        }
        Ok(entry.status())
    }

    fn client_for(&self, site: &Identifier) -> Result<Arc<dyn SiteClient>, OrchestrationError> {
        let description = self.registry.site(site)?;
        Ok(self.sites.connect(&description))
    }

    async fn execute(self: Arc<Self>, entry: Arc<JobEntry>, plan: Plan) {
        let job = entry.job.clone();
        entry.update(|s| s.state = JobState::Dispatching);

        let mut pending: BTreeSet<String> = job.workflow().steps().keys().cloned().collect();
        let mut finished: BTreeSet<String> = BTreeSet::new();
        let mut running: JoinSet<(String, Identifier, Result<JobResult, OrchestrationError>)> =
            JoinSet::new();
        let mut failure: Option<OrchestrationError> = None;
        let mut skipped: BTreeSet<String> = BTreeSet::new();
        let mut halted = false;

        loop {
            if !halted {
                let ready: Vec<String> = pending
                    .iter()
                    .filter(|name| {
                        job.workflow()
                            .step(name)
                            .is_some_and(|s| s.upstream_steps().iter().all(|u| finished.contains(*u)))
                    })
                    .cloned()
                    .collect();
                for step in ready {
                    pending.remove(&step);
                    let Some(site) = plan.site_of(&step).cloned() else {
                        skip_dependents(&job, &step, &mut pending, &mut skipped);
                        failure.get_or_insert(OrchestrationError::RemoteExecutionFailure {
                            step: step.clone(),
                            site: Identifier::wildcard(),
                            message: "step is not in the plan".to_string(),
                        });
                        continue;
                    };
                    tracing::info!(job = %job_id(&entry), step = %step, site = %site, "dispatching step");
                    let this = Arc::clone(&self);
                    let job = job.clone();
                    let plan = plan.clone();
                    running.spawn(async move {
                        let result = this.run_step(&job, &plan, &step, &site).await;
                        (step, site, result)
                    });
                    entry.update(|s| s.state = JobState::Executing);
                }
            }

            let Some(joined) = running.join_next().await else {
                break;
            };
            match joined {
                Ok((step, _, Ok(result))) => {
                    finished.insert(step.clone());
                    entry.update(|s| {
                        if let Some(r) = s.result.as_mut() {
                            r.outputs.extend(result.outputs);
                        }
                    });
                    tracing::info!(job = %job_id(&entry), step = %step, "step completed");
                }
                Ok((step, site, Err(e))) => {
                    tracing::error!(job = %job_id(&entry), step = %step, site = %site, error = %e, "step failed");
                    skip_dependents(&job, &step, &mut pending, &mut skipped);
                    failure.get_or_insert(e);
                }
                Err(e) => {
                    tracing::error!(job = %job_id(&entry), error = %e, "step task panicked");
                    halted = true;
                    failure.get_or_insert(OrchestrationError::RemoteExecutionFailure {
                        step: "unknown".to_string(),
                        site: Identifier::wildcard(),
                        message: e.to_string(),
                    });
                }
            }
        }

        skipped.append(&mut pending);
        match failure {
            Some(e) => {
                if !skipped.is_empty() {
                    tracing::warn!(job = %job_id(&entry), skipped = ?skipped, "not dispatching steps after failure");
                }
                entry.update(|s| {
                    s.state = JobState::Failed;
                    s.error = Some(e.to_string());
                });
            }
            None => {
                let outputs = job.output_ids();
                entry.update(|s| {
                    if let Some(r) = s.result.as_mut() {
                        r.outputs.extend(outputs);
                        r.is_done = true;
                    }
                    s.state = JobState::Completed;
                });
            }
        }
    }

    /// Moves the inputs of `step` to `site` and asks it to run the step.
    async fn run_step(
        &self,
        job: &Job,
        plan: &Plan,
        step: &str,
        site: &Identifier,
    ) -> Result<JobResult, OrchestrationError> {
        let failure = |message: String| OrchestrationError::RemoteExecutionFailure {
            step: step.to_string(),
            site: site.clone(),
            message,
        };

        let target = self.client_for(site)?;
        for (asset, holder) in required_assets(job, plan, step) {
            let Some(holder) = holder else { continue };
            if &holder == site {
                continue;
            }
            let source = self.client_for(&holder)?;
            let fetched = source
                .fetch_asset(&asset, site)
                .await
                .map_err(|e| failure(format!("fetching {asset} from {holder}: {e}")))?;
            target
                .store_asset(fetched)
                .await
                .map_err(|e| failure(format!("storing {asset}: {e}")))?;
            tracing::debug!(asset = %asset, from = %holder, to = %site, "transferred asset");
        }

        let request =
            ExecutionRequest::for_steps(job.clone(), plan.clone(), BTreeSet::from([step.to_string()]));
        let result = target.execute(request).await.map_err(|e: SiteError| failure(e.to_string()))?;
        if !result.is_done {
            return Err(failure("site reported the step as unfinished".to_string()));
        }
        Ok(result)
    }
}

fn job_id(entry: &JobEntry) -> JobId {
    entry.status.lock().unwrap_or_else(|e| e.into_inner()).id
}

/// Moves every pending step that reads, even indirectly, from `failed` into
/// `skipped`. Independent steps stay pending.
fn skip_dependents(
    job: &Job,
    failed: &str,
    pending: &mut BTreeSet<String>,
    skipped: &mut BTreeSet<String>,
) {
    for step in job.workflow().downstream_steps(failed) {
        if pending.remove(&step) {
            skipped.insert(step);
        }
    }
}

/// Every asset `step` needs and the site holding it, if known: its inputs,
/// its compute asset and its output base assets.
fn required_assets(job: &Job, plan: &Plan, step: &str) -> BTreeMap<Identifier, Option<Identifier>> {
    let mut required = BTreeMap::new();
    let Some(workflow_step) = job.workflow().step(step) else {
        return required;
    };
    let input_assets = job.step_input_assets(step);
    for (input, source) in &workflow_step.inputs {
        let Some(asset) = input_assets.get(input) else {
            continue;
        };
        let holder = match source {
            SourceRef::WorkflowInput(_) => asset.location(),
            SourceRef::StepOutput { step, .. } => plan.site_of(step).cloned(),
        };
        required.insert(asset.clone(), holder);
    }
    required.insert(
        workflow_step.compute_asset.clone(),
        workflow_step.compute_asset.location(),
    );
    for base in workflow_step.outputs.values().flatten() {
        required.insert(base.clone(), base.location());
    }
    required
}
