//! The executing side: what a site does with an execution request, and the
//! interfaces the orchestrator uses to talk to sites.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use tessera_policy::PermissionCalculator;
use tessera_types::{
    step_item, Asset, AssetPayload, ExecutionRequest, Identifier, Job, JobResult, SiteDescription,
};

use crate::assets::AssetService;
use crate::error::{AssetError, SiteError};
use crate::policy::PolicyView;

/// A channel to one site.
#[async_trait]
pub trait SiteClient: Send + Sync {
    /// Asks the site to run the steps of `request` assigned to it.
    async fn execute(&self, request: ExecutionRequest) -> Result<JobResult, SiteError>;

    /// Fetches an asset held by the site on behalf of `requester`.
    async fn fetch_asset(&self, id: &Identifier, requester: &Identifier)
        -> Result<Asset, SiteError>;

    /// Hands an asset to the site.
    async fn store_asset(&self, asset: Asset) -> Result<(), SiteError>;
}

/// Opens channels to sites.
pub trait SiteConnector: Send + Sync {
    fn connect(&self, site: &SiteDescription) -> Arc<dyn SiteClient>;
}

/// Everything an execution backend needs to run one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepInvocation {
    pub job: Job,
    pub step: String,
    pub compute: Asset,
    /// Input assets by input name.
    pub inputs: BTreeMap<String, Asset>,
    /// Base assets by output name, for outputs that have one.
    pub bases: BTreeMap<String, Asset>,
}

/// Runs compute assets. Container handling lives behind this interface.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Runs one step and returns the payload of every output by name.
    async fn run(&self, invocation: StepInvocation) -> Result<BTreeMap<String, AssetPayload>, String>;
}

/// Executes requests sent to this site.
///
/// Nothing runs unless the whole plan is legal under this site's own view
/// of policy; the orchestrator is not trusted.
pub struct SiteExecutor {
    site: Identifier,
    assets: AssetService,
    policy: Arc<dyn PolicyView>,
    backend: Arc<dyn ExecutionBackend>,
    output_checks: bool,
}

impl SiteExecutor {
    pub fn new(
        site: Identifier,
        assets: AssetService,
        policy: Arc<dyn PolicyView>,
        backend: Arc<dyn ExecutionBackend>,
    ) -> Self {
        Self {
            site,
            assets,
            policy,
            backend,
            output_checks: false,
        }
    }

    /// Refuses plans that put results where they may not be accessed or
    /// that return outputs the submitter may not use.
    pub fn with_output_checks(mut self, enabled: bool) -> Self {
        self.output_checks = enabled;
        self
    }

    pub fn site(&self) -> &Identifier {
        &self.site
    }

    pub fn assets(&self) -> &AssetService {
        &self.assets
    }

    pub async fn execute(&self, request: ExecutionRequest) -> Result<JobResult, SiteError> {
        let closure = self.policy.current_closure().await?;
        let calculator =
            PermissionCalculator::new(&closure).with_output_checks(self.output_checks);
        if let Err((step, site, denial)) = calculator.check_plan(&request.job, &request.plan) {
            tracing::warn!(
                site = %self.site,
                step = %step,
                assigned = %site,
                reason = %denial,
                "refusing illegal plan"
            );
            return Err(SiteError::Refused(format!(
                "step '{step}' may not run at {site}: {denial}"
            )));
        }

        let steps = request.steps_for(&self.site);
        if steps.is_empty() {
            return Err(SiteError::Refused(format!(
                "no steps of this request are assigned to {}",
                self.site
            )));
        }

        let mut outputs = BTreeMap::new();
        for step in &steps {
            outputs.extend(self.run_step(&request.job, step).await?);
        }

        Ok(JobResult {
            job: request.job,
            plan: request.plan,
            is_done: true,
            outputs,
        })
    }

    async fn run_step(
        &self,
        job: &Job,
        step_name: &str,
    ) -> Result<BTreeMap<String, Identifier>, SiteError> {
        let step = job
            .workflow()
            .step(step_name)
            .ok_or_else(|| SiteError::Refused(format!("unknown step '{step_name}'")))?;

        let local = |id: &Identifier| {
            self.assets
                .store()
                .get(id)
                .ok_or_else(|| SiteError::Asset(AssetError::NotFound(id.clone())))
        };

        let compute = local(&step.compute_asset)?;
        let mut inputs = BTreeMap::new();
        for (name, id) in job.step_input_assets(step_name) {
            inputs.insert(name, local(&id)?);
        }
        let mut bases = BTreeMap::new();
        for (output, base) in &step.outputs {
            if let Some(base) = base {
                bases.insert(output.clone(), local(base)?);
            }
        }

        tracing::info!(site = %self.site, step = step_name, "running step");
        let mut payloads = self
            .backend
            .run(StepInvocation {
                job: job.clone(),
                step: step_name.to_string(),
                compute,
                inputs,
                bases,
            })
            .await
            .map_err(SiteError::Failed)?;

        let mut produced = BTreeMap::new();
        for output in step.outputs.keys() {
            let payload = payloads.remove(output).ok_or_else(|| {
                SiteError::Failed(format!("step '{step_name}' did not produce '{output}'"))
            })?;
            let item = step_item(step_name, output);
            let asset = Asset::derived(job.clone(), &item, payload).map_err(AssetError::from)?;
            produced.insert(item, asset.id.clone());
            self.assets.put(asset)?;
        }
        tracing::info!(site = %self.site, step = step_name, outputs = produced.len(), "step finished");
        Ok(produced)
    }
}

/// A [`SiteClient`] that calls an executor in the same process.
pub struct LocalSiteClient {
    executor: Arc<SiteExecutor>,
}

impl LocalSiteClient {
    pub fn new(executor: Arc<SiteExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl SiteClient for LocalSiteClient {
    async fn execute(&self, request: ExecutionRequest) -> Result<JobResult, SiteError> {
        self.executor.execute(request).await
    }

    async fn fetch_asset(
        &self,
        id: &Identifier,
        requester: &Identifier,
    ) -> Result<Asset, SiteError> {
        Ok(self.executor.assets().retrieve_for_site(id, requester).await?)
    }

    async fn store_asset(&self, asset: Asset) -> Result<(), SiteError> {
        Ok(self.executor.assets().put(asset)?)
    }
}
