//! Planning and executing jobs across sites.
//!
//! A job submitted to its home site is planned by the [`Planner`] against
//! the site's [`PolicyClient`] and the registry, then driven by the
//! [`Orchestrator`]: each step is dispatched to its site once its upstream
//! steps are done, with the inputs it needs transferred first. Receiving
//! sites run their steps through a [`SiteExecutor`], which re-checks the
//! plan against its own policy before anything runs.

pub mod assets;
mod error;
pub mod orchestrator;
pub mod planner;
pub mod policy;
pub mod site;

pub use assets::{AssetService, AssetStore, MemoryAssetStore};
pub use error::{AssetError, InfeasibleReason, OrchestrationError, PlanningError, SiteError};
pub use orchestrator::{JobId, JobState, JobStatus, Orchestrator};
pub use planner::{plan_job, Planner};
pub use policy::{
    FreshnessSettings, PolicyClient, PolicyView, RegistryAuthorities, RuleSourceConnector,
};
pub use site::{
    ExecutionBackend, LocalSiteClient, SiteClient, SiteConnector, SiteExecutor, StepInvocation,
};
