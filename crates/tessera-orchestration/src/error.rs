use std::collections::BTreeMap;
use thiserror::Error;

use tessera_policy::{Denial, PolicyError};
use tessera_registry::RegistryError;
use tessera_types::{Identifier, TypeError};

/// Why a step could not be placed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InfeasibleReason {
    #[error("no registered site can run steps")]
    NoRunnerSites,

    /// Every runner fails the same check.
    #[error("every runner is blocked: {0}")]
    Blocked(Denial),

    /// Runners fail different checks.
    #[error("no runner satisfies every check ({})", describe(.0))]
    NoSiteSatisfiesAll(BTreeMap<Identifier, Denial>),
}

fn describe(denials: &BTreeMap<Identifier, Denial>) -> String {
    denials
        .iter()
        .map(|(site, denial)| format!("{site}: {denial}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors raised while planning a job.
#[derive(Debug, Error)]
pub enum PlanningError {
    #[error("step '{step}' cannot be placed: {reason}")]
    Infeasible {
        step: String,
        reason: InfeasibleReason,
    },

    #[error("policy unavailable: {0}")]
    Policy(#[from] PolicyError),

    #[error("registry unavailable: {0}")]
    Registry(#[from] RegistryError),
}

/// Errors raised by asset stores.
#[derive(Debug, Error)]
pub enum AssetError {
    #[error("asset {0} not found")]
    NotFound(Identifier),

    #[error("{requester} may not access asset {asset}")]
    AccessDenied {
        asset: Identifier,
        requester: Identifier,
    },

    #[error("invalid asset: {0}")]
    Invalid(#[from] TypeError),

    #[error(transparent)]
    Policy(#[from] PolicyError),
}

/// Errors raised by a site while executing, or by the channel to it.
#[derive(Debug, Error)]
pub enum SiteError {
    #[error("site unreachable: {0}")]
    Unreachable(String),

    /// The site checked the request against its own policy and refused it.
    #[error("request refused: {0}")]
    Refused(String),

    #[error("execution failed: {0}")]
    Failed(String),

    #[error(transparent)]
    Asset(#[from] AssetError),

    #[error(transparent)]
    Policy(#[from] PolicyError),
}

/// Errors surfaced by the orchestrator.
#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error(transparent)]
    Planning(#[from] PlanningError),

    #[error("step '{step}' failed at site {site}: {message}")]
    RemoteExecutionFailure {
        step: String,
        site: Identifier,
        message: String,
    },

    #[error("unknown job {0}")]
    UnknownJob(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}
