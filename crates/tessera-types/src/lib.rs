//! Shared value types for the Tessera data-exchange platform.
//!
//! This crate holds the pure data model every other crate builds on:
//! identifiers, workflows, jobs and plans, assets, and the party and site
//! descriptions the registry holds. Nothing here performs I/O; the types
//! validate themselves on construction and on deserialization, so other
//! crates can rely on their invariants.

pub mod asset;
pub mod error;
pub mod identifier;
pub mod job;
pub mod registry;
pub mod workflow;

pub use asset::{Asset, AssetKind, AssetPayload, Provenance};
pub use error::TypeError;
pub use identifier::{Identifier, IdentifierKind};
pub use job::{ExecutionRequest, Job, JobResult, Plan};
pub use registry::{NamespaceAuthority, PartyDescription, SiteCapabilities, SiteDescription};
pub use workflow::{base_item, step_item, SourceRef, Workflow, WorkflowStep};
