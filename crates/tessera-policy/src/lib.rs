//! Signed policy rules and the inference engine that evaluates them.
//!
//! Every namespace owner keeps a [`RuleStore`] of rules they signed. Sites
//! replicate the stores of other namespaces and evaluate the union with a
//! [`PolicyEvaluator`]. Evaluation computes a [`Closure`] over the rules
//! and provenance facts, which answers access, use and membership
//! questions; [`PermissionCalculator`] uses it to decide where workflow
//! steps may run.

pub mod calculator;
pub mod closure;
mod error;
pub mod evaluator;
pub mod rules;
pub mod signing;
mod store;
mod validator;

pub use calculator::{Denial, PermissionCalculator};
pub use closure::{Closure, Permissions, UseDecision};
pub use error::PolicyError;
pub use evaluator::{PolicyEvaluator, PolicySource, ReplicatedRules};
pub use rules::{rule_id, Rule, SignedRule};
pub use signing::{
    public_key_hex, retraction_message, sign_retraction, sign_rule, verify_rule, Ed25519Verifier,
    SignatureVerifier,
};
pub use store::RuleStore;
pub use validator::{AuthorityLookup, RuleValidator};
