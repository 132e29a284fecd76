use tessera_replication::ReplicationError;
use tessera_types::Identifier;
use thiserror::Error;

/// Errors raised by rule stores and policy evaluation.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// The rule's signature does not verify against its issuer's key.
    #[error("invalid signature on rule {rule}")]
    InvalidSignature { rule: String },

    /// The issuer has no authority to sign this rule in this store.
    #[error("issuer {issuer} may not sign rule {rule}: {reason}")]
    UnauthorizedIssuer {
        rule: String,
        issuer: Identifier,
        reason: String,
    },

    /// No rule with this id is present.
    #[error("rule {0} not found")]
    NotFound(String),

    /// The acting party may not retract this rule.
    #[error("party {party} may not retract rule {rule}")]
    Unauthorized { rule: String, party: Identifier },

    /// The rule's fields have the wrong identifier kinds.
    #[error("malformed rule: {0}")]
    Malformed(String),

    /// Rules could not be read from a replica.
    #[error(transparent)]
    Replication(#[from] ReplicationError),
}
