use thiserror::Error;

/// Errors raised while constructing or validating core value types.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TypeError {
    /// An identifier string did not match any known form.
    #[error("invalid identifier '{text}': {reason}")]
    InvalidIdentifier { text: String, reason: String },

    /// A workflow item name or reference was malformed.
    #[error("invalid workflow item '{0}'")]
    InvalidItem(String),

    /// A workflow violated a structural invariant.
    #[error("invalid workflow: {0}")]
    InvalidWorkflow(String),

    /// A job did not bind its workflow's inputs correctly.
    #[error("invalid job: {0}")]
    InvalidJob(String),

    /// An asset's kind and provenance disagree.
    #[error("invalid asset {id}: {reason}")]
    InvalidAsset { id: String, reason: String },

    /// A party description is malformed.
    #[error("invalid party {id}: {reason}")]
    InvalidParty { id: String, reason: String },

    /// A site description is internally inconsistent.
    #[error("invalid site {id}: {reason}")]
    InvalidSite { id: String, reason: String },
}
