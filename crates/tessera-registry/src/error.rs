use tessera_replication::ReplicationError;
use tessera_types::{Identifier, TypeError};
use thiserror::Error;

/// Errors raised by the registry and its clients.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("{0} is already registered")]
    AlreadyRegistered(Identifier),

    #[error("{0} is not registered")]
    NotFound(Identifier),

    /// A site names an owner or admin party that is not registered.
    #[error("site {site} refers to unregistered party {party}")]
    MissingParty { site: Identifier, party: Identifier },

    /// A party cannot be removed while a site refers to it.
    #[error("party {party} is still referenced by site {site}")]
    InUse { party: Identifier, site: Identifier },

    #[error("namespace '{namespace}' is already owned by {owner}")]
    NamespaceTaken { namespace: String, owner: Identifier },

    #[error("invalid registration: {0}")]
    Invalid(#[from] TypeError),

    #[error(transparent)]
    Replication(#[from] ReplicationError),
}
