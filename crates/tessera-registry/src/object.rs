use serde::{Deserialize, Serialize};

use tessera_replication::Replicable;
use tessera_types::{Identifier, PartyDescription, SiteDescription};

/// Anything held in the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum RegisteredObject {
    Party(PartyDescription),
    Site(SiteDescription),
}

impl RegisteredObject {
    pub fn id(&self) -> &Identifier {
        match self {
            Self::Party(party) => &party.id,
            Self::Site(site) => &site.id,
        }
    }

    pub fn as_party(&self) -> Option<&PartyDescription> {
        match self {
            Self::Party(party) => Some(party),
            Self::Site(_) => None,
        }
    }

    pub fn as_site(&self) -> Option<&SiteDescription> {
        match self {
            Self::Site(site) => Some(site),
            Self::Party(_) => None,
        }
    }
}

impl Replicable for RegisteredObject {
    fn replica_key(&self) -> String {
        self.id().to_string()
    }
}
