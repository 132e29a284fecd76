//! Registry objects: parties and sites.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::TypeError;
use crate::identifier::{Identifier, IdentifierKind};

/// A registered party.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartyDescription {
    pub id: Identifier,
    /// The namespace this party owns and signs rules for.
    pub namespace: String,
    /// Hex-encoded Ed25519 verifying key.
    pub public_key: String,
}

impl PartyDescription {
    /// Checks the id kind, the namespace and the shape of the key.
    pub fn validate(&self) -> Result<(), TypeError> {
        let invalid = |reason: &str| TypeError::InvalidParty {
            id: self.id.to_string(),
            reason: reason.to_string(),
        };
        if self.id.kind() != IdentifierKind::Party {
            return Err(invalid("id is not a party identifier"));
        }
        if self.id.namespace() != Some(self.namespace.as_str()) {
            return Err(invalid("party id must live in the namespace it owns"));
        }
        let key_ok = self.public_key.len() == 64
            && self.public_key.chars().all(|c| c.is_ascii_hexdigit());
        if !key_ok {
            return Err(invalid("public key must be 32 hex-encoded bytes"));
        }
        Ok(())
    }
}

/// What a site is able to do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SiteCapabilities {
    pub can_run_steps: bool,
    pub can_store_assets: bool,
    pub can_serve_policy: bool,
}

/// A registered site.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SiteDescription {
    pub id: Identifier,
    pub owner_id: Identifier,
    pub admin_id: Identifier,
    /// Base URL other sites use to reach this one.
    pub endpoint: String,
    /// Current TLS certificate in PEM form. Opaque to the core.
    #[serde(default)]
    pub certificate: Option<String>,
    /// Namespace whose rules this site serves, when it serves policy.
    #[serde(default)]
    pub namespace: Option<String>,
    pub capabilities: SiteCapabilities,
}

impl SiteDescription {
    /// Checks internal consistency.
    ///
    /// A site that runs steps must be able to store assets, and a site that
    /// serves policy must name the namespace it serves.
    pub fn validate(&self) -> Result<(), TypeError> {
        let invalid = |reason: &str| TypeError::InvalidSite {
            id: self.id.to_string(),
            reason: reason.to_string(),
        };
        if self.id.kind() != IdentifierKind::Site {
            return Err(invalid("id is not a site identifier"));
        }
        if self.owner_id.kind() != IdentifierKind::Party
            || self.admin_id.kind() != IdentifierKind::Party
        {
            return Err(invalid("owner and admin must be parties"));
        }
        if self.capabilities.can_run_steps && !self.capabilities.can_store_assets {
            return Err(invalid("a site with a runner must have a store"));
        }
        if self.capabilities.can_serve_policy && self.namespace.is_none() {
            return Err(invalid("a policy-serving site must name its namespace"));
        }
        Ok(())
    }
}

/// Who may sign and retract rules in a namespace.
///
/// Derived from the registry: the owner is the party owning the namespace,
/// and the administrators are the admin parties of that owner's sites.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceAuthority {
    pub namespace: String,
    pub owner: Identifier,
    /// Hex-encoded Ed25519 verifying key of the owner.
    pub owner_key: String,
    #[serde(default)]
    pub administrators: BTreeSet<Identifier>,
}

impl NamespaceAuthority {
    /// True if `party` may act on rules of this namespace.
    pub fn has_authority(&self, party: &Identifier) -> bool {
        party == &self.owner || self.administrators.contains(party)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site(caps: SiteCapabilities, namespace: Option<&str>) -> SiteDescription {
        SiteDescription {
            id: Identifier::parse("site:ns:s1").unwrap(),
            owner_id: Identifier::parse("party:ns:owner").unwrap(),
            admin_id: Identifier::parse("party:ns:admin").unwrap(),
            endpoint: "http://s1".into(),
            certificate: None,
            namespace: namespace.map(str::to_string),
            capabilities: caps,
        }
    }

    #[test]
    fn party_lives_in_its_namespace() {
        let party = PartyDescription {
            id: Identifier::parse("party:ns:owner").unwrap(),
            namespace: "ns".into(),
            public_key: "ab".repeat(32),
        };
        assert!(party.validate().is_ok());

        let elsewhere = PartyDescription {
            namespace: "other".into(),
            ..party.clone()
        };
        assert!(elsewhere.validate().is_err());

        let short_key = PartyDescription {
            public_key: "abcd".into(),
            ..party
        };
        assert!(short_key.validate().is_err());
    }

    #[test]
    fn runner_requires_store() {
        let caps = SiteCapabilities {
            can_run_steps: true,
            ..Default::default()
        };
        assert!(site(caps, None).validate().is_err());

        let caps = SiteCapabilities {
            can_run_steps: true,
            can_store_assets: true,
            ..Default::default()
        };
        assert!(site(caps, None).validate().is_ok());
    }

    #[test]
    fn policy_server_names_namespace() {
        let caps = SiteCapabilities {
            can_serve_policy: true,
            ..Default::default()
        };
        assert!(site(caps, None).validate().is_err());
        assert!(site(caps, Some("ns")).validate().is_ok());
    }
}
