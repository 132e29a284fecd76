use std::collections::BTreeMap;
use std::sync::Arc;

use tessera_replication::ObjectValidator;
use tessera_types::NamespaceAuthority;

use crate::rules::SignedRule;
use crate::signing::{verify_rule, SignatureVerifier};

/// Finds who may sign rules for a namespace.
pub trait AuthorityLookup: Send + Sync {
    fn authority_for(&self, namespace: &str) -> Option<NamespaceAuthority>;
}

impl AuthorityLookup for BTreeMap<String, NamespaceAuthority> {
    fn authority_for(&self, namespace: &str) -> Option<NamespaceAuthority> {
        self.get(namespace).cloned()
    }
}

/// Checks rules received from a replica of another site's rule store.
///
/// A rule passes only if it belongs to the namespace the replica was
/// created for and is correctly signed by that namespace's owner, as
/// currently known to the authority lookup.
pub struct RuleValidator {
    namespace: String,
    authorities: Arc<dyn AuthorityLookup>,
    verifier: Arc<dyn SignatureVerifier>,
}

impl RuleValidator {
    pub fn new(
        namespace: impl Into<String>,
        authorities: Arc<dyn AuthorityLookup>,
        verifier: Arc<dyn SignatureVerifier>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            authorities,
            verifier,
        }
    }
}

impl ObjectValidator<SignedRule> for RuleValidator {
    fn validate(&self, signed: &SignedRule) -> Result<(), String> {
        let authority = self
            .authorities
            .authority_for(&self.namespace)
            .ok_or_else(|| format!("no known owner for namespace '{}'", self.namespace))?;
        verify_rule(signed, &authority, self.verifier.as_ref()).map_err(|e| e.to_string())
    }
}
