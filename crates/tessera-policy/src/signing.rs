//! Rule signatures and issuer authority.

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};

use tessera_types::{Identifier, NamespaceAuthority};

use crate::error::PolicyError;
use crate::rules::{Rule, SignedRule};

/// Verifies signatures. Key material is supplied by the caller.
pub trait SignatureVerifier: Send + Sync {
    /// True if `signature_hex` is a valid signature of `message` by the key
    /// `public_key_hex`.
    fn verify(&self, public_key_hex: &str, message: &[u8], signature_hex: &str) -> bool;
}

/// Ed25519 signature verification.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ed25519Verifier;

impl SignatureVerifier for Ed25519Verifier {
    fn verify(&self, public_key_hex: &str, message: &[u8], signature_hex: &str) -> bool {
        let Some(key) = decode_array::<32>(public_key_hex) else {
            return false;
        };
        let Ok(key) = VerifyingKey::from_bytes(&key) else {
            return false;
        };
        let Some(signature) = decode_array::<64>(signature_hex) else {
            return false;
        };
        let signature = Signature::from_bytes(&signature);
        key.verify_strict(message, &signature).is_ok()
    }
}

fn decode_array<const N: usize>(text: &str) -> Option<[u8; N]> {
    hex::decode(text).ok()?.try_into().ok()
}

/// Signs `rule` on behalf of `issuer`.
pub fn sign_rule(rule: Rule, issuer: Identifier, key: &SigningKey) -> SignedRule {
    let signature = key.sign(rule.signing_representation().as_bytes());
    SignedRule {
        rule,
        issuer,
        signature: hex::encode(signature.to_bytes()),
    }
}

/// Hex encoding of the verifying key matching `key`.
pub fn public_key_hex(key: &SigningKey) -> String {
    hex::encode(key.verifying_key().to_bytes())
}

/// Checks that `signed` is well formed, belongs to `authority`'s namespace,
/// was issued by the namespace owner, and carries a valid signature.
pub fn verify_rule(
    signed: &SignedRule,
    authority: &NamespaceAuthority,
    verifier: &dyn SignatureVerifier,
) -> Result<(), PolicyError> {
    signed.rule.validate()?;

    let unauthorized = |reason: String| PolicyError::UnauthorizedIssuer {
        rule: signed.id(),
        issuer: signed.issuer.clone(),
        reason,
    };

    match signed.rule.signing_namespace() {
        Some(ns) if ns == authority.namespace => {}
        Some(ns) => {
            return Err(unauthorized(format!(
                "rule belongs to namespace '{ns}', not '{}'",
                authority.namespace
            )))
        }
        None => return Err(unauthorized("rule has no signing namespace".to_string())),
    }

    if signed.issuer != authority.owner {
        return Err(unauthorized(format!(
            "namespace '{}' is owned by {}",
            authority.namespace, authority.owner
        )));
    }

    let message = signed.rule.signing_representation();
    if !verifier.verify(&authority.owner_key, message.as_bytes(), &signed.signature) {
        return Err(PolicyError::InvalidSignature { rule: signed.id() });
    }
    Ok(())
}

/// The message a party signs to retract the rule with id `rule_id`.
pub fn retraction_message(rule_id: &str) -> String {
    format!("Retract|{rule_id}")
}

/// Signs a request to retract the rule with id `rule_id`.
pub fn sign_retraction(rule_id: &str, key: &SigningKey) -> String {
    hex::encode(key.sign(retraction_message(rule_id).as_bytes()).to_bytes())
}
