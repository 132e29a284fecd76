//! Policy rules and their signed form.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use tessera_replication::Replicable;
use tessera_types::workflow::is_valid_item_name;
use tessera_types::{Identifier, IdentifierKind};

use crate::error::PolicyError;

/// A policy fact.
///
/// Membership rules group assets and parties into collections; permission
/// rules grant sites access to, and parties use of, assets or collections;
/// `ResultOfIn` places workflow results into collections based on what they
/// were computed from.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Rule {
    InAssetCollection {
        asset: Identifier,
        collection: Identifier,
    },
    InPartyCollection {
        party: Identifier,
        collection: Identifier,
    },
    MayAccess {
        site: Identifier,
        asset: Identifier,
    },
    MayUse {
        party: Identifier,
        asset: Identifier,
        /// Opaque to the engine; handed back with use decisions.
        conditions: String,
    },
    /// Results of running `compute_asset` on `data_asset` that come out of
    /// `output` are members of `collection`.
    ResultOfIn {
        data_asset: Identifier,
        compute_asset: Identifier,
        /// An output name, or `*` for every output.
        output: String,
        collection: Identifier,
    },
}

impl Rule {
    /// The name of this rule's variant.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InAssetCollection { .. } => "InAssetCollection",
            Self::InPartyCollection { .. } => "InPartyCollection",
            Self::MayAccess { .. } => "MayAccess",
            Self::MayUse { .. } => "MayUse",
            Self::ResultOfIn { .. } => "ResultOfIn",
        }
    }

    /// The canonical byte string that issuers sign: `Kind|field|field|...`.
    pub fn signing_representation(&self) -> String {
        match self {
            Self::InAssetCollection { asset, collection } => {
                format!("InAssetCollection|{asset}|{collection}")
            }
            Self::InPartyCollection { party, collection } => {
                format!("InPartyCollection|{party}|{collection}")
            }
            Self::MayAccess { site, asset } => format!("MayAccess|{site}|{asset}"),
            Self::MayUse {
                party,
                asset,
                conditions,
            } => format!("MayUse|{party}|{asset}|{conditions}"),
            Self::ResultOfIn {
                data_asset,
                compute_asset,
                output,
                collection,
            } => format!("ResultOfIn|{data_asset}|{compute_asset}|{output}|{collection}"),
        }
    }

    /// The namespace whose owner must sign this rule.
    ///
    /// Memberships belong to whoever controls what is being shared: an
    /// asset's owner decides which asset collections it joins, a party
    /// collection's owner decides who is in it. Grants and result
    /// propagation belong to the owner of the asset they concern.
    pub fn signing_namespace(&self) -> Option<&str> {
        match self {
            Self::InAssetCollection { asset, .. } => asset.namespace(),
            Self::InPartyCollection { collection, .. } => collection.namespace(),
            Self::MayAccess { asset, .. } | Self::MayUse { asset, .. } => asset.namespace(),
            Self::ResultOfIn { data_asset, .. } => data_asset.namespace(),
        }
    }

    /// Checks that every field has an acceptable identifier kind.
    pub fn validate(&self) -> Result<(), PolicyError> {
        use IdentifierKind as K;

        let expect = |field: &str, id: &Identifier, allowed: &[IdentifierKind]| {
            if allowed.contains(&id.kind()) {
                Ok(())
            } else {
                Err(PolicyError::Malformed(format!(
                    "{}: {field} '{id}' has kind {:?}",
                    self.kind(),
                    id.kind()
                )))
            }
        };

        match self {
            Self::InAssetCollection { asset, collection } => {
                expect("asset", asset, &[K::Asset, K::AssetCollection])?;
                expect("collection", collection, &[K::AssetCollection])?;
            }
            Self::InPartyCollection { party, collection } => {
                expect("party", party, &[K::Party, K::PartyCollection])?;
                expect("collection", collection, &[K::PartyCollection])?;
            }
            Self::MayAccess { site, asset } => {
                expect("site", site, &[K::Site, K::Wildcard])?;
                expect("asset", asset, &[K::Asset, K::AssetCollection])?;
            }
            Self::MayUse { party, asset, .. } => {
                expect("party", party, &[K::Party, K::PartyCollection, K::Wildcard])?;
                expect("asset", asset, &[K::Asset, K::AssetCollection])?;
            }
            Self::ResultOfIn {
                data_asset,
                compute_asset,
                output,
                collection,
            } => {
                expect("data_asset", data_asset, &[K::Asset, K::AssetCollection])?;
                expect("compute_asset", compute_asset, &[K::Asset, K::AssetCollection, K::Wildcard])?;
                expect("collection", collection, &[K::AssetCollection])?;
                if output != "*" && !is_valid_item_name(output) {
                    return Err(PolicyError::Malformed(format!(
                        "ResultOfIn: invalid output name '{output}'"
                    )));
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.signing_representation())
    }
}

/// A rule together with its issuer and the issuer's signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SignedRule {
    pub rule: Rule,
    pub issuer: Identifier,
    /// Hex-encoded Ed25519 signature over the rule's signing representation.
    pub signature: String,
}

impl SignedRule {
    /// Content id of the rule: the SHA-256 of its signing representation.
    ///
    /// Two signatures over the same fact share an id, so adding a fact twice
    /// is recognised regardless of who signed it or when.
    pub fn id(&self) -> String {
        rule_id(&self.rule)
    }
}

/// Content id of a rule.
pub fn rule_id(rule: &Rule) -> String {
    hex::encode(Sha256::digest(rule.signing_representation().as_bytes()))
}

impl Replicable for SignedRule {
    fn replica_key(&self) -> String {
        self.id()
    }
}
