//! Typed, colon-segmented identifiers.
//!
//! Every party, site, asset, collection and result in the exchange is named
//! by an [`Identifier`]. The first segment names the kind and fixes the
//! number of segments:
//!
//! | Kind | Form |
//! |------|------|
//! | party | `party:<namespace>:<name>` |
//! | party collection | `party_collection:<namespace>:<name>` |
//! | site | `site:<namespace>:<name>` |
//! | asset | `asset:<namespace>:<name>:<site_namespace>:<site_name>` |
//! | asset collection | `asset_collection:<namespace>:<name>` |
//! | result | `result:<id_hash>` |
//!
//! The single character `*` is also accepted; rules use it as a wildcard.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::TypeError;

/// The kind of thing an [`Identifier`] names.
///
/// Workflow items have no kind here. They are names scoped to one
/// workflow (`step`, `step.input`, `step.@output`, `step.output`), built
/// with [`step_item`](crate::step_item) and [`base_item`](crate::base_item)
/// or parsed as a [`SourceRef`](crate::SourceRef), and never appear in rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum IdentifierKind {
    /// A real-world organisation.
    Party,
    /// A named group of parties.
    PartyCollection,
    /// A running installation owned by a party.
    Site,
    /// A concrete data set or piece of software, stored at a site.
    Asset,
    /// A named group of assets.
    AssetCollection,
    /// A content-addressed workflow result.
    Result,
    /// Matches anything of the expected kind.
    Wildcard,
}

impl IdentifierKind {
    /// Returns the prefix used in the textual form.
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Party => "party",
            Self::PartyCollection => "party_collection",
            Self::Site => "site",
            Self::Asset => "asset",
            Self::AssetCollection => "asset_collection",
            Self::Result => "result",
            Self::Wildcard => "*",
        }
    }

    fn segment_count(self) -> usize {
        match self {
            Self::Party | Self::PartyCollection | Self::Site | Self::AssetCollection => 3,
            Self::Asset => 5,
            Self::Result => 2,
            Self::Wildcard => 1,
        }
    }

    fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "party" => Some(Self::Party),
            "party_collection" => Some(Self::PartyCollection),
            "site" => Some(Self::Site),
            "asset" => Some(Self::Asset),
            "asset_collection" => Some(Self::AssetCollection),
            "result" => Some(Self::Result),
            _ => None,
        }
    }
}

/// An immutable, validated identifier.
///
/// Equality, ordering and hashing are those of the underlying string, so
/// identifiers can be used directly as map keys and sort deterministically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identifier {
    text: String,
    kind: IdentifierKind,
}

impl Identifier {
    /// Parses and validates an identifier.
    ///
    /// # Errors
    ///
    /// Returns [`TypeError::InvalidIdentifier`] if the kind is unknown, the
    /// number of segments is wrong, or a segment is empty or contains a
    /// character outside `[A-Za-z0-9_.-]`.
    pub fn parse(text: &str) -> Result<Self, TypeError> {
        if text == "*" {
            return Ok(Self::wildcard());
        }

        let invalid = |reason: &str| TypeError::InvalidIdentifier {
            text: text.to_string(),
            reason: reason.to_string(),
        };

        let segments: Vec<&str> = text.split(':').collect();
        let kind = IdentifierKind::from_prefix(segments[0])
            .ok_or_else(|| invalid("unknown identifier kind"))?;

        if segments.len() != kind.segment_count() {
            return Err(invalid("wrong number of segments"));
        }

        for segment in &segments[1..] {
            if !is_valid_segment(segment) {
                return Err(invalid("invalid segment"));
            }
        }

        Ok(Self {
            text: text.to_string(),
            kind,
        })
    }

    /// The wildcard identifier `*`.
    pub fn wildcard() -> Self {
        Self {
            text: "*".to_string(),
            kind: IdentifierKind::Wildcard,
        }
    }

    /// Builds the identifier of a workflow result from its id hash.
    ///
    /// # Errors
    ///
    /// Returns [`TypeError::InvalidIdentifier`] if the hash is not a valid segment.
    pub fn from_id_hash(id_hash: &str) -> Result<Self, TypeError> {
        Self::parse(&format!("result:{id_hash}"))
    }

    /// Returns the kind of this identifier.
    pub fn kind(&self) -> IdentifierKind {
        self.kind
    }

    /// Returns true if this is the wildcard `*`.
    pub fn is_wildcard(&self) -> bool {
        self.kind == IdentifierKind::Wildcard
    }

    /// Returns the textual form.
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Returns all segments, including the kind prefix.
    pub fn segments(&self) -> Vec<&str> {
        self.text.split(':').collect()
    }

    /// Returns the namespace segment, if this kind has one.
    ///
    /// Results and the wildcard have no namespace.
    pub fn namespace(&self) -> Option<&str> {
        match self.kind {
            IdentifierKind::Result | IdentifierKind::Wildcard => None,
            _ => self.text.split(':').nth(1),
        }
    }

    /// Returns the name segment, if this kind has one.
    pub fn name(&self) -> Option<&str> {
        match self.kind {
            IdentifierKind::Result | IdentifierKind::Wildcard => None,
            _ => self.text.split(':').nth(2),
        }
    }

    /// Returns the site holding a concrete asset.
    ///
    /// Only `asset:` identifiers carry a location; everything else returns `None`.
    pub fn location(&self) -> Option<Identifier> {
        if self.kind != IdentifierKind::Asset {
            return None;
        }
        let segments = self.segments();
        Some(Self {
            text: format!("site:{}:{}", segments[3], segments[4]),
            kind: IdentifierKind::Site,
        })
    }

    /// Returns true if `self` matches `other`, treating `*` as matching anything.
    pub fn matches(&self, other: &Identifier) -> bool {
        self.is_wildcard() || self == other
    }
}

fn is_valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-')
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl FromStr for Identifier {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Identifier {
    type Error = TypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl TryFrom<&str> for Identifier {
    type Error = TypeError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<Identifier> for String {
    fn from(id: Identifier) -> Self {
        id.text
    }
}

impl AsRef<str> for Identifier {
    fn as_ref(&self) -> &str {
        &self.text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_kind() {
        let cases = [
            ("party:ns1:alice", IdentifierKind::Party),
            ("party_collection:ns1:staff", IdentifierKind::PartyCollection),
            ("site:ns1:site1", IdentifierKind::Site),
            ("asset:ns1:data.csv:ns1:site1", IdentifierKind::Asset),
            ("asset_collection:ns1:public", IdentifierKind::AssetCollection),
            ("result:0abc", IdentifierKind::Result),
            ("*", IdentifierKind::Wildcard),
        ];
        for (text, kind) in cases {
            let id = Identifier::parse(text).expect("should parse");
            assert_eq!(id.kind(), kind, "{text}");
            assert_eq!(id.to_string(), text);
        }
    }

    #[test]
    fn rejects_malformed_identifiers() {
        for text in [
            "",
            "widget:ns:x",
            "party:ns",
            "party:ns:a:b",
            "asset:ns:a:site",
            "party:ns:bad name",
            "party::alice",
            "result:",
        ] {
            assert!(Identifier::parse(text).is_err(), "{text} should be rejected");
        }
    }

    #[test]
    fn workflow_items_are_not_identifiers() {
        let items = [
            "analyse".to_string(),
            crate::step_item("analyse", "data"),
            crate::base_item("analyse", "out"),
        ];
        for item in &items {
            assert!(Identifier::parse(item).is_err(), "{item}");
        }
        assert!(crate::SourceRef::parse(&items[1]).is_ok());
    }

    #[test]
    fn namespace_name_and_location() {
        let asset = Identifier::parse("asset:ns1:x:ns2:store").unwrap();
        assert_eq!(asset.namespace(), Some("ns1"));
        assert_eq!(asset.name(), Some("x"));
        assert_eq!(
            asset.location(),
            Some(Identifier::parse("site:ns2:store").unwrap())
        );

        let result = Identifier::from_id_hash("ff00").unwrap();
        assert_eq!(result.namespace(), None);
        assert_eq!(result.location(), None);
    }

    #[test]
    fn equality_is_structural() {
        let a = Identifier::parse("site:ns:a").unwrap();
        let b: Identifier = "site:ns:a".parse().unwrap();
        assert_eq!(a, b);
        assert!(Identifier::wildcard().matches(&a));
        assert!(!b.matches(&Identifier::parse("site:ns:b").unwrap()));
    }

    #[test]
    fn serde_validates_on_the_way_in() {
        let id = Identifier::parse("party:ns:bob").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"party:ns:bob\"");
        let back: Identifier = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
        assert_eq!(back.kind(), IdentifierKind::Party);

        assert!(serde_json::from_str::<Identifier>("\"party:ns\"").is_err());
    }
}
