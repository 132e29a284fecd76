//! Data and compute assets.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::TypeError;
use crate::identifier::{Identifier, IdentifierKind};
use crate::job::Job;

/// Whether an asset is data or software.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    Data,
    Compute,
}

/// The content of an asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "value")]
pub enum AssetPayload {
    /// Small values carried inline.
    Inline(serde_json::Value),
    /// A reference to an executable or data image held elsewhere.
    Image(String),
}

/// Where an asset came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Provenance {
    /// A data asset uploaded directly.
    Uploaded,
    /// A data asset produced by `item` of `job`.
    Derived { job: Box<Job>, item: String },
    /// A compute asset, with the base image used for each declared output.
    Compute {
        output_base_images: BTreeMap<String, Option<String>>,
    },
}

/// A data set or piece of software.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    pub id: Identifier,
    pub kind: AssetKind,
    pub payload: AssetPayload,
    pub provenance: Provenance,
}

impl Asset {
    /// An uploaded data asset.
    pub fn data(id: Identifier, payload: AssetPayload) -> Result<Self, TypeError> {
        Self::checked(id, AssetKind::Data, payload, Provenance::Uploaded)
    }

    /// A compute asset.
    pub fn compute(
        id: Identifier,
        payload: AssetPayload,
        output_base_images: BTreeMap<String, Option<String>>,
    ) -> Result<Self, TypeError> {
        Self::checked(
            id,
            AssetKind::Compute,
            payload,
            Provenance::Compute { output_base_images },
        )
    }

    /// A data asset produced by a workflow item. Its id is the item's
    /// content-addressed `result:` id.
    pub fn derived(job: Job, item: &str, payload: AssetPayload) -> Result<Self, TypeError> {
        let hash = job.id_hashes().get(item).cloned().ok_or_else(|| {
            TypeError::InvalidItem(item.to_string())
        })?;
        let id = Identifier::from_id_hash(&hash)?;
        Self::checked(
            id,
            AssetKind::Data,
            payload,
            Provenance::Derived {
                job: Box::new(job),
                item: item.to_string(),
            },
        )
    }

    fn checked(
        id: Identifier,
        kind: AssetKind,
        payload: AssetPayload,
        provenance: Provenance,
    ) -> Result<Self, TypeError> {
        let asset = Self {
            id,
            kind,
            payload,
            provenance,
        };
        asset.validate()?;
        Ok(asset)
    }

    /// Checks that id, kind and provenance agree.
    pub fn validate(&self) -> Result<(), TypeError> {
        let invalid = |reason: &str| TypeError::InvalidAsset {
            id: self.id.to_string(),
            reason: reason.to_string(),
        };
        match (self.kind, &self.provenance) {
            (AssetKind::Data, Provenance::Uploaded) => {
                if self.id.kind() != IdentifierKind::Asset {
                    return Err(invalid("uploaded data must have an asset: id"));
                }
            }
            (AssetKind::Data, Provenance::Derived { job, item }) => {
                if self.id.kind() != IdentifierKind::Result {
                    return Err(invalid("derived data must have a result: id"));
                }
                let expected = job.id_hashes().get(item).cloned();
                if expected.as_deref() != self.id.as_str().strip_prefix("result:") {
                    return Err(invalid("id does not match provenance"));
                }
            }
            (AssetKind::Compute, Provenance::Compute { .. }) => {
                if self.id.kind() != IdentifierKind::Asset {
                    return Err(invalid("compute assets must have an asset: id"));
                }
            }
            _ => return Err(invalid("kind and provenance disagree")),
        }
        Ok(())
    }

    /// The job and item that produced this asset, if it is derived.
    pub fn lineage(&self) -> Option<(&Job, &str)> {
        match &self.provenance {
            Provenance::Derived { job, item } => Some((job.as_ref(), item.as_str())),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{Workflow, WorkflowStep};
    use serde_json::json;

    fn id(s: &str) -> Identifier {
        Identifier::parse(s).unwrap()
    }

    #[test]
    fn derived_assets_are_content_addressed() {
        let step =
            WorkflowStep::new("s", &[("x", "a")], &[("y", None)], "asset:ns:c:ns:s1").unwrap();
        let wf = Workflow::new(&["a"], &[], vec![step]).unwrap();
        let job = Job::new(
            id("party:ns:p"),
            wf,
            BTreeMap::from([("a".to_string(), id("asset:ns:d:ns:s1"))]),
        )
        .unwrap();

        let asset = Asset::derived(job.clone(), "s.y", AssetPayload::Inline(json!(42))).unwrap();
        assert_eq!(asset.id, Identifier::from_id_hash(&job.id_hashes()["s.y"]).unwrap());
        assert_eq!(asset.lineage().map(|(_, item)| item), Some("s.y"));

        assert!(Asset::derived(job, "s.nope", AssetPayload::Inline(json!(1))).is_err());
    }

    #[test]
    fn kind_and_provenance_must_agree() {
        let mut asset =
            Asset::data(id("asset:ns:d:ns:s1"), AssetPayload::Inline(json!("x"))).unwrap();
        asset.kind = AssetKind::Compute;
        assert!(asset.validate().is_err());

        assert!(Asset::data(id("result:abcd"), AssetPayload::Inline(json!(1))).is_err());
        assert!(Asset::compute(
            id("asset:ns:c:ns:s1"),
            AssetPayload::Image("registry/c:1".into()),
            BTreeMap::from([("y".to_string(), None)]),
        )
        .is_ok());
    }
}
