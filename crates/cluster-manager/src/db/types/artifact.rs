use crate::db::error::DBError;
use crate::db::types::cluster::ClusterId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fmt::Display;

/// Identifier of the deployable artifact tied to a cluster definition,
/// rendered as `{cluster_id}-v{version}`.
///
/// The version counts definition changes: it starts at 1 on creation and is
/// incremented by updates, force-updates and cloud environment migrations.
/// Start, stop and restart never change it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ArtifactId {
    pub cluster_id: ClusterId,
    pub version: i64,
}

impl ArtifactId {
    /// Artifact of a freshly created cluster.
    pub fn first(cluster_id: ClusterId) -> Self {
        Self {
            cluster_id,
            version: 1,
        }
    }

    /// Artifact succeeding this one after a definition change.
    pub fn next(&self) -> Self {
        Self {
            cluster_id: self.cluster_id,
            version: self.version + 1,
        }
    }

    /// Version recorded for a cluster, defaulting to 1 when no artifact was
    /// stored yet (legacy rows predating versioning).
    pub fn version_or_default(artifact_id: &Option<ArtifactId>) -> i64 {
        artifact_id.as_ref().map_or(1, |a| a.version)
    }
}

impl Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-v{}", self.cluster_id, self.version)
    }
}

impl From<ArtifactId> for String {
    fn from(val: ArtifactId) -> Self {
        val.to_string()
    }
}

impl TryFrom<String> for ArtifactId {
    type Error = DBError;

    /// Parses `{cluster_id}-v{version}`. The version is whatever follows the
    /// last `-v`; UUIDs contain no `v`, so the split is unambiguous.
    fn try_from(value: String) -> Result<Self, DBError> {
        let Some(pos) = value.rfind("-v") else {
            return Err(DBError::invalid_artifact_id(value));
        };
        let (id_part, version_part) = value.split_at(pos);
        let version: i64 = version_part[2..]
            .parse()
            .map_err(|_| DBError::invalid_artifact_id(value.clone()))?;
        let cluster_id = id_part
            .parse::<uuid::Uuid>()
            .map(ClusterId)
            .map_err(|_| DBError::invalid_artifact_id(value.clone()))?;
        if version < 1 {
            return Err(DBError::invalid_artifact_id(value));
        }
        Ok(Self {
            cluster_id,
            version,
        })
    }
}
