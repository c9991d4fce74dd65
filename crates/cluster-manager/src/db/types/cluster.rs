use crate::db::error::DBError;
use crate::db::types::artifact::ArtifactId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::fmt::Display;
use uuid::Uuid;

/// Cluster identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct ClusterId(pub Uuid);

impl ClusterId {
    /// Allocates a fresh, time-ordered cluster identifier.
    pub fn generate() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Run identifier: an opaque token assigned each time a cluster is started.
/// All action-log rows and audit events of one start-to-stop lifespan carry it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn generate() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Cluster status.
///
/// The relational store's `status` column is the single source of truth for
/// whether a lifecycle operation is permitted.
///
/// ```text
///              create
///                │
///                ▼
///            Inactive ◄───────── stop
///                │                 ▲
///     /start or /restart           │
///                ▼                 │
///            Creating ──────► Active (reported by status updates
///                │                 │  once pods come up)
///                └────► Died ◄─────┘  (terminal error, reported
///                                      by status updates)
/// ```
#[derive(Deserialize, Serialize, Eq, PartialEq, Debug, Clone, Copy)]
pub enum ClusterStatus {
    /// Cluster exists in both stores but holds no compute resources.
    /// The only status in which `delete` and `migrate-cloud-env` are allowed.
    Inactive,

    /// The provisioner accepted a start/restart and resources are coming up.
    Creating,

    /// Pods are running; reported by asynchronous status updates.
    Active,

    /// Terminal error state reported by asynchronous status updates.
    Died,
}

impl TryFrom<String> for ClusterStatus {
    type Error = DBError;
    fn try_from(value: String) -> Result<Self, DBError> {
        match value.as_str() {
            "inactive" => Ok(Self::Inactive),
            "creating" => Ok(Self::Creating),
            "active" => Ok(Self::Active),
            "cluster_died" => Ok(Self::Died),
            _ => Err(DBError::invalid_cluster_status(value)),
        }
    }
}

impl From<ClusterStatus> for &'static str {
    fn from(val: ClusterStatus) -> Self {
        match val {
            ClusterStatus::Inactive => "inactive",
            ClusterStatus::Creating => "creating",
            ClusterStatus::Active => "active",
            ClusterStatus::Died => "cluster_died",
        }
    }
}

impl Display for ClusterStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let status: &'static str = (*self).into();
        write!(f, "{status}")
    }
}

/// Outcome of a conditional status update.
///
/// `Skipped` means a concurrent, more recent update already occurred and the
/// write was intentionally not performed (last-writer-wins guard).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusUpdate {
    Updated,
    Skipped,
}

/// Denormalized cluster projection held by the relational store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterRecord {
    /// Assigned globally unique cluster identifier.
    pub id: ClusterId,

    /// Cluster name. Kept in sync with the document store by the repository's
    /// write ordering.
    pub name: String,

    /// Identifier of the deployable artifact currently associated with the
    /// cluster, or `None` if no artifact was recorded yet.
    pub artifact_id: Option<ArtifactId>,

    /// Current lifecycle status.
    pub status: ClusterStatus,

    /// Run identifier assigned by the most recent start, if any.
    pub active_run_id: Option<RunId>,

    /// Number of pods currently reported running.
    pub active_pods: i64,

    /// Memory (GiB) currently reported available.
    pub available_memory: i64,

    /// Timestamp when the cluster row was created.
    pub created_at: DateTime<Utc>,

    /// Timestamp of the most recent status-affecting write. Compared against
    /// the `last_observed_at` guard of conditional status updates.
    pub last_updated_at: DateTime<Utc>,

    /// Timestamp of the most recent start or heartbeat.
    pub last_used_at: DateTime<Utc>,
}

/// Full cluster definition held by the document store, keyed by cluster id.
///
/// Only the fields the engine itself reads or rewrites are named; everything
/// else the caller supplied (node specs, disk types, labels, ...) is carried
/// through updates untouched in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterDescr {
    pub cluster_id: ClusterId,
    pub name: String,
    pub status: ClusterStatus,
    pub cloud_env: String,
    pub user: String,
    pub runtime: String,
    #[serde(default)]
    pub is_job_cluster: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub active_pods: i64,
    #[serde(default)]
    pub available_memory: i64,
    pub created_on: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Caller-supplied cluster definition for create and update requests.
///
/// The engine fills in identity (`cluster_id`, `created_on`), resolves the
/// cloud environment and decides the stored name; everything else passes
/// through to the document store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSpec {
    pub name: String,
    /// Requested cloud environment. Empty or absent means "use the default
    /// for this cluster type".
    #[serde(default)]
    pub cloud_env: Option<String>,
    pub user: String,
    pub runtime: String,
    #[serde(default)]
    pub is_job_cluster: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ClusterSpec {
    /// Materializes the definition document for a newly created cluster.
    pub fn into_descr(
        self,
        cluster_id: ClusterId,
        name: String,
        cloud_env: String,
        created_on: DateTime<Utc>,
    ) -> ClusterDescr {
        ClusterDescr {
            cluster_id,
            name,
            status: ClusterStatus::Inactive,
            cloud_env,
            user: self.user,
            runtime: self.runtime,
            is_job_cluster: self.is_job_cluster,
            tags: self.tags,
            active_pods: 0,
            available_memory: 0,
            created_on,
            extra: self.extra,
        }
    }
}

impl ClusterDescr {
    /// Merges an update request over the stored definition. Request fields win,
    /// except for identity fields (`cluster_id`, `user`, `created_on`) and the
    /// already-resolved cloud environment, which are preserved from the stored
    /// document. Extra fields of the stored document survive unless the request
    /// overrides them.
    pub fn merged_with(&self, request: ClusterSpec, cloud_env: String) -> ClusterDescr {
        let mut extra = self.extra.clone();
        extra.extend(request.extra);
        ClusterDescr {
            cluster_id: self.cluster_id,
            name: request.name,
            status: self.status,
            cloud_env,
            user: self.user.clone(),
            runtime: request.runtime,
            is_job_cluster: request.is_job_cluster,
            tags: request.tags,
            active_pods: self.active_pods,
            available_memory: self.available_memory,
            created_on: self.created_on,
            extra,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn descr() -> ClusterDescr {
        ClusterDescr {
            cluster_id: ClusterId::generate(),
            name: "alpha".to_string(),
            status: ClusterStatus::Inactive,
            cloud_env: "gcp-east".to_string(),
            user: "owner@example.com".to_string(),
            runtime: "standard-3.2".to_string(),
            is_job_cluster: false,
            tags: vec!["gcp-east".to_string()],
            active_pods: 0,
            available_memory: 0,
            created_on: Utc::now(),
            extra: Map::from_iter([("node_count".to_string(), json!(4))]),
        }
    }

    #[test]
    fn status_round_trip() {
        for status in [
            ClusterStatus::Inactive,
            ClusterStatus::Creating,
            ClusterStatus::Active,
            ClusterStatus::Died,
        ] {
            assert_eq!(ClusterStatus::try_from(status.to_string()).unwrap(), status);
        }
        assert!(ClusterStatus::try_from("galloping".to_string()).is_err());
    }

    #[test]
    fn merge_preserves_identity_fields() {
        let stored = descr();
        let request = ClusterSpec {
            name: "alpha-renamed".to_string(),
            cloud_env: None,
            user: "other@example.com".to_string(),
            runtime: "standard-3.3".to_string(),
            is_job_cluster: false,
            tags: vec![],
            extra: Map::from_iter([("node_count".to_string(), json!(8))]),
        };
        let merged = stored.merged_with(request, stored.cloud_env.clone());
        assert_eq!(merged.cluster_id, stored.cluster_id);
        assert_eq!(merged.user, "owner@example.com");
        assert_eq!(merged.created_on, stored.created_on);
        assert_eq!(merged.name, "alpha-renamed");
        assert_eq!(merged.runtime, "standard-3.3");
        assert_eq!(merged.extra["node_count"], json!(8));
    }

    #[test]
    fn merge_keeps_unmentioned_extra_fields() {
        let mut stored = descr();
        stored
            .extra
            .insert("disk_type".to_string(), json!("ssd"));
        let request = ClusterSpec {
            name: stored.name.clone(),
            cloud_env: None,
            user: stored.user.clone(),
            runtime: stored.runtime.clone(),
            is_job_cluster: false,
            tags: stored.tags.clone(),
            extra: Map::new(),
        };
        let merged = stored.merged_with(request, stored.cloud_env.clone());
        assert_eq!(merged.extra["disk_type"], json!("ssd"));
        assert_eq!(merged.extra["node_count"], json!(4));
    }
}
