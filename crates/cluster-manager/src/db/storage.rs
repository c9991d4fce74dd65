use crate::db::error::DBError;
use crate::db::types::action::{ActionKind, ClusterAction, LongRunningCluster, RunGroup};
use crate::db::types::artifact::ArtifactId;
use crate::db::types::cluster::{
    ClusterDescr, ClusterId, ClusterRecord, ClusterStatus, RunId, StatusUpdate,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// The dual-store cluster repository.
///
/// Every cluster lives in two places: a relational projection (status, name,
/// artifact, run id, resource counters, timestamps) and a full definition
/// document. Mutations write the relational half first and the document half
/// second; implementations must surface a document failure after a committed
/// relational write as [`DBError::StoreDivergence`] rather than rolling back
/// or retrying.
#[async_trait]
pub trait Storage: Sync + Send {
    /// Relational projection of a cluster.
    async fn get_cluster(&self, cluster_id: ClusterId) -> Result<ClusterRecord, DBError>;

    /// Full definition document of a cluster.
    async fn get_cluster_definition(&self, cluster_id: ClusterId)
        -> Result<ClusterDescr, DBError>;

    /// All cluster projections.
    async fn list_clusters(&self) -> Result<Vec<ClusterRecord>, DBError>;

    /// Projections for a set of cluster ids. Unknown ids are skipped.
    async fn get_clusters(&self, cluster_ids: &[ClusterId]) -> Result<Vec<ClusterRecord>, DBError>;

    /// Active run id of a cluster. Distinguishes an unknown cluster
    /// ([`DBError::UnknownCluster`]) from a known cluster that simply is not
    /// running ([`DBError::NoActiveRun`]).
    async fn get_cluster_run_id(&self, cluster_id: ClusterId) -> Result<RunId, DBError>;

    /// Whether a cluster with this name exists (case-insensitive). Names are
    /// resolved against the definition documents.
    async fn cluster_name_exists(&self, name: &str) -> Result<bool, DBError>;

    /// Distinct cloud environments across all definition documents.
    async fn cloud_environments(&self) -> Result<Vec<String>, DBError>;

    /// Creates a cluster in both stores: relational row (status `inactive`,
    /// version-1 artifact) first, then the definition document.
    async fn create_cluster(
        &self,
        descr: &ClusterDescr,
        artifact_id: &ArtifactId,
    ) -> Result<(), DBError>;

    /// Records a definition change: new name and newly allocated artifact in
    /// the relational store, then the merged document.
    async fn update_cluster(
        &self,
        descr: &ClusterDescr,
        artifact_id: &ArtifactId,
    ) -> Result<(), DBError>;

    /// Transitions a cluster into `creating` under a fresh run id.
    async fn start_cluster(&self, cluster_id: ClusterId, run_id: RunId) -> Result<(), DBError>;

    /// Transitions a cluster into `inactive` and zeroes its resource
    /// counters in both stores.
    async fn stop_cluster(&self, cluster_id: ClusterId) -> Result<(), DBError>;

    /// Transitions a cluster back into `creating`, keeping its run id.
    async fn restart_cluster(&self, cluster_id: ClusterId) -> Result<(), DBError>;

    /// Conditionally records an observed status and resource counters.
    /// Returns [`StatusUpdate::Skipped`], with neither store written, when
    /// `last_observed_at` is provided and a newer write already exists.
    async fn update_status(
        &self,
        cluster_id: ClusterId,
        status: ClusterStatus,
        active_pods: i64,
        available_memory: i64,
        last_observed_at: Option<DateTime<Utc>>,
    ) -> Result<StatusUpdate, DBError>;

    /// Renames a cluster in both stores.
    async fn rename_cluster(&self, cluster_id: ClusterId, name: &str) -> Result<(), DBError>;

    /// Reassigns the owning user. Document-store-only write.
    async fn update_cluster_user(&self, cluster_id: ClusterId, user: &str) -> Result<(), DBError>;

    /// Replaces the tag list. Document-store-only write.
    async fn update_cluster_tags(
        &self,
        cluster_id: ClusterId,
        tags: Vec<String>,
    ) -> Result<(), DBError>;

    /// Bumps the `last_used_at` heartbeat in the relational store.
    async fn touch_last_used(&self, cluster_id: ClusterId) -> Result<(), DBError>;

    /// Removes a cluster from both stores and soft-deletes its
    /// recently-visited references.
    async fn delete_cluster(&self, cluster_id: ClusterId) -> Result<(), DBError>;

    /// Appends one entry to the action log.
    async fn insert_action(
        &self,
        cluster_id: ClusterId,
        run_id: Option<RunId>,
        artifact_id: Option<&ArtifactId>,
        kind: ActionKind,
        message: &str,
    ) -> Result<(), DBError>;

    /// Actions of one run, oldest first.
    async fn actions_for_run(&self, run_id: RunId) -> Result<Vec<ClusterAction>, DBError>;

    /// Runs of a cluster, most recent first, paged.
    async fn run_groups(
        &self,
        cluster_id: ClusterId,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<RunGroup>, DBError>;

    /// First and last logged action of a run.
    async fn first_and_last_action(
        &self,
        run_id: RunId,
    ) -> Result<(ClusterAction, ClusterAction), DBError>;

    /// Most recent action of a kind for a cluster.
    async fn latest_action_of_kind(
        &self,
        cluster_id: ClusterId,
        kind: ActionKind,
    ) -> Result<Option<ClusterAction>, DBError>;

    /// Clusters whose current run exceeded a running-time threshold.
    async fn clusters_running_longer_than(
        &self,
        minutes: i32,
    ) -> Result<Vec<LongRunningCluster>, DBError>;

    /// Clusters in an id set not used for `days` days.
    async fn clusters_last_used_before(
        &self,
        days: i32,
        cluster_ids: &[ClusterId],
    ) -> Result<Vec<ClusterRecord>, DBError>;

    /// Config value for a key.
    async fn get_config(&self, config_key: &str) -> Result<String, DBError>;

    /// Config value for a key, `None` when absent.
    async fn maybe_get_config(&self, config_key: &str) -> Result<Option<String>, DBError>;

    /// Creates a config entry.
    async fn create_config(&self, config_key: &str, value: &str) -> Result<(), DBError>;

    /// Updates an existing config entry.
    async fn update_config(&self, config_key: &str, value: &str) -> Result<(), DBError>;

    /// Records that a user opened a cluster.
    async fn add_recent_visit(&self, user_id: &str, cluster_id: ClusterId)
        -> Result<(), DBError>;

    /// The clusters a user visited most recently.
    async fn recent_visits(&self, user_id: &str) -> Result<Vec<ClusterRecord>, DBError>;
}
