use crate::db::document::{DocumentError, DocumentStore};
use crate::db::error::DBError;
use crate::db::operations;
use crate::db::storage::Storage;
use crate::db::types::action::{ActionKind, ClusterAction, LongRunningCluster, RunGroup};
use crate::db::types::artifact::ArtifactId;
use crate::db::types::cluster::{
    ClusterDescr, ClusterId, ClusterRecord, ClusterStatus, RunId, StatusUpdate,
};
use crate::config::DatabaseConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use log::info;
use std::sync::Arc;
use tokio_postgres::NoTls;

mod embedded {
    use refinery::embed_migrations;
    embed_migrations!("./migrations/");
}

/// Dual-store repository backed by Postgres (relational projection, action
/// log, configs, visits) and a document store (full cluster definitions).
///
/// Relational writes happen inside a transaction and commit before the
/// document write is attempted. A document failure after the commit is
/// reported as [`DBError::StoreDivergence`]; the relational write stands.
pub struct StoragePostgres {
    pool: Pool,
    documents: Arc<dyn DocumentStore>,
}

impl StoragePostgres {
    /// Connects to Postgres and runs any pending schema migrations.
    pub async fn connect(
        db_config: &DatabaseConfig,
        documents: Arc<dyn DocumentStore>,
    ) -> Result<Self, DBError> {
        let pg_config = db_config.tokio_postgres_config()?;
        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };
        let mgr = Manager::from_config(pg_config, NoTls, mgr_config);
        let pool = Pool::builder(mgr)
            .max_size(db_config.pool_size)
            .build()
            .map_err(|e| DBError::PostgresPoolBuildError {
                error: e.to_string(),
            })?;
        let storage = Self { pool, documents };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Applies embedded schema migrations.
    pub async fn run_migrations(&self) -> Result<(), DBError> {
        info!("Performing database migrations (if needed)...");
        let mut client = self.pool.get().await?;
        embedded::migrations::runner()
            .run_async(&mut **client)
            .await?;
        Ok(())
    }

    /// Maps a document failure that happened after a committed relational
    /// write. The stores disagree at this point.
    fn diverged(cluster_id: ClusterId, error: DocumentError) -> DBError {
        DBError::store_divergence(cluster_id, error.to_string())
    }

    /// Maps a document read failure (no relational write involved).
    fn document_read_error(cluster_id: ClusterId, error: DocumentError) -> DBError {
        match error {
            DocumentError::NotFound { .. } => DBError::UnknownClusterDocument { cluster_id },
            other => DBError::DocumentStoreError {
                error: other.to_string(),
            },
        }
    }

    /// Document-side read-modify-write performed after the relational commit.
    async fn rewrite_document<F>(&self, cluster_id: ClusterId, mutate: F) -> Result<(), DBError>
    where
        F: FnOnce(&mut ClusterDescr) + Send,
    {
        let mut descr = self
            .documents
            .get(cluster_id)
            .await
            .map_err(|e| Self::diverged(cluster_id, e))?;
        mutate(&mut descr);
        self.documents
            .put(&descr)
            .await
            .map_err(|e| Self::diverged(cluster_id, e))
    }
}

#[async_trait]
impl Storage for StoragePostgres {
    async fn get_cluster(&self, cluster_id: ClusterId) -> Result<ClusterRecord, DBError> {
        let mut client = self.pool.get().await?;
        let txn = client.transaction().await?;
        let record = operations::cluster::get_cluster(&txn, cluster_id).await?;
        txn.commit().await?;
        Ok(record)
    }

    async fn get_cluster_definition(
        &self,
        cluster_id: ClusterId,
    ) -> Result<ClusterDescr, DBError> {
        self.documents
            .get(cluster_id)
            .await
            .map_err(|e| Self::document_read_error(cluster_id, e))
    }

    async fn list_clusters(&self) -> Result<Vec<ClusterRecord>, DBError> {
        let mut client = self.pool.get().await?;
        let txn = client.transaction().await?;
        let records = operations::cluster::list_clusters(&txn).await?;
        txn.commit().await?;
        Ok(records)
    }

    async fn get_clusters(&self, cluster_ids: &[ClusterId]) -> Result<Vec<ClusterRecord>, DBError> {
        let mut client = self.pool.get().await?;
        let txn = client.transaction().await?;
        let records = operations::cluster::get_clusters(&txn, cluster_ids).await?;
        txn.commit().await?;
        Ok(records)
    }

    async fn get_cluster_run_id(&self, cluster_id: ClusterId) -> Result<RunId, DBError> {
        let mut client = self.pool.get().await?;
        let txn = client.transaction().await?;
        let run_id = operations::cluster::get_cluster_run_id(&txn, cluster_id).await?;
        txn.commit().await?;
        run_id.ok_or(DBError::NoActiveRun { cluster_id })
    }

    async fn cluster_name_exists(&self, name: &str) -> Result<bool, DBError> {
        self.documents
            .name_exists(name)
            .await
            .map_err(|e| DBError::DocumentStoreError {
                error: e.to_string(),
            })
    }

    async fn cloud_environments(&self) -> Result<Vec<String>, DBError> {
        self.documents
            .distinct_values("cloud_env")
            .await
            .map_err(|e| DBError::DocumentStoreError {
                error: e.to_string(),
            })
    }

    async fn create_cluster(
        &self,
        descr: &ClusterDescr,
        artifact_id: &ArtifactId,
    ) -> Result<(), DBError> {
        let mut client = self.pool.get().await?;
        let txn = client.transaction().await?;
        operations::cluster::insert_cluster(
            &txn,
            descr.cluster_id,
            &descr.name,
            artifact_id,
            descr.created_on,
        )
        .await?;
        txn.commit().await?;
        self.documents
            .put(descr)
            .await
            .map_err(|e| Self::diverged(descr.cluster_id, e))
    }

    async fn update_cluster(
        &self,
        descr: &ClusterDescr,
        artifact_id: &ArtifactId,
    ) -> Result<(), DBError> {
        let mut client = self.pool.get().await?;
        let txn = client.transaction().await?;
        operations::cluster::update_name_and_artifact(
            &txn,
            descr.cluster_id,
            &descr.name,
            artifact_id,
            Utc::now(),
        )
        .await?;
        txn.commit().await?;
        self.documents
            .put(descr)
            .await
            .map_err(|e| Self::diverged(descr.cluster_id, e))
    }

    async fn start_cluster(&self, cluster_id: ClusterId, run_id: RunId) -> Result<(), DBError> {
        let now = Utc::now();
        let mut client = self.pool.get().await?;
        let txn = client.transaction().await?;
        operations::cluster::set_started(&txn, cluster_id, run_id, now).await?;
        txn.commit().await?;
        self.rewrite_document(cluster_id, |descr| {
            descr.status = ClusterStatus::Creating;
        })
        .await
    }

    async fn stop_cluster(&self, cluster_id: ClusterId) -> Result<(), DBError> {
        let now = Utc::now();
        let mut client = self.pool.get().await?;
        let txn = client.transaction().await?;
        operations::cluster::set_stopped(&txn, cluster_id, now).await?;
        txn.commit().await?;
        self.rewrite_document(cluster_id, |descr| {
            descr.status = ClusterStatus::Inactive;
            descr.active_pods = 0;
            descr.available_memory = 0;
        })
        .await
    }

    async fn restart_cluster(&self, cluster_id: ClusterId) -> Result<(), DBError> {
        let now = Utc::now();
        let mut client = self.pool.get().await?;
        let txn = client.transaction().await?;
        operations::cluster::set_restarting(&txn, cluster_id, now).await?;
        txn.commit().await?;
        self.rewrite_document(cluster_id, |descr| {
            descr.status = ClusterStatus::Creating;
        })
        .await
    }

    async fn update_status(
        &self,
        cluster_id: ClusterId,
        status: ClusterStatus,
        active_pods: i64,
        available_memory: i64,
        last_observed_at: Option<DateTime<Utc>>,
    ) -> Result<StatusUpdate, DBError> {
        let now = Utc::now();
        let mut client = self.pool.get().await?;
        let txn = client.transaction().await?;
        let outcome = operations::cluster::update_cluster_status(
            &txn,
            cluster_id,
            status,
            active_pods,
            available_memory,
            last_observed_at,
            now,
        )
        .await?;
        txn.commit().await?;
        if outcome == StatusUpdate::Skipped {
            // A newer write exists; neither store is touched.
            return Ok(StatusUpdate::Skipped);
        }
        self.rewrite_document(cluster_id, |descr| {
            descr.status = status;
            descr.active_pods = active_pods;
            descr.available_memory = available_memory;
        })
        .await?;
        Ok(StatusUpdate::Updated)
    }

    async fn rename_cluster(&self, cluster_id: ClusterId, name: &str) -> Result<(), DBError> {
        let mut client = self.pool.get().await?;
        let txn = client.transaction().await?;
        operations::cluster::rename_cluster(&txn, cluster_id, name, Utc::now()).await?;
        txn.commit().await?;
        let name = name.to_string();
        self.rewrite_document(cluster_id, move |descr| {
            descr.name = name;
        })
        .await
    }

    async fn update_cluster_user(&self, cluster_id: ClusterId, user: &str) -> Result<(), DBError> {
        let mut descr = self.get_cluster_definition(cluster_id).await?;
        descr.user = user.to_string();
        self.documents
            .put(&descr)
            .await
            .map_err(|e| DBError::DocumentStoreError {
                error: e.to_string(),
            })
    }

    async fn update_cluster_tags(
        &self,
        cluster_id: ClusterId,
        tags: Vec<String>,
    ) -> Result<(), DBError> {
        let mut descr = self.get_cluster_definition(cluster_id).await?;
        descr.tags = tags;
        self.documents
            .put(&descr)
            .await
            .map_err(|e| DBError::DocumentStoreError {
                error: e.to_string(),
            })
    }

    async fn touch_last_used(&self, cluster_id: ClusterId) -> Result<(), DBError> {
        let mut client = self.pool.get().await?;
        let txn = client.transaction().await?;
        operations::cluster::touch_last_used(&txn, cluster_id, Utc::now()).await?;
        txn.commit().await?;
        Ok(())
    }

    async fn delete_cluster(&self, cluster_id: ClusterId) -> Result<(), DBError> {
        let mut client = self.pool.get().await?;
        let txn = client.transaction().await?;
        operations::cluster::delete_cluster(&txn, cluster_id).await?;
        operations::visits::soft_delete_visits(&txn, cluster_id).await?;
        txn.commit().await?;
        self.documents
            .delete(cluster_id)
            .await
            .map_err(|e| Self::diverged(cluster_id, e))
    }

    async fn insert_action(
        &self,
        cluster_id: ClusterId,
        run_id: Option<RunId>,
        artifact_id: Option<&ArtifactId>,
        kind: ActionKind,
        message: &str,
    ) -> Result<(), DBError> {
        let mut client = self.pool.get().await?;
        let txn = client.transaction().await?;
        let artifact_id = artifact_id.map(|a| a.to_string());
        operations::actions::insert_action(
            &txn,
            cluster_id,
            run_id,
            artifact_id.as_deref(),
            kind,
            message,
            Utc::now(),
        )
        .await?;
        txn.commit().await?;
        Ok(())
    }

    async fn actions_for_run(&self, run_id: RunId) -> Result<Vec<ClusterAction>, DBError> {
        let mut client = self.pool.get().await?;
        let txn = client.transaction().await?;
        let actions = operations::actions::actions_for_run(&txn, run_id).await?;
        txn.commit().await?;
        Ok(actions)
    }

    async fn run_groups(
        &self,
        cluster_id: ClusterId,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<RunGroup>, DBError> {
        let mut client = self.pool.get().await?;
        let txn = client.transaction().await?;
        let groups = operations::actions::run_groups(&txn, cluster_id, offset, limit).await?;
        txn.commit().await?;
        Ok(groups)
    }

    async fn first_and_last_action(
        &self,
        run_id: RunId,
    ) -> Result<(ClusterAction, ClusterAction), DBError> {
        let mut client = self.pool.get().await?;
        let txn = client.transaction().await?;
        let pair = operations::actions::first_and_last_action(&txn, run_id).await?;
        txn.commit().await?;
        Ok(pair)
    }

    async fn latest_action_of_kind(
        &self,
        cluster_id: ClusterId,
        kind: ActionKind,
    ) -> Result<Option<ClusterAction>, DBError> {
        let mut client = self.pool.get().await?;
        let txn = client.transaction().await?;
        let action = operations::actions::latest_action_of_kind(&txn, cluster_id, kind).await?;
        txn.commit().await?;
        Ok(action)
    }

    async fn clusters_running_longer_than(
        &self,
        minutes: i32,
    ) -> Result<Vec<LongRunningCluster>, DBError> {
        let mut client = self.pool.get().await?;
        let txn = client.transaction().await?;
        let clusters = operations::actions::clusters_running_longer_than(&txn, minutes).await?;
        txn.commit().await?;
        Ok(clusters)
    }

    async fn clusters_last_used_before(
        &self,
        days: i32,
        cluster_ids: &[ClusterId],
    ) -> Result<Vec<ClusterRecord>, DBError> {
        let mut client = self.pool.get().await?;
        let txn = client.transaction().await?;
        let clusters =
            operations::cluster::clusters_last_used_before(&txn, days, cluster_ids).await?;
        txn.commit().await?;
        Ok(clusters)
    }

    async fn get_config(&self, config_key: &str) -> Result<String, DBError> {
        let mut client = self.pool.get().await?;
        let txn = client.transaction().await?;
        let value = operations::configs::get_config(&txn, config_key).await?;
        txn.commit().await?;
        Ok(value)
    }

    async fn maybe_get_config(&self, config_key: &str) -> Result<Option<String>, DBError> {
        let mut client = self.pool.get().await?;
        let txn = client.transaction().await?;
        let value = operations::configs::maybe_get_config(&txn, config_key).await?;
        txn.commit().await?;
        Ok(value)
    }

    async fn create_config(&self, config_key: &str, value: &str) -> Result<(), DBError> {
        let mut client = self.pool.get().await?;
        let txn = client.transaction().await?;
        operations::configs::create_config(&txn, config_key, value).await?;
        txn.commit().await?;
        Ok(())
    }

    async fn update_config(&self, config_key: &str, value: &str) -> Result<(), DBError> {
        let mut client = self.pool.get().await?;
        let txn = client.transaction().await?;
        operations::configs::update_config(&txn, config_key, value).await?;
        txn.commit().await?;
        Ok(())
    }

    async fn add_recent_visit(
        &self,
        user_id: &str,
        cluster_id: ClusterId,
    ) -> Result<(), DBError> {
        let mut client = self.pool.get().await?;
        let txn = client.transaction().await?;
        // The cluster must exist; a visit to a deleted cluster is dropped.
        operations::cluster::get_cluster(&txn, cluster_id).await?;
        operations::visits::add_recent_visit(&txn, user_id, cluster_id, Utc::now()).await?;
        txn.commit().await?;
        Ok(())
    }

    async fn recent_visits(&self, user_id: &str) -> Result<Vec<ClusterRecord>, DBError> {
        let mut client = self.pool.get().await?;
        let txn = client.transaction().await?;
        let ids = operations::visits::recent_visits(&txn, user_id).await?;
        let records = operations::cluster::get_clusters(&txn, &ids).await?;
        txn.commit().await?;
        Ok(records)
    }
}
