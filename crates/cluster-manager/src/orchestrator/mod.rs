use crate::audit::{AuditEmitter, LifecycleEvent, LifecycleEventType};
use crate::config::{resolve_cloud_env, runtime_namespace_key, ClusterManagerConfig};
use crate::db::error::DBError;
use crate::db::storage::Storage;
use crate::db::types::action::{ActionKind, ClusterAction, LongRunningCluster, RunGroup};
use crate::db::types::artifact::ArtifactId;
use crate::db::types::cluster::{
    ClusterDescr, ClusterId, ClusterRecord, ClusterSpec, ClusterStatus, RunId, StatusUpdate,
};
use crate::db::{CONFIG_DEFAULT_CLOUD_ENV, CONFIG_JOB_DEFAULT_CLOUD_ENV};
use crate::error::ManagerError;
use crate::provisioner::{ProvisionTarget, Provisioner, RemoteCommand};
use chrono::{DateTime, Utc};
use log::info;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[cfg(test)]
mod test;

/// Per-cluster serialization of lifecycle operations.
///
/// The artifact version is read, incremented and written back around a
/// provisioner call; holding the cluster's lock across that window keeps two
/// concurrent operations on the same cluster from allocating the same
/// version. Operations on different clusters proceed in parallel. This
/// serializes within one process only; deployments run a single orchestrator
/// per environment.
#[derive(Default)]
struct ClusterLocks {
    locks: Mutex<HashMap<ClusterId, Arc<AsyncMutex<()>>>>,
}

impl ClusterLocks {
    async fn acquire(&self, cluster_id: ClusterId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks
                .entry(cluster_id)
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

/// The cluster lifecycle engine.
///
/// Sequences every lifecycle operation as: read and precondition checks,
/// audit request event, provisioner call, dual-store write, audit terminal
/// event. State never changes in either store unless the provisioner
/// accepted the operation, and a failed operation never consumes an artifact
/// version.
pub struct ClusterOrchestrator {
    config: ClusterManagerConfig,
    db: Arc<dyn Storage>,
    provisioner: Arc<dyn Provisioner>,
    audit: AuditEmitter,
    locks: ClusterLocks,
}

impl ClusterOrchestrator {
    pub fn new(
        config: ClusterManagerConfig,
        db: Arc<dyn Storage>,
        provisioner: Arc<dyn Provisioner>,
        audit: AuditEmitter,
    ) -> Self {
        Self {
            config,
            db,
            provisioner,
            audit,
            locks: ClusterLocks::default(),
        }
    }

    /// Cloud environment for a request: the request's own value, else the
    /// configured default for the cluster type, else the global default.
    async fn resolve_cloud_env(
        &self,
        requested: Option<&str>,
        is_job_cluster: bool,
    ) -> Result<String, DBError> {
        let config_key = if is_job_cluster {
            CONFIG_JOB_DEFAULT_CLOUD_ENV
        } else {
            CONFIG_DEFAULT_CLOUD_ENV
        };
        let type_default = self.db.maybe_get_config(config_key).await?;
        Ok(resolve_cloud_env(
            requested,
            type_default.as_deref(),
            &self.config.default_cloud_env,
        ))
    }

    /// Kubernetes placement for a cluster definition.
    async fn provision_target(&self, descr: &ClusterDescr) -> Result<ProvisionTarget, DBError> {
        let namespace = self
            .db
            .maybe_get_config(&runtime_namespace_key(&descr.runtime))
            .await?
            .unwrap_or_else(|| self.config.default_namespace.clone());
        Ok(ProvisionTarget {
            namespace,
            kube_cluster: self.config.target_kube_cluster(&descr.cloud_env),
        })
    }

    /// The artifact a start or restart deploys: the cluster's current one.
    fn current_artifact(record: &ClusterRecord) -> ArtifactId {
        record
            .artifact_id
            .unwrap_or_else(|| ArtifactId::first(record.id))
    }

    /// The artifact a definition change allocates: one version past the
    /// current one. Persisted only if the change succeeds.
    fn next_artifact(record: &ClusterRecord) -> ArtifactId {
        ArtifactId {
            cluster_id: record.id,
            version: ArtifactId::version_or_default(&record.artifact_id) + 1,
        }
    }

    /// Emits the request event, runs the operation, then emits the matching
    /// terminal event. The terminal event copies artifact, run and metadata
    /// from the request event and carries the error message on failure.
    async fn bracket<T, F>(
        &self,
        request: LifecycleEvent,
        done: LifecycleEventType,
        failed: LifecycleEventType,
        op: F,
    ) -> Result<T, ManagerError>
    where
        F: Future<Output = Result<T, ManagerError>>,
    {
        let cluster_id = request.cluster_id;
        let cluster_name = request.cluster_name.clone();
        let artifact_id = request.artifact_id.clone();
        let run_id = request.run_id;
        let metadata = request.metadata.clone();
        self.audit.emit(request).await;

        let result = op.await;

        let mut event = LifecycleEvent::new(
            if result.is_ok() { done } else { failed },
            cluster_id,
            &cluster_name,
        );
        event.artifact_id = artifact_id;
        event.run_id = run_id;
        event.metadata = metadata;
        if let Err(e) = &result {
            event.message = e.to_string();
        }
        self.audit.emit(event).await;
        result
    }

    /// Creates a cluster: resolves the cloud environment, allocates an id
    /// and the version-1 artifact, registers it with the provisioner and
    /// writes both stores. A name collision is resolved by suffixing the
    /// requested name with the cluster id, never by failing.
    pub async fn create_cluster(&self, spec: ClusterSpec) -> Result<ClusterDescr, ManagerError> {
        let cloud_env = self
            .resolve_cloud_env(spec.cloud_env.as_deref(), spec.is_job_cluster)
            .await?;
        let cluster_id = ClusterId::generate();
        let name = if self.db.cluster_name_exists(&spec.name).await? {
            let name = format!("{}_{}", spec.name, cluster_id);
            info!(
                "Cluster name '{}' is taken; creating cluster {cluster_id} as '{name}'",
                spec.name
            );
            name
        } else {
            spec.name.clone()
        };
        let artifact = ArtifactId::first(cluster_id);
        let user = spec.user.clone();
        let descr = spec.into_descr(cluster_id, name, cloud_env, Utc::now());
        let target = self.provision_target(&descr).await?;

        let request = LifecycleEvent::new(
            LifecycleEventType::ClusterCreationRequestReceived,
            cluster_id,
            &descr.name,
        )
        .with_artifact(&artifact)
        .with_metadata("user", json!(user));
        self.bracket(
            request,
            LifecycleEventType::ClusterCreated,
            LifecycleEventType::ClusterCreationFailed,
            async {
                self.provisioner
                    .create_cluster(&descr, &artifact, &target)
                    .await?;
                self.db.create_cluster(&descr, &artifact).await?;
                info!("Created cluster {cluster_id} ('{}') at {artifact}", descr.name);
                Ok(descr.clone())
            },
        )
        .await
    }

    /// Updates a cluster definition: merges the request over the stored
    /// document, allocates the next artifact version, pushes the new
    /// definition to the provisioner and writes both stores.
    pub async fn update_cluster(
        &self,
        cluster_id: ClusterId,
        spec: ClusterSpec,
    ) -> Result<ClusterDescr, ManagerError> {
        self.apply_definition_change(cluster_id, Some(spec), &[])
            .await
    }

    /// Re-applies the stored definition under a fresh artifact version,
    /// optionally running remote commands in live pods. Used to push
    /// artifact refreshes without a definition change; has no status
    /// precondition.
    pub async fn force_update_cluster(
        &self,
        cluster_id: ClusterId,
        remote_commands: &[RemoteCommand],
    ) -> Result<ClusterDescr, ManagerError> {
        self.apply_definition_change(cluster_id, None, remote_commands)
            .await
    }

    async fn apply_definition_change(
        &self,
        cluster_id: ClusterId,
        spec: Option<ClusterSpec>,
        remote_commands: &[RemoteCommand],
    ) -> Result<ClusterDescr, ManagerError> {
        let _guard = self.locks.acquire(cluster_id).await;
        let record = self.db.get_cluster(cluster_id).await?;
        let stored = self.db.get_cluster_definition(cluster_id).await?;
        // The request event records who asked for what: the submitted payload
        // and the fields it changes relative to the stored definition.
        let (updated, user, change) = match spec {
            Some(spec) => {
                let user = spec.user.clone();
                let payload = serde_json::to_value(&spec).unwrap_or(Value::Null);
                let cloud_env = stored.cloud_env.clone();
                let updated = stored.merged_with(spec, cloud_env);
                let diff = definition_diff(&stored, &updated);
                (updated, user, Some((payload, diff)))
            }
            None => {
                let user = stored.user.clone();
                (stored, user, None)
            }
        };
        let artifact = Self::next_artifact(&record);
        let target = self.provision_target(&updated).await?;

        let mut request = LifecycleEvent::new(
            LifecycleEventType::ClusterUpdationRequestReceived,
            cluster_id,
            &updated.name,
        )
        .with_artifact(&artifact)
        .with_metadata("user", json!(user));
        request = match change {
            Some((payload, diff)) => request
                .with_metadata("request", payload)
                .with_metadata("diff", Value::Object(diff)),
            None => request.with_metadata("remote_commands", json!(remote_commands.len())),
        };
        self.bracket(
            request,
            LifecycleEventType::ClusterUpdated,
            LifecycleEventType::ClusterUpdationFailed,
            async {
                self.provisioner
                    .update_cluster(&updated, &artifact, &target, remote_commands)
                    .await?;
                self.db.update_cluster(&updated, &artifact).await?;
                if let Some(run_id) = record.active_run_id {
                    self.db
                        .insert_action(
                            cluster_id,
                            Some(run_id),
                            Some(&artifact),
                            ActionKind::Updating,
                            "cluster definition updated",
                        )
                        .await?;
                }
                info!("Updated cluster {cluster_id} to {artifact}");
                Ok(updated.clone())
            },
        )
        .await
    }

    /// Moves an inactive cluster to another cloud environment. Allocates the
    /// next artifact version, pushes the rewritten definition (including the
    /// old environment's tag, if present) to the provisioner and writes both
    /// stores. Migrating an inactive cluster to the environment it is
    /// already in is a complete no-op: no store write, no event.
    pub async fn migrate_cloud_env(
        &self,
        cluster_id: ClusterId,
        cloud_env: &str,
    ) -> Result<Option<ClusterDescr>, ManagerError> {
        let _guard = self.locks.acquire(cluster_id).await;
        let record = self.db.get_cluster(cluster_id).await?;
        let stored = self.db.get_cluster_definition(cluster_id).await?;
        if record.status != ClusterStatus::Inactive {
            return Err(DBError::invalid_cluster_state(
                cluster_id,
                ClusterStatus::Inactive,
                record.status,
            )
            .into());
        }
        if stored.cloud_env == cloud_env {
            info!("Cluster {cluster_id} is already in cloud environment '{cloud_env}'");
            return Ok(None);
        }

        let mut migrated = stored.clone();
        let old_env = std::mem::replace(&mut migrated.cloud_env, cloud_env.to_string());
        for tag in migrated.tags.iter_mut() {
            if *tag == old_env {
                *tag = cloud_env.to_string();
            }
        }
        let artifact = Self::next_artifact(&record);
        let target = self.provision_target(&migrated).await?;

        let request = LifecycleEvent::new(
            LifecycleEventType::ClusterUpdationRequestReceived,
            cluster_id,
            &migrated.name,
        )
        .with_artifact(&artifact)
        .with_metadata("user", json!(migrated.user))
        .with_metadata("cloud_env", json!({ "from": &old_env, "to": cloud_env }));
        self.bracket(
            request,
            LifecycleEventType::ClusterUpdated,
            LifecycleEventType::ClusterUpdationFailed,
            async {
                self.provisioner
                    .update_cluster(&migrated, &artifact, &target, &[])
                    .await?;
                self.db.update_cluster(&migrated, &artifact).await?;
                if let Some(run_id) = record.active_run_id {
                    self.db
                        .insert_action(
                            cluster_id,
                            Some(run_id),
                            Some(&artifact),
                            ActionKind::Updating,
                            &format!("cluster cloud environment updated to {cloud_env}"),
                        )
                        .await?;
                }
                info!(
                    "Migrated cluster {cluster_id} from cloud environment '{old_env}' to '{cloud_env}'"
                );
                Ok(Some(migrated.clone()))
            },
        )
        .await
    }

    /// Starts a cluster: asks the provisioner to bring up resources from the
    /// current artifact and records the `creating` transition under a fresh
    /// run id. Does not allocate a new artifact version.
    pub async fn start_cluster(&self, cluster_id: ClusterId) -> Result<RunId, ManagerError> {
        let _guard = self.locks.acquire(cluster_id).await;
        let record = self.db.get_cluster(cluster_id).await?;
        let stored = self.db.get_cluster_definition(cluster_id).await?;
        let artifact = Self::current_artifact(&record);
        let target = self.provision_target(&stored).await?;
        let run_id = RunId::generate();

        let request = LifecycleEvent::new(
            LifecycleEventType::ClusterStartRequestReceived,
            cluster_id,
            &record.name,
        )
        .with_artifact(&artifact)
        .with_run(run_id);
        self.bracket(
            request,
            LifecycleEventType::ClusterStarted,
            LifecycleEventType::ClusterStartFailed,
            async {
                self.provisioner
                    .start_cluster(&record.name, &artifact, &target)
                    .await?;
                self.db.start_cluster(cluster_id, run_id).await?;
                self.db
                    .insert_action(
                        cluster_id,
                        Some(run_id),
                        Some(&artifact),
                        ActionKind::Started,
                        "cluster start accepted",
                    )
                    .await?;
                info!("Started cluster {cluster_id} at {artifact} under run {run_id}");
                Ok(run_id)
            },
        )
        .await
    }

    /// Stops a cluster: tears down its resources and records the
    /// `inactive` transition with zeroed resource counters. The action log
    /// entry is attributed to the run being stopped, if one exists.
    pub async fn stop_cluster(&self, cluster_id: ClusterId) -> Result<(), ManagerError> {
        let _guard = self.locks.acquire(cluster_id).await;
        let record = self.db.get_cluster(cluster_id).await?;
        let stored = self.db.get_cluster_definition(cluster_id).await?;
        let target = self.provision_target(&stored).await?;

        let mut request = LifecycleEvent::new(
            LifecycleEventType::ClusterStopRequestReceived,
            cluster_id,
            &record.name,
        );
        request.run_id = record.active_run_id;
        self.bracket(
            request,
            LifecycleEventType::ClusterStopped,
            LifecycleEventType::ClusterStopFailed,
            async {
                self.provisioner.stop_cluster(&record.name, &target).await?;
                self.db.stop_cluster(cluster_id).await?;
                self.db
                    .insert_action(
                        cluster_id,
                        record.active_run_id,
                        record.artifact_id.as_ref(),
                        ActionKind::Stopped,
                        "cluster stopped",
                    )
                    .await?;
                info!("Stopped cluster {cluster_id}");
                Ok(())
            },
        )
        .await
    }

    /// Restarts a cluster in place: resources are recreated from the current
    /// artifact and the run id is kept, so the restart shows up in the run's
    /// action history.
    pub async fn restart_cluster(&self, cluster_id: ClusterId) -> Result<(), ManagerError> {
        let _guard = self.locks.acquire(cluster_id).await;
        let record = self.db.get_cluster(cluster_id).await?;
        let stored = self.db.get_cluster_definition(cluster_id).await?;
        let artifact = Self::current_artifact(&record);
        let target = self.provision_target(&stored).await?;

        let mut request = LifecycleEvent::new(
            LifecycleEventType::ClusterRestartRequestReceived,
            cluster_id,
            &record.name,
        )
        .with_artifact(&artifact);
        request.run_id = record.active_run_id;
        self.bracket(
            request,
            LifecycleEventType::ClusterRestarted,
            LifecycleEventType::ClusterRestartFailed,
            async {
                self.provisioner
                    .restart_cluster(&record.name, &artifact, &target)
                    .await?;
                self.db.restart_cluster(cluster_id).await?;
                if let Some(run_id) = record.active_run_id {
                    self.db
                        .insert_action(
                            cluster_id,
                            Some(run_id),
                            Some(&artifact),
                            ActionKind::Restarting,
                            "cluster restart accepted",
                        )
                        .await?;
                }
                info!("Restarted cluster {cluster_id}");
                Ok(())
            },
        )
        .await
    }

    /// Updates the definition, then starts the cluster from the new
    /// artifact. Each step takes and releases the cluster's lock on its own.
    pub async fn update_and_apply(
        &self,
        cluster_id: ClusterId,
        spec: ClusterSpec,
    ) -> Result<RunId, ManagerError> {
        self.update_cluster(cluster_id, spec).await?;
        self.start_cluster(cluster_id).await
    }

    /// Deletes an inactive cluster from both stores and drops it from
    /// recently-visited lists. Never reaches the provisioner: an inactive
    /// cluster holds no resources.
    pub async fn delete_cluster(&self, cluster_id: ClusterId) -> Result<(), ManagerError> {
        let _guard = self.locks.acquire(cluster_id).await;
        let record = self.db.get_cluster(cluster_id).await?;
        if record.status != ClusterStatus::Inactive {
            return Err(DBError::invalid_cluster_state(
                cluster_id,
                ClusterStatus::Inactive,
                record.status,
            )
            .into());
        }

        let request = LifecycleEvent::new(
            LifecycleEventType::ClusterDeletionRequestReceived,
            cluster_id,
            &record.name,
        );
        self.bracket(
            request,
            LifecycleEventType::ClusterDeleted,
            LifecycleEventType::ClusterDeletionFailed,
            async {
                self.db.delete_cluster(cluster_id).await?;
                info!("Deleted cluster {cluster_id} ('{}')", record.name);
                Ok(())
            },
        )
        .await
    }

    /// Records an observed status and resource counters. Returns
    /// [`StatusUpdate::Skipped`] when the observation is older than the
    /// stores' current state.
    pub async fn update_status(
        &self,
        cluster_id: ClusterId,
        status: ClusterStatus,
        active_pods: i64,
        available_memory: i64,
        last_observed_at: Option<DateTime<Utc>>,
    ) -> Result<StatusUpdate, ManagerError> {
        let outcome = self
            .db
            .update_status(
                cluster_id,
                status,
                active_pods,
                available_memory,
                last_observed_at,
            )
            .await?;
        if outcome == StatusUpdate::Skipped {
            info!("Skipped stale status observation for cluster {cluster_id}");
        }
        Ok(outcome)
    }

    /// Renames a cluster. Unlike creation, renaming to a taken name is
    /// rejected.
    pub async fn rename_cluster(
        &self,
        cluster_id: ClusterId,
        name: &str,
    ) -> Result<(), ManagerError> {
        if self.db.cluster_name_exists(name).await? {
            return Err(DBError::DuplicateName.into());
        }
        self.db.rename_cluster(cluster_id, name).await?;
        info!("Renamed cluster {cluster_id} to '{name}'");
        Ok(())
    }

    /// Reassigns the owning user of a cluster.
    pub async fn update_user(&self, cluster_id: ClusterId, user: &str) -> Result<(), ManagerError> {
        if !is_valid_email(user) {
            return Err(DBError::invalid_user_email(user.to_string()).into());
        }
        self.db.update_cluster_user(cluster_id, user).await?;
        Ok(())
    }

    /// Replaces the tag list of a cluster.
    pub async fn update_tags(
        &self,
        cluster_id: ClusterId,
        tags: Vec<String>,
    ) -> Result<(), ManagerError> {
        self.db.update_cluster_tags(cluster_id, tags).await?;
        Ok(())
    }

    /// Heartbeat: marks the cluster as recently used.
    pub async fn touch_last_used(&self, cluster_id: ClusterId) -> Result<(), ManagerError> {
        self.db.touch_last_used(cluster_id).await?;
        Ok(())
    }

    pub async fn get_cluster(&self, cluster_id: ClusterId) -> Result<ClusterRecord, ManagerError> {
        Ok(self.db.get_cluster(cluster_id).await?)
    }

    pub async fn get_cluster_definition(
        &self,
        cluster_id: ClusterId,
    ) -> Result<ClusterDescr, ManagerError> {
        Ok(self.db.get_cluster_definition(cluster_id).await?)
    }

    pub async fn list_clusters(&self) -> Result<Vec<ClusterRecord>, ManagerError> {
        Ok(self.db.list_clusters().await?)
    }

    pub async fn get_cluster_run_id(&self, cluster_id: ClusterId) -> Result<RunId, ManagerError> {
        Ok(self.db.get_cluster_run_id(cluster_id).await?)
    }

    pub async fn actions_for_run(&self, run_id: RunId) -> Result<Vec<ClusterAction>, ManagerError> {
        Ok(self.db.actions_for_run(run_id).await?)
    }

    pub async fn run_groups(
        &self,
        cluster_id: ClusterId,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<RunGroup>, ManagerError> {
        Ok(self.db.run_groups(cluster_id, offset, limit).await?)
    }

    pub async fn first_and_last_action(
        &self,
        run_id: RunId,
    ) -> Result<(ClusterAction, ClusterAction), ManagerError> {
        Ok(self.db.first_and_last_action(run_id).await?)
    }

    pub async fn latest_action_of_kind(
        &self,
        cluster_id: ClusterId,
        kind: ActionKind,
    ) -> Result<Option<ClusterAction>, ManagerError> {
        Ok(self.db.latest_action_of_kind(cluster_id, kind).await?)
    }

    pub async fn clusters_running_longer_than(
        &self,
        minutes: i32,
    ) -> Result<Vec<LongRunningCluster>, ManagerError> {
        Ok(self.db.clusters_running_longer_than(minutes).await?)
    }

    pub async fn clusters_last_used_before(
        &self,
        days: i32,
        cluster_ids: &[ClusterId],
    ) -> Result<Vec<ClusterRecord>, ManagerError> {
        Ok(self.db.clusters_last_used_before(days, cluster_ids).await?)
    }

    pub async fn cloud_environments(&self) -> Result<Vec<String>, ManagerError> {
        Ok(self.db.cloud_environments().await?)
    }

    pub async fn add_recent_visit(
        &self,
        user_id: &str,
        cluster_id: ClusterId,
    ) -> Result<(), ManagerError> {
        Ok(self.db.add_recent_visit(user_id, cluster_id).await?)
    }

    pub async fn recent_visits(&self, user_id: &str) -> Result<Vec<ClusterRecord>, ManagerError> {
        Ok(self.db.recent_visits(user_id).await?)
    }
}

/// Fields of the new definition that differ from the stored one, keyed by
/// field name with the new value.
fn definition_diff(before: &ClusterDescr, after: &ClusterDescr) -> Map<String, Value> {
    let (Ok(Value::Object(before)), Ok(Value::Object(after))) =
        (serde_json::to_value(before), serde_json::to_value(after))
    else {
        return Map::new();
    };
    after
        .into_iter()
        .filter(|(key, value)| before.get(key) != Some(value))
        .collect()
}

/// Minimal shape check for user email addresses; ownership records must at
/// least be routable.
fn is_valid_email(value: &str) -> bool {
    let Some((local, domain)) = value.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.is_empty()
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !value.contains(char::is_whitespace)
}
