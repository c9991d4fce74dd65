use crate::audit::{AuditEmitter, AuditError, AuditSink, LifecycleEvent, LifecycleEventType};
use crate::config::ClusterManagerConfig;
use crate::db::error::DBError;
use crate::db::storage::Storage;
use crate::db::types::action::{ActionKind, ClusterAction, LongRunningCluster, RunGroup};
use crate::db::types::artifact::ArtifactId;
use crate::db::types::cluster::{
    ClusterDescr, ClusterId, ClusterRecord, ClusterSpec, ClusterStatus, RunId, StatusUpdate,
};
use crate::error::ManagerError;
use crate::orchestrator::ClusterOrchestrator;
use crate::provisioner::{
    ProvisionTarget, ProvisionedStatus, Provisioner, ProvisionerError, RemoteCommand,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Map;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct MemState {
    records: HashMap<ClusterId, ClusterRecord>,
    documents: HashMap<ClusterId, ClusterDescr>,
    actions: Vec<ClusterAction>,
    configs: HashMap<String, String>,
    visits: Vec<(String, ClusterId, DateTime<Utc>, bool)>,
}

/// In-memory dual-store double. `fail_document_writes` makes every
/// document-side write fail after the relational side already applied,
/// mimicking a diverged dual-store mutation.
#[derive(Default)]
struct MemStorage {
    state: Mutex<MemState>,
    fail_document_writes: AtomicBool,
}

impl MemStorage {
    fn record(&self, cluster_id: ClusterId) -> ClusterRecord {
        self.state.lock().unwrap().records[&cluster_id].clone()
    }

    fn document(&self, cluster_id: ClusterId) -> ClusterDescr {
        self.state.lock().unwrap().documents[&cluster_id].clone()
    }

    fn actions(&self) -> Vec<ClusterAction> {
        self.state.lock().unwrap().actions.clone()
    }

    fn set_status(&self, cluster_id: ClusterId, status: ClusterStatus) {
        let mut state = self.state.lock().unwrap();
        if let Some(record) = state.records.get_mut(&cluster_id) {
            record.status = status;
        }
        if let Some(descr) = state.documents.get_mut(&cluster_id) {
            descr.status = status;
        }
    }

    fn set_config(&self, key: &str, value: &str) {
        self.state
            .lock()
            .unwrap()
            .configs
            .insert(key.to_string(), value.to_string());
    }

    fn document_write(&self, cluster_id: ClusterId) -> Result<(), DBError> {
        if self.fail_document_writes.load(Ordering::SeqCst) {
            Err(DBError::store_divergence(
                cluster_id,
                "document write refused".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Storage for MemStorage {
    async fn get_cluster(&self, cluster_id: ClusterId) -> Result<ClusterRecord, DBError> {
        self.state
            .lock()
            .unwrap()
            .records
            .get(&cluster_id)
            .cloned()
            .ok_or(DBError::UnknownCluster { cluster_id })
    }

    async fn get_cluster_definition(
        &self,
        cluster_id: ClusterId,
    ) -> Result<ClusterDescr, DBError> {
        self.state
            .lock()
            .unwrap()
            .documents
            .get(&cluster_id)
            .cloned()
            .ok_or(DBError::UnknownClusterDocument { cluster_id })
    }

    async fn list_clusters(&self) -> Result<Vec<ClusterRecord>, DBError> {
        Ok(self.state.lock().unwrap().records.values().cloned().collect())
    }

    async fn get_clusters(&self, cluster_ids: &[ClusterId]) -> Result<Vec<ClusterRecord>, DBError> {
        let state = self.state.lock().unwrap();
        Ok(cluster_ids
            .iter()
            .filter_map(|id| state.records.get(id).cloned())
            .collect())
    }

    async fn get_cluster_run_id(&self, cluster_id: ClusterId) -> Result<RunId, DBError> {
        self.get_cluster(cluster_id)
            .await?
            .active_run_id
            .ok_or(DBError::NoActiveRun { cluster_id })
    }

    async fn cluster_name_exists(&self, name: &str) -> Result<bool, DBError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .documents
            .values()
            .any(|d| d.name.eq_ignore_ascii_case(name)))
    }

    async fn cloud_environments(&self) -> Result<Vec<String>, DBError> {
        let mut envs: Vec<String> = self
            .state
            .lock()
            .unwrap()
            .documents
            .values()
            .map(|d| d.cloud_env.clone())
            .collect();
        envs.sort();
        envs.dedup();
        Ok(envs)
    }

    async fn create_cluster(
        &self,
        descr: &ClusterDescr,
        artifact_id: &ArtifactId,
    ) -> Result<(), DBError> {
        {
            let mut state = self.state.lock().unwrap();
            state.records.insert(
                descr.cluster_id,
                ClusterRecord {
                    id: descr.cluster_id,
                    name: descr.name.clone(),
                    artifact_id: Some(*artifact_id),
                    status: ClusterStatus::Inactive,
                    active_run_id: None,
                    active_pods: 0,
                    available_memory: 0,
                    created_at: descr.created_on,
                    last_updated_at: descr.created_on,
                    last_used_at: descr.created_on,
                },
            );
        }
        self.document_write(descr.cluster_id)?;
        self.state
            .lock()
            .unwrap()
            .documents
            .insert(descr.cluster_id, descr.clone());
        Ok(())
    }

    async fn update_cluster(
        &self,
        descr: &ClusterDescr,
        artifact_id: &ArtifactId,
    ) -> Result<(), DBError> {
        {
            let mut state = self.state.lock().unwrap();
            let record = state
                .records
                .get_mut(&descr.cluster_id)
                .ok_or(DBError::UnknownCluster {
                    cluster_id: descr.cluster_id,
                })?;
            record.name = descr.name.clone();
            record.artifact_id = Some(*artifact_id);
            record.last_updated_at = Utc::now();
        }
        self.document_write(descr.cluster_id)?;
        self.state
            .lock()
            .unwrap()
            .documents
            .insert(descr.cluster_id, descr.clone());
        Ok(())
    }

    async fn start_cluster(&self, cluster_id: ClusterId, run_id: RunId) -> Result<(), DBError> {
        {
            let mut state = self.state.lock().unwrap();
            let record = state
                .records
                .get_mut(&cluster_id)
                .ok_or(DBError::UnknownCluster { cluster_id })?;
            record.status = ClusterStatus::Creating;
            record.active_run_id = Some(run_id);
            record.last_updated_at = Utc::now();
            record.last_used_at = record.last_updated_at;
        }
        self.document_write(cluster_id)?;
        let mut state = self.state.lock().unwrap();
        if let Some(descr) = state.documents.get_mut(&cluster_id) {
            descr.status = ClusterStatus::Creating;
        }
        Ok(())
    }

    async fn stop_cluster(&self, cluster_id: ClusterId) -> Result<(), DBError> {
        {
            let mut state = self.state.lock().unwrap();
            let record = state
                .records
                .get_mut(&cluster_id)
                .ok_or(DBError::UnknownCluster { cluster_id })?;
            record.status = ClusterStatus::Inactive;
            record.active_pods = 0;
            record.available_memory = 0;
            record.last_updated_at = Utc::now();
        }
        self.document_write(cluster_id)?;
        let mut state = self.state.lock().unwrap();
        if let Some(descr) = state.documents.get_mut(&cluster_id) {
            descr.status = ClusterStatus::Inactive;
            descr.active_pods = 0;
            descr.available_memory = 0;
        }
        Ok(())
    }

    async fn restart_cluster(&self, cluster_id: ClusterId) -> Result<(), DBError> {
        {
            let mut state = self.state.lock().unwrap();
            let record = state
                .records
                .get_mut(&cluster_id)
                .ok_or(DBError::UnknownCluster { cluster_id })?;
            record.status = ClusterStatus::Creating;
            record.last_updated_at = Utc::now();
        }
        self.document_write(cluster_id)?;
        let mut state = self.state.lock().unwrap();
        if let Some(descr) = state.documents.get_mut(&cluster_id) {
            descr.status = ClusterStatus::Creating;
        }
        Ok(())
    }

    async fn update_status(
        &self,
        cluster_id: ClusterId,
        status: ClusterStatus,
        active_pods: i64,
        available_memory: i64,
        last_observed_at: Option<DateTime<Utc>>,
    ) -> Result<StatusUpdate, DBError> {
        {
            let mut state = self.state.lock().unwrap();
            let record = state
                .records
                .get_mut(&cluster_id)
                .ok_or(DBError::UnknownCluster { cluster_id })?;
            if let Some(observed_at) = last_observed_at {
                if record.last_updated_at > observed_at {
                    return Ok(StatusUpdate::Skipped);
                }
            }
            record.status = status;
            record.active_pods = active_pods;
            record.available_memory = available_memory;
            record.last_updated_at = Utc::now();
        }
        self.document_write(cluster_id)?;
        let mut state = self.state.lock().unwrap();
        if let Some(descr) = state.documents.get_mut(&cluster_id) {
            descr.status = status;
            descr.active_pods = active_pods;
            descr.available_memory = available_memory;
        }
        Ok(StatusUpdate::Updated)
    }

    async fn rename_cluster(&self, cluster_id: ClusterId, name: &str) -> Result<(), DBError> {
        let mut state = self.state.lock().unwrap();
        let record = state
            .records
            .get_mut(&cluster_id)
            .ok_or(DBError::UnknownCluster { cluster_id })?;
        record.name = name.to_string();
        record.last_updated_at = Utc::now();
        if let Some(descr) = state.documents.get_mut(&cluster_id) {
            descr.name = name.to_string();
        }
        Ok(())
    }

    async fn update_cluster_user(&self, cluster_id: ClusterId, user: &str) -> Result<(), DBError> {
        let mut state = self.state.lock().unwrap();
        let descr = state
            .documents
            .get_mut(&cluster_id)
            .ok_or(DBError::UnknownClusterDocument { cluster_id })?;
        descr.user = user.to_string();
        Ok(())
    }

    async fn update_cluster_tags(
        &self,
        cluster_id: ClusterId,
        tags: Vec<String>,
    ) -> Result<(), DBError> {
        let mut state = self.state.lock().unwrap();
        let descr = state
            .documents
            .get_mut(&cluster_id)
            .ok_or(DBError::UnknownClusterDocument { cluster_id })?;
        descr.tags = tags;
        Ok(())
    }

    async fn touch_last_used(&self, cluster_id: ClusterId) -> Result<(), DBError> {
        let mut state = self.state.lock().unwrap();
        let record = state
            .records
            .get_mut(&cluster_id)
            .ok_or(DBError::UnknownCluster { cluster_id })?;
        record.last_used_at = Utc::now();
        Ok(())
    }

    async fn delete_cluster(&self, cluster_id: ClusterId) -> Result<(), DBError> {
        {
            let mut state = self.state.lock().unwrap();
            state
                .records
                .remove(&cluster_id)
                .ok_or(DBError::UnknownCluster { cluster_id })?;
            for visit in state.visits.iter_mut() {
                if visit.1 == cluster_id {
                    visit.3 = true;
                }
            }
        }
        self.document_write(cluster_id)?;
        self.state.lock().unwrap().documents.remove(&cluster_id);
        Ok(())
    }

    async fn insert_action(
        &self,
        cluster_id: ClusterId,
        run_id: Option<RunId>,
        artifact_id: Option<&ArtifactId>,
        kind: ActionKind,
        message: &str,
    ) -> Result<(), DBError> {
        self.state.lock().unwrap().actions.push(ClusterAction {
            run_id,
            cluster_id,
            artifact_id: artifact_id.map(|a| a.to_string()),
            kind,
            message: message.to_string(),
            recorded_at: Utc::now(),
        });
        Ok(())
    }

    async fn actions_for_run(&self, run_id: RunId) -> Result<Vec<ClusterAction>, DBError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .actions
            .iter()
            .filter(|a| a.run_id == Some(run_id))
            .cloned()
            .collect())
    }

    async fn run_groups(
        &self,
        cluster_id: ClusterId,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<RunGroup>, DBError> {
        let state = self.state.lock().unwrap();
        let mut groups: HashMap<RunId, RunGroup> = HashMap::new();
        for action in state.actions.iter().filter(|a| a.cluster_id == cluster_id) {
            let Some(run_id) = action.run_id else {
                continue;
            };
            let group = groups.entry(run_id).or_insert(RunGroup {
                run_id,
                first_recorded_at: action.recorded_at,
                last_recorded_at: action.recorded_at,
                num_actions: 0,
            });
            group.first_recorded_at = group.first_recorded_at.min(action.recorded_at);
            group.last_recorded_at = group.last_recorded_at.max(action.recorded_at);
            group.num_actions += 1;
        }
        let mut groups: Vec<RunGroup> = groups.into_values().collect();
        groups.sort_by(|a, b| b.last_recorded_at.cmp(&a.last_recorded_at));
        Ok(groups
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn first_and_last_action(
        &self,
        run_id: RunId,
    ) -> Result<(ClusterAction, ClusterAction), DBError> {
        let actions = self.actions_for_run(run_id).await?;
        match (actions.first(), actions.last()) {
            (Some(first), Some(last)) => Ok((first.clone(), last.clone())),
            _ => Err(DBError::UnknownRun { run_id }),
        }
    }

    async fn latest_action_of_kind(
        &self,
        cluster_id: ClusterId,
        kind: ActionKind,
    ) -> Result<Option<ClusterAction>, DBError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .actions
            .iter()
            .rev()
            .find(|a| a.cluster_id == cluster_id && a.kind == kind)
            .cloned())
    }

    async fn clusters_running_longer_than(
        &self,
        _minutes: i32,
    ) -> Result<Vec<LongRunningCluster>, DBError> {
        Ok(vec![])
    }

    async fn clusters_last_used_before(
        &self,
        _days: i32,
        _cluster_ids: &[ClusterId],
    ) -> Result<Vec<ClusterRecord>, DBError> {
        Ok(vec![])
    }

    async fn get_config(&self, config_key: &str) -> Result<String, DBError> {
        self.state
            .lock()
            .unwrap()
            .configs
            .get(config_key)
            .cloned()
            .ok_or_else(|| DBError::UnknownConfig {
                config_key: config_key.to_string(),
            })
    }

    async fn maybe_get_config(&self, config_key: &str) -> Result<Option<String>, DBError> {
        Ok(self.state.lock().unwrap().configs.get(config_key).cloned())
    }

    async fn create_config(&self, config_key: &str, value: &str) -> Result<(), DBError> {
        self.set_config(config_key, value);
        Ok(())
    }

    async fn update_config(&self, config_key: &str, value: &str) -> Result<(), DBError> {
        self.set_config(config_key, value);
        Ok(())
    }

    async fn add_recent_visit(
        &self,
        user_id: &str,
        cluster_id: ClusterId,
    ) -> Result<(), DBError> {
        self.state
            .lock()
            .unwrap()
            .visits
            .push((user_id.to_string(), cluster_id, Utc::now(), false));
        Ok(())
    }

    async fn recent_visits(&self, user_id: &str) -> Result<Vec<ClusterRecord>, DBError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .visits
            .iter()
            .rev()
            .filter(|(u, _, _, deleted)| u == user_id && !deleted)
            .take(3)
            .filter_map(|(_, id, _, _)| state.records.get(id).cloned())
            .collect())
    }
}

/// Provisioner double which records the calls it accepted and can be
/// switched to reject everything.
#[derive(Default)]
struct MemProvisioner {
    calls: Mutex<Vec<String>>,
    fail: AtomicBool,
}

impl MemProvisioner {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn check(&self, call: &str) -> Result<(), ProvisionerError> {
        if self.fail.load(Ordering::SeqCst) {
            Err(ProvisionerError::Rejected {
                status: 500,
                body: "provisioner down".to_string(),
            })
        } else {
            self.calls.lock().unwrap().push(call.to_string());
            Ok(())
        }
    }
}

#[async_trait]
impl Provisioner for MemProvisioner {
    async fn create_cluster(
        &self,
        _descr: &ClusterDescr,
        _artifact: &ArtifactId,
        _target: &ProvisionTarget,
    ) -> Result<(), ProvisionerError> {
        self.check("create")
    }

    async fn update_cluster(
        &self,
        _descr: &ClusterDescr,
        _artifact: &ArtifactId,
        _target: &ProvisionTarget,
        _remote_commands: &[RemoteCommand],
    ) -> Result<(), ProvisionerError> {
        self.check("update")
    }

    async fn start_cluster(
        &self,
        _cluster_name: &str,
        _artifact: &ArtifactId,
        _target: &ProvisionTarget,
    ) -> Result<(), ProvisionerError> {
        self.check("start")
    }

    async fn stop_cluster(
        &self,
        _cluster_name: &str,
        _target: &ProvisionTarget,
    ) -> Result<(), ProvisionerError> {
        self.check("stop")
    }

    async fn restart_cluster(
        &self,
        _cluster_name: &str,
        _artifact: &ArtifactId,
        _target: &ProvisionTarget,
    ) -> Result<(), ProvisionerError> {
        self.check("restart")
    }

    async fn cluster_status(
        &self,
        _cluster_name: &str,
        _target: &ProvisionTarget,
    ) -> Result<ProvisionedStatus, ProvisionerError> {
        self.check("status")?;
        Ok(ProvisionedStatus {
            status: "running".to_string(),
            active_pods: 1,
            available_memory: 8,
        })
    }
}

/// Audit sink double which records events and can be switched to fail.
#[derive(Default)]
struct MemAuditSink {
    events: Mutex<Vec<LifecycleEvent>>,
    fail: AtomicBool,
}

impl MemAuditSink {
    fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().unwrap().clone()
    }

    fn event_types(&self) -> Vec<LifecycleEventType> {
        self.events().iter().map(|e| e.event_type).collect()
    }

    fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

#[async_trait]
impl AuditSink for MemAuditSink {
    async fn send(&self, event: &LifecycleEvent) -> Result<(), AuditError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(AuditError::Unreachable {
                error: "sink down".to_string(),
            });
        }
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

fn test_config() -> ClusterManagerConfig {
    ClusterManagerConfig {
        document_store_url: "http://localhost:9200".to_string(),
        document_index: "clusters".to_string(),
        provisioner_url: "http://localhost:8090".to_string(),
        audit_url: None,
        default_namespace: "compute".to_string(),
        default_cloud_env: "primary".to_string(),
        default_kube_cluster: "kube-primary".to_string(),
        kube_cluster_map: vec!["gcp-east=kube-east-1".to_string()],
        http_timeout_secs: 5,
    }
}

struct Fixture {
    orchestrator: ClusterOrchestrator,
    db: Arc<MemStorage>,
    provisioner: Arc<MemProvisioner>,
    audit: Arc<MemAuditSink>,
}

fn fixture() -> Fixture {
    let db = Arc::new(MemStorage::default());
    let provisioner = Arc::new(MemProvisioner::default());
    let audit = Arc::new(MemAuditSink::default());
    let orchestrator = ClusterOrchestrator::new(
        test_config(),
        db.clone(),
        provisioner.clone(),
        AuditEmitter::new(audit.clone()),
    );
    Fixture {
        orchestrator,
        db,
        provisioner,
        audit,
    }
}

fn spec(name: &str) -> ClusterSpec {
    ClusterSpec {
        name: name.to_string(),
        cloud_env: None,
        user: "owner@example.com".to_string(),
        runtime: "standard-3.2".to_string(),
        is_job_cluster: false,
        tags: vec![],
        extra: Map::new(),
    }
}

fn version_of(record: &ClusterRecord) -> i64 {
    ArtifactId::version_or_default(&record.artifact_id)
}

#[tokio::test]
async fn create_starts_at_version_one_and_brackets_events() {
    let f = fixture();
    let descr = f.orchestrator.create_cluster(spec("alpha")).await.unwrap();
    assert_eq!(descr.name, "alpha");
    assert_eq!(descr.status, ClusterStatus::Inactive);
    assert_eq!(descr.cloud_env, "primary");

    let record = f.db.record(descr.cluster_id);
    assert_eq!(version_of(&record), 1);
    assert_eq!(record.status, ClusterStatus::Inactive);
    assert_eq!(f.provisioner.calls(), vec!["create"]);
    assert_eq!(
        f.audit.event_types(),
        vec![
            LifecycleEventType::ClusterCreationRequestReceived,
            LifecycleEventType::ClusterCreated,
        ]
    );
}

#[tokio::test]
async fn create_suffixes_colliding_name_instead_of_failing() {
    let f = fixture();
    let first = f.orchestrator.create_cluster(spec("alpha")).await.unwrap();
    let second = f.orchestrator.create_cluster(spec("ALPHA")).await.unwrap();
    assert_eq!(first.name, "alpha");
    assert_eq!(second.name, format!("ALPHA_{}", second.cluster_id));
    assert_ne!(first.cluster_id, second.cluster_id);
}

#[tokio::test]
async fn create_resolves_cloud_env_with_precedence() {
    let f = fixture();
    f.db.set_config("default_cloud_env", "aws-west");
    f.db.set_config("job_default_cloud_env", "aws-batch");

    let mut explicit = spec("explicit");
    explicit.cloud_env = Some("gcp-east".to_string());
    let descr = f.orchestrator.create_cluster(explicit).await.unwrap();
    assert_eq!(descr.cloud_env, "gcp-east");

    let descr = f.orchestrator.create_cluster(spec("typed")).await.unwrap();
    assert_eq!(descr.cloud_env, "aws-west");

    let mut job = spec("job");
    job.is_job_cluster = true;
    let descr = f.orchestrator.create_cluster(job).await.unwrap();
    assert_eq!(descr.cloud_env, "aws-batch");
}

#[tokio::test]
async fn create_failure_emits_failure_event_and_writes_nothing() {
    let f = fixture();
    f.provisioner.fail.store(true, Ordering::SeqCst);
    let result = f.orchestrator.create_cluster(spec("alpha")).await;
    assert!(matches!(
        result,
        Err(ManagerError::Provisioner {
            error: ProvisionerError::Rejected { .. }
        })
    ));
    assert!(f.db.state.lock().unwrap().records.is_empty());
    assert_eq!(
        f.audit.event_types(),
        vec![
            LifecycleEventType::ClusterCreationRequestReceived,
            LifecycleEventType::ClusterCreationFailed,
        ]
    );
    let failure = &f.audit.events()[1];
    assert!(failure.message.contains("provisioner down"));
}

#[tokio::test]
async fn update_bumps_version_and_preserves_identity_fields() {
    let f = fixture();
    let created = f.orchestrator.create_cluster(spec("alpha")).await.unwrap();

    let mut request = spec("alpha-2");
    request.user = "intruder@example.com".to_string();
    request.runtime = "standard-3.3".to_string();
    let updated = f
        .orchestrator
        .update_cluster(created.cluster_id, request)
        .await
        .unwrap();

    assert_eq!(updated.name, "alpha-2");
    assert_eq!(updated.runtime, "standard-3.3");
    // Ownership and creation time survive any update request.
    assert_eq!(updated.user, "owner@example.com");
    assert_eq!(updated.created_on, created.created_on);

    let record = f.db.record(created.cluster_id);
    assert_eq!(version_of(&record), 2);
    assert_eq!(record.name, "alpha-2");
}

#[tokio::test]
async fn update_events_carry_user_request_and_diff() {
    let f = fixture();
    let created = f.orchestrator.create_cluster(spec("alpha")).await.unwrap();
    f.audit.clear();

    let mut request = spec("alpha-2");
    request.user = "editor@example.com".to_string();
    request.runtime = "standard-3.3".to_string();
    f.orchestrator
        .update_cluster(created.cluster_id, request)
        .await
        .unwrap();

    let events = f.audit.events();
    assert_eq!(events.len(), 2);
    for event in &events {
        // The submitting user, not the preserved owner of the document.
        assert_eq!(event.metadata["user"], serde_json::json!("editor@example.com"));
        assert_eq!(event.metadata["request"]["name"], serde_json::json!("alpha-2"));
        let diff = event.metadata["diff"].as_object().unwrap();
        assert_eq!(diff["name"], serde_json::json!("alpha-2"));
        assert_eq!(diff["runtime"], serde_json::json!("standard-3.3"));
        assert!(!diff.contains_key("created_on"));
    }
    assert_eq!(events[0].metadata, events[1].metadata);
}

#[tokio::test]
async fn failed_update_does_not_burn_a_version() {
    let f = fixture();
    let created = f.orchestrator.create_cluster(spec("alpha")).await.unwrap();
    f.audit.clear();

    f.provisioner.fail.store(true, Ordering::SeqCst);
    let result = f
        .orchestrator
        .update_cluster(created.cluster_id, spec("alpha-2"))
        .await;
    assert!(result.is_err());

    // Neither store changed and the version was not consumed.
    let record = f.db.record(created.cluster_id);
    assert_eq!(version_of(&record), 1);
    assert_eq!(record.name, "alpha");
    assert_eq!(f.db.document(created.cluster_id).name, "alpha");
    assert_eq!(
        f.audit.event_types(),
        vec![
            LifecycleEventType::ClusterUpdationRequestReceived,
            LifecycleEventType::ClusterUpdationFailed,
        ]
    );

    // The next successful update picks up where the counter left off.
    f.provisioner.fail.store(false, Ordering::SeqCst);
    f.orchestrator
        .update_cluster(created.cluster_id, spec("alpha-2"))
        .await
        .unwrap();
    assert_eq!(version_of(&f.db.record(created.cluster_id)), 2);
}

#[tokio::test]
async fn force_update_reuses_stored_definition() {
    let f = fixture();
    let created = f.orchestrator.create_cluster(spec("alpha")).await.unwrap();
    let commands = vec![RemoteCommand {
        command: "refresh-artifact".to_string(),
        target: "driver".to_string(),
    }];
    let updated = f
        .orchestrator
        .force_update_cluster(created.cluster_id, &commands)
        .await
        .unwrap();
    assert_eq!(updated.name, "alpha");
    assert_eq!(version_of(&f.db.record(created.cluster_id)), 2);
    assert_eq!(f.provisioner.calls(), vec!["create", "update"]);
}

#[tokio::test]
async fn divergence_surfaces_as_typed_error_with_relational_half_applied() {
    let f = fixture();
    let created = f.orchestrator.create_cluster(spec("alpha")).await.unwrap();
    f.audit.clear();

    f.db.fail_document_writes.store(true, Ordering::SeqCst);
    let result = f
        .orchestrator
        .update_cluster(created.cluster_id, spec("alpha-2"))
        .await;
    assert!(matches!(
        result,
        Err(ManagerError::Db {
            error: DBError::StoreDivergence { .. }
        })
    ));
    // Partially applied by design: the relational write committed.
    let record = f.db.record(created.cluster_id);
    assert_eq!(record.name, "alpha-2");
    assert_eq!(version_of(&record), 2);
    assert_eq!(f.db.document(created.cluster_id).name, "alpha");
    assert_eq!(
        f.audit.event_types()[1],
        LifecycleEventType::ClusterUpdationFailed
    );
}

#[tokio::test]
async fn migrate_to_current_env_is_a_complete_noop() {
    let f = fixture();
    let created = f.orchestrator.create_cluster(spec("alpha")).await.unwrap();
    f.audit.clear();

    let outcome = f
        .orchestrator
        .migrate_cloud_env(created.cluster_id, "primary")
        .await
        .unwrap();
    assert!(outcome.is_none());
    assert_eq!(version_of(&f.db.record(created.cluster_id)), 1);
    assert!(f.audit.events().is_empty());
}

#[tokio::test]
async fn migrate_requires_inactive_cluster() {
    let f = fixture();
    let created = f.orchestrator.create_cluster(spec("alpha")).await.unwrap();
    f.db.set_status(created.cluster_id, ClusterStatus::Active);

    let result = f
        .orchestrator
        .migrate_cloud_env(created.cluster_id, "gcp-east")
        .await;
    match result {
        Err(ManagerError::Db {
            error:
                DBError::InvalidClusterState {
                    expected, actual, ..
                },
        }) => {
            assert_eq!(expected, ClusterStatus::Inactive);
            assert_eq!(actual, ClusterStatus::Active);
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(version_of(&f.db.record(created.cluster_id)), 1);
}

#[tokio::test]
async fn migrate_swaps_env_tag_and_bumps_version() {
    let f = fixture();
    let mut request = spec("alpha");
    request.tags = vec!["primary".to_string(), "team-data".to_string()];
    let created = f.orchestrator.create_cluster(request).await.unwrap();

    let migrated = f
        .orchestrator
        .migrate_cloud_env(created.cluster_id, "gcp-east")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(migrated.cloud_env, "gcp-east");
    assert_eq!(migrated.tags, vec!["gcp-east", "team-data"]);
    assert_eq!(version_of(&f.db.record(created.cluster_id)), 2);
    // The new definition is pushed to the provisioner like any other update.
    assert_eq!(f.provisioner.calls(), vec!["create", "update"]);
}

#[tokio::test]
async fn migrate_records_updating_action_under_retained_run() {
    let f = fixture();
    let created = f.orchestrator.create_cluster(spec("alpha")).await.unwrap();
    let run_id = f.orchestrator.start_cluster(created.cluster_id).await.unwrap();
    // Stopping keeps the run id, so the migration below happens on an
    // inactive cluster that still remembers its last run.
    f.orchestrator.stop_cluster(created.cluster_id).await.unwrap();

    f.orchestrator
        .migrate_cloud_env(created.cluster_id, "gcp-east")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        f.provisioner.calls(),
        vec!["create", "start", "stop", "update"]
    );
    let updating = f
        .db
        .actions()
        .into_iter()
        .find(|a| a.kind == ActionKind::Updating)
        .unwrap();
    assert_eq!(updating.run_id, Some(run_id));
    assert_eq!(
        updating.artifact_id,
        Some(format!("{}-v2", created.cluster_id))
    );
}

#[tokio::test]
async fn migrate_of_active_cluster_fails_even_for_current_env() {
    let f = fixture();
    let created = f.orchestrator.create_cluster(spec("alpha")).await.unwrap();
    f.db.set_status(created.cluster_id, ClusterStatus::Active);
    f.audit.clear();

    // The status precondition is checked before anything else, including the
    // already-in-this-environment short circuit.
    let result = f
        .orchestrator
        .migrate_cloud_env(created.cluster_id, "primary")
        .await;
    assert!(matches!(
        result,
        Err(ManagerError::Db {
            error: DBError::InvalidClusterState { .. }
        })
    ));
    assert!(f.audit.events().is_empty());
}

#[tokio::test]
async fn start_assigns_fresh_run_without_touching_version() {
    let f = fixture();
    let created = f.orchestrator.create_cluster(spec("alpha")).await.unwrap();
    f.audit.clear();

    let run_id = f.orchestrator.start_cluster(created.cluster_id).await.unwrap();
    let record = f.db.record(created.cluster_id);
    assert_eq!(record.status, ClusterStatus::Creating);
    assert_eq!(record.active_run_id, Some(run_id));
    assert_eq!(version_of(&record), 1);
    assert_eq!(
        f.audit.event_types(),
        vec![
            LifecycleEventType::ClusterStartRequestReceived,
            LifecycleEventType::ClusterStarted,
        ]
    );

    let actions = f.db.actions();
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].kind, ActionKind::Started);
    assert_eq!(actions[0].run_id, Some(run_id));

    // A second start gets its own run id.
    let second_run = f.orchestrator.start_cluster(created.cluster_id).await.unwrap();
    assert_ne!(second_run, run_id);
}

#[tokio::test]
async fn stop_zeroes_counters_and_attributes_action_to_run() {
    let f = fixture();
    let created = f.orchestrator.create_cluster(spec("alpha")).await.unwrap();
    let run_id = f.orchestrator.start_cluster(created.cluster_id).await.unwrap();
    f.orchestrator
        .update_status(created.cluster_id, ClusterStatus::Active, 4, 64, None)
        .await
        .unwrap();

    f.orchestrator.stop_cluster(created.cluster_id).await.unwrap();
    let record = f.db.record(created.cluster_id);
    assert_eq!(record.status, ClusterStatus::Inactive);
    assert_eq!(record.active_pods, 0);
    assert_eq!(record.available_memory, 0);
    let descr = f.db.document(created.cluster_id);
    assert_eq!(descr.active_pods, 0);
    assert_eq!(descr.available_memory, 0);

    let stopped = f
        .db
        .actions()
        .into_iter()
        .find(|a| a.kind == ActionKind::Stopped)
        .unwrap();
    assert_eq!(stopped.run_id, Some(run_id));
}

#[tokio::test]
async fn restart_keeps_run_and_version() {
    let f = fixture();
    let created = f.orchestrator.create_cluster(spec("alpha")).await.unwrap();
    let run_id = f.orchestrator.start_cluster(created.cluster_id).await.unwrap();
    f.audit.clear();

    f.orchestrator.restart_cluster(created.cluster_id).await.unwrap();
    let record = f.db.record(created.cluster_id);
    assert_eq!(record.status, ClusterStatus::Creating);
    assert_eq!(record.active_run_id, Some(run_id));
    assert_eq!(version_of(&record), 1);
    assert_eq!(
        f.audit.event_types(),
        vec![
            LifecycleEventType::ClusterRestartRequestReceived,
            LifecycleEventType::ClusterRestarted,
        ]
    );
    let restarting = f
        .db
        .actions()
        .into_iter()
        .find(|a| a.kind == ActionKind::Restarting)
        .unwrap();
    assert_eq!(restarting.run_id, Some(run_id));
}

#[tokio::test]
async fn update_and_apply_updates_then_starts() {
    let f = fixture();
    let created = f.orchestrator.create_cluster(spec("alpha")).await.unwrap();
    let run_id = f
        .orchestrator
        .update_and_apply(created.cluster_id, spec("alpha-2"))
        .await
        .unwrap();
    let record = f.db.record(created.cluster_id);
    assert_eq!(version_of(&record), 2);
    assert_eq!(record.active_run_id, Some(run_id));
    assert_eq!(record.status, ClusterStatus::Creating);
    assert_eq!(f.provisioner.calls(), vec!["create", "update", "start"]);
}

#[tokio::test]
async fn delete_requires_inactive_cluster() {
    let f = fixture();
    let created = f.orchestrator.create_cluster(spec("alpha")).await.unwrap();
    f.orchestrator.start_cluster(created.cluster_id).await.unwrap();

    let result = f.orchestrator.delete_cluster(created.cluster_id).await;
    assert!(matches!(
        result,
        Err(ManagerError::Db {
            error: DBError::InvalidClusterState { .. }
        })
    ));
    assert!(f
        .db
        .state
        .lock()
        .unwrap()
        .records
        .contains_key(&created.cluster_id));
}

#[tokio::test]
async fn delete_removes_both_stores_and_visit_references() {
    let f = fixture();
    let created = f.orchestrator.create_cluster(spec("alpha")).await.unwrap();
    f.orchestrator
        .add_recent_visit("owner@example.com", created.cluster_id)
        .await
        .unwrap();
    f.audit.clear();

    f.orchestrator.delete_cluster(created.cluster_id).await.unwrap();
    let state = f.db.state.lock().unwrap();
    assert!(!state.records.contains_key(&created.cluster_id));
    assert!(!state.documents.contains_key(&created.cluster_id));
    assert!(state.visits.iter().all(|(_, _, _, deleted)| *deleted));
    drop(state);
    assert_eq!(
        f.audit.event_types(),
        vec![
            LifecycleEventType::ClusterDeletionRequestReceived,
            LifecycleEventType::ClusterDeleted,
        ]
    );
    // Deleting holds no resources, so the provisioner is never involved.
    assert_eq!(f.provisioner.calls(), vec!["create"]);
}

#[tokio::test]
async fn stale_status_observation_is_skipped() {
    let f = fixture();
    let created = f.orchestrator.create_cluster(spec("alpha")).await.unwrap();
    f.orchestrator.start_cluster(created.cluster_id).await.unwrap();
    let before_start = created.created_on - chrono::Duration::seconds(10);

    let outcome = f
        .orchestrator
        .update_status(
            created.cluster_id,
            ClusterStatus::Died,
            0,
            0,
            Some(before_start),
        )
        .await
        .unwrap();
    assert_eq!(outcome, StatusUpdate::Skipped);
    // The stale observation wrote nothing.
    assert_eq!(f.db.record(created.cluster_id).status, ClusterStatus::Creating);

    let outcome = f
        .orchestrator
        .update_status(created.cluster_id, ClusterStatus::Active, 4, 64, None)
        .await
        .unwrap();
    assert_eq!(outcome, StatusUpdate::Updated);
    assert_eq!(f.db.record(created.cluster_id).status, ClusterStatus::Active);
}

#[tokio::test]
async fn rename_rejects_taken_name() {
    let f = fixture();
    f.orchestrator.create_cluster(spec("alpha")).await.unwrap();
    let other = f.orchestrator.create_cluster(spec("beta")).await.unwrap();

    let result = f.orchestrator.rename_cluster(other.cluster_id, "Alpha").await;
    assert!(matches!(
        result,
        Err(ManagerError::Db {
            error: DBError::DuplicateName
        })
    ));
    f.orchestrator
        .rename_cluster(other.cluster_id, "gamma")
        .await
        .unwrap();
    assert_eq!(f.db.record(other.cluster_id).name, "gamma");
}

#[tokio::test]
async fn update_user_validates_email_shape() {
    let f = fixture();
    let created = f.orchestrator.create_cluster(spec("alpha")).await.unwrap();
    for bad in ["plainaddress", "@no-local.com", "user@nodot", "a b@x.com"] {
        let result = f.orchestrator.update_user(created.cluster_id, bad).await;
        assert!(
            matches!(
                result,
                Err(ManagerError::Db {
                    error: DBError::InvalidUserEmail { .. }
                })
            ),
            "accepted {bad:?}"
        );
    }
    f.orchestrator
        .update_user(created.cluster_id, "new.owner@example.com")
        .await
        .unwrap();
    assert_eq!(f.db.document(created.cluster_id).user, "new.owner@example.com");
}

#[tokio::test]
async fn failing_audit_sink_never_fails_operations() {
    let f = fixture();
    f.audit.fail.store(true, Ordering::SeqCst);

    let created = f.orchestrator.create_cluster(spec("alpha")).await.unwrap();
    f.orchestrator.start_cluster(created.cluster_id).await.unwrap();
    f.orchestrator.stop_cluster(created.cluster_id).await.unwrap();
    f.orchestrator.delete_cluster(created.cluster_id).await.unwrap();
    assert!(f.audit.events().is_empty());
}

#[tokio::test]
async fn concurrent_updates_allocate_distinct_versions() {
    let f = fixture();
    let created = f.orchestrator.create_cluster(spec("alpha")).await.unwrap();
    let orchestrator = Arc::new(f.orchestrator);

    let mut handles = Vec::new();
    for i in 0..4 {
        let orchestrator = orchestrator.clone();
        let cluster_id = created.cluster_id;
        handles.push(tokio::spawn(async move {
            orchestrator
                .update_cluster(cluster_id, spec(&format!("alpha-{i}")))
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    // Four serialized updates on top of version 1.
    assert_eq!(version_of(&f.db.record(created.cluster_id)), 5);
}

#[tokio::test]
async fn recent_visits_returns_latest_clusters() {
    let f = fixture();
    let mut ids = Vec::new();
    for name in ["a", "b", "c", "d"] {
        let descr = f.orchestrator.create_cluster(spec(name)).await.unwrap();
        f.orchestrator
            .add_recent_visit("owner@example.com", descr.cluster_id)
            .await
            .unwrap();
        ids.push(descr.cluster_id);
    }
    let visited = f.orchestrator.recent_visits("owner@example.com").await.unwrap();
    let visited_ids: Vec<ClusterId> = visited.iter().map(|r| r.id).collect();
    assert_eq!(visited_ids, vec![ids[3], ids[2], ids[1]]);
}
