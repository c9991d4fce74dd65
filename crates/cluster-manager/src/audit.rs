use crate::db::types::artifact::ArtifactId;
use crate::db::types::cluster::{ClusterId, RunId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::Serialize;
use serde_json::{Map, Value};
use std::error::Error as StdError;
use std::fmt;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Type of a cluster lifecycle audit event.
///
/// Every operation that reaches the provisioner emits exactly two events: a
/// `*RequestReceived` before the call and either the terminal success event
/// or the `*Failed` event afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(into = "&'static str")]
pub enum LifecycleEventType {
    ClusterCreationRequestReceived,
    ClusterCreated,
    ClusterCreationFailed,
    ClusterUpdationRequestReceived,
    ClusterUpdated,
    ClusterUpdationFailed,
    ClusterStartRequestReceived,
    ClusterStarted,
    ClusterStartFailed,
    ClusterStopRequestReceived,
    ClusterStopped,
    ClusterStopFailed,
    ClusterRestartRequestReceived,
    ClusterRestarted,
    ClusterRestartFailed,
    ClusterDeletionRequestReceived,
    ClusterDeleted,
    ClusterDeletionFailed,
}

impl From<LifecycleEventType> for &'static str {
    fn from(val: LifecycleEventType) -> Self {
        match val {
            LifecycleEventType::ClusterCreationRequestReceived => {
                "CLUSTER_CREATION_REQUEST_RECEIVED"
            }
            LifecycleEventType::ClusterCreated => "CLUSTER_CREATED",
            LifecycleEventType::ClusterCreationFailed => "CLUSTER_CREATION_FAILED",
            LifecycleEventType::ClusterUpdationRequestReceived => {
                "CLUSTER_UPDATION_REQUEST_RECEIVED"
            }
            LifecycleEventType::ClusterUpdated => "CLUSTER_UPDATED",
            LifecycleEventType::ClusterUpdationFailed => "CLUSTER_UPDATION_FAILED",
            LifecycleEventType::ClusterStartRequestReceived => "CLUSTER_START_REQUEST_RECEIVED",
            LifecycleEventType::ClusterStarted => "CLUSTER_STARTED",
            LifecycleEventType::ClusterStartFailed => "CLUSTER_START_FAILED",
            LifecycleEventType::ClusterStopRequestReceived => "CLUSTER_STOP_REQUEST_RECEIVED",
            LifecycleEventType::ClusterStopped => "CLUSTER_STOPPED",
            LifecycleEventType::ClusterStopFailed => "CLUSTER_STOP_FAILED",
            LifecycleEventType::ClusterRestartRequestReceived => {
                "CLUSTER_RESTART_REQUEST_RECEIVED"
            }
            LifecycleEventType::ClusterRestarted => "CLUSTER_RESTARTED",
            LifecycleEventType::ClusterRestartFailed => "CLUSTER_RESTART_FAILED",
            LifecycleEventType::ClusterDeletionRequestReceived => {
                "CLUSTER_DELETION_REQUEST_RECEIVED"
            }
            LifecycleEventType::ClusterDeleted => "CLUSTER_DELETED",
            LifecycleEventType::ClusterDeletionFailed => "CLUSTER_DELETION_FAILED",
        }
    }
}

impl Display for LifecycleEventType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let event_type: &'static str = (*self).into();
        write!(f, "{event_type}")
    }
}

/// One cluster lifecycle audit event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LifecycleEvent {
    pub event_id: Uuid,
    pub event_type: LifecycleEventType,
    pub cluster_id: ClusterId,
    pub cluster_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    pub message: String,
    pub metadata: Map<String, Value>,
    pub recorded_at: DateTime<Utc>,
}

impl LifecycleEvent {
    pub fn new(event_type: LifecycleEventType, cluster_id: ClusterId, cluster_name: &str) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            event_type,
            cluster_id,
            cluster_name: cluster_name.to_string(),
            artifact_id: None,
            run_id: None,
            message: String::new(),
            metadata: Map::new(),
            recorded_at: Utc::now(),
        }
    }

    pub fn with_artifact(mut self, artifact: &ArtifactId) -> Self {
        self.artifact_id = Some(artifact.to_string());
        self
    }

    pub fn with_run(mut self, run_id: RunId) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }
}

/// Errors of the audit sink. They are logged by the emitter and never reach
/// the caller of a lifecycle operation.
#[derive(Debug)]
pub enum AuditError {
    Unreachable { error: String },
    Rejected { status: u16, body: String },
}

impl Display for AuditError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Unreachable { error } => {
                write!(f, "audit pipeline could not be reached: {error}")
            }
            Self::Rejected { status, body } => {
                write!(f, "audit pipeline rejected the event (status {status}): {body}")
            }
        }
    }
}

impl StdError for AuditError {}

/// Destination of lifecycle events.
#[async_trait]
pub trait AuditSink: Sync + Send {
    async fn send(&self, event: &LifecycleEvent) -> Result<(), AuditError>;
}

/// Audit sink posting events to an HTTP collection endpoint.
pub struct HttpAuditSink {
    client: reqwest::Client,
    url: String,
}

impl HttpAuditSink {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, AuditError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AuditError::Unreachable {
                error: e.to_string(),
            })?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl AuditSink for HttpAuditSink {
    async fn send(&self, event: &LifecycleEvent) -> Result<(), AuditError> {
        let response = self
            .client
            .post(&self.url)
            .json(event)
            .send()
            .await
            .map_err(|e| AuditError::Unreachable {
                error: e.to_string(),
            })?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuditError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

/// Emits lifecycle events on a best-effort basis.
///
/// Auditing must never break a lifecycle operation: a sink failure is logged
/// and discarded. An emitter without a sink logs events at debug level only.
#[derive(Clone)]
pub struct AuditEmitter {
    sink: Option<Arc<dyn AuditSink>>,
}

impl AuditEmitter {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self { sink: Some(sink) }
    }

    pub fn disabled() -> Self {
        Self { sink: None }
    }

    pub async fn emit(&self, event: LifecycleEvent) {
        debug!(
            "Lifecycle event {} for cluster {} ({})",
            event.event_type, event.cluster_name, event.cluster_id
        );
        if let Some(sink) = &self.sink {
            if let Err(e) = sink.send(&event).await {
                warn!(
                    "Unable to emit lifecycle event {} for cluster {}: {e}",
                    event.event_type, event.cluster_id
                );
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn sink_posts_event_payload() {
        let server = MockServer::start().await;
        let cluster_id = ClusterId::generate();
        Mock::given(method("POST"))
            .and(path("/events"))
            .and(body_partial_json(serde_json::json!({
                "event_type": "CLUSTER_CREATED",
                "cluster_id": cluster_id.to_string(),
                "cluster_name": "alpha",
            })))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;
        let sink =
            HttpAuditSink::new(&format!("{}/events", server.uri()), Duration::from_secs(5))
                .unwrap();
        sink.send(&LifecycleEvent::new(
            LifecycleEventType::ClusterCreated,
            cluster_id,
            "alpha",
        ))
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn emitter_swallows_sink_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let sink =
            HttpAuditSink::new(&format!("{}/events", server.uri()), Duration::from_secs(5))
                .unwrap();
        let emitter = AuditEmitter::new(Arc::new(sink));
        // Must not panic or propagate anything.
        emitter
            .emit(LifecycleEvent::new(
                LifecycleEventType::ClusterStopped,
                ClusterId::generate(),
                "alpha",
            ))
            .await;
    }
}
