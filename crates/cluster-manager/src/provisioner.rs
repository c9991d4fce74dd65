use crate::db::types::artifact::ArtifactId;
use crate::db::types::cluster::ClusterDescr;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::error::Error as StdError;
use std::fmt;
use std::fmt::Display;
use std::time::Duration;

/// Errors reported by the provisioning service.
#[derive(Debug)]
pub enum ProvisionerError {
    /// The service could not be reached (transport failure, timeout).
    Unreachable { error: String },
    /// The service answered with a non-success status.
    Rejected { status: u16, body: String },
    /// The service answered but the payload could not be parsed.
    InvalidResponse { error: String },
}

impl ProvisionerError {
    fn unreachable(error: reqwest::Error) -> Self {
        Self::Unreachable {
            error: error.to_string(),
        }
    }
}

impl Display for ProvisionerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Unreachable { error } => {
                write!(f, "provisioner could not be reached: {error}")
            }
            Self::Rejected { status, body } => {
                write!(f, "provisioner rejected the request (status {status}): {body}")
            }
            Self::InvalidResponse { error } => {
                write!(f, "provisioner response could not be parsed: {error}")
            }
        }
    }
}

impl StdError for ProvisionerError {}

/// Where the provisioner should place (or find) the workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvisionTarget {
    /// Kubernetes namespace derived from the cluster's runtime.
    pub namespace: String,
    /// Kubernetes cluster serving the chosen cloud environment.
    pub kube_cluster: String,
}

/// A command executed inside the running pods as part of a forced update
/// (e.g. refreshing a mounted artifact without a full redeploy).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteCommand {
    pub command: String,
    /// Pod-selector label the command is addressed to.
    pub target: String,
}

/// Live resource figures reported by the provisioner for a running cluster.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProvisionedStatus {
    pub status: String,
    #[serde(default)]
    pub active_pods: i64,
    #[serde(default)]
    pub available_memory: i64,
}

/// Client interface of the provisioning service which owns the actual
/// compute resources. The engine only sequences calls to it; everything the
/// service does with Kubernetes is its own business.
#[async_trait]
pub trait Provisioner: Sync + Send {
    /// Registers the deployable artifact of a new cluster.
    async fn create_cluster(
        &self,
        descr: &ClusterDescr,
        artifact: &ArtifactId,
        target: &ProvisionTarget,
    ) -> Result<(), ProvisionerError>;

    /// Registers a new artifact version for an existing cluster, optionally
    /// running remote commands in currently live pods.
    async fn update_cluster(
        &self,
        descr: &ClusterDescr,
        artifact: &ArtifactId,
        target: &ProvisionTarget,
        remote_commands: &[RemoteCommand],
    ) -> Result<(), ProvisionerError>;

    /// Brings up the resources of a cluster from its artifact.
    async fn start_cluster(
        &self,
        cluster_name: &str,
        artifact: &ArtifactId,
        target: &ProvisionTarget,
    ) -> Result<(), ProvisionerError>;

    /// Tears down the resources of a cluster.
    async fn stop_cluster(
        &self,
        cluster_name: &str,
        target: &ProvisionTarget,
    ) -> Result<(), ProvisionerError>;

    /// Recreates the resources of a running cluster.
    async fn restart_cluster(
        &self,
        cluster_name: &str,
        artifact: &ArtifactId,
        target: &ProvisionTarget,
    ) -> Result<(), ProvisionerError>;

    /// Live status of a cluster's resources.
    async fn cluster_status(
        &self,
        cluster_name: &str,
        target: &ProvisionTarget,
    ) -> Result<ProvisionedStatus, ProvisionerError>;
}

/// HTTP client of the provisioning service.
pub struct HttpProvisioner {
    client: reqwest::Client,
    base_url: String,
}

impl HttpProvisioner {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ProvisionerError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(ProvisionerError::unreachable)?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/v1/cluster/{endpoint}", self.base_url)
    }

    async fn post(
        &self,
        endpoint: &str,
        body: serde_json::Value,
    ) -> Result<reqwest::Response, ProvisionerError> {
        let response = self
            .client
            .post(self.url(endpoint))
            .json(&body)
            .send()
            .await
            .map_err(ProvisionerError::unreachable)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProvisionerError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl Provisioner for HttpProvisioner {
    async fn create_cluster(
        &self,
        descr: &ClusterDescr,
        artifact: &ArtifactId,
        target: &ProvisionTarget,
    ) -> Result<(), ProvisionerError> {
        self.post(
            "create",
            json!({
                "cluster_name": descr.name,
                "artifact_name": artifact.to_string(),
                "definition": descr,
                "namespace": target.namespace,
                "kube_cluster": target.kube_cluster,
            }),
        )
        .await?;
        Ok(())
    }

    async fn update_cluster(
        &self,
        descr: &ClusterDescr,
        artifact: &ArtifactId,
        target: &ProvisionTarget,
        remote_commands: &[RemoteCommand],
    ) -> Result<(), ProvisionerError> {
        self.post(
            "update",
            json!({
                "cluster_name": descr.name,
                "artifact_name": artifact.to_string(),
                "definition": descr,
                "namespace": target.namespace,
                "kube_cluster": target.kube_cluster,
                "remote_commands": remote_commands,
            }),
        )
        .await?;
        Ok(())
    }

    async fn start_cluster(
        &self,
        cluster_name: &str,
        artifact: &ArtifactId,
        target: &ProvisionTarget,
    ) -> Result<(), ProvisionerError> {
        self.post(
            "start",
            json!({
                "cluster_name": cluster_name,
                "artifact_name": artifact.to_string(),
                "namespace": target.namespace,
                "kube_cluster": target.kube_cluster,
            }),
        )
        .await?;
        Ok(())
    }

    async fn stop_cluster(
        &self,
        cluster_name: &str,
        target: &ProvisionTarget,
    ) -> Result<(), ProvisionerError> {
        self.post(
            "stop",
            json!({
                "cluster_name": cluster_name,
                "namespace": target.namespace,
                "kube_cluster": target.kube_cluster,
            }),
        )
        .await?;
        Ok(())
    }

    async fn restart_cluster(
        &self,
        cluster_name: &str,
        artifact: &ArtifactId,
        target: &ProvisionTarget,
    ) -> Result<(), ProvisionerError> {
        self.post(
            "restart",
            json!({
                "cluster_name": cluster_name,
                "artifact_name": artifact.to_string(),
                "namespace": target.namespace,
                "kube_cluster": target.kube_cluster,
            }),
        )
        .await?;
        Ok(())
    }

    async fn cluster_status(
        &self,
        cluster_name: &str,
        target: &ProvisionTarget,
    ) -> Result<ProvisionedStatus, ProvisionerError> {
        let response = self
            .post(
                "status",
                json!({
                    "cluster_name": cluster_name,
                    "namespace": target.namespace,
                    "kube_cluster": target.kube_cluster,
                }),
            )
            .await?;
        response
            .json()
            .await
            .map_err(|e| ProvisionerError::InvalidResponse {
                error: e.to_string(),
            })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::db::types::cluster::ClusterId;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provisioner(server: &MockServer) -> HttpProvisioner {
        HttpProvisioner::new(&server.uri(), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn start_posts_artifact_and_target() {
        let server = MockServer::start().await;
        let artifact = ArtifactId::first(ClusterId::generate());
        Mock::given(method("POST"))
            .and(path("/v1/cluster/start"))
            .and(body_partial_json(serde_json::json!({
                "cluster_name": "alpha",
                "artifact_name": artifact.to_string(),
                "namespace": "compute",
                "kube_cluster": "kube-east-1",
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        let target = ProvisionTarget {
            namespace: "compute".to_string(),
            kube_cluster: "kube-east-1".to_string(),
        };
        provisioner(&server)
            .start_cluster("alpha", &artifact, &target)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn rejection_carries_status_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/cluster/stop"))
            .respond_with(ResponseTemplate::new(409).set_body_string("not running"))
            .mount(&server)
            .await;
        let target = ProvisionTarget {
            namespace: "compute".to_string(),
            kube_cluster: "kube-east-1".to_string(),
        };
        let result = provisioner(&server).stop_cluster("alpha", &target).await;
        match result {
            Err(ProvisionerError::Rejected { status, body }) => {
                assert_eq!(status, 409);
                assert_eq!(body, "not running");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn status_parses_resource_figures() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/cluster/status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "running",
                "active_pods": 4,
                "available_memory": 64,
            })))
            .mount(&server)
            .await;
        let target = ProvisionTarget {
            namespace: "compute".to_string(),
            kube_cluster: "kube-east-1".to_string(),
        };
        let status = provisioner(&server)
            .cluster_status("alpha", &target)
            .await
            .unwrap();
        assert_eq!(status.active_pods, 4);
        assert_eq!(status.available_memory, 64);
    }
}
