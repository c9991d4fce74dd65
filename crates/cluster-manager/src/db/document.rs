use crate::db::types::cluster::{ClusterDescr, ClusterId};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::error::Error as StdError;
use std::fmt;
use std::fmt::Display;
use std::time::Duration;

/// Errors of the document store client.
#[derive(Debug)]
pub enum DocumentError {
    NotFound {
        cluster_id: ClusterId,
    },
    /// Transport failure or a non-success response from the store.
    Http {
        error: String,
    },
    /// The stored document could not be deserialized.
    InvalidDocument {
        error: String,
    },
}

impl DocumentError {
    pub fn http(error: reqwest::Error) -> Self {
        Self::Http {
            error: error.to_string(),
        }
    }

    pub fn unexpected_response(status: reqwest::StatusCode, body: String) -> Self {
        Self::Http {
            error: format!("unexpected response (status {status}): {body}"),
        }
    }
}

impl Display for DocumentError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::NotFound { cluster_id } => {
                write!(f, "no document for cluster id '{cluster_id}'")
            }
            Self::Http { error } => {
                write!(f, "document store request failed: {error}")
            }
            Self::InvalidDocument { error } => {
                write!(f, "document could not be deserialized: {error}")
            }
        }
    }
}

impl StdError for DocumentError {}

/// Client interface of the document store which holds the full cluster
/// definition documents, keyed by cluster id.
#[async_trait]
pub trait DocumentStore: Sync + Send {
    /// Retrieves the definition document of a cluster.
    async fn get(&self, cluster_id: ClusterId) -> Result<ClusterDescr, DocumentError>;

    /// Writes (inserts or fully replaces) a definition document.
    async fn put(&self, descr: &ClusterDescr) -> Result<(), DocumentError>;

    /// Deletes a definition document. Deleting an absent document is not an
    /// error.
    async fn delete(&self, cluster_id: ClusterId) -> Result<(), DocumentError>;

    /// Whether any document carries the given name (case-insensitive).
    async fn name_exists(&self, name: &str) -> Result<bool, DocumentError>;

    /// Distinct values of a top-level string field across all documents.
    async fn distinct_values(&self, field: &str) -> Result<Vec<String>, DocumentError>;
}

/// Document store client speaking the Elasticsearch document API
/// (`_doc` for point operations, `_search` for queries).
pub struct HttpDocumentStore {
    client: reqwest::Client,
    base_url: String,
    index: String,
}

impl HttpDocumentStore {
    pub fn new(base_url: &str, index: &str, timeout: Duration) -> Result<Self, DocumentError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(DocumentError::http)?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            index: index.to_string(),
        })
    }

    fn doc_url(&self, cluster_id: ClusterId) -> String {
        format!("{}/{}/_doc/{cluster_id}", self.base_url, self.index)
    }

    fn search_url(&self) -> String {
        format!("{}/{}/_search", self.base_url, self.index)
    }
}

#[async_trait]
impl DocumentStore for HttpDocumentStore {
    async fn get(&self, cluster_id: ClusterId) -> Result<ClusterDescr, DocumentError> {
        let response = self
            .client
            .get(self.doc_url(cluster_id))
            .send()
            .await
            .map_err(DocumentError::http)?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(DocumentError::NotFound { cluster_id });
        }
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DocumentError::unexpected_response(status, body));
        }
        let envelope: Value = response.json().await.map_err(DocumentError::http)?;
        // Point reads come back wrapped: {"_id": ..., "found": true, "_source": {...}}
        let source = envelope
            .get("_source")
            .cloned()
            .ok_or_else(|| DocumentError::InvalidDocument {
                error: "response has no _source field".to_string(),
            })?;
        serde_json::from_value(source).map_err(|e| DocumentError::InvalidDocument {
            error: e.to_string(),
        })
    }

    async fn put(&self, descr: &ClusterDescr) -> Result<(), DocumentError> {
        let response = self
            .client
            .put(self.doc_url(descr.cluster_id))
            .json(descr)
            .send()
            .await
            .map_err(DocumentError::http)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DocumentError::unexpected_response(status, body));
        }
        Ok(())
    }

    async fn delete(&self, cluster_id: ClusterId) -> Result<(), DocumentError> {
        let response = self
            .client
            .delete(self.doc_url(cluster_id))
            .send()
            .await
            .map_err(DocumentError::http)?;
        let status = response.status();
        if !status.is_success() && status != reqwest::StatusCode::NOT_FOUND {
            let body = response.text().await.unwrap_or_default();
            return Err(DocumentError::unexpected_response(status, body));
        }
        Ok(())
    }

    async fn name_exists(&self, name: &str) -> Result<bool, DocumentError> {
        let query = json!({
            "size": 0,
            "query": {
                "term": {
                    "name.keyword": {
                        "value": name,
                        "case_insensitive": true
                    }
                }
            }
        });
        let response = self
            .client
            .post(self.search_url())
            .json(&query)
            .send()
            .await
            .map_err(DocumentError::http)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DocumentError::unexpected_response(status, body));
        }
        let body: Value = response.json().await.map_err(DocumentError::http)?;
        let total = body
            .pointer("/hits/total/value")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        Ok(total > 0)
    }

    async fn distinct_values(&self, field: &str) -> Result<Vec<String>, DocumentError> {
        let query = json!({
            "size": 0,
            "aggs": {
                "distinct": {
                    "terms": { "field": format!("{field}.keyword"), "size": 1000 }
                }
            }
        });
        let response = self
            .client
            .post(self.search_url())
            .json(&query)
            .send()
            .await
            .map_err(DocumentError::http)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DocumentError::unexpected_response(status, body));
        }
        let body: Value = response.json().await.map_err(DocumentError::http)?;
        let buckets = body
            .pointer("/aggregations/distinct/buckets")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(buckets
            .iter()
            .filter_map(|b| b.get("key").and_then(Value::as_str))
            .map(str::to_string)
            .collect())
    }
}
