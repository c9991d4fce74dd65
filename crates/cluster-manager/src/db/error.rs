use crate::db::types::cluster::{ClusterId, ClusterStatus, RunId};
use deadpool_postgres::PoolError;
use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;
use std::fmt::Display;

/// Errors of the dual-store repository layer.
///
/// `StoreDivergence` is the one deliberate oddity: it reports a mutation whose
/// relational half committed but whose document half failed. The stores are
/// known to disagree at that point and the error carries enough context for an
/// operator to reconcile them; the relational write is never rolled back.
#[derive(Debug)]
pub enum DBError {
    #[allow(clippy::enum_variant_names)]
    PostgresError {
        error: Box<tokio_postgres::Error>,
        backtrace: Backtrace,
    },
    PostgresPoolError {
        error: Box<PoolError>,
        backtrace: Backtrace,
    },
    PostgresMigrationError {
        error: Box<refinery::Error>,
        backtrace: Backtrace,
    },
    PostgresPoolBuildError {
        error: String,
    },
    // Data conversion errors.
    InvalidClusterStatus {
        status: String,
    },
    InvalidActionKind {
        action: String,
    },
    InvalidArtifactId {
        artifact_id: String,
    },
    InvalidUserEmail {
        user: String,
    },
    // Domain errors.
    UniqueKeyViolation {
        constraint: &'static str,
    },
    DuplicateName,
    UnknownCluster {
        cluster_id: ClusterId,
    },
    UnknownClusterDocument {
        cluster_id: ClusterId,
    },
    UnknownConfig {
        config_key: String,
    },
    NoActiveRun {
        cluster_id: ClusterId,
    },
    UnknownRun {
        run_id: RunId,
    },
    InvalidClusterState {
        cluster_id: ClusterId,
        expected: ClusterStatus,
        actual: ClusterStatus,
    },
    // Dual-store errors.
    DocumentStoreError {
        error: String,
    },
    StoreDivergence {
        cluster_id: ClusterId,
        error: String,
    },
}

impl DBError {
    pub fn invalid_cluster_status(status: String) -> Self {
        Self::InvalidClusterStatus { status }
    }

    pub fn invalid_action_kind(action: String) -> Self {
        Self::InvalidActionKind { action }
    }

    pub fn invalid_artifact_id(artifact_id: String) -> Self {
        Self::InvalidArtifactId { artifact_id }
    }

    pub fn invalid_user_email(user: String) -> Self {
        Self::InvalidUserEmail { user }
    }

    pub fn unique_key_violation(constraint: &'static str) -> Self {
        Self::UniqueKeyViolation { constraint }
    }

    pub fn invalid_cluster_state(
        cluster_id: ClusterId,
        expected: ClusterStatus,
        actual: ClusterStatus,
    ) -> Self {
        Self::InvalidClusterState {
            cluster_id,
            expected,
            actual,
        }
    }

    pub fn store_divergence(cluster_id: ClusterId, error: String) -> Self {
        Self::StoreDivergence { cluster_id, error }
    }

    /// Whether the error indicates the cluster is absent from one of the
    /// stores rather than a failure of the stores themselves.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::UnknownCluster { .. }
                | Self::UnknownClusterDocument { .. }
                | Self::UnknownConfig { .. }
                | Self::NoActiveRun { .. }
                | Self::UnknownRun { .. }
        )
    }
}

impl From<tokio_postgres::Error> for DBError {
    fn from(error: tokio_postgres::Error) -> Self {
        Self::PostgresError {
            error: Box::new(error),
            backtrace: Backtrace::capture(),
        }
    }
}

impl From<PoolError> for DBError {
    fn from(error: PoolError) -> Self {
        Self::PostgresPoolError {
            error: Box::new(error),
            backtrace: Backtrace::capture(),
        }
    }
}

impl From<refinery::Error> for DBError {
    fn from(error: refinery::Error) -> Self {
        Self::PostgresMigrationError {
            error: Box::new(error),
            backtrace: Backtrace::capture(),
        }
    }
}

impl Display for DBError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::PostgresError { error, .. } => {
                write!(f, "Unexpected Postgres error: {error}")
            }
            Self::PostgresPoolError { error, .. } => {
                write!(f, "Postgres connection pool error: {error}")
            }
            Self::PostgresMigrationError { error, .. } => {
                write!(f, "Postgres migration error: {error}")
            }
            Self::PostgresPoolBuildError { error } => {
                write!(f, "Postgres connection pool could not be built: {error}")
            }
            Self::InvalidClusterStatus { status } => {
                write!(f, "String '{status}' is not a valid cluster status")
            }
            Self::InvalidActionKind { action } => {
                write!(f, "String '{action}' is not a valid action kind")
            }
            Self::InvalidArtifactId { artifact_id } => {
                write!(
                    f,
                    "String '{artifact_id}' is not a valid artifact identifier"
                )
            }
            Self::InvalidUserEmail { user } => {
                write!(f, "String '{user}' is not a valid user email address")
            }
            Self::UniqueKeyViolation { constraint } => {
                write!(f, "Unique key violation for '{constraint}'")
            }
            Self::DuplicateName => {
                write!(f, "Cannot use this name as another cluster already has it")
            }
            Self::UnknownCluster { cluster_id } => {
                write!(f, "Unknown cluster id '{cluster_id}'")
            }
            Self::UnknownClusterDocument { cluster_id } => {
                write!(
                    f,
                    "No definition document found for cluster id '{cluster_id}'"
                )
            }
            Self::UnknownConfig { config_key } => {
                write!(f, "Unknown config key '{config_key}'")
            }
            Self::NoActiveRun { cluster_id } => {
                write!(f, "Cluster '{cluster_id}' has no active run")
            }
            Self::UnknownRun { run_id } => {
                write!(f, "No actions were logged under run id '{run_id}'")
            }
            Self::InvalidClusterState {
                cluster_id,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "Cluster '{cluster_id}' is in state '{actual}' but the operation requires state '{expected}'"
                )
            }
            Self::DocumentStoreError { error } => {
                write!(f, "Document store error: {error}")
            }
            Self::StoreDivergence { cluster_id, error } => {
                write!(
                    f,
                    "Stores diverged for cluster '{cluster_id}': the relational write committed but the document write failed: {error}"
                )
            }
        }
    }
}

impl StdError for DBError {}
