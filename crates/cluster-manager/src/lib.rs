//! Cluster lifecycle orchestration and dual-store consistency engine.
//!
//! Compute clusters live in two stores at once: a relational projection
//! (status, artifact version, active run, resource counters, timestamps)
//! that answers cheap status queries and gates state transitions, and a
//! document store holding the full cluster definition. The
//! [`orchestrator::ClusterOrchestrator`] sequences every lifecycle operation
//! against a provisioning service and keeps both stores in step, with a
//! relational-write-first ordering whose document-side failure surfaces as a
//! typed [`db::DBError::StoreDivergence`] outcome.
//!
//! Each definition change allocates the next version of the cluster's
//! deployable artifact (`{cluster_id}-v{N}`); start, stop and restart deploy
//! the current artifact without consuming a version. Every operation that
//! reaches the provisioner is bracketed by a pair of best-effort audit
//! events.

pub mod audit;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod provisioner;

pub use config::{ClusterManagerConfig, DatabaseConfig};
pub use error::ManagerError;
pub use orchestrator::ClusterOrchestrator;
