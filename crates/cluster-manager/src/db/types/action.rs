use crate::db::error::DBError;
use crate::db::types::cluster::{ClusterId, RunId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fmt::Display;

/// Kind of an action-log entry.
#[derive(Deserialize, Serialize, Eq, PartialEq, Debug, Clone, Copy)]
pub enum ActionKind {
    Started,
    Updating,
    Stopped,
    Restarting,
}

impl TryFrom<String> for ActionKind {
    type Error = DBError;
    fn try_from(value: String) -> Result<Self, DBError> {
        match value.as_str() {
            "started" => Ok(Self::Started),
            "updating" => Ok(Self::Updating),
            "stopped" => Ok(Self::Stopped),
            "restarting" => Ok(Self::Restarting),
            _ => Err(DBError::invalid_action_kind(value)),
        }
    }
}

impl From<ActionKind> for &'static str {
    fn from(val: ActionKind) -> Self {
        match val {
            ActionKind::Started => "started",
            ActionKind::Updating => "updating",
            ActionKind::Stopped => "stopped",
            ActionKind::Restarting => "restarting",
        }
    }
}

impl Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let kind: &'static str = (*self).into();
        write!(f, "{kind}")
    }
}

/// One entry of the append-only cluster action log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterAction {
    /// Run this action belongs to. `None` for actions recorded while the
    /// cluster had no active run (e.g. a stop after a died status report).
    pub run_id: Option<RunId>,
    pub cluster_id: ClusterId,
    pub artifact_id: Option<String>,
    pub kind: ActionKind,
    pub message: String,
    pub recorded_at: DateTime<Utc>,
}

/// A run id together with the timespan covered by its logged actions.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunGroup {
    pub run_id: RunId,
    pub first_recorded_at: DateTime<Utc>,
    pub last_recorded_at: DateTime<Utc>,
    pub num_actions: i64,
}

/// Maintenance projection: a cluster whose current run has exceeded a
/// running-time threshold.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LongRunningCluster {
    pub cluster_id: ClusterId,
    pub cluster_name: String,
    pub run_id: RunId,
    pub started_at: DateTime<Utc>,
}
