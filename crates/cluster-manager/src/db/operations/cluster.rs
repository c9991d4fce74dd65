use crate::db::error::DBError;
use crate::db::operations::utils::maybe_unique_violation;
use crate::db::types::artifact::ArtifactId;
use crate::db::types::cluster::{
    ClusterId, ClusterRecord, ClusterStatus, RunId, StatusUpdate,
};
use chrono::{DateTime, Utc};
use deadpool_postgres::Transaction;
use tokio_postgres::Row;
use uuid::Uuid;

/// All columns of the denormalized cluster projection.
const RETRIEVE_CLUSTER_COLUMNS: &str = "c.cluster_id, c.cluster_name, c.artifact_id, c.status,
     c.active_cluster_runid, c.active_pods, c.available_memory,
     c.created_at, c.last_updated_at, c.last_used_at";

fn row_to_cluster_record(row: &Row) -> Result<ClusterRecord, DBError> {
    assert_eq!(row.len(), 10);
    Ok(ClusterRecord {
        id: ClusterId(row.get(0)),
        name: row.get(1),
        artifact_id: row
            .get::<_, Option<String>>(2)
            .map(ArtifactId::try_from)
            .transpose()?,
        status: row.get::<_, String>(3).try_into()?,
        active_run_id: row.get::<_, Option<Uuid>>(4).map(RunId),
        active_pods: row.get(5),
        available_memory: row.get(6),
        created_at: row.get(7),
        last_updated_at: row.get(8),
        last_used_at: row.get(9),
    })
}

/// Retrieve a specific cluster projection.
pub(crate) async fn get_cluster(
    txn: &Transaction<'_>,
    cluster_id: ClusterId,
) -> Result<ClusterRecord, DBError> {
    let stmt = txn
        .prepare_cached(&format!(
            "SELECT {RETRIEVE_CLUSTER_COLUMNS}
             FROM cluster_status AS c
             WHERE c.cluster_id = $1
            "
        ))
        .await?;
    let row = txn
        .query_opt(&stmt, &[&cluster_id.0])
        .await?
        .ok_or(DBError::UnknownCluster { cluster_id })?;
    row_to_cluster_record(&row)
}

/// Retrieve all cluster projections.
pub(crate) async fn list_clusters(txn: &Transaction<'_>) -> Result<Vec<ClusterRecord>, DBError> {
    let stmt = txn
        .prepare_cached(&format!(
            "SELECT {RETRIEVE_CLUSTER_COLUMNS}
             FROM cluster_status AS c
             ORDER BY c.created_at DESC, c.cluster_id DESC
            "
        ))
        .await?;
    let rows: Vec<Row> = txn.query(&stmt, &[]).await?;
    let mut result = Vec::with_capacity(rows.len());
    for row in rows {
        result.push(row_to_cluster_record(&row)?);
    }
    Ok(result)
}

/// Retrieve the cluster projections for a set of cluster identifiers.
pub(crate) async fn get_clusters(
    txn: &Transaction<'_>,
    cluster_ids: &[ClusterId],
) -> Result<Vec<ClusterRecord>, DBError> {
    let ids: Vec<Uuid> = cluster_ids.iter().map(|id| id.0).collect();
    let stmt = txn
        .prepare_cached(&format!(
            "SELECT {RETRIEVE_CLUSTER_COLUMNS}
             FROM cluster_status AS c
             WHERE c.cluster_id = ANY($1)
             ORDER BY c.created_at DESC, c.cluster_id DESC
            "
        ))
        .await?;
    let rows: Vec<Row> = txn.query(&stmt, &[&ids]).await?;
    let mut result = Vec::with_capacity(rows.len());
    for row in rows {
        result.push(row_to_cluster_record(&row)?);
    }
    Ok(result)
}

/// Retrieve the active run identifier of a cluster. Returns `None` when the
/// cluster exists but has no active run.
pub(crate) async fn get_cluster_run_id(
    txn: &Transaction<'_>,
    cluster_id: ClusterId,
) -> Result<Option<RunId>, DBError> {
    let stmt = txn
        .prepare_cached(
            "SELECT c.active_cluster_runid
             FROM cluster_status AS c
             WHERE c.cluster_id = $1
            ",
        )
        .await?;
    let row = txn
        .query_opt(&stmt, &[&cluster_id.0])
        .await?
        .ok_or(DBError::UnknownCluster { cluster_id })?;
    Ok(row.get::<_, Option<Uuid>>(0).map(RunId))
}

/// Inserts the projection row of a newly created cluster.
pub(crate) async fn insert_cluster(
    txn: &Transaction<'_>,
    cluster_id: ClusterId,
    name: &str,
    artifact_id: &ArtifactId,
    created_at: DateTime<Utc>,
) -> Result<(), DBError> {
    let stmt = txn
        .prepare_cached(
            "INSERT INTO cluster_status
                (cluster_id, cluster_name, artifact_id, status, active_cluster_runid,
                 active_pods, available_memory, created_at, last_updated_at, last_used_at)
             VALUES ($1, $2, $3, $4, NULL, 0, 0, $5, $5, $5)",
        )
        .await?;
    let status: &'static str = ClusterStatus::Inactive.into();
    txn.execute(
        &stmt,
        &[
            &cluster_id.0,             // $1: cluster_id
            &name,                     // $2: cluster_name
            &artifact_id.to_string(),  // $3: artifact_id
            &status,                   // $4: status
            &created_at,               // $5: created_at and both timestamps
        ],
    )
    .await
    .map_err(maybe_unique_violation)?;
    Ok(())
}

/// Deletes the projection row of a cluster.
pub(crate) async fn delete_cluster(
    txn: &Transaction<'_>,
    cluster_id: ClusterId,
) -> Result<(), DBError> {
    let stmt = txn
        .prepare_cached("DELETE FROM cluster_status AS c WHERE c.cluster_id = $1")
        .await?;
    let rows_deleted = txn.execute(&stmt, &[&cluster_id.0]).await?;
    if rows_deleted > 0 {
        Ok(())
    } else {
        Err(DBError::UnknownCluster { cluster_id })
    }
}

/// Records a definition change: new name and the artifact that the change
/// allocated.
pub(crate) async fn update_name_and_artifact(
    txn: &Transaction<'_>,
    cluster_id: ClusterId,
    name: &str,
    artifact_id: &ArtifactId,
    updated_at: DateTime<Utc>,
) -> Result<(), DBError> {
    let stmt = txn
        .prepare_cached(
            "UPDATE cluster_status
             SET cluster_name = $2, artifact_id = $3, last_updated_at = $4
             WHERE cluster_id = $1",
        )
        .await?;
    let rows_updated = txn
        .execute(
            &stmt,
            &[&cluster_id.0, &name, &artifact_id.to_string(), &updated_at],
        )
        .await
        .map_err(maybe_unique_violation)?;
    if rows_updated > 0 {
        Ok(())
    } else {
        Err(DBError::UnknownCluster { cluster_id })
    }
}

/// Renames a cluster without touching its artifact.
pub(crate) async fn rename_cluster(
    txn: &Transaction<'_>,
    cluster_id: ClusterId,
    name: &str,
    updated_at: DateTime<Utc>,
) -> Result<(), DBError> {
    let stmt = txn
        .prepare_cached(
            "UPDATE cluster_status
             SET cluster_name = $2, last_updated_at = $3
             WHERE cluster_id = $1",
        )
        .await?;
    let rows_updated = txn
        .execute(&stmt, &[&cluster_id.0, &name, &updated_at])
        .await
        .map_err(maybe_unique_violation)?;
    if rows_updated > 0 {
        Ok(())
    } else {
        Err(DBError::UnknownCluster { cluster_id })
    }
}

/// Transitions the cluster into `creating` under a fresh run identifier.
pub(crate) async fn set_started(
    txn: &Transaction<'_>,
    cluster_id: ClusterId,
    run_id: RunId,
    now: DateTime<Utc>,
) -> Result<(), DBError> {
    let stmt = txn
        .prepare_cached(
            "UPDATE cluster_status
             SET status = $2, active_cluster_runid = $3,
                 last_updated_at = $4, last_used_at = $4
             WHERE cluster_id = $1",
        )
        .await?;
    let status: &'static str = ClusterStatus::Creating.into();
    let rows_updated = txn
        .execute(&stmt, &[&cluster_id.0, &status, &run_id.0, &now])
        .await?;
    if rows_updated > 0 {
        Ok(())
    } else {
        Err(DBError::UnknownCluster { cluster_id })
    }
}

/// Transitions the cluster into `inactive` and zeroes its resource counters.
/// The run identifier is retained so the stop can still be attributed to the
/// run in the action log.
pub(crate) async fn set_stopped(
    txn: &Transaction<'_>,
    cluster_id: ClusterId,
    now: DateTime<Utc>,
) -> Result<(), DBError> {
    let stmt = txn
        .prepare_cached(
            "UPDATE cluster_status
             SET status = $2, active_pods = 0, available_memory = 0, last_updated_at = $3
             WHERE cluster_id = $1",
        )
        .await?;
    let status: &'static str = ClusterStatus::Inactive.into();
    let rows_updated = txn
        .execute(&stmt, &[&cluster_id.0, &status, &now])
        .await?;
    if rows_updated > 0 {
        Ok(())
    } else {
        Err(DBError::UnknownCluster { cluster_id })
    }
}

/// Transitions the cluster back into `creating` for a restart, keeping the
/// current run identifier.
pub(crate) async fn set_restarting(
    txn: &Transaction<'_>,
    cluster_id: ClusterId,
    now: DateTime<Utc>,
) -> Result<(), DBError> {
    let stmt = txn
        .prepare_cached(
            "UPDATE cluster_status
             SET status = $2, last_updated_at = $3, last_used_at = $3
             WHERE cluster_id = $1",
        )
        .await?;
    let status: &'static str = ClusterStatus::Creating.into();
    let rows_updated = txn
        .execute(&stmt, &[&cluster_id.0, &status, &now])
        .await?;
    if rows_updated > 0 {
        Ok(())
    } else {
        Err(DBError::UnknownCluster { cluster_id })
    }
}

/// Conditionally updates the observed status and resource counters.
///
/// When `last_observed_at` is provided and the stored `last_updated_at` is
/// strictly newer, the row is left untouched and `Skipped` is returned: a
/// more recent writer already got there and a stale observation must not
/// clobber it. The row is locked so the comparison and the write are atomic
/// with respect to concurrent updates.
pub(crate) async fn update_cluster_status(
    txn: &Transaction<'_>,
    cluster_id: ClusterId,
    status: ClusterStatus,
    active_pods: i64,
    available_memory: i64,
    last_observed_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<StatusUpdate, DBError> {
    let stmt = txn
        .prepare_cached(
            "SELECT c.last_updated_at
             FROM cluster_status AS c
             WHERE c.cluster_id = $1
             FOR UPDATE
            ",
        )
        .await?;
    let row = txn
        .query_opt(&stmt, &[&cluster_id.0])
        .await?
        .ok_or(DBError::UnknownCluster { cluster_id })?;
    let last_updated_at: DateTime<Utc> = row.get(0);
    if let Some(observed_at) = last_observed_at {
        if last_updated_at > observed_at {
            return Ok(StatusUpdate::Skipped);
        }
    }

    let stmt = txn
        .prepare_cached(
            "UPDATE cluster_status
             SET status = $2, active_pods = $3, available_memory = $4,
                 last_updated_at = $5, last_used_at = $5
             WHERE cluster_id = $1",
        )
        .await?;
    let status: &'static str = status.into();
    txn.execute(
        &stmt,
        &[
            &cluster_id.0,
            &status,
            &active_pods,
            &available_memory,
            &now,
        ],
    )
    .await?;
    Ok(StatusUpdate::Updated)
}

/// Bumps the `last_used_at` heartbeat timestamp.
pub(crate) async fn touch_last_used(
    txn: &Transaction<'_>,
    cluster_id: ClusterId,
    now: DateTime<Utc>,
) -> Result<(), DBError> {
    let stmt = txn
        .prepare_cached(
            "UPDATE cluster_status
             SET last_used_at = $2
             WHERE cluster_id = $1",
        )
        .await?;
    let rows_updated = txn.execute(&stmt, &[&cluster_id.0, &now]).await?;
    if rows_updated > 0 {
        Ok(())
    } else {
        Err(DBError::UnknownCluster { cluster_id })
    }
}

/// Clusters whose `last_used_at` is older than `days` days, restricted to a
/// candidate id set. Consumed by external idle-reaper jobs.
pub(crate) async fn clusters_last_used_before(
    txn: &Transaction<'_>,
    days: i32,
    cluster_ids: &[ClusterId],
) -> Result<Vec<ClusterRecord>, DBError> {
    let ids: Vec<Uuid> = cluster_ids.iter().map(|id| id.0).collect();
    let stmt = txn
        .prepare_cached(&format!(
            "SELECT {RETRIEVE_CLUSTER_COLUMNS}
             FROM cluster_status AS c
             WHERE c.cluster_id = ANY($1)
                   AND c.last_used_at < NOW() - make_interval(days => $2::int)
             ORDER BY c.last_used_at ASC
            "
        ))
        .await?;
    let rows: Vec<Row> = txn.query(&stmt, &[&ids, &days]).await?;
    let mut result = Vec::with_capacity(rows.len());
    for row in rows {
        result.push(row_to_cluster_record(&row)?);
    }
    Ok(result)
}
