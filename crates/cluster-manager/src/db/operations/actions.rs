use crate::db::error::DBError;
use crate::db::types::action::{ActionKind, ClusterAction, LongRunningCluster, RunGroup};
use crate::db::types::cluster::{ClusterId, RunId};
use chrono::{DateTime, Utc};
use deadpool_postgres::Transaction;
use tokio_postgres::Row;
use uuid::Uuid;

/// All action log columns.
const RETRIEVE_ACTION_COLUMNS: &str =
    "a.cluster_runid, a.cluster_id, a.artifact_id, a.action, a.message, a.updated_at";

fn row_to_cluster_action(row: &Row) -> Result<ClusterAction, DBError> {
    assert_eq!(row.len(), 6);
    Ok(ClusterAction {
        run_id: row.get::<_, Option<Uuid>>(0).map(RunId),
        cluster_id: ClusterId(row.get(1)),
        artifact_id: row.get(2),
        kind: row.get::<_, String>(3).try_into()?,
        message: row.get(4),
        recorded_at: row.get(5),
    })
}

/// Appends one entry to the action log.
pub(crate) async fn insert_action(
    txn: &Transaction<'_>,
    cluster_id: ClusterId,
    run_id: Option<RunId>,
    artifact_id: Option<&str>,
    kind: ActionKind,
    message: &str,
    recorded_at: DateTime<Utc>,
) -> Result<(), DBError> {
    let stmt = txn
        .prepare_cached(
            "INSERT INTO cluster_actions
                (cluster_runid, cluster_id, artifact_id, action, message, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .await?;
    let kind: &'static str = kind.into();
    txn.execute(
        &stmt,
        &[
            &run_id.map(|r| r.0), // $1: cluster_runid
            &cluster_id.0,        // $2: cluster_id
            &artifact_id,         // $3: artifact_id
            &kind,                // $4: action
            &message,             // $5: message
            &recorded_at,         // $6: updated_at
        ],
    )
    .await?;
    Ok(())
}

/// All actions recorded under one run, oldest first.
pub(crate) async fn actions_for_run(
    txn: &Transaction<'_>,
    run_id: RunId,
) -> Result<Vec<ClusterAction>, DBError> {
    let stmt = txn
        .prepare_cached(&format!(
            "SELECT {RETRIEVE_ACTION_COLUMNS}
             FROM cluster_actions AS a
             WHERE a.cluster_runid = $1
             ORDER BY a.updated_at ASC, a.id ASC
            "
        ))
        .await?;
    let rows: Vec<Row> = txn.query(&stmt, &[&run_id.0]).await?;
    let mut result = Vec::with_capacity(rows.len());
    for row in rows {
        result.push(row_to_cluster_action(&row)?);
    }
    Ok(result)
}

/// Runs of a cluster grouped from its action log, most recent first, paged.
pub(crate) async fn run_groups(
    txn: &Transaction<'_>,
    cluster_id: ClusterId,
    offset: i64,
    limit: i64,
) -> Result<Vec<RunGroup>, DBError> {
    let stmt = txn
        .prepare_cached(
            "SELECT a.cluster_runid, MIN(a.updated_at), MAX(a.updated_at), COUNT(*)
             FROM cluster_actions AS a
             WHERE a.cluster_id = $1 AND a.cluster_runid IS NOT NULL
             GROUP BY a.cluster_runid
             ORDER BY MAX(a.updated_at) DESC
             OFFSET $2 LIMIT $3
            ",
        )
        .await?;
    let rows: Vec<Row> = txn.query(&stmt, &[&cluster_id.0, &offset, &limit]).await?;
    Ok(rows
        .iter()
        .map(|row| RunGroup {
            run_id: RunId(row.get(0)),
            first_recorded_at: row.get(1),
            last_recorded_at: row.get(2),
            num_actions: row.get(3),
        })
        .collect())
}

/// The chronologically first and last action of a run. Both are the same
/// entry when the run logged exactly one action.
pub(crate) async fn first_and_last_action(
    txn: &Transaction<'_>,
    run_id: RunId,
) -> Result<(ClusterAction, ClusterAction), DBError> {
    let actions = actions_for_run(txn, run_id).await?;
    match (actions.first(), actions.last()) {
        (Some(first), Some(last)) => Ok((first.clone(), last.clone())),
        _ => Err(DBError::UnknownRun { run_id }),
    }
}

/// The most recent action of the given kind for a cluster, if any.
pub(crate) async fn latest_action_of_kind(
    txn: &Transaction<'_>,
    cluster_id: ClusterId,
    kind: ActionKind,
) -> Result<Option<ClusterAction>, DBError> {
    let stmt = txn
        .prepare_cached(&format!(
            "SELECT {RETRIEVE_ACTION_COLUMNS}
             FROM cluster_actions AS a
             WHERE a.cluster_id = $1 AND a.action = $2
             ORDER BY a.updated_at DESC, a.id DESC
             LIMIT 1
            "
        ))
        .await?;
    let kind: &'static str = kind.into();
    let row = txn.query_opt(&stmt, &[&cluster_id.0, &kind]).await?;
    row.as_ref().map(row_to_cluster_action).transpose()
}

/// Clusters that are still up and whose current run started more than
/// `minutes` minutes ago. Consumed by external long-running-cluster reapers.
pub(crate) async fn clusters_running_longer_than(
    txn: &Transaction<'_>,
    minutes: i32,
) -> Result<Vec<LongRunningCluster>, DBError> {
    let stmt = txn
        .prepare_cached(
            "SELECT c.cluster_id, c.cluster_name, c.active_cluster_runid, a.updated_at
             FROM cluster_status AS c
             JOIN cluster_actions AS a
                  ON a.cluster_runid = c.active_cluster_runid AND a.action = 'started'
             WHERE c.status IN ('active', 'creating')
                   AND a.updated_at < NOW() - make_interval(mins => $1::int)
             ORDER BY a.updated_at ASC
            ",
        )
        .await?;
    let rows: Vec<Row> = txn.query(&stmt, &[&minutes]).await?;
    Ok(rows
        .iter()
        .map(|row| LongRunningCluster {
            cluster_id: ClusterId(row.get(0)),
            cluster_name: row.get(1),
            run_id: RunId(row.get(2)),
            started_at: row.get(3),
        })
        .collect())
}
