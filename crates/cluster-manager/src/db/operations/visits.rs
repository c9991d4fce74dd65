use crate::db::error::DBError;
use crate::db::types::cluster::ClusterId;
use chrono::{DateTime, Utc};
use deadpool_postgres::Transaction;
use tokio_postgres::Row;

/// Records that a user opened a cluster. One row per (user, cluster); a
/// repeat visit refreshes the timestamp and clears any soft-delete marker.
pub(crate) async fn add_recent_visit(
    txn: &Transaction<'_>,
    user_id: &str,
    cluster_id: ClusterId,
    visited_at: DateTime<Utc>,
) -> Result<(), DBError> {
    let stmt = txn
        .prepare_cached(
            "INSERT INTO user_cluster_visits (user_id, cluster_id, visited_at, deleted)
             VALUES ($1, $2, $3, FALSE)
             ON CONFLICT ON CONSTRAINT user_cluster_visits_pkey
             DO UPDATE SET visited_at = $3, deleted = FALSE",
        )
        .await?;
    txn.execute(&stmt, &[&user_id, &cluster_id.0, &visited_at])
        .await?;
    Ok(())
}

/// The three clusters the user visited most recently, newest first.
pub(crate) async fn recent_visits(
    txn: &Transaction<'_>,
    user_id: &str,
) -> Result<Vec<ClusterId>, DBError> {
    let stmt = txn
        .prepare_cached(
            "SELECT v.cluster_id
             FROM user_cluster_visits AS v
             WHERE v.user_id = $1 AND NOT v.deleted
             ORDER BY v.visited_at DESC
             LIMIT 3
            ",
        )
        .await?;
    let rows: Vec<Row> = txn.query(&stmt, &[&user_id]).await?;
    Ok(rows.iter().map(|row| ClusterId(row.get(0))).collect())
}

/// Soft-deletes all visit rows of a cluster. Called when the cluster itself
/// is deleted so it drops out of everyone's recent list.
pub(crate) async fn soft_delete_visits(
    txn: &Transaction<'_>,
    cluster_id: ClusterId,
) -> Result<(), DBError> {
    let stmt = txn
        .prepare_cached("UPDATE user_cluster_visits SET deleted = TRUE WHERE cluster_id = $1")
        .await?;
    txn.execute(&stmt, &[&cluster_id.0]).await?;
    Ok(())
}
