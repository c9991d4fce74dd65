use crate::db::error::DBError;
use crate::db::operations::utils::maybe_unique_violation;
use deadpool_postgres::Transaction;

/// Config key holding the cloud environment used when a request for an
/// interactive cluster names none.
pub const CONFIG_DEFAULT_CLOUD_ENV: &str = "default_cloud_env";

/// Config key holding the cloud environment used when a request for a job
/// cluster names none.
pub const CONFIG_JOB_DEFAULT_CLOUD_ENV: &str = "job_default_cloud_env";

/// Retrieve a config value.
pub(crate) async fn get_config(
    txn: &Transaction<'_>,
    config_key: &str,
) -> Result<String, DBError> {
    let stmt = txn
        .prepare_cached(
            "SELECT c.value
             FROM cluster_configs AS c
             WHERE c.config_key = $1
            ",
        )
        .await?;
    let row = txn
        .query_opt(&stmt, &[&config_key])
        .await?
        .ok_or_else(|| DBError::UnknownConfig {
            config_key: config_key.to_string(),
        })?;
    Ok(row.get(0))
}

/// Like [`get_config`], but absence is not an error.
pub(crate) async fn maybe_get_config(
    txn: &Transaction<'_>,
    config_key: &str,
) -> Result<Option<String>, DBError> {
    match get_config(txn, config_key).await {
        Ok(value) => Ok(Some(value)),
        Err(DBError::UnknownConfig { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Creates a config entry.
pub(crate) async fn create_config(
    txn: &Transaction<'_>,
    config_key: &str,
    value: &str,
) -> Result<(), DBError> {
    let stmt = txn
        .prepare_cached("INSERT INTO cluster_configs (config_key, value) VALUES ($1, $2)")
        .await?;
    txn.execute(&stmt, &[&config_key, &value])
        .await
        .map_err(maybe_unique_violation)?;
    Ok(())
}

/// Updates an existing config entry.
pub(crate) async fn update_config(
    txn: &Transaction<'_>,
    config_key: &str,
    value: &str,
) -> Result<(), DBError> {
    let stmt = txn
        .prepare_cached("UPDATE cluster_configs SET value = $2 WHERE config_key = $1")
        .await?;
    let rows_updated = txn.execute(&stmt, &[&config_key, &value]).await?;
    if rows_updated > 0 {
        Ok(())
    } else {
        Err(DBError::UnknownConfig {
            config_key: config_key.to_string(),
        })
    }
}
