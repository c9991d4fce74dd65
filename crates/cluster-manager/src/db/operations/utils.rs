use crate::db::error::DBError;
use tokio_postgres::error::{Error, SqlState};

/// Maps a Postgres unique-constraint violation to the corresponding
/// `DBError`; any other error passes through as a Postgres error.
pub(crate) fn maybe_unique_violation(err: Error) -> DBError {
    if let Some(code) = err.code() {
        if code == &SqlState::UNIQUE_VIOLATION {
            if let Some(db_err) = err.as_db_error() {
                return match db_err.constraint() {
                    Some("cluster_status_pkey") => {
                        DBError::unique_key_violation("cluster_status_pkey")
                    }
                    Some("unique_cluster_name") => DBError::DuplicateName,
                    Some("cluster_configs_pkey") => {
                        DBError::unique_key_violation("cluster_configs_pkey")
                    }
                    Some("user_cluster_visits_pkey") => {
                        DBError::unique_key_violation("user_cluster_visits_pkey")
                    }
                    _ => DBError::from(err),
                };
            }
        }
    }
    DBError::from(err)
}
