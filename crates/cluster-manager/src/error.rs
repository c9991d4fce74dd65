use crate::audit::AuditError;
use crate::db::error::DBError;
use crate::provisioner::ProvisionerError;
use std::error::Error as StdError;
use std::fmt;
use std::fmt::Display;

/// Top-level error of the lifecycle engine.
///
/// Audit failures never appear here: they are swallowed by the emitter.
/// [`AuditError`] is referenced only so configuration errors of the sink can
/// surface at startup.
#[derive(Debug)]
pub enum ManagerError {
    Db { error: DBError },
    Provisioner { error: ProvisionerError },
    AuditSetup { error: AuditError },
}

impl From<DBError> for ManagerError {
    fn from(error: DBError) -> Self {
        Self::Db { error }
    }
}

impl From<ProvisionerError> for ManagerError {
    fn from(error: ProvisionerError) -> Self {
        Self::Provisioner { error }
    }
}

impl From<AuditError> for ManagerError {
    fn from(error: AuditError) -> Self {
        Self::AuditSetup { error }
    }
}

impl Display for ManagerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Db { error } => write!(f, "{error}"),
            Self::Provisioner { error } => write!(f, "{error}"),
            Self::AuditSetup { error } => write!(f, "{error}"),
        }
    }
}

impl StdError for ManagerError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Db { error } => Some(error),
            Self::Provisioner { error } => Some(error),
            Self::AuditSetup { error } => Some(error),
        }
    }
}
