pub mod document;
pub mod error;
pub(crate) mod operations;
pub mod storage;
pub mod storage_postgres;
pub mod types;

pub use error::DBError;
pub use operations::configs::{CONFIG_DEFAULT_CLOUD_ENV, CONFIG_JOB_DEFAULT_CLOUD_ENV};
