use thiserror::Error;

use crate::workflows::WorkflowError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("scan {scan_id} does not exist")]
    ScanNotFound { scan_id: i64 },

    #[error("finding {finding_id} does not exist")]
    FindingNotFound { finding_id: i64 },

    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error("record store failure: {0}")]
    Store(#[from] sqlx::Error),

    #[error("schema migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl Error {
    /// Store-level faults abort only the current operation; the caller may retry.
    pub fn is_store_failure(&self) -> bool {
        matches!(self, Error::Store(_) | Error::Migration(_))
    }
}
