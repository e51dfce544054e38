use thiserror::Error;

use gatehouse_core::audit::AuditError;

pub mod audit;

pub use audit::SqlAuditStore;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("sequence conflict: expected {expected}, got {actual}")]
    SequenceConflict { expected: u64, actual: u64 },
}

impl From<RepositoryError> for AuditError {
    fn from(error: RepositoryError) -> Self {
        AuditError::Storage(error.to_string())
    }
}
