use thiserror::Error;

use crate::store::StoreError;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Devbench not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Devbench {0} already has a job in progress")]
    Busy(String),

    #[error("Store error: {0}")]
    Store(StoreError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<StoreError> for OrchestratorError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => OrchestratorError::NotFound(id),
            other => OrchestratorError::Store(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_keep_not_found_distinct() {
        let err = OrchestratorError::from(StoreError::NotFound("vm-1".to_string()));
        assert!(matches!(err, OrchestratorError::NotFound(id) if id == "vm-1"));

        // Log encoding problems surface as store errors, not a separate kind.
        let bad_json = serde_json::from_str::<Vec<String>>("{").unwrap_err();
        let err = OrchestratorError::from(StoreError::from(bad_json));
        assert!(matches!(err, OrchestratorError::Store(StoreError::Backend(_))));
        assert!(err.to_string().starts_with("Store error: Store backend error: log encoding:"));
    }
}
