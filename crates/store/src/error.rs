use askql_error::{AskqlError, Classify, ErrorClass, ErrorCode};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Stored value could not be decoded: {0}")]
    Decode(String),

    #[error("Failed to prepare store directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite connection lock poisoned")]
    Poisoned,

    #[error("Store task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Decode(err.to_string())
    }
}

impl Classify for StoreError {
    fn class(&self) -> ErrorClass {
        match self {
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(e, _))
                if matches!(
                    e.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                ) =>
            {
                ErrorClass::Transient
            }
            _ => ErrorClass::Internal,
        }
    }
}

impl From<StoreError> for AskqlError {
    fn from(err: StoreError) -> Self {
        let class = err.class();
        AskqlError::new(ErrorCode::StorageFailed, err.to_string()).with_class(class)
    }
}
