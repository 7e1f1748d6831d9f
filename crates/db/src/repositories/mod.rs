mod conversation;
mod execution_log;
mod kv;

use std::time::Duration;

use chrono::Utc;
use helmsman_core::audit::AuditError;
use helmsman_core::memory::MemoryError;
use helmsman_core::store::StoreError;
use thiserror::Error;

pub use conversation::SqlConversationRepository;
pub use execution_log::SqlExecutionLogRepository;
pub use kv::SqlAtomicStore;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

impl From<RepositoryError> for StoreError {
    fn from(error: RepositoryError) -> Self {
        StoreError::Backend(error.to_string())
    }
}

impl From<RepositoryError> for AuditError {
    fn from(error: RepositoryError) -> Self {
        AuditError::Sink(error.to_string())
    }
}

impl From<RepositoryError> for MemoryError {
    fn from(error: RepositoryError) -> Self {
        MemoryError::Backend(error.to_string())
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}
