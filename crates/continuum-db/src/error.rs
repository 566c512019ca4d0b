use thiserror::Error;

/// Errors surfaced by the task store adapter.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("code reference {0} not found")]
    UnknownCodeRef(uuid::Uuid),

    #[error("task {0} not found")]
    UnknownTask(i64),

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}
