//! Database query functions for the `codes` table.

use sqlx::PgPool;
use uuid::Uuid;

use crate::error::StoreError;

/// Fetch the script text for a code reference.
pub async fn resolve_code(pool: &PgPool, code_ref: Uuid) -> Result<String, StoreError> {
    let row: Option<(String,)> = sqlx::query_as("SELECT code FROM codes WHERE id = $1")
        .bind(code_ref)
        .fetch_optional(pool)
        .await?;

    row.map(|(code,)| code)
        .ok_or(StoreError::UnknownCodeRef(code_ref))
}

/// Insert a new code row, returning its generated id. Used by tests and any
/// external script-registration path.
pub async fn insert_code(pool: &PgPool, script: &str) -> Result<Uuid, StoreError> {
    let row: (Uuid,) = sqlx::query_as("INSERT INTO codes (code) VALUES ($1) RETURNING id")
        .bind(script)
        .fetch_one(pool)
        .await?;
    Ok(row.0)
}
