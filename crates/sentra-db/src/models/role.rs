//! Role model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

/// A role assignable to users.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Role {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl Role {
    pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM roles WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Filter a candidate id list down to the ids that exist.
    ///
    /// JIT role resolution silently drops unknown ids rather than failing
    /// the login, so this is a membership query, not a validation.
    pub async fn existing_ids(pool: &PgPool, ids: &[Uuid]) -> Result<Vec<Uuid>, sqlx::Error> {
        let rows: Vec<(Uuid,)> = sqlx::query_as("SELECT id FROM roles WHERE id = ANY($1)")
            .bind(ids)
            .fetch_all(pool)
            .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }
}
