//! Local user model, as seen by JIT provisioning.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

/// A local user account.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub display_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a federated user.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub display_name: Option<String>,
}

impl User {
    pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Email lookup is case-insensitive; addresses are stored lowercased.
    pub async fn find_by_email(pool: &PgPool, email: &str) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM users WHERE LOWER(email) = LOWER($1)")
            .bind(email)
            .fetch_optional(pool)
            .await
    }

    /// Create a user provisioned from an external identity provider.
    pub async fn create_federated(pool: &PgPool, input: NewUser) -> Result<Self, sqlx::Error> {
        sqlx::query_as(
            r"
            INSERT INTO users (email, display_name)
            VALUES (LOWER($1), $2)
            RETURNING *
            ",
        )
        .bind(&input.email)
        .bind(&input.display_name)
        .fetch_one(pool)
        .await
    }

    pub async fn update_display_name(
        pool: &PgPool,
        id: Uuid,
        display_name: Option<String>,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as(
            r"
            UPDATE users
            SET display_name = $2, updated_at = NOW()
            WHERE id = $1
            RETURNING *
            ",
        )
        .bind(id)
        .bind(&display_name)
        .fetch_one(pool)
        .await
    }

    /// Replace the user's role assignments with the given set.
    pub async fn replace_roles(
        pool: &PgPool,
        user_id: Uuid,
        role_ids: &[Uuid],
    ) -> Result<(), sqlx::Error> {
        let mut tx = pool.begin().await?;

        sqlx::query("DELETE FROM user_roles WHERE user_id = $1")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

        for role_id in role_ids {
            sqlx::query(
                r"
                INSERT INTO user_roles (user_id, role_id)
                VALUES ($1, $2)
                ON CONFLICT DO NOTHING
                ",
            )
            .bind(user_id)
            .bind(role_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn role_ids(pool: &PgPool, user_id: Uuid) -> Result<Vec<Uuid>, sqlx::Error> {
        let rows: Vec<(Uuid,)> =
            sqlx::query_as("SELECT role_id FROM user_roles WHERE user_id = $1")
                .bind(user_id)
                .fetch_all(pool)
                .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    /// Create a default instance for testing.
    #[must_use]
    pub fn default_for_test() -> Self {
        Self {
            id: Uuid::new_v4(),
            email: "user@example.com".to_string(),
            display_name: Some("Example User".to_string()),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }
}
