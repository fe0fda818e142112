//! Identity provider model for external federation.
//!
//! Providers carry an `evaluation_order` that is always a contiguous
//! permutation `1..N` across all rows. Every mutation that touches the
//! ordering runs inside a single transaction with `FOR UPDATE` row locks on
//! the affected range, so concurrent registry operations serialize instead
//! of producing duplicate positions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

/// Sentinel order used while a row is being moved, outside the live range.
const MOVE_SENTINEL: i32 = 0;

/// Supported federation drivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderDriver {
    Ldap,
    Oidc,
    Entra,
    Saml,
}

impl std::fmt::Display for ProviderDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderDriver::Ldap => write!(f, "ldap"),
            ProviderDriver::Oidc => write!(f, "oidc"),
            ProviderDriver::Entra => write!(f, "entra"),
            ProviderDriver::Saml => write!(f, "saml"),
        }
    }
}

impl std::str::FromStr for ProviderDriver {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ldap" => Ok(ProviderDriver::Ldap),
            "oidc" => Ok(ProviderDriver::Oidc),
            "entra" => Ok(ProviderDriver::Entra),
            "saml" => Ok(ProviderDriver::Saml),
            _ => Err(format!("Unknown provider driver: {s}")),
        }
    }
}

/// A configured external identity provider.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct IdentityProvider {
    pub id: Uuid,
    /// Human slug, unique, normalized to `[a-z0-9-]+`.
    pub key: String,
    pub name: String,
    /// Driver slug; see [`ProviderDriver`].
    pub driver: String,
    pub enabled: bool,
    /// Position in the evaluation sequence, unique, contiguous from 1.
    pub evaluation_order: i32,
    /// Driver-specific configuration map.
    pub config: serde_json::Value,
    /// Free-form metadata.
    pub meta: serde_json::Value,
    /// Last successful upstream contact.
    pub last_health_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a provider. `evaluation_order` is the requested
/// position; callers clamp it before passing it down.
#[derive(Debug, Clone)]
pub struct CreateIdentityProvider {
    pub key: String,
    pub name: String,
    pub driver: String,
    pub enabled: bool,
    pub config: serde_json::Value,
    pub meta: serde_json::Value,
}

/// Partial update for a provider.
#[derive(Debug, Clone, Default)]
pub struct UpdateIdentityProvider {
    pub name: Option<String>,
    pub enabled: Option<bool>,
    pub config: Option<serde_json::Value>,
    pub meta: Option<serde_json::Value>,
}

impl IdentityProvider {
    /// Parse the driver slug.
    pub fn parsed_driver(&self) -> Result<ProviderDriver, String> {
        self.driver.parse()
    }

    /// String value from the driver config map.
    #[must_use]
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(|v| v.as_str())
    }

    /// Boolean value from the driver config map.
    #[must_use]
    pub fn config_bool(&self, key: &str) -> Option<bool> {
        self.config.get(key).and_then(|v| v.as_bool())
    }

    /// Array value from the driver config map.
    #[must_use]
    pub fn config_array(&self, key: &str) -> Option<&Vec<serde_json::Value>> {
        self.config.get(key).and_then(|v| v.as_array())
    }

    /// Count all providers.
    pub async fn count(pool: &PgPool) -> Result<i64, sqlx::Error> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM identity_providers")
            .fetch_one(pool)
            .await?;
        Ok(row.0)
    }

    /// Find a provider by its id.
    pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM identity_providers WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Find a provider by its normalized key.
    pub async fn find_by_key(pool: &PgPool, key: &str) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM identity_providers WHERE key = $1")
            .bind(key)
            .fetch_optional(pool)
            .await
    }

    /// List all providers in evaluation order.
    pub async fn list(pool: &PgPool) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM identity_providers ORDER BY evaluation_order ASC")
            .fetch_all(pool)
            .await
    }

    /// List enabled providers in evaluation order.
    pub async fn list_enabled(pool: &PgPool) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as(
            r"
            SELECT * FROM identity_providers
            WHERE enabled = true
            ORDER BY evaluation_order ASC
            ",
        )
        .fetch_all(pool)
        .await
    }

    /// Whether at least one enabled provider exists.
    pub async fn has_enabled(pool: &PgPool) -> Result<bool, sqlx::Error> {
        let row: (bool,) =
            sqlx::query_as("SELECT EXISTS(SELECT 1 FROM identity_providers WHERE enabled = true)")
                .fetch_one(pool)
                .await?;
        Ok(row.0)
    }

    /// Insert a provider at `target_order`, shifting every sibling at or
    /// after that position up by one. Shifts are applied highest-order-first
    /// so the unique constraint never sees a transient collision.
    pub async fn create_at_order(
        pool: &PgPool,
        input: CreateIdentityProvider,
        target_order: i32,
    ) -> Result<Self, sqlx::Error> {
        let mut tx = pool.begin().await?;

        let affected = lock_range(&mut tx, target_order, i32::MAX, /* descending */ true).await?;
        for (id, order) in affected {
            set_order(&mut tx, id, order + 1).await?;
        }

        let provider: Self = sqlx::query_as(
            r"
            INSERT INTO identity_providers
                (key, name, driver, enabled, evaluation_order, config, meta)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            ",
        )
        .bind(&input.key)
        .bind(&input.name)
        .bind(&input.driver)
        .bind(input.enabled)
        .bind(target_order)
        .bind(&input.config)
        .bind(&input.meta)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(provider)
    }

    /// Apply a partial update that does not move the row.
    pub async fn update_fields(
        pool: &PgPool,
        id: Uuid,
        input: UpdateIdentityProvider,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as(
            r"
            UPDATE identity_providers
            SET
                name = COALESCE($2, name),
                enabled = COALESCE($3, enabled),
                config = COALESCE($4, config),
                meta = COALESCE($5, meta),
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            ",
        )
        .bind(id)
        .bind(&input.name)
        .bind(input.enabled)
        .bind(&input.config)
        .bind(&input.meta)
        .fetch_one(pool)
        .await
    }

    /// Move a row from `old_order` to `new_order`, shifting the half-open
    /// range in between by one. The moved row parks on a sentinel position
    /// while the range shifts, so the unique constraint holds throughout.
    pub async fn move_to_order(
        pool: &PgPool,
        id: Uuid,
        old_order: i32,
        new_order: i32,
    ) -> Result<Self, sqlx::Error> {
        if old_order == new_order {
            return sqlx::query_as("SELECT * FROM identity_providers WHERE id = $1")
                .bind(id)
                .fetch_one(pool)
                .await;
        }

        let mut tx = pool.begin().await?;

        let (lo, hi) = if new_order < old_order {
            (new_order, old_order)
        } else {
            (old_order, new_order)
        };
        // Lock the whole affected range, moved row included.
        let _ = lock_range(&mut tx, lo, hi, false).await?;

        set_order(&mut tx, id, MOVE_SENTINEL).await?;

        if new_order < old_order {
            // Moving earlier: siblings in [new, old) step down the list.
            let range = lock_range(&mut tx, new_order, old_order - 1, true).await?;
            for (sib, order) in range {
                set_order(&mut tx, sib, order + 1).await?;
            }
        } else {
            // Moving later: siblings in (old, new] step up the list.
            let range = lock_range(&mut tx, old_order + 1, new_order, false).await?;
            for (sib, order) in range {
                set_order(&mut tx, sib, order - 1).await?;
            }
        }

        let provider: Self = sqlx::query_as(
            r"
            UPDATE identity_providers
            SET evaluation_order = $2, updated_at = NOW()
            WHERE id = $1
            RETURNING *
            ",
        )
        .bind(id)
        .bind(new_order)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(provider)
    }

    /// Delete a provider and collapse the gap it leaves. Orders below 1 are
    /// clamped back to 1 defensively.
    pub async fn delete_and_collapse(pool: &PgPool, id: Uuid) -> Result<bool, sqlx::Error> {
        let mut tx = pool.begin().await?;

        let deleted: Option<(i32,)> = sqlx::query_as(
            "DELETE FROM identity_providers WHERE id = $1 RETURNING evaluation_order",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((deleted_order,)) = deleted else {
            tx.rollback().await?;
            return Ok(false);
        };

        let trailing = lock_range(&mut tx, deleted_order + 1, i32::MAX, false).await?;
        for (sib, order) in trailing {
            set_order(&mut tx, sib, (order - 1).max(1)).await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    /// Stamp a successful upstream contact.
    pub async fn touch_health(pool: &PgPool, id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE identity_providers SET last_health_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Create a default instance for testing.
    /// Available in all builds for downstream crate tests.
    #[must_use]
    pub fn default_for_test() -> Self {
        Self {
            id: Uuid::new_v4(),
            key: "acme-idp".to_string(),
            name: "Acme IdP".to_string(),
            driver: "oidc".to_string(),
            enabled: true,
            evaluation_order: 1,
            config: serde_json::json!({}),
            meta: serde_json::json!({}),
            last_health_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }
}

/// Lock `(id, evaluation_order)` pairs in `[lo, hi]`, ordered so callers can
/// walk the range without transient unique-constraint collisions.
async fn lock_range(
    tx: &mut Transaction<'_, Postgres>,
    lo: i32,
    hi: i32,
    descending: bool,
) -> Result<Vec<(Uuid, i32)>, sqlx::Error> {
    let sql = if descending {
        r"
        SELECT id, evaluation_order FROM identity_providers
        WHERE evaluation_order >= $1 AND evaluation_order <= $2
        ORDER BY evaluation_order DESC
        FOR UPDATE
        "
    } else {
        r"
        SELECT id, evaluation_order FROM identity_providers
        WHERE evaluation_order >= $1 AND evaluation_order <= $2
        ORDER BY evaluation_order ASC
        FOR UPDATE
        "
    };

    let rows = sqlx::query(sql)
        .bind(lo)
        .bind(hi)
        .fetch_all(&mut **tx)
        .await?;

    Ok(rows
        .into_iter()
        .map(|r| (r.get("id"), r.get("evaluation_order")))
        .collect())
}

async fn set_order(
    tx: &mut Transaction<'_, Postgres>,
    id: Uuid,
    order: i32,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE identity_providers SET evaluation_order = $2 WHERE id = $1")
        .bind(id)
        .bind(order)
        .execute(&mut **tx)
        .await?;
    Ok(())
}
