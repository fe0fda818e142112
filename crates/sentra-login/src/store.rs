//! Provider store capability.
//!
//! Two implementations: Postgres for production (transactional range
//! shifts with row locks, from `sentra-db`) and an in-memory store whose
//! mutations run under one mutex, used by tests and local tooling. Both
//! uphold the same contract: after any operation, the `evaluation_order`
//! values of all live providers form exactly the contiguous range `1..N`.

use crate::error::LoginError;
use async_trait::async_trait;
use chrono::Utc;
use sentra_db::models::identity_provider::{
    CreateIdentityProvider, IdentityProvider, UpdateIdentityProvider,
};
use sqlx::PgPool;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Store backend errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
}

impl From<StoreError> for LoginError {
    fn from(e: StoreError) -> Self {
        LoginError::Store(e.to_string())
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

/// Persistence capability behind the provider registry.
#[async_trait]
pub trait ProviderStore: Send + Sync {
    async fn count(&self) -> Result<i64, StoreError>;

    /// Insert at `order`, shifting providers at or after that position up.
    async fn insert_at(
        &self,
        input: CreateIdentityProvider,
        order: i32,
    ) -> Result<IdentityProvider, StoreError>;

    async fn update_fields(
        &self,
        id: Uuid,
        input: UpdateIdentityProvider,
    ) -> Result<IdentityProvider, StoreError>;

    /// Move a provider between positions, shifting the range in between.
    async fn move_to(
        &self,
        id: Uuid,
        old_order: i32,
        new_order: i32,
    ) -> Result<IdentityProvider, StoreError>;

    /// Delete and collapse the gap.
    async fn delete_collapse(&self, id: Uuid) -> Result<bool, StoreError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<IdentityProvider>, StoreError>;

    async fn find_by_key(&self, key: &str) -> Result<Option<IdentityProvider>, StoreError>;

    /// All providers in evaluation order.
    async fn list(&self) -> Result<Vec<IdentityProvider>, StoreError>;

    async fn has_enabled(&self) -> Result<bool, StoreError>;
}

/// In-memory store; every mutation holds the single lock for its whole
/// read-shift-write sequence, mirroring the row-locked transaction of the
/// Postgres implementation.
#[derive(Debug, Default, Clone)]
pub struct InMemoryProviderStore {
    providers: Arc<Mutex<Vec<IdentityProvider>>>,
}

impl InMemoryProviderStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProviderStore for InMemoryProviderStore {
    async fn count(&self) -> Result<i64, StoreError> {
        Ok(self.providers.lock().await.len() as i64)
    }

    async fn insert_at(
        &self,
        input: CreateIdentityProvider,
        order: i32,
    ) -> Result<IdentityProvider, StoreError> {
        let mut providers = self.providers.lock().await;

        if providers.iter().any(|p| p.key == input.key) {
            return Err(StoreError::Backend(format!(
                "duplicate provider key: {}",
                input.key
            )));
        }

        for provider in providers.iter_mut() {
            if provider.evaluation_order >= order {
                provider.evaluation_order += 1;
            }
        }

        let now = Utc::now();
        let provider = IdentityProvider {
            id: Uuid::new_v4(),
            key: input.key,
            name: input.name,
            driver: input.driver,
            enabled: input.enabled,
            evaluation_order: order,
            config: input.config,
            meta: input.meta,
            last_health_at: None,
            created_at: now,
            updated_at: now,
        };
        providers.push(provider.clone());
        Ok(provider)
    }

    async fn update_fields(
        &self,
        id: Uuid,
        input: UpdateIdentityProvider,
    ) -> Result<IdentityProvider, StoreError> {
        let mut providers = self.providers.lock().await;
        let provider = providers
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| StoreError::Backend(format!("no such provider {id}")))?;

        if let Some(name) = input.name {
            provider.name = name;
        }
        if let Some(enabled) = input.enabled {
            provider.enabled = enabled;
        }
        if let Some(config) = input.config {
            provider.config = config;
        }
        if let Some(meta) = input.meta {
            provider.meta = meta;
        }
        provider.updated_at = Utc::now();
        Ok(provider.clone())
    }

    async fn move_to(
        &self,
        id: Uuid,
        old_order: i32,
        new_order: i32,
    ) -> Result<IdentityProvider, StoreError> {
        let mut providers = self.providers.lock().await;

        if new_order != old_order {
            for provider in providers.iter_mut() {
                if provider.id == id {
                    continue;
                }
                let order = provider.evaluation_order;
                if new_order < old_order && order >= new_order && order < old_order {
                    provider.evaluation_order = order + 1;
                } else if new_order > old_order && order > old_order && order <= new_order {
                    provider.evaluation_order = order - 1;
                }
            }
        }

        let provider = providers
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| StoreError::Backend(format!("no such provider {id}")))?;
        provider.evaluation_order = new_order;
        provider.updated_at = Utc::now();
        Ok(provider.clone())
    }

    async fn delete_collapse(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut providers = self.providers.lock().await;
        let Some(position) = providers.iter().position(|p| p.id == id) else {
            return Ok(false);
        };
        let deleted_order = providers.remove(position).evaluation_order;

        for provider in providers.iter_mut() {
            if provider.evaluation_order > deleted_order {
                provider.evaluation_order = (provider.evaluation_order - 1).max(1);
            }
        }
        Ok(true)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<IdentityProvider>, StoreError> {
        Ok(self
            .providers
            .lock()
            .await
            .iter()
            .find(|p| p.id == id)
            .cloned())
    }

    async fn find_by_key(&self, key: &str) -> Result<Option<IdentityProvider>, StoreError> {
        Ok(self
            .providers
            .lock()
            .await
            .iter()
            .find(|p| p.key == key)
            .cloned())
    }

    async fn list(&self) -> Result<Vec<IdentityProvider>, StoreError> {
        let mut providers = self.providers.lock().await.clone();
        providers.sort_by_key(|p| p.evaluation_order);
        Ok(providers)
    }

    async fn has_enabled(&self) -> Result<bool, StoreError> {
        Ok(self.providers.lock().await.iter().any(|p| p.enabled))
    }
}

/// Postgres store delegating to the `sentra-db` model, which carries the
/// transactional, row-locked order maintenance.
#[derive(Clone)]
pub struct PostgresProviderStore {
    pool: PgPool,
}

impl PostgresProviderStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProviderStore for PostgresProviderStore {
    async fn count(&self) -> Result<i64, StoreError> {
        Ok(IdentityProvider::count(&self.pool).await?)
    }

    async fn insert_at(
        &self,
        input: CreateIdentityProvider,
        order: i32,
    ) -> Result<IdentityProvider, StoreError> {
        Ok(IdentityProvider::create_at_order(&self.pool, input, order).await?)
    }

    async fn update_fields(
        &self,
        id: Uuid,
        input: UpdateIdentityProvider,
    ) -> Result<IdentityProvider, StoreError> {
        Ok(IdentityProvider::update_fields(&self.pool, id, input).await?)
    }

    async fn move_to(
        &self,
        id: Uuid,
        old_order: i32,
        new_order: i32,
    ) -> Result<IdentityProvider, StoreError> {
        Ok(IdentityProvider::move_to_order(&self.pool, id, old_order, new_order).await?)
    }

    async fn delete_collapse(&self, id: Uuid) -> Result<bool, StoreError> {
        Ok(IdentityProvider::delete_and_collapse(&self.pool, id).await?)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<IdentityProvider>, StoreError> {
        Ok(IdentityProvider::find_by_id(&self.pool, id).await?)
    }

    async fn find_by_key(&self, key: &str) -> Result<Option<IdentityProvider>, StoreError> {
        Ok(IdentityProvider::find_by_key(&self.pool, key).await?)
    }

    async fn list(&self) -> Result<Vec<IdentityProvider>, StoreError> {
        Ok(IdentityProvider::list(&self.pool).await?)
    }

    async fn has_enabled(&self) -> Result<bool, StoreError> {
        Ok(IdentityProvider::has_enabled(&self.pool).await?)
    }
}
