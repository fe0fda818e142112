//! Provider registry: CRUD with evaluation-order invariant maintenance.

use crate::error::{LoginError, LoginResult};
use crate::store::ProviderStore;
use sentra_db::models::identity_provider::{
    CreateIdentityProvider, IdentityProvider, ProviderDriver, UpdateIdentityProvider,
};
use serde_json::Value;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

/// Input for creating a provider.
#[derive(Debug, Clone)]
pub struct CreateProvider {
    pub key: String,
    pub name: Option<String>,
    pub driver: String,
    pub enabled: bool,
    /// Requested position; clamped to `[1, count + 1]`. Appended when
    /// absent.
    pub evaluation_order: Option<i32>,
    pub config: Value,
    pub meta: Option<Value>,
}

/// Input for updating a provider.
#[derive(Debug, Clone, Default)]
pub struct UpdateProvider {
    pub name: Option<String>,
    pub enabled: Option<bool>,
    pub evaluation_order: Option<i32>,
    pub config: Option<Value>,
    pub meta: Option<Value>,
}

/// Registry service over a [`ProviderStore`].
///
/// Construct with [`ProviderRegistry::unconfigured`] when no persistence
/// is wired up; every operation then refuses with a configuration error
/// instead of panicking deep in a driver.
#[derive(Clone)]
pub struct ProviderRegistry {
    store: Option<Arc<dyn ProviderStore>>,
}

impl ProviderRegistry {
    #[must_use]
    pub fn new(store: Arc<dyn ProviderStore>) -> Self {
        Self { store: Some(store) }
    }

    #[must_use]
    pub fn unconfigured() -> Self {
        Self { store: None }
    }

    fn store(&self) -> LoginResult<&Arc<dyn ProviderStore>> {
        self.store.as_ref().ok_or(LoginError::RegistryUnavailable)
    }

    /// Create a provider, normalizing its key and driver and slotting it
    /// into the evaluation sequence.
    #[instrument(skip(self, input), fields(key = %input.key))]
    pub async fn create(&self, input: CreateProvider) -> LoginResult<IdentityProvider> {
        let store = self.store()?;

        let key = normalize_key(&input.key);
        if key.is_empty() {
            return Err(LoginError::Validation(
                "provider key must contain at least one alphanumeric character".to_string(),
            ));
        }

        let driver = normalize_driver(&input.driver);
        if driver.parse::<ProviderDriver>().is_err() {
            return Err(LoginError::UnsupportedDriver(driver));
        }

        if !input.config.is_object() {
            return Err(LoginError::Validation(
                "provider config must be an object".to_string(),
            ));
        }

        let count = store.count().await? as i32;
        let order = match input.evaluation_order {
            Some(requested) => requested.clamp(1, count + 1),
            None => count + 1,
        };

        let provider = store
            .insert_at(
                CreateIdentityProvider {
                    name: input.name.unwrap_or_else(|| key.clone()),
                    key,
                    driver,
                    enabled: input.enabled,
                    config: input.config,
                    meta: input.meta.unwrap_or_else(|| Value::Object(Default::default())),
                },
                order,
            )
            .await?;

        tracing::info!(
            provider_id = %provider.id,
            key = %provider.key,
            order = provider.evaluation_order,
            "created identity provider"
        );
        Ok(provider)
    }

    /// Update a provider; an `evaluation_order` change moves it within the
    /// sequence, shifting the providers in between.
    #[instrument(skip(self, input))]
    pub async fn update(&self, id: Uuid, input: UpdateProvider) -> LoginResult<IdentityProvider> {
        let store = self.store()?;

        let current = store
            .find_by_id(id)
            .await?
            .ok_or_else(|| LoginError::ProviderNotFound(id.to_string()))?;

        if let Some(config) = &input.config {
            if !config.is_object() {
                return Err(LoginError::Validation(
                    "provider config must be an object".to_string(),
                ));
            }
        }

        let mut provider = store
            .update_fields(
                id,
                UpdateIdentityProvider {
                    name: input.name,
                    enabled: input.enabled,
                    config: input.config,
                    meta: input.meta,
                },
            )
            .await?;

        if let Some(requested) = input.evaluation_order {
            let count = store.count().await? as i32;
            let new_order = requested.clamp(1, count.max(1));
            if new_order != current.evaluation_order {
                provider = store
                    .move_to(id, current.evaluation_order, new_order)
                    .await?;
            }
        }

        Ok(provider)
    }

    /// Delete a provider, collapsing the order gap it leaves.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: Uuid) -> LoginResult<bool> {
        let store = self.store()?;
        let deleted = store.delete_collapse(id).await?;
        if deleted {
            tracing::info!(provider_id = %id, "deleted identity provider");
        }
        Ok(deleted)
    }

    /// Find by UUID, falling back to the normalized key.
    pub async fn find_by_id_or_key(&self, ident: &str) -> LoginResult<IdentityProvider> {
        let store = self.store()?;

        if let Ok(id) = ident.parse::<Uuid>() {
            if let Some(provider) = store.find_by_id(id).await? {
                return Ok(provider);
            }
        }

        store
            .find_by_key(&normalize_key(ident))
            .await?
            .ok_or_else(|| LoginError::ProviderNotFound(ident.to_string()))
    }

    /// Whether external login is possible at all.
    pub async fn has_enabled_provider(&self) -> LoginResult<bool> {
        Ok(self.store()?.has_enabled().await?)
    }

    /// All providers in evaluation order.
    pub async fn list(&self) -> LoginResult<Vec<IdentityProvider>> {
        Ok(self.store()?.list().await?)
    }
}

/// Lowercase, map anything outside `[a-z0-9-]` to `-`, trim stray dashes.
fn normalize_key(key: &str) -> String {
    let lowered = key.trim().to_lowercase();
    let mapped: String = lowered
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    mapped.trim_matches('-').to_string()
}

/// Lowercase and strip anything outside `[a-z0-9._-]`.
fn normalize_driver(driver: &str) -> String {
    driver
        .trim()
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryProviderStore;
    use serde_json::json;

    fn registry() -> (ProviderRegistry, Arc<InMemoryProviderStore>) {
        let store = Arc::new(InMemoryProviderStore::new());
        (ProviderRegistry::new(store.clone()), store)
    }

    fn create_input(key: &str, order: Option<i32>) -> CreateProvider {
        CreateProvider {
            key: key.to_string(),
            name: None,
            driver: "saml".to_string(),
            enabled: true,
            evaluation_order: order,
            config: json!({"certificate": "MIIB..."}),
            meta: None,
        }
    }

    /// The invariant every mutation must preserve: orders are exactly 1..N.
    async fn assert_contiguous(registry: &ProviderRegistry) {
        let providers = registry.list().await.unwrap();
        let mut orders: Vec<i32> = providers.iter().map(|p| p.evaluation_order).collect();
        orders.sort_unstable();
        let expected: Vec<i32> = (1..=providers.len() as i32).collect();
        assert_eq!(orders, expected, "evaluation orders must be exactly 1..N");
    }

    #[test]
    fn test_normalize_key() {
        assert_eq!(normalize_key("  Corp Okta (Prod)  "), "corp-okta--prod");
        assert_eq!(normalize_key("Already-fine-123"), "already-fine-123");
        assert_eq!(normalize_key("___"), "");
    }

    #[test]
    fn test_normalize_driver() {
        assert_eq!(normalize_driver("  SAML  "), "saml");
        assert_eq!(normalize_driver("ld ap!"), "ldap");
        assert_eq!(normalize_driver("oidc_v2.1-beta"), "oidc_v2.1-beta");
    }

    #[tokio::test]
    async fn test_create_appends_by_default() {
        let (registry, _) = registry();
        let a = registry.create(create_input("a", None)).await.unwrap();
        let b = registry.create(create_input("b", None)).await.unwrap();
        assert_eq!(a.evaluation_order, 1);
        assert_eq!(b.evaluation_order, 2);
        assert_contiguous(&registry).await;
    }

    #[tokio::test]
    async fn test_create_inserts_and_shifts() {
        let (registry, _) = registry();
        let a = registry.create(create_input("a", None)).await.unwrap();
        let b = registry.create(create_input("b", None)).await.unwrap();

        // Insert at the front; existing providers shift up.
        let c = registry.create(create_input("c", Some(1))).await.unwrap();
        assert_eq!(c.evaluation_order, 1);

        let providers = registry.list().await.unwrap();
        let order_of = |id| {
            providers
                .iter()
                .find(|p| p.id == id)
                .unwrap()
                .evaluation_order
        };
        assert_eq!(order_of(a.id), 2);
        assert_eq!(order_of(b.id), 3);
        assert_contiguous(&registry).await;
    }

    #[tokio::test]
    async fn test_create_clamps_requested_order() {
        let (registry, _) = registry();
        registry.create(create_input("a", None)).await.unwrap();

        let low = registry.create(create_input("low", Some(-5))).await.unwrap();
        assert_eq!(low.evaluation_order, 1);

        let high = registry.create(create_input("high", Some(99))).await.unwrap();
        assert_eq!(high.evaluation_order, 3);
        assert_contiguous(&registry).await;
    }

    #[tokio::test]
    async fn test_move_later_shifts_down() {
        let (registry, _) = registry();
        let a = registry.create(create_input("a", None)).await.unwrap();
        let b = registry.create(create_input("b", None)).await.unwrap();
        let c = registry.create(create_input("c", None)).await.unwrap();

        // a: 1 -> 3; b and c step up the list.
        let moved = registry
            .update(
                a.id,
                UpdateProvider {
                    evaluation_order: Some(3),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(moved.evaluation_order, 3);

        let providers = registry.list().await.unwrap();
        let order_of = |id| {
            providers
                .iter()
                .find(|p| p.id == id)
                .unwrap()
                .evaluation_order
        };
        assert_eq!(order_of(b.id), 1);
        assert_eq!(order_of(c.id), 2);
        assert_contiguous(&registry).await;
    }

    #[tokio::test]
    async fn test_move_earlier_shifts_up() {
        let (registry, _) = registry();
        let a = registry.create(create_input("a", None)).await.unwrap();
        let b = registry.create(create_input("b", None)).await.unwrap();
        let c = registry.create(create_input("c", None)).await.unwrap();

        // c: 3 -> 1; a and b step down the list.
        registry
            .update(
                c.id,
                UpdateProvider {
                    evaluation_order: Some(1),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let providers = registry.list().await.unwrap();
        let order_of = |id| {
            providers
                .iter()
                .find(|p| p.id == id)
                .unwrap()
                .evaluation_order
        };
        assert_eq!(order_of(c.id), 1);
        assert_eq!(order_of(a.id), 2);
        assert_eq!(order_of(b.id), 3);
        assert_contiguous(&registry).await;
    }

    #[tokio::test]
    async fn test_delete_collapses_gap() {
        let (registry, _) = registry();
        let _a = registry.create(create_input("a", None)).await.unwrap();
        let b = registry.create(create_input("b", None)).await.unwrap();
        let c = registry.create(create_input("c", None)).await.unwrap();

        assert!(registry.delete(b.id).await.unwrap());

        let providers = registry.list().await.unwrap();
        assert_eq!(providers.len(), 2);
        let order_of = |id| {
            providers
                .iter()
                .find(|p| p.id == id)
                .unwrap()
                .evaluation_order
        };
        assert_eq!(order_of(c.id), 2);
        assert_contiguous(&registry).await;
    }

    #[tokio::test]
    async fn test_mixed_operation_sequence_keeps_invariant() {
        let (registry, _) = registry();

        let mut ids = Vec::new();
        for i in 0..5 {
            let provider = registry
                .create(create_input(&format!("p{i}"), Some(i % 3)))
                .await
                .unwrap();
            ids.push(provider.id);
            assert_contiguous(&registry).await;
        }

        registry
            .update(
                ids[0],
                UpdateProvider {
                    evaluation_order: Some(5),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_contiguous(&registry).await;

        registry.delete(ids[2]).await.unwrap();
        assert_contiguous(&registry).await;

        registry
            .update(
                ids[4],
                UpdateProvider {
                    evaluation_order: Some(-10),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_contiguous(&registry).await;

        registry.create(create_input("late", Some(2))).await.unwrap();
        assert_contiguous(&registry).await;
    }

    #[tokio::test]
    async fn test_key_and_driver_normalized_on_create() {
        let (registry, _) = registry();
        let provider = registry
            .create(CreateProvider {
                key: "  Corp Okta  ".to_string(),
                name: Some("Corp Okta".to_string()),
                driver: " SAML ".to_string(),
                enabled: true,
                evaluation_order: None,
                config: json!({}),
                meta: None,
            })
            .await
            .unwrap();

        assert_eq!(provider.key, "corp-okta");
        assert_eq!(provider.driver, "saml");
    }

    #[tokio::test]
    async fn test_invalid_inputs_rejected() {
        let (registry, _) = registry();

        let err = registry.create(create_input("###", None)).await.unwrap_err();
        assert!(matches!(err, LoginError::Validation(_)));

        let mut input = create_input("ok", None);
        input.driver = "radius".to_string();
        let err = registry.create(input).await.unwrap_err();
        assert!(matches!(err, LoginError::UnsupportedDriver(_)));

        let mut input = create_input("ok", None);
        input.config = json!(["not", "an", "object"]);
        let err = registry.create(input).await.unwrap_err();
        assert!(matches!(err, LoginError::Validation(_)));
    }

    #[tokio::test]
    async fn test_find_by_id_or_key() {
        let (registry, _) = registry();
        let provider = registry.create(create_input("corp-okta", None)).await.unwrap();

        let by_id = registry
            .find_by_id_or_key(&provider.id.to_string())
            .await
            .unwrap();
        assert_eq!(by_id.id, provider.id);

        // Keys are normalized on lookup too.
        let by_key = registry.find_by_id_or_key("Corp Okta").await.unwrap();
        assert_eq!(by_key.id, provider.id);

        let err = registry.find_by_id_or_key("missing").await.unwrap_err();
        assert!(matches!(err, LoginError::ProviderNotFound(_)));
    }

    #[tokio::test]
    async fn test_has_enabled_provider() {
        let (registry, _) = registry();
        assert!(!registry.has_enabled_provider().await.unwrap());

        let provider = registry.create(create_input("a", None)).await.unwrap();
        assert!(registry.has_enabled_provider().await.unwrap());

        registry
            .update(
                provider.id,
                UpdateProvider {
                    enabled: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(!registry.has_enabled_provider().await.unwrap());
    }

    #[tokio::test]
    async fn test_unconfigured_registry_refuses() {
        let registry = ProviderRegistry::unconfigured();
        let err = registry.create(create_input("a", None)).await.unwrap_err();
        assert!(matches!(err, LoginError::RegistryUnavailable));

        let err = registry.has_enabled_provider().await.unwrap_err();
        assert!(matches!(err, LoginError::RegistryUnavailable));
    }
}
