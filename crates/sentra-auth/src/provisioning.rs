//! Just-in-time user provisioning and role sync.
//!
//! Shared by all three federation drivers: look the user up by resolved
//! email, create them when the provider allows it, refresh the display name
//! only when it materially changed, and replace role assignments with the
//! resolved set (dropping ids the role store does not know).

use crate::error::{AuthError, AuthResult};
use crate::jit::JitSettings;
use async_trait::async_trait;
use sentra_db::models::role::Role;
use sentra_db::models::user::{NewUser, User};
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::instrument;
use uuid::Uuid;

/// A user as seen by the provisioning layer.
#[derive(Debug, Clone)]
pub struct DirectoryUser {
    pub id: Uuid,
    pub email: String,
    pub display_name: Option<String>,
}

/// Directory backend errors.
#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("directory backend error: {0}")]
    Backend(String),
}

impl From<DirectoryError> for AuthError {
    fn from(e: DirectoryError) -> Self {
        AuthError::Directory(e.to_string())
    }
}

/// User/role store capability consumed by provisioning.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find_by_email(&self, email: &str) -> Result<Option<DirectoryUser>, DirectoryError>;

    async fn create_user(
        &self,
        email: &str,
        display_name: Option<&str>,
    ) -> Result<DirectoryUser, DirectoryError>;

    async fn update_display_name(
        &self,
        id: Uuid,
        display_name: &str,
    ) -> Result<DirectoryUser, DirectoryError>;

    /// Subset of `candidates` that exist in the role store.
    async fn existing_role_ids(&self, candidates: &[Uuid]) -> Result<Vec<Uuid>, DirectoryError>;

    /// Replace the user's role assignments.
    async fn replace_roles(&self, user_id: Uuid, roles: &[Uuid]) -> Result<(), DirectoryError>;
}

/// Outcome of a provisioning run.
#[derive(Debug, Clone)]
pub struct ProvisionedUser {
    pub user: DirectoryUser,
    /// Roles actually attached (unknown ids already dropped).
    pub roles: Vec<Uuid>,
    /// Whether the account was created by this login.
    pub created: bool,
}

/// The common result every federation driver produces on success.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub user: DirectoryUser,
    pub roles: Vec<Uuid>,
    /// Whether this login created the account.
    pub created: bool,
    pub provider_key: String,
    /// Subject at the identity provider (NameID, `sub`, or bind DN).
    pub subject: String,
    pub email: String,
}

/// JIT provisioning service.
#[derive(Clone)]
pub struct ProvisioningService {
    directory: Arc<dyn UserDirectory>,
}

impl ProvisioningService {
    #[must_use]
    pub fn new(directory: Arc<dyn UserDirectory>) -> Self {
        Self { directory }
    }

    /// Provision or update the local account for a federated identity.
    #[instrument(skip(self, jit, resolved_roles))]
    pub async fn provision(
        &self,
        jit: &JitSettings,
        email: &str,
        display_name: Option<&str>,
        resolved_roles: &[Uuid],
    ) -> AuthResult<ProvisionedUser> {
        let existing = self.directory.find_by_email(email).await?;

        let (user, created) = match existing {
            Some(user) => {
                let user = self.refresh_display_name(user, display_name).await?;
                (user, false)
            }
            None if jit.create_users => {
                let user = self.directory.create_user(email, display_name).await?;
                tracing::info!(user_id = %user.id, "provisioned federated user");
                (user, true)
            }
            None => {
                tracing::info!(email = ?email, "provisioning disabled and no local account");
                return Err(AuthError::ProvisioningDenied);
            }
        };

        let roles = self.directory.existing_role_ids(resolved_roles).await?;
        self.directory.replace_roles(user.id, &roles).await?;

        Ok(ProvisionedUser {
            user,
            roles,
            created,
        })
    }

    /// Update the stored display name only when the new one is non-empty
    /// and materially different from the current value.
    async fn refresh_display_name(
        &self,
        user: DirectoryUser,
        display_name: Option<&str>,
    ) -> AuthResult<DirectoryUser> {
        let Some(new_name) = display_name.map(str::trim).filter(|n| !n.is_empty()) else {
            return Ok(user);
        };

        if user.display_name.as_deref().map(str::trim) == Some(new_name) {
            return Ok(user);
        }

        Ok(self
            .directory
            .update_display_name(user.id, new_name)
            .await?)
    }
}

/// In-memory directory for tests and local development.
#[derive(Debug, Default, Clone)]
pub struct InMemoryUserDirectory {
    users: Arc<RwLock<Vec<DirectoryUser>>>,
    roles: Arc<RwLock<Vec<Uuid>>>,
    assignments: Arc<RwLock<HashMap<Uuid, Vec<Uuid>>>>,
}

impl InMemoryUserDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a role id as known.
    pub async fn add_role(&self, id: Uuid) {
        self.roles.write().await.push(id);
    }

    pub async fn user_count(&self) -> usize {
        self.users.read().await.len()
    }

    pub async fn roles_of(&self, user_id: Uuid) -> Vec<Uuid> {
        self.assignments
            .read()
            .await
            .get(&user_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl UserDirectory for InMemoryUserDirectory {
    async fn find_by_email(&self, email: &str) -> Result<Option<DirectoryUser>, DirectoryError> {
        Ok(self
            .users
            .read()
            .await
            .iter()
            .find(|u| u.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn create_user(
        &self,
        email: &str,
        display_name: Option<&str>,
    ) -> Result<DirectoryUser, DirectoryError> {
        let user = DirectoryUser {
            id: Uuid::new_v4(),
            email: email.to_lowercase(),
            display_name: display_name.map(str::to_string),
        };
        self.users.write().await.push(user.clone());
        Ok(user)
    }

    async fn update_display_name(
        &self,
        id: Uuid,
        display_name: &str,
    ) -> Result<DirectoryUser, DirectoryError> {
        let mut users = self.users.write().await;
        let user = users
            .iter_mut()
            .find(|u| u.id == id)
            .ok_or_else(|| DirectoryError::Backend(format!("no such user {id}")))?;
        user.display_name = Some(display_name.to_string());
        Ok(user.clone())
    }

    async fn existing_role_ids(&self, candidates: &[Uuid]) -> Result<Vec<Uuid>, DirectoryError> {
        let known = self.roles.read().await;
        Ok(candidates
            .iter()
            .filter(|id| known.contains(id))
            .copied()
            .collect())
    }

    async fn replace_roles(&self, user_id: Uuid, roles: &[Uuid]) -> Result<(), DirectoryError> {
        self.assignments
            .write()
            .await
            .insert(user_id, roles.to_vec());
        Ok(())
    }
}

/// Postgres-backed directory over the sentra-db models.
#[derive(Clone)]
pub struct PgUserDirectory {
    pool: PgPool,
}

impl PgUserDirectory {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn to_directory_user(user: User) -> DirectoryUser {
    DirectoryUser {
        id: user.id,
        email: user.email,
        display_name: user.display_name,
    }
}

#[async_trait]
impl UserDirectory for PgUserDirectory {
    async fn find_by_email(&self, email: &str) -> Result<Option<DirectoryUser>, DirectoryError> {
        User::find_by_email(&self.pool, email)
            .await
            .map(|u| u.map(to_directory_user))
            .map_err(|e| DirectoryError::Backend(e.to_string()))
    }

    async fn create_user(
        &self,
        email: &str,
        display_name: Option<&str>,
    ) -> Result<DirectoryUser, DirectoryError> {
        User::create_federated(
            &self.pool,
            NewUser {
                email: email.to_string(),
                display_name: display_name.map(str::to_string),
            },
        )
        .await
        .map(to_directory_user)
        .map_err(|e| DirectoryError::Backend(e.to_string()))
    }

    async fn update_display_name(
        &self,
        id: Uuid,
        display_name: &str,
    ) -> Result<DirectoryUser, DirectoryError> {
        User::update_display_name(&self.pool, id, Some(display_name.to_string()))
            .await
            .map(to_directory_user)
            .map_err(|e| DirectoryError::Backend(e.to_string()))
    }

    async fn existing_role_ids(&self, candidates: &[Uuid]) -> Result<Vec<Uuid>, DirectoryError> {
        Role::existing_ids(&self.pool, candidates)
            .await
            .map_err(|e| DirectoryError::Backend(e.to_string()))
    }

    async fn replace_roles(&self, user_id: Uuid, roles: &[Uuid]) -> Result<(), DirectoryError> {
        User::replace_roles(&self.pool, user_id, roles)
            .await
            .map_err(|e| DirectoryError::Backend(e.to_string()))
    }
}
