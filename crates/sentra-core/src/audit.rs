//! Structured audit events.
//!
//! Every authentication path records success and failure events through an
//! [`AuditSink`]. Emission is strictly best-effort: a sink failure is logged
//! and discarded, it must never change the outcome of a login.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Audit actions recorded by the federation subsystem.
pub mod actions {
    pub const LDAP_LOGIN: &str = "auth.ldap.login";
    pub const OIDC_LOGIN: &str = "auth.oidc.login";
    pub const OIDC_LOGIN_FAILED: &str = "auth.oidc.login.failed";
    pub const SAML_LOGIN: &str = "auth.saml.login";
    pub const LOGIN_FAILED: &str = "auth.login.failed";
    pub const LOGIN_LOCKED: &str = "auth.login.locked";
}

/// A single audit record.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    /// Acting user, when one was resolved.
    pub actor_id: Option<Uuid>,
    /// Action slug, e.g. `auth.saml.login`.
    pub action: String,
    /// Event category, e.g. `authentication`.
    pub category: String,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    /// Client IP address.
    pub ip: Option<String>,
    /// Client user agent.
    pub user_agent: Option<String>,
    /// Free-form metadata (provider key, issuer, failure reasons).
    pub meta: Value,
}

impl AuditEvent {
    #[must_use]
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            actor_id: None,
            action: action.into(),
            category: "authentication".to_string(),
            entity_type: None,
            entity_id: None,
            ip: None,
            user_agent: None,
            meta: Value::Null,
        }
    }

    #[must_use]
    pub fn actor(mut self, actor_id: Uuid) -> Self {
        self.actor_id = Some(actor_id);
        self
    }

    #[must_use]
    pub fn entity(mut self, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id.into());
        self
    }

    #[must_use]
    pub fn client(mut self, ip: Option<&str>, user_agent: Option<&str>) -> Self {
        self.ip = ip.map(str::to_string);
        self.user_agent = user_agent.map(str::to_string);
        self
    }

    #[must_use]
    pub fn meta(mut self, meta: Value) -> Self {
        self.meta = meta;
        self
    }
}

/// Audit sink errors.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("audit sink error: {0}")]
    Sink(String),
}

/// Audit log capability.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn log(&self, event: AuditEvent) -> Result<(), AuditError>;
}

/// Emit an event, swallowing sink failures.
pub async fn emit(sink: &dyn AuditSink, event: AuditEvent) {
    let action = event.action.clone();
    if let Err(e) = sink.log(event).await {
        // Audit must never abort authentication; record the loss and move on.
        tracing::warn!(action = %action, error = %e, "audit event dropped");
    }
}

/// Sink that forwards events to the tracing subscriber.
#[derive(Debug, Default, Clone)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn log(&self, event: AuditEvent) -> Result<(), AuditError> {
        tracing::info!(
            action = %event.action,
            category = %event.category,
            actor_id = ?event.actor_id,
            entity_type = ?event.entity_type,
            entity_id = ?event.entity_id,
            ip = ?event.ip,
            meta = %event.meta,
            "audit"
        );
        Ok(())
    }
}

/// Sink that records events in memory, for assertions in tests.
#[derive(Debug, Default, Clone)]
pub struct RecordingAuditSink {
    events: Arc<Mutex<Vec<AuditEvent>>>,
}

impl RecordingAuditSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().await.clone()
    }

    pub async fn actions(&self) -> Vec<String> {
        self.events
            .lock()
            .await
            .iter()
            .map(|e| e.action.clone())
            .collect()
    }
}

#[async_trait]
impl AuditSink for RecordingAuditSink {
    async fn log(&self, event: AuditEvent) -> Result<(), AuditError> {
        self.events.lock().await.push(event);
        Ok(())
    }
}
