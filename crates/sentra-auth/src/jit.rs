//! Just-in-time provisioning settings and role resolution.
//!
//! All three federation drivers resolve roles the same way, so the matching
//! algorithm lives here once, as a stateless function over a claim-lookup
//! capability, rather than being repeated per driver.

use crate::error::{AuthError, AuthResult};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// A rule granting roles when a claim carries one of the listed values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleTemplate {
    /// Claim/attribute name to inspect.
    pub claim: String,
    /// Values that activate the template.
    pub values: Vec<String>,
    /// Roles granted on a match.
    pub roles: Vec<Uuid>,
}

/// JIT settings parsed from a provider's config map.
#[derive(Debug, Clone, Default)]
pub struct JitSettings {
    /// Whether unknown identities may be auto-provisioned.
    pub create_users: bool,
    /// Roles every federated login receives.
    pub default_roles: Vec<Uuid>,
    pub role_templates: Vec<RoleTemplate>,
}

impl JitSettings {
    /// Parse JIT settings from the opaque driver config.
    ///
    /// Recognized keys: `create_users`, `default_roles`, `role_templates`.
    /// A missing key falls back to its default; a key of the wrong shape is
    /// a configuration error. Role ids that do not parse as UUIDs are
    /// dropped here, matching the "unknown ids are silently ignored" rule.
    pub fn from_config(config: &Value) -> AuthResult<Self> {
        let create_users = match config.get("create_users") {
            None | Some(Value::Null) => false,
            Some(Value::Bool(b)) => *b,
            Some(_) => {
                return Err(AuthError::InvalidJitConfig(
                    "create_users must be a boolean".to_string(),
                ))
            }
        };

        let default_roles = match config.get("default_roles") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => parse_role_ids(items),
            Some(_) => {
                return Err(AuthError::InvalidJitConfig(
                    "default_roles must be an array".to_string(),
                ))
            }
        };

        let role_templates = match config.get("role_templates") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => {
                let mut templates = Vec::with_capacity(items.len());
                for item in items {
                    let Some(obj) = item.as_object() else {
                        return Err(AuthError::InvalidJitConfig(
                            "role_templates entries must be objects".to_string(),
                        ));
                    };
                    let claim = obj
                        .get("claim")
                        .and_then(Value::as_str)
                        .ok_or_else(|| {
                            AuthError::InvalidJitConfig(
                                "role_templates entries require a claim".to_string(),
                            )
                        })?
                        .to_string();
                    let values = obj
                        .get("values")
                        .and_then(Value::as_array)
                        .map(|vals| {
                            vals.iter()
                                .filter_map(Value::as_str)
                                .map(str::to_string)
                                .collect()
                        })
                        .unwrap_or_default();
                    let roles = obj
                        .get("roles")
                        .and_then(Value::as_array)
                        .map(|r| parse_role_ids(r))
                        .unwrap_or_default();
                    templates.push(RoleTemplate {
                        claim,
                        values,
                        roles,
                    });
                }
                templates
            }
            Some(_) => {
                return Err(AuthError::InvalidJitConfig(
                    "role_templates must be an array".to_string(),
                ))
            }
        };

        Ok(Self {
            create_users,
            default_roles,
            role_templates,
        })
    }
}

fn parse_role_ids(items: &[Value]) -> Vec<Uuid> {
    items
        .iter()
        .filter_map(Value::as_str)
        .filter_map(|s| match s.trim().parse::<Uuid>() {
            Ok(id) => Some(id),
            Err(_) => {
                tracing::debug!(role = %s, "dropping non-uuid role id from JIT config");
                None
            }
        })
        .collect()
}

/// Claim lookup capability over whatever claim shape a driver produced.
pub trait ClaimLookup {
    /// All values for a claim; empty when the claim is absent.
    fn values(&self, claim: &str) -> Vec<String>;
}

/// SAML/LDAP attribute maps: multi-valued string attributes.
impl ClaimLookup for HashMap<String, Vec<String>> {
    fn values(&self, claim: &str) -> Vec<String> {
        self.get(claim)
            .or_else(|| self.get(&claim.to_lowercase()))
            .cloned()
            .unwrap_or_default()
    }
}

/// OIDC claim maps: arbitrary JSON values per claim.
impl ClaimLookup for HashMap<String, Value> {
    fn values(&self, claim: &str) -> Vec<String> {
        match self.get(claim).or_else(|| self.get(&claim.to_lowercase())) {
            Some(Value::String(s)) => vec![s.clone()],
            Some(Value::Bool(b)) => vec![b.to_string()],
            Some(Value::Number(n)) => vec![n.to_string()],
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| match v {
                    Value::String(s) => Some(s.clone()),
                    Value::Number(n) => Some(n.to_string()),
                    Value::Bool(b) => Some(b.to_string()),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Resolve the role set for a login: default roles plus every template whose
/// claim values intersect the presented claims. The result preserves first
/// occurrence order and contains no duplicates. Whether an id actually
/// exists is decided later, against the role store.
pub fn resolve_roles(jit: &JitSettings, lookup: &dyn ClaimLookup) -> Vec<Uuid> {
    let mut resolved: Vec<Uuid> = Vec::new();
    let mut push = |id: Uuid, resolved: &mut Vec<Uuid>| {
        if !resolved.contains(&id) {
            resolved.push(id);
        }
    };

    for id in &jit.default_roles {
        push(*id, &mut resolved);
    }

    for template in &jit.role_templates {
        let presented: Vec<String> = lookup
            .values(&template.claim)
            .into_iter()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .collect();

        let matched = presented
            .iter()
            .any(|v| template.values.iter().any(|t| t == v));

        if matched {
            for id in &template.roles {
                push(*id, &mut resolved);
            }
        }
    }

    resolved
}
