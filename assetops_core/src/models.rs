use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Exclusivity scope used for runs that are not tied to a tenant.
pub const SYSTEM_SCOPE: &str = "system";

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum IdParseError {
    #[error("invalid uuid: {0}")]
    InvalidUuid(String),
}

/// Tenant identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub Uuid);

impl TenantId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TenantId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<Uuid> for TenantId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl FromStr for TenantId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id = Uuid::parse_str(s).map_err(|_| IdParseError::InvalidUuid(s.to_string()))?;
        Ok(Self(id))
    }
}

/// Key under which the single-active-run rule and record ownership are enforced.
///
/// Tenant runs use the tenant id; system-wide runs share [`SYSTEM_SCOPE`].
pub fn scope_key(tenant_id: Option<TenantId>) -> String {
    match tenant_id {
        Some(t) => t.to_string(),
        None => SYSTEM_SCOPE.to_string(),
    }
}

/// Inverse of [`scope_key`]. Unknown strings map to the system scope.
pub fn tenant_from_scope(scope: &str) -> Option<TenantId> {
    if scope == SYSTEM_SCOPE {
        return None;
    }
    scope.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_key_roundtrips_tenant_and_system() {
        let tenant = TenantId::new();
        assert_eq!(tenant_from_scope(&scope_key(Some(tenant))), Some(tenant));
        assert_eq!(scope_key(None), SYSTEM_SCOPE);
        assert_eq!(tenant_from_scope(SYSTEM_SCOPE), None);
    }

    #[test]
    fn tenant_id_rejects_garbage() {
        assert!("not-a-uuid".parse::<TenantId>().is_err());
    }
}
