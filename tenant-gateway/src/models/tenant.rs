//! Tenant identity derived from group membership.
//!
//! The identity provider asserts tenancy through a `tenant:<id>` group. The
//! resolved id is the only source of the label value the gateway enforces.

use std::fmt;

use super::IdentityClaims;

pub const TENANT_GROUP_PREFIX: &str = "tenant:";

/// Series label that carries tenant ownership in the upstream.
pub const TENANT_LABEL: &str = "tenantId";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TenantError {
    #[error("unauthorized: user has no tenant group (expected tenant: prefix)")]
    NoTenantGroup,
}

/// A non-empty tenant identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TenantId(String);

impl TenantId {
    /// Returns `None` for an empty id: an empty tenant never means "all data".
    pub fn new(id: impl Into<String>) -> Option<Self> {
        let id = id.into();
        (!id.is_empty()).then_some(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resolve the tenant from the first `tenant:`-prefixed group, in the order
/// the identity provider listed them.
pub fn resolve_tenant(claims: &IdentityClaims) -> Result<TenantId, TenantError> {
    claims
        .groups
        .iter()
        .filter_map(|group| group.strip_prefix(TENANT_GROUP_PREFIX))
        .find_map(TenantId::new)
        .ok_or(TenantError::NoTenantGroup)
}

/// The enforced condition `tenantId="<tenant>"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantMatcher {
    pub label: &'static str,
    pub value: TenantId,
}

impl TenantMatcher {
    pub fn for_tenant(tenant: TenantId) -> Self {
        Self {
            label: TENANT_LABEL,
            value: tenant,
        }
    }
}
