pub mod claims;
pub mod tenant;

pub use claims::IdentityClaims;
pub use tenant::{
    resolve_tenant, TenantError, TenantId, TenantMatcher, TENANT_GROUP_PREFIX, TENANT_LABEL,
};
