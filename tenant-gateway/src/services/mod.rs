pub mod metrics;
pub mod oidc;
pub mod policy;
pub mod rewriter;
pub mod upstream;

pub use metrics::{get_metrics, init_metrics};
pub use oidc::{AuthError, IdentityVerifier, OidcVerifier};
pub use policy::{
    AdminEmailBypass, BypassDecision, BypassPolicies, BypassPolicy, DevelopmentModeBypass,
};
pub use rewriter::{PromqlRewriter, QueryRewriter, RewriteError};
pub use upstream::{UpstreamClient, UpstreamError, UpstreamResponse};
