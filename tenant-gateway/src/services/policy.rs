//! Ordered bypass policies.
//!
//! A bypass forwards the request without tenant scoping. Policies run in
//! order before the tenant pipeline and the first `Bypass` wins; when none
//! applies the request is scoped or rejected.

use crate::config::GatewayConfig;
use crate::models::IdentityClaims;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BypassDecision {
    /// Forward unscoped; carries the policy name for logs and metrics.
    Bypass(&'static str),
    Continue,
}

pub trait BypassPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    fn evaluate(&self, identity: Option<&IdentityClaims>) -> BypassDecision;
}

/// Unscoped access for one verified identity, matched on exact email.
#[derive(Debug, Clone)]
pub struct AdminEmailBypass {
    admin_email: String,
}

impl AdminEmailBypass {
    /// `None` for an empty address: an empty admin email matches no one.
    pub fn new(admin_email: &str) -> Option<Self> {
        (!admin_email.is_empty()).then(|| Self {
            admin_email: admin_email.to_string(),
        })
    }
}

impl BypassPolicy for AdminEmailBypass {
    fn name(&self) -> &'static str {
        "admin"
    }

    fn evaluate(&self, identity: Option<&IdentityClaims>) -> BypassDecision {
        match identity {
            Some(claims) if claims.email == self.admin_email => BypassDecision::Bypass(self.name()),
            _ => BypassDecision::Continue,
        }
    }
}

/// Anonymous access in development mode. A present identity is always
/// scoped, even in development mode.
#[derive(Debug, Clone, Copy, Default)]
pub struct DevelopmentModeBypass;

impl BypassPolicy for DevelopmentModeBypass {
    fn name(&self) -> &'static str {
        "development_mode"
    }

    fn evaluate(&self, identity: Option<&IdentityClaims>) -> BypassDecision {
        match identity {
            None => BypassDecision::Bypass(self.name()),
            Some(_) => BypassDecision::Continue,
        }
    }
}

#[derive(Default)]
pub struct BypassPolicies {
    policies: Vec<Box<dyn BypassPolicy>>,
}

impl BypassPolicies {
    /// Policies enabled by `config`: admin bypass first, then development mode.
    pub fn from_config(config: &GatewayConfig) -> Self {
        let mut policies = Self::default();
        if let Some(admin) = config.admin_email.as_deref().and_then(AdminEmailBypass::new) {
            policies = policies.with(admin);
        }
        if config.development_mode {
            policies = policies.with(DevelopmentModeBypass);
        }
        policies
    }

    pub fn with(mut self, policy: impl BypassPolicy + 'static) -> Self {
        self.policies.push(Box::new(policy));
        self
    }

    pub fn evaluate(&self, identity: Option<&IdentityClaims>) -> BypassDecision {
        self.policies
            .iter()
            .map(|policy| policy.evaluate(identity))
            .find(|decision| matches!(decision, BypassDecision::Bypass(_)))
            .unwrap_or(BypassDecision::Continue)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.policies.iter().map(|p| p.name()).collect()
    }
}
