pub mod config;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod startup;

use crate::config::GatewayConfig;
use crate::services::{
    BypassPolicies, IdentityVerifier, PromqlRewriter, QueryRewriter, UpstreamClient, UpstreamError,
};
use std::sync::Arc;

/// Shared, read-only state handed to every request.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub verifier: Arc<dyn IdentityVerifier>,
    pub rewriter: Arc<dyn QueryRewriter>,
    pub bypass: Arc<BypassPolicies>,
    pub upstream: Arc<UpstreamClient>,
}

impl AppState {
    /// State with the PromQL rewriter and the bypass policies `config` enables.
    pub fn new(
        config: GatewayConfig,
        verifier: Arc<dyn IdentityVerifier>,
    ) -> Result<Self, UpstreamError> {
        let upstream = UpstreamClient::new(config.upstream.host.clone(), config.upstream.timeout())?;
        let bypass = BypassPolicies::from_config(&config);

        Ok(Self {
            config: Arc::new(config),
            verifier,
            rewriter: Arc::new(PromqlRewriter),
            bypass: Arc::new(bypass),
            upstream: Arc::new(upstream),
        })
    }
}
