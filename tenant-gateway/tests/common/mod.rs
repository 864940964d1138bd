//! Shared setup for gateway integration tests.
//!
//! The router is driven in-process with `oneshot`; the upstream is a
//! wiremock server and identities come from a fixed token table.

#![allow(dead_code)]

use axum::{
    body::{to_bytes, Body},
    http::{header, Request, StatusCode},
    Router,
};
use std::collections::HashMap;
use std::sync::Arc;
use tenant_gateway::config::GatewayConfig;
use tenant_gateway::models::IdentityClaims;
use tenant_gateway::services::{AuthError, IdentityVerifier};
use tenant_gateway::startup::build_router;
use tenant_gateway::AppState;
use tower::ServiceExt;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const TENANT_TOKEN: &str = "token-acme";
pub const NO_TENANT_TOKEN: &str = "token-no-tenant";
pub const ADMIN_TOKEN: &str = "token-admin";
pub const ADMIN_EMAIL: &str = "admin@example.com";

pub const UPSTREAM_BODY: &str = r#"{"status":"success","data":{"resultType":"vector","result":[]}}"#;

/// Accepts a fixed set of bearer tokens.
pub struct StaticVerifier {
    identities: HashMap<&'static str, IdentityClaims>,
}

impl Default for StaticVerifier {
    fn default() -> Self {
        let identities = HashMap::from([
            (
                TENANT_TOKEN,
                IdentityClaims::new("user@example.com", &["tenant:acme", "developers"]),
            ),
            (
                NO_TENANT_TOKEN,
                IdentityClaims::new("nobody@example.com", &["developers", "admin"]),
            ),
            (ADMIN_TOKEN, IdentityClaims::new(ADMIN_EMAIL, &["operators"])),
        ]);
        Self { identities }
    }
}

#[async_trait::async_trait]
impl IdentityVerifier for StaticVerifier {
    async fn verify(&self, bearer: &str) -> Result<IdentityClaims, AuthError> {
        self.identities
            .get(bearer)
            .cloned()
            .ok_or_else(|| AuthError::UnknownKey(bearer.to_string()))
    }
}

pub enum UpstreamFailure {
    Status(u16),
    Unreachable,
}

pub struct TestApp {
    pub router: Router,
    pub upstream: MockServer,
}

pub struct TestResponse {
    pub status: StatusCode,
    pub content_type: Option<String>,
    pub body: String,
}

impl TestResponse {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_str(&self.body).expect("response body is not JSON")
    }
}

impl TestApp {
    pub async fn spawn() -> Self {
        Self::spawn_with(|_| {}).await
    }

    /// Start with default settings adjusted by `configure`; the upstream
    /// answers every GET with 200 and a Prometheus-style body.
    pub async fn spawn_with(configure: impl FnOnce(&mut GatewayConfig)) -> Self {
        let upstream = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(UPSTREAM_BODY, "application/json"),
            )
            .mount(&upstream)
            .await;

        let host = upstream.address().to_string();
        Self::with_upstream(upstream, host, configure)
    }

    pub async fn spawn_failing(failure: UpstreamFailure) -> Self {
        let upstream = MockServer::start().await;
        let host = match failure {
            UpstreamFailure::Status(status) => {
                Mock::given(method("GET"))
                    .respond_with(
                        ResponseTemplate::new(status)
                            .set_body_raw(r#"{"status":"error"}"#, "application/json"),
                    )
                    .mount(&upstream)
                    .await;
                upstream.address().to_string()
            }
            UpstreamFailure::Unreachable => {
                // Nothing listens on a port once its listener is dropped.
                let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
                listener.local_addr().unwrap().to_string()
            }
        };

        Self::with_upstream(upstream, host, |_| {})
    }

    fn with_upstream(
        upstream: MockServer,
        host: String,
        configure: impl FnOnce(&mut GatewayConfig),
    ) -> Self {
        let mut config = GatewayConfig::default();
        config.upstream.host = host;
        config.upstream.timeout_secs = 5;
        configure(&mut config);
        let config = config.validated().expect("invalid test configuration");

        let state = AppState::new(config, Arc::new(StaticVerifier::default()))
            .expect("failed to build state");

        Self {
            router: build_router(state),
            upstream,
        }
    }

    pub async fn get(&self, uri: &str, token: Option<&str>) -> TestResponse {
        let mut request = Request::builder().method("GET").uri(uri);
        if let Some(token) = token {
            request = request.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }

        let response = self
            .router
            .clone()
            .oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap();

        let status = response.status();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();

        TestResponse {
            status,
            content_type,
            body: String::from_utf8(body.to_vec()).unwrap(),
        }
    }

    /// Query parameters of every request the upstream received, in order.
    pub async fn forwarded(&self) -> Vec<ForwardedRequest> {
        self.upstream
            .received_requests()
            .await
            .unwrap_or_default()
            .into_iter()
            .map(|request| ForwardedRequest {
                path: request.url.path().to_string(),
                params: request.url.query_pairs().into_owned().collect(),
                content_type: request
                    .headers
                    .get("content-type")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string),
                request_id: request
                    .headers
                    .get("x-request-id")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string),
            })
            .collect()
    }

    pub async fn only_forwarded(&self) -> ForwardedRequest {
        let mut forwarded = self.forwarded().await;
        assert_eq!(forwarded.len(), 1, "expected exactly one upstream request");
        forwarded.remove(0)
    }
}

#[derive(Debug)]
pub struct ForwardedRequest {
    pub path: String,
    pub params: Vec<(String, String)>,
    pub content_type: Option<String>,
    pub request_id: Option<String>,
}

impl ForwardedRequest {
    pub fn all(&self, name: &str) -> Vec<&str> {
        self.params
            .iter()
            .filter(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.all(name).into_iter().next()
    }
}

/// Every selector in `expr`, and every `or` alternative inside it, carries
/// `tenantId="<tenant>"`. Returns the number of selectors.
pub fn assert_scoped(expr: &str, tenant: &str) -> usize {
    let mut parsed = promql_parser::parser::parse(expr)
        .unwrap_or_else(|e| panic!("forwarded expression {expr:?} does not parse: {e}"));
    let mut selectors = 0;
    tenant_gateway::services::rewriter::visit_selectors_mut(&mut parsed, &mut |vs| {
        selectors += 1;
        for group in tenant_gateway::services::rewriter::matcher_groups(vs) {
            assert!(
                group.iter().any(|m| m.name == "tenantId" && m.value == tenant),
                "matchers {group:?} of {vs:?} in {expr:?} are not scoped to {tenant}"
            );
        }
    })
    .unwrap();
    assert!(selectors > 0, "no selectors in {expr:?}");
    selectors
}

pub fn encode(value: &str) -> String {
    serde_urlencoded::to_string(&[("v", value)]).unwrap()[2..].to_string()
}
