//! Tenant-scoped forwarding of Prometheus API requests.
//!
//! Every proxied route runs the same pipeline; the routes differ only in
//! which query parameter carries the expression and what happens when it is
//! absent. That difference is described by a [`QueryConvention`].

use axum::{
    extract::State,
    http::{header, HeaderValue, Uri},
    response::{IntoResponse, Response},
    Extension,
};
use metrics::counter;
use service_core::error::AppError;
use service_core::middleware::tracing::RequestId;

use super::params::QueryParams;
use crate::error::GatewayError;
use crate::middleware::MaybeIdentity;
use crate::models::{resolve_tenant, IdentityClaims, TenantMatcher};
use crate::services::metrics::{BYPASS_TOTAL, TENANT_INJECTIONS_TOTAL, UPSTREAM_ERRORS_TOTAL};
use crate::services::{BypassDecision, UpstreamResponse};
use crate::AppState;

/// Matches every series; scoped to the tenant it selects the tenant's data.
pub const DEFAULT_MATCH_SELECTOR: &str = r#"{__name__=~".+"}"#;

/// What to do when the convention's parameter is not sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhenMissing {
    Reject,
    Default(&'static str),
}

/// How the parameter's value is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// One full expression; only the first value is kept.
    Expression,
    /// Repeated series selectors; every value is scoped.
    SelectorList,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryConvention {
    pub param: &'static str,
    pub when_missing: WhenMissing,
    pub kind: ParamKind,
}

/// `query=<expr>` on the query endpoints.
pub const FREE_FORM: QueryConvention = QueryConvention {
    param: "query",
    when_missing: WhenMissing::Reject,
    kind: ParamKind::Expression,
};

/// `match[]=<selector>` on the metadata endpoints.
pub const SELECTOR_LIST: QueryConvention = QueryConvention {
    param: "match[]",
    when_missing: WhenMissing::Default(DEFAULT_MATCH_SELECTOR),
    kind: ParamKind::SelectorList,
};

impl QueryConvention {
    /// Scope the convention's parameter in `params` to `matcher`.
    fn apply(
        &self,
        state: &AppState,
        params: &mut QueryParams,
        matcher: &TenantMatcher,
    ) -> Result<(), GatewayError> {
        if !params.has(self.param) {
            match self.when_missing {
                WhenMissing::Reject => return Err(GatewayError::MissingParameter(self.param)),
                WhenMissing::Default(selector) => params.set(self.param, selector.to_string()),
            }
        }

        match self.kind {
            ParamKind::Expression => {
                let expression = params.get(self.param).unwrap_or_default();
                let scoped = state.rewriter.inject(expression, matcher)?;
                params.set(self.param, scoped);
            }
            ParamKind::SelectorList => {
                params.try_map_all(self.param, |selector| {
                    state.rewriter.inject_selector(selector, matcher)
                })?;
            }
        }

        Ok(())
    }
}

/// Expression endpoints (`/api/v1/query`, `/api/v1/query_range`, ...).
pub async fn handle_query_with_tenant(
    State(state): State<AppState>,
    MaybeIdentity(identity): MaybeIdentity,
    request_id: Option<Extension<RequestId>>,
    uri: Uri,
) -> Result<Response, AppError> {
    let request_id = request_id.as_ref().map(|Extension(id)| id.as_str());
    forward_scoped(&state, identity.as_ref(), request_id, &uri, &FREE_FORM).await
}

/// Selector endpoints (`/api/v1/series`, `/api/v1/labels`, ...).
pub async fn handle_match_with_tenant(
    State(state): State<AppState>,
    MaybeIdentity(identity): MaybeIdentity,
    request_id: Option<Extension<RequestId>>,
    uri: Uri,
) -> Result<Response, AppError> {
    let request_id = request_id.as_ref().map(|Extension(id)| id.as_str());
    forward_scoped(&state, identity.as_ref(), request_id, &uri, &SELECTOR_LIST).await
}

/// `/api/v1/status/*`: forwarded unmodified, but only for callers that
/// would be allowed to query.
pub async fn handle_passthrough(
    State(state): State<AppState>,
    MaybeIdentity(identity): MaybeIdentity,
    request_id: Option<Extension<RequestId>>,
    uri: Uri,
) -> Result<Response, AppError> {
    let request_id = request_id.as_ref().map(|Extension(id)| id.as_str());
    let path = checked_path(&uri)?;
    let params = QueryParams::parse(uri.query())?;

    if !is_bypassed(&state, identity.as_ref()) {
        let claims = identity.as_ref().ok_or_else(GatewayError::authentication_required)?;
        resolve_tenant(claims).map_err(GatewayError::from)?;
    }

    forward(&state, path, &params, request_id).await
}

async fn forward_scoped(
    state: &AppState,
    identity: Option<&IdentityClaims>,
    request_id: Option<&str>,
    uri: &Uri,
    convention: &QueryConvention,
) -> Result<Response, AppError> {
    let path = checked_path(uri)?;
    let mut params = QueryParams::parse(uri.query())?;

    if !is_bypassed(state, identity) {
        let claims = identity.ok_or_else(GatewayError::authentication_required)?;
        let tenant = resolve_tenant(claims).map_err(GatewayError::from)?;
        let matcher = TenantMatcher::for_tenant(tenant);

        convention.apply(state, &mut params, &matcher)?;

        tracing::info!(
            tenant = %matcher.value,
            path = %path,
            param = convention.param,
            "Tenant matcher injected"
        );
        counter!(TENANT_INJECTIONS_TOTAL).increment(1);
    }

    forward(state, path, &params, request_id).await
}

/// The inbound path, if the upstream will route it to the same endpoint the
/// gateway did: no `.` or `..` segments and no encoded separators.
fn checked_path(uri: &Uri) -> Result<&str, GatewayError> {
    let path = uri.path();
    let lowered = path.to_ascii_lowercase();

    let encoded_separator =
        lowered.contains("%2f") || lowered.contains("%5c") || path.contains('\\');
    let dot_segment = lowered.split('/').any(|segment| {
        let segment = segment.replace("%2e", ".");
        segment == "." || segment == ".."
    });

    if encoded_separator || dot_segment {
        tracing::warn!(path = %path, "Rejecting non-canonical request path");
        return Err(GatewayError::InvalidPath(path.to_string()));
    }
    Ok(path)
}

fn is_bypassed(state: &AppState, identity: Option<&IdentityClaims>) -> bool {
    match state.bypass.evaluate(identity) {
        BypassDecision::Bypass(policy) => {
            tracing::info!(
                policy,
                email = identity.map(|c| c.email.as_str()).unwrap_or("-"),
                "Forwarding without tenant scoping"
            );
            counter!(BYPASS_TOTAL, "policy" => policy).increment(1);
            true
        }
        BypassDecision::Continue => false,
    }
}

async fn forward(
    state: &AppState,
    path: &str,
    params: &QueryParams,
    request_id: Option<&str>,
) -> Result<Response, AppError> {
    let upstream = state
        .upstream
        .forward(path, params, request_id)
        .await
        .map_err(|e| {
            counter!(UPSTREAM_ERRORS_TOTAL).increment(1);
            tracing::warn!(error = %e, upstream = %state.upstream.host(), "Upstream request failed");
            GatewayError::from(e)
        })?;

    Ok(relay(upstream))
}

/// The upstream's status and body, unchanged.
fn relay(upstream: UpstreamResponse) -> Response {
    let content_type = upstream
        .content_type
        .unwrap_or_else(|| HeaderValue::from_static("application/json"));

    (
        upstream.status,
        [(header::CONTENT_TYPE, content_type)],
        upstream.body,
    )
        .into_response()
}
