use axum::{
    async_trait,
    extract::{FromRequestParts, Request, State},
    http::{header, request::Parts},
    middleware::Next,
    response::Response,
};
use std::convert::Infallible;

use crate::error::GatewayError;
use crate::models::IdentityClaims;
use crate::AppState;

/// Verifies an `Authorization: Bearer` token when one is sent.
///
/// Without a bearer token the request continues anonymously; whether that
/// is allowed is decided later by the bypass policies. A token that fails
/// verification is rejected here.
pub async fn authentication_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, GatewayError> {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty());

    if let Some(token) = token {
        let claims = state.verifier.verify(token).await?;
        tracing::debug!(email = %claims.email, groups = ?claims.groups, "Identity verified");
        req.extensions_mut().insert(claims);
    }

    Ok(next.run(req).await)
}

/// Verified identity of the caller, if any.
#[derive(Debug, Clone, Default)]
pub struct MaybeIdentity(pub Option<IdentityClaims>);

#[async_trait]
impl<S> FromRequestParts<S> for MaybeIdentity
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(parts.extensions.get::<IdentityClaims>().cloned()))
    }
}
