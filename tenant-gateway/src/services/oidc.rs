//! Identity token verification against an OpenID Connect provider.

use async_trait::async_trait;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::jwk::{AlgorithmParameters, Jwk, JwkSet, KeyAlgorithm};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use reqwest::Client;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};

use crate::config::OidcSettings;
use crate::models::IdentityClaims;

/// Unknown key ids reload the JWKS at most this often.
pub const MIN_KEY_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("OIDC discovery failed: {0}")]
    Discovery(String),

    #[error("failed to fetch signing keys: {0}")]
    Jwks(String),

    #[error("invalid identity token: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),

    #[error("identity token signed with unknown key: {0}")]
    UnknownKey(String),
}

/// Turns a bearer credential into verified identity claims.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, bearer: &str) -> Result<IdentityClaims, AuthError>;
}

#[derive(Debug, Deserialize)]
struct ProviderMetadata {
    issuer: String,
    jwks_uri: String,
}

/// Verifies ID tokens issued by the configured provider: signature via the
/// provider's JWKS, `iss`, `aud` (client id) and expiry.
///
/// The signing algorithm comes from the key, not the token: a key that
/// declares `alg` accepts only that algorithm, otherwise only the algorithms
/// of its key type.
pub struct OidcVerifier {
    client: Client,
    issuer: String,
    client_id: String,
    jwks_uri: String,
    keys: RwLock<JwkSet>,
    /// Held for the duration of a reload so concurrent misses share one fetch.
    last_refresh: Mutex<Instant>,
    min_refresh_interval: Duration,
}

impl OidcVerifier {
    /// Resolve provider metadata from `{issuer}/.well-known/openid-configuration`
    /// and load the current signing keys.
    ///
    /// With `accept_invalid_certs` the provider's TLS certificate is not
    /// checked (development mode only).
    pub async fn discover(
        settings: &OidcSettings,
        accept_invalid_certs: bool,
    ) -> Result<Self, AuthError> {
        let client = Client::builder()
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()
            .map_err(|e| AuthError::Discovery(e.to_string()))?;

        let issuer = settings.issuer.trim_end_matches('/').to_string();
        let discovery_url = format!("{}/.well-known/openid-configuration", issuer);

        let metadata: ProviderMetadata = client
            .get(&discovery_url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| AuthError::Discovery(format!("{}: {}", discovery_url, e)))?
            .json()
            .await
            .map_err(|e| AuthError::Discovery(format!("{}: {}", discovery_url, e)))?;

        if metadata.issuer.trim_end_matches('/') != issuer {
            return Err(AuthError::Discovery(format!(
                "issuer mismatch: expected {}, provider reported {}",
                issuer, metadata.issuer
            )));
        }

        let verifier = Self {
            client,
            issuer: metadata.issuer,
            client_id: settings.client_id.clone(),
            jwks_uri: metadata.jwks_uri,
            keys: RwLock::new(JwkSet { keys: Vec::new() }),
            last_refresh: Mutex::new(Instant::now()),
            min_refresh_interval: MIN_KEY_REFRESH_INTERVAL,
        };
        verifier.refresh_keys().await?;

        tracing::info!(
            issuer = %verifier.issuer,
            jwks_uri = %verifier.jwks_uri,
            "OIDC provider discovered"
        );

        Ok(verifier)
    }

    pub fn with_min_refresh_interval(mut self, interval: Duration) -> Self {
        self.min_refresh_interval = interval;
        self
    }

    async fn refresh_keys(&self) -> Result<(), AuthError> {
        let jwks: JwkSet = self
            .client
            .get(&self.jwks_uri)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| AuthError::Jwks(e.to_string()))?
            .json()
            .await
            .map_err(|e| AuthError::Jwks(e.to_string()))?;

        tracing::debug!(keys = jwks.keys.len(), "Loaded provider signing keys");
        *self.keys.write().await = jwks;
        Ok(())
    }

    async fn find_key(&self, kid: Option<&str>) -> Option<Jwk> {
        let keys = self.keys.read().await;
        match kid {
            Some(kid) => keys.find(kid).cloned(),
            // Without a key id only an unambiguous single key is usable.
            None if keys.keys.len() == 1 => keys.keys.first().cloned(),
            None => None,
        }
    }

    async fn signing_key(&self, kid: Option<&str>) -> Result<Jwk, AuthError> {
        if let Some(jwk) = self.find_key(kid).await {
            return Ok(jwk);
        }

        let mut last_refresh = self.last_refresh.lock().await;
        // Another request may have reloaded while this one waited.
        if let Some(jwk) = self.find_key(kid).await {
            return Ok(jwk);
        }

        if last_refresh.elapsed() >= self.min_refresh_interval {
            *last_refresh = Instant::now();
            self.refresh_keys().await?;
            if let Some(jwk) = self.find_key(kid).await {
                return Ok(jwk);
            }
        } else {
            tracing::debug!(
                kid = kid.unwrap_or("<none>"),
                "Signing keys reloaded recently, not refetching"
            );
        }

        Err(AuthError::UnknownKey(kid.unwrap_or("<none>").to_string()))
    }
}

/// The algorithm `jwk` verifies `requested` tokens with, if it may.
fn pinned_algorithm(jwk: &Jwk, requested: Algorithm) -> Result<Algorithm, AuthError> {
    let allowed = match &jwk.common.key_algorithm {
        Some(declared) => declared_algorithm(declared).map_or(false, |alg| alg == requested),
        None => key_type_algorithms(&jwk.algorithm).contains(&requested),
    };

    if allowed {
        Ok(requested)
    } else {
        Err(AuthError::InvalidToken(ErrorKind::InvalidAlgorithm.into()))
    }
}

#[allow(unreachable_patterns)]
fn declared_algorithm(declared: &KeyAlgorithm) -> Option<Algorithm> {
    match declared {
        KeyAlgorithm::HS256 => Some(Algorithm::HS256),
        KeyAlgorithm::HS384 => Some(Algorithm::HS384),
        KeyAlgorithm::HS512 => Some(Algorithm::HS512),
        KeyAlgorithm::ES256 => Some(Algorithm::ES256),
        KeyAlgorithm::ES384 => Some(Algorithm::ES384),
        KeyAlgorithm::RS256 => Some(Algorithm::RS256),
        KeyAlgorithm::RS384 => Some(Algorithm::RS384),
        KeyAlgorithm::RS512 => Some(Algorithm::RS512),
        KeyAlgorithm::PS256 => Some(Algorithm::PS256),
        KeyAlgorithm::PS384 => Some(Algorithm::PS384),
        KeyAlgorithm::PS512 => Some(Algorithm::PS512),
        KeyAlgorithm::EdDSA => Some(Algorithm::EdDSA),
        // Encryption algorithms never sign.
        _ => None,
    }
}

#[allow(unreachable_patterns)]
fn key_type_algorithms(params: &AlgorithmParameters) -> &'static [Algorithm] {
    match params {
        AlgorithmParameters::RSA(_) => &[
            Algorithm::RS256,
            Algorithm::RS384,
            Algorithm::RS512,
            Algorithm::PS256,
            Algorithm::PS384,
            Algorithm::PS512,
        ],
        AlgorithmParameters::EllipticCurve(_) => &[Algorithm::ES256, Algorithm::ES384],
        AlgorithmParameters::OctetKeyPair(_) => &[Algorithm::EdDSA],
        AlgorithmParameters::OctetKey(_) => &[Algorithm::HS256, Algorithm::HS384, Algorithm::HS512],
        _ => &[],
    }
}

#[async_trait]
impl IdentityVerifier for OidcVerifier {
    async fn verify(&self, bearer: &str) -> Result<IdentityClaims, AuthError> {
        let header = decode_header(bearer)?;
        let jwk = self.signing_key(header.kid.as_deref()).await?;
        let algorithm = pinned_algorithm(&jwk, header.alg)?;
        let key = DecodingKey::from_jwk(&jwk)?;

        let mut validation = Validation::new(algorithm);
        validation.set_audience(&[&self.client_id]);
        validation.set_issuer(&[&self.issuer]);

        let token = decode::<IdentityClaims>(bearer, &key, &validation)?;
        Ok(token.claims)
    }
}
