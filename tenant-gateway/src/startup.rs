//! Router construction and server lifecycle.

use axum::{
    middleware::{from_fn, from_fn_with_state},
    routing::get,
    Router,
};
use service_core::error::AppError;
use service_core::middleware::{metrics::metrics_middleware, tracing::request_id_middleware};
use std::future::{Future, IntoFuture};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::GatewayConfig;
use crate::handlers::{
    app::{health_check, metrics, not_found},
    handle_match_with_tenant, handle_passthrough, handle_query_with_tenant,
};
use crate::middleware::authentication_middleware;
use crate::services::IdentityVerifier;
use crate::AppState;

/// Endpoints whose `query` parameter is scoped.
const FREE_FORM_ROUTES: &[&str] = &[
    "/api/v1/query",
    "/api/v1/query_range",
    "/api/v1/query_exemplars",
    "/api/v1/format_query",
    "/api/v1/parse_query",
];

/// Endpoints whose `match[]` parameters are scoped.
const SELECTOR_ROUTES: &[&str] = &["/api/v1/series", "/api/v1/labels", "/api/v1/rules"];

pub fn build_router(state: AppState) -> Router {
    let mut api = Router::new();
    for path in FREE_FORM_ROUTES {
        api = api
            .route(path, get(handle_query_with_tenant))
            .route(&format!("{}/*rest", path), get(handle_query_with_tenant));
    }
    for path in SELECTOR_ROUTES {
        api = api
            .route(path, get(handle_match_with_tenant))
            .route(&format!("{}/*rest", path), get(handle_match_with_tenant));
    }
    let api = api
        .route("/api/v1/label/*rest", get(handle_match_with_tenant))
        .route("/api/v1/status/*rest", get(handle_passthrough))
        .route_layer(from_fn_with_state(state.clone(), authentication_middleware));

    let router = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .merge(api)
        .fallback(not_found)
        .layer(from_fn(metrics_middleware))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    path = %request.uri().path(),
                )
            }),
        )
        .layer(from_fn(request_id_middleware));

    let router = if state.config.enable_cors {
        router.layer(CorsLayer::permissive())
    } else {
        router
    };

    router.with_state(state)
}

/// Bound listener plus router, ready to serve.
pub struct Application {
    port: u16,
    listener: TcpListener,
    router: Router,
    shutdown_timeout: Duration,
}

impl Application {
    /// Bind `0.0.0.0:{server.port}`; port 0 picks a free port.
    pub async fn build(
        config: GatewayConfig,
        verifier: Arc<dyn IdentityVerifier>,
    ) -> Result<Self, AppError> {
        let shutdown_timeout = config.shutdown_timeout();
        let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));

        let state = AppState::new(config, verifier)
            .map_err(|e| AppError::ConfigError(anyhow::anyhow!(e)))?;

        tracing::info!(
            upstream = %state.upstream.host(),
            development_mode = state.config.development_mode,
            bypass_policies = ?state.bypass.names(),
            "Gateway configured"
        );

        let router = build_router(state);

        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %addr, "Failed to bind listener");
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        Ok(Self {
            port,
            listener,
            router,
            shutdown_timeout,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Serve until `shutdown` resolves, then give in-flight requests up to
    /// the configured shutdown timeout to finish.
    pub async fn run_until_stopped<F>(self, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let drain = CancellationToken::new();
        let draining = drain.clone();

        let server = axum::serve(self.listener, self.router)
            .with_graceful_shutdown(async move { draining.cancelled().await })
            .into_future();
        tokio::pin!(server);

        tracing::info!(
            service = "tenant-gateway",
            version = env!("CARGO_PKG_VERSION"),
            port = self.port,
            "Service ready to accept connections"
        );

        tokio::select! {
            result = &mut server => return result,
            _ = shutdown => {}
        }

        tracing::info!(
            timeout_secs = self.shutdown_timeout.as_secs(),
            "Draining in-flight requests"
        );
        drain.cancel();

        match tokio::time::timeout(self.shutdown_timeout, server).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!("Shutdown timeout elapsed, dropping remaining connections");
                Ok(())
            }
        }
    }
}
