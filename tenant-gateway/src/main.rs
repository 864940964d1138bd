use dotenvy::dotenv;
use service_core::observability::init_tracing;
use std::sync::Arc;
use tenant_gateway::config::GatewayConfig;
use tenant_gateway::services::{init_metrics, OidcVerifier};
use tenant_gateway::startup::Application;
use tokio::signal;

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    let config = GatewayConfig::load().map_err(|e| {
        eprintln!("Failed to read configuration: {}", e);
        anyhow::anyhow!("Configuration error: {}", e)
    })?;

    init_tracing(
        "tenant-gateway",
        &config.server.log_level,
        config.server.otlp_endpoint.as_deref(),
    )?;

    init_metrics()?;

    if config.development_mode {
        tracing::warn!(
            "Development mode enabled: unauthenticated requests are forwarded without tenant scoping"
        );
    }

    let verifier = OidcVerifier::discover(&config.oidc, config.development_mode)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, issuer = %config.oidc.issuer, "OIDC discovery failed");
            anyhow::anyhow!(e)
        })?;

    let application = Application::build(config, Arc::new(verifier))
        .await
        .map_err(|e| anyhow::anyhow!("Failed to start gateway: {}", e))?;

    application.run_until_stopped(shutdown_signal()).await?;

    tracing::info!("Gateway stopped");
    Ok(())
}
