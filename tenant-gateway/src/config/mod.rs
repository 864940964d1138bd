use serde::Deserialize;
use service_core::config as core_config;
use service_core::error::AppError;
use std::time::Duration;

/// Gateway settings, loaded once at startup and shared read-only with every
/// handler.
#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    #[serde(default = "default_server")]
    pub server: core_config::Config,
    #[serde(default)]
    pub oidc: OidcSettings,
    #[serde(default)]
    pub upstream: UpstreamSettings,
    /// Allow requests without an identity token and skip tenant injection
    /// for them. Local/test environments only.
    #[serde(default)]
    pub development_mode: bool,
    /// Verified identity with this email gets unscoped access.
    #[serde(default)]
    pub admin_email: Option<String>,
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
    #[serde(default)]
    pub enable_cors: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OidcSettings {
    /// Identity provider issuer URL (discovery base).
    #[serde(default = "default_issuer")]
    pub issuer: String,
    /// Expected `aud` of identity tokens.
    #[serde(default = "default_client_id")]
    pub client_id: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct UpstreamSettings {
    /// `host:port` of the query backend (Promxy).
    #[serde(default = "default_upstream_host")]
    pub host: String,
    #[serde(default = "default_upstream_timeout")]
    pub timeout_secs: u64,
}

fn default_server() -> core_config::Config {
    core_config::Config {
        port: 9091,
        ..core_config::Config::default()
    }
}

fn default_issuer() -> String {
    "https://dex.example.com:32000".to_string()
}

fn default_client_id() -> String {
    "grafana-id".to_string()
}

fn default_upstream_host() -> String {
    "kof-mothership-promxy:8082".to_string()
}

fn default_upstream_timeout() -> u64 {
    60
}

fn default_shutdown_timeout() -> u64 {
    5
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            server: default_server(),
            oidc: OidcSettings::default(),
            upstream: UpstreamSettings::default(),
            development_mode: false,
            admin_email: None,
            shutdown_timeout_secs: default_shutdown_timeout(),
            enable_cors: false,
        }
    }
}

impl Default for OidcSettings {
    fn default() -> Self {
        Self {
            issuer: default_issuer(),
            client_id: default_client_id(),
        }
    }
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            host: default_upstream_host(),
            timeout_secs: default_upstream_timeout(),
        }
    }
}

impl UpstreamSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl GatewayConfig {
    /// Load `config/base.yaml` (optional) overlaid with `APP_*` environment
    /// variables, then validate.
    pub fn load() -> Result<Self, AppError> {
        let base_path = std::env::current_dir()?;

        // Allow running from the workspace root or from the crate directory
        let configuration_directory = if base_path.ends_with("tenant-gateway") {
            base_path.join("config")
        } else {
            base_path.join("tenant-gateway").join("config")
        };

        let settings = core_config::builder(configuration_directory.join("base.yaml")).build()?;

        settings.try_deserialize::<GatewayConfig>()?.validated()
    }

    /// Normalise optional values and reject settings the gateway cannot run
    /// with.
    pub fn validated(mut self) -> Result<Self, AppError> {
        self.admin_email = self
            .admin_email
            .map(|email| email.trim().to_string())
            .filter(|email| !email.is_empty());

        self.upstream.host = self.upstream.host.trim().to_string();
        if self.upstream.host.is_empty() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "upstream.host must not be empty"
            )));
        }
        if self.upstream.host.contains('/') {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "upstream.host must be host:port without scheme or path, got '{}'",
                self.upstream.host
            )));
        }

        reqwest::Url::parse(&self.oidc.issuer).map_err(|e| {
            AppError::ConfigError(anyhow::anyhow!(
                "oidc.issuer '{}' is not a valid URL: {}",
                self.oidc.issuer,
                e
            ))
        })?;

        if self.oidc.client_id.trim().is_empty() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "oidc.client_id must not be empty"
            )));
        }

        Ok(self)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}
