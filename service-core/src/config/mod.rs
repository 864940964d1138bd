use serde::Deserialize;
use std::path::PathBuf;

/// Settings shared by every service: listener port and observability.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// OTLP collector endpoint. Trace export is disabled when unset.
    #[serde(default)]
    pub otlp_endpoint: Option<String>,
}

fn default_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            log_level: default_log_level(),
            otlp_endpoint: None,
        }
    }
}

/// Builds a layered source: optional YAML file, then `APP_`-prefixed
/// environment variables (`APP_SERVER__PORT=9091`).
pub fn builder(file: PathBuf) -> config::ConfigBuilder<config::builder::DefaultState> {
    dotenvy::dotenv().ok();

    config::Config::builder()
        .add_source(config::File::from(file).required(false))
        .add_source(
            config::Environment::with_prefix("APP")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
}
