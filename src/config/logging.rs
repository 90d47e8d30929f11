use serde::Deserialize;

/// Configuration for structured logging.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    /// Output format: `default` (human-readable), `json`, `compact`, or `pretty`.
    #[serde(default)]
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    #[default]
    Default,
    Compact,
    Pretty,
}

impl LoggingConfig {
    /// Installs a `tracing_subscriber` global subscriber honoring `RUST_LOG`
    /// (default level `info`) and this config's chosen format.
    pub fn init_tracing(&self) {
        use tracing_subscriber::{EnvFilter, fmt, prelude::*};

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let registry = tracing_subscriber::registry().with(filter);

        match self.format {
            LogFormat::Json => registry.with(fmt::layer().json()).init(),
            LogFormat::Compact => registry.with(fmt::layer().compact()).init(),
            LogFormat::Pretty => registry.with(fmt::layer().pretty()).init(),
            LogFormat::Default => registry.with(fmt::layer()).init(),
        }
    }
}
