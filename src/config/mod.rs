//! Configuration structures and loading.
//!
//! A [`GatewayConfig`] can be created in a few ways:
//! - From an environment-specific TOML file via [`GatewayConfig::from_rust_env`]
//!   or [`GatewayConfig::from_toml_file`]
//! - From a TOML string via [`GatewayConfig::from_toml`]
//! - Constructed programmatically and mutated directly (this is a plain struct,
//!   not a hidden ambient singleton)
//!
//! Environment variables can be referenced in the TOML text using `{{ VAR_NAME }}`
//! syntax; see [`crate::utils::replace_handlebars_with_env`]. Separately, and
//! specifically for [`ServiceConfig`] fields, every service accepts a second,
//! per-field override: `<SERVICE_ID_UPPER_SNAKE>_<FIELD>` environment variables
//! (e.g. `OLLAMA_RETRY_COUNT=3`) take precedence over the file, which takes
//! precedence over the built-in default. An invalid override value is logged
//! as a warning and the prior value is kept.

mod logging;

pub use logging::*;

use {
    crate::{Error, Result, utils::replace_handlebars_with_env},
    serde::Deserialize,
    std::{collections::HashMap, env, fs, net::SocketAddr, str::FromStr, time::Duration},
};

/// Top-level gateway configuration: where to bind, and the set of managed
/// services this gateway instance fronts.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_bind_port")]
    pub bind_port: u16,
    /// Per-attempt transport timeout budget for upstream calls.
    #[serde(default = "default_request_timeout", with = "duration_secs")]
    pub request_timeout: Duration,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub services: HashMap<String, ServiceConfig>,
}

fn default_bind_addr() -> String {
    "0.0.0.0".into()
}

fn default_bind_port() -> u16 {
    8080
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

mod duration_secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        match Self::from_rust_env() {
            Ok(config) => config,
            Err(_) => GatewayConfig {
                bind_addr: default_bind_addr(),
                bind_port: default_bind_port(),
                request_timeout: default_request_timeout(),
                logging: LoggingConfig::default(),
                services: HashMap::new(),
            },
        }
    }
}

impl GatewayConfig {
    /// Loads configuration from `config/{RUST_ENV}.toml`, falling back to
    /// `prod` if `RUST_ENV` is unset.
    pub fn from_rust_env() -> Result<GatewayConfig> {
        Self::from_toml_file(env::var("RUST_ENV").unwrap_or_else(|_| "prod".into()))
    }

    pub fn from_toml_file(env: impl AsRef<str>) -> Result<GatewayConfig> {
        let path = format!("config/{}.toml", env.as_ref());
        let text = fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    pub fn from_toml(toml_str: &str) -> Result<GatewayConfig> {
        let mut config: GatewayConfig = replace_handlebars_with_env(toml_str).parse()?;
        for (service_id, service) in config.services.iter_mut() {
            service.apply_env_overrides(service_id);
        }
        Ok(config)
    }

    pub fn full_bind_addr(&self) -> SocketAddr {
        format!("{}:{}", self.bind_addr, self.bind_port)
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], self.bind_port)))
    }
}

impl FromStr for GatewayConfig {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }
}

/// A concrete upstream for a service, as listed in `ServiceConfig.instances`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Instance {
    pub url: String,
    #[serde(default)]
    pub weight: Option<u32>,
    #[serde(default)]
    pub region: Option<String>,
}

/// Strategy-specific routing options, e.g. the model router's `by_model` table.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RoutingConfig {
    #[serde(default)]
    pub by_model: HashMap<String, String>,
    #[serde(default = "default_model_key")]
    pub model_key: String,
}

fn default_model_key() -> String {
    "model".into()
}

/// Immutable per-service configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub health_url: Option<String>,
    #[serde(default)]
    pub warmup_ms: u64,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default)]
    pub retry_delay_ms: u64,
    #[serde(default)]
    pub fallback_url: Option<String>,
    #[serde(default)]
    pub idle_timeout_ms: u64,
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    #[serde(default)]
    pub instances: Vec<Instance>,
    #[serde(default)]
    pub strategy: Option<String>,
    #[serde(default)]
    pub routing: RoutingConfig,
}

fn default_base_url() -> String {
    "http://localhost:11434".into()
}

fn default_retry_count() -> u32 {
    1
}

fn default_request_timeout_seconds() -> u64 {
    60
}

fn default_queue_size() -> usize {
    100
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            health_url: None,
            warmup_ms: 0,
            retry_count: default_retry_count(),
            retry_delay_ms: 0,
            fallback_url: None,
            idle_timeout_ms: 0,
            request_timeout_seconds: default_request_timeout_seconds(),
            queue_size: default_queue_size(),
            instances: Vec::new(),
            strategy: None,
            routing: RoutingConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Applies `<SERVICE_ID_UPPER_SNAKE>_<FIELD>` environment overrides.
    ///
    /// `service_id` is upper-cased and non-alphanumeric characters become `_`
    /// to build the variable prefix (e.g. service id `ollama` -> `OLLAMA_`).
    fn apply_env_overrides(&mut self, service_id: &str) {
        let prefix = service_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect::<String>();

        if let Some(v) = env_var(&prefix, "BASE_URL") {
            self.base_url = v;
        }
        if let Some(v) = env_var(&prefix, "HEALTH_URL") {
            self.health_url = Some(v);
        }
        if let Some(v) = env_var(&prefix, "FALLBACK_URL") {
            self.fallback_url = Some(v);
        }
        override_u32(&prefix, "RETRY_COUNT", &mut self.retry_count);
        override_u64(&prefix, "RETRY_DELAY_MS", &mut self.retry_delay_ms);
        override_u64(&prefix, "WARMUP_MS", &mut self.warmup_ms);
        override_u64(&prefix, "IDLE_TIMEOUT_MS", &mut self.idle_timeout_ms);
        override_u64(
            &prefix,
            "REQUEST_TIMEOUT_SECONDS",
            &mut self.request_timeout_seconds,
        );
        override_usize(&prefix, "QUEUE_SIZE", &mut self.queue_size);
    }

    /// Total primary attempts, clamped so the effective value is always `>= 1`.
    pub fn effective_retry_count(&self) -> u32 {
        self.retry_count.max(1)
    }
}

fn env_var(prefix: &str, field: &str) -> Option<String> {
    env::var(format!("{prefix}_{field}")).ok()
}

fn override_u32(prefix: &str, field: &str, slot: &mut u32) {
    if let Some(raw) = env_var(prefix, field) {
        match raw.parse() {
            Ok(v) => *slot = v,
            Err(_) => tracing::warn!(
                prefix,
                field,
                raw,
                "invalid env override, keeping prior value"
            ),
        }
    }
}

fn override_u64(prefix: &str, field: &str, slot: &mut u64) {
    if let Some(raw) = env_var(prefix, field) {
        match raw.parse() {
            Ok(v) => *slot = v,
            Err(_) => tracing::warn!(
                prefix,
                field,
                raw,
                "invalid env override, keeping prior value"
            ),
        }
    }
}

fn override_usize(prefix: &str, field: &str, slot: &mut usize) {
    if let Some(raw) = env_var(prefix, field) {
        match raw.parse() {
            Ok(v) => *slot = v,
            Err(_) => tracing::warn!(
                prefix,
                field,
                raw,
                "invalid env override, keeping prior value"
            ),
        }
    }
}
