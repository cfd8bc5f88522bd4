//! Shared plumbing for the forecast services: tracing, layered config,
//! retry helpers and Prometheus text export.

use anyhow::Result;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use config::{builder::DefaultState, ConfigBuilder, ConfigError};
use once_cell::sync::OnceCell;
use prometheus::{Encoder, TextEncoder};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod resilience;
pub use resilience::{retry_async, with_timeout, RetryConfig, TimedOut};

static TRACING_INIT: OnceCell<()> = OnceCell::new();

/// Env var naming an optional config file (yaml/toml/json, by extension).
pub const CONFIG_FILE_ENV: &str = "FORECAST_CONFIG_FILE";
/// Prefix for structured env overrides, e.g. `FORECAST__RELOAD__INTERVAL_SECS`.
pub const ENV_PREFIX: &str = "FORECAST";
const JSON_LOG_ENV: &str = "FORECAST_JSON_LOG";

/// Install the global subscriber once. Later calls are no-ops.
pub fn init_tracing(service: &str) -> Result<()> {
    TRACING_INIT.get_or_try_init(|| -> Result<()> {
        let json = std::env::var(JSON_LOG_ENV).ok().map(|v| parse_flag(&v)).unwrap_or(false);
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let registry = tracing_subscriber::registry().with(env_filter);
        if json {
            registry
                .with(fmt::layer().json().flatten_event(true).with_current_span(true).with_span_list(false))
                .try_init()?;
        } else {
            registry
                .with(fmt::layer().with_target(true).with_thread_ids(false).with_line_number(true))
                .try_init()?;
        }
        Ok(())
    })?;
    info!(target: "forecast_core", service, "tracing initialized");
    Ok(())
}

/// `1`/`true`/`yes` (any case) are true, everything else false.
pub fn parse_flag(v: &str) -> bool {
    let v = v.trim();
    v == "1" || v.eq_ignore_ascii_case("true") || v.eq_ignore_ascii_case("yes")
}

/// Snapshot of environment variables used while building configuration.
/// Tests construct one from pairs so they never touch the process env.
#[derive(Debug, Clone, Default)]
pub struct ConfigEnv {
    vars: HashMap<String, String>,
}

impl ConfigEnv {
    pub fn from_process() -> Self { Self { vars: std::env::vars().collect() } }

    pub fn from_pairs<K: Into<String>, V: Into<String>>(pairs: impl IntoIterator<Item = (K, V)>) -> Self {
        Self { vars: pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect() }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str).filter(|v| !v.trim().is_empty())
    }

    pub fn flag(&self, key: &str) -> Option<bool> { self.get(key).map(parse_flag) }

    fn prefixed(&self) -> HashMap<String, String> {
        let prefix = format!("{ENV_PREFIX}__");
        self.vars.iter().filter(|(k, _)| k.starts_with(&prefix)).map(|(k, v)| (k.clone(), v.clone())).collect()
    }
}

/// Layered config: defaults set by `layer`, then the optional file, then
/// `FORECAST__*` env vars. `layer` may also add overrides, which win over all.
pub fn load_config<T, F>(service: &str, env: &ConfigEnv, layer: F) -> Result<T>
where
    T: DeserializeOwned,
    F: FnOnce(ConfigBuilder<DefaultState>, &ConfigEnv) -> Result<ConfigBuilder<DefaultState>, ConfigError>,
{
    let mut builder = config::Config::builder().set_default("service_name", service)?;
    if let Some(file) = env.get(CONFIG_FILE_ENV) {
        builder = builder.add_source(config::File::with_name(file).required(false));
    }
    builder = builder.add_source(
        config::Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true)
            .source(Some(env.prefixed())),
    );
    let cfg = layer(builder, env)?.build()?;
    Ok(cfg.try_deserialize()?)
}

/// Encode everything in the default Prometheus registry.
pub fn render_metrics() -> Result<String> {
    let families = prometheus::gather();
    let mut buf = Vec::new();
    TextEncoder::new().encode(&families, &mut buf)?;
    Ok(String::from_utf8(buf)?)
}

pub async fn metrics_handler() -> Response {
    match render_metrics() {
        Ok(body) => ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, format!("encode error: {e}")).into_response(),
    }
}
