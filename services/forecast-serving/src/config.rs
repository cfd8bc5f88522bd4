use anyhow::{bail, Result};
use config::{builder::DefaultState, ConfigBuilder, ConfigError};
use forecast_core::{load_config, ConfigEnv};
use serde::Deserialize;
use std::path::PathBuf;

pub const SERVICE_NAME: &str = "forecast-serving";

// Variable names the training and CI tooling already export.
const MLFLOW_URI_ENV: &str = "MLFLOW_TRACKING_URI";
const MLFLOW_USER_ENV: &str = "MLFLOW_TRACKING_USERNAME";
const MLFLOW_PASSWORD_ENV: &str = "MLFLOW_TRACKING_PASSWORD";
const AUTO_RELOAD_ENV: &str = "AUTO_RELOAD_MODEL";
const AUTO_RELOAD_INTERVAL_ENV: &str = "AUTO_RELOAD_INTERVAL";

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub service_name: String,
    pub listen_addr: String,
    pub model_name: String,
    /// Serialized artifact used when the registry is not configured or unreachable.
    pub local_model_path: PathBuf,
    pub registry: RegistrySettings,
    pub reload: ReloadSettings,
}

#[derive(Clone, Deserialize)]
pub struct RegistrySettings {
    #[serde(default)]
    pub tracking_uri: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    pub timeout_secs: u64,
    pub retries: usize,
    pub artifact_path: String,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self { tracking_uri: None, username: None, password: None, timeout_secs: 10, retries: 2, artifact_path: "model/model.json".into() }
    }
}

impl RegistrySettings {
    /// Registry mode needs an http(s) endpoint plus both credentials.
    pub fn is_configured(&self) -> bool {
        let http = self.tracking_uri.as_deref().map(|u| u.starts_with("http://") || u.starts_with("https://")).unwrap_or(false);
        http && self.username.is_some() && self.password.is_some()
    }
}

impl std::fmt::Debug for RegistrySettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrySettings")
            .field("tracking_uri", &self.tracking_uri)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("timeout_secs", &self.timeout_secs)
            .field("retries", &self.retries)
            .field("artifact_path", &self.artifact_path)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReloadSettings {
    pub enabled: bool,
    pub interval_secs: u64,
}

impl ServiceConfig {
    pub fn load() -> Result<Self> { Self::from_env(&ConfigEnv::from_process()) }

    pub fn from_env(env: &ConfigEnv) -> Result<Self> {
        let cfg: ServiceConfig = load_config(SERVICE_NAME, env, layer)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.reload.interval_secs == 0 { bail!("reload.interval_secs must be at least 1"); }
        if self.registry.timeout_secs == 0 { bail!("registry.timeout_secs must be at least 1"); }
        if self.model_name.trim().is_empty() { bail!("model_name must not be empty"); }
        Ok(())
    }
}

fn layer(b: ConfigBuilder<DefaultState>, env: &ConfigEnv) -> std::result::Result<ConfigBuilder<DefaultState>, ConfigError> {
    let defaults = RegistrySettings::default();
    let interval = env.get(AUTO_RELOAD_INTERVAL_ENV)
        .map(|v| v.trim().parse::<i64>().map_err(|_| ConfigError::Message(format!("{AUTO_RELOAD_INTERVAL_ENV} must be an integer, got '{v}'"))))
        .transpose()?;
    b.set_default("listen_addr", "0.0.0.0:5000")?
        .set_default("model_name", "sales-forecaster")?
        .set_default("local_model_path", "models/trained/model.json")?
        .set_default("registry.timeout_secs", defaults.timeout_secs as i64)?
        .set_default("registry.retries", defaults.retries as i64)?
        .set_default("registry.artifact_path", defaults.artifact_path)?
        .set_default("reload.enabled", true)?
        .set_default("reload.interval_secs", 30)?
        .set_override_option("registry.tracking_uri", env.get(MLFLOW_URI_ENV).map(str::to_string))?
        .set_override_option("registry.username", env.get(MLFLOW_USER_ENV).map(str::to_string))?
        .set_override_option("registry.password", env.get(MLFLOW_PASSWORD_ENV).map(str::to_string))?
        .set_override_option("reload.enabled", env.flag(AUTO_RELOAD_ENV))?
        .set_override_option("reload.interval_secs", interval)
}
