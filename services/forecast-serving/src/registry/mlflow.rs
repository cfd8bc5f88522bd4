//! HTTP client for an MLflow-compatible tracking server (self-hosted or
//! DagsHub). Every call carries basic auth and a request timeout; transport
//! failures and 5xx responses are retried with backoff.

use super::RegistryClient;
use crate::artifact::{parse_artifact, Predictor};
use crate::config::RegistrySettings;
use crate::error::{LifecycleError, Result};
use crate::model::{ModelMetrics, ModelVersionRef, Stage};
use async_trait::async_trait;
use chrono::DateTime;
use forecast_core::{retry_async, RetryConfig};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

const LATEST_VERSIONS: &str = "api/2.0/mlflow/registered-models/get-latest-versions";
const SEARCH_VERSIONS: &str = "api/2.0/mlflow/model-versions/search";
const GET_RUN: &str = "api/2.0/mlflow/runs/get";
const GET_ARTIFACT: &str = "get-artifact";

#[derive(Debug, Deserialize)]
struct VersionsPage {
    #[serde(default)]
    model_versions: Vec<WireVersion>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireVersion {
    version: String,
    #[serde(default)]
    run_id: String,
    #[serde(default)]
    current_stage: Option<String>,
    #[serde(default)]
    creation_timestamp: Option<i64>,
}

impl WireVersion {
    fn into_ref(self) -> Result<ModelVersionRef> {
        let version = self.version.trim().parse::<u64>()
            .map_err(|_| LifecycleError::RegistryUnavailable(format!("malformed version '{}'", self.version)))?;
        let stage = self.current_stage.as_deref().map(Stage::parse).unwrap_or(Stage::None);
        let created_at = self.creation_timestamp.and_then(DateTime::from_timestamp_millis).unwrap_or_default();
        Ok(ModelVersionRef::new(version, self.run_id, stage, created_at))
    }
}

#[derive(Debug, Deserialize)]
struct RunEnvelope { run: WireRun }

#[derive(Debug, Deserialize)]
struct WireRun { #[serde(default)] data: WireRunData }

#[derive(Debug, Default, Deserialize)]
struct WireRunData { #[serde(default)] metrics: Vec<WireMetric> }

#[derive(Debug, Deserialize)]
struct WireMetric { key: String, value: f64 }

/// Failure of one HTTP exchange, before it is mapped onto the domain taxonomy.
#[derive(Debug)]
enum CallError {
    Transport(String),
    Status(StatusCode, String),
    Decode(String),
}

impl CallError {
    fn retryable(&self) -> bool {
        match self {
            CallError::Transport(_) => true,
            CallError::Status(s, _) => s.is_server_error() || *s == StatusCode::TOO_MANY_REQUESTS,
            CallError::Decode(_) => false,
        }
    }

    fn is_not_found(&self) -> bool { matches!(self, CallError::Status(StatusCode::NOT_FOUND, _)) }

    fn into_unavailable(self) -> LifecycleError {
        LifecycleError::RegistryUnavailable(match self {
            CallError::Transport(m) => m,
            CallError::Status(s, body) => format!("HTTP {s}: {body}"),
            CallError::Decode(m) => format!("unexpected response: {m}"),
        })
    }
}

pub struct MlflowRegistry {
    http: Client,
    base: String,
    username: String,
    password: String,
    artifact_path: String,
    retry: RetryConfig,
}

impl MlflowRegistry {
    pub fn new(settings: &RegistrySettings) -> Result<Self> {
        let (Some(uri), Some(username), Some(password)) = (&settings.tracking_uri, &settings.username, &settings.password) else {
            return Err(LifecycleError::RegistryUnavailable("registry endpoint or credentials missing".into()));
        };
        let http = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .connect_timeout(Duration::from_secs(settings.timeout_secs.min(5)))
            .build()
            .map_err(|e| LifecycleError::RegistryUnavailable(e.to_string()))?;
        Ok(Self {
            http,
            base: uri.trim_end_matches('/').to_string(),
            username: username.clone(),
            password: password.clone(),
            artifact_path: settings.artifact_path.clone(),
            retry: RetryConfig { max_retries: settings.retries, ..RetryConfig::default() },
        })
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self { self.retry = retry; self }

    fn url(&self, path: &str) -> String { format!("{}/{}", self.base, path) }

    async fn send<B>(&self, build: B) -> std::result::Result<reqwest::Response, CallError>
    where
        B: Fn(&Client) -> RequestBuilder,
    {
        retry_async(&self.retry, |attempt| {
            let req = build(&self.http).basic_auth(&self.username, Some(&self.password));
            async move {
                if attempt > 0 { debug!(attempt, "registry retry"); }
                let resp = req.send().await.map_err(|e| CallError::Transport(e.to_string()))?;
                let status = resp.status();
                if status.is_success() { return Ok(resp); }
                let body = resp.text().await.unwrap_or_default();
                Err(CallError::Status(status, body.chars().take(200).collect()))
            }
        }, CallError::retryable).await
    }

    async fn send_json<T, B>(&self, build: B) -> std::result::Result<T, CallError>
    where
        T: DeserializeOwned,
        B: Fn(&Client) -> RequestBuilder,
    {
        let resp = self.send(build).await?;
        resp.json::<T>().await.map_err(|e| CallError::Decode(e.to_string()))
    }
}

#[async_trait]
impl RegistryClient for MlflowRegistry {
    #[instrument(skip(self))]
    async fn resolve_production(&self, model_name: &str) -> Result<ModelVersionRef> {
        let url = self.url(LATEST_VERSIONS);
        let body = serde_json::json!({ "name": model_name, "stages": ["Production"] });
        let page: VersionsPage = match self.send_json(|c| c.post(&url).json(&body)).await {
            Ok(p) => p,
            // unknown registered model
            Err(e) if e.is_not_found() => return Err(LifecycleError::NoProductionVersion(model_name.to_string())),
            Err(e) => return Err(e.into_unavailable()),
        };
        let mut refs = page.model_versions.into_iter().map(WireVersion::into_ref).collect::<Result<Vec<_>>>()?;
        refs.retain(|v| v.stage == Stage::Production);
        refs.into_iter().max_by_key(|v| v.version)
            .ok_or_else(|| LifecycleError::NoProductionVersion(model_name.to_string()))
    }

    #[instrument(skip(self))]
    async fn fetch_metrics(&self, run_id: &str) -> Result<ModelMetrics> {
        let url = self.url(GET_RUN);
        let env: RunEnvelope = self.send_json(|c| c.get(&url).query(&[("run_id", run_id)])).await.map_err(CallError::into_unavailable)?;
        Ok(ModelMetrics::from_logged(env.run.data.metrics.into_iter().map(|m| (m.key, m.value))))
    }

    #[instrument(skip(self))]
    async fn list_versions(&self, model_name: &str) -> Result<Vec<ModelVersionRef>> {
        let url = self.url(SEARCH_VERSIONS);
        let filter = format!("name='{model_name}'");
        let mut token: Option<String> = None;
        let mut out = Vec::new();
        loop {
            let page: VersionsPage = self.send_json(|c| {
                let mut q: Vec<(&str, &str)> = vec![("filter", filter.as_str())];
                if let Some(t) = token.as_deref() { q.push(("page_token", t)); }
                c.get(&url).query(&q)
            }).await.map_err(CallError::into_unavailable)?;
            for v in page.model_versions { out.push(v.into_ref()?); }
            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(t) => token = Some(t),
                None => break,
            }
        }
        out.sort_by_key(|v| v.version);
        out.dedup_by_key(|v| v.version);
        Ok(out)
    }

    #[instrument(skip(self), fields(version = version.version))]
    async fn load_artifact(&self, version: &ModelVersionRef) -> Result<Arc<dyn Predictor>> {
        let url = self.url(GET_ARTIFACT);
        let query = [("run_id", version.run_id.as_str()), ("path", self.artifact_path.as_str())];
        let resp = match self.send(|c| c.get(&url).query(&query)).await {
            Ok(r) => r,
            Err(e) if e.is_not_found() => {
                return Err(LifecycleError::ArtifactNotFound(format!("{} has no artifact at {}", version.label(), self.artifact_path)));
            }
            Err(e) => return Err(e.into_unavailable()),
        };
        let bytes = resp.bytes().await.map_err(|e| LifecycleError::RegistryUnavailable(e.to_string()))?;
        parse_artifact(&bytes)
    }
}
