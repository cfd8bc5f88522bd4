//! Turns "production" or a concrete version into a loaded `ServedModel`,
//! preferring the registry and degrading to the local artifact file.

use crate::artifact::read_artifact_file;
use crate::error::{LifecycleError, Result};
use crate::model::{ModelSource, ModelVersionRef, ServedModel, Stage};
use crate::registry::RegistryClient;
use chrono::{DateTime, Utc};
use forecast_core::with_timeout;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum LoadTarget {
    Production,
    Version(ModelVersionRef),
}

pub struct ModelLoader {
    registry: Option<Arc<dyn RegistryClient>>,
    model_name: String,
    local_path: PathBuf,
    timeout: Duration,
}

impl ModelLoader {
    pub fn new(registry: Option<Arc<dyn RegistryClient>>, model_name: impl Into<String>, local_path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self { registry, model_name: model_name.into(), local_path: local_path.into(), timeout }
    }

    pub fn registry(&self) -> Option<&Arc<dyn RegistryClient>> { self.registry.as_ref() }
    pub fn model_name(&self) -> &str { &self.model_name }
    pub fn local_path(&self) -> &Path { &self.local_path }
    pub fn timeout(&self) -> Duration { self.timeout }

    /// Bound a registry call; an elapsed timer reads as `RegistryUnavailable`.
    pub async fn bounded<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        with_timeout(self.timeout, fut).await
            .map_err(|e| LifecycleError::RegistryUnavailable(e.to_string()))?
    }

    /// Registry first, then the local file. A registry failure is logged and
    /// absorbed so the service can start without a live registry.
    pub async fn load(&self, target: LoadTarget) -> Result<ServedModel> {
        if self.registry.is_none() {
            warn!(path = %self.local_path.display(), "registry not configured, loading local artifact");
            return self.load_local().await;
        }
        let registry_err = match self.load_from_registry(target).await {
            Ok(model) => return Ok(model),
            Err(e) => e,
        };
        warn!(error = %registry_err, path = %self.local_path.display(), "registry load failed, falling back to local artifact");
        match self.load_local().await {
            Ok(model) => Ok(model),
            // nothing tagged Production and no local file: keep the more telling cause
            Err(LifecycleError::ArtifactNotFound(_)) if matches!(registry_err, LifecycleError::NoProductionVersion(_)) => Err(registry_err),
            Err(e) => Err(e),
        }
    }

    /// Registry path only, no fallback. Used by reload cycles, which must keep
    /// the current model rather than drop to the local file.
    pub async fn load_from_registry(&self, target: LoadTarget) -> Result<ServedModel> {
        let registry = self.registry.as_ref()
            .ok_or_else(|| LifecycleError::RegistryUnavailable("registry not configured".into()))?;
        let version = match target {
            LoadTarget::Production => self.bounded(registry.resolve_production(&self.model_name)).await?,
            LoadTarget::Version(v) => v,
        };
        info!(model = %self.model_name, version = version.version, run_id = %version.run_id, "loading artifact from registry");
        let artifact = self.bounded(registry.load_artifact(&version)).await?;
        info!(version = version.version, kind = artifact.kind(), stage = ?version.stage, "artifact loaded");
        Ok(ServedModel::new(artifact, version, ModelSource::Registry))
    }

    pub async fn load_local(&self) -> Result<ServedModel> {
        let artifact = read_artifact_file(&self.local_path).await?;
        let modified: DateTime<Utc> = tokio::fs::metadata(&self.local_path).await
            .and_then(|m| m.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        info!(path = %self.local_path.display(), kind = artifact.kind(), "model loaded from local file");
        Ok(ServedModel::new(artifact, ModelVersionRef::new(0, "", Stage::None, modified), ModelSource::LocalFile))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{FeatureVector, LinearModel, Predictor};
    use crate::model::ModelMetrics;
    use crate::registry::InMemoryRegistry;

    const LOCAL_DOC: &str = r#"{"kind":"linear","intercept":100.0,"coefficients":[0,0,0,0,0]}"#;

    fn art(v: f64) -> Option<Arc<dyn Predictor>> { Some(Arc::new(LinearModel::constant(v))) }

    fn local_file(dir: &tempfile::TempDir) -> PathBuf {
        let p = dir.path().join("model.json");
        std::fs::write(&p, LOCAL_DOC).unwrap();
        p
    }

    #[tokio::test]
    async fn registry_production_is_preferred() {
        let reg = Arc::new(InMemoryRegistry::new("m"));
        reg.register(3, Stage::Production, ModelMetrics::default(), art(3.0));
        let loader = ModelLoader::new(Some(reg), "m", "/nonexistent/model.json", Duration::from_secs(1));
        let m = loader.load(LoadTarget::Production).await.unwrap();
        assert_eq!(m.source(), ModelSource::Registry);
        assert_eq!(m.version_ref().version, 3);
    }

    #[tokio::test]
    async fn unreachable_registry_degrades_to_local_file() {
        let dir = tempfile::tempdir().unwrap();
        let reg = Arc::new(InMemoryRegistry::new("m"));
        reg.set_available(false);
        let loader = ModelLoader::new(Some(reg), "m", local_file(&dir), Duration::from_secs(1));
        let m = loader.load(LoadTarget::Production).await.unwrap();
        assert_eq!(m.source(), ModelSource::LocalFile);
        assert_eq!(m.artifact().predict(&FeatureVector::new([0.0; 5])).unwrap(), 100.0);
    }

    #[tokio::test]
    async fn slow_registry_times_out_and_degrades() {
        let dir = tempfile::tempdir().unwrap();
        let reg = Arc::new(InMemoryRegistry::new("m"));
        reg.register(1, Stage::Production, ModelMetrics::default(), art(1.0));
        reg.set_latency(Some(Duration::from_secs(5)));
        let loader = ModelLoader::new(Some(reg.clone()), "m", local_file(&dir), Duration::from_millis(20));
        assert!(matches!(loader.load_from_registry(LoadTarget::Production).await, Err(LifecycleError::RegistryUnavailable(_))));
        assert_eq!(loader.load(LoadTarget::Production).await.unwrap().source(), ModelSource::LocalFile);
    }

    #[tokio::test]
    async fn nothing_anywhere_is_artifact_not_found() {
        let loader = ModelLoader::new(None, "m", "/nonexistent/model.json", Duration::from_secs(1));
        assert!(matches!(loader.load(LoadTarget::Production).await, Err(LifecycleError::ArtifactNotFound(_))));
    }

    #[tokio::test]
    async fn no_production_without_local_file_keeps_cause() {
        let reg = Arc::new(InMemoryRegistry::new("m"));
        reg.register(1, Stage::Staging, ModelMetrics::default(), art(1.0));
        let loader = ModelLoader::new(Some(reg), "m", "/nonexistent/model.json", Duration::from_secs(1));
        assert_eq!(loader.load(LoadTarget::Production).await.unwrap_err(), LifecycleError::NoProductionVersion("m".into()));
    }

    #[tokio::test]
    async fn explicit_version_skips_resolution() {
        let reg = Arc::new(InMemoryRegistry::new("m"));
        let v1 = reg.register(1, Stage::Archived, ModelMetrics::default(), art(1.0));
        reg.register(2, Stage::Production, ModelMetrics::default(), art(2.0));
        let loader = ModelLoader::new(Some(reg), "m", "/nonexistent/model.json", Duration::from_secs(1));
        let m = loader.load_from_registry(LoadTarget::Version(v1)).await.unwrap();
        assert_eq!(m.version_ref().version, 1);
    }
}
