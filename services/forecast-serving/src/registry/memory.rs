use super::RegistryClient;
use crate::artifact::Predictor;
use crate::error::{LifecycleError, Result};
use crate::model::{ModelMetrics, ModelVersionRef, Stage};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct Entry {
    version: ModelVersionRef,
    metrics: ModelMetrics,
    artifact: Option<Arc<dyn Predictor>>,
}

struct State {
    model_name: String,
    versions: BTreeMap<u64, Entry>,
    available: bool,
    latency: Option<Duration>,
}

/// In-process registry for a single model name. Promoting a version to
/// Production archives the previous one, as the hosted registry does.
pub struct InMemoryRegistry {
    state: RwLock<State>,
    artifact_loads: AtomicUsize,
}

impl InMemoryRegistry {
    pub fn new(model_name: impl Into<String>) -> Self {
        Self {
            state: RwLock::new(State { model_name: model_name.into(), versions: BTreeMap::new(), available: true, latency: None }),
            artifact_loads: AtomicUsize::new(0),
        }
    }

    pub fn register(&self, version: u64, stage: Stage, metrics: ModelMetrics, artifact: Option<Arc<dyn Predictor>>) -> ModelVersionRef {
        let vref = ModelVersionRef::new(version, format!("run-{version}"), Stage::None, Utc::now());
        let mut st = self.state.write();
        st.versions.insert(version, Entry { version: vref, metrics, artifact });
        drop(st);
        self.set_stage(version, stage);
        self.state.read().versions[&version].version.clone()
    }

    pub fn set_stage(&self, version: u64, stage: Stage) {
        let mut st = self.state.write();
        if stage == Stage::Production {
            for e in st.versions.values_mut().filter(|e| e.version.stage == Stage::Production) {
                e.version.stage = Stage::Archived;
            }
        }
        if let Some(e) = st.versions.get_mut(&version) { e.version.stage = stage; }
    }

    pub fn set_metrics(&self, version: u64, metrics: ModelMetrics) {
        if let Some(e) = self.state.write().versions.get_mut(&version) { e.metrics = metrics; }
    }

    pub fn remove(&self, version: u64) { self.state.write().versions.remove(&version); }

    /// Simulate an outage: every call fails with `RegistryUnavailable`.
    pub fn set_available(&self, available: bool) { self.state.write().available = available; }

    /// Delay every call, e.g. to exercise caller timeouts.
    pub fn set_latency(&self, latency: Option<Duration>) { self.state.write().latency = latency; }

    pub fn artifact_loads(&self) -> usize { self.artifact_loads.load(Ordering::SeqCst) }

    async fn gate(&self) -> Result<()> {
        let (available, latency) = { let st = self.state.read(); (st.available, st.latency) };
        if let Some(d) = latency { tokio::time::sleep(d).await; }
        if available { Ok(()) } else { Err(LifecycleError::RegistryUnavailable("registry offline".into())) }
    }
}

#[async_trait]
impl RegistryClient for InMemoryRegistry {
    async fn resolve_production(&self, model_name: &str) -> Result<ModelVersionRef> {
        self.gate().await?;
        let st = self.state.read();
        if st.model_name != model_name { return Err(LifecycleError::NoProductionVersion(model_name.to_string())); }
        st.versions.values().rev()
            .find(|e| e.version.stage == Stage::Production)
            .map(|e| e.version.clone())
            .ok_or_else(|| LifecycleError::NoProductionVersion(model_name.to_string()))
    }

    async fn fetch_metrics(&self, run_id: &str) -> Result<ModelMetrics> {
        self.gate().await?;
        let st = self.state.read();
        Ok(st.versions.values().find(|e| e.version.run_id == run_id).map(|e| e.metrics).unwrap_or_default())
    }

    async fn list_versions(&self, model_name: &str) -> Result<Vec<ModelVersionRef>> {
        self.gate().await?;
        let st = self.state.read();
        if st.model_name != model_name { return Ok(Vec::new()); }
        Ok(st.versions.values().map(|e| e.version.clone()).collect())
    }

    async fn load_artifact(&self, version: &ModelVersionRef) -> Result<Arc<dyn Predictor>> {
        self.gate().await?;
        self.artifact_loads.fetch_add(1, Ordering::SeqCst);
        let st = self.state.read();
        st.versions.get(&version.version)
            .and_then(|e| e.artifact.clone())
            .ok_or_else(|| LifecycleError::ArtifactNotFound(format!("no artifact for {}", version.label())))
    }
}
