//! Registry-facing data model: version references, metric snapshots and the
//! served model unit held by the slot.

use crate::artifact::Predictor;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage { None, Staging, Production, Archived }

impl Stage {
    /// Registry stage strings are matched case-insensitively; unknown ones map to `None`.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "production" => Stage::Production,
            "staging" => Stage::Staging,
            "archived" => Stage::Archived,
            _ => Stage::None,
        }
    }
}

/// One registry entry. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelVersionRef {
    pub version: u64,
    pub run_id: String,
    pub stage: Stage,
    pub created_at: DateTime<Utc>,
}

impl ModelVersionRef {
    pub fn new(version: u64, run_id: impl Into<String>, stage: Stage, created_at: DateTime<Utc>) -> Self {
        Self { version, run_id: run_id.into(), stage, created_at }
    }

    pub fn label(&self) -> String { format!("v{}", self.version) }
}

/// Metric snapshot of one training run. Metrics the run never logged read as zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelMetrics {
    pub mae: f64,
    pub rmse: f64,
    #[serde(rename = "r2_score")]
    pub r2: f64,
    pub mape: f64,
}

impl ModelMetrics {
    /// Build from logged `(key, value)` pairs, accepting the `test_*` names the
    /// training pipeline also uses.
    pub fn from_logged<I, K>(logged: I) -> Self
    where
        I: IntoIterator<Item = (K, f64)>,
        K: Into<String>,
    {
        let map: HashMap<String, f64> = logged.into_iter().map(|(k, v)| (k.into(), v)).collect();
        let pick = |keys: &[&str]| keys.iter().find_map(|k| map.get(*k).copied()).filter(|v| v.is_finite()).unwrap_or(0.0);
        Self {
            mae: pick(&["mae", "test_mae"]),
            rmse: pick(&["rmse", "test_rmse"]),
            r2: pick(&["r2_score", "r2", "test_r2"]),
            mape: pick(&["mape", "test_mape"]),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelSource { Registry, LocalFile, Unknown }

/// The active serving unit: an artifact and the version it was loaded from.
pub struct ServedModel {
    artifact: Arc<dyn Predictor>,
    version_ref: ModelVersionRef,
    source: ModelSource,
    loaded_at: DateTime<Utc>,
}

impl ServedModel {
    pub fn new(artifact: Arc<dyn Predictor>, version_ref: ModelVersionRef, source: ModelSource) -> Self {
        Self { artifact, version_ref, source, loaded_at: Utc::now() }
    }

    pub fn artifact(&self) -> &dyn Predictor { self.artifact.as_ref() }
    pub fn version_ref(&self) -> &ModelVersionRef { &self.version_ref }
    pub fn source(&self) -> ModelSource { self.source }
    pub fn loaded_at(&self) -> DateTime<Utc> { self.loaded_at }

    /// Ordinal used for newer-version checks. A local file counts as 0 so any
    /// registry production version supersedes it.
    pub fn ordinal(&self) -> u64 {
        match self.source {
            ModelSource::Registry => self.version_ref.version,
            ModelSource::LocalFile | ModelSource::Unknown => 0,
        }
    }

    /// Label reported as `model_version` in responses.
    pub fn version_label(&self) -> String {
        match self.source {
            ModelSource::Registry => self.version_ref.label(),
            ModelSource::LocalFile => "Local File".to_string(),
            ModelSource::Unknown => "Unknown".to_string(),
        }
    }

    /// Run id for live metric lookups; local artifacts have none.
    pub fn run_id(&self) -> Option<&str> {
        Some(self.version_ref.run_id.as_str()).filter(|r| self.source == ModelSource::Registry && !r.is_empty())
    }
}

impl std::fmt::Debug for ServedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServedModel")
            .field("artifact", &self.artifact.kind())
            .field("version_ref", &self.version_ref)
            .field("source", &self.source)
            .field("loaded_at", &self.loaded_at)
            .finish()
    }
}
