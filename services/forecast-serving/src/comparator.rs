//! Production-vs-previous metric comparison. Reports are computed on demand
//! and carry no timestamps, so two calls against an unchanged registry agree.

use crate::error::{LifecycleError, Result};
use crate::model::{ModelMetrics, ModelVersionRef, Stage};
use crate::registry::RegistryClient;
use forecast_core::with_timeout;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub const FIRST_VERSION_MESSAGE: &str = "This is the first model version";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict { Improved, Degraded, Unchanged }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionSnapshot {
    pub version: u64,
    pub run_id: String,
    pub stage: Stage,
    pub metrics: ModelMetrics,
}

impl VersionSnapshot {
    fn new(v: &ModelVersionRef, metrics: ModelMetrics) -> Self {
        Self { version: v.version, run_id: v.run_id.clone(), stage: v.stage, metrics }
    }
}

/// Percent changes, positive meaning the current version is better.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricDeltas {
    pub mae_percent: f64,
    pub rmse_percent: f64,
    pub r2_percent: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdicts {
    pub mae: Verdict,
    pub rmse: Verdict,
    pub r2: Verdict,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonReport {
    pub has_comparison: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(rename = "current_version")]
    pub current: VersionSnapshot,
    #[serde(rename = "previous_version", skip_serializing_if = "Option::is_none")]
    pub previous: Option<VersionSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deltas: Option<MetricDeltas>,
    #[serde(rename = "improvement", skip_serializing_if = "Option::is_none")]
    pub verdicts: Option<Verdicts>,
}

impl ComparisonReport {
    pub fn first_version(current: VersionSnapshot) -> Self {
        Self { has_comparison: false, message: Some(FIRST_VERSION_MESSAGE.into()), current, previous: None, deltas: None, verdicts: None }
    }

    pub fn between(current: VersionSnapshot, previous: VersionSnapshot) -> Self {
        let (c, p) = (current.metrics, previous.metrics);
        let raw = [
            lower_is_better_delta(c.mae, p.mae),
            lower_is_better_delta(c.rmse, p.rmse),
            higher_is_better_delta(c.r2, p.r2),
        ];
        let deltas = MetricDeltas { mae_percent: round2(raw[0]), rmse_percent: round2(raw[1]), r2_percent: round2(raw[2]) };
        // verdicts come from the unrounded deltas
        let verdicts = Verdicts { mae: classify(raw[0]), rmse: classify(raw[1]), r2: classify(raw[2]) };
        Self { has_comparison: true, message: None, current, previous: Some(previous), deltas: Some(deltas), verdicts: Some(verdicts) }
    }
}

/// `(previous - current) / previous * 100`; 0 when there is no positive baseline.
pub fn lower_is_better_delta(current: f64, previous: f64) -> f64 {
    if previous > 0.0 { (previous - current) / previous * 100.0 } else { 0.0 }
}

/// `(current - previous) / previous * 100`; 0 when there is no positive baseline.
pub fn higher_is_better_delta(current: f64, previous: f64) -> f64 {
    if previous > 0.0 { (current - previous) / previous * 100.0 } else { 0.0 }
}

pub fn classify(delta: f64) -> Verdict {
    if delta > 0.0 { Verdict::Improved } else if delta < 0.0 { Verdict::Degraded } else { Verdict::Unchanged }
}

fn round2(v: f64) -> f64 { (v * 100.0).round() / 100.0 }

/// Highest-ordinal Production entry.
pub fn select_current(all: &[ModelVersionRef]) -> Option<&ModelVersionRef> {
    all.iter().filter(|v| v.stage == Stage::Production).max_by_key(|v| v.version)
}

/// Highest ordinal strictly below `current`, whatever its stage. Gaps are fine.
pub fn select_baseline<'a>(current: &ModelVersionRef, all: &'a [ModelVersionRef]) -> Option<&'a ModelVersionRef> {
    all.iter().filter(|v| v.version < current.version).max_by_key(|v| v.version)
}

pub struct VersionComparator {
    registry: Arc<dyn RegistryClient>,
    model_name: String,
    timeout: Duration,
}

impl VersionComparator {
    pub fn new(registry: Arc<dyn RegistryClient>, model_name: impl Into<String>, timeout: Duration) -> Self {
        Self { registry, model_name: model_name.into(), timeout }
    }

    async fn bounded<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        with_timeout(self.timeout, fut).await
            .map_err(|e| LifecycleError::RegistryUnavailable(e.to_string()))?
    }

    pub async fn compare_versions(&self, current: &ModelVersionRef, all: &[ModelVersionRef]) -> Result<ComparisonReport> {
        let Some(previous) = select_baseline(current, all) else {
            let metrics = self.bounded(self.registry.fetch_metrics(&current.run_id)).await?;
            debug!(version = current.version, "no earlier version to compare against");
            return Ok(ComparisonReport::first_version(VersionSnapshot::new(current, metrics)));
        };
        let (cur, prev) = tokio::join!(
            self.bounded(self.registry.fetch_metrics(&current.run_id)),
            self.bounded(self.registry.fetch_metrics(&previous.run_id)),
        );
        let report = ComparisonReport::between(VersionSnapshot::new(current, cur?), VersionSnapshot::new(previous, prev?));
        info!(current = current.version, previous = previous.version, deltas = ?report.deltas, "versions compared");
        Ok(report)
    }

    /// Compare the registry's Production version against its predecessor.
    pub async fn compare_production(&self) -> Result<ComparisonReport> {
        let all = self.bounded(self.registry.list_versions(&self.model_name)).await?;
        let current = select_current(&all).ok_or_else(|| LifecycleError::NoProductionVersion(self.model_name.clone()))?;
        self.compare_versions(current, &all).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::InMemoryRegistry;
    use chrono::Utc;

    fn metrics(mae: f64, rmse: f64, r2: f64) -> ModelMetrics { ModelMetrics { mae, rmse, r2, mape: 0.0 } }

    fn vref(v: u64, stage: Stage) -> ModelVersionRef { ModelVersionRef::new(v, format!("run-{v}"), stage, Utc::now()) }

    #[test]
    fn delta_formulas() {
        assert_eq!(lower_is_better_delta(5.0, 8.0), 37.5);
        assert_eq!(lower_is_better_delta(10.0, 8.0), -25.0);
        assert!((higher_is_better_delta(0.9, 0.8) - 12.5).abs() < 1e-9);
    }

    #[test]
    fn zero_or_negative_baseline_short_circuits() {
        assert_eq!(lower_is_better_delta(5.0, 0.0), 0.0);
        assert_eq!(higher_is_better_delta(0.5, 0.0), 0.0);
        assert_eq!(higher_is_better_delta(0.5, -0.2), 0.0);
    }

    #[test]
    fn classify_is_sign_based() {
        assert_eq!(classify(0.001), Verdict::Improved);
        assert_eq!(classify(-0.001), Verdict::Degraded);
        assert_eq!(classify(0.0), Verdict::Unchanged);
    }

    #[test]
    fn verdict_uses_unrounded_delta() {
        let report = ComparisonReport::between(
            VersionSnapshot::new(&vref(2, Stage::Production), metrics(9.9999, 1.0, 0.5)),
            VersionSnapshot::new(&vref(1, Stage::Archived), metrics(10.0, 1.0, 0.5)),
        );
        let deltas = report.deltas.unwrap();
        assert_eq!(deltas.mae_percent, 0.0);
        assert_eq!(report.verdicts.unwrap().mae, Verdict::Improved);
        assert_eq!(report.verdicts.unwrap().rmse, Verdict::Unchanged);
    }

    #[test]
    fn baseline_skips_gaps_and_ignores_newer() {
        let all = vec![vref(1, Stage::Archived), vref(3, Stage::Archived), vref(6, Stage::Production), vref(7, Stage::Staging)];
        let current = select_current(&all).unwrap();
        assert_eq!(current.version, 6);
        assert_eq!(select_baseline(current, &all).unwrap().version, 3);
        assert!(select_baseline(&all[0], &all).is_none());
    }

    #[tokio::test]
    async fn scenario_mae_improvement() {
        let reg = Arc::new(InMemoryRegistry::new("m"));
        reg.register(1, Stage::Archived, metrics(8.0, 10.0, 0.80), None);
        reg.register(2, Stage::Production, metrics(5.0, 10.0, 0.88), None);
        let cmp = VersionComparator::new(reg, "m", Duration::from_secs(1));
        let report = cmp.compare_production().await.unwrap();
        assert!(report.has_comparison);
        let deltas = report.deltas.unwrap();
        assert_eq!(deltas.mae_percent, 37.5);
        assert_eq!(deltas.rmse_percent, 0.0);
        assert_eq!(deltas.r2_percent, 10.0);
        let v = report.verdicts.unwrap();
        assert_eq!((v.mae, v.rmse, v.r2), (Verdict::Improved, Verdict::Unchanged, Verdict::Improved));
        assert_eq!(report, cmp.compare_production().await.unwrap());
    }

    #[tokio::test]
    async fn single_version_has_no_baseline() {
        let reg = Arc::new(InMemoryRegistry::new("m"));
        reg.register(2, Stage::Production, metrics(5.0, 7.0, 0.9), None);
        let report = VersionComparator::new(reg, "m", Duration::from_secs(1)).compare_production().await.unwrap();
        assert!(!report.has_comparison);
        assert!(report.deltas.is_none() && report.previous.is_none());
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["message"], FIRST_VERSION_MESSAGE);
        assert!(json.get("deltas").is_none());
        assert_eq!(json["current_version"]["metrics"]["mae"], 5.0);
    }

    #[tokio::test]
    async fn no_production_is_an_error() {
        let reg = Arc::new(InMemoryRegistry::new("m"));
        reg.register(1, Stage::Staging, ModelMetrics::default(), None);
        let err = VersionComparator::new(reg, "m", Duration::from_secs(1)).compare_production().await.unwrap_err();
        assert_eq!(err, LifecycleError::NoProductionVersion("m".into()));
    }
}
