//! Request validation and the prediction path. Inputs are checked before the
//! model is touched; the model and its version label come from one slot read.

use crate::artifact::FeatureVector;
use crate::error::{LifecycleError, Result};
use crate::metrics::metrics;
use crate::model::ServedModel;
use crate::slot::ModelSlot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

pub const MAX_ADVERTISING_SPEND: f64 = 10_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PredictionRequest {
    pub advertising_spend: f64,
    pub promotions: i64,
    pub day_of_week: i64,
    pub month: i64,
    pub is_weekend: i64,
}

impl PredictionRequest {
    /// Out-of-range values are rejected, never clamped.
    pub fn validate(&self) -> Result<FeatureVector> {
        if !self.advertising_spend.is_finite() || !(0.0..=MAX_ADVERTISING_SPEND).contains(&self.advertising_spend) {
            return Err(LifecycleError::invalid("advertising_spend", format!("must be within [0, 10000], got {}", self.advertising_spend)));
        }
        check_int("promotions", self.promotions, 0..=1)?;
        check_int("day_of_week", self.day_of_week, 0..=6)?;
        check_int("month", self.month, 1..=12)?;
        check_int("is_weekend", self.is_weekend, 0..=1)?;
        Ok(FeatureVector::new([
            self.advertising_spend,
            self.promotions as f64,
            self.day_of_week as f64,
            self.month as f64,
            self.is_weekend as f64,
        ]))
    }
}

fn check_int(field: &'static str, v: i64, range: RangeInclusive<i64>) -> Result<()> {
    if range.contains(&v) { Ok(()) } else {
        Err(LifecycleError::invalid(field, format!("must be within [{}, {}], got {v}", range.start(), range.end())))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    #[serde(rename = "prediction")]
    pub value: f64,
    #[serde(rename = "model_version")]
    pub served_version: String,
    pub confidence: f64,
    #[serde(rename = "timestamp")]
    pub produced_at: DateTime<Utc>,
}

/// Two-bucket plausibility heuristic; not a statistical interval.
pub fn confidence_for(value: f64) -> f64 {
    if value > 80.0 && value < 200.0 { 0.85 } else { 0.70 }
}

#[derive(Clone)]
pub struct PredictionService {
    slot: Arc<ModelSlot>,
}

impl PredictionService {
    pub fn new(slot: Arc<ModelSlot>) -> Self { Self { slot } }

    pub fn predict(&self, req: &PredictionRequest) -> Result<PredictionResult> {
        self.predict_with_model(req).map(|(result, _)| result)
    }

    /// Like [`predict`](Self::predict) but also returns the model snapshot the
    /// result was computed with.
    pub fn predict_with_model(&self, req: &PredictionRequest) -> Result<(PredictionResult, Arc<ServedModel>)> {
        let outcome = self.run(req);
        let label = match &outcome { Ok(_) => "ok", Err(e) => e.kind() };
        metrics().predictions_total.with_label_values(&[label]).inc();
        outcome
    }

    fn run(&self, req: &PredictionRequest) -> Result<(PredictionResult, Arc<ServedModel>)> {
        let features = req.validate()?;
        let served = self.slot.read().ok_or(LifecycleError::ModelNotReady)?;
        let started = Instant::now();
        let value = served.artifact().predict(&features).map_err(|e| {
            warn!(error = %e, version = %served.version_label(), "predictor failed");
            match e {
                LifecycleError::PredictorFailure(_) => e,
                other => LifecycleError::PredictorFailure(other.to_string()),
            }
        })?;
        metrics().prediction_latency_seconds.observe(started.elapsed().as_secs_f64());
        let result = PredictionResult {
            value,
            served_version: served.version_label(),
            confidence: confidence_for(value),
            produced_at: Utc::now(),
        };
        info!(prediction = value, confidence = result.confidence, model = %result.served_version, "prediction");
        Ok((result, served))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{LinearModel, Predictor};
    use crate::model::{ModelSource, ModelVersionRef, Stage};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting { calls: AtomicUsize, value: f64 }
    impl Predictor for Counting {
        fn predict(&self, _f: &FeatureVector) -> Result<f64> { self.calls.fetch_add(1, Ordering::SeqCst); Ok(self.value) }
        fn kind(&self) -> &'static str { "counting" }
    }

    fn valid() -> PredictionRequest {
        PredictionRequest { advertising_spend: 3000.0, promotions: 1, day_of_week: 0, month: 1, is_weekend: 0 }
    }

    fn service_with(artifact: Arc<dyn Predictor>) -> PredictionService {
        let slot = Arc::new(ModelSlot::new());
        slot.replace(ServedModel::new(artifact, ModelVersionRef::new(2, "run-2", Stage::Production, Utc::now()), ModelSource::Registry));
        PredictionService::new(slot)
    }

    #[test]
    fn confidence_buckets_are_exclusive_at_edges() {
        assert_eq!(confidence_for(80.0), 0.70);
        assert_eq!(confidence_for(80.01), 0.85);
        assert_eq!(confidence_for(199.99), 0.85);
        assert_eq!(confidence_for(200.0), 0.70);
        assert_eq!(confidence_for(-5.0), 0.70);
    }

    #[test]
    fn valid_request_reports_served_version() {
        let svc = service_with(Arc::new(LinearModel::constant(120.0)));
        let r = svc.predict(&valid()).unwrap();
        assert_eq!(r.value, 120.0);
        assert_eq!(r.served_version, "v2");
        assert_eq!(r.confidence, 0.85);
    }

    #[test]
    fn out_of_range_never_reaches_predictor() {
        let counting = Arc::new(Counting { calls: AtomicUsize::new(0), value: 100.0 });
        let svc = service_with(counting.clone());
        let bad = [
            PredictionRequest { advertising_spend: -1.0, ..valid() },
            PredictionRequest { advertising_spend: 10_000.5, ..valid() },
            PredictionRequest { advertising_spend: f64::NAN, ..valid() },
            PredictionRequest { promotions: 2, ..valid() },
            PredictionRequest { day_of_week: 7, ..valid() },
            PredictionRequest { month: 0, ..valid() },
            PredictionRequest { month: 13, ..valid() },
            PredictionRequest { is_weekend: -1, ..valid() },
        ];
        for req in bad {
            assert!(matches!(svc.predict(&req), Err(LifecycleError::InvalidInput { .. })), "{req:?}");
        }
        assert_eq!(counting.calls.load(Ordering::SeqCst), 0);
        svc.predict(&valid()).unwrap();
        assert_eq!(counting.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn boundaries_are_accepted() {
        let svc = service_with(Arc::new(LinearModel::constant(50.0)));
        let edge = PredictionRequest { advertising_spend: 10_000.0, promotions: 0, day_of_week: 6, month: 12, is_weekend: 1 };
        assert_eq!(svc.predict(&edge).unwrap().confidence, 0.70);
    }

    #[test]
    fn empty_slot_is_not_ready() {
        let svc = PredictionService::new(Arc::new(ModelSlot::new()));
        assert_eq!(svc.predict(&valid()).unwrap_err(), LifecycleError::ModelNotReady);
    }

    #[test]
    fn predictor_errors_surface_as_failures() {
        let svc = service_with(Arc::new(LinearModel { intercept: f64::MAX, coefficients: vec![f64::MAX, 0.0, 0.0, 0.0, 0.0] }));
        assert!(matches!(svc.predict(&valid()), Err(LifecycleError::PredictorFailure(_))));
    }
}
