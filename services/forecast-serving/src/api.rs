//! HTTP surface. Every handler reads the slot once and works from that
//! snapshot; readiness is nothing more than "the slot is populated".

use crate::artifact::FEATURE_NAMES;
use crate::comparator::VersionComparator;
use crate::error::{LifecycleError, Result};
use crate::model::{ModelMetrics, ModelSource, ServedModel};
use crate::prediction::{PredictionRequest, PredictionResult, PredictionService};
use crate::scheduler::{ReloadScheduler, ReloadTrigger, TickOutcome};
use crate::slot::ModelSlot;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Settings echoed back to clients; they do not affect request handling.
#[derive(Debug, Clone)]
pub struct ApiSettings {
    pub model_name: String,
    pub auto_reload: bool,
    pub reload_interval_secs: u64,
}

#[derive(Clone)]
pub struct AppState {
    slot: Arc<ModelSlot>,
    predictions: PredictionService,
    scheduler: Arc<ReloadScheduler>,
    comparator: Option<Arc<VersionComparator>>,
    settings: Arc<ApiSettings>,
}

impl AppState {
    pub fn new(slot: Arc<ModelSlot>, scheduler: Arc<ReloadScheduler>, comparator: Option<Arc<VersionComparator>>, settings: ApiSettings) -> Self {
        Self { predictions: PredictionService::new(slot.clone()), slot, scheduler, comparator, settings: Arc::new(settings) }
    }

    pub fn slot(&self) -> &Arc<ModelSlot> { &self.slot }
    pub fn scheduler(&self) -> &Arc<ReloadScheduler> { &self.scheduler }

    fn served(&self) -> Result<Arc<ServedModel>> { self.slot.read().ok_or(LifecycleError::ModelNotReady) }

    fn auto_reload(&self) -> Value {
        json!({ "enabled": self.settings.auto_reload, "interval_seconds": self.settings.reload_interval_secs })
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/predict", post(predict))
        .route("/predict/debug", post(predict_debug))
        .route("/model/info", get(model_info))
        .route("/model/compare", get(model_compare))
        .route("/model/reload", get(model_reload))
        .route("/metrics", get(forecast_core::metrics_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn now() -> String { Utc::now().to_rfc3339() }

fn body(payload: std::result::Result<Json<PredictionRequest>, JsonRejection>) -> Result<PredictionRequest> {
    payload.map(|Json(req)| req).map_err(|e| LifecycleError::invalid("body", e.body_text()))
}

async fn root(State(st): State<AppState>) -> Json<Value> {
    let served = st.slot.read();
    Json(json!({
        "service": crate::config::SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "status": if served.is_some() { "healthy" } else { "model_not_loaded" },
        "model_version": served.as_ref().map(|m| m.version_label()),
        "model_source": served.as_ref().map(|m| m.source()).unwrap_or(ModelSource::Unknown),
        "auto_reload_enabled": st.settings.auto_reload,
        "auto_reload_interval": if st.settings.auto_reload { format!("{}s", st.settings.reload_interval_secs) } else { "disabled".into() },
        "endpoints": {
            "health": "/health",
            "predict": "/predict",
            "predict_debug": "/predict/debug",
            "model_info": "/model/info",
            "model_compare": "/model/compare",
            "reload": "/model/reload",
            "metrics": "/metrics",
        },
        "timestamp": now(),
    }))
}

async fn health(State(st): State<AppState>) -> Result<Json<Value>> {
    let served = st.served()?;
    Ok(Json(json!({ "status": "healthy", "model_loaded": true, "model_version": served.version_label(), "timestamp": now() })))
}

async fn predict(State(st): State<AppState>, payload: std::result::Result<Json<PredictionRequest>, JsonRejection>) -> Result<Json<PredictionResult>> {
    let req = body(payload)?;
    Ok(Json(st.predictions.predict(&req)?))
}

async fn predict_debug(State(st): State<AppState>, payload: std::result::Result<Json<PredictionRequest>, JsonRejection>) -> Result<Json<Value>> {
    let req = body(payload)?;
    let (result, served) = st.predictions.predict_with_model(&req)?;
    let v = served.version_ref();
    Ok(Json(json!({
        "prediction": result.value,
        "model_version": result.served_version,
        "model_source": served.source(),
        "confidence": result.confidence,
        "timestamp": result.produced_at,
        "input_features": req,
        "model_metadata": {
            "version": v.version,
            "run_id": served.run_id(),
            "stage": v.stage,
            "kind": served.artifact().kind(),
            "loaded_at": served.loaded_at(),
        },
        "auto_reload": st.auto_reload(),
    })))
}

/// Metrics are fetched from the served version's run on every call. Any
/// failure degrades to zeros rather than failing the request.
async fn model_info(State(st): State<AppState>) -> Result<Json<Value>> {
    let served = st.served()?;
    let loader = st.scheduler.loader();
    let performance = match (served.run_id(), loader.registry()) {
        (Some(run_id), Some(registry)) => match loader.bounded(registry.fetch_metrics(run_id)).await {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, run_id, "could not fetch run metrics");
                ModelMetrics::default()
            }
        },
        _ => ModelMetrics::default(),
    };
    let v = served.version_ref();
    Ok(Json(json!({
        "model_name": st.settings.model_name,
        "model_version": served.version_label(),
        "metadata": {
            "version": v.version,
            "run_id": served.run_id(),
            "stage": v.stage,
            "source": served.source(),
            "created_at": v.created_at,
        },
        "features": FEATURE_NAMES,
        "target": "sales",
        "model_type": served.artifact().kind(),
        "loaded_at": served.loaded_at(),
        "performance": performance,
        "auto_reload": st.auto_reload(),
    })))
}

async fn model_compare(State(st): State<AppState>) -> Response {
    if let Err(e) = st.served() { return e.into_response(); }
    let Some(comparator) = st.comparator.as_ref() else {
        return Json(json!({ "has_comparison": false, "error": "registry not configured" })).into_response();
    };
    match comparator.compare_production().await {
        Ok(report) => Json(report).into_response(),
        Err(e) => {
            warn!(error = %e, "comparison unavailable");
            Json(json!({ "has_comparison": false, "error": e.to_string() })).into_response()
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ReloadParams {
    #[serde(default)]
    pub force: bool,
}

async fn model_reload(State(st): State<AppState>, Query(params): Query<ReloadParams>) -> Response {
    info!(force = params.force, "manual reload requested");
    let outcome = st.scheduler.run_cycle(ReloadTrigger::Manual { force: params.force }).await;
    let served = st.slot.read().map(|m| m.version_label());
    let mut payload = json!({
        "status": match &outcome { TickOutcome::Swapped { .. } => "reloaded", other => other.label() },
        "model_version": served,
        "timestamp": now(),
        "auto_reload_enabled": st.settings.auto_reload,
    });
    match outcome {
        TickOutcome::Swapped { from, .. } => { payload["previous_version"] = json!(from); }
        TickOutcome::Skipped(reason) => { payload["reason"] = json!(format!("{reason:?}")); }
        TickOutcome::Unchanged { .. } => {}
        TickOutcome::Failed(e) => {
            payload["error"] = json!(e.to_string());
            return (e.status_code(), Json(payload)).into_response();
        }
    }
    (StatusCode::OK, Json(payload)).into_response()
}
