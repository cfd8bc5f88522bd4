//! Serving metrics, registered on the default Prometheus registry and exposed
//! through `forecast_core::metrics_handler`.

use once_cell::sync::Lazy;
use prometheus::{Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts};
use tracing::debug;

pub struct ServingMetrics {
    pub predictions_total: IntCounterVec,
    pub prediction_latency_seconds: Histogram,
    pub reload_ticks_total: IntCounterVec,
    pub model_swaps_total: IntCounterVec,
    pub served_model_version: IntGauge,
}

fn register<C: prometheus::core::Collector + Clone + 'static>(c: C) -> C {
    if let Err(e) = prometheus::register(Box::new(c.clone())) { debug!(error = %e, "metric already registered"); }
    c
}

// Names and label sets are static, so construction cannot fail at runtime.
pub static SERVING_METRICS: Lazy<ServingMetrics> = Lazy::new(|| ServingMetrics {
    predictions_total: register(IntCounterVec::new(
        Opts::new("forecast_predictions_total", "Prediction requests by outcome"), &["outcome"]).expect("static metric")),
    prediction_latency_seconds: register(Histogram::with_opts(
        HistogramOpts::new("forecast_prediction_latency_seconds", "Time spent in the predictor")
            .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1])).expect("static metric")),
    reload_ticks_total: register(IntCounterVec::new(
        Opts::new("forecast_reload_ticks_total", "Reload cycles by outcome"), &["outcome"]).expect("static metric")),
    model_swaps_total: register(IntCounterVec::new(
        Opts::new("forecast_model_swaps_total", "Successful model swaps by trigger"), &["trigger"]).expect("static metric")),
    served_model_version: register(IntGauge::new(
        "forecast_served_model_version", "Registry ordinal of the served model (0 for a local file)").expect("static metric")),
});

pub fn metrics() -> &'static ServingMetrics { &SERVING_METRICS }
