//! Model lifecycle manager for the sales forecaster: loads the production
//! model, serves predictions, keeps the served model in step with the
//! registry and compares it against the version it replaced.

pub mod api;
pub mod artifact;
pub mod comparator;
pub mod config;
pub mod error;
pub mod loader;
pub mod metrics;
pub mod model;
pub mod prediction;
pub mod registry;
pub mod scheduler;
pub mod slot;

pub use api::{router, ApiSettings, AppState};
pub use config::ServiceConfig;
pub use error::LifecycleError;

use comparator::VersionComparator;
use loader::ModelLoader;
use registry::{MlflowRegistry, RegistryClient};
use scheduler::ReloadScheduler;
use slot::ModelSlot;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Wire slot, loader, scheduler and comparator around `registry` and run the
/// startup load. A failed load leaves the service up but not ready.
pub async fn start(cfg: &ServiceConfig, registry: Option<Arc<dyn RegistryClient>>) -> AppState {
    let timeout = Duration::from_secs(cfg.registry.timeout_secs);
    let slot = Arc::new(ModelSlot::new());
    let loader = Arc::new(ModelLoader::new(registry.clone(), cfg.model_name.clone(), cfg.local_model_path.clone(), timeout));
    let scheduler = Arc::new(ReloadScheduler::new(loader, slot.clone(), Duration::from_secs(cfg.reload.interval_secs)));
    match scheduler.initial_load().await {
        Ok(model) => info!(version = %model.version_label(), source = ?model.source(), "service ready"),
        Err(e) => error!(error = %e, "no model could be loaded, health will report not ready"),
    }
    let settings = ApiSettings {
        model_name: cfg.model_name.clone(),
        auto_reload: cfg.reload.enabled && registry.is_some(),
        reload_interval_secs: cfg.reload.interval_secs,
    };
    let comparator = registry.map(|r| Arc::new(VersionComparator::new(r, cfg.model_name.clone(), timeout)));
    AppState::new(slot, scheduler, comparator, settings)
}

pub async fn run(cfg: ServiceConfig) -> anyhow::Result<()> {
    let registry: Option<Arc<dyn RegistryClient>> = if cfg.registry.is_configured() {
        Some(Arc::new(MlflowRegistry::new(&cfg.registry)?))
    } else {
        warn!("registry credentials not set, serving the local artifact only");
        None
    };
    let state = start(&cfg, registry).await;
    let poller = if cfg.reload.enabled && cfg.registry.is_configured() {
        Some(state.scheduler().clone().spawn())
    } else {
        info!(enabled = cfg.reload.enabled, "auto reload inactive");
        None
    };

    let listener = tokio::net::TcpListener::bind(&cfg.listen_addr).await?;
    info!(addr = %cfg.listen_addr, "listening");
    axum::serve(listener, router(state)).with_graceful_shutdown(shutdown_signal()).await?;

    if let Some(handle) = poller { handle.stop().await; }
    info!("shutdown");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
