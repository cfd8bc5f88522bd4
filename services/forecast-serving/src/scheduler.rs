//! Reload cycle shared by the background poller and the manual reload
//! endpoint. Every swap goes through [`ReloadScheduler::run_cycle`] or
//! [`ReloadScheduler::initial_load`], both serialized on one async lock.

use crate::error::{LifecycleError, Result};
use crate::loader::{LoadTarget, ModelLoader};
use crate::metrics::metrics;
use crate::model::ServedModel;
use crate::slot::ModelSlot;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadTrigger {
    Background,
    /// `force` adopts the registry's Production version even when it is older
    /// than the served one (rollback).
    Manual { force: bool },
}

impl ReloadTrigger {
    pub fn label(&self) -> &'static str {
        match self { Self::Background => "background", Self::Manual { .. } => "manual" }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    RegistryNotConfigured,
    SlotEmpty,
    RegistryUnavailable(String),
    NoProductionVersion,
    StaleProduction { served: u64, production: u64 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Skipped(SkipReason),
    Unchanged { version: String },
    Swapped { from: Option<String>, to: String },
    Failed(LifecycleError),
}

impl TickOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Skipped(_) => "skipped",
            Self::Unchanged { .. } => "unchanged",
            Self::Swapped { .. } => "swapped",
            Self::Failed(_) => "failed",
        }
    }

    pub fn swapped(&self) -> bool { matches!(self, Self::Swapped { .. }) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SchedulerState { Idle, Polling, Swapping, Stopped }

pub struct ReloadScheduler {
    loader: Arc<ModelLoader>,
    slot: Arc<ModelSlot>,
    swap_lock: Mutex<()>,
    interval: Duration,
}

impl ReloadScheduler {
    pub fn new(loader: Arc<ModelLoader>, slot: Arc<ModelSlot>, interval: Duration) -> Self {
        Self { loader, slot, swap_lock: Mutex::new(()), interval }
    }

    pub fn loader(&self) -> &Arc<ModelLoader> { &self.loader }
    pub fn interval(&self) -> Duration { self.interval }

    /// Startup load: registry first, local file as fallback. Leaves the slot
    /// empty on failure so health reports not-ready.
    pub async fn initial_load(&self) -> Result<Arc<ServedModel>> {
        let _guard = self.swap_lock.lock().await;
        self.load_and_install(LoadTarget::Production, true, "startup").await
    }

    /// One reload check. Never empties the slot: a failed load keeps whatever
    /// was served before.
    pub async fn run_cycle(&self, trigger: ReloadTrigger) -> TickOutcome {
        let _guard = self.swap_lock.lock().await;
        debug!(state = ?SchedulerState::Polling, trigger = trigger.label(), "reload cycle");
        let outcome = self.cycle(trigger).await;
        metrics().reload_ticks_total.with_label_values(&[outcome.label()]).inc();
        match &outcome {
            TickOutcome::Skipped(reason) => debug!(trigger = trigger.label(), ?reason, "reload skipped"),
            TickOutcome::Unchanged { version } => debug!(trigger = trigger.label(), %version, "production unchanged"),
            TickOutcome::Swapped { from, to } => info!(trigger = trigger.label(), from = from.as_deref().unwrap_or("none"), %to, "model swapped"),
            TickOutcome::Failed(e) => warn!(trigger = trigger.label(), error = %e, "reload failed, keeping current model"),
        }
        outcome
    }

    async fn cycle(&self, trigger: ReloadTrigger) -> TickOutcome {
        let manual = matches!(trigger, ReloadTrigger::Manual { .. });
        let Some(registry) = self.loader.registry() else {
            if !manual { return TickOutcome::Skipped(SkipReason::RegistryNotConfigured); }
            return self.reinstall(LoadTarget::Production, false, trigger).await;
        };
        let Some(current) = self.slot.read() else {
            if !manual { return TickOutcome::Skipped(SkipReason::SlotEmpty); }
            return self.reinstall(LoadTarget::Production, true, trigger).await;
        };

        let production = match self.loader.bounded(registry.resolve_production(self.loader.model_name())).await {
            Ok(v) => v,
            Err(e) if manual => return TickOutcome::Failed(e),
            Err(LifecycleError::NoProductionVersion(_)) => return TickOutcome::Skipped(SkipReason::NoProductionVersion),
            Err(e) => return TickOutcome::Skipped(SkipReason::RegistryUnavailable(e.to_string())),
        };

        let served = current.ordinal();
        let force = matches!(trigger, ReloadTrigger::Manual { force: true });
        if production.version == served {
            return TickOutcome::Unchanged { version: current.version_label() };
        }
        if production.version < served && !force {
            return TickOutcome::Skipped(SkipReason::StaleProduction { served, production: production.version });
        }
        debug!(state = ?SchedulerState::Swapping, served, production = production.version, "newer production version");
        self.reinstall(LoadTarget::Version(production), false, trigger).await
    }

    async fn reinstall(&self, target: LoadTarget, fallback: bool, trigger: ReloadTrigger) -> TickOutcome {
        let from = self.slot.read().map(|m| m.version_label());
        match self.load_and_install(target, fallback, trigger.label()).await {
            Ok(model) => TickOutcome::Swapped { from, to: model.version_label() },
            Err(e) => TickOutcome::Failed(e),
        }
    }

    // Callers hold `swap_lock`.
    async fn load_and_install(&self, target: LoadTarget, fallback: bool, trigger: &'static str) -> Result<Arc<ServedModel>> {
        let model = if fallback {
            self.loader.load(target).await?
        } else if self.loader.registry().is_some() {
            self.loader.load_from_registry(target).await?
        } else {
            self.loader.load_local().await?
        };
        self.slot.replace(model);
        let installed = self.slot.read().ok_or(LifecycleError::ModelNotReady)?;
        metrics().model_swaps_total.with_label_values(&[trigger]).inc();
        metrics().served_model_version.set(installed.ordinal() as i64);
        info!(version = %installed.version_label(), source = ?installed.source(), trigger, "model installed");
        Ok(installed)
    }

    /// Start the background poller. The first check happens one interval
    /// after spawning, since startup has just loaded.
    pub fn spawn(self: Arc<Self>) -> SchedulerHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let join = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_secs = self.interval.as_secs(), state = ?SchedulerState::Idle, "reload scheduler started");
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = ticker.tick() => {}
                }
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = self.run_cycle(ReloadTrigger::Background) => {}
                }
            }
            info!(state = ?SchedulerState::Stopped, "reload scheduler stopped");
        });
        SchedulerHandle { stop: stop_tx, join }
    }
}

pub struct SchedulerHandle {
    stop: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl SchedulerHandle {
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.join.await {
            error!(error = %e, "reload scheduler task panicked");
        }
    }

    pub fn is_finished(&self) -> bool { self.join.is_finished() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{FeatureVector, LinearModel, Predictor};
    use crate::model::{ModelMetrics, ModelSource, Stage};
    use crate::registry::{InMemoryRegistry, RegistryClient};

    fn art(v: f64) -> Option<Arc<dyn Predictor>> { Some(Arc::new(LinearModel::constant(v))) }

    fn setup(reg: Arc<InMemoryRegistry>) -> (Arc<ReloadScheduler>, Arc<ModelSlot>) {
        let slot = Arc::new(ModelSlot::new());
        let registry: Arc<dyn RegistryClient> = reg;
        let loader = Arc::new(ModelLoader::new(Some(registry), "m", "/nonexistent/model.json", Duration::from_millis(200)));
        (Arc::new(ReloadScheduler::new(loader, slot.clone(), Duration::from_millis(20))), slot)
    }

    fn served_value(slot: &ModelSlot) -> f64 {
        slot.read().unwrap().artifact().predict(&FeatureVector::new([0.0; 5])).unwrap()
    }

    #[tokio::test]
    async fn newer_production_is_swapped_in() {
        let reg = Arc::new(InMemoryRegistry::new("m"));
        reg.register(1, Stage::Production, ModelMetrics::default(), art(1.0));
        let (sched, slot) = setup(reg.clone());
        sched.initial_load().await.unwrap();
        reg.register(2, Stage::Production, ModelMetrics::default(), art(2.0));
        let out = sched.run_cycle(ReloadTrigger::Background).await;
        assert_eq!(out, TickOutcome::Swapped { from: Some("v1".into()), to: "v2".into() });
        assert_eq!(served_value(&slot), 2.0);
    }

    #[tokio::test]
    async fn equal_or_lower_ordinal_never_swaps() {
        let reg = Arc::new(InMemoryRegistry::new("m"));
        reg.register(1, Stage::Archived, ModelMetrics::default(), art(1.0));
        reg.register(2, Stage::Production, ModelMetrics::default(), art(2.0));
        let (sched, _slot) = setup(reg.clone());
        sched.initial_load().await.unwrap();
        let loads = reg.artifact_loads();
        for _ in 0..3 {
            assert_eq!(sched.run_cycle(ReloadTrigger::Background).await, TickOutcome::Unchanged { version: "v2".into() });
        }
        reg.set_stage(1, Stage::Production);
        for _ in 0..3 {
            assert_eq!(sched.run_cycle(ReloadTrigger::Background).await,
                TickOutcome::Skipped(SkipReason::StaleProduction { served: 2, production: 1 }));
        }
        assert_eq!(sched.run_cycle(ReloadTrigger::Manual { force: false }).await,
            TickOutcome::Skipped(SkipReason::StaleProduction { served: 2, production: 1 }));
        assert_eq!(reg.artifact_loads(), loads);
    }

    #[tokio::test]
    async fn forced_manual_reload_adopts_rollback() {
        let reg = Arc::new(InMemoryRegistry::new("m"));
        reg.register(1, Stage::Archived, ModelMetrics::default(), art(1.0));
        reg.register(2, Stage::Production, ModelMetrics::default(), art(2.0));
        let (sched, slot) = setup(reg.clone());
        sched.initial_load().await.unwrap();
        reg.set_stage(1, Stage::Production);
        let out = sched.run_cycle(ReloadTrigger::Manual { force: true }).await;
        assert_eq!(out, TickOutcome::Swapped { from: Some("v2".into()), to: "v1".into() });
        assert_eq!(served_value(&slot), 1.0);
    }

    #[tokio::test]
    async fn failed_load_keeps_serving_previous_model() {
        let reg = Arc::new(InMemoryRegistry::new("m"));
        reg.register(1, Stage::Production, ModelMetrics::default(), art(1.0));
        let (sched, slot) = setup(reg.clone());
        sched.initial_load().await.unwrap();
        reg.register(2, Stage::Production, ModelMetrics::default(), None);
        assert!(matches!(sched.run_cycle(ReloadTrigger::Background).await, TickOutcome::Failed(LifecycleError::ArtifactNotFound(_))));
        assert_eq!(slot.read().unwrap().version_label(), "v1");
    }

    #[tokio::test]
    async fn outage_and_timeout_are_skipped_ticks() {
        let reg = Arc::new(InMemoryRegistry::new("m"));
        reg.register(1, Stage::Production, ModelMetrics::default(), art(1.0));
        let (sched, slot) = setup(reg.clone());
        sched.initial_load().await.unwrap();
        reg.set_available(false);
        assert!(matches!(sched.run_cycle(ReloadTrigger::Background).await, TickOutcome::Skipped(SkipReason::RegistryUnavailable(_))));
        reg.set_available(true);
        reg.set_latency(Some(Duration::from_secs(5)));
        assert!(matches!(sched.run_cycle(ReloadTrigger::Background).await, TickOutcome::Skipped(SkipReason::RegistryUnavailable(_))));
        assert!(matches!(sched.run_cycle(ReloadTrigger::Manual { force: false }).await, TickOutcome::Failed(LifecycleError::RegistryUnavailable(_))));
        assert_eq!(slot.read().unwrap().version_label(), "v1");
    }

    #[tokio::test]
    async fn empty_slot_skips_background_but_manual_loads() {
        let reg = Arc::new(InMemoryRegistry::new("m"));
        let (sched, slot) = setup(reg.clone());
        assert!(sched.initial_load().await.is_err());
        assert_eq!(sched.run_cycle(ReloadTrigger::Background).await, TickOutcome::Skipped(SkipReason::SlotEmpty));
        reg.register(4, Stage::Production, ModelMetrics::default(), art(4.0));
        assert_eq!(sched.run_cycle(ReloadTrigger::Background).await, TickOutcome::Skipped(SkipReason::SlotEmpty));
        let out = sched.run_cycle(ReloadTrigger::Manual { force: false }).await;
        assert_eq!(out, TickOutcome::Swapped { from: None, to: "v4".into() });
        assert_eq!(slot.read().unwrap().source(), ModelSource::Registry);
    }

    #[tokio::test]
    async fn no_registry_background_is_noop() {
        let slot = Arc::new(ModelSlot::new());
        let loader = Arc::new(ModelLoader::new(None, "m", "/nonexistent/model.json", Duration::from_secs(1)));
        let sched = ReloadScheduler::new(loader, slot, Duration::from_secs(1));
        assert_eq!(sched.run_cycle(ReloadTrigger::Background).await, TickOutcome::Skipped(SkipReason::RegistryNotConfigured));
        assert!(matches!(sched.run_cycle(ReloadTrigger::Manual { force: false }).await, TickOutcome::Failed(LifecycleError::ArtifactNotFound(_))));
    }

    #[tokio::test]
    async fn spawned_poller_picks_up_new_version_and_stops() {
        let reg = Arc::new(InMemoryRegistry::new("m"));
        reg.register(1, Stage::Production, ModelMetrics::default(), art(1.0));
        let (sched, slot) = setup(reg.clone());
        sched.initial_load().await.unwrap();
        let handle = sched.clone().spawn();
        reg.register(2, Stage::Production, ModelMetrics::default(), art(2.0));
        let deadline = Instant::now() + Duration::from_secs(2);
        while slot.read().unwrap().version_label() != "v2" && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(slot.read().unwrap().version_label(), "v2");
        tokio::time::timeout(Duration::from_secs(1), handle.stop()).await.unwrap();
    }

    #[tokio::test]
    async fn stop_cancels_an_inflight_cycle() {
        let reg = Arc::new(InMemoryRegistry::new("m"));
        reg.register(1, Stage::Production, ModelMetrics::default(), art(1.0));
        let slot = Arc::new(ModelSlot::new());
        let registry: Arc<dyn RegistryClient> = reg.clone();
        let loader = Arc::new(ModelLoader::new(Some(registry), "m", "/nonexistent/model.json", Duration::from_secs(30)));
        let sched = Arc::new(ReloadScheduler::new(loader, slot, Duration::from_millis(10)));
        sched.initial_load().await.unwrap();
        reg.set_latency(Some(Duration::from_secs(20)));
        let handle = sched.spawn();
        tokio::time::sleep(Duration::from_millis(50)).await;
        tokio::time::timeout(Duration::from_secs(1), handle.stop()).await.unwrap();
    }
}
