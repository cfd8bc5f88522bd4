//! Model registry collaborator: the lifecycle manager only ever talks to a
//! registry through [`RegistryClient`].

use crate::artifact::Predictor;
use crate::error::Result;
use crate::model::{ModelMetrics, ModelVersionRef};
use async_trait::async_trait;
use std::sync::Arc;

mod memory;
mod mlflow;

pub use memory::InMemoryRegistry;
pub use mlflow::MlflowRegistry;

#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Version currently tagged Production, or `NoProductionVersion`.
    async fn resolve_production(&self, model_name: &str) -> Result<ModelVersionRef>;

    async fn fetch_metrics(&self, run_id: &str) -> Result<ModelMetrics>;

    /// All versions of `model_name`, ascending by ordinal.
    async fn list_versions(&self, model_name: &str) -> Result<Vec<ModelVersionRef>>;

    async fn load_artifact(&self, version: &ModelVersionRef) -> Result<Arc<dyn Predictor>>;
}
