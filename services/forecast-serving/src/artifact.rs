//! Predictor capability and the serialized artifact document shared by the
//! registry and the local fallback file.
//!
//! Document shape (JSON, tagged by `kind`):
//! ```json
//! {"kind": "linear", "intercept": 42.0, "coefficients": [0.01, 12.0, -0.5, 0.3, 8.0]}
//! {"kind": "forest", "trees": [{"nodes": [
//!     {"type": "split", "feature": 0, "threshold": 2500.0, "left": 1, "right": 2},
//!     {"type": "leaf", "value": 90.0},
//!     {"type": "leaf", "value": 140.0}]}]}
//! ```

use crate::error::{LifecycleError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// Column order the training pipeline fits against.
pub const FEATURE_NAMES: [&str; 5] = ["advertising_spend", "promotions", "day_of_week", "month", "is_weekend"];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureVector([f64; FEATURE_NAMES.len()]);

impl FeatureVector {
    pub fn new(values: [f64; FEATURE_NAMES.len()]) -> Self { Self(values) }
    pub fn values(&self) -> &[f64] { &self.0 }
}

/// Anything that can turn a feature vector into a single numeric prediction.
pub trait Predictor: Send + Sync {
    fn predict(&self, features: &FeatureVector) -> Result<f64>;
    fn kind(&self) -> &'static str;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearModel {
    pub intercept: f64,
    pub coefficients: Vec<f64>,
}

impl LinearModel {
    /// Model that ignores its inputs.
    pub fn constant(value: f64) -> Self { Self { intercept: value, coefficients: vec![0.0; FEATURE_NAMES.len()] } }

    fn validate(&self) -> Result<()> {
        if self.coefficients.len() != FEATURE_NAMES.len() {
            return Err(LifecycleError::InvalidArtifact(format!(
                "linear model has {} coefficients, expected {}", self.coefficients.len(), FEATURE_NAMES.len())));
        }
        if !self.intercept.is_finite() || self.coefficients.iter().any(|c| !c.is_finite()) {
            return Err(LifecycleError::InvalidArtifact("linear model has non-finite parameters".into()));
        }
        Ok(())
    }
}

impl Predictor for LinearModel {
    fn predict(&self, features: &FeatureVector) -> Result<f64> {
        let y = self.intercept + self.coefficients.iter().zip(features.values()).map(|(c, x)| c * x).sum::<f64>();
        finite(y)
    }

    fn kind(&self) -> &'static str { "linear" }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TreeNode {
    /// Goes `left` when `features[feature] <= threshold`.
    Split { feature: usize, threshold: f64, left: usize, right: usize },
    Leaf { value: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionTree {
    pub nodes: Vec<TreeNode>,
}

impl RegressionTree {
    // Children must sit after their parent, which rules out cycles.
    fn validate(&self, idx: usize) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(LifecycleError::InvalidArtifact(format!("tree {idx} has no nodes")));
        }
        for (i, node) in self.nodes.iter().enumerate() {
            match node {
                TreeNode::Split { feature, threshold, left, right } => {
                    if *feature >= FEATURE_NAMES.len() {
                        return Err(LifecycleError::InvalidArtifact(format!("tree {idx} node {i}: feature {feature} out of range")));
                    }
                    if !threshold.is_finite() {
                        return Err(LifecycleError::InvalidArtifact(format!("tree {idx} node {i}: non-finite threshold")));
                    }
                    for child in [*left, *right] {
                        if child <= i || child >= self.nodes.len() {
                            return Err(LifecycleError::InvalidArtifact(format!("tree {idx} node {i}: bad child index {child}")));
                        }
                    }
                }
                TreeNode::Leaf { value } if !value.is_finite() => {
                    return Err(LifecycleError::InvalidArtifact(format!("tree {idx} node {i}: non-finite leaf")));
                }
                TreeNode::Leaf { .. } => {}
            }
        }
        Ok(())
    }

    fn evaluate(&self, features: &FeatureVector) -> Result<f64> {
        let x = features.values();
        let mut idx = 0;
        loop {
            match self.nodes.get(idx) {
                Some(TreeNode::Leaf { value }) => return Ok(*value),
                Some(TreeNode::Split { feature, threshold, left, right }) => {
                    idx = if x[*feature] <= *threshold { *left } else { *right };
                }
                None => return Err(LifecycleError::PredictorFailure(format!("tree walked to missing node {idx}"))),
            }
        }
    }
}

/// Regression-tree ensemble; the prediction is the mean over trees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForestModel {
    pub trees: Vec<RegressionTree>,
}

impl ForestModel {
    fn validate(&self) -> Result<()> {
        if self.trees.is_empty() {
            return Err(LifecycleError::InvalidArtifact("forest has no trees".into()));
        }
        self.trees.iter().enumerate().try_for_each(|(i, t)| t.validate(i))
    }
}

impl Predictor for ForestModel {
    fn predict(&self, features: &FeatureVector) -> Result<f64> {
        let mut sum = 0.0;
        for tree in &self.trees { sum += tree.evaluate(features)?; }
        finite(sum / self.trees.len() as f64)
    }

    fn kind(&self) -> &'static str { "forest" }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ArtifactDocument {
    Linear(LinearModel),
    Forest(ForestModel),
}

impl ArtifactDocument {
    pub fn into_predictor(self) -> Result<Arc<dyn Predictor>> {
        match self {
            ArtifactDocument::Linear(m) => { m.validate()?; Ok(Arc::new(m)) }
            ArtifactDocument::Forest(m) => { m.validate()?; Ok(Arc::new(m)) }
        }
    }
}

pub fn parse_artifact(bytes: &[u8]) -> Result<Arc<dyn Predictor>> {
    let doc: ArtifactDocument = serde_json::from_slice(bytes).map_err(|e| LifecycleError::InvalidArtifact(e.to_string()))?;
    doc.into_predictor()
}

/// Reads the local fallback file. A missing file is `ArtifactNotFound`.
pub async fn read_artifact_file(path: &Path) -> Result<Arc<dyn Predictor>> {
    let bytes = match tokio::fs::read(path).await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(LifecycleError::ArtifactNotFound(format!("no local model at {}", path.display())));
        }
        Err(e) => return Err(LifecycleError::ArtifactNotFound(format!("{}: {e}", path.display()))),
    };
    parse_artifact(&bytes)
}

fn finite(y: f64) -> Result<f64> {
    if y.is_finite() { Ok(y) } else { Err(LifecycleError::PredictorFailure(format!("non-finite prediction {y}"))) }
}
