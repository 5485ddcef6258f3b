use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::dataset::FeatureMatrix;
use crate::gbdt::GbdtRegressor;
use crate::linear::{SgdRegressor, StandardScaler};

pub const ARTIFACT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TrainedModel {
    Gbdt(GbdtRegressor),
    Linear {
        scaler: StandardScaler,
        model: SgdRegressor,
    },
}

impl TrainedModel {
    pub fn predict(&self, x: &FeatureMatrix) -> Result<Vec<f64>> {
        match self {
            TrainedModel::Gbdt(model) => model.predict(x),
            TrainedModel::Linear { scaler, model } => model.predict(&scaler.transform(x)?),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            TrainedModel::Gbdt(_) => "gbdt",
            TrainedModel::Linear { .. } => "linear",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub version: u32,
    pub generated_at: String,
    pub feature_set: String,
    pub features: Vec<String>,
    pub model: TrainedModel,
}

impl ModelArtifact {
    pub fn new(feature_set: &str, features: Vec<String>, model: TrainedModel) -> Self {
        Self {
            version: ARTIFACT_VERSION,
            generated_at: chrono::Utc::now().to_rfc3339(),
            feature_set: feature_set.to_string(),
            features,
            model,
        }
    }
}

pub fn save_artifact(path: &Path, artifact: &ModelArtifact) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let raw = serde_json::to_string(artifact).context("serialize model artifact")?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, raw).with_context(|| format!("write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("move into {}", path.display()))?;
    Ok(())
}

pub fn load_artifact(path: &Path) -> Result<ModelArtifact> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let artifact = serde_json::from_str::<ModelArtifact>(&raw)
        .with_context(|| format!("parse model artifact {}", path.display()))?;
    if artifact.version != ARTIFACT_VERSION {
        return Err(anyhow!(
            "{} has artifact version {}, expected {}",
            path.display(),
            artifact.version,
            ARTIFACT_VERSION
        ));
    }
    Ok(artifact)
}
