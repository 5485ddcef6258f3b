use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::PipelineError;

#[derive(Debug, Deserialize)]
struct FeaturesFile {
    #[serde(default)]
    feature_sets: HashMap<String, Vec<String>>,
}

pub fn load_feature_set(path: &Path, set: &str) -> Result<Vec<String>> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    parse_feature_set(&raw, set, path)
}

pub fn parse_feature_set(raw: &str, set: &str, path: &Path) -> Result<Vec<String>> {
    let file: FeaturesFile =
        serde_json::from_str(raw).with_context(|| format!("parse {}", path.display()))?;
    let features = file
        .feature_sets
        .get(set)
        .filter(|f| !f.is_empty())
        .cloned()
        .ok_or_else(|| PipelineError::FeatureSetMissing {
            set: set.to_string(),
            path: path.to_path_buf(),
        })?;
    Ok(dedup_preserving_order(features))
}

fn dedup_preserving_order(names: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    names
        .into_iter()
        .filter(|n| seen.insert(n.clone()))
        .collect()
}
