use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::dataset::Frame;
use crate::error::PipelineError;

pub use crate::dataset::ID_COLUMNS;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdSource {
    Column(String),
    RowPosition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SubmissionRow {
    id: String,
    prediction: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    ids: Vec<String>,
    predictions: Vec<f64>,
}

/// `id`, then `row_id`, then the zero-based row position.
pub fn resolve_ids(frame: &Frame) -> (Vec<String>, IdSource) {
    for name in ID_COLUMNS {
        if let Some(ids) = frame.labels(name) {
            return (ids, IdSource::Column(name.to_string()));
        }
    }
    let ids = (0..frame.len()).map(|i| i.to_string()).collect();
    (ids, IdSource::RowPosition)
}

impl Submission {
    pub fn new(ids: Vec<String>, predictions: Vec<f64>) -> Result<Self> {
        if ids.len() != predictions.len() {
            return Err(anyhow!(PipelineError::Shape(format!(
                "{} ids but {} predictions",
                ids.len(),
                predictions.len()
            ))));
        }
        Ok(Self { ids, predictions })
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn predictions(&self) -> &[f64] {
        &self.predictions
    }

    pub fn write_csv(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        let mut writer =
            csv::Writer::from_path(path).with_context(|| format!("create {}", path.display()))?;
        for (id, prediction) in self.ids.iter().zip(&self.predictions) {
            writer
                .serialize(SubmissionRow {
                    id: id.clone(),
                    prediction: *prediction,
                })
                .with_context(|| format!("write {}", path.display()))?;
        }
        writer
            .flush()
            .with_context(|| format!("flush {}", path.display()))?;
        Ok(())
    }

    /// Reads and validates an existing submission file.
    pub fn read_csv(path: &Path) -> Result<Self> {
        let mut reader =
            csv::Reader::from_path(path).with_context(|| format!("open {}", path.display()))?;
        let headers = reader
            .headers()
            .with_context(|| format!("read header of {}", path.display()))?
            .clone();
        if headers.len() != 2 || &headers[1] != "prediction" {
            return Err(anyhow!(
                "{} must have two columns ending in 'prediction', found {:?}",
                path.display(),
                headers.iter().collect::<Vec<_>>()
            ));
        }

        let mut ids = Vec::new();
        let mut predictions = Vec::new();
        for (line, record) in reader.records().enumerate() {
            let record = record.with_context(|| format!("read {} row {}", path.display(), line))?;
            let id = record.get(0).unwrap_or_default().to_string();
            let prediction = record
                .get(1)
                .unwrap_or_default()
                .trim()
                .parse::<f64>()
                .with_context(|| format!("row {line} has a non-numeric prediction"))?;
            if !prediction.is_finite() {
                return Err(anyhow!("row {line} has a non-finite prediction"));
            }
            ids.push(id);
            predictions.push(prediction);
        }
        if ids.is_empty() {
            return Err(anyhow!("{} has no predictions", path.display()));
        }
        Self::new(ids, predictions)
    }
}
