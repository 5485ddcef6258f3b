use std::path::PathBuf;

use thiserror::Error;

/// Failures callers may want to tell apart. Everything else travels as a
/// plain `anyhow::Error` with context attached.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("missing credentials: define {} in the environment or .env", .0.join(", "))]
    MissingCredentials(Vec<&'static str>),

    #[error("feature set '{set}' not found or empty in {}", .path.display())]
    FeatureSetMissing { set: String, path: PathBuf },

    #[error("column '{column}' not found in {}", .path.display())]
    MissingColumn { column: String, path: PathBuf },

    #[error("column '{0}' is not numeric")]
    NotNumeric(String),

    #[error("input contains non-finite values in column {0}")]
    NonFinite(usize),

    #[error("shape mismatch: {0}")]
    Shape(String),

    #[error("training set is empty")]
    EmptyTrainingSet,

    #[error("api error: {0}")]
    Api(String),
}
