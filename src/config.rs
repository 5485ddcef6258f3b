use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const DEFAULT_API_URL: &str = "https://api-tournament.numer.ai";
pub const DEFAULT_DATASET_VERSION: &str = "v4";
pub const DEFAULT_FEATURE_SET: &str = "small";
pub const CLASSIC_TOURNAMENT: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Validation,
    Live,
}

impl Split {
    pub const ALL: [Split; 3] = [Split::Train, Split::Validation, Split::Live];

    pub fn name(self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Validation => "validation",
            Split::Live => "live",
        }
    }

    pub fn file_name(self) -> String {
        format!("{}.parquet", self.name())
    }

    pub fn remote_name(self, version: &str) -> String {
        format!("{}/{}", version, self.file_name())
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub data_dir: PathBuf,
    pub dataset_version: String,
    pub features_path: PathBuf,
    pub feature_set: String,
    pub target_col: String,
    pub era_col: String,
    pub submission_path: PathBuf,
    pub api_url: String,
    pub tournament: u32,
    pub download: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            dataset_version: DEFAULT_DATASET_VERSION.to_string(),
            features_path: PathBuf::from("features.json"),
            feature_set: DEFAULT_FEATURE_SET.to_string(),
            target_col: "target".to_string(),
            era_col: "era".to_string(),
            submission_path: PathBuf::from("submission.csv"),
            api_url: DEFAULT_API_URL.to_string(),
            tournament: CLASSIC_TOURNAMENT,
            download: true,
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = Self::default();
        Self {
            data_dir: text("NUMERAI_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            dataset_version: text("NUMERAI_DATASET_VERSION").unwrap_or(defaults.dataset_version),
            features_path: text("NUMERAI_FEATURES_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.features_path),
            feature_set: text("NUMERAI_FEATURE_SET").unwrap_or(defaults.feature_set),
            target_col: defaults.target_col,
            era_col: defaults.era_col,
            submission_path: text("NUMERAI_SUBMISSION_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.submission_path),
            api_url: text("NUMERAI_API_URL").unwrap_or(defaults.api_url),
            tournament: parse_or(text("NUMERAI_TOURNAMENT"), defaults.tournament),
            download: defaults.download,
        }
    }

    pub fn split_path(&self, split: Split) -> PathBuf {
        self.data_dir.join(split.file_name())
    }

    /// Relative feature/submission paths live under the data directory.
    pub fn features_file(&self) -> PathBuf {
        resolve(&self.data_dir, &self.features_path)
    }

    pub fn submission_file(&self) -> PathBuf {
        resolve(&self.data_dir, &self.submission_path)
    }

    pub fn remote_features_name(&self) -> String {
        format!("{}/features.json", self.dataset_version)
    }
}

/// Loads `.env.local`, `.env`, then a `.env` next to the executable.
/// Variables already present in the process environment win.
pub fn load_dotenv() {
    let _ = dotenvy::from_filename(".env.local");
    let _ = dotenvy::from_filename(".env");
    if let Ok(exe) = std::env::current_exe()
        && let Some(dir) = exe.parent()
    {
        let _ = dotenvy::from_path(dir.join(".env"));
    }
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn parse_or<T: FromStr>(raw: Option<String>, default: T) -> T {
    raw.and_then(|v| v.parse::<T>().ok()).unwrap_or(default)
}
