use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result, anyhow};
use tracing::{info, warn};

use crate::config::{PipelineConfig, Split};
use crate::credentials::{Credentials, SubmissionCredentials};
use crate::dataset::{self, Frame, group_by_era};
use crate::error::PipelineError;
use crate::evaluation::{self, ValidationMetrics};
use crate::features;
use crate::gbdt::{GbdtParams, GbdtRegressor};
use crate::linear::{SgdParams, SgdRegressor, StandardScaler, zscore};
use crate::model_artifact::TrainedModel;
use crate::numerai_api::NumerApi;
use crate::submission::{self, IdSource, Submission};

pub const DEFAULT_EPOCHS: usize = 3;
pub const MISSING_FEATURE_FILL: f64 = 0.0;

#[derive(Debug, Clone)]
pub struct BoostedFit {
    pub model: GbdtRegressor,
    pub train_rows: usize,
    pub validation: Option<ValidationMetrics>,
}

#[derive(Debug, Clone)]
pub struct IncrementalFit {
    pub scaler: StandardScaler,
    pub model: SgdRegressor,
    pub train_rows: usize,
    pub eras: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Uploaded(String),
    Failed(String),
    Skipped,
}

/// How a failed upload affects the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadMode {
    /// The error ends the run.
    Required,
    /// The error is logged and the written CSV is kept.
    BestEffort,
}

/// Downloads every split in `splits` that is not on disk yet.
pub fn prepare_data(api: &NumerApi, cfg: &PipelineConfig, splits: &[Split]) -> Result<()> {
    if !cfg.download {
        return Ok(());
    }
    for split in splits {
        let local = cfg.split_path(*split);
        if local.exists() {
            continue;
        }
        let remote = split.remote_name(&cfg.dataset_version);
        info!(remote = %remote, local = %local.display(), "downloading dataset");
        api.download_dataset(&remote, &local)?;
    }
    Ok(())
}

pub fn ensure_feature_file(api: &NumerApi, cfg: &PipelineConfig) -> Result<()> {
    let features_file = cfg.features_file();
    if !cfg.download || features_file.exists() {
        return Ok(());
    }
    let remote = cfg.remote_features_name();
    info!(remote = %remote, local = %features_file.display(), "downloading feature file");
    api.download_dataset(&remote, &features_file)?;
    Ok(())
}

pub fn load_features(cfg: &PipelineConfig) -> Result<Vec<String>> {
    let features = features::load_feature_set(&cfg.features_file(), &cfg.feature_set)?;
    info!(count = features.len(), set = %cfg.feature_set, "using feature set");
    Ok(features)
}

pub fn train_boosted(
    cfg: &PipelineConfig,
    features: &[String],
    params: GbdtParams,
) -> Result<BoostedFit> {
    let train_path = cfg.split_path(Split::Train);
    let mut wanted = features.to_vec();
    wanted.push(cfg.target_col.clone());
    info!(path = %train_path.display(), "loading train");
    let train = load_required(&train_path, &wanted)?;
    let (train, dropped) = drop_missing_targets(train, &cfg.target_col)?;
    if dropped > 0 {
        warn!(dropped, "rows without a finite target dropped from train");
    }
    let score_validation = validation_is_scorable(cfg, features)?;

    let x = train.feature_matrix(features)?;
    let y = train.numeric(&cfg.target_col)?;
    info!(
        rows = x.rows(),
        iterations = params.n_estimators,
        "fitting gradient boosted trees"
    );
    let started = Instant::now();
    let model = GbdtRegressor::fit(params, &x, y)?;
    info!(elapsed_secs = started.elapsed().as_secs_f64(), "training finished");
    log_top_features(&model, features);

    let validation = if score_validation {
        evaluate_validation(cfg, features, &TrainedModel::Gbdt(model.clone()))?
    } else {
        None
    };
    Ok(BoostedFit {
        model,
        train_rows: x.rows(),
        validation,
    })
}

pub fn train_incremental(
    cfg: &PipelineConfig,
    features: &[String],
    params: SgdParams,
    epochs: usize,
) -> Result<IncrementalFit> {
    let train_path = cfg.split_path(Split::Train);
    let mut wanted = features.to_vec();
    wanted.push(cfg.era_col.clone());
    wanted.push(cfg.target_col.clone());
    info!(path = %train_path.display(), "loading train");
    let train = load_required(&train_path, &wanted)?;
    let (train, dropped) = drop_missing_targets(train, &cfg.target_col)?;
    if dropped > 0 {
        warn!(dropped, "rows without a finite target dropped from train");
    }
    if train.is_empty() {
        return Err(anyhow!(PipelineError::EmptyTrainingSet));
    }

    let x = train.feature_matrix(features)?;
    let y = train.numeric(&cfg.target_col)?;
    let era_labels = train
        .labels(&cfg.era_col)
        .ok_or_else(|| anyhow!("era column '{}' not loaded", cfg.era_col))?;
    let eras = group_by_era(&era_labels);
    info!(eras = eras.len(), "eras detected");

    // Era blocks are sliced once; every epoch walks them in the same order.
    let blocks = eras
        .iter()
        .map(|(_, rows)| {
            let bx = x.select_rows(rows);
            let by: Vec<f64> = rows.iter().map(|&r| y[r]).collect();
            (bx, by)
        })
        .collect::<Vec<_>>();

    let mut scaler = StandardScaler::new();
    let mut model = SgdRegressor::new(params);
    let started = Instant::now();
    for epoch in 1..=epochs {
        info!(epoch, epochs, "epoch started");
        for ((era, _), (bx, by)) in eras.iter().zip(&blocks) {
            scaler
                .partial_fit(bx)
                .with_context(|| format!("scaler update on era {era}"))?;
            let xs = scaler.transform(bx)?;
            model
                .partial_fit(&xs, &zscore(by))
                .with_context(|| format!("model update on era {era}"))?;
        }
        info!(
            epoch,
            elapsed_secs = started.elapsed().as_secs_f64(),
            "epoch finished"
        );
    }

    Ok(IncrementalFit {
        scaler,
        model,
        train_rows: x.rows(),
        eras: eras.len(),
    })
}

/// Scores `model` on the validation split when that file is present.
pub fn evaluate_validation(
    cfg: &PipelineConfig,
    features: &[String],
    model: &TrainedModel,
) -> Result<Option<ValidationMetrics>> {
    let path = cfg.split_path(Split::Validation);
    if !path.exists() {
        return Ok(None);
    }
    let mut wanted = features.to_vec();
    wanted.push(cfg.target_col.clone());
    wanted.push(cfg.era_col.clone());
    info!(path = %path.display(), "loading validation");
    let frame = dataset::read_parquet(&path, Some(&wanted))?;
    let missing = missing_validation_columns(cfg, features, frame.column_names());
    if !missing.is_empty() {
        warn!(columns = ?missing, "validation lacks required columns; not scored");
        return Ok(None);
    }
    let (frame, _) = drop_missing_targets(frame, &cfg.target_col)?;
    if frame.is_empty() {
        return Ok(None);
    }

    let preds = model.predict(&frame.feature_matrix(features)?)?;
    let targets = frame.numeric(&cfg.target_col)?;
    let eras = frame
        .labels(&cfg.era_col)
        .unwrap_or_else(|| vec![String::from("all"); frame.len()]);
    let metrics = evaluation::evaluate_by_era(&preds, targets, &eras);
    info!(
        eras = metrics.eras,
        mean_corr = metrics.mean_corr,
        sharpe = metrics.sharpe,
        overall_corr = metrics.overall_corr,
        "validation scored"
    );
    Ok(Some(metrics))
}

pub fn predict_live(
    cfg: &PipelineConfig,
    features: &[String],
    model: &TrainedModel,
) -> Result<Submission> {
    let path = cfg.split_path(Split::Live);
    info!(path = %path.display(), "loading live");
    let mut wanted = features.to_vec();
    wanted.extend(submission::ID_COLUMNS.iter().map(|s| s.to_string()));
    let mut live = dataset::read_parquet(&path, Some(&wanted))?;

    let filled = live.fill_missing(features, MISSING_FEATURE_FILL)?;
    if !filled.is_empty() {
        warn!(
            count = filled.len(),
            columns = ?filled,
            "live is missing features; filled with {MISSING_FEATURE_FILL}"
        );
    }

    let (ids, source) = submission::resolve_ids(&live);
    if source == IdSource::RowPosition {
        warn!("live has neither 'id' nor 'row_id'; using row position");
    }

    let preds = model.predict(&live.feature_matrix(features)?)?;
    Submission::new(ids, preds)
}

pub fn write_submission(cfg: &PipelineConfig, submission: &Submission) -> Result<PathBuf> {
    let path = cfg.submission_file();
    submission.write_csv(&path)?;
    info!(path = %path.display(), rows = submission.len(), "submission written");
    Ok(path)
}

pub fn upload(api: &NumerApi, path: &Path, model_id: &str) -> Result<String> {
    info!(path = %path.display(), "uploading predictions");
    let id = api
        .upload_predictions(path, model_id)
        .with_context(|| format!("upload {}", path.display()))?;
    info!(submission_id = %id, "predictions uploaded");
    Ok(id)
}

/// Upload that reports failure instead of propagating it.
pub fn upload_best_effort(api: &NumerApi, path: &Path, model_id: &str) -> UploadOutcome {
    match upload(api, path, model_id) {
        Ok(id) => UploadOutcome::Uploaded(id),
        Err(err) => {
            warn!(error = %format!("{err:#}"), "upload failed");
            UploadOutcome::Failed(format!("{err:#}"))
        }
    }
}

/// Credentials are checked before any training starts when an upload will follow.
pub fn upload_target(
    creds: &Credentials,
    no_upload: bool,
) -> Result<Option<SubmissionCredentials>> {
    if no_upload {
        return Ok(None);
    }
    Ok(Some(creds.require_all()?))
}

/// Predicts live, writes the CSV and uploads it to `target` when one is given.
pub fn finish_submission(
    cfg: &PipelineConfig,
    api: &NumerApi,
    features: &[String],
    model: &TrainedModel,
    target: Option<&SubmissionCredentials>,
    mode: UploadMode,
) -> Result<UploadOutcome> {
    let submission = predict_live(cfg, features, model)?;
    let path = write_submission(cfg, &submission)?;

    let Some(target) = target else {
        info!(path = %path.display(), "upload skipped");
        return Ok(UploadOutcome::Skipped);
    };
    match mode {
        UploadMode::Required => Ok(UploadOutcome::Uploaded(upload(
            api,
            &path,
            &target.model_id,
        )?)),
        UploadMode::BestEffort => Ok(upload_best_effort(api, &path, &target.model_id)),
    }
}

/// Validates the submission file already on disk and uploads it.
pub fn submit_existing(
    cfg: &PipelineConfig,
    api: &NumerApi,
    target: &SubmissionCredentials,
) -> Result<String> {
    let path = cfg.submission_file();
    let submission = Submission::read_csv(&path)?;
    info!(path = %path.display(), rows = submission.len(), "submission validated");
    upload(api, &path, &target.model_id)
}

/// Checks the validation footer so a bad file is reported before training.
fn validation_is_scorable(cfg: &PipelineConfig, features: &[String]) -> Result<bool> {
    let path = cfg.split_path(Split::Validation);
    if !path.exists() {
        return Ok(false);
    }
    let columns = dataset::parquet_columns(&path)?;
    let missing = missing_validation_columns(cfg, features, &columns);
    if missing.is_empty() {
        return Ok(true);
    }
    warn!(
        path = %path.display(),
        columns = ?missing,
        "validation lacks required columns; it will not be scored"
    );
    Ok(false)
}

fn missing_validation_columns(
    cfg: &PipelineConfig,
    features: &[String],
    present: &[String],
) -> Vec<String> {
    features
        .iter()
        .chain(std::iter::once(&cfg.target_col))
        .filter(|name| !present.contains(*name))
        .cloned()
        .collect()
}

fn load_required(path: &Path, columns: &[String]) -> Result<Frame> {
    let frame = dataset::read_parquet(path, Some(columns))?;
    frame.require_columns(columns, path)?;
    Ok(frame)
}

fn drop_missing_targets(frame: Frame, target_col: &str) -> Result<(Frame, usize)> {
    let keep: Vec<usize> = frame
        .numeric(target_col)?
        .iter()
        .enumerate()
        .filter(|(_, v)| v.is_finite())
        .map(|(i, _)| i)
        .collect();
    let dropped = frame.len() - keep.len();
    if dropped == 0 {
        return Ok((frame, 0));
    }
    Ok((frame.take_rows(&keep), dropped))
}

fn log_top_features(model: &GbdtRegressor, features: &[String]) {
    let mut ranked: Vec<(&String, f64)> = features
        .iter()
        .zip(model.feature_importance())
        .collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    for (name, gain) in ranked.into_iter().take(5).filter(|(_, g)| *g > 0.0) {
        info!(feature = %name, gain, "top feature");
    }
}
