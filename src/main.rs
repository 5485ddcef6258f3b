use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tracing::{error, info};

use numerai_pipeline::config::{self, PipelineConfig, Split};
use numerai_pipeline::credentials::{Credentials, SubmissionCredentials};
use numerai_pipeline::gbdt::GbdtParams;
use numerai_pipeline::linear::SgdParams;
use numerai_pipeline::logging;
use numerai_pipeline::model_artifact::{self, ModelArtifact, TrainedModel};
use numerai_pipeline::numerai_api::NumerApi;
use numerai_pipeline::pipeline::{self, DEFAULT_EPOCHS, UploadMode, UploadOutcome};

#[derive(Parser)]
#[command(name = "numerai_pipeline", version)]
#[command(about = "Train a tournament model, predict the live round and upload it", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Directory holding the parquet splits
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Feature file (relative paths resolve under the data directory)
    #[arg(long, global = true)]
    features: Option<PathBuf>,

    /// Feature set to train on
    #[arg(long, global = true)]
    feature_set: Option<String>,

    /// Submission CSV to write
    #[arg(long, global = true)]
    submission: Option<PathBuf>,

    /// Never download; fail if a split is missing locally
    #[arg(long, global = true)]
    no_download: bool,

    /// Debug logging for this crate (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Fixed-iteration gradient boosted trees on the full train split
    Boost(BoostArgs),
    /// Linear model updated era by era over several epochs
    Incremental(IncrementalArgs),
    /// Predict the live split with a saved model
    Predict(PredictArgs),
    /// Show which credentials are set and list the account's models
    CheckAuth,
    /// Upload an existing submission file
    Submit,
}

#[derive(Args)]
struct OutputArgs {
    /// Write the submission but do not upload it
    #[arg(long)]
    no_upload: bool,

    /// Also save the trained model as JSON
    #[arg(long)]
    save_model: Option<PathBuf>,
}

#[derive(Args)]
struct BoostArgs {
    #[arg(long, default_value_t = 100)]
    n_estimators: usize,

    #[arg(long, default_value_t = 0.05)]
    learning_rate: f64,

    #[arg(long, default_value_t = 31)]
    num_leaves: usize,

    #[command(flatten)]
    output: OutputArgs,
}

#[derive(Args)]
struct IncrementalArgs {
    #[arg(long, default_value_t = DEFAULT_EPOCHS)]
    epochs: usize,

    #[command(flatten)]
    output: OutputArgs,
}

#[derive(Args)]
struct PredictArgs {
    /// Model artifact written by --save-model
    #[arg(long)]
    model: PathBuf,

    #[arg(long)]
    no_upload: bool,
}

fn main() -> ExitCode {
    config::load_dotenv();
    let cli = Cli::parse();
    logging::init_logging(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let cfg = build_config(&cli);
    let creds = Credentials::from_env();
    match cli.command {
        Command::Boost(args) => run_boost(&cfg, &creds, args),
        Command::Incremental(args) => run_incremental(&cfg, &creds, args),
        Command::Predict(args) => run_predict(&cfg, &creds, args),
        Command::CheckAuth => run_check_auth(&cfg, &creds),
        Command::Submit => run_submit(&cfg, &creds),
    }
}

fn build_config(cli: &Cli) -> PipelineConfig {
    let mut cfg = PipelineConfig::from_env();
    if let Some(dir) = &cli.data_dir {
        cfg.data_dir = dir.clone();
    }
    if let Some(path) = &cli.features {
        cfg.features_path = path.clone();
    }
    if let Some(set) = &cli.feature_set {
        cfg.feature_set = set.clone();
    }
    if let Some(path) = &cli.submission {
        cfg.submission_path = path.clone();
    }
    if cli.no_download {
        cfg.download = false;
    }
    cfg
}

fn api_for(cfg: &PipelineConfig, creds: &Credentials) -> Result<NumerApi> {
    Ok(NumerApi::new(creds.api_key())?
        .with_url(cfg.api_url.clone())
        .with_tournament(cfg.tournament))
}

fn run_boost(cfg: &PipelineConfig, creds: &Credentials, args: BoostArgs) -> Result<()> {
    let target = pipeline::upload_target(creds, args.output.no_upload)?;
    let api = api_for(cfg, creds)?;
    pipeline::prepare_data(&api, cfg, &Split::ALL)?;
    pipeline::ensure_feature_file(&api, cfg)?;
    let features = pipeline::load_features(cfg)?;

    let params = GbdtParams {
        n_estimators: args.n_estimators,
        learning_rate: args.learning_rate,
        num_leaves: args.num_leaves,
        ..GbdtParams::default()
    };
    let fit = pipeline::train_boosted(cfg, &features, params)?;
    let model = TrainedModel::Gbdt(fit.model);
    save_if_requested(cfg, &features, &model, args.output.save_model.as_ref())?;
    finish(cfg, &api, &features, &model, target, UploadMode::Required)
}

fn run_incremental(cfg: &PipelineConfig, creds: &Credentials, args: IncrementalArgs) -> Result<()> {
    let target = pipeline::upload_target(creds, args.output.no_upload)?;
    let api = api_for(cfg, creds)?;
    pipeline::prepare_data(&api, cfg, &[Split::Train, Split::Live])?;
    pipeline::ensure_feature_file(&api, cfg)?;
    let features = pipeline::load_features(cfg)?;

    let fit = pipeline::train_incremental(cfg, &features, SgdParams::default(), args.epochs)?;
    info!(rows = fit.train_rows, eras = fit.eras, "incremental training done");
    let model = TrainedModel::Linear {
        scaler: fit.scaler,
        model: fit.model,
    };
    save_if_requested(cfg, &features, &model, args.output.save_model.as_ref())?;
    finish(cfg, &api, &features, &model, target, UploadMode::BestEffort)
}

fn run_predict(cfg: &PipelineConfig, creds: &Credentials, args: PredictArgs) -> Result<()> {
    let target = pipeline::upload_target(creds, args.no_upload)?;
    let artifact = model_artifact::load_artifact(&args.model)?;
    info!(
        kind = artifact.model.label(),
        features = artifact.features.len(),
        trained_at = %artifact.generated_at,
        "model loaded"
    );
    let api = api_for(cfg, creds)?;
    pipeline::prepare_data(&api, cfg, &[Split::Live])?;
    finish(
        cfg,
        &api,
        &artifact.features,
        &artifact.model,
        target,
        UploadMode::BestEffort,
    )
}

fn run_check_auth(cfg: &PipelineConfig, creds: &Credentials) -> Result<()> {
    let presence = creds.presence();
    println!("PUBLIC_ID : {}", creds.public_id().unwrap_or("<unset>"));
    println!(
        "SECRET_KEY: {}",
        if presence.secret_key { "[hidden]" } else { "<unset>" }
    );
    println!("MODEL_ID  : {}", creds.model_id().unwrap_or("<unset>"));

    let models = api_for(cfg, creds)?.get_models()?;
    println!("Connection OK. Models available: {}", models.len());
    for (name, id) in &models {
        println!("  {name}: {id}");
    }
    Ok(())
}

fn run_submit(cfg: &PipelineConfig, creds: &Credentials) -> Result<()> {
    let presence = creds.presence();
    info!(
        public_id = presence.public_id,
        secret_key = presence.secret_key,
        model_id = presence.model_id,
        "credentials found"
    );
    let target = creds.require_all()?;
    let api = api_for(cfg, creds)?;
    pipeline::submit_existing(cfg, &api, &target)?;
    Ok(())
}

fn save_if_requested(
    cfg: &PipelineConfig,
    features: &[String],
    model: &TrainedModel,
    path: Option<&PathBuf>,
) -> Result<()> {
    let Some(path) = path else {
        return Ok(());
    };
    let artifact = ModelArtifact::new(&cfg.feature_set, features.to_vec(), model.clone());
    model_artifact::save_artifact(path, &artifact)?;
    info!(path = %path.display(), kind = model.label(), "model saved");
    Ok(())
}

fn finish(
    cfg: &PipelineConfig,
    api: &NumerApi,
    features: &[String],
    model: &TrainedModel,
    target: Option<SubmissionCredentials>,
    mode: UploadMode,
) -> Result<()> {
    let outcome = pipeline::finish_submission(cfg, api, features, model, target.as_ref(), mode)?;
    match outcome {
        UploadOutcome::Uploaded(id) => info!(submission_id = %id, "done"),
        UploadOutcome::Failed(_) => info!("done; submission kept locally"),
        UploadOutcome::Skipped => info!("done"),
    }
    Ok(())
}
