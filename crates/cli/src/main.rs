use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Parser;

use posecoach_observability::LogFormat;
use posecoach_upload::{BatchOptions, FrameJob, HttpUploader, UploadManagerConfig, run_batch};

/// Score a set of pose frames against the scoring endpoint and print the
/// batch summary as JSON.
#[derive(Parser, Debug)]
#[command(name = "posecoach")]
#[command(version)]
struct Args {
    /// Scoring endpoint URL
    #[arg(long, env = "POSECOACH_ENDPOINT")]
    endpoint: String,

    /// Pose every frame is scored against
    #[arg(long = "pose", env = "POSECOACH_POSE_ID")]
    pose_id: String,

    /// Override `POSECOACH_MAX_CONCURRENT`
    #[arg(long)]
    concurrency: Option<usize>,

    /// Override the retry count of the configured strategy
    #[arg(long)]
    max_retries: Option<u32>,

    /// Fail the whole batch on the first failed frame
    #[arg(long)]
    fail_fast: bool,

    /// Log output format (json or pretty)
    #[arg(long, default_value = "json", env = "POSECOACH_LOG_FORMAT")]
    log_format: LogFormat,

    /// Frame images to score, in order
    frames: Vec<PathBuf>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    posecoach_observability::init_with(args.log_format);

    if args.frames.is_empty() {
        bail!("no frames given");
    }

    let config = UploadManagerConfig::from_env().context("invalid upload configuration")?;
    let mut options = BatchOptions::from_config(&config)
        .with_skip_failed_frames(!args.fail_fast)
        .on_progress(|p| {
            tracing::info!(completed = p.completed, total = p.total, percent = p.percent, "progress");
        });
    if let Some(concurrency) = args.concurrency {
        options = options.with_concurrency(concurrency);
    }
    if let Some(max_retries) = args.max_retries {
        options = options.with_max_retries(max_retries);
    }

    tracing::info!(endpoint = %args.endpoint, pose_id = %args.pose_id, frames = args.frames.len(), "scoring frames");

    let jobs = FrameJob::for_paths(args.frames, &args.pose_id);
    let summary = run_batch(HttpUploader::new(args.endpoint), jobs, options)
        .await
        .context("batch failed")?;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
