use std::path::PathBuf;

use clap::Parser;
use log::info;
use segtrain::{ConfigOverride, Trainer, TrainingConfig, TrainingError};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    if let Err(err) = run() {
        eprintln!("training failed: {err}");
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Segmentation training CLI", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "PATH", help = "Path to training config file")]
    config: PathBuf,

    #[arg(
        long = "override",
        value_name = "KEY=VALUE",
        help = "Override configuration value using dot-separated paths"
    )]
    overrides: Vec<ConfigOverride>,

    #[arg(
        long,
        conflicts_with = "allow_missing_keys",
        help = "Resume from the latest checkpoint in the model directory"
    )]
    continue_training: bool,

    #[arg(long, help = "Tolerate parameter name mismatches when loading a checkpoint")]
    allow_missing_keys: bool,

    #[arg(long, value_name = "PATH", help = "Checkpoint directory to initialize from")]
    checkpoint: Option<PathBuf>,

    #[arg(long, help = "Clear a non-empty model directory before training")]
    overwrite_output: bool,
}

fn run() -> Result<(), TrainingError> {
    let args = Args::parse();

    let mut config = TrainingConfig::from_path(&args.config)?.with_overrides(&args.overrides)?;
    let checkpoint = &mut config.checkpoint;
    checkpoint.continue_training |= args.continue_training;
    checkpoint.allow_missing_keys |= args.allow_missing_keys;
    checkpoint.overwrite_output |= args.overwrite_output;
    if let Some(path) = args.checkpoint {
        checkpoint.path = Some(path);
    }
    config.validate()?;

    let command = std::env::args().collect::<Vec<_>>().join(" ");
    let mut trainer = Trainer::builder(config).command(command).build()?;
    let summary = trainer.run()?;

    if let Some((epoch, metrics)) = summary.validation.last() {
        info!(
            "finished at epoch {epoch}: mean_iou={:.4} pixel_accuracy={:.4}",
            metrics.get("mean_iou").unwrap_or_default(),
            metrics.get("pixel_accuracy").unwrap_or_default()
        );
    }
    Ok(())
}
