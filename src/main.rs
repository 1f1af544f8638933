use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use medscan_lib::dataset::{ImageDataset, SplitKind};
use medscan_lib::model::AppConfig;
use medscan_lib::pipeline::{score_range, BinaryInference, BinaryTraining};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "medscan")]
#[command(about = "Breast-scan HOG/SVM and blood-cell CNN classification pipelines")]
struct Args {
    /// Configuration file (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Train the binary pipeline and persist the reducer and classifier
    TrainBinary {
        /// Dataset root containing train/<label>/ directories
        #[arg(long)]
        data: Option<PathBuf>,
    },
    /// Score persisted binary state on test images [min, max)
    InferBinary {
        #[arg(long)]
        data: Option<PathBuf>,
        #[arg(long, default_value_t = 0)]
        min: usize,
        #[arg(long)]
        max: usize,
    },
    /// Train the multi-class network and persist its weights
    TrainMulti {
        #[arg(long)]
        data: Option<PathBuf>,
    },
    /// Score the persisted network on test images [min, max)
    InferMulti {
        #[arg(long)]
        data: Option<PathBuf>,
        #[arg(long, default_value_t = 0)]
        min: usize,
        #[arg(long)]
        max: usize,
    },
    /// Print the effective configuration
    ShowConfig,
}

fn print_range_result(score: &medscan_lib::pipeline::RangeScore) {
    match score.accuracy_percent() {
        Some(accuracy) => println!(
            "Accuracy: {:.2}% ({} / {})",
            accuracy, score.correct, score.processed
        ),
        None => println!("No samples in the requested range"),
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_target(false)
        .init();

    let config = AppConfig::load_or_default(args.config.as_deref())?;

    match args.command {
        Command::TrainBinary { data } => {
            let root = data.unwrap_or_else(|| config.datasets.binary_root.clone());
            let dataset = ImageDataset::from_directory(&root, SplitKind::Train)
                .with_context(|| format!("failed to load training images from {}", root.display()))?;

            let outcome = BinaryTraining::new(dataset, config.features.clone(), config.binary.clone()).run()?;
            println!("{}", outcome.report);
            println!("Accuracy: {:.2}%", outcome.report.report.accuracy * 100.0);
            outcome.save(&config.artifacts)?;
        }
        Command::InferBinary { data, min, max } => {
            let inference = BinaryInference::load(&config.artifacts)?;
            let root = data.unwrap_or_else(|| config.datasets.binary_root.clone());
            let dataset = ImageDataset::from_directory(&root, SplitKind::Test)
                .with_context(|| format!("failed to load test images from {}", root.display()))?;
            let score = score_range(&inference, &dataset, min, max)?;
            print_range_result(&score);
        }
        #[cfg(feature = "ml")]
        Command::TrainMulti { data } => {
            let root = data.unwrap_or_else(|| config.datasets.multiclass_root.clone());
            let dataset = ImageDataset::from_directory(&root, SplitKind::Train)
                .with_context(|| format!("failed to load training images from {}", root.display()))?;
            let test_set = ImageDataset::from_directory_if_present(&root, SplitKind::Test)
                .with_context(|| format!("failed to load test images from {}", root.display()))?;

            let accuracy = medscan_lib::ml::train_network(
                &config.training,
                config.device_type,
                &dataset,
                &config.artifacts.network,
                test_set.as_ref(),
            )?;
            println!("Validation accuracy: {:.2}%", accuracy * 100.0);
        }
        #[cfg(feature = "ml")]
        Command::InferMulti { data, min, max } => {
            let predictor = medscan_lib::ml::load_predictor(config.device_type, &config.artifacts.network)?;
            let root = data.unwrap_or_else(|| config.datasets.multiclass_root.clone());
            let dataset = ImageDataset::from_directory(&root, SplitKind::Test)
                .with_context(|| format!("failed to load test images from {}", root.display()))?;
            let score = score_range(predictor.as_ref(), &dataset, min, max)?;
            print_range_result(&score);
        }
        #[cfg(not(feature = "ml"))]
        Command::TrainMulti { .. } | Command::InferMulti { .. } => {
            anyhow::bail!("this build does not include the `ml` feature");
        }
        Command::ShowConfig => config.display(),
    }

    Ok(())
}
