use std::path::PathBuf;
use std::process::ExitCode;

use burn::{backend::Autodiff, optim::SgdConfig, tensor::backend::Backend};
use clap::{Parser, Subcommand, ValueEnum};
use log::{error, info};

use orl_faces::{
    dataset::{OrlFacesDataset, Partition, DEFAULT_SEED},
    model::{MlpConfig, SoftmaxRegressionConfig},
    training::{train, TrainingConfig, TrainingReport},
    Result,
};

#[cfg(feature = "wgpu")]
type MyBackend = burn::backend::Wgpu;

#[cfg(all(feature = "tch-cpu", not(feature = "wgpu")))]
type MyBackend = burn::backend::LibTorch;

#[cfg(all(
    feature = "ndarray",
    not(any(feature = "wgpu", feature = "tch-cpu"))
))]
type MyBackend = burn::backend::NdArray;

type MyAutodiffBackend = Autodiff<MyBackend>;

#[derive(Parser, Debug)]
#[command(author, version, about = "ORL Faces dataset tools", long_about = None)]
struct Cli {
    /// Root directory of the dataset.
    #[arg(short, long, global = true, default_value = "data")]
    root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Extract the raw archive if needed and build the partition caches.
    Prepare {
        /// Seed of the train/test partitioning.
        #[arg(long, default_value_t = DEFAULT_SEED)]
        seed: u64,
    },
    /// Train a classifier on the training partition and validate it on the test partition.
    Train {
        #[arg(long, value_enum, default_value_t = ModelKind::Softmax)]
        model: ModelKind,
        #[arg(long, default_value_t = 100)]
        epochs: usize,
        #[arg(long, default_value_t = 32)]
        batch_size: usize,
        #[arg(long = "lr", default_value_t = 0.01)]
        learning_rate: f64,
        /// Seed of the training run (shuffling and initialization).
        #[arg(long, default_value_t = 42)]
        seed: u64,
        #[arg(long, default_value = "artifacts")]
        artifact_dir: PathBuf,
        /// Log every training epoch.
        #[arg(short, long)]
        verbose: bool,
    },
    /// Write one cached image as a binary greymap.
    Export {
        /// `train` or `test`.
        #[arg(long, default_value = "train")]
        partition: String,
        #[arg(long)]
        index: usize,
        #[arg(long)]
        output: PathBuf,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum ModelKind {
    Softmax,
    Mlp,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Prepare { seed } => {
            let train_set = OrlFacesDataset::loader(&cli.root)
                .download(true)
                .seed(seed)
                .load()?;
            let test_set = OrlFacesDataset::loader(&cli.root)
                .partition(Partition::Test)
                .load()?;

            info!("{train_set}");
            info!("{test_set}");
        }
        Command::Train {
            model,
            epochs,
            batch_size,
            learning_rate,
            seed,
            artifact_dir,
            verbose,
        } => {
            let config = TrainingConfig::new(SgdConfig::new())
                .with_num_epochs(epochs)
                .with_batch_size(batch_size)
                .with_learning_rate(learning_rate)
                .with_seed(seed)
                .with_verbose(verbose);

            let train_set = OrlFacesDataset::new(&cli.root, Partition::Train, true)?;
            let test_set = OrlFacesDataset::test(&cli.root)?;
            let device = <MyAutodiffBackend as Backend>::Device::default();

            let report = match model {
                ModelKind::Softmax => {
                    let model = SoftmaxRegressionConfig::new().init::<MyAutodiffBackend>(&device);
                    train::<MyAutodiffBackend, _, _, _>(
                        model,
                        &config,
                        train_set,
                        test_set,
                        &artifact_dir,
                        &device,
                    )?
                    .1
                }
                ModelKind::Mlp => {
                    let model = MlpConfig::new().init::<MyAutodiffBackend>(&device);
                    train::<MyAutodiffBackend, _, _, _>(
                        model,
                        &config,
                        train_set,
                        test_set,
                        &artifact_dir,
                        &device,
                    )?
                    .1
                }
            };
            log_report(&report);
        }
        Command::Export {
            partition,
            index,
            output,
        } => {
            let dataset = OrlFacesDataset::loader(&cli.root)
                .split(&partition)?
                .load()?;
            let item = dataset.get(index)?;

            let subject = OrlFacesDataset::subject_of(item.label)?;

            std::fs::write(&output, item.image.to_pgm())?;
            info!(
                "Wrote image {index} of subject {} to `{}`",
                subject,
                output.display()
            );
        }
    }

    Ok(())
}

fn log_report(report: &TrainingReport) {
    match (report.best_valid_accuracy, report.best_epoch) {
        (Some(accuracy), Some(epoch)) => info!(
            "Best test accuracy {:.2}% at epoch {epoch}, checkpoint `{}`",
            accuracy * 100.0,
            report.checkpoint.display()
        ),
        _ => info!("No validation ran, no checkpoint was saved"),
    }
    info!(
        "Last epoch: loss {:.4} | accuracy {:.2}%",
        report.train_loss,
        report.train_accuracy * 100.0
    );
}
