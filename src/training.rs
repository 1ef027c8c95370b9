use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use burn::{
    data::{dataloader::DataLoaderBuilder, dataset::Dataset},
    module::AutodiffModule,
    optim::{GradientsParams, Optimizer, SgdConfig},
    prelude::*,
    record::CompactRecorder,
    tensor::{backend::AutodiffBackend, ElementConversion},
};
use log::{debug, info};

use crate::data::OrlFacesBatcher;
use crate::dataset::OrlFacesItem;
use crate::error::OrlFacesError;
use crate::model::FaceClassifier;

#[derive(Config)]
pub struct TrainingConfig {
    pub optimizer: SgdConfig,
    #[config(default = 100)]
    pub num_epochs: usize,
    #[config(default = 32)]
    pub batch_size: usize,
    #[config(default = 1)]
    pub num_workers: usize,
    #[config(default = 42)]
    pub seed: u64,
    #[config(default = 0.01)]
    pub learning_rate: f64,
    /// Number of epochs between two validations.
    #[config(default = 10)]
    pub validate_every: usize,
    /// Log the training loss and accuracy of every epoch at info level.
    #[config(default = false)]
    pub verbose: bool,
}

/// Outcome of a training run.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingReport {
    /// Best validation accuracy, in `[0, 1]`.
    pub best_valid_accuracy: Option<f64>,
    /// Epoch of the best validation accuracy, starting at 1.
    pub best_epoch: Option<usize>,
    /// Mean training loss per sample of the last epoch.
    pub train_loss: f64,
    /// Training accuracy of the last epoch.
    pub train_accuracy: f64,
    /// Path of the best checkpoint, without the recorder extension.
    pub checkpoint: PathBuf,
}

/// Path of the checkpoint of a model, without the recorder extension.
pub fn checkpoint_path(artifact_dir: &Path, model_name: &str) -> PathBuf {
    artifact_dir.join("checkpoints").join(model_name)
}

/// Trains a classifier on the training partition, validating it on the test partition every
/// `validate_every` epochs and saving the model each time the validation accuracy improves.
pub fn train<B, M, D, V>(
    model: M,
    config: &TrainingConfig,
    train_set: D,
    valid_set: V,
    artifact_dir: &Path,
    device: &B::Device,
) -> crate::error::Result<(M, TrainingReport)>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + FaceClassifier<B>,
    M::InnerModule: FaceClassifier<B::InnerBackend>,
    D: Dataset<OrlFacesItem> + 'static,
    V: Dataset<OrlFacesItem> + 'static,
{
    let checkpoint = checkpoint_path(artifact_dir, model.name());
    fs::create_dir_all(artifact_dir.join("checkpoints"))?;
    config.save(artifact_dir.join("config.json"))?;

    B::seed(config.seed);

    let dataloader_train = DataLoaderBuilder::new(OrlFacesBatcher::<B>::new())
        .batch_size(config.batch_size)
        .shuffle(config.seed)
        .num_workers(config.num_workers)
        .build(train_set);

    let dataloader_valid = DataLoaderBuilder::new(OrlFacesBatcher::<B::InnerBackend>::new())
        .batch_size(config.batch_size)
        .num_workers(config.num_workers)
        .build(valid_set);

    info!("Training {} on {device:?}", model.name());
    let now = Instant::now();

    let mut model = model;
    let mut optim = config.optimizer.init();
    let mut report = TrainingReport {
        best_valid_accuracy: None,
        best_epoch: None,
        train_loss: 0.0,
        train_accuracy: 0.0,
        checkpoint,
    };

    for epoch in 1..=config.num_epochs {
        let mut num_samples = 0;
        let mut num_corrects = 0;
        let mut running_loss = 0.0;

        for batch in dataloader_train.iter() {
            let output = model.forward_classification(batch.images, batch.targets);
            let batch_size = output.targets.dims()[0];

            num_samples += batch_size;
            num_corrects += count_corrects(output.output.clone(), output.targets.clone());
            running_loss += output.loss.clone().into_scalar().elem::<f64>() * batch_size as f64;

            let grads = output.loss.backward();
            let grads = GradientsParams::from_grads(grads, &model);
            model = optim.step(config.learning_rate, model, grads);
        }

        report.train_loss = running_loss / num_samples.max(1) as f64;
        report.train_accuracy = num_corrects as f64 / num_samples.max(1) as f64;
        if config.verbose {
            info!(
                "[Train - Epoch {epoch}] Loss {:.4} | Accuracy {:.3}",
                report.train_loss, report.train_accuracy
            );
        } else {
            debug!(
                "[Train - Epoch {epoch}] Loss {:.4} | Accuracy {:.3}",
                report.train_loss, report.train_accuracy
            );
        }

        if config.validate_every == 0 || epoch % config.validate_every != 0 {
            continue;
        }

        let model_valid = model.valid();
        let mut num_samples = 0;
        let mut num_corrects = 0;
        for batch in dataloader_valid.iter() {
            num_samples += batch.targets.dims()[0];
            num_corrects += count_corrects(model_valid.log_probs(batch.images), batch.targets);
        }
        let accuracy = num_corrects as f64 / num_samples.max(1) as f64;
        info!("[Valid - Epoch {epoch}] Accuracy {accuracy:.3}");

        if report.best_valid_accuracy.map_or(true, |best| accuracy > best) {
            model_valid
                .save_file(report.checkpoint.clone(), &CompactRecorder::new())
                .map_err(|err| OrlFacesError::Checkpoint(format!("{err:?}")))?;
            info!(
                "Saved best checkpoint to `{}`",
                report.checkpoint.display()
            );
            report.best_valid_accuracy = Some(accuracy);
            report.best_epoch = Some(epoch);
        }
    }

    let elapsed = now.elapsed().as_secs();
    info!("Training completed in {}m{}s", elapsed / 60, elapsed % 60);

    Ok((model, report))
}

/// Loads the record of a checkpoint into a model.
pub fn load_checkpoint<B, M>(
    model: M,
    checkpoint: &Path,
    device: &B::Device,
) -> crate::error::Result<M>
where
    B: Backend,
    M: Module<B>,
{
    model
        .load_file(checkpoint.to_path_buf(), &CompactRecorder::new(), device)
        .map_err(|err| OrlFacesError::Checkpoint(format!("{err:?}")))
}

/// Number of rows whose most likely class is the target.
fn count_corrects<B: Backend>(output: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> usize {
    let predictions = output.argmax(1).squeeze::<1>(1);
    predictions
        .equal(targets)
        .int()
        .sum()
        .into_scalar()
        .elem::<i64>() as usize
}
