//! Supervised Fine-Tuning Loop
//!
//! A plain epoch loop on Burn's autodiff and optimizer APIs: shuffled training
//! batches with an Adam step at a constant learning rate, then one ordered
//! pass over the validation set with the non-autodiff model. No scheduler, no
//! early stopping and no intermediate checkpoints; the weights are saved once
//! at the end.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use burn::{
    data::{dataloader::DataLoaderBuilder, dataset::Dataset},
    module::{AutodiffModule, Module},
    optim::{AdamConfig, GradientsParams, Optimizer},
    record::CompactRecorder,
    tensor::{
        backend::{AutodiffBackend, Backend},
        Int, Tensor,
    },
};
use chrono::{DateTime, Local};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::FinetuneConfig;
use crate::dataset::burn_dataset::{
    label_counts, load_country_train_val, BigEarthNetDataset, PatchBatch, PatchBatcher,
};
use crate::model::classifier::{build_classifier, ParameterCounts, SoftconClassifier};
use crate::training::metrics::{EpochMetrics, MetricSummary, MultiLabelMetrics};
use crate::utils::error::{Result, SoftconError};
use crate::utils::format_duration;

/// Loss, logits and targets of one batch
pub struct StepOutput<B: Backend> {
    pub loss: Tensor<B, 1>,
    pub logits: Tensor<B, 2>,
    pub targets: Tensor<B, 2, Int>,
}

/// A model the fit loop can train on patch batches
pub trait TrainingUnit<B: Backend> {
    fn step(&self, batch: PatchBatch<B>) -> StepOutput<B>;
}

impl<B: Backend> TrainingUnit<B> for SoftconClassifier<B> {
    fn step(&self, batch: PatchBatch<B>) -> StepOutput<B> {
        let (loss, logits) = self.forward_loss(batch.images, batch.targets.clone());
        StepOutput {
            loss,
            logits,
            targets: batch.targets,
        }
    }
}

/// Loop parameters
#[derive(Debug, Clone, PartialEq)]
pub struct FitSettings {
    pub epochs: usize,
    pub batch_size: usize,
    pub num_workers: usize,
    pub learning_rate: f64,
    pub seed: u64,
    pub image_size: usize,
}

impl FitSettings {
    pub fn from_config(config: &FinetuneConfig) -> Self {
        Self {
            epochs: config.training.epochs,
            batch_size: config.training.batch_size,
            num_workers: config.training.num_workers,
            learning_rate: config.training.learning_rate,
            seed: config.training.seed,
            image_size: config.data.image_size,
        }
    }
}

/// Train `model` for a fixed number of epochs and return it with the per-epoch metrics
pub fn fit<B, M>(
    mut model: M,
    train: BigEarthNetDataset,
    valid: BigEarthNetDataset,
    settings: &FitSettings,
) -> Result<(M, Vec<EpochMetrics>)>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + TrainingUnit<B>,
    M::InnerModule: TrainingUnit<B::InnerBackend>,
{
    if train.is_empty() {
        return Err(SoftconError::Training("training set is empty".to_string()));
    }
    if settings.batch_size == 0 {
        return Err(SoftconError::Config("batch_size must be positive".to_string()));
    }

    let num_batches = train.len().div_ceil(settings.batch_size);
    let train_loader = DataLoaderBuilder::new(PatchBatcher::new(settings.image_size))
        .batch_size(settings.batch_size)
        .shuffle(settings.seed)
        .num_workers(settings.num_workers)
        .build(train);
    let valid_loader = DataLoaderBuilder::new(PatchBatcher::new(settings.image_size))
        .batch_size(settings.batch_size)
        .num_workers(settings.num_workers)
        .build(valid);

    let mut optimizer = AdamConfig::new().init::<B, M>();
    let mut history = Vec::with_capacity(settings.epochs);

    for epoch in 1..=settings.epochs {
        let started = Instant::now();

        // Training phase
        let progress = epoch_progress(epoch, settings.epochs, num_batches);
        let mut train_metrics = MultiLabelMetrics::new();
        for batch in train_loader.iter() {
            let output: StepOutput<B> = model.step(batch);
            let grads = GradientsParams::from_grads(output.loss.backward(), &model);
            model = optimizer.step(settings.learning_rate, model, grads);

            train_metrics.update(output.loss, output.logits, output.targets)?;
            progress.inc(1);
        }
        progress.finish_and_clear();

        // Validation phase
        let valid_model = model.valid();
        let mut valid_metrics = MultiLabelMetrics::new();
        for batch in valid_loader.iter() {
            let output: StepOutput<B::InnerBackend> = valid_model.step(batch);
            valid_metrics.update(output.loss, output.logits, output.targets)?;
        }

        let record = EpochMetrics {
            epoch,
            train: train_metrics.summary(),
            valid: valid_metrics.summary(),
            duration_secs: started.elapsed().as_secs_f64(),
        };
        info!(
            "Epoch {}/{} ({}) | train: {} | valid: {}",
            epoch,
            settings.epochs,
            format_duration(record.duration_secs),
            record.train,
            record.valid
        );
        history.push(record);
    }

    Ok((model, history))
}

fn epoch_progress(epoch: usize, epochs: usize, num_batches: usize) -> ProgressBar {
    let progress = ProgressBar::new(num_batches as u64);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("  Epoch {prefix} [{bar:40.cyan/blue}] {pos}/{len} batches ({eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-"),
    );
    progress.set_prefix(format!("{}/{}", epoch, epochs));
    progress
}

/// Summary of a finished run, written next to the epoch history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub started_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,
    pub country: String,
    pub train_patches: usize,
    pub valid_patches: usize,
    pub trainable_params: usize,
    pub total_params: usize,
    pub checkpoint_applied: bool,
    pub final_train: Option<MetricSummary>,
    pub final_valid: Option<MetricSummary>,
    /// Saved weights, including the recorder's extension
    pub weights: PathBuf,
}

/// Outcome of [`run_training`]
#[derive(Debug, Clone)]
pub struct TrainingOutcome {
    pub summary: RunSummary,
    pub history: Vec<EpochMetrics>,
}

/// Full fine-tuning run: data, model, fit loop, final save
pub fn run_training<B: AutodiffBackend>(config: &FinetuneConfig) -> Result<TrainingOutcome> {
    config.validate()?;
    let started_at = Local::now();
    let device = B::Device::default();
    B::seed(config.training.seed);
    debug!("Training on {:?}", device);

    let split = load_country_train_val(config)?;
    let (train_patches, valid_patches) = (split.train.len(), split.valid.len());
    debug!("Train label counts: {:?}", label_counts(&split.train));

    let model = build_classifier::<B>(&config.model, config.data.image_size, &device)?;
    let counts: ParameterCounts = model.parameter_counts();

    info!(
        "Fine-tuning for {} epochs (batch size {}, lr {})",
        config.training.epochs, config.training.batch_size, config.training.learning_rate
    );
    let (model, history) = fit(model, split.train, split.valid, &FitSettings::from_config(config))?;

    let weights = save_model(model, &config.training.output_path)?;

    let summary = RunSummary {
        started_at,
        finished_at: Local::now(),
        country: config.data.country.clone(),
        train_patches,
        valid_patches,
        trainable_params: counts.trainable,
        total_params: counts.total,
        checkpoint_applied: config.model.apply_checkpoint,
        final_train: history.last().map(|e| e.train),
        final_valid: history.last().map(|e| e.valid),
        weights,
    };
    write_run_artifacts(&config.training.artifact_dir, &summary, &history)?;

    Ok(TrainingOutcome { summary, history })
}

/// Save the trained module with the compact recorder; returns the written file
pub fn save_model<B: Backend, M: Module<B>>(model: M, output_path: &Path) -> Result<PathBuf> {
    if let Some(parent) = output_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    model
        .save_file(output_path.to_path_buf(), &CompactRecorder::new())
        .map_err(|e| SoftconError::Training(format!("Failed to save model: {:?}", e)))?;

    let written = output_path.with_extension("mpk");
    info!("Saved model to {}", written.display());
    Ok(written)
}

/// Write `history.json` and `run_summary.json` into `dir`
pub fn write_run_artifacts(dir: &Path, summary: &RunSummary, history: &[EpochMetrics]) -> Result<()> {
    fs::create_dir_all(dir)?;
    fs::write(dir.join("history.json"), serde_json::to_string_pretty(history)?)?;
    fs::write(dir.join("run_summary.json"), serde_json::to_string_pretty(summary)?)?;
    debug!("Wrote run artifacts to {}", dir.display());
    Ok(())
}
