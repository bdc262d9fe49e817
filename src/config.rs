//! Run configuration for the fine-tuning pipeline.
//!
//! Every parameter of a run lives in [`FinetuneConfig`]. Defaults reproduce the
//! Ireland reference run; a TOML file and CLI flags can override them.

use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::model::{DEFAULT_LORA_ALPHA, DEFAULT_LORA_RANK};
use crate::training::{DEFAULT_BATCH_SIZE, DEFAULT_EPOCHS, DEFAULT_LEARNING_RATE};
use crate::utils::error::{Result, SoftconError};
use crate::{NUM_CLASSES, PATCH_SIZE};

/// Full configuration of a fine-tuning run
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FinetuneConfig {
    /// Input data and sampling
    pub data: DataConfig,
    /// Backbone, checkpoint and adapter settings
    pub model: ModelConfig,
    /// Optimisation loop and outputs
    pub training: TrainingParams,
}

/// Input data and country sampling
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DataConfig {
    /// BigEarthNet v2 patch store (LMDB directory or safetensors directory)
    pub images: PathBuf,
    /// Patch metadata parquet (patch_id, labels, split, country)
    pub metadata_parquet: PathBuf,
    /// Optional parquet listing patches with seasonal snow or cloud/shadow
    pub snow_cloud_parquet: Option<PathBuf>,
    /// Keep patches flagged with seasonal snow
    pub include_snowy: bool,
    /// Keep patches flagged with clouds or cloud shadow
    pub include_cloudy: bool,
    /// Country whose train patches are sampled
    pub country: String,
    /// Number of patches drawn from the country's train split
    pub n_samples: usize,
    /// Fraction of the sample used for training, the rest validates
    pub train_fraction: f64,
    /// Seed for the sampler
    pub seed: u64,
    /// Side length of the square model input
    pub image_size: usize,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            images: PathBuf::from("/faststorage/BigEarthNet-V2/BigEarthNet-V2-LMDB"),
            metadata_parquet: PathBuf::from("/faststorage/BigEarthNet-V2/metadata.parquet"),
            snow_cloud_parquet: Some(PathBuf::from(
                "/faststorage/BigEarthNet-V2/metadata_for_patches_with_snow_cloud_or_shadow.parquet",
            )),
            include_snowy: false,
            include_cloudy: false,
            country: "Ireland".to_string(),
            n_samples: 1000,
            train_fraction: 0.8,
            seed: 123,
            image_size: crate::IMAGE_SIZE,
        }
    }
}

/// Backbone, checkpoint and adapter settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelConfig {
    /// Pretrained SoftCon encoder weights (PyTorch `.pth`)
    pub checkpoint: PathBuf,
    /// Key under which the state dict is nested inside the checkpoint, if any
    pub checkpoint_top_level_key: Option<String>,
    /// Load the checkpoint weights into the backbone.
    ///
    /// Off by default: the reference run reads the checkpoint but keeps the
    /// freshly initialized backbone weights.
    pub apply_checkpoint: bool,
    /// LoRA rank
    pub lora_rank: usize,
    /// LoRA alpha; the adapter output is scaled by `alpha / rank`
    pub lora_alpha: f64,
    /// Number of output labels
    pub num_classes: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            checkpoint: PathBuf::from("/faststorage/softcon/pretrained/B13_vitb14_softcon_enc.pth"),
            checkpoint_top_level_key: None,
            apply_checkpoint: false,
            lora_rank: DEFAULT_LORA_RANK,
            lora_alpha: DEFAULT_LORA_ALPHA,
            num_classes: NUM_CLASSES,
        }
    }
}

/// Optimisation loop and outputs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrainingParams {
    /// Number of epochs
    pub epochs: usize,
    /// Batch size for both loaders
    pub batch_size: usize,
    /// Worker threads per data loader
    pub num_workers: usize,
    /// Adam learning rate (constant)
    pub learning_rate: f64,
    /// Seed for parameter init, loader shuffling and augmentation
    pub seed: u64,
    /// Directory for the per-epoch history and run summary
    pub artifact_dir: PathBuf,
    /// Final parameter file (the recorder appends `.mpk`)
    pub output_path: PathBuf,
}

impl Default for TrainingParams {
    fn default() -> Self {
        Self {
            epochs: DEFAULT_EPOCHS,
            batch_size: DEFAULT_BATCH_SIZE,
            num_workers: 4,
            learning_rate: DEFAULT_LEARNING_RATE,
            seed: 123,
            artifact_dir: PathBuf::from("/faststorage/softcon/finetuning/"),
            output_path: PathBuf::from("/faststorage/softcon/finetuning/ireland"),
        }
    }
}

impl FinetuneConfig {
    /// Load a configuration from a TOML file. Missing keys take their defaults.
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let config: Self = load_toml_config(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Render the configuration as TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| SoftconError::Serialization(e.to_string()))
    }

    /// Check every field for values the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        let data = &self.data;
        if data.country.trim().is_empty() {
            return Err(SoftconError::Config("country must not be empty".to_string()));
        }
        if data.n_samples == 0 {
            return Err(SoftconError::Config("n_samples must be positive".to_string()));
        }
        if !(0.0..=1.0).contains(&data.train_fraction) {
            return Err(SoftconError::Config(format!(
                "train_fraction must be between 0.0 and 1.0, got {}",
                data.train_fraction
            )));
        }
        if data.image_size == 0 || data.image_size % PATCH_SIZE != 0 {
            return Err(SoftconError::Config(format!(
                "image_size must be a positive multiple of {}, got {}",
                PATCH_SIZE, data.image_size
            )));
        }

        let model = &self.model;
        if model.lora_rank == 0 {
            return Err(SoftconError::Config("lora_rank must be positive".to_string()));
        }
        if model.lora_alpha <= 0.0 {
            return Err(SoftconError::Config("lora_alpha must be positive".to_string()));
        }
        if model.num_classes != NUM_CLASSES {
            return Err(SoftconError::Config(format!(
                "num_classes must be {} for the BigEarthNet v2 nomenclature, got {}",
                NUM_CLASSES, model.num_classes
            )));
        }

        let training = &self.training;
        if training.epochs == 0 {
            return Err(SoftconError::Config("epochs must be positive".to_string()));
        }
        if training.batch_size == 0 {
            return Err(SoftconError::Config("batch_size must be positive".to_string()));
        }
        if !(training.learning_rate > 0.0) {
            return Err(SoftconError::Config(format!(
                "learning_rate must be positive, got {}",
                training.learning_rate
            )));
        }
        if training.output_path.as_os_str().is_empty() {
            return Err(SoftconError::Config("output_path must not be empty".to_string()));
        }

        Ok(())
    }
}

/// Read and deserialize a TOML file
pub fn load_toml_config<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned,
{
    let content = fs::read_to_string(path)
        .map_err(|e| SoftconError::Config(format!("Failed to read config {}: {e}", path.display())))?;

    toml::from_str(&content)
        .map_err(|e| SoftconError::Config(format!("Failed to parse config {}: {e}", path.display())))
}
