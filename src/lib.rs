//! # SoftCon LoRA Fine-Tuning
//!
//! Fine-tunes a SoftCon-pretrained ViT-B/14 with low-rank adapters for 19-label
//! multi-label classification of BigEarthNet v2 Sentinel-2 patches from one
//! country, using the Burn framework.
//!
//! ## Modules
//!
//! - `dataset`: metadata, patch store, band transforms, country split, Burn dataset
//! - `model`: ViT backbone, LoRA adapters, checkpoint loading, classifier
//! - `training`: fit loop, multi-label metrics, run artifacts
//! - `config`: run configuration (defaults, TOML, validation)
//! - `utils`: logging, errors and formatting helpers
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use softcon_finetune::backend::TrainingBackend;
//! use softcon_finetune::config::FinetuneConfig;
//! use softcon_finetune::training::run_training;
//!
//! let config = FinetuneConfig::default();
//! let outcome = run_training::<TrainingBackend>(&config)?;
//! println!("weights at {}", outcome.summary.weights.display());
//! ```

pub mod backend;
pub mod config;
pub mod dataset;
pub mod model;
pub mod training;
pub mod utils;

// Re-export commonly used items for convenience
pub use config::FinetuneConfig;
pub use dataset::{
    load_country_train_val, split_country, BigEarthNetDataset, PatchBatch, PatchBatcher, PatchItem,
    SplitAssignment, SplitConfig,
};
pub use model::{build_classifier, LoraConfig, SoftconClassifier, VisionTransformerConfig};
pub use training::{run_training, EpochMetrics, TrainingOutcome};
pub use utils::error::{Result, SoftconError};

/// BigEarthNet v2 labels
pub const NUM_CLASSES: usize = dataset::bands::NUM_LABELS;

/// Model input size (square)
pub const IMAGE_SIZE: usize = 224;

/// ViT patch size
pub const PATCH_SIZE: usize = 14;
