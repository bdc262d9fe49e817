//! Training module for LoRA fine-tuning
//!
//! This module provides:
//! - The epoch loop over a [`TrainingUnit`] (Adam, constant learning rate)
//! - Multi-label metrics (loss, exact match, per-label accuracy)
//! - The full run: data, model, fit, final save and run artifacts

pub mod metrics;
pub mod supervised;

// Re-export main types for convenience
pub use metrics::{EpochMetrics, MetricSummary, MultiLabelMetrics};
pub use supervised::{
    fit, run_training, save_model, FitSettings, RunSummary, StepOutput, TrainingOutcome, TrainingUnit,
};

/// Default number of training epochs
pub const DEFAULT_EPOCHS: usize = 25;

/// Default batch size
pub const DEFAULT_BATCH_SIZE: usize = 32;

/// Default learning rate
pub const DEFAULT_LEARNING_RATE: f64 = 1e-4;
