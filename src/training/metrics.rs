//! Multi-label metrics
//!
//! Accumulated over an epoch from batch losses, logits and multi-hot targets:
//! - mean loss (weighted by batch size)
//! - exact-match accuracy: all labels of a sample predicted correctly
//! - per-label accuracy: element-wise agreement over every (sample, label) pair
//!
//! A label counts as predicted when its probability exceeds 0.5, i.e. when its
//! logit is positive.

use std::fmt;

use burn::tensor::{backend::Backend, ElementConversion, Int, Tensor};
use serde::{Deserialize, Serialize};

use crate::utils::error::{Result, SoftconError};

/// Running totals for one pass over a dataset
#[derive(Debug, Clone, Default)]
pub struct MultiLabelMetrics {
    loss_sum: f64,
    samples: usize,
    exact_matches: usize,
    label_agreements: usize,
    label_total: usize,
}

impl MultiLabelMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one batch given as tensors
    pub fn update<B: Backend>(
        &mut self,
        loss: Tensor<B, 1>,
        logits: Tensor<B, 2>,
        targets: Tensor<B, 2, Int>,
    ) -> Result<()> {
        let [batch_size, num_labels] = logits.dims();
        let loss: f64 = loss.into_scalar().elem();

        let logits = logits
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| SoftconError::Training(format!("reading logits: {:?}", e)))?;
        let targets = targets
            .into_data()
            .convert::<i64>()
            .to_vec::<i64>()
            .map_err(|e| SoftconError::Training(format!("reading targets: {:?}", e)))?;

        self.update_values(loss, &logits, &targets, batch_size, num_labels);
        Ok(())
    }

    /// Add one batch given as row-major `[batch_size, num_labels]` values
    pub fn update_values(
        &mut self,
        loss: f64,
        logits: &[f32],
        targets: &[i64],
        batch_size: usize,
        num_labels: usize,
    ) {
        self.loss_sum += loss * batch_size as f64;
        self.samples += batch_size;
        self.label_total += batch_size * num_labels;

        for (row_logits, row_targets) in logits
            .chunks(num_labels)
            .zip(targets.chunks(num_labels))
            .take(batch_size)
        {
            let agreements = row_logits
                .iter()
                .zip(row_targets)
                .filter(|(logit, target)| (**logit > 0.0) == (**target > 0))
                .count();
            self.label_agreements += agreements;
            if agreements == num_labels {
                self.exact_matches += 1;
            }
        }
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    pub fn summary(&self) -> MetricSummary {
        let ratio = |num: usize, den: usize| if den == 0 { 0.0 } else { num as f64 / den as f64 };
        MetricSummary {
            loss: if self.samples == 0 {
                0.0
            } else {
                self.loss_sum / self.samples as f64
            },
            exact_match: ratio(self.exact_matches, self.samples),
            per_label: ratio(self.label_agreements, self.label_total),
            samples: self.samples,
        }
    }
}

/// Metric values of one pass
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    /// Mean binary cross-entropy
    pub loss: f64,
    /// Fraction of samples with every label right
    pub exact_match: f64,
    /// Fraction of (sample, label) pairs right
    pub per_label: f64,
    pub samples: usize,
}

impl fmt::Display for MetricSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "loss = {:.4}, exact match = {:.2}%, per-label = {:.2}%",
            self.loss,
            100.0 * self.exact_match,
            100.0 * self.per_label
        )
    }
}

/// Train and validation metrics of one epoch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochMetrics {
    /// 1-based epoch number
    pub epoch: usize,
    pub train: MetricSummary,
    pub valid: MetricSummary,
    pub duration_secs: f64,
}
