//! SoftCon + LoRA multi-label classifier
//!
//! Assembly order:
//! 1. build the ViT-B/14 backbone
//! 2. read the pretrained checkpoint (applied only when asked to)
//! 3. freeze every backbone parameter
//! 4. attach query/value adapters
//! 5. attach a trainable linear head `embed_dim -> 19`

use burn::{
    config::Config,
    module::Module,
    nn::{
        loss::BinaryCrossEntropyLossConfig,
        Linear, LinearConfig,
    },
    tensor::{backend::Backend, Int, Tensor},
};
use tracing::info;

use crate::config::ModelConfig;
use crate::model::checkpoint::{load_pretrained, CheckpointMode};
use crate::model::lora::LoraConfig;
use crate::model::vit::{VisionTransformer, VisionTransformerConfig};
use crate::utils::error;
use crate::utils::format_number;

/// Configuration of the full classifier
#[derive(Config, Debug)]
pub struct SoftconClassifierConfig {
    /// Backbone architecture
    pub vit: VisionTransformerConfig,

    /// Adapter settings
    pub lora: LoraConfig,

    /// Number of output labels
    #[config(default = "19")]
    pub num_classes: usize,
}

impl SoftconClassifierConfig {
    /// ViT-B/14 at `image_size` with the adapter settings of a run configuration
    pub fn from_model_config(config: &ModelConfig, image_size: usize) -> Self {
        Self::new(
            VisionTransformerConfig::new().with_img_size(image_size),
            LoraConfig::new()
                .with_rank(config.lora_rank)
                .with_alpha(config.lora_alpha),
        )
        .with_num_classes(config.num_classes)
    }

    /// Freeze an initialized backbone, attach the adapters and the head
    pub fn assemble<B: Backend>(
        &self,
        backbone: VisionTransformer<B>,
        device: &B::Device,
    ) -> SoftconClassifier<B> {
        let backbone = self.lora.wrap(backbone.no_grad(), device);
        let head = LinearConfig::new(self.vit.embed_dim, self.num_classes).init(device);
        SoftconClassifier { backbone, head }
    }

    /// Classifier with randomly initialized backbone weights
    pub fn init<B: Backend>(&self, device: &B::Device) -> SoftconClassifier<B> {
        self.assemble(self.vit.init(device), device)
    }
}

/// Parameter counts of an assembled classifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParameterCounts {
    pub trainable: usize,
    pub total: usize,
}

impl ParameterCounts {
    pub fn trainable_percent(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            100.0 * self.trainable as f64 / self.total as f64
        }
    }
}

/// Frozen backbone with adapters and a linear head
#[derive(Module, Debug)]
pub struct SoftconClassifier<B: Backend> {
    pub backbone: VisionTransformer<B>,
    pub head: Linear<B>,
}

impl<B: Backend> SoftconClassifier<B> {
    /// Forward pass
    ///
    /// # Arguments
    /// * `images` - Input tensor of shape [batch_size, 13, height, width]
    ///
    /// # Returns
    /// * Logits tensor of shape [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.head.forward(self.backbone.forward(images))
    }

    /// Logits and mean sigmoid binary cross-entropy over all labels
    pub fn forward_loss(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 2, Int>,
    ) -> (Tensor<B, 1>, Tensor<B, 2>) {
        let logits = self.forward(images);
        let loss = BinaryCrossEntropyLossConfig::new()
            .with_logits(true)
            .init(&logits.device())
            .forward(logits.clone(), targets);
        (loss, logits)
    }

    pub fn num_classes(&self) -> usize {
        self.head.weight.val().dims()[1]
    }

    /// Trainable parameters are the adapters and the head
    pub fn parameter_counts(&self) -> ParameterCounts {
        ParameterCounts {
            trainable: self.backbone.adapter_params() + self.head.num_params(),
            total: self.num_params(),
        }
    }
}

/// Build the classifier for a run: backbone, checkpoint, freeze, adapters, head
pub fn build_classifier<B: Backend>(
    config: &ModelConfig,
    image_size: usize,
    device: &B::Device,
) -> error::Result<SoftconClassifier<B>> {
    let classifier_config = SoftconClassifierConfig::from_model_config(config, image_size);
    classifier_config.vit.validate()?;
    let backbone = classifier_config.vit.init::<B>(device);

    let backbone = load_pretrained(
        backbone,
        &config.checkpoint,
        config.checkpoint_top_level_key.as_deref(),
        CheckpointMode::from_flag(config.apply_checkpoint),
        device,
    )?;

    let model = classifier_config.assemble(backbone, device);
    let counts = model.parameter_counts();
    info!(
        "Model ready: {} trainable / {} total parameters ({:.2}%)",
        format_number(counts.trainable),
        format_number(counts.total),
        counts.trainable_percent()
    );

    Ok(model)
}
