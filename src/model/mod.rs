//! Model module: SoftCon ViT backbone, LoRA adapters and the classifier
//!
//! ## Architecture
//!
//! - `vit`: ViT-B/14 over 13 Sentinel-2 bands, returns the class-token embedding
//! - `lora`: rank-r adapters on the query/value parts of every fused `qkv` projection
//! - `checkpoint`: pretrained `.pth` weights onto the backbone layout
//! - `classifier`: frozen backbone + adapters + linear head over 19 labels

pub mod checkpoint;
pub mod classifier;
pub mod lora;
pub mod vit;

// Re-export main types for convenience
pub use checkpoint::{apply_record, load_pretrained, read_checkpoint, CheckpointMode};
pub use classifier::{build_classifier, ParameterCounts, SoftconClassifier, SoftconClassifierConfig};
pub use lora::{LoraAdapter, LoraConfig, LoraQkv};
pub use vit::{VisionTransformer, VisionTransformerConfig};

/// Default adapter rank
pub const DEFAULT_LORA_RANK: usize = 4;

/// Default adapter scaling numerator
pub const DEFAULT_LORA_ALPHA: f64 = 16.0;
