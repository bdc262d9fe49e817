//! Pretrained SoftCon checkpoint loading
//!
//! Reads a PyTorch `.pth` state dict into a [`VisionTransformerRecord`]. Keys
//! are remapped onto this crate's layout:
//!
//! - `blocks.C.N.*` (chunked DINOv2 blocks) -> `blocks.N.*`
//! - `blocks.N.attn.qkv.{weight,bias}` -> `blocks.N.attn.qkv.base.{weight,bias}`
//!
//! Keys with no counterpart (`mask_token`, projection heads) are ignored.

use std::io;
use std::path::Path;

use burn::{
    module::Module,
    record::{FullPrecisionSettings, Recorder},
    tensor::backend::Backend,
};
use burn_import::pytorch::{LoadArgs, PyTorchFileRecorder};
use tracing::{info, warn};

use crate::model::vit::{VisionTransformer, VisionTransformerRecord};
use crate::utils::error::{Result, SoftconError};

/// Key rewrites applied to every checkpoint, in order
pub const KEY_REMAPS: [(&str, &str); 2] = [
    (r"^blocks\.[0-9]+\.([0-9]+)\.", "blocks.$1."),
    (r"^(blocks\.[0-9]+\.attn\.qkv)\.(weight|bias)$", "$1.base.$2"),
];

/// How the pretrained weights are used
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointMode {
    /// Load the weights into the backbone
    Apply,
    /// Read and decode the file, then keep the freshly initialized weights
    ReadOnly,
}

impl CheckpointMode {
    pub fn from_flag(apply: bool) -> Self {
        if apply {
            Self::Apply
        } else {
            Self::ReadOnly
        }
    }
}

/// Decode a checkpoint file into a backbone record
pub fn read_checkpoint<B: Backend>(
    path: &Path,
    top_level_key: Option<&str>,
    device: &B::Device,
) -> Result<VisionTransformerRecord<B>> {
    if !path.is_file() {
        return Err(SoftconError::Io(io::Error::new(
            io::ErrorKind::NotFound,
            format!("checkpoint not found: {}", path.display()),
        )));
    }

    let mut args = LoadArgs::new(path.to_path_buf());
    for (pattern, replacement) in KEY_REMAPS {
        args = args.with_key_remap(pattern, replacement);
    }
    if let Some(key) = top_level_key {
        args = args.with_top_level_key(key);
    }

    PyTorchFileRecorder::<FullPrecisionSettings>::default()
        .load(args, device)
        .map_err(|e| SoftconError::Checkpoint(path.to_path_buf(), e.to_string()))
}

/// Read the checkpoint at `path` and, depending on `mode`, load it into `backbone`
pub fn load_pretrained<B: Backend>(
    backbone: VisionTransformer<B>,
    path: &Path,
    top_level_key: Option<&str>,
    mode: CheckpointMode,
    device: &B::Device,
) -> Result<VisionTransformer<B>> {
    let record = read_checkpoint::<B>(path, top_level_key, device)?;

    match mode {
        CheckpointMode::Apply => {
            let backbone = apply_record(backbone, record, path)?;
            info!("Applied pretrained weights from {}", path.display());
            Ok(backbone)
        }
        CheckpointMode::ReadOnly => {
            warn!(
                "Checkpoint {} was read but not applied; the backbone keeps its random initialization (set model.apply_checkpoint = true to use it)",
                path.display()
            );
            let own = backbone.clone().into_record();
            Ok(backbone.load_record(own))
        }
    }
}

/// Load `record` into `backbone`, rejecting a position embedding of another geometry
pub fn apply_record<B: Backend>(
    backbone: VisionTransformer<B>,
    record: VisionTransformerRecord<B>,
    path: &Path,
) -> Result<VisionTransformer<B>> {
    let expected_tokens = backbone.num_tokens();
    let expected_dim = backbone.embed_dim();

    let backbone = backbone.load_record(record);
    if backbone.num_tokens() != expected_tokens || backbone.embed_dim() != expected_dim {
        return Err(SoftconError::Checkpoint(
            path.to_path_buf(),
            format!(
                "position embedding covers {} tokens of dim {}, expected {} of dim {}",
                backbone.num_tokens(),
                backbone.embed_dim(),
                expected_tokens,
                expected_dim
            ),
        ));
    }
    Ok(backbone)
}
