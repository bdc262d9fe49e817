//! SoftCon ViT-B/14 Backbone
//!
//! A DINOv2-style vision transformer over 13-band Sentinel-2 input:
//! patch embedding, class token, learned position embedding, pre-norm blocks
//! with LayerScale, and a final LayerNorm. The backbone returns the normalized
//! class token.
//!
//! Parameter names follow the PyTorch layout (`patch_embed.proj`,
//! `blocks.N.attn.qkv`, `blocks.N.ls1.gamma`, ...) so pretrained weights load
//! by name. The fused `qkv` projection lives under `qkv.base` to leave room
//! for the adapters.

use burn::{
    config::Config,
    module::{Module, Param},
    nn::{
        conv::{Conv2d, Conv2dConfig},
        Gelu, Initializer, LayerNorm, LayerNormConfig, Linear, LinearConfig,
    },
    tensor::{activation::softmax, backend::Backend, Tensor},
};

use crate::model::lora::LoraQkv;
use crate::utils::error::{self, SoftconError};

/// Configuration for the vision transformer
#[derive(Config, Debug)]
pub struct VisionTransformerConfig {
    /// Input image size (square)
    #[config(default = "224")]
    pub img_size: usize,

    /// Patch size (square)
    #[config(default = "14")]
    pub patch_size: usize,

    /// Number of input bands
    #[config(default = "13")]
    pub in_channels: usize,

    /// Token dimension
    #[config(default = "768")]
    pub embed_dim: usize,

    /// Number of transformer blocks
    #[config(default = "12")]
    pub depth: usize,

    /// Number of attention heads
    #[config(default = "12")]
    pub num_heads: usize,

    /// Hidden size of the MLP relative to `embed_dim`
    #[config(default = "4")]
    pub mlp_ratio: usize,

    /// Initial LayerScale value
    #[config(default = "1e-4")]
    pub layer_scale_init: f64,

    /// LayerNorm epsilon
    #[config(default = "1e-6")]
    pub norm_eps: f64,
}

impl VisionTransformerConfig {
    /// Number of patch tokens per image
    pub fn num_patches(&self) -> usize {
        (self.img_size / self.patch_size).pow(2)
    }

    /// Check that patches tile the image and heads split the token dimension
    pub fn validate(&self) -> error::Result<()> {
        if self.patch_size == 0 || self.img_size % self.patch_size != 0 {
            return Err(SoftconError::Model(format!(
                "image size {} is not a multiple of patch size {}",
                self.img_size, self.patch_size
            )));
        }
        if self.num_heads == 0 || self.embed_dim % self.num_heads != 0 {
            return Err(SoftconError::Model(format!(
                "embed_dim {} is not divisible by {} heads",
                self.embed_dim, self.num_heads
            )));
        }
        Ok(())
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> VisionTransformer<B> {
        let dim = self.embed_dim;
        let tokens = self.num_patches() + 1;

        let patch_embed = PatchEmbed {
            proj: Conv2dConfig::new(
                [self.in_channels, dim],
                [self.patch_size, self.patch_size],
            )
            .with_stride([self.patch_size, self.patch_size])
            .init(device),
        };

        let truncated = Initializer::Normal {
            mean: 0.0,
            std: 0.02,
        };
        let cls_token = Initializer::Normal {
            mean: 0.0,
            std: 1e-6,
        }
        .init([1, 1, dim], device);
        let pos_embed = truncated.init([1, tokens, dim], device);

        let blocks = (0..self.depth).map(|_| self.init_block(device)).collect();

        VisionTransformer {
            patch_embed,
            cls_token,
            pos_embed,
            blocks,
            norm: LayerNormConfig::new(dim)
                .with_epsilon(self.norm_eps)
                .init(device),
        }
    }

    fn init_block<B: Backend>(&self, device: &B::Device) -> Block<B> {
        let dim = self.embed_dim;
        let hidden = dim * self.mlp_ratio;
        let norm = || {
            LayerNormConfig::new(dim)
                .with_epsilon(self.norm_eps)
                .init(device)
        };
        let layer_scale = || LayerScale {
            gamma: Initializer::Constant {
                value: self.layer_scale_init,
            }
            .init([dim], device),
        };

        Block {
            norm1: norm(),
            attn: Attention {
                qkv: LoraQkv::new(dim, device),
                proj: LinearConfig::new(dim, dim).init(device),
                num_heads: self.num_heads,
            },
            ls1: layer_scale(),
            norm2: norm(),
            mlp: Mlp {
                fc1: LinearConfig::new(dim, hidden).init(device),
                act: Gelu::new(),
                fc2: LinearConfig::new(hidden, dim).init(device),
            },
            ls2: layer_scale(),
        }
    }
}

/// Non-overlapping patch projection
#[derive(Module, Debug)]
pub struct PatchEmbed<B: Backend> {
    pub proj: Conv2d<B>,
}

impl<B: Backend> PatchEmbed<B> {
    /// [batch, channels, H, W] -> [batch, patches, dim]
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 3> {
        let x = self.proj.forward(x);
        x.flatten::<3>(2, 3).swap_dims(1, 2)
    }
}

/// Per-channel residual scaling
#[derive(Module, Debug)]
pub struct LayerScale<B: Backend> {
    pub gamma: Param<Tensor<B, 1>>,
}

impl<B: Backend> LayerScale<B> {
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        x * self.gamma.val().unsqueeze::<3>()
    }
}

/// Multi-head self-attention over a fused `qkv` projection
#[derive(Module, Debug)]
pub struct Attention<B: Backend> {
    pub qkv: LoraQkv<B>,
    pub proj: Linear<B>,
    num_heads: usize,
}

impl<B: Backend> Attention<B> {
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let [batch, tokens, dim] = x.dims();
        let head_dim = dim / self.num_heads;

        let qkv = self.qkv.forward(x);
        let heads = |start: usize| {
            qkv.clone()
                .slice([0..batch, 0..tokens, start..start + dim])
                .reshape([batch, tokens, self.num_heads, head_dim])
                .swap_dims(1, 2)
        };
        let q = heads(0);
        let k = heads(dim);
        let v = heads(2 * dim);

        let scale = (head_dim as f64).powf(-0.5);
        let attn = softmax(q.matmul(k.swap_dims(2, 3)).mul_scalar(scale), 3);
        let out = attn
            .matmul(v)
            .swap_dims(1, 2)
            .reshape([batch, tokens, dim]);

        self.proj.forward(out)
    }
}

/// Two-layer GELU MLP
#[derive(Module, Debug)]
pub struct Mlp<B: Backend> {
    pub fc1: Linear<B>,
    pub act: Gelu,
    pub fc2: Linear<B>,
}

impl<B: Backend> Mlp<B> {
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        self.fc2.forward(self.act.forward(self.fc1.forward(x)))
    }
}

/// Pre-norm transformer block with LayerScale
#[derive(Module, Debug)]
pub struct Block<B: Backend> {
    pub norm1: LayerNorm<B>,
    pub attn: Attention<B>,
    pub ls1: LayerScale<B>,
    pub norm2: LayerNorm<B>,
    pub mlp: Mlp<B>,
    pub ls2: LayerScale<B>,
}

impl<B: Backend> Block<B> {
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let x = x.clone() + self.ls1.forward(self.attn.forward(self.norm1.forward(x)));
        x.clone() + self.ls2.forward(self.mlp.forward(self.norm2.forward(x)))
    }
}

/// Vision transformer backbone
#[derive(Module, Debug)]
pub struct VisionTransformer<B: Backend> {
    pub patch_embed: PatchEmbed<B>,
    pub cls_token: Param<Tensor<B, 3>>,
    pub pos_embed: Param<Tensor<B, 3>>,
    pub blocks: Vec<Block<B>>,
    pub norm: LayerNorm<B>,
}

impl<B: Backend> VisionTransformer<B> {
    /// Forward pass
    ///
    /// # Arguments
    /// * `images` - Input tensor of shape [batch_size, 13, height, width]
    ///
    /// # Returns
    /// * Class-token embeddings of shape [batch_size, embed_dim]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let tokens = self.patch_embed.forward(images);
        let [batch, _, dim] = tokens.dims();

        let cls = self.cls_token.val().repeat_dim(0, batch);
        let mut x = Tensor::cat(vec![cls, tokens], 1) + self.pos_embed.val();

        for block in &self.blocks {
            x = block.forward(x);
        }

        let x = self.norm.forward(x);
        x.slice([0..batch, 0..1, 0..dim]).reshape([batch, dim])
    }

    pub fn embed_dim(&self) -> usize {
        self.pos_embed.val().dims()[2]
    }

    /// Number of tokens the position embedding covers (patches + class token)
    pub fn num_tokens(&self) -> usize {
        self.pos_embed.val().dims()[1]
    }

    pub fn depth(&self) -> usize {
        self.blocks.len()
    }

    /// Parameters of all attached adapters
    pub fn adapter_params(&self) -> usize {
        self.blocks
            .iter()
            .map(|block| block.attn.qkv.adapter_params())
            .sum()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use burn::tensor::Distribution;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    /// A small transformer with the same structure
    pub(crate) fn tiny_config() -> VisionTransformerConfig {
        VisionTransformerConfig::new()
            .with_img_size(28)
            .with_patch_size(14)
            .with_embed_dim(32)
            .with_depth(2)
            .with_num_heads(4)
    }

    #[test]
    fn test_default_config_is_vit_b14() {
        let config = VisionTransformerConfig::new();
        assert_eq!(config.embed_dim, 768);
        assert_eq!(config.depth, 12);
        assert_eq!(config.num_heads, 12);
        assert_eq!(config.in_channels, 13);
        assert_eq!(config.num_patches(), 256);
    }

    #[test]
    fn test_validate() {
        assert!(tiny_config().validate().is_ok());
        assert!(tiny_config().with_img_size(30).validate().is_err());
        assert!(matches!(
            tiny_config().with_num_heads(5).validate(),
            Err(SoftconError::Model(_))
        ));
    }

    #[test]
    fn test_config_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vit.json");
        tiny_config().save(&path).unwrap();

        let loaded = VisionTransformerConfig::load(&path).unwrap();
        assert_eq!(loaded.embed_dim, 32);
        assert_eq!(loaded.depth, 2);
        assert!(loaded.validate().is_ok());
    }

    #[test]
    fn test_forward_shape() {
        let device = Default::default();
        let model = tiny_config().init::<TestBackend>(&device);
        let images = Tensor::<TestBackend, 4>::random([3, 13, 28, 28], Distribution::Default, &device);

        let embeddings = model.forward(images);
        assert_eq!(embeddings.dims(), [3, 32]);
        assert_eq!(model.num_tokens(), 5);
        assert_eq!(model.depth(), 2);
        assert_eq!(model.embed_dim(), 32);
    }

    #[test]
    fn test_patch_embed_tokens() {
        let device = Default::default();
        let model = tiny_config().init::<TestBackend>(&device);
        let images = Tensor::<TestBackend, 4>::zeros([1, 13, 28, 28], &device);
        assert_eq!(model.patch_embed.forward(images).dims(), [1, 4, 32]);
    }

    #[test]
    fn test_layer_scale_init() {
        let device = Default::default();
        let model = tiny_config().init::<TestBackend>(&device);
        let gamma: Vec<f32> = model.blocks[0].ls1.gamma.val().into_data().to_vec().unwrap();
        assert_eq!(gamma.len(), 32);
        assert!(gamma.iter().all(|g| (*g - 1e-4).abs() < 1e-9));
    }

    #[test]
    fn test_no_adapters_before_wrap() {
        let device = Default::default();
        let model = tiny_config().init::<TestBackend>(&device);
        assert_eq!(model.adapter_params(), 0);
    }
}
