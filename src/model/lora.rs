//! Low-rank adapters for the fused attention projection
//!
//! Each adapted projection gains `delta(x) = up(down(x)) * alpha / rank`, with
//! `down: dim -> rank` and `up: rank -> dim`. `up` starts at zero, so a freshly
//! wrapped backbone computes exactly what it computed before.

use burn::{
    config::Config,
    module::Module,
    nn::{Initializer, Linear, LinearConfig},
    tensor::{backend::Backend, Tensor},
};

use crate::model::vit::VisionTransformer;

/// LoRA hyper-parameters
#[derive(Config, Debug)]
pub struct LoraConfig {
    /// Rank of the adapter factors
    #[config(default = "4")]
    pub rank: usize,

    /// Scaling numerator; the update is multiplied by `alpha / rank`
    #[config(default = "16.0")]
    pub alpha: f64,

    /// Adapt the query projection
    #[config(default = "true")]
    pub query: bool,

    /// Adapt the value projection
    #[config(default = "true")]
    pub value: bool,
}

impl LoraConfig {
    pub fn scale(&self) -> f64 {
        self.alpha / self.rank as f64
    }

    /// Create one adapter for a `dim -> dim` projection
    pub fn init_adapter<B: Backend>(&self, dim: usize, device: &B::Device) -> LoraAdapter<B> {
        let down = LinearConfig::new(dim, self.rank)
            .with_bias(false)
            .init(device);
        let up = LinearConfig::new(self.rank, dim)
            .with_bias(false)
            .with_initializer(Initializer::Zeros)
            .init(device);

        LoraAdapter {
            down,
            up,
            scale: self.scale(),
        }
    }

    /// Attach adapters to the query/value projections of every block.
    ///
    /// Only adapter parameters are trainable afterwards if the backbone was
    /// frozen beforehand.
    pub fn wrap<B: Backend>(&self, mut backbone: VisionTransformer<B>, device: &B::Device) -> VisionTransformer<B> {
        let dim = backbone.embed_dim();
        for block in backbone.blocks.iter_mut() {
            let qkv = &mut block.attn.qkv;
            if self.query {
                qkv.lora_q = Some(self.init_adapter(dim, device));
            }
            if self.value {
                qkv.lora_v = Some(self.init_adapter(dim, device));
            }
        }
        backbone
    }
}

/// A rank-r update `up(down(x)) * scale`
#[derive(Module, Debug)]
pub struct LoraAdapter<B: Backend> {
    pub down: Linear<B>,
    pub up: Linear<B>,
    scale: f64,
}

impl<B: Backend> LoraAdapter<B> {
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        self.up.forward(self.down.forward(x)).mul_scalar(self.scale)
    }
}

/// Fused `qkv` projection with optional query/value adapters
#[derive(Module, Debug)]
pub struct LoraQkv<B: Backend> {
    /// Pretrained fused projection `dim -> 3 * dim`
    pub base: Linear<B>,
    pub lora_q: Option<LoraAdapter<B>>,
    pub lora_v: Option<LoraAdapter<B>>,
}

impl<B: Backend> LoraQkv<B> {
    pub fn new(dim: usize, device: &B::Device) -> Self {
        Self {
            base: LinearConfig::new(dim, dim * 3).init(device),
            lora_q: None,
            lora_v: None,
        }
    }

    /// Input [batch, tokens, dim], output [batch, tokens, 3 * dim] laid out as q | k | v
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let qkv = self.base.forward(x.clone());
        if self.lora_q.is_none() && self.lora_v.is_none() {
            return qkv;
        }

        let [batch, tokens, fused] = qkv.dims();
        let dim = fused / 3;
        let device = qkv.device();
        let zeros = || Tensor::<B, 3>::zeros([batch, tokens, dim], &device);

        let q = self
            .lora_q
            .as_ref()
            .map(|a| a.forward(x.clone()))
            .unwrap_or_else(zeros);
        let v = self
            .lora_v
            .as_ref()
            .map(|a| a.forward(x))
            .unwrap_or_else(zeros);

        qkv + Tensor::cat(vec![q, zeros(), v], 2)
    }

    /// Parameters held by the adapters
    pub fn adapter_params(&self) -> usize {
        self.lora_q.as_ref().map_or(0, |a| a.num_params())
            + self.lora_v.as_ref().map_or(0, |a| a.num_params())
    }
}
