//! Perceiver resampler for sequence conditioning
//!
//! Pools a variable-length conditioning sequence (e.g. T5 token embeddings)
//! into a fixed number of latent vectors that fixed-shape model components
//! can consume.
//!
//! Architecture:
//! - Learned latent queries `[num_latents, dim]`, broadcast over the batch
//! - Optional latents projected from the mean-pooled sequence, placed first
//! - Learned positional embedding added to the sequence
//! - `depth` layers of cross-attention (latents attend to the sequence and to
//!   themselves) followed by a feed-forward, both residual

use burn::module::Param;
use burn::nn::{Embedding, EmbeddingConfig, Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::{Bool, Distribution, Int};
use serde::{Deserialize, Serialize};

use crate::attention::{fill_masked_keys, l2norm, stable_softmax, COSINE_SIM_SCALE};
use crate::error::CfgError;
use crate::feed_forward::{FeedForward, FeedForwardConfig};
use crate::layernorm::LayerNorm;

/// Mean of `x` over the sequence axis, restricted to valid positions
///
/// # Arguments
///
/// * `x` - Sequence `[batch, seq_len, dim]`
/// * `mask` - Valid positions `[batch, seq_len]`, all positions when `None`
///
/// # Returns
///
/// Pooled tensor `[batch, dim]`
pub fn masked_mean<B: Backend>(x: Tensor<B, 3>, mask: Option<Tensor<B, 2, Bool>>) -> Tensor<B, 2> {
    let [batch, seq_len, dim] = x.dims();

    let pooled = match mask {
        // Zero-length sequences pool to zero
        None => x.sum_dim(1) / seq_len.max(1) as f64,
        Some(mask) => {
            let weights = mask.float().reshape([batch, seq_len, 1]);
            let total = (x * weights.clone()).sum_dim(1);
            let count = weights.sum_dim(1).clamp_min(1e-5);
            total / count
        }
    };

    pooled.reshape([batch, dim])
}

/// Cross-attention from latents to the sequence concatenated with the latents
#[derive(Module, Debug)]
pub struct PerceiverAttention<B: Backend> {
    /// Sequence normalization
    pub norm: LayerNorm<B>,
    /// Latent normalization
    pub norm_latents: LayerNorm<B>,
    /// Query projection (from latents)
    pub to_q: Linear<B>,
    /// Fused key/value projection
    pub to_kv: Linear<B>,
    /// Output projection
    pub to_out: Linear<B>,
    /// Output normalization
    pub norm_out: LayerNorm<B>,
    /// Number of attention heads
    pub heads: usize,
    /// Dimension per head
    pub dim_head: usize,
    /// Cosine-similarity attention
    pub cosine_sim_attn: bool,
}

impl<B: Backend> PerceiverAttention<B> {
    /// Creates a new perceiver attention layer
    ///
    /// # Arguments
    ///
    /// * `dim` - Sequence and latent dimension
    /// * `heads` - Number of attention heads
    /// * `dim_head` - Dimension per head
    /// * `cosine_sim_attn` - Use l2-normalized queries and keys
    /// * `device` - Device to create tensors on
    pub fn new(
        dim: usize,
        heads: usize,
        dim_head: usize,
        cosine_sim_attn: bool,
        device: &B::Device,
    ) -> Self {
        let inner_dim = heads * dim_head;

        Self {
            norm: LayerNorm::new(dim, device),
            norm_latents: LayerNorm::new(dim, device),
            to_q: LinearConfig::new(dim, inner_dim).with_bias(false).init(device),
            to_kv: LinearConfig::new(dim, inner_dim * 2).with_bias(false).init(device),
            to_out: LinearConfig::new(inner_dim, dim).with_bias(false).init(device),
            norm_out: LayerNorm::new(dim, device),
            heads,
            dim_head,
            cosine_sim_attn,
        }
    }

    /// Latents attend to `cat(x, latents)`
    ///
    /// # Arguments
    ///
    /// * `x` - Sequence `[batch, seq_len, dim]`
    /// * `latents` - Latents `[batch, num_latents, dim]`
    /// * `mask` - Valid sequence positions `[batch, seq_len]`
    ///
    /// # Returns
    ///
    /// Attention output `[batch, num_latents, dim]`
    pub fn forward(
        &self,
        x: Tensor<B, 3>,
        latents: Tensor<B, 3>,
        mask: Option<Tensor<B, 2, Bool>>,
    ) -> Tensor<B, 3> {
        let [batch, seq_len, _] = x.dims();
        let [_, num_latents, _] = latents.dims();
        let inner_dim = self.heads * self.dim_head;
        let kv_len = seq_len + num_latents;

        let x = self.norm.forward(x);
        let latents = self.norm_latents.forward(latents);

        let q = self.to_q.forward(latents.clone());

        // Keys/values also come from the latents themselves
        let kv = self.to_kv.forward(Tensor::cat(vec![x, latents], 1));
        let k = kv.clone().slice([0..batch, 0..kv_len, 0..inner_dim]);
        let v = kv.slice([0..batch, 0..kv_len, inner_dim..inner_dim * 2]);

        let q = q
            .reshape([batch, num_latents, self.heads, self.dim_head])
            .swap_dims(1, 2);
        let k = k.reshape([batch, kv_len, self.heads, self.dim_head]).swap_dims(1, 2);
        let v = v.reshape([batch, kv_len, self.heads, self.dim_head]).swap_dims(1, 2);

        let (q, k) = if self.cosine_sim_attn {
            (l2norm(q) * COSINE_SIM_SCALE, l2norm(k))
        } else {
            (q * (self.dim_head as f64).powf(-0.5), k)
        };

        let sim = q.matmul(k.transpose());

        let sim = match mask {
            Some(mask) => {
                // Latent positions are always valid
                let latents_valid =
                    Tensor::<B, 2, Int>::ones([batch, num_latents], &mask.device()).bool();
                fill_masked_keys(sim, Tensor::cat(vec![mask, latents_valid], 1))
            }
            None => sim,
        };

        let attn = stable_softmax(sim, 3);
        let out = attn
            .matmul(v)
            .swap_dims(1, 2)
            .reshape([batch, num_latents, inner_dim]);

        self.norm_out.forward(self.to_out.forward(out))
    }
}

/// Latents derived from the mean-pooled sequence
#[derive(Module, Debug)]
pub struct MeanPooledLatents<B: Backend> {
    pub norm: LayerNorm<B>,
    pub proj: Linear<B>,
    pub num_latents: usize,
}

impl<B: Backend> MeanPooledLatents<B> {
    pub fn new(dim: usize, num_latents: usize, device: &B::Device) -> Self {
        Self {
            norm: LayerNorm::new(dim, device),
            proj: LinearConfig::new(dim, dim * num_latents).init(device),
            num_latents,
        }
    }

    /// Projects the masked mean of `x` to `[batch, num_latents, dim]`
    pub fn forward(&self, x: Tensor<B, 3>, mask: Option<Tensor<B, 2, Bool>>) -> Tensor<B, 3> {
        let [batch, _, dim] = x.dims();
        let pooled = masked_mean(x, mask);
        self.proj
            .forward(self.norm.forward(pooled))
            .reshape([batch, self.num_latents, dim])
    }
}

/// One resampler layer: attention then feed-forward
#[derive(Module, Debug)]
pub struct PerceiverLayer<B: Backend> {
    pub attn: PerceiverAttention<B>,
    pub ff: FeedForward<B>,
}

fn default_dim_head() -> usize {
    64
}

fn default_heads() -> usize {
    8
}

fn default_num_latents() -> usize {
    64
}

fn default_num_latents_mean_pooled() -> usize {
    4
}

fn default_max_seq_len() -> usize {
    512
}

fn default_ff_mult() -> usize {
    4
}

/// Configuration for PerceiverResampler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerceiverResamplerConfig {
    /// Sequence and latent dimension
    pub dim: usize,
    /// Number of attention + feed-forward layers
    pub depth: usize,
    /// Dimension per head
    #[serde(default = "default_dim_head")]
    pub dim_head: usize,
    /// Number of attention heads
    #[serde(default = "default_heads")]
    pub heads: usize,
    /// Number of learned latents
    #[serde(default = "default_num_latents")]
    pub num_latents: usize,
    /// Number of latents derived from the mean-pooled sequence
    #[serde(default = "default_num_latents_mean_pooled")]
    pub num_latents_mean_pooled: usize,
    /// Longest accepted sequence (positional embedding size)
    #[serde(default = "default_max_seq_len")]
    pub max_seq_len: usize,
    /// Feed-forward hidden multiplier
    #[serde(default = "default_ff_mult")]
    pub ff_mult: usize,
    /// Use l2-normalized queries and keys
    #[serde(default)]
    pub cosine_sim_attn: bool,
}

impl PerceiverResamplerConfig {
    /// Creates a config with 64 learned and 4 mean-pooled latents
    pub fn new(dim: usize, depth: usize) -> Self {
        Self {
            dim,
            depth,
            dim_head: default_dim_head(),
            heads: default_heads(),
            num_latents: default_num_latents(),
            num_latents_mean_pooled: default_num_latents_mean_pooled(),
            max_seq_len: default_max_seq_len(),
            ff_mult: default_ff_mult(),
            cosine_sim_attn: false,
        }
    }

    pub fn with_heads(mut self, heads: usize, dim_head: usize) -> Self {
        self.heads = heads;
        self.dim_head = dim_head;
        self
    }

    pub fn with_latents(mut self, num_latents: usize, num_latents_mean_pooled: usize) -> Self {
        self.num_latents = num_latents;
        self.num_latents_mean_pooled = num_latents_mean_pooled;
        self
    }

    pub fn with_max_seq_len(mut self, max_seq_len: usize) -> Self {
        self.max_seq_len = max_seq_len;
        self
    }

    pub fn with_ff_mult(mut self, ff_mult: usize) -> Self {
        self.ff_mult = ff_mult;
        self
    }

    pub fn with_cosine_sim_attn(mut self, cosine_sim_attn: bool) -> Self {
        self.cosine_sim_attn = cosine_sim_attn;
        self
    }

    /// Total number of output latents
    pub fn total_latents(&self) -> usize {
        self.num_latents_mean_pooled + self.num_latents
    }

    /// Initialize the resampler
    pub fn init<B: Backend>(&self, device: &B::Device) -> PerceiverResampler<B> {
        tracing::debug!(
            dim = self.dim,
            depth = self.depth,
            num_latents = self.num_latents,
            num_latents_mean_pooled = self.num_latents_mean_pooled,
            max_seq_len = self.max_seq_len,
            "init PerceiverResampler"
        );
        if self.total_latents() == 0 {
            tracing::warn!("PerceiverResampler configured with zero latents");
        }

        let latents = Param::from_tensor(Tensor::random(
            [self.num_latents, self.dim],
            Distribution::Normal(0.0, 1.0),
            device,
        ));

        let mean_pooled = (self.num_latents_mean_pooled > 0)
            .then(|| MeanPooledLatents::new(self.dim, self.num_latents_mean_pooled, device));

        let layers = (0..self.depth)
            .map(|_| PerceiverLayer {
                attn: PerceiverAttention::new(
                    self.dim,
                    self.heads,
                    self.dim_head,
                    self.cosine_sim_attn,
                    device,
                ),
                ff: FeedForwardConfig::new(self.dim, self.ff_mult).init(device),
            })
            .collect();

        PerceiverResampler {
            pos_emb: EmbeddingConfig::new(self.max_seq_len, self.dim).init(device),
            latents,
            mean_pooled,
            layers,
            dim: self.dim,
            max_seq_len: self.max_seq_len,
        }
    }
}

/// Perceiver resampler
///
/// Output latent count is fixed at construction and does not depend on the
/// input sequence length.
#[derive(Module, Debug)]
pub struct PerceiverResampler<B: Backend> {
    /// Positional embedding `[max_seq_len, dim]`
    pub pos_emb: Embedding<B>,
    /// Learned latents `[num_latents, dim]`
    pub latents: Param<Tensor<B, 2>>,
    /// Mean-pooled latent branch (absent when its count is zero)
    pub mean_pooled: Option<MeanPooledLatents<B>>,
    /// Attention + feed-forward layers
    pub layers: Vec<PerceiverLayer<B>>,
    pub dim: usize,
    pub max_seq_len: usize,
}

impl<B: Backend> PerceiverResampler<B> {
    /// Number of latents produced per example
    pub fn num_output_latents(&self) -> usize {
        let [num_latents, _] = self.latents.val().dims();
        let mean_pooled = self.mean_pooled.as_ref().map_or(0, |m| m.num_latents);
        mean_pooled + num_latents
    }

    /// Pools a sequence into latents
    ///
    /// # Arguments
    ///
    /// * `x` - Sequence `[batch, seq_len, dim]`
    /// * `mask` - Valid positions `[batch, seq_len]`
    ///
    /// # Returns
    ///
    /// Latents `[batch, num_latents_mean_pooled + num_latents, dim]`
    ///
    /// # Errors
    ///
    /// [`CfgError::EmptySequence`] when `seq_len == 0`,
    /// [`CfgError::SequenceTooLong`] when `seq_len > max_seq_len`,
    /// [`CfgError::ShapeMismatch`] when `x` or `mask` has the wrong shape.
    pub fn forward(
        &self,
        x: Tensor<B, 3>,
        mask: Option<Tensor<B, 2, Bool>>,
    ) -> Result<Tensor<B, 3>, CfgError> {
        let [batch, seq_len, dim] = x.dims();

        if seq_len == 0 {
            return Err(CfgError::EmptySequence);
        }
        if seq_len > self.max_seq_len {
            return Err(CfgError::SequenceTooLong {
                seq_len,
                max_seq_len: self.max_seq_len,
            });
        }
        if dim != self.dim {
            return Err(CfgError::ShapeMismatch {
                name: "x",
                expected: vec![batch, seq_len, self.dim],
                actual: vec![batch, seq_len, dim],
            });
        }
        if let Some(mask) = &mask {
            if mask.dims() != [batch, seq_len] {
                return Err(CfgError::ShapeMismatch {
                    name: "mask",
                    expected: vec![batch, seq_len],
                    actual: mask.dims().to_vec(),
                });
            }
        }

        let device = x.device();
        let positions = Tensor::<B, 1, Int>::arange(0..seq_len as i64, &device).reshape([1, seq_len]);
        let x_with_pos = x.clone() + self.pos_emb.forward(positions);

        // [num_latents, dim] -> [batch, num_latents, dim]
        let latents = self.latents.val().unsqueeze::<3>().repeat_dim(0, batch);

        let mut latents = match &self.mean_pooled {
            Some(mean_pooled) => {
                let pooled_latents = mean_pooled.forward(x, mask.clone());
                Tensor::cat(vec![pooled_latents, latents], 1)
            }
            None => latents,
        };

        for layer in &self.layers {
            latents = layer.attn.forward(x_with_pos.clone(), latents.clone(), mask.clone()) + latents;
            latents = layer.ff.forward(latents.clone()) + latents;
        }

        Ok(latents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn small_config() -> PerceiverResamplerConfig {
        PerceiverResamplerConfig::new(16, 1)
            .with_heads(2, 8)
            .with_latents(4, 2)
            .with_max_seq_len(32)
    }

    #[test]
    fn test_resampler_output_shape() {
        let device = Default::default();
        let config = PerceiverResamplerConfig::new(32, 2);
        let resampler = config.init::<TestBackend>(&device);

        let x = Tensor::random([2, 16, 32], Distribution::Normal(0.0, 1.0), &device);
        let latents = resampler.forward(x, None).unwrap();

        assert_eq!(latents.dims(), [2, 68, 32]);
        assert_eq!(resampler.num_output_latents(), 68);
        assert_eq!(config.total_latents(), 68);
    }

    #[test]
    fn test_no_mean_pooled_branch() {
        let device = Default::default();
        let resampler = small_config().with_latents(4, 0).init::<TestBackend>(&device);

        assert!(resampler.mean_pooled.is_none());

        let x = Tensor::random([3, 5, 16], Distribution::Normal(0.0, 1.0), &device);
        assert_eq!(resampler.forward(x, None).unwrap().dims(), [3, 4, 16]);
    }

    #[test]
    fn test_sequence_too_long() {
        let device = Default::default();
        let resampler = small_config().init::<TestBackend>(&device);

        let x = Tensor::zeros([1, 33, 16], &device);
        let err = resampler.forward(x, None).unwrap_err();

        assert_eq!(
            err,
            CfgError::SequenceTooLong {
                seq_len: 33,
                max_seq_len: 32
            }
        );
    }

    #[test]
    fn test_empty_sequence_rejected() {
        let device = Default::default();
        let resampler = small_config().init::<TestBackend>(&device);

        let x = Tensor::zeros([2, 0, 16], &device);
        assert_eq!(resampler.forward(x, None).unwrap_err(), CfgError::EmptySequence);

        let x = Tensor::zeros([2, 0, 16], &device);
        let mask = Tensor::<TestBackend, 2, Int>::zeros([2, 0], &device).bool();
        assert_eq!(resampler.forward(x, Some(mask)).unwrap_err(), CfgError::EmptySequence);
    }

    #[test]
    fn test_mask_shape_mismatch() {
        let device = Default::default();
        let resampler = small_config().init::<TestBackend>(&device);

        let x = Tensor::zeros([2, 6, 16], &device);
        let mask = Tensor::<TestBackend, 2, Int>::ones([2, 5], &device).bool();

        assert!(matches!(
            resampler.forward(x, Some(mask)),
            Err(CfgError::ShapeMismatch { name: "mask", .. })
        ));
    }

    #[test]
    fn test_masked_positions_do_not_affect_output() {
        let device = Default::default();
        let resampler = small_config().init::<TestBackend>(&device);

        let valid = Tensor::<TestBackend, 3>::random([1, 3, 16], Distribution::Normal(0.0, 1.0), &device);
        let pad_a = Tensor::random([1, 4, 16], Distribution::Normal(0.0, 1.0), &device);
        let pad_b = Tensor::random([1, 4, 16], Distribution::Normal(0.0, 1.0), &device);

        let mask_data = TensorData::new(vec![true, true, true, false, false, false, false], [1, 7]);
        let mask = Tensor::<TestBackend, 2, Bool>::from_data(mask_data, &device);

        let out_a = resampler
            .forward(Tensor::cat(vec![valid.clone(), pad_a], 1), Some(mask.clone()))
            .unwrap();
        let out_b = resampler
            .forward(Tensor::cat(vec![valid, pad_b], 1), Some(mask))
            .unwrap();

        let out_a: Vec<f32> = out_a.into_data().to_vec().unwrap();
        let out_b: Vec<f32> = out_b.into_data().to_vec().unwrap();
        for (a, b) in out_a.iter().zip(&out_b) {
            assert!((a - b).abs() < 1e-4, "padding leaked into latents");
        }
    }

    #[test]
    fn test_masked_mean() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 3>::from_floats([[[1.0, 2.0], [3.0, 4.0], [100.0, 100.0]]], &device);
        let mask = Tensor::<TestBackend, 2, Bool>::from_data(
            TensorData::new(vec![true, true, false], [1, 3]),
            &device,
        );

        let pooled: Vec<f32> = masked_mean(x.clone(), Some(mask)).into_data().to_vec().unwrap();
        assert_eq!(pooled, vec![2.0, 3.0]);

        let pooled: Vec<f32> = masked_mean(x, None).into_data().to_vec().unwrap();
        assert!((pooled[0] - 104.0 / 3.0).abs() < 1e-4);
    }

    #[test]
    fn test_cosine_sim_resampler() {
        let device = Default::default();
        let resampler = small_config()
            .with_cosine_sim_attn(true)
            .init::<TestBackend>(&device);

        let x = Tensor::random([2, 9, 16], Distribution::Normal(0.0, 1.0), &device);
        let out: Vec<f32> = resampler.forward(x, None).unwrap().into_data().to_vec().unwrap();

        assert!(out.iter().all(|v| v.is_finite()));
    }
}
