//! Cross-attention with learned null key/values
//!
//! Queries come from the input sequence, keys and values from an optional
//! context (self-attention when absent). A small set of learned "null"
//! key/value slots can be prepended so every query always has a valid target,
//! which keeps the softmax well defined when all conditioning is masked out.

use burn::module::Param;
use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::{Bool, DType, Distribution, Element, Int};
use serde::{Deserialize, Serialize};

use crate::layernorm::LayerNorm;

/// Similarity scale used when queries and keys are l2-normalized
pub const COSINE_SIM_SCALE: f64 = 16.0;

/// Most negative finite value of the backend's float type
///
/// Masked similarities are filled with this instead of `-inf`, so a row
/// with every key masked still produces a finite softmax.
pub fn max_neg_value<B: Backend>() -> f64 {
    match <B::FloatElem as Element>::dtype() {
        DType::F64 => f64::MIN,
        DType::F16 => -65504.0,
        DType::BF16 => -3.389_531_4e38,
        _ => f32::MIN as f64,
    }
}

/// Softmax with max subtraction
///
/// Subtracting the row max before `exp` keeps sentinel-filled rows finite.
/// Computed in the backend's float type: f16/bf16 backends get no f32 upcast
/// around the `exp`/sum.
pub fn stable_softmax<B: Backend, const D: usize>(x: Tensor<B, D>, dim: usize) -> Tensor<B, D> {
    let x_max = x.clone().max_dim(dim);
    let x = (x - x_max).exp();
    x.clone() / x.sum_dim(dim)
}

/// Normalize the last dimension to unit length
pub fn l2norm<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    let norm = x.clone().powf_scalar(2.0).sum_dim(D - 1).sqrt().clamp_min(1e-12);
    x / norm
}

/// Fill similarities of invalid keys with [`max_neg_value`]
///
/// # Arguments
///
/// * `sim` - Similarities `[batch, heads, n_q, n_kv]`
/// * `key_mask` - Valid keys `[batch, n_kv]` (`true` = attend)
pub fn fill_masked_keys<B: Backend>(sim: Tensor<B, 4>, key_mask: Tensor<B, 2, Bool>) -> Tensor<B, 4> {
    let [batch, heads, n_q, n_kv] = sim.dims();
    assert_eq!(key_mask.dims(), [batch, n_kv], "key mask must be [batch, n_kv]");

    let masked_out = key_mask
        .bool_not()
        .reshape([batch, 1, 1, n_kv])
        .repeat_dim(1, heads)
        .repeat_dim(2, n_q);

    sim.mask_fill(masked_out, max_neg_value::<B>())
}

/// Hide keys that lie in the future of each query
///
/// Queries are aligned to the end of the key sequence, so with extra leading
/// keys (null slots, a prefix) query `i` sees keys `0..=i + (n_kv - n_q)`.
pub fn fill_causal<B: Backend>(sim: Tensor<B, 4>) -> Tensor<B, 4> {
    let [batch, heads, n_q, n_kv] = sim.dims();
    let offset = n_kv as isize - n_q as isize;

    let mut future = vec![false; n_q * n_kv];
    for i in 0..n_q {
        for j in 0..n_kv {
            future[i * n_kv + j] = j as isize > i as isize + offset;
        }
    }

    let future = Tensor::<B, 2, Bool>::from_data(TensorData::new(future, [n_q, n_kv]), &sim.device())
        .reshape([1, 1, n_q, n_kv])
        .repeat_dim(0, batch)
        .repeat_dim(1, heads);

    sim.mask_fill(future, max_neg_value::<B>())
}

fn default_dim_head() -> usize {
    64
}

fn default_heads() -> usize {
    8
}

/// Configuration for CrossAttention
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossAttentionConfig {
    /// Query (and output) dimension
    pub dim: usize,
    /// Dimension per head
    #[serde(default = "default_dim_head")]
    pub dim_head: usize,
    /// Number of query heads
    #[serde(default = "default_heads")]
    pub heads: usize,
    /// Context dimension (defaults to `dim`)
    #[serde(default)]
    pub dim_context: Option<usize>,
    /// Layer-normalize the context before projecting it
    #[serde(default)]
    pub norm_context: bool,
    /// Number of learned null key/value slots
    #[serde(default)]
    pub num_null_kv: usize,
    /// Hide future keys from each query
    #[serde(default)]
    pub causal: bool,
    /// Use l2-normalized queries/keys with a fixed similarity scale
    #[serde(default)]
    pub cosine_sim_attn: bool,
}

impl CrossAttentionConfig {
    /// Creates a config with 8 heads of 64 dimensions and no null slots
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            dim_head: default_dim_head(),
            heads: default_heads(),
            dim_context: None,
            norm_context: false,
            num_null_kv: 0,
            causal: false,
            cosine_sim_attn: false,
        }
    }

    pub fn with_heads(mut self, heads: usize, dim_head: usize) -> Self {
        self.heads = heads;
        self.dim_head = dim_head;
        self
    }

    pub fn with_context(mut self, dim_context: usize, norm_context: bool) -> Self {
        self.dim_context = Some(dim_context);
        self.norm_context = norm_context;
        self
    }

    pub fn with_num_null_kv(mut self, num_null_kv: usize) -> Self {
        self.num_null_kv = num_null_kv;
        self
    }

    pub fn with_causal(mut self, causal: bool) -> Self {
        self.causal = causal;
        self
    }

    pub fn with_cosine_sim_attn(mut self, cosine_sim_attn: bool) -> Self {
        self.cosine_sim_attn = cosine_sim_attn;
        self
    }

    /// Initialize the attention module
    pub fn init<B: Backend>(&self, device: &B::Device) -> CrossAttention<B> {
        let inner_dim = self.dim_head * self.heads;
        let dim_context = self.dim_context.unwrap_or(self.dim);

        tracing::debug!(
            dim = self.dim,
            dim_context,
            heads = self.heads,
            dim_head = self.dim_head,
            num_null_kv = self.num_null_kv,
            "init CrossAttention"
        );

        let null_kv = (self.num_null_kv > 0).then(|| {
            Param::from_tensor(Tensor::random(
                [2, self.num_null_kv, self.dim_head],
                Distribution::Normal(0.0, 1.0),
                device,
            ))
        });

        CrossAttention {
            norm: LayerNorm::new(self.dim, device),
            context_norm: self.norm_context.then(|| LayerNorm::new(dim_context, device)),
            null_kv,
            to_q: LinearConfig::new(self.dim, inner_dim).with_bias(false).init(device),
            to_kv: LinearConfig::new(dim_context, self.dim_head * 2)
                .with_bias(false)
                .init(device),
            to_out: LinearConfig::new(inner_dim, self.dim).with_bias(false).init(device),
            heads: self.heads,
            dim_head: self.dim_head,
            dim_context,
            causal: self.causal,
            cosine_sim_attn: self.cosine_sim_attn,
        }
    }
}

/// Cross-attention (or self-attention if context is None)
///
/// Keys and values come from a single projection with one head that is
/// shared by every query head. Optional null key/values `[2, num_null_kv,
/// dim_head]` are prepended to the keys and values and are never masked.
#[derive(Module, Debug)]
pub struct CrossAttention<B: Backend> {
    /// Input normalization
    pub norm: LayerNorm<B>,
    /// Context normalization (when enabled)
    pub context_norm: Option<LayerNorm<B>>,
    /// Learned null keys (index 0) and values (index 1)
    pub null_kv: Option<Param<Tensor<B, 3>>>,
    /// Query projection
    pub to_q: Linear<B>,
    /// Fused key/value projection
    pub to_kv: Linear<B>,
    /// Output projection
    pub to_out: Linear<B>,
    /// Number of query heads
    pub heads: usize,
    /// Dimension per head
    pub dim_head: usize,
    /// Expected context dimension
    pub dim_context: usize,
    /// Causal masking
    pub causal: bool,
    /// Cosine-similarity attention
    pub cosine_sim_attn: bool,
}

impl<B: Backend> CrossAttention<B> {
    /// Computes masked multi-head attention
    ///
    /// # Arguments
    ///
    /// * `x` - Query input of shape `[batch, n_q, dim]`
    /// * `context` - Key/value context `[batch, n_kv, dim_context]`. When `None`,
    ///   keys and values are projected from the layer-normed `x`, not the raw input.
    /// * `mask` - Valid context positions `[batch, n_kv]`
    ///
    /// # Returns
    ///
    /// Attention output of shape `[batch, n_q, dim]`
    ///
    /// # Panics
    ///
    /// If the context or mask shape does not line up with `x`.
    pub fn forward(
        &self,
        x: Tensor<B, 3>,
        context: Option<Tensor<B, 3>>,
        mask: Option<Tensor<B, 2, Bool>>,
    ) -> Tensor<B, 3> {
        let [batch, n_q, _] = x.dims();

        let x = self.norm.forward(x);

        let kv_input = match context {
            Some(context) => {
                let [ctx_batch, _, ctx_dim] = context.dims();
                assert_eq!(ctx_batch, batch, "context batch must match x");
                assert_eq!(ctx_dim, self.dim_context, "context dim must match dim_context");
                match &self.context_norm {
                    Some(norm) => norm.forward(context),
                    None => context,
                }
            }
            None => x.clone(),
        };
        let n_kv = kv_input.dims()[1];

        if let Some(mask) = &mask {
            assert_eq!(mask.dims(), [batch, n_kv], "mask must be [batch, n_kv]");
        }

        // [b, n, heads*dim] -> [b, heads, n, dim]
        let q = self
            .to_q
            .forward(x)
            .reshape([batch, n_q, self.heads, self.dim_head])
            .swap_dims(1, 2);

        let kv = self.to_kv.forward(kv_input);
        let k = kv.clone().slice([0..batch, 0..n_kv, 0..self.dim_head]);
        let v = kv.slice([0..batch, 0..n_kv, self.dim_head..self.dim_head * 2]);

        let (k, v, mask) = self.prepend_null_kv(k, v, mask);

        // Share the single key/value head across all query heads
        let k = k.unsqueeze_dim::<4>(1).repeat_dim(1, self.heads);
        let v = v.unsqueeze_dim::<4>(1).repeat_dim(1, self.heads);

        let (q, k) = if self.cosine_sim_attn {
            (l2norm(q) * COSINE_SIM_SCALE, l2norm(k))
        } else {
            (q * (self.dim_head as f64).powf(-0.5), k)
        };

        // [batch, heads, n_q, n_kv]
        let sim = q.matmul(k.transpose());

        let sim = match mask {
            Some(mask) => fill_masked_keys(sim, mask),
            None => sim,
        };
        let sim = if self.causal { fill_causal(sim) } else { sim };

        let attn = stable_softmax(sim, 3);
        let out = attn.matmul(v);

        // [b, heads, n_q, dim] -> [b, n_q, heads*dim]
        let out = out
            .swap_dims(1, 2)
            .reshape([batch, n_q, self.heads * self.dim_head]);

        self.to_out.forward(out)
    }

    /// Prepend the null key/values and pad the mask to match
    fn prepend_null_kv(
        &self,
        k: Tensor<B, 3>,
        v: Tensor<B, 3>,
        mask: Option<Tensor<B, 2, Bool>>,
    ) -> (Tensor<B, 3>, Tensor<B, 3>, Option<Tensor<B, 2, Bool>>) {
        let Some(null_kv) = &self.null_kv else {
            return (k, v, mask);
        };

        let [batch, _, _] = k.dims();
        let null_kv = null_kv.val();
        let [_, num_null_kv, dim_head] = null_kv.dims();

        let null_k = null_kv
            .clone()
            .slice([0..1, 0..num_null_kv, 0..dim_head])
            .repeat_dim(0, batch);
        let null_v = null_kv
            .slice([1..2, 0..num_null_kv, 0..dim_head])
            .repeat_dim(0, batch);

        let k = Tensor::cat(vec![null_k, k], 1);
        let v = Tensor::cat(vec![null_v, v], 1);

        let mask = mask.map(|mask| {
            let null_valid = Tensor::<B, 2, Int>::ones([batch, num_null_kv], &mask.device()).bool();
            Tensor::cat(vec![null_valid, mask], 1)
        });

        (k, v, mask)
    }
}
