//! Pre-norm feed-forward network used between resampler attention layers

use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::gelu;
use serde::{Deserialize, Serialize};

use crate::layernorm::LayerNorm;

/// Configuration for FeedForward
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedForwardConfig {
    /// Input/output dimension
    pub dim: usize,
    /// Hidden dimension multiplier
    pub mult: usize,
}

impl FeedForwardConfig {
    /// Creates a new config
    pub fn new(dim: usize, mult: usize) -> Self {
        Self { dim, mult }
    }

    /// Initializes the FeedForward module
    pub fn init<B: Backend>(&self, device: &B::Device) -> FeedForward<B> {
        let hidden_dim = self.dim * self.mult;

        FeedForward {
            norm_in: LayerNorm::new(self.dim, device),
            proj_in: LinearConfig::new(self.dim, hidden_dim).with_bias(false).init(device),
            norm_hidden: LayerNorm::new(hidden_dim, device),
            proj_out: LinearConfig::new(hidden_dim, self.dim).with_bias(false).init(device),
        }
    }
}

/// Feed-forward network with GELU activation
///
/// # Architecture
///
/// ```text
/// output = proj_out(norm_hidden(GELU(proj_in(norm_in(x)))))
/// ```
#[derive(Module, Debug)]
pub struct FeedForward<B: Backend> {
    pub norm_in: LayerNorm<B>,
    pub proj_in: Linear<B>,
    pub norm_hidden: LayerNorm<B>,
    pub proj_out: Linear<B>,
}

impl<B: Backend> FeedForward<B> {
    /// Forward pass through the FFN
    ///
    /// # Arguments
    ///
    /// * `x` - Input tensor of shape `[batch, seq_len, dim]`
    ///
    /// # Returns
    ///
    /// Output tensor with same shape as input
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let hidden = self.proj_in.forward(self.norm_in.forward(x));
        let hidden = self.norm_hidden.forward(gelu(hidden));
        self.proj_out.forward(hidden)
    }
}
