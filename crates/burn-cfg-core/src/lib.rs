//! Conditioning Building Blocks for Classifier-Free Guidance
//!
//! This crate provides the layers a conditioned generative model uses to
//! consume text (or any other sequence) conditioning, and the mask helpers
//! used to drop that conditioning during training.
//!
//! # Modules
//!
//! ## Masks
//!
//! - [`mask`] - Bernoulli masks and per-example conditioning dropout
//!
//! ## Attention
//!
//! - [`attention`] - Cross-attention with learned null key/values
//! - [`resampler`] - Perceiver resampler pooling a sequence into fixed latents
//!
//! ## Layers
//!
//! - [`layernorm`] - Layer normalization
//! - [`feed_forward`] - Pre-norm GELU feed-forward
//! - [`conditioner`] - Text conditioning injection point
//!
//! # Example
//!
//! ```ignore
//! use burn_cfg_core::resampler::PerceiverResamplerConfig;
//!
//! // Pool T5 token embeddings into 64 + 4 latents
//! let resampler = PerceiverResamplerConfig::new(768, 2).init::<Backend>(&device);
//! let latents = resampler.forward(text_embeds, Some(text_mask))?;
//! ```

pub mod attention;
pub mod conditioner;
pub mod error;
pub mod feed_forward;
pub mod layernorm;
pub mod mask;
pub mod resampler;

pub use attention::{CrossAttention, CrossAttentionConfig};
pub use conditioner::TextConditioner;
pub use error::CfgError;
pub use feed_forward::{FeedForward, FeedForwardConfig};
pub use layernorm::LayerNorm;
pub use mask::{cond_drop_key_mask, prob_mask_like};
pub use resampler::{PerceiverAttention, PerceiverResampler, PerceiverResamplerConfig};
