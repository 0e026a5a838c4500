//! Classifier-Free Guidance
//!
//! Wraps a conditioned forward pass so that each call runs the model with
//! conditioning kept and with conditioning dropped, then extrapolates away
//! from the unconditioned prediction:
//!
//! ```text
//! guided = null_logits + (logits - null_logits) * cond_scale
//! ```
//!
//! The wrapped forward takes the conditioning-dropout probability as an
//! explicit argument (see [`ConditionedForward`]). The same forward is used
//! during training with a small drop probability, so the model learns the
//! unconditioned prediction guidance relies on.
//!
//! # Example
//!
//! ```ignore
//! use burn_cfg_guidance::{ClassifierFreeGuidance, GuidanceConfig};
//!
//! let guided = ClassifierFreeGuidance::new(
//!     |(x, text): (Tensor<B, 3>, Tensor<B, 3>), cond_drop_prob: f64| {
//!         model.forward(x, text, cond_drop_prob)
//!     },
//!     GuidanceConfig::new(5.0),
//! )?;
//!
//! let logits = guided.forward((x, text))?;
//! ```

pub mod error;
pub mod guidance;

pub use error::GuidanceError;
pub use guidance::{
    compute_tensor_std, ClassifierFreeGuidance, ConditionedForward, Guidable, GuidanceConfig,
    COND_DROP_KEY_NAME,
};
