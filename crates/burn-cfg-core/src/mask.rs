//! Probability masks for conditioning dropout
//!
//! During training a fraction of examples has its conditioning removed so the
//! model also learns an unconditioned prediction. These helpers produce the
//! per-example drop flags and fold them into attention key masks.

use burn::prelude::*;
use burn::tensor::{Bool, Distribution, Int};

/// Boolean mask where each element is `true` with probability `prob`
///
/// `prob == 1` and `prob == 0` are deterministic and do not touch the random
/// source. `prob` outside `[0, 1]` is not checked.
///
/// # Arguments
///
/// * `shape` - Shape of the mask
/// * `prob` - Probability of each element being `true`
/// * `device` - Device to create the mask on
pub fn prob_mask_like<B: Backend, const D: usize>(
    shape: [usize; D],
    prob: f64,
    device: &B::Device,
) -> Tensor<B, D, Bool> {
    if prob == 1.0 {
        Tensor::<B, D, Int>::ones(shape, device).bool()
    } else if prob == 0.0 {
        Tensor::<B, D, Int>::zeros(shape, device).bool()
    } else {
        Tensor::<B, D>::random(shape, Distribution::Uniform(0.0, 1.0), device).lower_elem(prob)
    }
}

/// Key mask with conditioning removed for randomly dropped examples
///
/// Draws one drop flag per example and clears every key position of the
/// dropped examples. Fed to [`CrossAttention`](crate::attention::CrossAttention)
/// with null key/values enabled, dropped examples attend only to the null
/// slots.
///
/// # Arguments
///
/// * `mask` - Existing key mask `[batch, seq_len]` (`true` = valid), or `None`
/// * `batch` - Batch size
/// * `seq_len` - Number of key positions
/// * `cond_drop_prob` - Probability of dropping an example's conditioning
/// * `device` - Device to create the mask on
///
/// # Returns
///
/// Key mask of shape `[batch, seq_len]`
pub fn cond_drop_key_mask<B: Backend>(
    mask: Option<Tensor<B, 2, Bool>>,
    batch: usize,
    seq_len: usize,
    cond_drop_prob: f64,
    device: &B::Device,
) -> Tensor<B, 2, Bool> {
    let mask = match mask {
        Some(m) => {
            assert_eq!(m.dims(), [batch, seq_len], "key mask must be [batch, seq_len]");
            m
        }
        None => Tensor::<B, 2, Int>::ones([batch, seq_len], device).bool(),
    };

    if cond_drop_prob == 0.0 {
        return mask;
    }

    let keep = prob_mask_like::<B, 1>([batch], cond_drop_prob, device)
        .bool_not()
        .int()
        .reshape([batch, 1])
        .repeat_dim(1, seq_len);

    (mask.int() * keep).bool()
}
