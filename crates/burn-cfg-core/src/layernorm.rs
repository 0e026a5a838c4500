//! Feature-axis normalization shared by the attention, feed-forward and
//! resampler blocks

use burn::module::Param;
use burn::prelude::*;

/// Learnable feature normalization
///
/// Each token's feature vector is centred and divided by its spread, then
/// scaled by `weight` and shifted by `bias`:
///
/// ```text
/// y = (x - mean) / sqrt(var + eps) * weight + bias
/// ```
///
/// `var` is the biased (population) variance.
#[derive(Module, Debug)]
pub struct LayerNorm<B: Backend> {
    pub weight: Param<Tensor<B, 1>>,
    pub bias: Param<Tensor<B, 1>>,
    pub eps: f64,
}

impl<B: Backend> LayerNorm<B> {
    /// Identity-initialized norm over `size` features
    pub fn new(size: usize, device: &B::Device) -> Self {
        Self {
            weight: Param::from_tensor(Tensor::ones([size], device)),
            bias: Param::from_tensor(Tensor::zeros([size], device)),
            eps: 1e-5,
        }
    }

    /// Normalizes the last axis of `x`, keeping its shape
    pub fn forward<const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        let last_dim = D - 1;
        let mean = x.clone().mean_dim(last_dim);
        let var = x.clone().var_bias(last_dim);

        let x_norm = (x - mean) / (var + self.eps).sqrt();

        x_norm * self.weight.val().unsqueeze() + self.bias.val().unsqueeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_layernorm_zero_mean_unit_var() {
        let device = Default::default();
        let norm = LayerNorm::<TestBackend>::new(4, &device);

        let x = Tensor::<TestBackend, 3>::from_floats([[[1.0, 2.0, 3.0, 4.0]]], &device);
        let out: Vec<f32> = norm.forward(x).into_data().to_vec().unwrap();

        let mean: f32 = out.iter().sum::<f32>() / 4.0;
        let var: f32 = out.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / 4.0;

        assert!(mean.abs() < 1e-5);
        assert!((var - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_layernorm_applies_weight_and_bias() {
        let device = Default::default();
        let mut norm = LayerNorm::<TestBackend>::new(2, &device);
        norm.weight = Param::from_tensor(Tensor::from_floats([2.0, 2.0], &device));
        norm.bias = Param::from_tensor(Tensor::from_floats([0.5, -0.5], &device));

        // Normalized row is [-1, 1]
        let x = Tensor::<TestBackend, 2>::from_floats([[3.0, 5.0]], &device);
        let out: Vec<f32> = norm.forward(x).into_data().to_vec().unwrap();

        assert!((out[0] + 1.5).abs() < 1e-3);
        assert!((out[1] - 1.5).abs() < 1e-3);
    }
}
