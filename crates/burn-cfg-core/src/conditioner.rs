//! Text conditioning injection point
//!
//! Model inputs pass through [`TextConditioner`] before the conditioned
//! forward. It currently returns its input unchanged.

/// Identity text conditioner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextConditioner {
    dim: usize,
}

impl TextConditioner {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Returns `x` unchanged
    pub fn forward<T>(&self, x: T) -> T {
        x
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::prelude::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_text_conditioner_is_identity() {
        let device = Default::default();
        let conditioner = TextConditioner::new(8);

        let x = Tensor::<TestBackend, 3>::from_floats([[[1.0, -2.0], [0.5, 3.0]]], &device);
        let out = conditioner.forward(x.clone());

        assert_eq!(conditioner.dim(), 8);
        let out: Vec<f32> = out.into_data().to_vec().unwrap();
        let x: Vec<f32> = x.into_data().to_vec().unwrap();
        assert_eq!(out, x);
    }
}
