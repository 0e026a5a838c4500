//! Classifier-free guidance wrapper
//!
//! [`ClassifierFreeGuidance`] turns a conditioned forward into a guided
//! forward without touching the forward's body. The forward must accept the
//! conditioning-dropout probability; a callable without it cannot be
//! wrapped:
//!
//! ```compile_fail
//! use burn_cfg_guidance::{ClassifierFreeGuidance, GuidanceConfig};
//!
//! let guided = ClassifierFreeGuidance::new(
//!     |strength: f32| Ok::<f32, std::convert::Infallible>(strength),
//!     GuidanceConfig::default(),
//! );
//! ```
//!
//! With the parameter present:
//!
//! ```
//! use burn_cfg_guidance::{ClassifierFreeGuidance, GuidanceConfig};
//!
//! let guided = ClassifierFreeGuidance::new(
//!     |strength: f32, cond_drop_prob: f64| {
//!         Ok::<f32, std::convert::Infallible>(strength * (1.0 - cond_drop_prob as f32))
//!     },
//!     GuidanceConfig::new(3.0),
//! )
//! .unwrap();
//!
//! assert_eq!(guided.forward(2.0).unwrap(), 6.0);
//! ```

use std::marker::PhantomData;

use burn::prelude::*;
use burn::tensor::ElementConversion;
use serde::{Deserialize, Serialize};

use crate::error::GuidanceError;

/// Name of the conditioning-dropout parameter of a guided forward
pub const COND_DROP_KEY_NAME: &str = "__cond_drop_prob";

/// A forward pass that accepts a conditioning-dropout probability
///
/// `cond_drop_prob` is in `[0, 1]`: `0` keeps all conditioning, `1` drops
/// it for every example. Implemented for any closure
/// `Fn(A, f64) -> Result<O, E>`.
pub trait ConditionedForward<A> {
    type Output;
    type Error;

    fn forward(&self, args: A, cond_drop_prob: f64) -> Result<Self::Output, Self::Error>;
}

impl<A, O, E, F> ConditionedForward<A> for F
where
    F: Fn(A, f64) -> Result<O, E>,
{
    type Output = O;
    type Error = E;

    fn forward(&self, args: A, cond_drop_prob: f64) -> Result<O, E> {
        self(args, cond_drop_prob)
    }
}

/// Outputs that can be combined under guidance
pub trait Guidable: Sized + Clone {
    /// `null_logits + (logits - null_logits) * cond_scale`
    fn extrapolate(logits: Self, null_logits: Self, cond_scale: f64) -> Self;

    /// Pull the guided output's spread back toward the conditioned output's
    ///
    /// No-op unless overridden.
    fn rescale(guided: Self, _logits: &Self, _guidance_rescale: f64) -> Self {
        guided
    }
}

impl Guidable for f32 {
    fn extrapolate(logits: Self, null_logits: Self, cond_scale: f64) -> Self {
        null_logits + (logits - null_logits) * cond_scale as f32
    }
}

impl Guidable for f64 {
    fn extrapolate(logits: Self, null_logits: Self, cond_scale: f64) -> Self {
        null_logits + (logits - null_logits) * cond_scale
    }
}

impl<B: Backend, const D: usize> Guidable for Tensor<B, D> {
    fn extrapolate(logits: Self, null_logits: Self, cond_scale: f64) -> Self {
        null_logits.clone() + (logits - null_logits) * cond_scale
    }

    fn rescale(guided: Self, logits: &Self, guidance_rescale: f64) -> Self {
        if guidance_rescale <= 0.0 {
            return guided;
        }

        let std_cond = compute_tensor_std(logits);
        let std_guided = compute_tensor_std(&guided);

        if std_guided > 1e-6 {
            let factor = std_cond / std_guided * guidance_rescale + (1.0 - guidance_rescale);
            guided * factor
        } else {
            guided
        }
    }
}

/// Compute standard deviation over every element of a tensor
///
/// Used for guidance rescaling to prevent over-saturation.
pub fn compute_tensor_std<B: Backend, const D: usize>(tensor: &Tensor<B, D>) -> f64 {
    tensor
        .clone()
        .flatten::<1>(0, D - 1)
        .var(0)
        .sqrt()
        .into_scalar()
        .elem::<f64>()
}

fn default_cond_scale() -> f64 {
    3.0
}

/// Configuration for classifier-free guidance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuidanceConfig {
    /// Guidance scale; `<= 1` disables the unconditioned pass
    #[serde(default = "default_cond_scale")]
    pub cond_scale: f64,
    /// Guidance rescale factor (0.0 = standard CFG, 0.7 = recommended)
    #[serde(default)]
    pub guidance_rescale: f64,
}

impl Default for GuidanceConfig {
    fn default() -> Self {
        Self {
            cond_scale: default_cond_scale(),
            guidance_rescale: 0.0,
        }
    }
}

impl GuidanceConfig {
    pub fn new(cond_scale: f64) -> Self {
        Self {
            cond_scale,
            ..Self::default()
        }
    }

    pub fn with_guidance_rescale(mut self, guidance_rescale: f64) -> Self {
        self.guidance_rescale = guidance_rescale;
        self
    }

    /// Check scales are finite and in range
    pub fn validate(&self) -> Result<(), GuidanceError> {
        if !self.cond_scale.is_finite() || self.cond_scale < 0.0 {
            return Err(GuidanceError::InvalidScale {
                name: "cond_scale",
                value: self.cond_scale,
                expected: "a finite value >= 0",
            });
        }
        if !(0.0..=1.0).contains(&self.guidance_rescale) {
            return Err(GuidanceError::InvalidScale {
                name: "guidance_rescale",
                value: self.guidance_rescale,
                expected: "a value in [0, 1]",
            });
        }
        Ok(())
    }
}

/// Guided wrapper around a conditioned forward
///
/// Each [`forward`](Self::forward) runs the wrapped forward once with
/// conditioning kept and, when `cond_scale > 1`, once more with conditioning
/// dropped. Errors from the wrapped forward are returned unchanged.
pub struct ClassifierFreeGuidance<F, A> {
    forward_fn: F,
    config: GuidanceConfig,
    _args: PhantomData<fn(A)>,
}

impl<F, A> ClassifierFreeGuidance<F, A>
where
    F: ConditionedForward<A>,
{
    /// Wraps `forward_fn`
    ///
    /// # Errors
    ///
    /// [`GuidanceError::InvalidScale`] if the config is out of range.
    pub fn new(forward_fn: F, config: GuidanceConfig) -> Result<Self, GuidanceError> {
        config.validate()?;

        tracing::debug!(
            cond_scale = config.cond_scale,
            guidance_rescale = config.guidance_rescale,
            "wrapping forward with classifier-free guidance"
        );
        if config.cond_scale <= 1.0 {
            tracing::warn!(
                cond_scale = config.cond_scale,
                "cond_scale <= 1, guidance disabled"
            );
        }

        Ok(Self {
            forward_fn,
            config,
            _args: PhantomData,
        })
    }

    pub fn config(&self) -> &GuidanceConfig {
        &self.config
    }

    /// Unwraps the conditioned forward
    pub fn into_inner(self) -> F {
        self.forward_fn
    }

    /// Calls the wrapped forward directly with an explicit drop probability
    ///
    /// This is the training path: `cond_drop_prob` is typically small (0.1-0.2).
    pub fn forward_with_cond_drop(
        &self,
        args: A,
        cond_drop_prob: f64,
    ) -> Result<F::Output, F::Error> {
        self.forward_fn.forward(args, cond_drop_prob)
    }

    /// Guided forward with the configured scale
    pub fn forward(&self, args: A) -> Result<F::Output, F::Error>
    where
        A: Clone,
        F::Output: Guidable,
    {
        self.forward_with_scale(args, self.config.cond_scale)
    }

    /// Guided forward with a per-call scale
    ///
    /// # Panics
    ///
    /// If `cond_scale` is negative or not finite.
    pub fn forward_with_scale(&self, args: A, cond_scale: f64) -> Result<F::Output, F::Error>
    where
        A: Clone,
        F::Output: Guidable,
    {
        assert!(
            cond_scale.is_finite() && cond_scale >= 0.0,
            "cond_scale must be finite and >= 0, got {cond_scale}"
        );

        if cond_scale <= 1.0 {
            tracing::trace!(cond_scale, "guided forward: conditioned pass only");
            return self.forward_fn.forward(args, 0.0);
        }

        let logits = self.forward_fn.forward(args.clone(), 0.0)?;
        let null_logits = self.forward_fn.forward(args, 1.0)?;

        tracing::trace!(cond_scale, "guided forward: conditioned and unconditioned passes");

        let rescale = self.config.guidance_rescale;
        if rescale > 0.0 {
            let guided = <F::Output as Guidable>::extrapolate(logits.clone(), null_logits, cond_scale);
            Ok(<F::Output as Guidable>::rescale(guided, &logits, rescale))
        } else {
            Ok(<F::Output as Guidable>::extrapolate(logits, null_logits, cond_scale))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;
    use std::cell::Cell;
    use std::convert::Infallible;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_guidance_config_default() {
        let config = GuidanceConfig::default();
        assert_eq!(config.cond_scale, 3.0);
        assert_eq!(config.guidance_rescale, 0.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_scales_rejected() {
        assert!(GuidanceConfig::new(-1.0).validate().is_err());
        assert!(GuidanceConfig::new(f64::NAN).validate().is_err());
        assert!(GuidanceConfig::new(2.0)
            .with_guidance_rescale(1.5)
            .validate()
            .is_err());

        let err = ClassifierFreeGuidance::new(
            |x: f32, _p: f64| Ok::<f32, Infallible>(x),
            GuidanceConfig::new(-0.5),
        )
        .err()
        .unwrap();
        assert!(matches!(err, GuidanceError::InvalidScale { name: "cond_scale", .. }));
    }

    #[test]
    fn test_toy_scalar_guidance() {
        let guided = ClassifierFreeGuidance::new(
            |strength: f32, cond_drop_prob: f64| {
                Ok::<f32, Infallible>(strength * (1.0 - cond_drop_prob as f32))
            },
            GuidanceConfig::new(3.0),
        )
        .unwrap();

        assert_eq!(guided.forward_with_cond_drop(1.5, 0.0).unwrap(), 1.5);
        assert_eq!(guided.forward_with_cond_drop(1.5, 1.0).unwrap(), 0.0);
        assert_eq!(guided.forward(1.5).unwrap(), 4.5);
    }

    #[test]
    fn test_scale_at_most_one_calls_once() {
        let calls = Cell::new(0);
        let seen = Cell::new(-1.0);
        let guided = ClassifierFreeGuidance::new(
            |x: f64, p: f64| {
                calls.set(calls.get() + 1);
                seen.set(p);
                Ok::<f64, Infallible>(x + p)
            },
            GuidanceConfig::new(1.0),
        )
        .unwrap();

        assert_eq!(guided.forward(2.0).unwrap(), 2.0);
        assert_eq!(calls.get(), 1);
        assert_eq!(seen.get(), 0.0);

        assert_eq!(guided.forward_with_scale(2.0, 0.25).unwrap(), 2.0);
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_scale_above_one_calls_twice() {
        let probs = std::cell::RefCell::new(Vec::new());
        let guided = ClassifierFreeGuidance::new(
            |x: f64, p: f64| {
                probs.borrow_mut().push(p);
                Ok::<f64, Infallible>(if p == 0.0 { x } else { 1.0 })
            },
            GuidanceConfig::new(4.0),
        )
        .unwrap();

        // null = 1, cond = 3: 1 + (3 - 1) * 4
        assert_eq!(guided.forward(3.0).unwrap(), 9.0);
        assert_eq!(*probs.borrow(), vec![0.0, 1.0]);
    }

    #[test]
    #[should_panic(expected = "cond_scale must be finite")]
    fn test_negative_call_scale_panics() {
        let guided = ClassifierFreeGuidance::new(
            |x: f32, _p: f64| Ok::<f32, Infallible>(x),
            GuidanceConfig::new(3.0),
        )
        .unwrap();

        let _ = guided.forward_with_scale(2.0, -2.0);
    }

    #[test]
    #[should_panic(expected = "cond_scale must be finite")]
    fn test_nan_call_scale_panics() {
        let guided = ClassifierFreeGuidance::new(
            |x: f32, _p: f64| Ok::<f32, Infallible>(x),
            GuidanceConfig::new(3.0),
        )
        .unwrap();

        let _ = guided.forward_with_scale(2.0, f64::NAN);
    }

    #[test]
    fn test_tensor_extrapolate() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 2>::from_floats([[1.0, 2.0], [3.0, 4.0]], &device);
        let null = Tensor::<TestBackend, 2>::from_floats([[0.0, 1.0], [1.0, 1.0]], &device);

        let guided: Vec<f32> = Guidable::extrapolate(logits, null, 2.0)
            .into_data()
            .to_vec()
            .unwrap();
        assert_eq!(guided, vec![2.0, 3.0, 5.0, 7.0]);
    }

    #[test]
    fn test_tensor_rescale_matches_conditioned_std() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 1>::from_floats([1.0, -1.0, 1.0, -1.0], &device);
        let guided = logits.clone() * 5.0;

        let rescaled = Guidable::rescale(guided, &logits, 1.0);
        let std = compute_tensor_std(&rescaled);
        let std_cond = compute_tensor_std(&logits);

        assert!((std - std_cond).abs() < 1e-5);
    }

    #[test]
    fn test_rescale_zero_is_noop() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 1>::from_floats([1.0, 2.0], &device);
        let guided = Tensor::<TestBackend, 1>::from_floats([7.0, -3.0], &device);

        let out: Vec<f32> = Guidable::rescale(guided, &logits, 0.0)
            .into_data()
            .to_vec()
            .unwrap();
        assert_eq!(out, vec![7.0, -3.0]);
    }
}
