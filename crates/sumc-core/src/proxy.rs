//! Cheap response-surface abstraction evaluated by the sampler.
//!
//! A [`ResponseProxy`] stands in for one observable of an expensive
//! simulator. The sampler interrogates proxies millions of times, so
//! implementations are expected to be cheap polynomial or Kriging
//! evaluations rather than full model runs.

use serde::{Deserialize, Serialize};

use crate::errors::SumcResult;

/// Which Kriging correction is applied on top of the polynomial trend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KrigingType {
    /// Polynomial trend only.
    None,
    /// Short-range correction from nearby design points.
    Local,
    /// Correction using all design points.
    Global,
}

/// Precomputed interpolation weights for one sample point, reusable
/// across proxies built on the same experimental design.
#[derive(Debug, Clone, Default)]
pub struct KrigingWeights {
    /// Weight per design point (empty when Kriging is disabled).
    pub weights: Vec<f64>,
    /// Sum of the weights, cached for normalisation.
    pub sum_of_weights: f64,
}

impl KrigingWeights {
    pub fn new(weights: Vec<f64>) -> Self {
        let sum_of_weights = weights.iter().sum();
        KrigingWeights {
            weights,
            sum_of_weights,
        }
    }
}

/// A calibrated response surface for a single observable, with the
/// reference (measured) value and uncertainty it is compared against.
pub trait ResponseProxy {
    /// Dimension of the parameter vector the proxy accepts.
    fn size(&self) -> usize;

    /// Evaluate the proxy at `p` with the requested Kriging correction.
    fn proxy_value(&self, p: &[f64], kriging: KrigingType) -> SumcResult<f64>;

    /// Compute interpolation weights at `p` for reuse by
    /// [`ResponseProxy::proxy_value_with_weights`].
    fn kriging_weights(&self, p: &[f64], kriging: KrigingType) -> SumcResult<KrigingWeights>;

    /// Evaluate the proxy at `p` reusing precomputed weights.
    fn proxy_value_with_weights(
        &self,
        p: &[f64],
        weights: &KrigingWeights,
        kriging: KrigingType,
    ) -> SumcResult<f64>;

    /// Whether this observable participates in the likelihood.
    fn is_used(&self) -> bool {
        true
    }

    /// Measured value the proxy response is compared against.
    fn reference_value(&self) -> f64;

    /// Measurement standard deviation; must be positive for used
    /// observables.
    fn std_deviation(&self) -> f64;

    /// Mismatch between a response value and the reference, in units of
    /// the (possibly inflated) standard deviation.
    fn scaled_error(&self, value: f64, stddev_factor: f64) -> f64 {
        (value - self.reference_value()) / (stddev_factor * self.std_deviation())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct LinearProxy {
        coefs: Vec<f64>,
        reference: f64,
        stddev: f64,
    }

    impl ResponseProxy for LinearProxy {
        fn size(&self) -> usize {
            self.coefs.len()
        }

        fn proxy_value(&self, p: &[f64], _kriging: KrigingType) -> SumcResult<f64> {
            Ok(self.coefs.iter().zip(p).map(|(c, x)| c * x).sum())
        }

        fn kriging_weights(
            &self,
            _p: &[f64],
            _kriging: KrigingType,
        ) -> SumcResult<KrigingWeights> {
            Ok(KrigingWeights::default())
        }

        fn proxy_value_with_weights(
            &self,
            p: &[f64],
            _weights: &KrigingWeights,
            kriging: KrigingType,
        ) -> SumcResult<f64> {
            self.proxy_value(p, kriging)
        }

        fn reference_value(&self) -> f64 {
            self.reference
        }

        fn std_deviation(&self) -> f64 {
            self.stddev
        }
    }

    #[test]
    fn test_scaled_error_uses_stddev_factor() {
        let proxy = LinearProxy {
            coefs: vec![1.0, 1.0],
            reference: 1.0,
            stddev: 0.5,
        };
        let v = proxy.proxy_value(&[1.0, 1.0], KrigingType::None).unwrap();
        assert!((v - 2.0).abs() < 1e-12);
        assert!((proxy.scaled_error(v, 1.0) - 2.0).abs() < 1e-12);
        assert!((proxy.scaled_error(v, 2.0) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_kriging_weights_sum() {
        let w = KrigingWeights::new(vec![0.25, 0.5, 0.25]);
        assert!((w.sum_of_weights - 1.0).abs() < 1e-12);
    }
}
