//! Log likelihood of proxy responses against their reference values.

use serde::{Deserialize, Serialize};

use sumc_core::proxy::ResponseProxy;

/// Assumed distribution of the measurement errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MeasurementDistribution {
    /// Gaussian errors: quadratic penalty `-d^2 / 2`.
    Normal,
    /// Laplace (double exponential) errors: linear penalty
    /// `-sqrt(2) |d|`, less sensitive to outliers.
    Robust,
    /// Gaussian core with Laplace tails, switching where the two
    /// penalties coincide (`|d| = 2 sqrt(2)`).
    Mixed,
}

/// Scaled mismatch beyond which the mixed model switches from the
/// Gaussian core to the Laplace tail.
const MIXED_SWITCH: f64 = 2.0 * std::f64::consts::SQRT_2;

/// Contribution of a single scaled error `d` to the log likelihood.
fn log_likelihood_term(d: f64, distribution: MeasurementDistribution) -> f64 {
    let a = d.abs();
    match distribution {
        MeasurementDistribution::Normal => -0.5 * d * d,
        MeasurementDistribution::Robust => -std::f64::consts::SQRT_2 * a,
        MeasurementDistribution::Mixed => {
            if a < MIXED_SWITCH {
                -0.5 * d * d
            } else {
                // Both penalties equal -4 at the switch point, so the
                // mixed model is continuous.
                -std::f64::consts::SQRT_2 * a
            }
        }
    }
}

/// Log likelihood of the response vector `y` given the active
/// observables, their reference values and uncertainties.
///
/// Unused observables are skipped; `stddev_factor` inflates every
/// measurement standard deviation by a common factor.
pub fn log_likelihood<P: ResponseProxy>(
    proxies: &[P],
    y: &[f64],
    stddev_factor: f64,
    distribution: MeasurementDistribution,
) -> f64 {
    debug_assert_eq!(proxies.len(), y.len());
    proxies
        .iter()
        .zip(y)
        .filter(|(proxy, _)| proxy.is_used())
        .map(|(proxy, &v)| log_likelihood_term(proxy.scaled_error(v, stddev_factor), distribution))
        .sum()
}

/// Sum of squared scaled errors over the active observables, and the
/// number of observables that contributed.
pub fn sum_of_squared_errors<P: ResponseProxy>(
    proxies: &[P],
    y: &[f64],
    stddev_factor: f64,
) -> (f64, usize) {
    debug_assert_eq!(proxies.len(), y.len());
    let mut sum = 0.0;
    let mut used = 0;
    for (proxy, &v) in proxies.iter().zip(y) {
        if proxy.is_used() {
            let d = proxy.scaled_error(v, stddev_factor);
            sum += d * d;
            used += 1;
        }
    }
    (sum, used)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sumc_core::proxy::{KrigingType, KrigingWeights};
    use sumc_core::SumcResult;

    struct ConstProxy {
        value: f64,
        reference: f64,
        stddev: f64,
        used: bool,
    }

    impl ConstProxy {
        fn new(value: f64, reference: f64, stddev: f64) -> Self {
            ConstProxy {
                value,
                reference,
                stddev,
                used: true,
            }
        }
    }

    impl ResponseProxy for ConstProxy {
        fn size(&self) -> usize {
            1
        }

        fn proxy_value(&self, _p: &[f64], _kriging: KrigingType) -> SumcResult<f64> {
            Ok(self.value)
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
            _p: &[f64],
            _weights: &KrigingWeights,
            _kriging: KrigingType,
        ) -> SumcResult<f64> {
            Ok(self.value)
        }

        fn is_used(&self) -> bool {
            self.used
        }

        fn reference_value(&self) -> f64 {
            self.reference
        }

        fn std_deviation(&self) -> f64 {
            self.stddev
        }
    }

    #[test]
    fn test_perfect_match_has_zero_log_likelihood() {
        let proxies = vec![ConstProxy::new(1.0, 1.0, 0.1), ConstProxy::new(2.0, 2.0, 0.5)];
        let y = vec![1.0, 2.0];
        let lh = log_likelihood(&proxies, &y, 1.0, MeasurementDistribution::Normal);
        assert!(lh.abs() < 1e-12);
    }

    #[test]
    fn test_normal_penalty_is_quadratic() {
        let proxies = vec![ConstProxy::new(0.0, 0.0, 1.0)];
        // Mismatch of exactly 2 standard deviations
        let lh = log_likelihood(&proxies, &[2.0], 1.0, MeasurementDistribution::Normal);
        assert!((lh + 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_robust_penalty_is_linear() {
        let proxies = vec![ConstProxy::new(0.0, 0.0, 1.0)];
        let lh1 = log_likelihood(&proxies, &[1.0], 1.0, MeasurementDistribution::Robust);
        let lh2 = log_likelihood(&proxies, &[2.0], 1.0, MeasurementDistribution::Robust);
        assert!((lh2 - 2.0 * lh1).abs() < 1e-12);
    }

    #[test]
    fn test_mixed_matches_normal_in_the_core() {
        let proxies = vec![ConstProxy::new(0.0, 0.0, 1.0)];
        let n = log_likelihood(&proxies, &[1.5], 1.0, MeasurementDistribution::Normal);
        let m = log_likelihood(&proxies, &[1.5], 1.0, MeasurementDistribution::Mixed);
        assert!((n - m).abs() < 1e-12);
    }

    #[test]
    fn test_mixed_is_continuous_at_the_switch() {
        let proxies = vec![ConstProxy::new(0.0, 0.0, 1.0)];
        let just_below = MIXED_SWITCH - 1e-9;
        let just_above = MIXED_SWITCH + 1e-9;
        let below = log_likelihood(&proxies, &[just_below], 1.0, MeasurementDistribution::Mixed);
        let above = log_likelihood(&proxies, &[just_above], 1.0, MeasurementDistribution::Mixed);
        assert!((below - above).abs() < 1e-6);
    }

    #[test]
    fn test_unused_observables_are_skipped() {
        let mut skipped = ConstProxy::new(0.0, 10.0, 0.01);
        skipped.used = false;
        let proxies = vec![ConstProxy::new(1.0, 1.0, 0.1), skipped];
        let lh = log_likelihood(&proxies, &[1.0, 0.0], 1.0, MeasurementDistribution::Normal);
        assert!(lh.abs() < 1e-12);
        let (sum, used) = sum_of_squared_errors(&proxies, &[1.0, 0.0], 1.0);
        assert!(sum.abs() < 1e-12);
        assert_eq!(used, 1);
    }

    #[test]
    fn test_stddev_factor_softens_the_penalty() {
        let proxies = vec![ConstProxy::new(0.0, 0.0, 1.0)];
        let sharp = log_likelihood(&proxies, &[1.0], 1.0, MeasurementDistribution::Normal);
        let soft = log_likelihood(&proxies, &[1.0], 2.0, MeasurementDistribution::Normal);
        assert!(soft > sharp);
    }
}
