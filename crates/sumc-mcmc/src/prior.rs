//! Prior densities over the parameter space.
//!
//! Two prior models are available: independent marginal distributions
//! per continuous component (with a configurable shape each), and a
//! single multivariate Gaussian over the whole continuous block.
//! Discrete components always contribute through interpolated relative
//! weight tables, regardless of the continuous model.
//!
//! All densities are returned as (unnormalised) logs; impossible values
//! map to the [`LOG_ZERO`] sentinel rather than `-inf` so that
//! acceptance-ratio arithmetic stays NaN-free.

use nalgebra::{Cholesky, DMatrix, DVector};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use sumc_core::numeric::{log_prob_normal, CLOSE_TO_ZERO, LOG_ZERO, MIN_STDDEV_FRACTION};
use sumc_core::params::{ParameterPrior, SamplingBounds};
use sumc_core::{SumcError, SumcResult};

/// Shape of the marginal prior for one continuous parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarginalDistributionType {
    /// Truncated normal centred on the most likely value.
    Normal,
    /// Log-normal with its mode at the most likely value.
    LogNormalFromMode,
    /// Log-normal with its median at the most likely value.
    LogNormalFromMedian,
    /// Triangular between the bounds, peaked at the most likely value.
    Triangular,
    /// Flat inside the bounds.
    Uniform,
}

/// Interpolated log weight of a discrete parameter value.
///
/// The weight table is stretched over the active sampling sub-range
/// `low..=high`. A value between two table entries receives the linear
/// interpolation of their weights; weights at or below the zero
/// threshold map to [`LOG_ZERO`]. `bin` is the width of one weight bin
/// on the parameter's full range; a sub-range narrower than one bin
/// contributes nothing, freezing the parameter for the run.
pub fn calc_log_weight(x: f64, low: f64, high: f64, bin: f64, weights: &[f64]) -> f64 {
    if weights.len() < 2 || high <= low {
        // A single admissible value carries no information.
        return 0.0;
    }
    if high - low < bin {
        return 0.0;
    }
    let rel = (x - low) / (high - low) * (weights.len() - 1) as f64;
    let rel = rel.clamp(0.0, (weights.len() - 1) as f64);
    let i = rel.floor() as usize;
    let w = if i + 1 < weights.len() {
        let frac = rel - i as f64;
        (1.0 - frac) * weights[i] + frac * weights[i + 1]
    } else {
        weights[i]
    };
    if w <= CLOSE_TO_ZERO {
        LOG_ZERO
    } else {
        w.ln()
    }
}

/// Independent marginal priors over the ordinal block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarginalPrior {
    types: Vec<MarginalDistributionType>,
    low: Vec<f64>,
    high: Vec<f64>,
    mode: Vec<f64>,
    variance: Vec<f64>,
    base_low: Vec<f64>,
    base_high: Vec<f64>,
    dis_weights: Vec<Vec<f64>>,
    n_con: usize,
}

impl MarginalPrior {
    /// Build marginal priors from the parameter description, sampling
    /// box and one shape per continuous component.
    pub fn new(
        prior: &ParameterPrior,
        bounds: &SamplingBounds,
        types: Vec<MarginalDistributionType>,
    ) -> SumcResult<Self> {
        if types.len() != prior.size_con() {
            return Err(SumcError::DimensionMismatch {
                context: "marginal distribution types".to_string(),
                expected: prior.size_con(),
                actual: types.len(),
            });
        }
        let variance = (0..prior.size_con())
            .map(|i| prior.covariance()[[i, i]])
            .collect();
        Ok(MarginalPrior {
            types,
            low: bounds.low().to_vec(),
            high: bounds.high().to_vec(),
            mode: prior.most_likely().to_vec(),
            variance,
            base_low: prior.low().to_vec(),
            base_high: prior.high().to_vec(),
            dis_weights: prior.dis_weights().to_vec(),
            n_con: prior.size_con(),
        })
    }

    /// Log prior density of an ordinal parameter vector.
    ///
    /// Components frozen by the sampling box contribute nothing; as
    /// soon as one component is impossible the sentinel is returned.
    pub fn calc_log_prior(&self, p: &[f64]) -> f64 {
        debug_assert_eq!(p.len(), self.low.len());
        let mut log_p = 0.0;
        for i in 0..p.len() {
            if self.high[i] - self.low[i] <= 0.0 {
                continue;
            }
            let term = if i < self.n_con {
                self.log_marginal(i, p[i])
            } else {
                let weights = &self.dis_weights[i - self.n_con];
                let bin = (self.base_high[i] - self.base_low[i])
                    / (weights.len().max(2) - 1) as f64;
                calc_log_weight(p[i], self.low[i], self.high[i], bin, weights)
            };
            if term <= LOG_ZERO {
                return LOG_ZERO;
            }
            log_p += term;
        }
        log_p
    }

    fn log_marginal(&self, i: usize, x: f64) -> f64 {
        let (low, high, mode, var) = (self.low[i], self.high[i], self.mode[i], self.variance[i]);
        // A parameter fixed by its prior cannot influence acceptance.
        let min_sd = MIN_STDDEV_FRACTION * (self.base_high[i] - self.base_low[i]);
        if var.sqrt() <= min_sd {
            return 0.0;
        }
        match self.types[i] {
            MarginalDistributionType::Uniform => 0.0,
            MarginalDistributionType::Normal => {
                log_prob_normal(x, mode, var, Some(low), Some(high))
            }
            MarginalDistributionType::Triangular => log_triangular(x, low, high, mode),
            MarginalDistributionType::LogNormalFromMode => {
                // Shift the support so the distribution lives on (low, inf).
                let y = x - low;
                let m = mode - low;
                if y <= 0.0 || m <= 0.0 {
                    return LOG_ZERO;
                }
                let s2 = lognormal_s2_from_mode(var / (m * m));
                let mu = m.ln() + s2;
                log_lognormal(y, mu, s2)
            }
            MarginalDistributionType::LogNormalFromMedian => {
                let y = x - low;
                let med = mode - low;
                if y <= 0.0 || med <= 0.0 {
                    return LOG_ZERO;
                }
                let u = 0.5 * (1.0 + (1.0 + 4.0 * var / (med * med)).sqrt());
                let s2 = u.ln();
                log_lognormal(y, med.ln(), s2)
            }
        }
    }

    /// Snap the discrete block of a proposal to admissible values: the
    /// nearest integer, clamped into the sampling box.
    pub fn correct_for_dis_bounds(&self, p: &mut [f64]) {
        for i in self.n_con..p.len() {
            p[i] = p[i].round().clamp(self.low[i], self.high[i]);
        }
    }
}

fn log_lognormal(y: f64, mu: f64, s2: f64) -> f64 {
    if s2 <= 0.0 {
        return LOG_ZERO;
    }
    let d = y.ln() - mu;
    -y.ln() - 0.5 * s2.ln() - 0.5 * (2.0 * std::f64::consts::PI).ln() - 0.5 * d * d / s2
}

/// Solve `(e^s - 1) e^(3s) = r` for `s = sigma^2` with a few Newton
/// iterations; `r` is the variance over the squared (shifted) mode.
fn lognormal_s2_from_mode(r: f64) -> f64 {
    let mut s = (1.0 + r).ln() / 4.0;
    for _ in 0..5 {
        let e = s.exp();
        let g = (e - 1.0) * (3.0 * s).exp() - r;
        let dg = (3.0 * s).exp() * (4.0 * e - 3.0);
        if dg <= 0.0 {
            break;
        }
        s = (s - g / dg).max(1.0e-12);
    }
    s
}

fn log_triangular(x: f64, low: f64, high: f64, mode: f64) -> f64 {
    if x <= low || x >= high {
        return LOG_ZERO;
    }
    let range = high - low;
    let dens = if x < mode {
        2.0 * (x - low) / (range * (mode - low))
    } else if x > mode {
        2.0 * (high - x) / (range * (high - mode))
    } else {
        2.0 / range
    };
    if dens <= 0.0 {
        LOG_ZERO
    } else {
        dens.ln()
    }
}

/// Multivariate Gaussian prior over the continuous block, truncated to
/// the sampling box by rejection.
#[derive(Debug, Clone)]
pub struct MvNormalPrior {
    mean: DVector<f64>,
    chol: Cholesky<f64, nalgebra::Dyn>,
    log_norm: f64,
}

impl MvNormalPrior {
    /// Build from the prior mean and covariance of the continuous
    /// block. Fails if the covariance is not positive definite.
    pub fn new(prior: &ParameterPrior) -> SumcResult<Self> {
        let n = prior.size_con();
        let mean = DVector::from_iterator(n, prior.most_likely()[..n].iter().copied());
        let mut cov = DMatrix::zeros(n, n);
        for i in 0..n {
            for j in 0..n {
                cov[(i, j)] = prior.covariance()[[i, j]];
            }
            // Fixed parameters get a tiny ridge so the factorisation
            // still succeeds.
            if cov[(i, i)] <= 0.0 {
                cov[(i, i)] = 1.0e-12;
            }
        }
        let chol = Cholesky::new(cov.clone()).ok_or_else(|| {
            SumcError::InvalidValue(
                "prior covariance matrix is not positive definite".to_string(),
            )
        })?;
        let log_det = 2.0 * chol.l().diagonal().iter().map(|d| d.ln()).sum::<f64>();
        let log_norm = -0.5 * (n as f64 * (2.0 * std::f64::consts::PI).ln() + log_det);
        Ok(MvNormalPrior {
            mean,
            chol,
            log_norm,
        })
    }

    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    /// Log density of the continuous block `p_con`.
    pub fn log_density(&self, p_con: &[f64]) -> f64 {
        debug_assert_eq!(p_con.len(), self.dim());
        let d = DVector::from_iterator(self.dim(), p_con.iter().copied()) - &self.mean;
        let z = self.chol.l_dirty().solve_lower_triangular(&d);
        match z {
            Some(z) => self.log_norm - 0.5 * z.norm_squared(),
            None => LOG_ZERO,
        }
    }

    /// Draw a sample inside `bounds` (continuous block only) by
    /// rejection, falling back to a uniform draw from the box when
    /// too few proposals land inside.
    pub fn sample_bounded(&self, rng: &mut ChaCha8Rng, bounds: &SamplingBounds) -> Vec<f64> {
        const MAX_TRIALS: usize = 100;
        let n = self.dim();
        let l = self.chol.l();
        for _ in 0..MAX_TRIALS {
            let z = DVector::from_iterator(n, (0..n).map(|_| sample_standard_normal(rng)));
            let x = &self.mean + &l * z;
            let candidate: Vec<f64> = x.iter().copied().collect();
            if (0..n).all(|i| candidate[i] >= bounds.low()[i] && candidate[i] <= bounds.high()[i]) {
                return candidate;
            }
        }
        (0..n)
            .map(|i| rng.gen_range(bounds.low()[i]..=bounds.high()[i]))
            .collect()
    }
}

/// Standard normal draw by Box-Muller; avoids pulling in a separate
/// distributions crate for a single density.
fn sample_standard_normal(rng: &mut ChaCha8Rng) -> f64 {
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}
