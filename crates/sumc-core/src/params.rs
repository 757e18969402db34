//! Parameter-space description: prior ranges, shapes and weights for
//! continuous, discrete and categorical parameters.
//!
//! A parameter vector is laid out as the ordinal block (continuous
//! components followed by discrete components) with categorical
//! parameters carried separately and dummy-encoded only when a proxy
//! case is assembled.

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::errors::{SumcError, SumcResult};
use crate::numeric::{calc_min_stddev, is_equal_to};

/// Prior description of the full parameter space.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterPrior {
    /// Lower bound of the physically admissible range, ordinal block.
    low: Vec<f64>,
    /// Upper bound of the physically admissible range, ordinal block.
    high: Vec<f64>,
    /// Most likely value per ordinal component (prior mode).
    most_likely: Vec<f64>,
    /// Prior covariance of the continuous block.
    covariance: Array2<f64>,
    /// Standard deviation below which a component counts as fixed.
    min_stddev: Vec<f64>,
    /// Relative weights over the admissible values of each discrete
    /// parameter, one table per discrete component.
    dis_weights: Vec<Vec<f64>>,
    /// Admissible values per categorical parameter.
    cat_values: Vec<Vec<usize>>,
    /// Relative weights matching `cat_values`.
    cat_weights: Vec<Vec<f64>>,
    /// Number of continuous components.
    n_con: usize,
    /// Number of discrete components.
    n_dis: usize,
}

impl ParameterPrior {
    /// Build a prior over `n_con` continuous and `n_dis` discrete
    /// components with bounds `low`/`high` on the ordinal block.
    ///
    /// The mode defaults to the midpoint of each range and the
    /// covariance to that of independent uniform distributions
    /// (variance `range^2 / 12`). Discrete and categorical weight
    /// tables default to flat.
    pub fn new(
        n_con: usize,
        low: Vec<f64>,
        high: Vec<f64>,
        cat_values: Vec<Vec<usize>>,
    ) -> SumcResult<Self> {
        let size_ord = low.len();
        if high.len() != size_ord {
            return Err(SumcError::DimensionMismatch {
                context: "prior bounds".to_string(),
                expected: size_ord,
                actual: high.len(),
            });
        }
        if n_con > size_ord {
            return Err(SumcError::InvalidValue(format!(
                "continuous count {} exceeds ordinal dimension {}",
                n_con, size_ord
            )));
        }
        for (i, (lo, hi)) in low.iter().zip(&high).enumerate() {
            if lo > hi {
                return Err(SumcError::InvalidValue(format!(
                    "empty range for parameter {}: [{}, {}]",
                    i, lo, hi
                )));
            }
        }
        let n_dis = size_ord - n_con;

        let most_likely: Vec<f64> = low.iter().zip(&high).map(|(lo, hi)| 0.5 * (lo + hi)).collect();
        let mut covariance = Array2::zeros((n_con, n_con));
        for i in 0..n_con {
            let range = high[i] - low[i];
            covariance[[i, i]] = range * range / 12.0;
        }
        let dis_weights = (0..n_dis)
            .map(|i| {
                let k = n_con + i;
                // Discrete values are the integers inside the range.
                let count = ((high[k] - low[k]).round() as usize) + 1;
                vec![1.0; count]
            })
            .collect();
        let cat_weights = cat_values.iter().map(|vals| vec![1.0; vals.len()]).collect();

        let min_stddev = calc_min_stddev(&low, &high);
        let prior = ParameterPrior {
            low,
            high,
            most_likely,
            covariance,
            min_stddev,
            dis_weights,
            cat_values,
            cat_weights,
            n_con,
            n_dis,
        };
        prior.validate()?;
        Ok(prior)
    }

    /// Override the prior mode per ordinal component.
    pub fn set_most_likely(&mut self, most_likely: Vec<f64>) -> SumcResult<()> {
        if most_likely.len() != self.size_ord() {
            return Err(SumcError::DimensionMismatch {
                context: "most likely values".to_string(),
                expected: self.size_ord(),
                actual: most_likely.len(),
            });
        }
        for (i, ml) in most_likely.iter().enumerate() {
            if *ml < self.low[i] || *ml > self.high[i] {
                return Err(SumcError::InvalidValue(format!(
                    "most likely value {} outside range for parameter {}",
                    ml, i
                )));
            }
        }
        self.most_likely = most_likely;
        Ok(())
    }

    /// Override the covariance of the continuous block.
    pub fn set_covariance(&mut self, covariance: Array2<f64>) -> SumcResult<()> {
        if covariance.nrows() != self.n_con || covariance.ncols() != self.n_con {
            return Err(SumcError::DimensionMismatch {
                context: "prior covariance".to_string(),
                expected: self.n_con,
                actual: covariance.nrows(),
            });
        }
        self.covariance = covariance;
        self.validate()
    }

    /// Override the relative weight table of one discrete parameter.
    pub fn set_dis_weights(&mut self, index: usize, weights: Vec<f64>) -> SumcResult<()> {
        if index >= self.n_dis {
            return Err(SumcError::InvalidValue(format!(
                "discrete parameter index {} out of range",
                index
            )));
        }
        if weights.len() != self.dis_weights[index].len() {
            return Err(SumcError::DimensionMismatch {
                context: "discrete weights".to_string(),
                expected: self.dis_weights[index].len(),
                actual: weights.len(),
            });
        }
        check_weights(&weights)?;
        self.dis_weights[index] = weights;
        Ok(())
    }

    /// Override the relative weight table of one categorical parameter.
    pub fn set_cat_weights(&mut self, index: usize, weights: Vec<f64>) -> SumcResult<()> {
        if index >= self.cat_values.len() {
            return Err(SumcError::InvalidValue(format!(
                "categorical parameter index {} out of range",
                index
            )));
        }
        if weights.len() != self.cat_values[index].len() {
            return Err(SumcError::DimensionMismatch {
                context: "categorical weights".to_string(),
                expected: self.cat_values[index].len(),
                actual: weights.len(),
            });
        }
        check_weights(&weights)?;
        self.cat_weights[index] = weights;
        Ok(())
    }

    fn validate(&self) -> SumcResult<()> {
        let cov = &self.covariance;
        for i in 0..self.n_con {
            // Zero variance is allowed: it marks a fixed parameter.
            if cov[[i, i]] < 0.0 {
                return Err(SumcError::InvalidValue(format!(
                    "negative prior variance for parameter {}",
                    i
                )));
            }
        }
        for i in 0..self.n_con {
            for j in (i + 1)..self.n_con {
                let diff = (cov[[i, j]] - cov[[j, i]]).abs();
                let scale = cov[[i, j]].abs().max(cov[[j, i]].abs()).max(1.0);
                if diff > 1.0e-6 * scale {
                    return Err(SumcError::InvalidValue(
                        "prior covariance matrix is not symmetric".to_string(),
                    ));
                }
                if cov[[i, i]] > 0.0 && cov[[j, j]] > 0.0 {
                    let rho = cov[[i, j]] / (cov[[i, i]] * cov[[j, j]]).sqrt();
                    if rho.abs() > 1.0 + 1.0e-9 {
                        return Err(SumcError::InvalidValue(format!(
                            "prior correlation between parameters {} and {} exceeds 1",
                            i, j
                        )));
                    }
                }
            }
        }
        for weights in self.dis_weights.iter().chain(&self.cat_weights) {
            check_weights(weights)?;
        }
        Ok(())
    }

    pub fn size_con(&self) -> usize {
        self.n_con
    }

    pub fn size_dis(&self) -> usize {
        self.n_dis
    }

    pub fn size_ord(&self) -> usize {
        self.n_con + self.n_dis
    }

    pub fn size_cat(&self) -> usize {
        self.cat_values.len()
    }

    pub fn low(&self) -> &[f64] {
        &self.low
    }

    pub fn high(&self) -> &[f64] {
        &self.high
    }

    pub fn most_likely(&self) -> &[f64] {
        &self.most_likely
    }

    pub fn covariance(&self) -> &Array2<f64> {
        &self.covariance
    }

    pub fn min_stddev(&self) -> &[f64] {
        &self.min_stddev
    }

    pub fn dis_weights(&self) -> &[Vec<f64>] {
        &self.dis_weights
    }

    pub fn cat_values(&self) -> &[Vec<usize>] {
        &self.cat_values
    }

    pub fn cat_weights(&self) -> &[Vec<f64>] {
        &self.cat_weights
    }

    /// Whether component `i` of the ordinal block is effectively fixed
    /// by its prior standard deviation.
    pub fn is_fixed(&self, i: usize) -> bool {
        if i < self.n_con {
            self.covariance[[i, i]].sqrt() <= self.min_stddev[i]
        } else {
            is_equal_to(self.low[i], self.high[i])
        }
    }

    /// Mean of the prior, taken as the most likely point.
    pub fn mean(&self) -> Array1<f64> {
        Array1::from_vec(self.most_likely.clone())
    }

    /// Length of a proxy case: ordinal components plus one dummy per
    /// non-reference categorical value.
    pub fn proxy_case_len(&self) -> usize {
        let dummies: usize = self
            .cat_values
            .iter()
            .map(|v| v.len().saturating_sub(1))
            .sum();
        self.size_ord() + dummies
    }

    /// Assemble a proxy case from ordinal values and categorical
    /// choices: the ordinal block followed by a one-hot dummy block
    /// where the first admissible value of each categorical parameter
    /// is the all-zero reference.
    pub fn extend_to_proxy_case(&self, p_ord: &[f64], cats: &[usize]) -> SumcResult<Vec<f64>> {
        if p_ord.len() != self.size_ord() {
            return Err(SumcError::DimensionMismatch {
                context: "proxy case ordinal block".to_string(),
                expected: self.size_ord(),
                actual: p_ord.len(),
            });
        }
        if cats.len() != self.size_cat() {
            return Err(SumcError::DimensionMismatch {
                context: "proxy case categorical values".to_string(),
                expected: self.size_cat(),
                actual: cats.len(),
            });
        }
        let mut case = Vec::with_capacity(self.proxy_case_len());
        case.extend_from_slice(p_ord);
        for (values, &cat) in self.cat_values.iter().zip(cats) {
            let pos = values.iter().position(|&v| v == cat).ok_or_else(|| {
                SumcError::InvalidValue(format!("categorical value {} not admissible", cat))
            })?;
            for k in 1..values.len() {
                case.push(if k == pos { 1.0 } else { 0.0 });
            }
        }
        Ok(case)
    }
}

fn check_weights(weights: &[f64]) -> SumcResult<()> {
    if weights.iter().any(|w| *w < 0.0) {
        return Err(SumcError::InvalidValue(
            "negative relative weight".to_string(),
        ));
    }
    if weights.iter().sum::<f64>() <= 0.0 {
        return Err(SumcError::InvalidValue(
            "weight table sums to zero".to_string(),
        ));
    }
    Ok(())
}

/// Sampling box, a sub-range of the prior's admissible range inside
/// which all proposals are confined.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingBounds {
    low: Vec<f64>,
    high: Vec<f64>,
}

impl SamplingBounds {
    /// Build sampling bounds, clamped to the prior's admissible range.
    pub fn new(prior: &ParameterPrior, low: Vec<f64>, high: Vec<f64>) -> SumcResult<Self> {
        if low.len() != prior.size_ord() || high.len() != prior.size_ord() {
            return Err(SumcError::DimensionMismatch {
                context: "sampling bounds".to_string(),
                expected: prior.size_ord(),
                actual: low.len().max(high.len()),
            });
        }
        let mut low = low;
        let mut high = high;
        for i in 0..low.len() {
            low[i] = low[i].max(prior.low()[i]);
            high[i] = high[i].min(prior.high()[i]);
            if low[i] > high[i] {
                return Err(SumcError::InvalidValue(format!(
                    "empty sampling range for parameter {}",
                    i
                )));
            }
        }
        Ok(SamplingBounds { low, high })
    }

    /// The full admissible range of the prior.
    pub fn full(prior: &ParameterPrior) -> Self {
        SamplingBounds {
            low: prior.low().to_vec(),
            high: prior.high().to_vec(),
        }
    }

    pub fn low(&self) -> &[f64] {
        &self.low
    }

    pub fn high(&self) -> &[f64] {
        &self.high
    }

    pub fn len(&self) -> usize {
        self.low.len()
    }

    pub fn is_empty(&self) -> bool {
        self.low.is_empty()
    }

    pub fn range(&self, i: usize) -> f64 {
        self.high[i] - self.low[i]
    }

    /// Whether component `i` is frozen by the sampling box.
    pub fn is_frozen(&self, i: usize) -> bool {
        is_equal_to(self.low[i], self.high[i])
    }

    /// Clamp a point into the box.
    pub fn clamp(&self, p: &mut [f64]) {
        for (i, x) in p.iter_mut().enumerate() {
            *x = x.clamp(self.low[i], self.high[i]);
        }
    }

    pub fn contains(&self, p: &[f64]) -> bool {
        p.iter()
            .enumerate()
            .all(|(i, x)| *x >= self.low[i] && *x <= self.high[i])
    }
}
