//! Numeric utilities shared by the calibration engine.
//!
//! These are pure functions over explicit sequences; none of them keep
//! state. The special-function implementations (log-gamma, incomplete
//! gamma, erf) follow the series/continued-fraction forms from
//! Numerical Recipes, 2nd ed.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};

/// Explicit "log of zero probability" sentinel.
///
/// Large and negative but finite, so that differences of two log
/// probabilities never produce a NaN inside the acceptance arithmetic.
pub const LOG_ZERO: f64 = -1.0e300;

/// Threshold below which a probability mass or weight is treated as zero.
pub const CLOSE_TO_ZERO: f64 = 1.0e-12;

/// Relative factor for the minimum standard deviation of a parameter;
/// components at or below `MIN_STDDEV_FRACTION * range` are treated as
/// fixed by the prior.
pub const MIN_STDDEV_FRACTION: f64 = 1.0e-6;

/// Variance floor applied to covariance diagonals so downstream
/// standard-error computations never divide by zero.
const MIN_VARIANCE: f64 = 1.0e-32;

/// Compare two floats for equality within a few machine epsilons,
/// relative to their magnitude.
pub fn is_equal_to(d1: f64, d2: f64) -> bool {
    let scale = d1.abs().max(d2.abs()).max(1.0);
    (d1 - d2).abs() <= 4.0 * f64::EPSILON * scale
}

/// Per-component range `max - min`.
pub fn calc_range(min: &[f64], max: &[f64]) -> Vec<f64> {
    min.iter().zip(max).map(|(lo, hi)| hi - lo).collect()
}

/// Minimum standard deviation per component: a small fraction of the
/// component's range.
pub fn calc_min_stddev(min: &[f64], max: &[f64]) -> Vec<f64> {
    calc_range(min, max)
        .into_iter()
        .map(|r| MIN_STDDEV_FRACTION * r)
        .collect()
}

/// Column averages of a sample matrix (rows are observations).
///
/// Returns an empty array for an empty sample.
pub fn calc_averages(m: ArrayView2<f64>) -> Array1<f64> {
    if m.nrows() == 0 {
        return Array1::zeros(0);
    }
    m.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(0))
}

/// Sample covariance matrix (division by the sample size, matching the
/// population estimator used by the stop criterion).
///
/// Diagonal entries are floored at a tiny positive value so that
/// standard errors derived from them are always well defined.
pub fn calc_covariances(m: ArrayView2<f64>, avg: ArrayView1<f64>) -> Array2<f64> {
    let num = m.nrows();
    let size = m.ncols();
    if num == 0 {
        return Array2::zeros((0, 0));
    }
    assert_eq!(avg.len(), size, "average length must match column count");

    let mut covmat: Array2<f64> = Array2::zeros((size, size));
    for row in m.outer_iter() {
        for k in 0..size {
            let dk = row[k] - avg[k];
            for j in k..size {
                covmat[[j, k]] += (row[j] - avg[j]) * dk;
            }
        }
    }
    for k in 0..size {
        for j in k..size {
            covmat[[j, k]] /= num as f64;
            if j == k && covmat[[j, j]].abs() < MIN_VARIANCE {
                covmat[[j, j]] = MIN_VARIANCE;
            }
            covmat[[k, j]] = covmat[[j, k]];
        }
    }
    covmat
}

/// Logarithm of the gamma function (Lanczos approximation).
pub fn log_gamma(xx: f64) -> f64 {
    const COF: [f64; 6] = [
        76.180_091_729_471_46,
        -86.505_320_329_416_77,
        24.014_098_240_830_91,
        -1.231_739_572_450_155,
        0.120_865_097_386_617_9e-2,
        -0.539_523_938_495_3e-5,
    ];
    const STP: f64 = 2.506_628_274_631_000_5;

    let mut x = xx - 1.0;
    let mut tmp = x + 5.5;
    tmp = (x + 0.5) * tmp.ln() - tmp;

    let mut ser = 1.000_000_000_190_015;
    for c in COF {
        x += 1.0;
        ser += c / x;
    }
    tmp + (STP * ser).ln()
}

/// Incomplete gamma by its series representation; valid for `x < a + 1`.
fn gamma_series(a: f64, x: f64) -> f64 {
    debug_assert!(x >= 0.0);
    if x == 0.0 {
        return 0.0;
    }
    let gln = log_gamma(a);
    let mut ap = a;
    let mut del = 1.0 / a;
    let mut sum = del;
    for _ in 1..100 {
        ap += 1.0;
        del *= x / ap;
        sum += del;
        if del.abs() < sum.abs() * 3.0e-7 {
            break;
        }
    }
    sum * (-x + a * x.ln() - gln).exp()
}

/// Complement of the incomplete gamma by its continued-fraction
/// representation; valid for `x >= a + 1`.
fn gamma_continued_fraction(a: f64, x: f64) -> f64 {
    let gln = log_gamma(a);
    let mut b = x + 1.0 - a;
    let mut c = 1.0 / 1.0e-30;
    let mut d = 1.0 / b;
    let mut h = d;
    for i in 1..101 {
        let an = -(i as f64) * (i as f64 - a);
        b += 2.0;
        d = an * d + b;
        if d.abs() < 1.0e-30 {
            d = 1.0e-30;
        }
        c = b + an / c;
        if c.abs() < 1.0e-30 {
            c = 1.0e-30;
        }
        d = 1.0 / d;
        let del = d * c;
        h *= del;
        if (del - 1.0).abs() < 3.0e-7 {
            break;
        }
    }
    (-x + a * x.ln() - gln).exp() * h
}

/// Regularised lower incomplete gamma function `P(a, x)`.
pub fn gammp(a: f64, x: f64) -> f64 {
    if x < 0.0 || a <= 0.0 {
        return f64::NAN;
    }
    if x < a + 1.0 {
        gamma_series(a, x)
    } else {
        1.0 - gamma_continued_fraction(a, x)
    }
}

/// Error function, `erf(x) = 2/sqrt(pi) * int_0^x exp(-t^2) dt`.
pub fn erf(x: f64) -> f64 {
    let g = gammp(0.5, x * x);
    if x < 0.0 {
        -g
    } else {
        g
    }
}

/// Cumulative standard-normal probability.
pub fn cnp(x: f64) -> f64 {
    (erf(x / f64::sqrt(2.0)) + 1.0) / 2.0
}

/// Log density of a (possibly truncated) normal distribution.
///
/// When `min`/`max` bounds are supplied the normalisation constant is
/// adapted so the density integrates to one on the truncated support.
/// `x` is assumed to lie inside the bounds.
pub fn log_prob_normal(x: f64, mean: f64, var: f64, min: Option<f64>, max: Option<f64>) -> f64 {
    debug_assert!(var > 0.0);
    let sd = var.sqrt();
    let quad = -0.5 * (x - mean) * (x - mean) / var;
    let norm = -0.5 * (2.0 * std::f64::consts::PI * var).ln();

    let mut tpr = 1.0;
    if let Some(lo) = min {
        tpr -= cnp((lo - mean) / sd);
    }
    if let Some(hi) = max {
        tpr -= 1.0 - cnp((hi - mean) / sd);
    }
    if tpr <= 0.0 {
        return LOG_ZERO;
    }
    quad + norm - tpr.ln()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    #[test]
    fn test_averages_and_covariances() {
        let m = arr2(&[[1.0, 2.0], [3.0, 6.0]]);
        let avg = calc_averages(m.view());
        assert!((avg[0] - 2.0).abs() < 1e-12);
        assert!((avg[1] - 4.0).abs() < 1e-12);

        let cov = calc_covariances(m.view(), avg.view());
        // Population covariance: var(x) = 1, var(y) = 4, cov(x, y) = 2
        assert!((cov[[0, 0]] - 1.0).abs() < 1e-12);
        assert!((cov[[1, 1]] - 4.0).abs() < 1e-12);
        assert!((cov[[0, 1]] - 2.0).abs() < 1e-12);
        assert!((cov[[1, 0]] - cov[[0, 1]]).abs() < 1e-15);
    }

    #[test]
    fn test_covariance_diagonal_floor() {
        let m = arr2(&[[5.0], [5.0], [5.0]]);
        let avg = calc_averages(m.view());
        let cov = calc_covariances(m.view(), avg.view());
        assert!(cov[[0, 0]] > 0.0, "degenerate variance must be floored");
    }

    #[test]
    fn test_erf_and_cnp() {
        assert!(erf(0.0).abs() < 1e-12);
        assert!((erf(1.0) - 0.8427007929).abs() < 1e-6);
        assert!((cnp(0.0) - 0.5).abs() < 1e-9);
        assert!((cnp(1.0) - 0.8413447461).abs() < 1e-6);
        assert!((cnp(-1.0) + cnp(1.0) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_gammp_known_values() {
        // P(1, x) = 1 - exp(-x)
        for &x in &[0.1, 0.5, 1.0, 2.0, 5.0] {
            assert!((gammp(1.0, x) - (1.0 - (-x).exp())).abs() < 1e-7);
        }
        // Chi-square with df degrees of freedom at its mean is near 0.5
        let df = 30.0;
        let p = gammp(df / 2.0, df / 2.0);
        assert!((p - 0.5).abs() < 0.05);
    }

    #[test]
    fn test_log_prob_normal_matches_analytic() {
        let (m, var) = (0.3, 0.04);
        let lp = log_prob_normal(0.5, m, var, None, None);
        let analytic =
            (-0.5 * (0.5 - m) * (0.5 - m) / var).exp() / (2.0 * std::f64::consts::PI * var).sqrt();
        assert!((lp.exp() - analytic).abs() < 1e-9);
    }

    #[test]
    fn test_log_prob_normal_truncation_increases_density() {
        let free = log_prob_normal(0.5, 0.5, 1.0, None, None);
        let truncated = log_prob_normal(0.5, 0.5, 1.0, Some(0.0), Some(1.0));
        assert!(truncated > free);
    }

    #[test]
    fn test_min_stddev_scales_with_range() {
        let ms = calc_min_stddev(&[0.0, -1.0], &[10.0, 1.0]);
        assert!((ms[0] - 10.0 * MIN_STDDEV_FRACTION).abs() < 1e-15);
        assert!((ms[1] - 2.0 * MIN_STDDEV_FRACTION).abs() < 1e-15);
    }
}
