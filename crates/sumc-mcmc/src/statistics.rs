//! Aggregate statistics over the current posterior sample.
//!
//! Holds the chi-square based goodness of fit and the sample moments
//! of both parameters and responses, with a per-categorical-combination
//! breakdown of the parameter moments.

use indexmap::IndexMap;
use ndarray::{Array1, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use sumc_core::numeric::{calc_averages, calc_covariances, gammp};

/// Parameter moments of one categorical sub-sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatStats {
    /// Number of sample points in the sub-sample.
    pub count: usize,
    pub p_avg: Array1<f64>,
    pub p_cov: Array2<f64>,
}

/// Sample statistics refreshed after every iteration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McmcStatistics {
    /// Mean sum of squared scaled errors per sample point.
    chi2: f64,
    /// Chi-square with the standard-deviation factor divided out.
    raw_chi2: f64,
    /// Chi-square per active observable.
    reduced_chi2: f64,
    /// Goodness of fit in percent; 50 for a perfectly calibrated model.
    gof: f64,
    p_avg: Array1<f64>,
    p_cov: Array2<f64>,
    y_avg: Array1<f64>,
    cat_stats: IndexMap<Vec<usize>, CatStats>,
}

impl McmcStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recompute all statistics from the current sample.
    ///
    /// `cat_of_sample` gives the categorical values of each sample row
    /// (empty vectors when there are no categorical parameters);
    /// `sum_squared_errors` is the total over the whole sample, scaled
    /// by `stddev_factor`, and `n_used` the number of active
    /// observables per point.
    pub fn update(
        &mut self,
        p_sample: ArrayView2<f64>,
        y_sample: ArrayView2<f64>,
        cat_of_sample: &[Vec<usize>],
        sum_squared_errors: f64,
        stddev_factor: f64,
        n_used: usize,
    ) {
        let sample_size = p_sample.nrows();
        debug_assert_eq!(cat_of_sample.len(), sample_size);

        self.chi2 = if sample_size > 0 {
            sum_squared_errors / sample_size as f64
        } else {
            0.0
        };
        self.raw_chi2 = self.chi2 * stddev_factor * stddev_factor;
        self.reduced_chi2 = if n_used > 0 {
            self.chi2 / n_used as f64
        } else {
            0.0
        };
        self.gof = if n_used > 0 {
            100.0 * (1.0 - gammp(0.5 * n_used as f64, 0.5 * self.chi2))
        } else {
            0.0
        };

        self.p_avg = calc_averages(p_sample);
        self.p_cov = calc_covariances(p_sample, self.p_avg.view());
        self.y_avg = calc_averages(y_sample);

        self.cat_stats.clear();
        let mut groups: IndexMap<Vec<usize>, Vec<usize>> = IndexMap::new();
        for (row, cats) in cat_of_sample.iter().enumerate() {
            groups.entry(cats.clone()).or_default().push(row);
        }
        for (cats, rows) in groups {
            let sub = p_sample.select(Axis(0), &rows);
            let avg = calc_averages(sub.view());
            let cov = calc_covariances(sub.view(), avg.view());
            self.cat_stats.insert(
                cats,
                CatStats {
                    count: rows.len(),
                    p_avg: avg,
                    p_cov: cov,
                },
            );
        }
    }

    pub fn chi2(&self) -> f64 {
        self.chi2
    }

    /// Chi-square as if the standard-deviation factor were one.
    pub fn raw_chi2(&self) -> f64 {
        self.raw_chi2
    }

    pub fn reduced_chi2(&self) -> f64 {
        self.reduced_chi2
    }

    /// Goodness of fit in percent.
    pub fn goodness_of_fit(&self) -> f64 {
        self.gof
    }

    pub fn p_avg(&self) -> &Array1<f64> {
        &self.p_avg
    }

    pub fn p_cov(&self) -> &Array2<f64> {
        &self.p_cov
    }

    pub fn y_avg(&self) -> &Array1<f64> {
        &self.y_avg
    }

    /// Per-categorical-combination parameter moments, in first-seen
    /// order of the combinations.
    pub fn cat_stats(&self) -> &IndexMap<Vec<usize>, CatStats> {
        &self.cat_stats
    }
}
