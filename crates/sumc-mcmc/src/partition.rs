//! Partitioning of the chain population over categorical parameter
//! combinations.
//!
//! Each combination of categorical values gets its own group of chains,
//! sized proportionally to the combination's prior weight. Combinations
//! with (numerically) zero weight are excluded from sampling entirely.

use serde::{Deserialize, Serialize};

use sumc_core::numeric::CLOSE_TO_ZERO;
use sumc_core::params::ParameterPrior;

/// One combination of categorical parameter values, with its
/// normalised prior weight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatCombination {
    /// One admissible value per categorical parameter.
    pub values: Vec<usize>,
    /// Product of the normalised per-parameter weights.
    pub weight: f64,
}

/// Cartesian product of the admissible categorical values, each with
/// the product of its normalised weights.
///
/// With no categorical parameters this is a single empty combination
/// of weight one.
pub fn expand_cat_combinations(prior: &ParameterPrior) -> Vec<CatCombination> {
    let mut combos = vec![CatCombination {
        values: Vec::new(),
        weight: 1.0,
    }];
    for (values, weights) in prior.cat_values().iter().zip(prior.cat_weights()) {
        let total: f64 = weights.iter().sum();
        let mut next = Vec::with_capacity(combos.len() * values.len());
        for combo in &combos {
            for (&v, &w) in values.iter().zip(weights) {
                let mut extended = combo.values.clone();
                extended.push(v);
                next.push(CatCombination {
                    values: extended,
                    weight: combo.weight * w / total,
                });
            }
        }
        combos = next;
    }
    combos
}

/// Distribute `n_chains` chains over the categorical combinations,
/// proportionally to their weights.
///
/// Zero-weight combinations get no chains. Every surviving combination
/// gets at least one chain; the population is inflated by a small
/// factor so proportional counts round down gracefully, and the
/// per-combination minimum covers rare combinations. The returned
/// counts may therefore sum to slightly more than `n_chains`.
pub fn allocate_chains(prior: &ParameterPrior, n_chains: usize) -> Vec<(CatCombination, usize)> {
    const AUTOSCALE: f64 = 1.1;

    let combos: Vec<CatCombination> = expand_cat_combinations(prior)
        .into_iter()
        .filter(|c| c.weight > CLOSE_TO_ZERO)
        .collect();
    if combos.is_empty() {
        return Vec::new();
    }
    // Renormalise after dropping zero-weight combinations.
    let total: f64 = combos.iter().map(|c| c.weight).sum();
    let target = AUTOSCALE * n_chains as f64;

    combos
        .into_iter()
        .map(|mut c| {
            c.weight /= total;
            let count = ((target * c.weight).floor() as usize).max(1);
            (c, count)
        })
        .collect()
}
