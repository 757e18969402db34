//! Proposal generation for the Markov chains.
//!
//! Random-walk proposals draw each non-frozen component uniformly from
//! a truncated window around the current value; tornado proposals
//! perturb one component at a time, cycling through both directions of
//! every component. Step sizes are owned by the chains and adapted here
//! from their running acceptance rates.

use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use sumc_core::params::{ParameterPrior, SamplingBounds};

/// Acceptance rate (percent) below which steps shrink.
pub const MIN_ACCEPTANCE_RATE: f64 = 23.0;
/// Acceptance rate (percent) above which steps grow.
pub const MAX_ACCEPTANCE_RATE: f64 = 44.0;

const GROW_FACTOR: f64 = 1.25;
const SHRINK_FACTOR: f64 = 0.8;

/// Proposal generator over a fixed sampling box.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepProposer {
    bounds: SamplingBounds,
}

impl StepProposer {
    pub fn new(bounds: SamplingBounds) -> Self {
        StepProposer { bounds }
    }

    pub fn bounds(&self) -> &SamplingBounds {
        &self.bounds
    }

    /// Initial step size per component: a quarter of the prior standard
    /// deviation, shrunk with the dimension so multi-component steps
    /// keep a reasonable acceptance rate. Frozen components get zero.
    pub fn initial_step_size(prior: &ParameterPrior, bounds: &SamplingBounds) -> Vec<f64> {
        let n = bounds.len().max(1);
        let scale = 0.25 / (n as f64).sqrt();
        (0..bounds.len())
            .map(|i| {
                if bounds.is_frozen(i) {
                    return 0.0;
                }
                let sigma = if i < prior.size_con() {
                    prior.covariance()[[i, i]].sqrt()
                } else {
                    // Uniform spread over the discrete range.
                    bounds.range(i) / 12.0_f64.sqrt()
                };
                (scale * sigma).min(0.5 * bounds.range(i))
            })
            .collect()
    }

    /// Number of tornado steps in a full sweep: both directions of
    /// every component.
    pub fn tornado_sweep_len(&self) -> usize {
        2 * self.bounds.len()
    }

    /// Random-walk proposal: every non-frozen component is redrawn
    /// uniformly from its step window truncated to the sampling box.
    ///
    /// Returns the candidate and the log transition-probability ratio
    /// `ln q(new -> old) - ln q(old -> new)`, which is nonzero exactly
    /// when the truncation is asymmetric between the two points.
    pub fn propose_random(&self, rng: &mut ChaCha8Rng, p: &[f64], dp: &[f64]) -> (Vec<f64>, f64) {
        debug_assert_eq!(p.len(), dp.len());
        let mut candidate = p.to_vec();
        let mut log_trans_ratio = 0.0;
        for i in 0..p.len() {
            if dp[i] <= 0.0 || self.bounds.is_frozen(i) {
                continue;
            }
            let lo = (p[i] - dp[i]).max(self.bounds.low()[i]);
            let hi = (p[i] + dp[i]).min(self.bounds.high()[i]);
            let fwd_len = hi - lo;
            if fwd_len <= 0.0 {
                continue;
            }
            let x = rng.gen_range(lo..=hi);
            candidate[i] = x;
            let bwd_len = (x + dp[i]).min(self.bounds.high()[i]) - (x - dp[i]).max(self.bounds.low()[i]);
            log_trans_ratio += fwd_len.ln() - bwd_len.ln();
        }
        (candidate, log_trans_ratio)
    }

    /// Tornado proposal: perturb a single component in one direction,
    /// clamped to the sampling box. `step` indexes the sweep; even
    /// steps push up, odd steps push down.
    ///
    /// Returns `None` when the clamped move would not change the point.
    pub fn propose_tornado(&self, p: &[f64], step: usize, dp: &[f64]) -> Option<Vec<f64>> {
        debug_assert_eq!(p.len(), dp.len());
        let i = (step % self.tornado_sweep_len()) / 2;
        if dp[i] <= 0.0 || self.bounds.is_frozen(i) {
            return None;
        }
        let delta = if step % 2 == 0 { dp[i] } else { -dp[i] };
        let x = (p[i] + delta).clamp(self.bounds.low()[i], self.bounds.high()[i]);
        if x == p[i] {
            return None;
        }
        let mut candidate = p.to_vec();
        candidate[i] = x;
        Some(candidate)
    }

    /// Adapt step sizes from a chain's acceptance rate (in percent):
    /// grow on high acceptance, shrink on low, and keep every step
    /// inside half the component range.
    pub fn adapt_step_size(&self, dp: &mut [f64], acceptance_rate: f64) {
        let factor = if acceptance_rate > MAX_ACCEPTANCE_RATE {
            GROW_FACTOR
        } else if acceptance_rate < MIN_ACCEPTANCE_RATE {
            SHRINK_FACTOR
        } else {
            return;
        };
        for (i, d) in dp.iter_mut().enumerate() {
            if *d > 0.0 {
                *d = (*d * factor).min(0.5 * self.bounds.range(i));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn proposer() -> StepProposer {
        let prior = ParameterPrior::new(2, vec![0.0, 0.0], vec![1.0, 2.0], vec![]).unwrap();
        StepProposer::new(SamplingBounds::full(&prior))
    }

    #[test]
    fn test_initial_step_size_scales_with_dimension() {
        let prior = ParameterPrior::new(2, vec![0.0, 0.0], vec![1.0, 2.0], vec![]).unwrap();
        let bounds = SamplingBounds::full(&prior);
        let dp = StepProposer::initial_step_size(&prior, &bounds);
        // sigma = range / sqrt(12), scaled by 0.25 / sqrt(2)
        let expected0 = 0.25 / 2.0_f64.sqrt() * (1.0 / 12.0_f64.sqrt());
        assert!((dp[0] - expected0).abs() < 1e-12);
        assert!((dp[1] - 2.0 * expected0).abs() < 1e-12);
    }

    #[test]
    fn test_initial_step_size_zero_for_frozen() {
        let prior = ParameterPrior::new(2, vec![0.0, 0.5], vec![1.0, 0.5], vec![]).unwrap();
        let bounds = SamplingBounds::full(&prior);
        let dp = StepProposer::initial_step_size(&prior, &bounds);
        assert!(dp[0] > 0.0);
        assert_eq!(dp[1], 0.0);
    }

    #[test]
    fn test_random_proposal_stays_in_bounds() {
        let proposer = proposer();
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let dp = vec![0.3, 0.3];
        let mut p = vec![0.05, 1.95];
        for _ in 0..100 {
            let (candidate, _) = proposer.propose_random(&mut rng, &p, &dp);
            assert!(proposer.bounds().contains(&candidate));
            p = candidate;
        }
    }

    #[test]
    fn test_interior_proposal_is_symmetric() {
        let proposer = proposer();
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        // Step windows that never touch the bounds
        let dp = vec![0.1, 0.1];
        let p = vec![0.5, 1.0];
        for _ in 0..20 {
            let (candidate, log_ratio) = proposer.propose_random(&mut rng, &p, &dp);
            assert!(log_ratio.abs() < 1e-12, "ratio {} for {:?}", log_ratio, candidate);
        }
    }

    #[test]
    fn test_truncated_proposal_has_nonzero_ratio() {
        let proposer = proposer();
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        // At the lower corner the forward window is halved
        let dp = vec![0.4, 0.0];
        let p = vec![0.0, 1.0];
        let mut saw_nonzero = false;
        for _ in 0..50 {
            let (candidate, log_ratio) = proposer.propose_random(&mut rng, &p, &dp);
            if candidate[0] > 1e-6 {
                // Backward window is wider than the truncated forward one
                assert!(log_ratio < 0.0);
                saw_nonzero = true;
            }
        }
        assert!(saw_nonzero);
    }

    #[test]
    fn test_tornado_sweep_covers_both_directions() {
        let proposer = proposer();
        let dp = vec![0.1, 0.1];
        let p = vec![0.5, 1.0];
        assert_eq!(proposer.tornado_sweep_len(), 4);
        let up0 = proposer.propose_tornado(&p, 0, &dp).unwrap();
        let down0 = proposer.propose_tornado(&p, 1, &dp).unwrap();
        let up1 = proposer.propose_tornado(&p, 2, &dp).unwrap();
        let down1 = proposer.propose_tornado(&p, 3, &dp).unwrap();
        assert!((up0[0] - 0.6).abs() < 1e-12 && up0[1] == 1.0);
        assert!((down0[0] - 0.4).abs() < 1e-12);
        assert!((up1[1] - 1.1).abs() < 1e-12 && up1[0] == 0.5);
        assert!((down1[1] - 0.9).abs() < 1e-12);
    }

    #[test]
    fn test_tornado_at_bound_returns_none() {
        let proposer = proposer();
        let dp = vec![0.1, 0.1];
        // Already at the upper bound of the first component
        let p = vec![1.0, 1.0];
        assert!(proposer.propose_tornado(&p, 0, &dp).is_none());
        assert!(proposer.propose_tornado(&p, 1, &dp).is_some());
    }

    #[test]
    fn test_step_adaptation_bands() {
        let proposer = proposer();
        let mut dp = vec![0.1, 0.1];
        proposer.adapt_step_size(&mut dp, 50.0);
        assert!((dp[0] - 0.125).abs() < 1e-12);
        proposer.adapt_step_size(&mut dp, 10.0);
        assert!((dp[0] - 0.1).abs() < 1e-12);
        proposer.adapt_step_size(&mut dp, 30.0);
        assert!((dp[0] - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_step_adaptation_caps_at_half_range() {
        let proposer = proposer();
        let mut dp = vec![0.45, 0.9];
        proposer.adapt_step_size(&mut dp, 60.0);
        assert!((dp[0] - 0.5).abs() < 1e-12);
        assert!((dp[1] - 1.0).abs() < 1e-12);
    }
}
