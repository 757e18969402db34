//! Multi-chain MCMC sampler over cheap response proxies.
//!
//! A population of short Markov chains explores the parameter space in
//! parallel. Every iteration each chain runs a fixed number of cycles,
//! each cycle a fixed number of steps, and contributes one sample point
//! per cycle; the aggregated sample drives the convergence test, the
//! step-size adaptation and the public statistics.
//!
//! Three step methods share this machinery: classic
//! Metropolis-Hastings, a greedy survival-of-the-fittest search that
//! ends in a tornado sweep per chain, and pure Monte Carlo sampling
//! from the prior.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use log::{debug, info};
use ndarray::{Array1, Array2};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use sumc_core::numeric::{is_equal_to, CLOSE_TO_ZERO};
use sumc_core::params::{ParameterPrior, SamplingBounds};
use sumc_core::proxy::{KrigingType, ResponseProxy};
use sumc_core::{SumcError, SumcResult};

use crate::likelihood::{self, MeasurementDistribution};
use crate::partition::{allocate_chains, CatCombination};
use crate::prior::{MarginalDistributionType, MarginalPrior, MvNormalPrior};
use crate::proposer::{StepProposer, MIN_ACCEPTANCE_RATE};
use crate::ranking::BestMatches;
use crate::statistics::McmcStatistics;

/// Iterations between convergence checks.
const ITER_MULTIPLE: usize = 10;
/// Cycles per chain per iteration; each cycle yields one sample point.
const NB_OF_CYCLES: usize = 5;
/// Steps per cycle, to decorrelate consecutive sample points.
const NB_OF_STEPS: usize = 5;
/// Random proposals per step before a chain gives up.
const MAX_RANDOM_TRIALS: usize = 10;
/// Confidence multiplier for the entropy and acceptance-ratio tests
/// (1.28 standard deviations give an 80% confidence interval).
const ENTROPY_LAMBDA: f64 = 1.28;

/// How proposals move through the parameter space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepMethod {
    /// Classic random-walk Metropolis-Hastings.
    MetropolisHastings,
    /// Greedy optimisation: only strictly better states are accepted,
    /// and exhausted chains fall back to tornado sweeps before
    /// terminating.
    SurvivalOfTheFittest,
    /// Prior-only acceptance; the likelihood never rejects a move.
    MonteCarlo,
}

/// Which prior model weighs the parameter vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParameterDistribution {
    /// Flat over the sampling box.
    NoPrior,
    /// Independent marginal distributions per component.
    Marginal,
    /// Single multivariate Gaussian over the continuous block.
    MultivariateGaussian,
}

/// When the Kriging correction of the proxies is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KrigingUsage {
    /// Trend-only proxies everywhere.
    No,
    /// Cheap proxies while stepping, corrected proxies for the final
    /// acceptance test and the recorded responses.
    Smart,
    /// Corrected proxies everywhere.
    Full,
}

/// Search phase of one chain under survival of the fittest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SearchStatus {
    /// Random-walk proposals.
    Random,
    /// Deterministic one-component sweeps.
    Tornado,
    /// No improving move exists; the chain is done.
    Terminated,
}

/// Tunable knobs of a sampler run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplerSettings {
    /// Requested number of sample points per iteration; the effective
    /// size is rounded to a whole number of chains and may grow when
    /// categorical combinations need extra chains.
    pub sample_size: usize,
    /// Hard iteration cap; also the reference for freezing step-size
    /// adaptation at 80% of the run.
    pub max_iterations: usize,
    /// Seed of the run; every chain derives its own generator from it.
    pub seed: u64,
    pub step_method: StepMethod,
    pub measurement_distribution: MeasurementDistribution,
    pub parameter_distribution: ParameterDistribution,
    pub kriging_usage: KrigingUsage,
    /// Kriging flavour used wherever the correction is enabled.
    pub proxy_kriging: KrigingType,
    /// Upper bound on the number of retained best matches.
    pub num_best_matches: usize,
}

impl SamplerSettings {
    pub fn new(sample_size: usize) -> Self {
        SamplerSettings {
            sample_size,
            max_iterations: 100,
            seed: 0,
            step_method: StepMethod::MetropolisHastings,
            measurement_distribution: MeasurementDistribution::Normal,
            parameter_distribution: ParameterDistribution::NoPrior,
            kriging_usage: KrigingUsage::No,
            proxy_kriging: KrigingType::Global,
            num_best_matches: 100_000,
        }
    }
}

/// State of one Markov chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Chain {
    p: Vec<f64>,
    cat_index: usize,
    y_cheap: Vec<f64>,
    y_impr: Vec<f64>,
    log_prior: f64,
    log_lh_cheap: f64,
    log_lh_impr: f64,
    /// Minus log posterior of the current state.
    f: f64,
    status: SearchStatus,
    last_tornado_step: usize,
    step_size: Vec<f64>,
    rng: ChaCha8Rng,
    n_accepted: usize,
    n_proposed: usize,
}

impl Chain {
    fn new(dim: usize, n_proxies: usize, cat_index: usize, seed: u64, index: usize) -> Self {
        Chain {
            p: vec![0.0; dim],
            cat_index,
            y_cheap: vec![0.0; n_proxies],
            y_impr: vec![0.0; n_proxies],
            log_prior: 0.0,
            log_lh_cheap: 0.0,
            log_lh_impr: 0.0,
            f: 0.0,
            status: SearchStatus::Random,
            last_tornado_step: 0,
            step_size: vec![0.0; dim],
            rng: ChaCha8Rng::seed_from_u64(
                seed.wrapping_add((index as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15)),
            ),
            n_accepted: 0,
            n_proposed: 0,
        }
    }
}

/// One sample point produced by a cycle.
struct CycleOutput {
    p: Vec<f64>,
    y: Vec<f64>,
    f: f64,
    r: f64,
    best_key: f64,
    best_case: Vec<f64>,
}

struct ChainOutput {
    cycles: Vec<CycleOutput>,
    too_big_acc_ratio: bool,
}

/// Outcome of the last step of a cycle.
struct StepOutcome {
    r: f64,
    best_key: f64,
    best_case: Vec<f64>,
}

/// Persistent state of a sampler run, detached from the proxies and
/// the prior so an interrupted run can resume later.
#[derive(Serialize, Deserialize)]
pub struct SamplerCheckpoint {
    settings: SamplerSettings,
    chains: Vec<Chain>,
    p_sample: Vec<Vec<f64>>,
    y_sample: Vec<Vec<f64>>,
    f_sample: Vec<f64>,
    r_sample: Vec<f64>,
    sample_copy: Vec<(Vec<f64>, Vec<f64>)>,
    best_matches: BestMatches,
    statistics: McmcStatistics,
    stddev_factor: f64,
    acceptance_rate: f64,
    iteration_count: usize,
    continue_on_convergence: bool,
    too_big_acc_ratio: bool,
    p_old_avg: Vec<f64>,
    entropy: f64,
    entropy_old: f64,
    r_avg: f64,
}

impl SamplerCheckpoint {
    /// Write the checkpoint to a file.
    pub fn save<Q: AsRef<Path>>(&self, path: Q) -> SumcResult<()> {
        let file = File::create(path).map_err(|e| {
            SumcError::SamplingError(format!("failed to create checkpoint file: {}", e))
        })?;
        let mut writer = BufWriter::new(file);
        bincode::serialize_into(&mut writer, self).map_err(|e| {
            SumcError::SamplingError(format!("failed to serialize checkpoint: {}", e))
        })?;
        writer.flush().map_err(|e| {
            SumcError::SamplingError(format!("failed to flush checkpoint file: {}", e))
        })?;
        Ok(())
    }

    /// Read a checkpoint back from a file.
    pub fn load<Q: AsRef<Path>>(path: Q) -> SumcResult<Self> {
        let file = File::open(path).map_err(|e| {
            SumcError::SamplingError(format!("failed to open checkpoint file: {}", e))
        })?;
        let mut reader = BufReader::new(file);
        bincode::deserialize_from(&mut reader).map_err(|e| {
            SumcError::SamplingError(format!("failed to deserialize checkpoint: {}", e))
        })
    }
}

/// The sampling engine.
pub struct McmcSampler<P: ResponseProxy + Sync> {
    proxies: Vec<P>,
    prior: ParameterPrior,
    bounds: SamplingBounds,
    settings: SamplerSettings,
    marginal_types: Vec<MarginalDistributionType>,
    marginal: MarginalPrior,
    mvnormal: Option<MvNormalPrior>,
    proposer: StepProposer,

    chains: Vec<Chain>,
    combos: Vec<CatCombination>,
    cat_index_of_chain: Vec<usize>,
    cat_index_of_sample: Vec<usize>,
    sample_size: usize,
    log_max_acc_ratio: f64,

    p_sample: Vec<Vec<f64>>,
    y_sample: Vec<Vec<f64>>,
    f_sample: Vec<f64>,
    r_sample: Vec<f64>,
    sample_copy: Vec<(Vec<f64>, Vec<f64>)>,

    best_matches: BestMatches,
    statistics: McmcStatistics,
    stddev_factor: f64,
    acceptance_rate: f64,
    iteration_count: usize,
    continue_on_convergence: bool,
    too_big_acc_ratio: bool,

    p_old_avg: Array1<f64>,
    entropy: f64,
    entropy_old: f64,
    r_avg: f64,
}

impl<P: ResponseProxy + Sync> McmcSampler<P> {
    /// Build a sampler over `proxies`, whose input dimension must match
    /// the proxy-case length of the prior (ordinal components plus
    /// categorical dummies).
    pub fn new(
        proxies: Vec<P>,
        prior: ParameterPrior,
        bounds: SamplingBounds,
        settings: SamplerSettings,
    ) -> SumcResult<Self> {
        if settings.sample_size == 0 {
            return Err(SumcError::InvalidValue(
                "sample size must be positive".to_string(),
            ));
        }
        if settings.max_iterations == 0 {
            return Err(SumcError::InvalidValue(
                "maximum number of iterations must be positive".to_string(),
            ));
        }
        for proxy in &proxies {
            if proxy.size() != prior.proxy_case_len() {
                return Err(SumcError::DimensionMismatch {
                    context: "proxy input".to_string(),
                    expected: prior.proxy_case_len(),
                    actual: proxy.size(),
                });
            }
            if proxy.is_used() && proxy.std_deviation() <= 0.0 {
                return Err(SumcError::InvalidValue(
                    "used observables need a positive standard deviation".to_string(),
                ));
            }
        }
        let marginal_types = vec![MarginalDistributionType::Normal; prior.size_con()];
        let marginal = MarginalPrior::new(&prior, &bounds, marginal_types.clone())?;
        let mvnormal = match MvNormalPrior::new(&prior) {
            Ok(mvn) => Some(mvn),
            Err(e) => {
                if settings.parameter_distribution == ParameterDistribution::MultivariateGaussian {
                    return Err(e);
                }
                None
            }
        };
        let proposer = StepProposer::new(bounds.clone());

        let mut sampler = McmcSampler {
            proxies,
            prior,
            bounds,
            settings,
            marginal_types,
            marginal,
            mvnormal,
            proposer,
            chains: Vec::new(),
            combos: Vec::new(),
            cat_index_of_chain: Vec::new(),
            cat_index_of_sample: Vec::new(),
            sample_size: 0,
            log_max_acc_ratio: 0.0,
            p_sample: Vec::new(),
            y_sample: Vec::new(),
            f_sample: Vec::new(),
            r_sample: Vec::new(),
            sample_copy: Vec::new(),
            best_matches: BestMatches::with_tolerances(0, Vec::new()),
            statistics: McmcStatistics::new(),
            stddev_factor: 1.0,
            acceptance_rate: 0.0,
            iteration_count: 0,
            continue_on_convergence: false,
            too_big_acc_ratio: false,
            p_old_avg: Array1::zeros(0),
            entropy: 0.0,
            entropy_old: 0.0,
            r_avg: 0.0,
        };
        sampler.build_population()?;
        Ok(sampler)
    }

    fn use_prior(&self) -> bool {
        self.settings.parameter_distribution != ParameterDistribution::NoPrior
    }

    fn cheap_kriging(&self) -> KrigingType {
        match self.settings.kriging_usage {
            KrigingUsage::Full => self.settings.proxy_kriging,
            _ => KrigingType::None,
        }
    }

    fn improved_kriging(&self) -> KrigingType {
        match self.settings.kriging_usage {
            KrigingUsage::No => KrigingType::None,
            _ => self.settings.proxy_kriging,
        }
    }

    /// Number of observables participating in the likelihood.
    pub fn num_active_measurements(&self) -> usize {
        self.proxies.iter().filter(|p| p.is_used()).count()
    }

    /// Size the chain population, distribute it over the categorical
    /// combinations, and reset all iteration state.
    fn build_population(&mut self) -> SumcResult<()> {
        let target_chains = (self.settings.sample_size / NB_OF_CYCLES).max(1);
        let alloc = if self.prior.size_cat() == 0 {
            vec![(
                CatCombination {
                    values: Vec::new(),
                    weight: 1.0,
                },
                target_chains,
            )]
        } else if self.use_prior() {
            allocate_chains(&self.prior, target_chains)
        } else {
            // Without a prior every admissible combination weighs the
            // same.
            let mut flat = self.prior.clone();
            for i in 0..flat.size_cat() {
                let n = flat.cat_values()[i].len();
                flat.set_cat_weights(i, vec![1.0; n])?;
            }
            allocate_chains(&flat, target_chains)
        };
        if alloc.is_empty() {
            return Err(SumcError::SamplingError(
                "no categorical combination has a positive weight".to_string(),
            ));
        }

        self.combos = alloc.iter().map(|(c, _)| c.clone()).collect();
        self.cat_index_of_chain = alloc
            .iter()
            .enumerate()
            .flat_map(|(i, (_, n))| std::iter::repeat(i).take(*n))
            .collect();
        let n_chains = self.cat_index_of_chain.len();
        self.cat_index_of_sample = self
            .cat_index_of_chain
            .iter()
            .flat_map(|&i| std::iter::repeat(i).take(NB_OF_CYCLES))
            .collect();
        self.sample_size = n_chains * NB_OF_CYCLES;
        self.log_max_acc_ratio = 5.0 + (self.sample_size as f64).ln();

        let dim = self.prior.size_ord();
        self.chains = (0..n_chains)
            .map(|i| {
                Chain::new(
                    dim,
                    self.proxies.len(),
                    self.cat_index_of_chain[i],
                    self.settings.seed,
                    i,
                )
            })
            .collect();

        self.p_sample = vec![vec![0.0; dim]; self.sample_size];
        self.y_sample = vec![vec![0.0; self.proxies.len()]; self.sample_size];
        self.f_sample = vec![0.0; self.sample_size];
        self.r_sample = vec![0.0; self.sample_size];
        self.sample_copy.clear();

        let mut tolerance: Vec<f64> = (0..dim).map(|i| 0.01 * self.bounds.range(i)).collect();
        for values in self.prior.cat_values() {
            // Dummy components span a unit range.
            tolerance.extend(std::iter::repeat(0.01).take(values.len().saturating_sub(1)));
        }
        self.best_matches =
            BestMatches::with_tolerances(self.settings.num_best_matches, tolerance);
        self.statistics = McmcStatistics::new();
        self.reset();
        Ok(())
    }

    /// Run iterations until the stop criterion fires; returns the final
    /// iteration count.
    pub fn execute(&mut self) -> SumcResult<usize> {
        while self.iterate_once()? != 0 {}
        Ok(self.iteration_count)
    }

    /// Run one iteration. Returns the new iteration count, or 0 when
    /// the stop criterion holds (a further call resumes sampling).
    pub fn iterate_once(&mut self) -> SumcResult<usize> {
        if self.iteration_count == 0 {
            self.initial_sample()?;
        } else if self.convergence() && !self.continue_on_convergence {
            self.continue_on_convergence = true;
            return Ok(0);
        } else if self.iteration_count % ITER_MULTIPLE == 0 {
            self.p_old_avg = self.statistics.p_avg().clone();
            self.entropy_old = self.entropy;
        }
        self.continue_on_convergence = false;

        self.best_matches.clear();
        for chain in &mut self.chains {
            chain.n_accepted = 0;
            chain.n_proposed = 0;
        }
        self.too_big_acc_ratio = false;

        // Chains are independent within one iteration.
        let mut chains = std::mem::take(&mut self.chains);
        let outputs: SumcResult<Vec<ChainOutput>> = {
            let this = &*self;
            chains
                .par_iter_mut()
                .map(|chain| this.run_chain_iteration(chain))
                .collect()
        };
        self.chains = chains;
        let outputs = outputs?;

        let mut best_candidates = Vec::with_capacity(self.sample_size);
        for (i, out) in outputs.into_iter().enumerate() {
            self.too_big_acc_ratio |= out.too_big_acc_ratio;
            for (j, cycle) in out.cycles.into_iter().enumerate() {
                let k = i * NB_OF_CYCLES + j;
                self.p_sample[k] = cycle.p;
                self.y_sample[k] = cycle.y;
                self.f_sample[k] = cycle.f;
                self.r_sample[k] = cycle.r;
                best_candidates.push((cycle.best_key, cycle.best_case));
            }
        }
        for (key, case) in best_candidates {
            self.update_best_matches(key, case);
        }

        // Freeze step-size adaptation over the last fifth of the run.
        self.refresh_acceptance_rate();
        if self.iteration_count < 4 * self.settings.max_iterations / 5 {
            self.adapt_step_size();
        }

        self.sample_copy = self
            .p_sample
            .iter()
            .cloned()
            .zip(self.y_sample.iter().cloned())
            .collect();
        self.update_statistics();

        self.iteration_count += 1;
        debug!(
            "iteration {}: acceptance rate {:.1}%, entropy {:.4}",
            self.iteration_count, self.acceptance_rate, self.entropy
        );
        Ok(self.iteration_count)
    }

    /// Draw the starting state of every chain and initialise the
    /// convergence baselines.
    fn initial_sample(&mut self) -> SumcResult<()> {
        let use_prior = self.use_prior();
        let dim = self.prior.size_ord();
        let n_con = self.prior.size_con();
        let dp = StepProposer::initial_step_size(&self.prior, &self.bounds);

        let mut chains = std::mem::take(&mut self.chains);
        for chain in &mut chains {
            chain.status = SearchStatus::Random;
            chain.last_tornado_step = 0;
            chain.step_size = dp.clone();

            let mut p = vec![0.0; dim];
            match (&self.mvnormal, use_prior) {
                (Some(mvn), true) => {
                    let con = mvn.sample_bounded(&mut chain.rng, &self.bounds);
                    p[..n_con].copy_from_slice(&con);
                }
                _ => {
                    for i in 0..n_con {
                        p[i] = chain
                            .rng
                            .gen_range(self.bounds.low()[i]..=self.bounds.high()[i]);
                    }
                }
            }
            for i in n_con..dim {
                p[i] = chain
                    .rng
                    .gen_range(self.bounds.low()[i]..=self.bounds.high()[i]);
            }
            self.marginal.correct_for_dis_bounds(&mut p);
            chain.p = p;
            chain.log_prior = self.calc_log_prior(&chain.p);

            chain.y_impr =
                self.eval_model(&chain.p, chain.cat_index, self.improved_kriging())?;
            chain.log_lh_impr = self.log_lh(&chain.y_impr);
            if self.settings.kriging_usage == KrigingUsage::Smart {
                chain.y_cheap = self.eval_model(&chain.p, chain.cat_index, KrigingType::None)?;
                chain.log_lh_cheap = self.log_lh(&chain.y_cheap);
            } else {
                chain.y_cheap = chain.y_impr.clone();
                chain.log_lh_cheap = chain.log_lh_impr;
            }
            chain.f = minus_log_posterior(use_prior, chain.log_lh_impr, chain.log_prior);
        }
        self.chains = chains;

        // Baselines so the first convergence check has something to
        // compare against.
        let mut avg = Array1::zeros(dim);
        for chain in &self.chains {
            for i in 0..dim {
                avg[i] += chain.p[i];
            }
        }
        avg /= self.chains.len() as f64;
        self.p_old_avg = avg;
        self.entropy_old =
            self.chains.iter().map(|c| c.f).sum::<f64>() / self.chains.len() as f64;
        Ok(())
    }

    fn run_chain_iteration(&self, chain: &mut Chain) -> SumcResult<ChainOutput> {
        let mut out = ChainOutput {
            cycles: Vec::with_capacity(NB_OF_CYCLES),
            too_big_acc_ratio: false,
        };
        for _ in 0..NB_OF_CYCLES {
            let outcome = self.do_cycle(chain, &mut out.too_big_acc_ratio)?;
            out.cycles.push(CycleOutput {
                p: chain.p.clone(),
                y: chain.y_impr.clone(),
                f: chain.f,
                r: outcome.r,
                best_key: outcome.best_key,
                best_case: outcome.best_case,
            });
        }
        Ok(out)
    }

    fn do_cycle(&self, chain: &mut Chain, too_big: &mut bool) -> SumcResult<StepOutcome> {
        let mut acc_log = 0.0;
        let mut final_outcome = None;
        for step_count in 1..=NB_OF_STEPS {
            if let Some(outcome) = self.step(chain, step_count, &mut acc_log, too_big)? {
                final_outcome = Some(outcome);
            }
        }
        // The last step always produces the outcome.
        final_outcome.ok_or_else(|| {
            SumcError::SamplingError("cycle finished without an outcome".to_string())
        })
    }

    /// One step of one chain. Returns the cycle outcome at the last
    /// step of the cycle, `None` otherwise.
    fn step(
        &self,
        chain: &mut Chain,
        step_count: usize,
        acc_log: &mut f64,
        too_big: &mut bool,
    ) -> SumcResult<Option<StepOutcome>> {
        let p_old = chain.p.clone();
        let y_old = chain.y_cheap.clone();
        let old_prior = chain.log_prior;
        let old_log_lh = chain.log_lh_cheap;

        let found_new = self.propose_step(chain, acc_log)?;

        if !found_new {
            if step_count == NB_OF_STEPS {
                return Ok(Some(StepOutcome {
                    r: 1.0,
                    best_key: self.rmse_key(chain.log_lh_impr),
                    best_case: self.proxy_case(&chain.p, chain.cat_index)?,
                }));
            }
            return Ok(None);
        }

        // Response and likelihood of the accepted proposal with the
        // improved proxies.
        let (y_new, log_lh_new) = if self.settings.step_method == StepMethod::MonteCarlo
            || self.settings.kriging_usage == KrigingUsage::Smart
        {
            let y = self.eval_model(&chain.p, chain.cat_index, self.improved_kriging())?;
            let lh = self.log_lh(&y);
            (y, lh)
        } else {
            (chain.y_cheap.clone(), chain.log_lh_cheap)
        };

        let best = if step_count == NB_OF_STEPS {
            Some((
                self.rmse_key(log_lh_new),
                self.proxy_case(&chain.p, chain.cat_index)?,
            ))
        } else {
            None
        };

        // Final acceptance test; only decisive under smart Kriging,
        // where the preliminary test used cheap proxies.
        let log_trans = old_log_lh - chain.log_lh_cheap + old_prior - chain.log_prior;
        let mut log_acc = log_lh_new - chain.log_lh_impr + chain.log_prior - old_prior;
        let accepted = self.settings.kriging_usage != KrigingUsage::Smart
            || self.accept_proposal(log_trans, &mut log_acc, &mut chain.rng);
        if accepted {
            chain.y_impr = y_new;
            chain.log_lh_impr = log_lh_new;
            chain.f = minus_log_posterior(self.use_prior(), log_lh_new, chain.log_prior);
            chain.n_accepted += 1;
        } else {
            chain.p = p_old;
            chain.y_cheap = y_old;
            chain.log_prior = old_prior;
            chain.log_lh_cheap = old_log_lh;
            if chain.status != SearchStatus::Random {
                // Otherwise the same tornado step would be proposed in
                // vain.
                chain.last_tornado_step =
                    (chain.last_tornado_step + 1) % self.proposer.tornado_sweep_len();
            }
        }

        if step_count == NB_OF_STEPS {
            *acc_log += log_acc;
            if *acc_log > self.log_max_acc_ratio {
                *acc_log = self.log_max_acc_ratio;
                *too_big = true;
            }
            let (best_key, best_case) = best.unwrap_or_default();
            return Ok(Some(StepOutcome {
                r: acc_log.exp(),
                best_key,
                best_case,
            }));
        }
        Ok(None)
    }

    /// Generate proposals until one is accepted or the trial budget of
    /// the current search phase runs out.
    fn propose_step(&self, chain: &mut Chain, acc_log: &mut f64) -> SumcResult<bool> {
        let max_count = match chain.status {
            SearchStatus::Random => MAX_RANDOM_TRIALS,
            _ => self.proposer.tornado_sweep_len(),
        };
        let mut count = 0;
        let mut new_par = false;
        while !new_par && count < max_count && chain.status != SearchStatus::Terminated {
            let proposal = match chain.status {
                SearchStatus::Random => {
                    let (p, log_trans) =
                        self.proposer
                            .propose_random(&mut chain.rng, &chain.p, &chain.step_size);
                    Some((p, log_trans, chain.last_tornado_step))
                }
                _ => {
                    let step_idx = (chain.last_tornado_step + 1 + count) % max_count;
                    self.proposer
                        .propose_tornado(&chain.p, step_idx, &chain.step_size)
                        .map(|p| (p, 0.0, step_idx))
                }
            };

            let mut log_acc = 0.0;
            if let Some((p_star, log_trans, tornado_step)) = proposal {
                let prior_star = self.calc_log_prior(&p_star);
                let (y_star, log_lh_star) =
                    if self.settings.step_method == StepMethod::MonteCarlo {
                        (None, 0.0)
                    } else {
                        let y =
                            self.eval_model(&p_star, chain.cat_index, self.cheap_kriging())?;
                        let lh = self.log_lh(&y);
                        (Some(y), lh)
                    };

                log_acc = prior_star - chain.log_prior;
                if self.settings.step_method != StepMethod::MonteCarlo {
                    log_acc += log_lh_star - chain.log_lh_cheap;
                }

                if self.accept_proposal(log_trans, &mut log_acc, &mut chain.rng) {
                    new_par = true;
                    chain.last_tornado_step = tornado_step;
                    chain.p = p_star;
                    if let Some(y) = y_star {
                        chain.y_cheap = y;
                    }
                    chain.log_prior = prior_star;
                    chain.log_lh_cheap = log_lh_star;
                }
            }

            count += 1;
            // The first trial's ratio seeds the unbiased acceptance
            // ratio of this step, independent of the accept decision.
            if count == 1 {
                *acc_log = log_acc;
            }

            if count == max_count
                && !new_par
                && self.settings.step_method == StepMethod::SurvivalOfTheFittest
            {
                chain.status = match chain.status {
                    SearchStatus::Random => {
                        chain.last_tornado_step = 0;
                        SearchStatus::Tornado
                    }
                    _ => SearchStatus::Terminated,
                };
            }
        }
        chain.n_proposed += count;
        Ok(new_par)
    }

    fn accept_proposal(&self, log_trans: f64, log_acc: &mut f64, rng: &mut ChaCha8Rng) -> bool {
        match self.settings.step_method {
            // Greedy search: only a genuine posterior improvement counts,
            // so the transition-probability ratio is left out.
            StepMethod::SurvivalOfTheFittest => *log_acc > CLOSE_TO_ZERO,
            _ => {
                *log_acc += log_trans;
                if *log_acc >= 0.0 {
                    return true;
                }
                let u: f64 = rng.gen_range(0.0..1.0);
                *log_acc > u.ln()
            }
        }
    }

    fn update_best_matches(&mut self, key: f64, case: Vec<f64>) {
        match self.settings.step_method {
            StepMethod::SurvivalOfTheFittest => {
                self.best_matches.insert_unique(key, case);
            }
            _ => {
                self.best_matches.insert(key, case);
            }
        }
    }

    fn refresh_acceptance_rate(&mut self) {
        let accepted: usize = self.chains.iter().map(|c| c.n_accepted).sum();
        let proposed: usize = self.chains.iter().map(|c| c.n_proposed).sum();
        self.acceptance_rate = if proposed > 0 {
            100.0 * accepted as f64 / proposed as f64
        } else {
            0.0
        };
    }

    fn adapt_step_size(&mut self) {
        for chain in &mut self.chains {
            let rate = if chain.n_proposed > 0 {
                100.0 * chain.n_accepted as f64 / chain.n_proposed as f64
            } else {
                0.0
            };
            self.proposer.adapt_step_size(&mut chain.step_size, rate);
            chain.n_accepted = 0;
            chain.n_proposed = 0;
        }
    }

    fn update_statistics(&mut self) {
        let p = rows_to_array(&self.p_sample);
        let y = rows_to_array(&self.y_sample);
        let cats: Vec<Vec<usize>> = self
            .cat_index_of_sample
            .iter()
            .map(|&i| self.combos[i].values.clone())
            .collect();
        let sum_sq: f64 = self
            .y_sample
            .iter()
            .map(|row| likelihood::sum_of_squared_errors(&self.proxies, row, self.stddev_factor).0)
            .sum();
        self.statistics.update(
            p.view(),
            y.view(),
            &cats,
            sum_sq,
            self.stddev_factor,
            self.num_active_measurements(),
        );
        let (entropy, _) = mean_and_var(&self.f_sample);
        self.entropy = entropy;
        let (r_avg, _) = mean_and_var(&self.r_sample);
        self.r_avg = r_avg;
    }

    /// Stop criterion: a hard iteration cap, then stability of the
    /// parameter averages, of the sample entropy, and of the
    /// method-specific signal.
    fn convergence(&self) -> bool {
        if self.iteration_count > 0
            && self.iteration_count % self.settings.max_iterations == 0
        {
            return true;
        }
        if self.iteration_count % ITER_MULTIPLE != 0 {
            return false;
        }

        let p_avg = self.statistics.p_avg();
        let p_cov = self.statistics.p_cov();
        for i in 0..self.prior.size_ord() {
            let stddev = (p_cov[[i, i]] / self.sample_size as f64).sqrt();
            if (p_avg[i] - self.p_old_avg[i]).abs() > 3.0 * stddev {
                return false;
            }
        }

        let (_, var_f) = mean_and_var(&self.f_sample);
        let stddev_f = (var_f / self.sample_size as f64).sqrt();
        if (self.entropy - self.entropy_old).abs() > ENTROPY_LAMBDA * stddev_f {
            return false;
        }

        match self.settings.step_method {
            StepMethod::SurvivalOfTheFittest => self
                .chains
                .iter()
                .all(|c| c.status == SearchStatus::Terminated),
            _ => {
                if self.too_big_acc_ratio {
                    return false;
                }
                let (_, var_r) = mean_and_var(&self.r_sample);
                let stddev_r = (var_r / self.sample_size as f64).sqrt();
                (self.r_avg - 1.0).abs() <= ENTROPY_LAMBDA * stddev_r
                    && self.acceptance_rate >= MIN_ACCEPTANCE_RATE
            }
        }
    }

    fn calc_log_prior(&self, p: &[f64]) -> f64 {
        match self.settings.parameter_distribution {
            ParameterDistribution::NoPrior => 0.0,
            ParameterDistribution::Marginal => self.marginal.calc_log_prior(p),
            ParameterDistribution::MultivariateGaussian => {
                let n_con = self.prior.size_con();
                let mut log_p = match &self.mvnormal {
                    Some(mvn) => mvn.log_density(&p[..n_con]),
                    None => 0.0,
                };
                // Discrete components keep their weight tables,
                // stretched over the sampling box.
                for (j, weights) in self.prior.dis_weights().iter().enumerate() {
                    let i = n_con + j;
                    let bin = (self.prior.high()[i] - self.prior.low()[i])
                        / (weights.len().max(2) - 1) as f64;
                    log_p += crate::prior::calc_log_weight(
                        p[i],
                        self.bounds.low()[i],
                        self.bounds.high()[i],
                        bin,
                        weights,
                    );
                }
                log_p
            }
        }
    }

    fn eval_model(
        &self,
        p_ord: &[f64],
        cat_index: usize,
        kriging: KrigingType,
    ) -> SumcResult<Vec<f64>> {
        if self.proxies.is_empty() {
            return Ok(Vec::new());
        }
        let case = self.proxy_case(p_ord, cat_index)?;
        // Interpolation weights are shared across proxies built on the
        // same design.
        let weights = self.proxies[0].kriging_weights(&case, kriging)?;
        self.proxies
            .iter()
            .map(|proxy| proxy.proxy_value_with_weights(&case, &weights, kriging))
            .collect()
    }

    fn proxy_case(&self, p_ord: &[f64], cat_index: usize) -> SumcResult<Vec<f64>> {
        self.prior
            .extend_to_proxy_case(p_ord, &self.combos[cat_index].values)
    }

    fn log_lh(&self, y: &[f64]) -> f64 {
        likelihood::log_likelihood(
            &self.proxies,
            y,
            self.stddev_factor,
            self.settings.measurement_distribution,
        )
    }

    /// Root-mean-square mismatch implied by a log likelihood, used as
    /// the ranking key of the best matches.
    fn rmse_key(&self, log_lh: f64) -> f64 {
        let n = self.num_active_measurements();
        if n == 0 {
            0.0
        } else {
            (-2.0 * log_lh / n as f64).max(0.0).sqrt()
        }
    }

    // Configuration. Changes that invalidate the population or the
    // likelihoods take effect immediately.

    pub fn set_measurement_distribution(&mut self, distribution: MeasurementDistribution) {
        self.settings.measurement_distribution = distribution;
    }

    pub fn set_step_method(&mut self, method: StepMethod) {
        self.settings.step_method = method;
    }

    pub fn set_kriging_usage(&mut self, usage: KrigingUsage) {
        self.settings.kriging_usage = usage;
    }

    pub fn set_proxy_kriging(&mut self, kriging: KrigingType) {
        self.settings.proxy_kriging = kriging;
    }

    pub fn set_max_iterations(&mut self, max_iterations: usize) -> SumcResult<()> {
        if max_iterations == 0 {
            return Err(SumcError::InvalidValue(
                "maximum number of iterations must be positive".to_string(),
            ));
        }
        self.settings.max_iterations = max_iterations;
        Ok(())
    }

    /// Switch the prior model. The chain population is rebuilt because
    /// the categorical weights (and thus the partitioning) depend on
    /// whether a prior is used.
    pub fn set_parameter_distribution(
        &mut self,
        distribution: ParameterDistribution,
    ) -> SumcResult<()> {
        if self.settings.parameter_distribution == distribution {
            return Ok(());
        }
        if distribution == ParameterDistribution::MultivariateGaussian && self.mvnormal.is_none()
        {
            return Err(SumcError::InvalidValue(
                "prior covariance matrix is not positive definite".to_string(),
            ));
        }
        self.settings.parameter_distribution = distribution;
        self.build_population()
    }

    /// Set the marginal shape of every continuous parameter.
    pub fn set_marginal_distribution_types(
        &mut self,
        types: Vec<MarginalDistributionType>,
    ) -> SumcResult<()> {
        self.marginal = MarginalPrior::new(&self.prior, &self.bounds, types.clone())?;
        self.marginal_types = types;
        Ok(())
    }

    /// Set the common inflation factor of the measurement standard
    /// deviations. Likelihoods of the current states are recomputed.
    pub fn set_std_dev_factor(&mut self, factor: f64) {
        const MIN_STDDEV_FACTOR: f64 = 1.0e-9;
        self.stddev_factor = factor.max(MIN_STDDEV_FACTOR);
        if self.iteration_count > 0 {
            let mut chains = std::mem::take(&mut self.chains);
            for chain in &mut chains {
                chain.log_lh_impr = self.log_lh(&chain.y_impr);
                if self.settings.kriging_usage == KrigingUsage::Smart {
                    chain.log_lh_cheap = self.log_lh(&chain.y_cheap);
                } else {
                    chain.log_lh_cheap = chain.log_lh_impr;
                }
            }
            self.chains = chains;
        }
    }

    /// Calibrate the standard-deviation factor so the reduced
    /// chi-square of the current sample becomes one, then restart the
    /// equilibrium search.
    pub fn adapt_std_dev_factor(&mut self) -> SumcResult<()> {
        if self.iteration_count == 0 {
            return Err(SumcError::SamplingError(
                "no sample yet to adapt the standard deviation factor from".to_string(),
            ));
        }
        let n_used = self.num_active_measurements();
        if n_used == 0 || self.y_sample.is_empty() {
            return Ok(());
        }
        // Raw reduced chi-square, with the current factor divided out.
        let reduced = self.statistics.raw_chi2() / n_used as f64;
        info!("adapting standard deviation factor to {:.4}", reduced.sqrt());
        self.set_std_dev_factor(reduced.sqrt());

        // Ranked matches are stale under the new deviations, and the
        // chains need to find a new equilibrium.
        self.best_matches.clear();
        self.iteration_count = 1;
        Ok(())
    }

    /// Capture the run state so it can be resumed later against the
    /// same proxies and prior.
    pub fn checkpoint(&self) -> SamplerCheckpoint {
        SamplerCheckpoint {
            settings: self.settings.clone(),
            chains: self.chains.clone(),
            p_sample: self.p_sample.clone(),
            y_sample: self.y_sample.clone(),
            f_sample: self.f_sample.clone(),
            r_sample: self.r_sample.clone(),
            sample_copy: self.sample_copy.clone(),
            best_matches: self.best_matches.clone(),
            statistics: self.statistics.clone(),
            stddev_factor: self.stddev_factor,
            acceptance_rate: self.acceptance_rate,
            iteration_count: self.iteration_count,
            continue_on_convergence: self.continue_on_convergence,
            too_big_acc_ratio: self.too_big_acc_ratio,
            p_old_avg: self.p_old_avg.to_vec(),
            entropy: self.entropy,
            entropy_old: self.entropy_old,
            r_avg: self.r_avg,
        }
    }

    /// Resume from a checkpoint. The sampler must have been built with
    /// the same proxies and prior the checkpoint was taken against.
    pub fn restore(&mut self, checkpoint: SamplerCheckpoint) -> SumcResult<()> {
        let dim = self.prior.size_ord();
        if checkpoint.chains.iter().any(|c| c.p.len() != dim) {
            return Err(SumcError::DimensionMismatch {
                context: "checkpoint chain state".to_string(),
                expected: dim,
                actual: checkpoint.chains.first().map_or(0, |c| c.p.len()),
            });
        }
        self.settings = checkpoint.settings;
        self.build_population()?;
        if checkpoint.chains.len() != self.chains.len() {
            return Err(SumcError::DimensionMismatch {
                context: "checkpoint chain count".to_string(),
                expected: self.chains.len(),
                actual: checkpoint.chains.len(),
            });
        }
        self.chains = checkpoint.chains;
        self.p_sample = checkpoint.p_sample;
        self.y_sample = checkpoint.y_sample;
        self.f_sample = checkpoint.f_sample;
        self.r_sample = checkpoint.r_sample;
        self.sample_copy = checkpoint.sample_copy;
        self.best_matches = checkpoint.best_matches;
        self.statistics = checkpoint.statistics;
        self.stddev_factor = checkpoint.stddev_factor;
        self.acceptance_rate = checkpoint.acceptance_rate;
        self.iteration_count = checkpoint.iteration_count;
        self.continue_on_convergence = checkpoint.continue_on_convergence;
        self.too_big_acc_ratio = checkpoint.too_big_acc_ratio;
        self.p_old_avg = Array1::from_vec(checkpoint.p_old_avg);
        self.entropy = checkpoint.entropy;
        self.entropy_old = checkpoint.entropy_old;
        self.r_avg = checkpoint.r_avg;
        Ok(())
    }

    /// Forget the iteration progress but keep the chain states.
    pub fn reset(&mut self) {
        self.iteration_count = 0;
        self.continue_on_convergence = false;
    }

    // Results.

    pub fn iteration_count(&self) -> usize {
        self.iteration_count
    }

    pub fn acceptance_rate(&self) -> f64 {
        self.acceptance_rate
    }

    pub fn std_dev_factor(&self) -> f64 {
        self.stddev_factor
    }

    /// Effective sample size (chains times cycles).
    pub fn sample_size(&self) -> usize {
        self.sample_size
    }

    /// Parameter sample of the last iteration, one row per point.
    pub fn p_sample(&self) -> &[Vec<f64>] {
        &self.p_sample
    }

    /// Response sample of the last iteration.
    pub fn y_sample(&self) -> &[Vec<f64>] {
        &self.y_sample
    }

    pub fn best_matches(&self) -> &BestMatches {
        &self.best_matches
    }

    pub fn statistics(&self) -> &McmcStatistics {
        &self.statistics
    }

    /// The categorical combinations chains are allocated to.
    pub fn cat_combinations(&self) -> &[CatCombination] {
        &self.combos
    }

    /// Search phase per chain (informative under survival of the
    /// fittest).
    pub fn chain_statuses(&self) -> Vec<SearchStatus> {
        self.chains.iter().map(|c| c.status).collect()
    }

    /// P10 through P90 of every proxy response over the current sample,
    /// with the proxy case realising each percentile.
    ///
    /// Returns one vector of nine (value, case) pairs per proxy.
    pub fn p10_to_p90(&self) -> Vec<Vec<(f64, Vec<f64>)>> {
        if self.sample_copy.is_empty() {
            return Vec::new();
        }
        let n = self.sample_copy.len();
        let n_proxies = self.sample_copy[0].1.len();
        let mut summary = Vec::with_capacity(n_proxies);
        for i in 0..n_proxies {
            let mut ranked: Vec<(f64, usize)> = self
                .sample_copy
                .iter()
                .enumerate()
                .map(|(k, (_, y))| (y[i], k))
                .collect();
            ranked.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
            let mut bins = Vec::with_capacity(9);
            for j in 1..=9 {
                let idx = (j * n / 10).min(n - 1);
                let (value, row) = ranked[idx];
                let case = self
                    .proxy_case(&self.sample_copy[row].0, self.cat_index_of_sample[row])
                    .unwrap_or_default();
                bins.push((value, case));
            }
            summary.push(bins);
        }
        summary
    }

    /// Response vectors of the ranked best matches, in rank order,
    /// looked up from the current sample.
    pub fn sorted_y_sample(&self) -> Vec<Vec<f64>> {
        self.best_matches
            .iter()
            .map(|m| {
                self.sample_copy
                    .iter()
                    .enumerate()
                    .find(|(row, (p, _))| self.is_same_case(&m.p, p, *row))
                    .map(|(_, (_, y))| y.clone())
                    .unwrap_or_default()
            })
            .collect()
    }

    /// Whether a full proxy case equals the sample row's case (ordinal
    /// part plus the row's categorical dummies).
    fn is_same_case(&self, case: &[f64], p_ord: &[f64], row: usize) -> bool {
        if case.len() < p_ord.len() {
            return false;
        }
        if !p_ord
            .iter()
            .zip(case)
            .all(|(a, b)| is_equal_to(*a, *b))
        {
            return false;
        }
        match self.proxy_case(p_ord, self.cat_index_of_sample[row]) {
            Ok(full) => {
                full.len() == case.len()
                    && full[p_ord.len()..]
                        .iter()
                        .zip(&case[p_ord.len()..])
                        .all(|(a, b)| is_equal_to(*a, *b))
            }
            Err(_) => false,
        }
    }
}

fn minus_log_posterior(use_prior: bool, log_lh: f64, log_prior: f64) -> f64 {
    if use_prior {
        -log_lh - log_prior
    } else {
        -log_lh
    }
}

fn rows_to_array(rows: &[Vec<f64>]) -> Array2<f64> {
    let ncols = rows.first().map_or(0, |r| r.len());
    let flat: Vec<f64> = rows.iter().flatten().copied().collect();
    Array2::from_shape_vec((rows.len(), ncols), flat).unwrap_or_else(|_| Array2::zeros((0, 0)))
}

/// Mean and population variance of a slice.
fn mean_and_var(xs: &[f64]) -> (f64, f64) {
    if xs.is_empty() {
        return (0.0, 0.0);
    }
    let n = xs.len() as f64;
    let mean = xs.iter().sum::<f64>() / n;
    let var = xs.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / n;
    (mean, var)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sumc_core::proxy::KrigingWeights;

    /// Proxy whose trend is a linear function of the case.
    struct LinearProxy {
        coefs: Vec<f64>,
        reference: f64,
        stddev: f64,
    }

    impl LinearProxy {
        fn new(coefs: Vec<f64>, reference: f64, stddev: f64) -> Self {
            LinearProxy {
                coefs,
                reference,
                stddev,
            }
        }
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

    fn one_param_sampler(settings: SamplerSettings) -> McmcSampler<LinearProxy> {
        let prior = ParameterPrior::new(1, vec![0.0], vec![1.0], vec![]).unwrap();
        let bounds = SamplingBounds::full(&prior);
        // Identity response measured as 0.5 +/- 0.05
        let proxies = vec![LinearProxy::new(vec![1.0], 0.5, 0.05)];
        McmcSampler::new(proxies, prior, bounds, settings).unwrap()
    }

    #[test]
    fn test_rejects_mismatched_proxy_dimension() {
        let prior = ParameterPrior::new(2, vec![0.0, 0.0], vec![1.0, 1.0], vec![]).unwrap();
        let bounds = SamplingBounds::full(&prior);
        let proxies = vec![LinearProxy::new(vec![1.0], 0.5, 0.05)];
        assert!(McmcSampler::new(proxies, prior, bounds, SamplerSettings::new(50)).is_err());
    }

    #[test]
    fn test_population_covers_requested_sample_size() {
        let sampler = one_param_sampler(SamplerSettings::new(50));
        assert_eq!(sampler.sample_size(), 50);
        assert_eq!(sampler.chain_statuses().len(), 10);
    }

    #[test]
    fn test_metropolis_finds_the_reference() {
        let mut settings = SamplerSettings::new(50);
        settings.seed = 42;
        settings.max_iterations = 40;
        let mut sampler = one_param_sampler(settings);
        sampler.execute().unwrap();

        let best = sampler.best_matches().best().unwrap();
        assert!(
            (best.p[0] - 0.5).abs() < 0.05,
            "best match {} too far from 0.5",
            best.p[0]
        );
        assert!((sampler.statistics().p_avg()[0] - 0.5).abs() < 0.2);
    }

    #[test]
    fn test_execute_stops_at_the_iteration_cap() {
        let mut settings = SamplerSettings::new(20);
        settings.seed = 1;
        settings.max_iterations = 7;
        let mut sampler = one_param_sampler(settings);
        let count = sampler.execute().unwrap();
        assert!(count <= 7, "ran {} iterations past the cap", count);
        // Once stopped, a further call resumes sampling
        assert!(sampler.iterate_once().unwrap() > 0);
    }

    #[test]
    fn test_survival_of_the_fittest_terminates_and_optimises() {
        let mut settings = SamplerSettings::new(20);
        settings.seed = 7;
        settings.step_method = StepMethod::SurvivalOfTheFittest;
        settings.max_iterations = 60;
        let mut sampler = one_param_sampler(settings);
        sampler.execute().unwrap();

        let best = sampler.best_matches().best().unwrap();
        assert!(
            (best.p[0] - 0.5).abs() < 0.05,
            "optimum {} too far from 0.5",
            best.p[0]
        );
        // Best matches of the greedy search are de-duplicated
        for (i, a) in sampler.best_matches().iter().enumerate() {
            for b in sampler.best_matches().iter().skip(i + 1) {
                assert!((a.p[0] - b.p[0]).abs() > 0.01 * 1.0 - 1e-12);
            }
        }
    }

    #[test]
    fn test_greedy_acceptance_ignores_the_transition_ratio() {
        let mut settings = SamplerSettings::new(20);
        settings.step_method = StepMethod::SurvivalOfTheFittest;
        let sampler = one_param_sampler(settings);
        let mut rng = ChaCha8Rng::seed_from_u64(0);

        // A strictly worse state stays rejected no matter how strongly
        // the truncated proposal window favours the move.
        let mut log_acc = -1.0;
        assert!(!sampler.accept_proposal(5.0, &mut log_acc, &mut rng));
        // An improvement is accepted even when the window disfavours it.
        let mut log_acc = 1.0;
        assert!(sampler.accept_proposal(-5.0, &mut log_acc, &mut rng));
    }

    #[test]
    fn test_gaussian_prior_requires_a_positive_definite_covariance() {
        let prior_cov = ndarray::arr2(&[[0.1, 0.1], [0.1, 0.1]]);
        let mut prior = ParameterPrior::new(2, vec![0.0, 0.0], vec![1.0, 1.0], vec![]).unwrap();
        prior.set_covariance(prior_cov).unwrap();
        let bounds = SamplingBounds::full(&prior);
        let proxies = vec![LinearProxy::new(vec![1.0, 1.0], 0.5, 0.05)];
        let mut settings = SamplerSettings::new(20);
        settings.parameter_distribution = ParameterDistribution::MultivariateGaussian;
        assert!(McmcSampler::new(proxies, prior, bounds, settings).is_err());
    }

    #[test]
    fn test_metropolis_sample_average_matches_the_reference() {
        let prior = ParameterPrior::new(1, vec![0.0], vec![1.0], vec![]).unwrap();
        let bounds = SamplingBounds::full(&prior);
        let proxies = vec![LinearProxy::new(vec![1.0], 0.5, 0.1)];
        let mut settings = SamplerSettings::new(200);
        settings.seed = 11;
        settings.max_iterations = 60;
        settings.parameter_distribution = ParameterDistribution::Marginal;
        let mut sampler = McmcSampler::new(proxies, prior, bounds, settings).unwrap();
        sampler
            .set_marginal_distribution_types(vec![MarginalDistributionType::Uniform])
            .unwrap();
        sampler.execute().unwrap();
        assert!(
            (sampler.statistics().p_avg()[0] - 0.5).abs() < 0.05,
            "sample average {} too far from 0.5",
            sampler.statistics().p_avg()[0]
        );
    }

    #[test]
    fn test_monte_carlo_samples_the_box() {
        let mut settings = SamplerSettings::new(100);
        settings.seed = 3;
        settings.step_method = StepMethod::MonteCarlo;
        settings.max_iterations = 30;
        let mut sampler = one_param_sampler(settings);
        sampler.execute().unwrap();
        // Prior-only sampling over [0, 1] centres near the midpoint
        assert!((sampler.statistics().p_avg()[0] - 0.5).abs() < 0.15);
    }

    #[test]
    fn test_same_seed_reproduces_the_sample() {
        let mut settings = SamplerSettings::new(30);
        settings.seed = 99;
        settings.max_iterations = 10;
        let mut a = one_param_sampler(settings.clone());
        let mut b = one_param_sampler(settings);
        a.execute().unwrap();
        b.execute().unwrap();
        assert_eq!(a.iteration_count(), b.iteration_count());
        assert_eq!(a.p_sample(), b.p_sample());
    }

    #[test]
    fn test_percentiles_are_monotone() {
        let mut settings = SamplerSettings::new(50);
        settings.seed = 5;
        settings.max_iterations = 15;
        let mut sampler = one_param_sampler(settings);
        sampler.execute().unwrap();
        let summary = sampler.p10_to_p90();
        assert_eq!(summary.len(), 1);
        let bins = &summary[0];
        assert_eq!(bins.len(), 9);
        for w in bins.windows(2) {
            assert!(w[0].0 <= w[1].0);
        }
    }

    #[test]
    fn test_adapt_std_dev_factor_targets_unit_chi2() {
        let mut settings = SamplerSettings::new(30);
        settings.seed = 11;
        // Tiny stated uncertainty makes the initial fit terrible
        let prior = ParameterPrior::new(1, vec![0.0], vec![1.0], vec![]).unwrap();
        let bounds = SamplingBounds::full(&prior);
        let proxies = vec![LinearProxy::new(vec![1.0], 2.0, 0.001)];
        let mut sampler = McmcSampler::new(proxies, prior, bounds, settings).unwrap();
        sampler.iterate_once().unwrap();
        sampler.adapt_std_dev_factor().unwrap();
        assert!(sampler.std_dev_factor() > 1.0);
        assert_eq!(sampler.iteration_count(), 1);
        assert!(sampler.best_matches().is_empty());
    }

    #[test]
    fn test_adapt_before_sampling_is_an_error() {
        let mut sampler = one_param_sampler(SamplerSettings::new(20));
        assert!(sampler.adapt_std_dev_factor().is_err());
    }

    #[test]
    fn test_categorical_chains_cover_all_combinations() {
        let prior =
            ParameterPrior::new(1, vec![0.0], vec![1.0], vec![vec![0, 1]]).unwrap();
        let bounds = SamplingBounds::full(&prior);
        // Dummy-encoded input: ordinal component plus one dummy
        let proxies = vec![LinearProxy::new(vec![1.0, 0.2], 0.5, 0.05)];
        let mut settings = SamplerSettings::new(40);
        settings.seed = 13;
        settings.max_iterations = 10;
        let mut sampler = McmcSampler::new(proxies, prior, bounds, settings).unwrap();
        assert_eq!(sampler.cat_combinations().len(), 2);
        sampler.execute().unwrap();
        assert_eq!(sampler.p_sample().len(), sampler.sample_size());
    }

    #[test]
    fn test_sorted_y_sample_matches_ranking() {
        let mut settings = SamplerSettings::new(30);
        settings.seed = 21;
        settings.max_iterations = 10;
        let mut sampler = one_param_sampler(settings);
        sampler.execute().unwrap();
        let ys = sampler.sorted_y_sample();
        assert_eq!(ys.len(), sampler.best_matches().len());
    }

    #[test]
    fn test_switching_to_marginal_prior_rebuilds_population() {
        let mut settings = SamplerSettings::new(20);
        settings.seed = 17;
        let mut sampler = one_param_sampler(settings);
        sampler.iterate_once().unwrap();
        sampler
            .set_parameter_distribution(ParameterDistribution::Marginal)
            .unwrap();
        assert_eq!(sampler.iteration_count(), 0);
        assert!(sampler.iterate_once().unwrap() > 0);
    }
}
