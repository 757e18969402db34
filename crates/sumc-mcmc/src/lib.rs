//! Multi-chain MCMC calibration against cheap response surrogates.
//!
//! The entry point is [`McmcSampler`], which draws a posterior sample of
//! model parameters by running many short Markov chains in parallel
//! against proxy responses, with variant behaviour for classic
//! Metropolis-Hastings, survival-of-the-fittest optimisation, and pure
//! prior (Monte Carlo) sampling.

pub mod likelihood;
pub mod partition;
pub mod prior;
pub mod proposer;
pub mod ranking;
pub mod sampler;
pub mod statistics;

pub use likelihood::MeasurementDistribution;
pub use partition::CatCombination;
pub use prior::{MarginalDistributionType, MarginalPrior, MvNormalPrior};
pub use proposer::StepProposer;
pub use ranking::BestMatches;
pub use sampler::{
    KrigingUsage, McmcSampler, ParameterDistribution, SamplerCheckpoint, SamplerSettings,
    SearchStatus, StepMethod,
};
pub use statistics::McmcStatistics;

pub use sumc_core::{SumcError, SumcResult};
