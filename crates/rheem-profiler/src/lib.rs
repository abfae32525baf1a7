//! Rheem Profiler - learns load profile coefficients from the execution
//! log via a genetic search.

pub mod app;
pub mod estimators;
pub mod ga;
pub mod space;

pub use app::{FittedModel, GeneticOptimizerApp};
pub use estimators::DynamicLoadProfileEstimator;
pub use ga::GeneticOptimizer;
pub use space::{Bitmask, Individual, OptimizationSpace, Variable};
