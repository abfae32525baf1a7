//! The cross-platform optimizer: cardinality estimation, cost model,
//! channel conversion search, plan enumeration and pruning.

pub mod cardinality;
pub mod channel_graph;
pub mod context;
pub mod costs;
pub mod enumeration;
pub mod load_expr;
pub mod pruning;

pub use cardinality::CardinalityEstimatorManager;
pub use channel_graph::{ChannelConversion, ChannelConversionGraph, ConsumerRequest, Junction};
pub use context::{AlternativeCost, LoopContext, OperatorContext, OptimizationContext};
pub use costs::{
    LoadEstimatorOverrides, LoadProfile, LoadProfileEstimator, LoadProfileToTimeConverter,
    LoadToTimeConverter, ResourceEstimator, TimeToCostConverter,
};
pub use enumeration::{LoopImplementation, PlanEnumeration, PlanEnumerator, PlanImplementation};
pub use load_expr::LoadExpr;
pub use pruning::{strategies_from_configuration, PruningStrategy};
