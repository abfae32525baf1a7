//! Rheem Core - cross-platform cost-based optimizer and execution driver
//!
//! Users describe a data-flow plan in a platform-neutral algebra; the core
//! rewrites it into a hyperplan of execution alternatives, estimates
//! cardinalities and costs, searches channel conversions between backends,
//! enumerates and prunes concrete implementations, and drives the cheapest
//! one stage by stage with measurement-driven re-optimization.

pub mod driver;
pub mod mapping;
pub mod optimizer;
pub mod plan;
pub mod platform;
pub mod profiling;

pub use driver::{Job, JobSummary};
pub use mapping::{
    Mapping, MappingRegistry, OperatorPattern, PlanTransformation, ReplacementFactory,
    SubplanMatch, SubplanPattern,
};
pub use optimizer::{
    ChannelConversion, ChannelConversionGraph, LoadEstimatorOverrides, LoadExpr, LoadProfile,
    LoadProfileEstimator, OptimizationContext, PlanEnumerator, PlanImplementation,
    ResourceEstimator,
};
pub use plan::{
    DataUnitType, ExecutionOperator, InputRef, InputSlot, LogicalOperator, LoopSubplan,
    OperatorKind, OperatorNode, OutputRef, OutputSlot, PlanGraph, Subplan,
};
pub use platform::channel::{ChannelDescriptor, ChannelInstance, Payload};
pub use platform::state::{ExecutionState, OperatorExecution, PartialExecution};
pub use platform::{Executor, Platform, PlatformRegistry};
pub use profiling::ExecutionLog;
