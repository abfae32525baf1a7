//! Plan model: operators, slots, composites, loops, traversal.

pub mod graph;
pub mod operator;
pub mod slot;

pub use graph::{Direction, PlanGraph};
pub use operator::{
    ExecutionOperator, LogicalOperator, LoopSubplan, OperatorAlternatives, OperatorKind,
    OperatorNode, Subplan,
};
pub use slot::{DataUnitType, InputRef, InputSlot, OutputRef, OutputSlot};
