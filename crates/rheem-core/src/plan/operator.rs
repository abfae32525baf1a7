//! Operator model
//!
//! Operators form a closed sum: elementary logical operators, execution
//! operators bound to one platform, alternative bundles produced by the
//! mapping registry, and composite/loop operators embedding a nested plan.
//! Capabilities (execution, source, sink, loop head) are expressed through
//! the variant and the `ExecutionOperator` trait rather than a hierarchy.

use std::any::Any;
use std::sync::Arc;

use rheem_common::{OperatorId, PlatformId, Result};

use crate::optimizer::costs::LoadProfileEstimator;
use crate::plan::graph::PlanGraph;
use crate::plan::slot::{InputRef, InputSlot, OutputRef, OutputSlot};
use crate::platform::channel::{ChannelDescriptor, ChannelInstance};

/// Elementary, platform-agnostic operators. Each variant carries the
/// parameters its cardinality estimator needs.
#[derive(Debug, Clone, PartialEq)]
pub enum LogicalOperator {
    /// Emits a dataset; `cardinality` is the declared size if known.
    Source { cardinality: Option<u64> },
    Map,
    FlatMap { expansion: f64 },
    Filter { selectivity: f64 },
    /// Global aggregation; always produces a single data unit.
    Reduce,
    /// Key-wise aggregation; produces roughly `group_factor * input` units.
    ReduceBy { group_factor: f64 },
    GroupBy { group_factor: f64 },
    Join { selectivity: f64 },
    Union,
    Distinct { uniqueness: f64 },
    Sort,
    Count,
    Sample { sample_size: u64 },
    Sink,
    /// Head of a loop body: inputs (initial, feedback), outputs (iteration,
    /// final).
    LoopHead,
}

impl LogicalOperator {
    /// Short tag used for mapping patterns and signatures.
    pub fn tag(&self) -> &'static str {
        match self {
            LogicalOperator::Source { .. } => "Source",
            LogicalOperator::Map => "Map",
            LogicalOperator::FlatMap { .. } => "FlatMap",
            LogicalOperator::Filter { .. } => "Filter",
            LogicalOperator::Reduce => "Reduce",
            LogicalOperator::ReduceBy { .. } => "ReduceBy",
            LogicalOperator::GroupBy { .. } => "GroupBy",
            LogicalOperator::Join { .. } => "Join",
            LogicalOperator::Union => "Union",
            LogicalOperator::Distinct { .. } => "Distinct",
            LogicalOperator::Sort => "Sort",
            LogicalOperator::Count => "Count",
            LogicalOperator::Sample { .. } => "Sample",
            LogicalOperator::Sink => "Sink",
            LogicalOperator::LoopHead => "LoopHead",
        }
    }
}

/// An operator implementation bound to one platform. This is the contract
/// every backend adapter fulfills; the core never interprets payloads.
pub trait ExecutionOperator: Send + Sync {
    /// Implementation name, e.g. `BasicMapOperator`. Unique per platform.
    fn name(&self) -> &str;

    fn platform(&self) -> PlatformId;

    fn num_inputs(&self) -> usize;

    fn num_outputs(&self) -> usize;

    /// Channel descriptors acceptable at input slot `index`, by preference.
    fn supported_input_channels(&self, index: usize) -> Vec<ChannelDescriptor>;

    /// Channel descriptors this operator can emit at output slot `index`.
    fn supported_output_channels(&self, index: usize) -> Vec<ChannelDescriptor>;

    /// Configuration key under which a load profile may be specified,
    /// e.g. `rheem.basic.map.load`.
    fn load_profile_key(&self) -> Option<String> {
        None
    }

    /// Built-in load profile estimator; lowest-priority layer.
    fn base_load_estimator(&self) -> Option<LoadProfileEstimator> {
        None
    }

    /// Run the operator. Inputs are produced channel instances; outputs are
    /// unproduced instances the operator must fill.
    fn evaluate(
        &self,
        inputs: &[Arc<ChannelInstance>],
        outputs: &[Arc<ChannelInstance>],
    ) -> Result<()>;

    /// Whether this operator only bridges channel formats.
    fn is_conversion(&self) -> bool {
        false
    }
}

impl std::fmt::Debug for dyn ExecutionOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name(), self.platform())
    }
}

/// Hyperplan node: the original logical operator plus all execution
/// alternatives discovered by the mapping registry. Insertion-ordered and
/// deduplicated by (platform, operator name).
#[derive(Debug, Clone)]
pub struct OperatorAlternatives {
    pub original: LogicalOperator,
    pub alternatives: Vec<Arc<dyn ExecutionOperator>>,
}

impl OperatorAlternatives {
    pub fn new(original: LogicalOperator) -> Self {
        Self {
            original,
            alternatives: Vec::new(),
        }
    }

    /// Add an alternative unless one with the same (platform, name) exists.
    /// Returns whether the alternative was new.
    pub fn add(&mut self, alternative: Arc<dyn ExecutionOperator>) -> bool {
        let duplicate = self.alternatives.iter().any(|existing| {
            existing.platform() == alternative.platform() && existing.name() == alternative.name()
        });
        if !duplicate {
            self.alternatives.push(alternative);
        }
        !duplicate
    }
}

/// A composite operator: a nested plan whose outer slots map onto inner
/// slots.
#[derive(Debug)]
pub struct Subplan {
    pub body: PlanGraph,
    /// Per outer input slot: the inner input slot it feeds.
    pub input_map: Vec<InputRef>,
    /// Per outer output slot: the inner output slot it exposes.
    pub output_map: Vec<OutputRef>,
}

impl Subplan {
    /// Trace an outer output slot to the inner slot that produces it.
    pub fn trace_output(&self, outer_index: usize) -> Option<OutputRef> {
        self.output_map.get(outer_index).copied()
    }

    pub fn trace_input(&self, outer_index: usize) -> Option<InputRef> {
        self.input_map.get(outer_index).copied()
    }
}

/// An iterative composite. The body contains a distinguished `LoopHead`
/// operator; the head's inputs are (initial, feedback) and its outputs are
/// (iteration, final). With `n` expected iterations the optimizer keeps
/// `n + 1` iteration contexts: the head runs once more to emit the final
/// state.
#[derive(Debug)]
pub struct LoopSubplan {
    pub body: PlanGraph,
    pub head: OperatorId,
    pub num_expected_iterations: u64,
    pub input_map: Vec<InputRef>,
    pub output_map: Vec<OutputRef>,
}

impl LoopSubplan {
    pub fn trace_output(&self, outer_index: usize) -> Option<OutputRef> {
        self.output_map.get(outer_index).copied()
    }

    pub fn trace_input(&self, outer_index: usize) -> Option<InputRef> {
        self.input_map.get(outer_index).copied()
    }
}

/// The closed set of operator variants.
#[derive(Debug)]
pub enum OperatorKind {
    Logical(LogicalOperator),
    Execution(Arc<dyn ExecutionOperator>),
    Alternatives(OperatorAlternatives),
    Subplan(Subplan),
    Loop(LoopSubplan),
}

/// A node in the plan graph.
pub struct OperatorNode {
    pub id: OperatorId,
    pub name: String,
    pub kind: OperatorKind,
    pub inputs: Vec<InputSlot>,
    pub outputs: Vec<OutputSlot>,
    /// Rewrite round in which this node reached its current shape.
    pub epoch: u32,
    /// Opaque operator payload (e.g. a UDF descriptor); interpreted only by
    /// mappings and backend adapters.
    pub payload: Option<Arc<dyn Any + Send + Sync>>,
}

impl OperatorNode {
    pub fn is_source(&self) -> bool {
        self.inputs.is_empty()
    }

    pub fn is_sink(&self) -> bool {
        self.outputs.is_empty()
    }

    pub fn is_loop(&self) -> bool {
        matches!(self.kind, OperatorKind::Loop(_))
    }

    /// The logical operator this node represents, looking through
    /// alternative bundles.
    pub fn logical(&self) -> Option<&LogicalOperator> {
        match &self.kind {
            OperatorKind::Logical(op) => Some(op),
            OperatorKind::Alternatives(alternatives) => Some(&alternatives.original),
            _ => None,
        }
    }

    pub fn alternatives(&self) -> Option<&OperatorAlternatives> {
        match &self.kind {
            OperatorKind::Alternatives(alternatives) => Some(alternatives),
            _ => None,
        }
    }

    pub fn as_loop(&self) -> Option<&LoopSubplan> {
        match &self.kind {
            OperatorKind::Loop(subplan) => Some(subplan),
            _ => None,
        }
    }

    /// Payload downcast helper for mappings.
    pub fn payload_as<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.payload.clone().and_then(|p| p.downcast::<T>().ok())
    }
}

impl std::fmt::Display for OperatorNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name, self.id)
    }
}

impl std::fmt::Debug for OperatorNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperatorNode")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("epoch", &self.epoch)
            .finish()
    }
}
