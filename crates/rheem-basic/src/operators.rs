//! Plan builder
//!
//! Fluent construction of logical plans over the platform-neutral algebra.
//! Each method adds one logical operator and carries its UDF descriptor as
//! an opaque payload for the mappings to pick up.

use std::sync::Arc;

use parking_lot::Mutex;
use rheem_core::plan::operator::{LogicalOperator, LoopSubplan, OperatorKind};
use rheem_core::plan::{DataUnitType, InputRef, InputSlot, OutputRef, OutputSlot, PlanGraph};

use crate::data::{
    BinaryFunction, Dataset, FilterDescriptor, FlatMapDescriptor, FlatMapFunction, JoinDescriptor,
    KeyFunction, MapDescriptor, Predicate, ReduceByDescriptor, ReduceDescriptor, SampleDescriptor,
    SinkDescriptor, SourceDescriptor, UnaryFunction, Value,
};

/// Handle to the open end of a data flow under construction.
#[derive(Debug, Clone, Copy)]
pub struct DataFlow {
    output: OutputRef,
}

pub struct PlanBuilder {
    graph: PlanGraph,
}

impl Default for PlanBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PlanBuilder {
    pub fn new() -> Self {
        Self {
            graph: PlanGraph::new(),
        }
    }

    fn value_type() -> DataUnitType {
        DataUnitType::of("value")
    }

    fn unary(
        &mut self,
        name: &str,
        operator: LogicalOperator,
        upstream: DataFlow,
        payload: Option<Arc<dyn std::any::Any + Send + Sync>>,
    ) -> DataFlow {
        let id = self.graph.add_operator(
            name,
            OperatorKind::Logical(operator),
            vec![InputSlot::new("in", Self::value_type())],
            vec![OutputSlot::new("out", Self::value_type())],
        );
        if let Some(payload) = payload {
            self.graph.set_payload(id, payload);
        }
        self.graph
            .connect(upstream.output, InputRef::new(id, 0))
            .expect("builder wiring is well-formed");
        DataFlow {
            output: OutputRef::new(id, 0),
        }
    }

    /// Source over an in-memory collection with known cardinality.
    pub fn read_collection(&mut self, values: impl IntoIterator<Item = Value>) -> DataFlow {
        let values: Dataset = values.into_iter().collect();
        let id = self.graph.add_operator(
            "source",
            OperatorKind::Logical(LogicalOperator::Source {
                cardinality: Some(values.len() as u64),
            }),
            vec![],
            vec![OutputSlot::new("out", Self::value_type())],
        );
        self.graph.set_payload(id, Arc::new(SourceDescriptor { values }));
        DataFlow {
            output: OutputRef::new(id, 0),
        }
    }

    /// Source with declared cardinality but platform-resolved contents
    /// (e.g. a database table); the payload is attached by the caller.
    pub fn read_declared(
        &mut self,
        name: &str,
        cardinality: u64,
        payload: Arc<dyn std::any::Any + Send + Sync>,
    ) -> DataFlow {
        let id = self.graph.add_operator(
            name,
            OperatorKind::Logical(LogicalOperator::Source {
                cardinality: Some(cardinality),
            }),
            vec![],
            vec![OutputSlot::new("out", Self::value_type())],
        );
        self.graph.set_payload(id, payload);
        DataFlow {
            output: OutputRef::new(id, 0),
        }
    }

    pub fn map(&mut self, upstream: DataFlow, function: UnaryFunction) -> DataFlow {
        self.unary(
            "map",
            LogicalOperator::Map,
            upstream,
            Some(Arc::new(MapDescriptor { function })),
        )
    }

    pub fn filter(&mut self, upstream: DataFlow, selectivity: f64, predicate: Predicate) -> DataFlow {
        self.unary(
            "filter",
            LogicalOperator::Filter { selectivity },
            upstream,
            Some(Arc::new(FilterDescriptor { predicate })),
        )
    }

    pub fn flat_map(
        &mut self,
        upstream: DataFlow,
        expansion: f64,
        function: FlatMapFunction,
    ) -> DataFlow {
        self.unary(
            "flat_map",
            LogicalOperator::FlatMap { expansion },
            upstream,
            Some(Arc::new(FlatMapDescriptor { function })),
        )
    }

    pub fn reduce(&mut self, upstream: DataFlow, function: BinaryFunction) -> DataFlow {
        self.unary(
            "reduce",
            LogicalOperator::Reduce,
            upstream,
            Some(Arc::new(ReduceDescriptor { function })),
        )
    }

    pub fn reduce_by(
        &mut self,
        upstream: DataFlow,
        group_factor: f64,
        key: KeyFunction,
        function: BinaryFunction,
    ) -> DataFlow {
        self.unary(
            "reduce_by",
            LogicalOperator::ReduceBy { group_factor },
            upstream,
            Some(Arc::new(ReduceByDescriptor { key, function })),
        )
    }

    pub fn distinct(&mut self, upstream: DataFlow, uniqueness: f64) -> DataFlow {
        self.unary("distinct", LogicalOperator::Distinct { uniqueness }, upstream, None)
    }

    pub fn sort(&mut self, upstream: DataFlow) -> DataFlow {
        self.unary("sort", LogicalOperator::Sort, upstream, None)
    }

    pub fn count(&mut self, upstream: DataFlow) -> DataFlow {
        self.unary("count", LogicalOperator::Count, upstream, None)
    }

    pub fn sample(&mut self, upstream: DataFlow, size: u64) -> DataFlow {
        self.unary(
            "sample",
            LogicalOperator::Sample { sample_size: size },
            upstream,
            Some(Arc::new(SampleDescriptor { size })),
        )
    }

    pub fn union(&mut self, left: DataFlow, right: DataFlow) -> DataFlow {
        let id = self.graph.add_operator(
            "union",
            OperatorKind::Logical(LogicalOperator::Union),
            vec![
                InputSlot::new("in0", Self::value_type()),
                InputSlot::new("in1", Self::value_type()),
            ],
            vec![OutputSlot::new("out", Self::value_type())],
        );
        self.graph.connect(left.output, InputRef::new(id, 0)).expect("builder wiring");
        self.graph.connect(right.output, InputRef::new(id, 1)).expect("builder wiring");
        DataFlow {
            output: OutputRef::new(id, 0),
        }
    }

    pub fn join(
        &mut self,
        left: DataFlow,
        right: DataFlow,
        selectivity: f64,
        left_key: KeyFunction,
        right_key: KeyFunction,
    ) -> DataFlow {
        let id = self.graph.add_operator(
            "join",
            OperatorKind::Logical(LogicalOperator::Join { selectivity }),
            vec![
                InputSlot::new("left", Self::value_type()),
                InputSlot::new("right", Self::value_type()),
            ],
            vec![OutputSlot::new("out", Self::value_type())],
        );
        self.graph
            .set_payload(id, Arc::new(JoinDescriptor { left_key, right_key }));
        self.graph.connect(left.output, InputRef::new(id, 0)).expect("builder wiring");
        self.graph.connect(right.output, InputRef::new(id, 1)).expect("builder wiring");
        DataFlow {
            output: OutputRef::new(id, 0),
        }
    }

    /// Iterate `body` a fixed number of times over the flowing state. The
    /// loop head's iteration output feeds the body, the body's result feeds
    /// back into the head, and the head's final output leaves the loop.
    pub fn repeat(
        &mut self,
        upstream: DataFlow,
        num_iterations: u64,
        body: impl FnOnce(&mut PlanBuilder, DataFlow) -> DataFlow,
    ) -> DataFlow {
        let mut body_builder = PlanBuilder::new();
        let head = body_builder.graph.add_operator(
            "loop_head",
            OperatorKind::Logical(LogicalOperator::LoopHead),
            vec![
                InputSlot::new("initial", Self::value_type()),
                InputSlot::new("feedback", Self::value_type()),
            ],
            vec![
                OutputSlot::new("iteration", Self::value_type()),
                OutputSlot::new("final", Self::value_type()),
            ],
        );
        let iteration_flow = DataFlow {
            output: OutputRef::new(head, 0),
        };
        let tail = body(&mut body_builder, iteration_flow);
        body_builder
            .graph
            .connect(tail.output, InputRef::new(head, 1))
            .expect("loop feedback wiring");

        let loop_id = self.graph.add_operator(
            "repeat",
            OperatorKind::Loop(LoopSubplan {
                body: body_builder.graph,
                head,
                num_expected_iterations: num_iterations,
                input_map: vec![InputRef::new(head, 0)],
                output_map: vec![OutputRef::new(head, 1)],
            }),
            vec![InputSlot::new("in", Self::value_type())],
            vec![OutputSlot::new("out", Self::value_type())],
        );
        self.graph
            .connect(upstream.output, InputRef::new(loop_id, 0))
            .expect("builder wiring");
        DataFlow {
            output: OutputRef::new(loop_id, 0),
        }
    }

    /// Terminate the flow in a collecting sink; results appear in the
    /// returned handle after execution.
    pub fn collect(&mut self, upstream: DataFlow) -> Arc<Mutex<Dataset>> {
        let collector = Arc::new(Mutex::new(Vec::new()));
        let id = self.graph.add_operator(
            "collect",
            OperatorKind::Logical(LogicalOperator::Sink),
            vec![InputSlot::new("in", Self::value_type())],
            vec![],
        );
        self.graph.set_payload(
            id,
            Arc::new(SinkDescriptor {
                collector: Arc::clone(&collector),
            }),
        );
        self.graph
            .connect(upstream.output, InputRef::new(id, 0))
            .expect("builder wiring");
        collector
    }

    pub fn build(self) -> PlanGraph {
        self.graph
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_plan_is_sane() {
        let mut builder = PlanBuilder::new();
        let source = builder.read_collection((1..=10).map(Value::Int));
        let mapped = builder.map(source, Arc::new(|v: &Value| Value::Int(v.as_int().unwrap() + 1)));
        let _collector = builder.collect(mapped);
        let graph = builder.build();
        assert!(graph.is_sane().is_ok());
        assert_eq!(graph.len(), 3);
    }

    #[test]
    fn test_loop_plan_is_sane() {
        let mut builder = PlanBuilder::new();
        let source = builder.read_collection((1..=4).map(Value::Int));
        let looped = builder.repeat(source, 3, |body, flow| {
            body.map(flow, Arc::new(|v: &Value| Value::Int(v.as_int().unwrap() * 2)))
        });
        let _collector = builder.collect(looped);
        let graph = builder.build();
        assert!(graph.is_sane().is_ok());
    }
}
