//! Plan graph
//!
//! Arena of operator nodes keyed by stable `OperatorId`s. Structure is
//! immutable during optimization; the mapping registry is the only writer
//! and works by swapping node kinds, never by breaking connections that
//! still have outside consumers.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use rheem_common::{OperatorId, Result, RheemError};

use crate::plan::operator::{LogicalOperator, OperatorKind, OperatorNode};
use crate::plan::slot::{InputRef, InputSlot, OutputRef, OutputSlot};

/// Traversal direction along connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Upstream,
    Downstream,
}

#[derive(Debug, Default)]
pub struct PlanGraph {
    operators: BTreeMap<OperatorId, OperatorNode>,
    next_id: u32,
}

impl PlanGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_operator(
        &mut self,
        name: impl Into<String>,
        kind: OperatorKind,
        inputs: Vec<InputSlot>,
        outputs: Vec<OutputSlot>,
    ) -> OperatorId {
        let id = OperatorId::new(self.next_id);
        self.next_id += 1;
        self.operators.insert(
            id,
            OperatorNode {
                id,
                name: name.into(),
                kind,
                inputs,
                outputs,
                epoch: 0,
                payload: None,
            },
        );
        id
    }

    pub fn set_payload(&mut self, id: OperatorId, payload: std::sync::Arc<dyn std::any::Any + Send + Sync>) {
        if let Some(node) = self.operators.get_mut(&id) {
            node.payload = Some(payload);
        }
    }

    pub fn get(&self, id: OperatorId) -> Option<&OperatorNode> {
        self.operators.get(&id)
    }

    pub fn get_mut(&mut self, id: OperatorId) -> Option<&mut OperatorNode> {
        self.operators.get_mut(&id)
    }

    pub fn require(&self, id: OperatorId) -> Result<&OperatorNode> {
        self.operators
            .get(&id)
            .ok_or_else(|| RheemError::Internal(format!("unknown operator {id}")))
    }

    /// All operators in id order (insertion order).
    pub fn operators(&self) -> impl Iterator<Item = &OperatorNode> {
        self.operators.values()
    }

    pub fn operator_ids(&self) -> impl Iterator<Item = OperatorId> + '_ {
        self.operators.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.operators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operators.is_empty()
    }

    /// Connect `output` to `input`. Fails if the input is already occupied
    /// or the declared types are incompatible.
    pub fn connect(&mut self, output: OutputRef, input: InputRef) -> Result<()> {
        let output_type = {
            let producer = self.require(output.operator)?;
            let slot = producer.outputs.get(output.index).ok_or_else(|| {
                RheemError::PlanSanity(format!("{producer} has no output slot {}", output.index))
            })?;
            slot.data_type.clone()
        };
        {
            let consumer = self.require(input.operator)?;
            let slot = consumer.inputs.get(input.index).ok_or_else(|| {
                RheemError::PlanSanity(format!("{consumer} has no input slot {}", input.index))
            })?;
            if slot.occupant.is_some() {
                return Err(RheemError::PlanSanity(format!(
                    "input slot {input} is already connected"
                )));
            }
            if !output_type.is_compatible_with(&slot.data_type) {
                return Err(RheemError::PlanSanity(format!(
                    "type mismatch on {output} -> {input}: {} vs {}",
                    output_type, slot.data_type
                )));
            }
        }
        self.operators
            .get_mut(&output.operator)
            .unwrap()
            .outputs[output.index]
            .consumers
            .push(input);
        self.operators.get_mut(&input.operator).unwrap().inputs[input.index].occupant =
            Some(output);
        Ok(())
    }

    /// Declared sinks: operators without output slots.
    pub fn sinks(&self) -> Vec<OperatorId> {
        self.operators
            .values()
            .filter(|node| node.is_sink())
            .map(|node| node.id)
            .collect()
    }

    /// Top-level sources: operators without input slots.
    pub fn sources(&self) -> Vec<OperatorId> {
        self.operators
            .values()
            .filter(|node| node.is_source())
            .map(|node| node.id)
            .collect()
    }

    /// Breadth-first traversal from `start`, invoking `callback` once per
    /// visited node. Does not descend into composite bodies.
    pub fn traverse(
        &self,
        start: &[OperatorId],
        direction: Direction,
        mut callback: impl FnMut(&OperatorNode),
    ) {
        let mut visited = BTreeSet::new();
        let mut queue: VecDeque<OperatorId> = start.iter().copied().collect();
        while let Some(id) = queue.pop_front() {
            if !visited.insert(id) {
                continue;
            }
            let node = match self.operators.get(&id) {
                Some(node) => node,
                None => continue,
            };
            callback(node);
            match direction {
                Direction::Upstream => {
                    for input in &node.inputs {
                        if let Some(occupant) = input.occupant {
                            queue.push_back(occupant.operator);
                        }
                    }
                }
                Direction::Downstream => {
                    for output in &node.outputs {
                        for consumer in &output.consumers {
                            queue.push_back(consumer.operator);
                        }
                    }
                }
            }
        }
    }

    /// Operators reachable upstream from the sinks.
    pub fn reachable_from_sinks(&self) -> BTreeSet<OperatorId> {
        let mut reachable = BTreeSet::new();
        self.traverse(&self.sinks(), Direction::Upstream, |node| {
            reachable.insert(node.id);
        });
        reachable
    }

    /// Topological order over all operators (Kahn), ties broken by id so
    /// the order is stable for equal plans.
    pub fn topological_order(&self) -> Result<Vec<OperatorId>> {
        // Feedback inputs of loop heads close the iteration cycle; they are
        // not ordering edges.
        let is_ordering_input = |node: &OperatorNode, index: usize| {
            !(matches!(node.logical(), Some(LogicalOperator::LoopHead)) && index > 0)
        };
        let mut in_degree: BTreeMap<OperatorId, usize> = self
            .operators
            .values()
            .map(|node| {
                let connected = node
                    .inputs
                    .iter()
                    .enumerate()
                    .filter(|(index, input)| input.occupant.is_some() && is_ordering_input(node, *index))
                    .count();
                (node.id, connected)
            })
            .collect();
        let mut ready: VecDeque<OperatorId> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(self.operators.len());
        while let Some(id) = ready.pop_front() {
            order.push(id);
            let node = &self.operators[&id];
            for output in &node.outputs {
                for consumer in &output.consumers {
                    let consumer_node = &self.operators[&consumer.operator];
                    if !is_ordering_input(consumer_node, consumer.index) {
                        continue;
                    }
                    let degree = in_degree.get_mut(&consumer.operator).unwrap();
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push_back(consumer.operator);
                    }
                }
            }
        }
        if order.len() != self.operators.len() {
            return Err(RheemError::PlanSanity(
                "plan contains a cycle outside of a loop".to_string(),
            ));
        }
        Ok(order)
    }

    /// Check the structural invariants: at least one sink, all required
    /// inputs connected, no cycles outside loops, loop bodies sane with a
    /// single well-placed head.
    pub fn is_sane(&self) -> Result<()> {
        if self.sinks().is_empty() {
            return Err(RheemError::PlanSanity("plan has no sinks".to_string()));
        }
        self.check_sanity(true)
    }

    fn check_sanity(&self, top_level: bool) -> Result<()> {
        for node in self.operators.values() {
            for (index, input) in node.inputs.iter().enumerate() {
                // Inside a composite body, unconnected inputs are the outer
                // slot anchors.
                if input.occupant.is_none() && top_level {
                    return Err(RheemError::PlanSanity(format!(
                        "{node} input {index} is not connected"
                    )));
                }
            }
            match &node.kind {
                OperatorKind::Loop(subplan) => {
                    let head = subplan.body.require(subplan.head)?;
                    if !matches!(
                        head.logical(),
                        Some(LogicalOperator::LoopHead)
                    ) {
                        return Err(RheemError::PlanSanity(format!(
                            "loop {node} head {head} is not a LoopHead operator"
                        )));
                    }
                    let heads = subplan
                        .body
                        .operators()
                        .filter(|inner| matches!(inner.logical(), Some(LogicalOperator::LoopHead)))
                        .count();
                    if heads != 1 {
                        return Err(RheemError::PlanSanity(format!(
                            "loop {node} has {heads} heads, expected exactly 1"
                        )));
                    }
                    subplan.body.check_sanity(false)?;
                }
                OperatorKind::Subplan(subplan) => {
                    subplan.body.check_sanity(false)?;
                }
                _ => {}
            }
        }
        self.topological_order().map(|_| ())
    }

    pub(crate) fn into_nodes(self) -> BTreeMap<OperatorId, OperatorNode> {
        self.operators
    }

    /// Splice every composite subplan into this graph, rewiring the outer
    /// connections onto the traced inner slots. Loops are kept as nested
    /// plans. Enumeration and lowering only see inlined plans.
    pub fn inline_subplans(&mut self) -> Result<()> {
        loop {
            let target = self
                .operators
                .iter()
                .find(|(_, node)| matches!(node.kind, OperatorKind::Subplan(_)))
                .map(|(id, _)| *id);
            let Some(id) = target else {
                return Ok(());
            };
            let node = self.operators.remove(&id).unwrap();
            let OperatorKind::Subplan(subplan) = node.kind else {
                unreachable!("checked above")
            };
            let crate::plan::operator::Subplan {
                body,
                input_map,
                output_map,
            } = subplan;

            let body_nodes = body.into_nodes();
            let mut id_map: BTreeMap<OperatorId, OperatorId> = BTreeMap::new();
            for old_id in body_nodes.keys() {
                id_map.insert(*old_id, OperatorId::new(self.next_id));
                self.next_id += 1;
            }
            for (old_id, mut body_node) in body_nodes {
                let new_id = id_map[&old_id];
                body_node.id = new_id;
                for input in &mut body_node.inputs {
                    if let Some(occupant) = &mut input.occupant {
                        occupant.operator = id_map[&occupant.operator];
                    }
                }
                for output in &mut body_node.outputs {
                    for consumer in &mut output.consumers {
                        consumer.operator = id_map[&consumer.operator];
                    }
                }
                self.operators.insert(new_id, body_node);
            }

            // Rewire the outer connections onto the traced inner slots.
            for (outer_index, inner_ref) in input_map.iter().enumerate() {
                let inner = InputRef::new(id_map[&inner_ref.operator], inner_ref.index);
                if let Some(occupant) = node.inputs[outer_index].occupant {
                    let producer = self.operators.get_mut(&occupant.operator).unwrap();
                    for consumer in &mut producer.outputs[occupant.index].consumers {
                        if consumer.operator == id && consumer.index == outer_index {
                            *consumer = inner;
                        }
                    }
                    self.operators.get_mut(&inner.operator).unwrap().inputs[inner.index].occupant =
                        Some(occupant);
                }
            }
            for (outer_index, inner_ref) in output_map.iter().enumerate() {
                let inner = OutputRef::new(id_map[&inner_ref.operator], inner_ref.index);
                for consumer in node.outputs[outer_index].consumers.clone() {
                    self.operators
                        .get_mut(&consumer.operator)
                        .unwrap()
                        .inputs[consumer.index]
                        .occupant = Some(inner);
                    self.operators
                        .get_mut(&inner.operator)
                        .unwrap()
                        .outputs[inner.index]
                        .consumers
                        .push(consumer);
                }
            }
        }
    }

    /// Drop operators not reachable from any sink. Returns the removed ids.
    pub fn prune(&mut self) -> Vec<OperatorId> {
        let reachable = self.reachable_from_sinks();
        let removed: Vec<OperatorId> = self
            .operators
            .keys()
            .copied()
            .filter(|id| !reachable.contains(id))
            .collect();
        for id in &removed {
            self.operators.remove(id);
        }
        // Disconnect dangling consumer references.
        for node in self.operators.values_mut() {
            for output in &mut node.outputs {
                output.consumers.retain(|c| reachable.contains(&c.operator));
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::operator::LogicalOperator;
    use crate::plan::slot::DataUnitType;

    fn source_node(graph: &mut PlanGraph, cardinality: u64) -> OperatorId {
        graph.add_operator(
            "source",
            OperatorKind::Logical(LogicalOperator::Source {
                cardinality: Some(cardinality),
            }),
            vec![],
            vec![OutputSlot::new("out", DataUnitType::any())],
        )
    }

    fn sink_node(graph: &mut PlanGraph) -> OperatorId {
        graph.add_operator(
            "sink",
            OperatorKind::Logical(LogicalOperator::Sink),
            vec![InputSlot::new("in", DataUnitType::any())],
            vec![],
        )
    }

    #[test]
    fn test_connect_and_traverse() {
        let mut graph = PlanGraph::new();
        let source = source_node(&mut graph, 10);
        let map = graph.add_operator(
            "map",
            OperatorKind::Logical(LogicalOperator::Map),
            vec![InputSlot::new("in", DataUnitType::any())],
            vec![OutputSlot::new("out", DataUnitType::any())],
        );
        let sink = sink_node(&mut graph);
        graph.connect(OutputRef::new(source, 0), InputRef::new(map, 0)).unwrap();
        graph.connect(OutputRef::new(map, 0), InputRef::new(sink, 0)).unwrap();

        assert!(graph.is_sane().is_ok());
        let order = graph.topological_order().unwrap();
        assert_eq!(order, vec![source, map, sink]);

        let mut seen = Vec::new();
        graph.traverse(&[sink], Direction::Upstream, |node| seen.push(node.id));
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn test_double_connection_rejected() {
        let mut graph = PlanGraph::new();
        let a = source_node(&mut graph, 1);
        let b = source_node(&mut graph, 1);
        let sink = sink_node(&mut graph);
        graph.connect(OutputRef::new(a, 0), InputRef::new(sink, 0)).unwrap();
        let err = graph.connect(OutputRef::new(b, 0), InputRef::new(sink, 0));
        assert!(matches!(err, Err(RheemError::PlanSanity(_))));
    }

    #[test]
    fn test_empty_plan_is_not_sane() {
        let graph = PlanGraph::new();
        assert!(matches!(graph.is_sane(), Err(RheemError::PlanSanity(_))));
    }

    #[test]
    fn test_dangling_input_is_not_sane() {
        let mut graph = PlanGraph::new();
        sink_node(&mut graph);
        assert!(matches!(graph.is_sane(), Err(RheemError::PlanSanity(_))));
    }

    #[test]
    fn test_prune_drops_unreachable() {
        let mut graph = PlanGraph::new();
        let source = source_node(&mut graph, 10);
        let sink = sink_node(&mut graph);
        let orphan = source_node(&mut graph, 99);
        graph.connect(OutputRef::new(source, 0), InputRef::new(sink, 0)).unwrap();

        let removed = graph.prune();
        assert_eq!(removed, vec![orphan]);
        assert!(graph.get(orphan).is_none());
        assert!(graph.is_sane().is_ok());
    }
}
