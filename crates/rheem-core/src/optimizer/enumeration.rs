//! Plan enumeration
//!
//! Bottom-up enumeration over the hyperplan: each node's execution
//! alternatives form a singleton enumeration, adjacent enumerations are
//! concatenated across their shared connections by resolving channel
//! junctions, and the configured pruning strategies cut the population
//! after every concatenation. Loops are enumerated recursively and
//! instantiated once per iteration context. Ties break by insertion order,
//! so enumeration is deterministic.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use rheem_common::{
    CardinalityEstimate, Configuration, OperatorId, PlatformId, ProbabilisticDoubleInterval,
    Result, RheemError, TimeEstimate,
};

use crate::optimizer::channel_graph::{
    ChannelConversionGraph, ConsumerRequest, Junction,
};
use crate::optimizer::context::OptimizationContext;
use crate::optimizer::pruning::PruningStrategy;
use crate::plan::{OperatorKind, OperatorNode, OutputRef, PlanGraph};
use crate::platform::channel::ChannelDescriptor;

/// One coherent choice of execution operators and junctions.
#[derive(Debug, Clone, Default)]
pub struct PlanImplementation {
    /// Hyperplan node -> index into its alternative list.
    pub operators: BTreeMap<OperatorId, usize>,
    /// Resolved junction per producer output slot.
    pub junctions: BTreeMap<OutputRef, Arc<Junction>>,
    /// Chosen body implementation per loop node.
    pub loops: BTreeMap<OperatorId, Arc<LoopImplementation>>,
    pub time_estimate: TimeEstimate,
    pub cost_estimate: ProbabilisticDoubleInterval,
}

impl PlanImplementation {
    /// Signature for peer grouping: the chosen platform per operator.
    pub fn signature(&self, graph: &PlanGraph) -> Vec<(OperatorId, PlatformId)> {
        self.operators
            .iter()
            .filter_map(|(id, alternative)| {
                graph
                    .get(*id)
                    .and_then(|node| node.alternatives())
                    .and_then(|alternatives| alternatives.alternatives.get(*alternative))
                    .map(|op| (*id, op.platform()))
            })
            .collect()
    }

    /// Platforms involved in this implementation.
    pub fn platforms(&self, graph: &PlanGraph) -> BTreeSet<PlatformId> {
        let mut platforms: BTreeSet<PlatformId> = self
            .signature(graph)
            .into_iter()
            .map(|(_, platform)| platform)
            .collect();
        for junction in self.junctions.values() {
            for step in &junction.steps {
                platforms.insert(step.operator.platform());
            }
        }
        for loop_implementation in self.loops.values() {
            platforms.extend(loop_implementation.platforms.iter().cloned());
        }
        platforms
    }

    fn merge(&self, other: &PlanImplementation) -> PlanImplementation {
        let mut merged = self.clone();
        merged.operators.extend(other.operators.clone());
        merged.junctions.extend(other.junctions.clone());
        merged.loops.extend(other.loops.clone());
        merged.time_estimate = self.time_estimate.plus(&other.time_estimate);
        merged.cost_estimate = self.cost_estimate.plus(&other.cost_estimate);
        merged
    }

    fn add_junction(&mut self, output: OutputRef, junction: Arc<Junction>) {
        self.time_estimate = self.time_estimate.plus(&junction.time_estimate);
        self.cost_estimate = self.cost_estimate.plus(&junction.cost_estimate);
        self.junctions.insert(output, junction);
    }
}

/// The enumerated body of a loop, shared by all its iterations.
#[derive(Debug, Clone)]
pub struct LoopImplementation {
    pub body: PlanImplementation,
    pub platforms: BTreeSet<PlatformId>,
}

/// A set of candidate implementations covering the same scope.
#[derive(Debug, Default)]
pub struct PlanEnumeration {
    pub scope: BTreeSet<OperatorId>,
    pub implementations: Vec<PlanImplementation>,
}

impl PlanEnumeration {
    /// The cheapest implementation under the expectation comparator;
    /// insertion order breaks ties (a later implementation must be
    /// strictly cheaper to displace an earlier one).
    pub fn best(&self) -> Option<&PlanImplementation> {
        self.implementations.iter().reduce(|best, next| {
            if next
                .cost_estimate
                .compare_by_expectation(&best.cost_estimate)
                == std::cmp::Ordering::Less
            {
                next
            } else {
                best
            }
        })
    }
}

/// Bottom-up plan enumerator over a hyperplan.
pub struct PlanEnumerator<'a> {
    graph: &'a PlanGraph,
    context: &'a OptimizationContext,
    configuration: &'a Configuration,
    conversions: &'a ChannelConversionGraph,
    active_platforms: Vec<PlatformId>,
    pruning: Vec<Box<dyn PruningStrategy>>,
    /// Output channels of already-executed producers, fixed by the runtime.
    boundary: BTreeMap<OutputRef, ChannelDescriptor>,
    /// Operators that already executed and need no new implementation.
    executed: BTreeSet<OperatorId>,
    junction_cache: HashMap<JunctionKey, Option<Arc<Junction>>>,
}

type JunctionKey = (OutputRef, Option<usize>, Vec<(OperatorId, usize, usize)>);

impl<'a> PlanEnumerator<'a> {
    pub fn new(
        graph: &'a PlanGraph,
        context: &'a OptimizationContext,
        configuration: &'a Configuration,
        conversions: &'a ChannelConversionGraph,
        active_platforms: Vec<PlatformId>,
        pruning: Vec<Box<dyn PruningStrategy>>,
    ) -> Self {
        Self {
            graph,
            context,
            configuration,
            conversions,
            active_platforms,
            pruning,
            boundary: BTreeMap::new(),
            executed: BTreeSet::new(),
            junction_cache: HashMap::new(),
        }
    }

    /// Restrict enumeration to the unexecuted remainder of the plan. Open
    /// channels pin the producer-side descriptors of boundary junctions.
    pub fn with_executed(
        mut self,
        executed: BTreeSet<OperatorId>,
        open_channels: BTreeMap<OutputRef, ChannelDescriptor>,
    ) -> Self {
        self.executed = executed;
        self.boundary = open_channels;
        self
    }

    /// Run the enumeration. An empty result is a `NoViablePlan` error.
    pub fn enumerate(mut self) -> Result<PlanEnumeration> {
        let order = self.graph.topological_order()?;
        let mut current: Option<PlanEnumeration> = None;

        for id in order {
            if self.executed.contains(&id) {
                continue;
            }
            let node = self.graph.require(id)?;
            let unit = match &node.kind {
                OperatorKind::Alternatives(_) => self.enumerate_alternatives(node)?,
                OperatorKind::Loop(_) => self.enumerate_loop(node)?,
                OperatorKind::Execution(_) => {
                    return Err(RheemError::Internal(format!(
                        "unexpected bare execution operator {node} in hyperplan"
                    )))
                }
                OperatorKind::Logical(_) => {
                    return Err(RheemError::NoViablePlan(format!(
                        "no execution alternatives for {node}"
                    )))
                }
                OperatorKind::Subplan(_) => {
                    return Err(RheemError::Internal(format!(
                        "composite {node} must be inlined before enumeration"
                    )))
                }
            };
            current = Some(match current {
                None => unit,
                Some(current) => self.concatenate(current, unit)?,
            });
        }

        let mut enumeration = current.unwrap_or_default();
        if enumeration.implementations.is_empty() {
            return Err(RheemError::NoViablePlan(
                "enumeration produced no implementations".to_string(),
            ));
        }
        // Junctions out of executed producers whose consumers are all fresh.
        self.resolve_pending_junctions(&mut enumeration)?;
        if enumeration.implementations.is_empty() {
            return Err(RheemError::NoViablePlan(
                "no channel conversion path between the required platforms".to_string(),
            ));
        }
        Ok(enumeration)
    }

    /// Singleton enumeration: one implementation per feasible alternative.
    fn enumerate_alternatives(&self, node: &OperatorNode) -> Result<PlanEnumeration> {
        let alternatives = node.alternatives().expect("checked by caller");
        let operator_context = self
            .context
            .operator(node.id)
            .ok_or_else(|| RheemError::Internal(format!("no context for {node}")))?;
        let mut implementations = Vec::new();
        for (index, alternative) in alternatives.alternatives.iter().enumerate() {
            if !self.active_platforms.contains(&alternative.platform()) {
                continue;
            }
            let cost = operator_context.alternative_costs.get(index).ok_or_else(|| {
                RheemError::Internal(format!("missing cost estimate for {node} alternative {index}"))
            })?;
            let mut operators = BTreeMap::new();
            operators.insert(node.id, index);
            implementations.push(PlanImplementation {
                operators,
                junctions: BTreeMap::new(),
                loops: BTreeMap::new(),
                time_estimate: cost.time_estimate,
                cost_estimate: cost.cost_estimate,
            });
        }
        if implementations.is_empty() {
            return Err(RheemError::NoViablePlan(format!(
                "no active-platform alternative for {node}"
            )));
        }
        Ok(PlanEnumeration {
            scope: BTreeSet::from([node.id]),
            implementations,
        })
    }

    /// Enumerate a loop: the body is enumerated once against the initial
    /// iteration context, then each body implementation is costed across
    /// all iteration contexts (the final context runs only the head).
    fn enumerate_loop(&self, node: &OperatorNode) -> Result<PlanEnumeration> {
        let subplan = node.as_loop().expect("checked by caller");
        let loop_context = self
            .context
            .loop_context(node.id)
            .ok_or_else(|| RheemError::Internal(format!("no loop context for {node}")))?;

        let body_enumerator = PlanEnumerator::new(
            &subplan.body,
            loop_context.initial(),
            self.configuration,
            self.conversions,
            self.active_platforms.clone(),
            crate::optimizer::pruning::strategies_from_configuration(self.configuration),
        );
        let body_enumeration = body_enumerator.enumerate()?;

        let mut implementations = Vec::new();
        for body in &body_enumeration.implementations {
            let mut time_estimate = TimeEstimate::ZERO;
            let mut cost_estimate = ProbabilisticDoubleInterval::zero();
            let num_contexts = loop_context.iteration_contexts.len();
            for (iteration, iteration_context) in loop_context.iteration_contexts.iter().enumerate()
            {
                let head_only = iteration + 1 == num_contexts;
                for (op, alternative) in &body.operators {
                    if head_only && *op != subplan.head {
                        continue;
                    }
                    let Some(cost) = iteration_context
                        .operator(*op)
                        .and_then(|c| c.alternative_costs.get(*alternative))
                    else {
                        continue;
                    };
                    time_estimate = time_estimate.plus(&cost.time_estimate);
                    cost_estimate = cost_estimate.plus(&cost.cost_estimate);
                }
                if !head_only {
                    for junction in body.junctions.values() {
                        time_estimate = time_estimate.plus(&junction.time_estimate);
                        cost_estimate = cost_estimate.plus(&junction.cost_estimate);
                    }
                }
            }
            let platforms = body.platforms(&subplan.body);
            let mut operators = BTreeMap::new();
            // The loop node itself is represented by its body choice.
            operators.insert(node.id, 0);
            let mut loops = BTreeMap::new();
            loops.insert(
                node.id,
                Arc::new(LoopImplementation {
                    body: body.clone(),
                    platforms,
                }),
            );
            implementations.push(PlanImplementation {
                operators,
                junctions: BTreeMap::new(),
                loops,
                time_estimate,
                cost_estimate,
            });
        }

        Ok(PlanEnumeration {
            scope: BTreeSet::from([node.id]),
            implementations,
        })
    }

    /// Concatenate two enumerations: cartesian product, junction resolution
    /// for every connection that became internal, then pruning.
    fn concatenate(
        &mut self,
        left: PlanEnumeration,
        right: PlanEnumeration,
    ) -> Result<PlanEnumeration> {
        let mut scope = left.scope.clone();
        scope.extend(right.scope.iter().copied());

        // Connections whose producer and all unexecuted consumers are now
        // in scope, and that have no junction yet.
        let pending = self.pending_connections(&scope);

        let mut implementations = Vec::new();
        for left_implementation in &left.implementations {
            'pair: for right_implementation in &right.implementations {
                let mut merged = left_implementation.merge(right_implementation);
                for output in &pending {
                    if merged.junctions.contains_key(output) {
                        continue;
                    }
                    match self.resolve_junction(&merged, *output)? {
                        Some(junction) => merged.add_junction(*output, junction),
                        // No conversion path: this pairing is infeasible.
                        None => continue 'pair,
                    }
                }
                implementations.push(merged);
            }
        }

        let mut enumeration = PlanEnumeration {
            scope,
            implementations,
        };
        for strategy in &mut self.pruning {
            let before = enumeration.implementations.len();
            strategy.prune(self.graph, &mut enumeration);
            tracing::debug!(
                strategy = strategy.name(),
                before,
                after = enumeration.implementations.len(),
                "applied pruning"
            );
        }
        Ok(enumeration)
    }

    /// Output slots whose junction becomes resolvable once `scope` is
    /// merged: the producer is in scope (or executed) and every unexecuted
    /// consumer is in scope.
    fn pending_connections(&self, scope: &BTreeSet<OperatorId>) -> Vec<OutputRef> {
        let mut pending = Vec::new();
        for node in self.graph.operators() {
            let producer_available =
                scope.contains(&node.id) || self.executed.contains(&node.id);
            if !producer_available {
                continue;
            }
            for (output_index, output) in node.outputs.iter().enumerate() {
                let consumers: Vec<_> = output
                    .consumers
                    .iter()
                    .filter(|consumer| !self.executed.contains(&consumer.operator))
                    .collect();
                if consumers.is_empty() {
                    continue;
                }
                // Junctions rooted at executed producers resolve at the end.
                if self.executed.contains(&node.id) {
                    continue;
                }
                if consumers.iter().all(|consumer| scope.contains(&consumer.operator)) {
                    pending.push(OutputRef::new(node.id, output_index));
                }
            }
        }
        pending
    }

    /// Junctions from executed producers into the fresh part of the plan.
    fn resolve_pending_junctions(&mut self, enumeration: &mut PlanEnumeration) -> Result<()> {
        let boundary: Vec<(OutputRef, ChannelDescriptor)> = self
            .boundary
            .iter()
            .map(|(output, descriptor)| (*output, descriptor.clone()))
            .collect();
        let mut survivors = Vec::new();
        'implementation: for mut implementation in std::mem::take(&mut enumeration.implementations)
        {
            for (output, _descriptor) in &boundary {
                let node = self.graph.require(output.operator)?;
                let has_unexecuted_consumer = node.outputs[output.index]
                    .consumers
                    .iter()
                    .any(|consumer| !self.executed.contains(&consumer.operator));
                if !has_unexecuted_consumer {
                    continue;
                }
                match self.resolve_junction(&implementation, *output)? {
                    Some(junction) => implementation.add_junction(*output, junction),
                    None => continue 'implementation,
                }
            }
            survivors.push(implementation);
        }
        enumeration.implementations = survivors;
        Ok(())
    }

    /// Resolve (and cache) the junction for one producer output under the
    /// choices of `implementation`.
    fn resolve_junction(
        &mut self,
        implementation: &PlanImplementation,
        output: OutputRef,
    ) -> Result<Option<Arc<Junction>>> {
        let node = self.graph.require(output.operator)?;

        // Producer-side descriptors: fixed by the runtime for executed
        // producers, otherwise from the chosen alternative.
        let (producer_descriptors, producer_choice) = match self.boundary.get(&output) {
            Some(descriptor) => (vec![descriptor.clone()], None),
            None => {
                let choice = *implementation.operators.get(&output.operator).ok_or_else(|| {
                    RheemError::Internal(format!("junction producer {node} not in implementation"))
                })?;
                (
                    self.output_channels(implementation, node, output.index, choice)?,
                    Some(choice),
                )
            }
        };

        let mut consumers = Vec::new();
        let mut cache_consumers = Vec::new();
        for consumer in &node.outputs[output.index].consumers {
            if self.executed.contains(&consumer.operator) {
                continue;
            }
            let consumer_node = self.graph.require(consumer.operator)?;
            let choice = *implementation.operators.get(&consumer.operator).ok_or_else(|| {
                RheemError::Internal(format!(
                    "junction consumer {consumer_node} not in implementation"
                ))
            })?;
            let accepted = self.input_channels(implementation, consumer_node, consumer.index, choice)?;
            let broadcast = consumer_node.inputs[consumer.index].broadcast;
            cache_consumers.push((consumer.operator, consumer.index, choice));
            consumers.push(ConsumerRequest {
                accepted,
                broadcast,
            });
        }

        let key: JunctionKey = (output, producer_choice, cache_consumers);
        if let Some(cached) = self.junction_cache.get(&key) {
            return Ok(cached.clone());
        }

        let cardinality = self
            .context
            .operator(output.operator)
            .and_then(|c| c.output_cardinalities[output.index])
            .unwrap_or(CardinalityEstimate::exact(0));
        let junction = self
            .conversions
            .find_junction(
                &producer_descriptors,
                &consumers,
                &cardinality,
                self.configuration,
                &self.active_platforms,
            )
            .map(Arc::new);
        self.junction_cache.insert(key, junction.clone());
        Ok(junction)
    }

    /// Descriptors an implementation can emit at `node`'s output slot,
    /// looking through loops to the head alternative.
    fn output_channels(
        &self,
        implementation: &PlanImplementation,
        node: &OperatorNode,
        output_index: usize,
        choice: usize,
    ) -> Result<Vec<ChannelDescriptor>> {
        match &node.kind {
            OperatorKind::Alternatives(alternatives) => Ok(alternatives.alternatives[choice]
                .supported_output_channels(output_index)),
            OperatorKind::Loop(subplan) => {
                let loop_implementation = implementation.loops.get(&node.id).ok_or_else(|| {
                    RheemError::Internal(format!("no loop implementation for {node}"))
                })?;
                let inner = subplan.trace_output(output_index).ok_or_else(|| {
                    RheemError::Internal(format!("loop {node} lacks output trace {output_index}"))
                })?;
                let inner_node = subplan.body.require(inner.operator)?;
                let inner_choice =
                    *loop_implementation.body.operators.get(&inner.operator).ok_or_else(|| {
                        RheemError::Internal(format!("loop body misses {inner_node}"))
                    })?;
                self.output_channels_inner(&loop_implementation.body, inner_node, inner.index, inner_choice)
            }
            _ => Err(RheemError::Internal(format!(
                "cannot determine output channels of {node}"
            ))),
        }
    }

    fn output_channels_inner(
        &self,
        _implementation: &PlanImplementation,
        node: &OperatorNode,
        output_index: usize,
        choice: usize,
    ) -> Result<Vec<ChannelDescriptor>> {
        match &node.kind {
            OperatorKind::Alternatives(alternatives) => Ok(alternatives.alternatives[choice]
                .supported_output_channels(output_index)),
            _ => Err(RheemError::Internal(format!(
                "cannot determine output channels of {node}"
            ))),
        }
    }

    /// Descriptors an implementation accepts at `node`'s input slot.
    fn input_channels(
        &self,
        implementation: &PlanImplementation,
        node: &OperatorNode,
        input_index: usize,
        choice: usize,
    ) -> Result<Vec<ChannelDescriptor>> {
        match &node.kind {
            OperatorKind::Alternatives(alternatives) => {
                Ok(alternatives.alternatives[choice].supported_input_channels(input_index))
            }
            OperatorKind::Loop(subplan) => {
                let loop_implementation = implementation.loops.get(&node.id).ok_or_else(|| {
                    RheemError::Internal(format!("no loop implementation for {node}"))
                })?;
                let inner = subplan.trace_input(input_index).ok_or_else(|| {
                    RheemError::Internal(format!("loop {node} lacks input trace {input_index}"))
                })?;
                let inner_node = subplan.body.require(inner.operator)?;
                let inner_choice =
                    *loop_implementation.body.operators.get(&inner.operator).ok_or_else(|| {
                        RheemError::Internal(format!("loop body misses {inner_node}"))
                    })?;
                match &inner_node.kind {
                    OperatorKind::Alternatives(alternatives) => Ok(alternatives.alternatives
                        [inner_choice]
                        .supported_input_channels(inner.index)),
                    _ => Err(RheemError::Internal(format!(
                        "cannot determine input channels of {inner_node}"
                    ))),
                }
            }
            _ => Err(RheemError::Internal(format!(
                "cannot determine input channels of {node}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn implementation(lower: f64, upper: f64) -> PlanImplementation {
        PlanImplementation {
            cost_estimate: ProbabilisticDoubleInterval::new(lower, upper, 1.0),
            ..Default::default()
        }
    }

    #[test]
    fn test_best_breaks_ties_by_insertion_order() {
        let mut enumeration = PlanEnumeration::default();
        enumeration.implementations.push(implementation(10.0, 20.0));
        enumeration.implementations.push(implementation(10.0, 20.0));

        // Identical cost intervals: the earlier implementation wins.
        let best = enumeration.best().unwrap();
        assert!(std::ptr::eq(best, &enumeration.implementations[0]));
    }

    #[test]
    fn test_equal_expectation_prefers_tighter_upper_bound() {
        let mut enumeration = PlanEnumeration::default();
        enumeration.implementations.push(implementation(5.0, 25.0));
        enumeration.implementations.push(implementation(12.0, 18.0));

        // Both have expectation 15; the tighter interval wins.
        let best = enumeration.best().unwrap();
        assert!((best.cost_estimate.upper - 18.0).abs() < 1e-12);
    }

    #[test]
    fn test_best_prefers_cheaper_expectation() {
        let mut enumeration = PlanEnumeration::default();
        enumeration.implementations.push(implementation(10.0, 20.0));
        enumeration.implementations.push(implementation(2.0, 4.0));
        let best = enumeration.best().unwrap();
        assert!((best.cost_estimate.lower - 2.0).abs() < 1e-12);
    }
}
