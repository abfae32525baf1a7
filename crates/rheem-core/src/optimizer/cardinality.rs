//! Cardinality engine
//!
//! Every output slot gets an estimator derived from the owning operator's
//! logical variant; a configured fallback covers operators that do not
//! declare one. The push traversal starts at sources and propagates
//! estimates forward along connections and into loop bodies, once per
//! iteration context. Measured cardinalities from instrumented channels are
//! injected as exact estimates and trigger an incremental re-push.

use std::sync::Arc;

use rheem_common::{CardinalityEstimate, Configuration, Result, RheemError};

use crate::optimizer::context::OptimizationContext;
use crate::optimizer::costs::LoadEstimatorOverrides;
use crate::plan::{LogicalOperator, OperatorKind, OperatorNode, PlanGraph};
use crate::platform::channel::ChannelInstance;

/// Key for the fallback source cardinality used when a source does not
/// declare its size.
const FALLBACK_CARDINALITY_KEY: &str = "rheem.core.optimizer.cardinality.fallback";

/// Estimate the output cardinalities of a logical operator.
///
/// Certainty factors shade the correctness probability by how speculative
/// the estimator is: identity-like operators keep the input probability,
/// selectivity-based ones lose a little, joins lose half.
pub fn estimate_outputs(
    operator: &LogicalOperator,
    num_outputs: usize,
    inputs: &[CardinalityEstimate],
    configuration: &Configuration,
    warned_fallback: &mut bool,
) -> Vec<CardinalityEstimate> {
    let min_prob = inputs
        .iter()
        .map(|c| c.correctness_prob)
        .fold(1.0f64, f64::min);
    let first = inputs.first().copied().unwrap_or(CardinalityEstimate::exact(0));
    let estimate = match operator {
        LogicalOperator::Source { cardinality } => match cardinality {
            Some(cardinality) => CardinalityEstimate::exact(*cardinality),
            None => {
                let fallback = configuration.get_u64(FALLBACK_CARDINALITY_KEY, 1000);
                if !*warned_fallback {
                    tracing::warn!(
                        fallback,
                        "source without declared cardinality, using configured fallback"
                    );
                    *warned_fallback = true;
                }
                CardinalityEstimate::new(fallback, fallback, 0.5)
            }
        },
        LogicalOperator::Map | LogicalOperator::Sort => first,
        LogicalOperator::FlatMap { expansion } => first.scale(*expansion, 0.9),
        LogicalOperator::Filter { selectivity } => first.scale(*selectivity, 0.9),
        LogicalOperator::Reduce | LogicalOperator::Count => {
            CardinalityEstimate::new(1, 1, min_prob)
        }
        LogicalOperator::ReduceBy { group_factor } | LogicalOperator::GroupBy { group_factor } => {
            first.scale(*group_factor, 0.7)
        }
        LogicalOperator::Distinct { uniqueness } => first.scale(*uniqueness, 0.7),
        LogicalOperator::Join { selectivity } => {
            let left = first;
            let right = inputs.get(1).copied().unwrap_or(CardinalityEstimate::exact(0));
            CardinalityEstimate::new(
                (left.lower as f64 * right.lower as f64 * selectivity).round() as u64,
                (left.upper as f64 * right.upper as f64 * selectivity).round() as u64,
                min_prob * 0.5,
            )
        }
        LogicalOperator::Union => inputs
            .iter()
            .copied()
            .reduce(|a, b| a.plus(&b))
            .unwrap_or(CardinalityEstimate::exact(0)),
        LogicalOperator::Sample { sample_size } => CardinalityEstimate::new(
            (*sample_size).min(first.lower),
            (*sample_size).min(first.upper),
            min_prob,
        ),
        LogicalOperator::Sink => first,
        // The head forwards its live input: the feedback once the loop is
        // running, the initial input before that.
        LogicalOperator::LoopHead => first,
    };
    vec![estimate; num_outputs]
}

/// Push-based cardinality estimation over a plan (and its loops).
pub struct CardinalityEstimatorManager<'a> {
    graph: &'a PlanGraph,
    configuration: &'a Configuration,
    overrides: &'a LoadEstimatorOverrides,
}

impl<'a> CardinalityEstimatorManager<'a> {
    pub fn new(
        graph: &'a PlanGraph,
        configuration: &'a Configuration,
        overrides: &'a LoadEstimatorOverrides,
    ) -> Self {
        Self {
            graph,
            configuration,
            overrides,
        }
    }

    /// Full push: re-estimate, refresh cost estimates of marked operators,
    /// assert completeness, then clear the marks.
    pub fn push_cardinalities(&self, context: &mut OptimizationContext) -> Result<()> {
        let mut warned_fallback = false;
        push_level(self.graph, context, self.configuration, &mut warned_fallback)?;
        context.update_cost_estimates(self.graph, self.configuration, self.overrides);
        if !context.is_time_estimates_complete(self.graph) {
            return Err(RheemError::Internal(
                "cardinality push left operators without time estimates".to_string(),
            ));
        }
        context.clear_marks();
        Ok(())
    }

    /// Inject measured cardinalities from instrumented channel instances,
    /// then re-push. Measurements equal to the present estimate are no-ops.
    pub fn push_cardinality_updates(
        &self,
        context: &mut OptimizationContext,
        measurements: &[Arc<ChannelInstance>],
    ) -> Result<()> {
        for instance in measurements {
            self.inject_measured_cardinality(context, instance);
        }
        self.push_cardinalities(context)
    }

    fn inject_measured_cardinality(
        &self,
        context: &mut OptimizationContext,
        instance: &Arc<ChannelInstance>,
    ) {
        debug_assert!(instance.was_produced());
        let cardinality = match instance.measured_cardinality() {
            Some(cardinality) => cardinality,
            None => return,
        };
        let (operator, output_index) = match instance.producer() {
            Some(producer) => producer,
            None => return,
        };
        let operator_context =
            match context.find_context_mut(operator, instance.producer_iteration()) {
                Some(operator_context) => operator_context,
                None => {
                    tracing::warn!(%operator, "measured cardinality for unknown operator context");
                    return;
                }
            };
        let new = CardinalityEstimate::exact(cardinality);
        let old = operator_context.output_cardinalities[output_index];
        if old != Some(new) {
            tracing::info!(
                %operator,
                output_index,
                old = %old.map(|c| c.to_string()).unwrap_or_else(|| "none".to_string()),
                new = %new,
                "updating cardinality from measurement"
            );
            operator_context.set_output_cardinality(output_index, new);
        }
    }
}

/// Push estimates through one graph level in topological order.
fn push_level(
    graph: &PlanGraph,
    context: &mut OptimizationContext,
    configuration: &Configuration,
    warned_fallback: &mut bool,
) -> Result<()> {
    for id in graph.topological_order()? {
        let node = graph.require(id)?;
        match &node.kind {
            OperatorKind::Loop(_) => push_loop(graph, node, context, configuration, warned_fallback)?,
            _ => {
                let logical = match node.logical() {
                    Some(logical) => logical.clone(),
                    // Bare execution operators forward their first input.
                    None => LogicalOperator::Map,
                };
                let operator_context = context
                    .operator_mut(id)
                    .ok_or_else(|| RheemError::Internal(format!("no context for {id}")))?;
                // Re-estimate only fresh operators and those whose inputs
                // changed; an injected measurement on an output slot stays
                // authoritative until new upstream information arrives.
                let needs_estimate = operator_context
                    .output_cardinalities
                    .iter()
                    .any(|cardinality| cardinality.is_none())
                    || (0..operator_context.input_cardinalities.len())
                        .any(|index| operator_context.is_input_marked(index));
                if needs_estimate {
                    let inputs = operator_context.input_cardinalities_or_default();
                    let outputs = estimate_outputs(
                        &logical,
                        node.outputs.len(),
                        &inputs,
                        configuration,
                        warned_fallback,
                    );
                    for (index, estimate) in outputs.iter().enumerate() {
                        operator_context.set_output_cardinality(index, *estimate);
                    }
                }
                propagate_outputs(graph, node, context);
            }
        }
    }
    Ok(())
}

/// Copy marked output estimates of `node` onto its consumers' input slots.
/// Feedback inputs of loop heads are fed across iteration contexts instead.
fn propagate_outputs(graph: &PlanGraph, node: &OperatorNode, context: &mut OptimizationContext) {
    for (output_index, output) in node.outputs.iter().enumerate() {
        let estimate = match context
            .operator(node.id)
            .and_then(|c| c.output_cardinalities[output_index])
        {
            Some(estimate) => estimate,
            None => continue,
        };
        for consumer in &output.consumers {
            let is_feedback = graph
                .get(consumer.operator)
                .map(|n| matches!(n.logical(), Some(LogicalOperator::LoopHead)) && consumer.index > 0)
                .unwrap_or(false);
            if is_feedback {
                continue;
            }
            if let Some(consumer_context) = context.operator_mut(consumer.operator) {
                consumer_context.set_input_cardinality(consumer.index, estimate);
            }
        }
    }
}

/// Estimate a loop: run the body estimator once per iteration context,
/// feeding the head's feedback input from the previous iteration, then
/// expose the final head output on the outer loop node.
fn push_loop(
    outer_graph: &PlanGraph,
    node: &OperatorNode,
    context: &mut OptimizationContext,
    configuration: &Configuration,
    warned_fallback: &mut bool,
) -> Result<()> {
    let subplan = node.as_loop().expect("push_loop on non-loop");
    let outer_inputs: Vec<Option<CardinalityEstimate>> = context
        .operator(node.id)
        .map(|c| c.input_cardinalities.clone())
        .unwrap_or_default();

    let head_node = subplan.body.require(subplan.head)?;
    let feedback_source = head_node
        .inputs
        .get(1)
        .and_then(|input| input.occupant);

    let loop_context = context
        .loop_context_mut(node.id)
        .ok_or_else(|| RheemError::Internal(format!("no loop context for {node}")))?;

    let num_contexts = loop_context.iteration_contexts.len();
    let mut feedback_estimate: Option<CardinalityEstimate> = None;
    for iteration in 0..num_contexts {
        // Seed the anchored inputs of the body.
        {
            let iteration_context = &mut loop_context.iteration_contexts[iteration];
            for (outer_index, inner_ref) in subplan.input_map.iter().enumerate() {
                // The initial head input only applies before the first
                // iteration; broadcasts re-apply every round.
                let is_initial_head_input = inner_ref.operator == subplan.head && inner_ref.index == 0;
                if is_initial_head_input && iteration > 0 {
                    continue;
                }
                if let Some(estimate) = outer_inputs.get(outer_index).copied().flatten() {
                    if let Some(inner_context) = iteration_context.operator_mut(inner_ref.operator) {
                        inner_context.set_input_cardinality(inner_ref.index, estimate);
                    }
                }
            }
            if iteration > 0 {
                if let Some(estimate) = feedback_estimate {
                    if let Some(head_context) = iteration_context.operator_mut(subplan.head) {
                        head_context.set_input_cardinality(1, estimate);
                        // The head forwards its live input; after the first
                        // round that is the feedback.
                        head_context.set_input_cardinality(0, estimate);
                    }
                }
            }
        }
        let iteration_context = &mut loop_context.iteration_contexts[iteration];
        push_level(&subplan.body, iteration_context, configuration, warned_fallback)?;

        // Remember the feedback value for the next round.
        if let Some(feedback) = feedback_source {
            feedback_estimate = iteration_context
                .operator(feedback.operator)
                .and_then(|c| c.output_cardinalities[feedback.index]);
        }
    }

    // Expose the loop's outputs from the final iteration context.
    let mut outer_estimates = Vec::new();
    {
        let final_context = loop_context.final_context();
        for inner_ref in &subplan.output_map {
            outer_estimates.push(
                final_context
                    .operator(inner_ref.operator)
                    .and_then(|c| c.output_cardinalities[inner_ref.index]),
            );
        }
    }
    let operator_context = context
        .operator_mut(node.id)
        .ok_or_else(|| RheemError::Internal(format!("no context for {node}")))?;
    for (index, estimate) in outer_estimates.into_iter().enumerate() {
        if let Some(estimate) = estimate {
            operator_context.set_output_cardinality(index, estimate);
        }
    }
    propagate_outputs(outer_graph, node, context);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{DataUnitType, InputRef, InputSlot, OutputRef, OutputSlot};

    fn linear_plan() -> (PlanGraph, Vec<rheem_common::OperatorId>) {
        let mut graph = PlanGraph::new();
        let source = graph.add_operator(
            "source",
            OperatorKind::Logical(LogicalOperator::Source { cardinality: Some(1000) }),
            vec![],
            vec![OutputSlot::new("out", DataUnitType::any())],
        );
        let filter = graph.add_operator(
            "filter",
            OperatorKind::Logical(LogicalOperator::Filter { selectivity: 0.1 }),
            vec![InputSlot::new("in", DataUnitType::any())],
            vec![OutputSlot::new("out", DataUnitType::any())],
        );
        let sink = graph.add_operator(
            "sink",
            OperatorKind::Logical(LogicalOperator::Sink),
            vec![InputSlot::new("in", DataUnitType::any())],
            vec![],
        );
        graph.connect(OutputRef::new(source, 0), InputRef::new(filter, 0)).unwrap();
        graph.connect(OutputRef::new(filter, 0), InputRef::new(sink, 0)).unwrap();
        (graph, vec![source, filter, sink])
    }

    #[test]
    fn test_push_through_filter() {
        let (graph, ids) = linear_plan();
        let configuration = Configuration::new();
        let mut context = OptimizationContext::for_graph(&graph);
        let mut warned = false;
        push_level(&graph, &mut context, &configuration, &mut warned).unwrap();

        let filter_context = context.operator(ids[1]).unwrap();
        let estimate = filter_context.output_cardinalities[0].unwrap();
        assert_eq!(estimate.lower, 100);
        assert_eq!(estimate.upper, 100);
        assert!((estimate.correctness_prob - 0.9).abs() < 1e-12);

        let sink_context = context.operator(ids[2]).unwrap();
        assert_eq!(sink_context.input_cardinalities[0].unwrap().lower, 100);
    }

    #[test]
    fn test_incremental_push_marks_only_changes() {
        let (graph, ids) = linear_plan();
        let configuration = Configuration::new();
        let mut context = OptimizationContext::for_graph(&graph);
        let mut warned = false;
        push_level(&graph, &mut context, &configuration, &mut warned).unwrap();
        context.clear_marks();

        // Re-push with unchanged inputs: nothing gets marked.
        push_level(&graph, &mut context, &configuration, &mut warned).unwrap();
        assert!(!context.operator(ids[1]).unwrap().is_marked());

        // Change the source estimate: downstream slots get marked.
        context
            .operator_mut(ids[0])
            .unwrap()
            .set_output_cardinality(0, CardinalityEstimate::exact(500));
        push_level(&graph, &mut context, &configuration, &mut warned).unwrap();
        let filter_context = context.operator(ids[1]).unwrap();
        assert!(filter_context.is_marked());
        assert_eq!(filter_context.output_cardinalities[0].unwrap().lower, 50);
    }

    #[test]
    fn test_measured_injection_is_idempotent() {
        use crate::platform::channel::{ChannelDescriptor, ChannelInstance};
        use rheem_common::ChannelId;

        let (graph, ids) = linear_plan();
        let configuration = Configuration::new();
        let overrides = LoadEstimatorOverrides::default();
        let manager = CardinalityEstimatorManager::new(&graph, &configuration, &overrides);
        let mut context = OptimizationContext::for_graph(&graph);
        manager.push_cardinalities(&mut context).unwrap();

        const CHANNEL: ChannelDescriptor = ChannelDescriptor::new("test", true, false);
        let instance = ChannelInstance::new(ChannelId(0), CHANNEL, Some((ids[1], 0)), None);
        instance.mark_produced();
        instance.set_measured_cardinality(37);

        manager
            .push_cardinality_updates(&mut context, &[Arc::clone(&instance)])
            .unwrap();
        let first = context.operator(ids[2]).unwrap().input_cardinalities[0].unwrap();
        assert_eq!(first, CardinalityEstimate::exact(37));

        // Injecting the same measurement again changes nothing.
        manager
            .push_cardinality_updates(&mut context, &[instance])
            .unwrap();
        let second = context.operator(ids[2]).unwrap().input_cardinalities[0].unwrap();
        assert_eq!(first, second);
    }
}
