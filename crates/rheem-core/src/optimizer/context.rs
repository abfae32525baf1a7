//! Optimization context
//!
//! Sidecar state for optimization, kept in an arena keyed by `OperatorId`
//! instead of back-pointers into the plan. Operators inside a loop own one
//! context per iteration: a loop with `n` expected iterations has `n + 1`
//! contexts because the head runs once more to emit the final state.

use std::collections::BTreeMap;

use rheem_common::{
    CardinalityEstimate, Configuration, OperatorId, ProbabilisticDoubleInterval, TimeEstimate,
};

use crate::optimizer::costs::{
    resolve_load_estimator, LoadEstimatorOverrides, LoadProfile, LoadProfileToTimeConverter,
    TimeToCostConverter,
};
use crate::plan::{OperatorKind, PlanGraph};

/// Cost figures for one execution alternative of a hyperplan node.
#[derive(Debug, Clone)]
pub struct AlternativeCost {
    pub load_profile: LoadProfile,
    pub time_estimate: TimeEstimate,
    pub cost_estimate: ProbabilisticDoubleInterval,
}

/// Per-operator optimization state: one virtual execution of the operator.
#[derive(Debug, Clone, Default)]
pub struct OperatorContext {
    pub input_cardinalities: Vec<Option<CardinalityEstimate>>,
    pub output_cardinalities: Vec<Option<CardinalityEstimate>>,
    input_marks: Vec<bool>,
    output_marks: Vec<bool>,
    /// Parallel to the node's alternative list; empty until costed.
    pub alternative_costs: Vec<AlternativeCost>,
    pub num_executions: u32,
}

impl OperatorContext {
    fn new(num_inputs: usize, num_outputs: usize) -> Self {
        Self {
            input_cardinalities: vec![None; num_inputs],
            output_cardinalities: vec![None; num_outputs],
            input_marks: vec![false; num_inputs],
            output_marks: vec![false; num_outputs],
            alternative_costs: Vec::new(),
            num_executions: 1,
        }
    }

    /// Set an input cardinality, marking the slot when the value changes
    /// (null-safe comparison).
    pub fn set_input_cardinality(&mut self, index: usize, cardinality: CardinalityEstimate) {
        if self.input_cardinalities[index] != Some(cardinality) {
            self.input_marks[index] = true;
        }
        self.input_cardinalities[index] = Some(cardinality);
    }

    /// Set an output cardinality, marking the slot when the value changes.
    pub fn set_output_cardinality(&mut self, index: usize, cardinality: CardinalityEstimate) {
        if self.output_cardinalities[index] != Some(cardinality) {
            self.output_marks[index] = true;
        }
        self.output_cardinalities[index] = Some(cardinality);
    }

    pub fn is_input_marked(&self, index: usize) -> bool {
        self.input_marks[index]
    }

    pub fn is_output_marked(&self, index: usize) -> bool {
        self.output_marks[index]
    }

    pub fn is_marked(&self) -> bool {
        self.input_marks.iter().chain(self.output_marks.iter()).any(|m| *m)
    }

    pub fn clear_marks(&mut self) {
        self.input_marks.fill(false);
        self.output_marks.fill(false);
    }

    /// Input cardinalities with unknowns defaulted to empty estimates.
    pub fn input_cardinalities_or_default(&self) -> Vec<CardinalityEstimate> {
        self.input_cardinalities
            .iter()
            .map(|c| c.unwrap_or(CardinalityEstimate::exact(0)))
            .collect()
    }

    pub fn output_cardinalities_or_default(&self) -> Vec<CardinalityEstimate> {
        self.output_cardinalities
            .iter()
            .map(|c| c.unwrap_or(CardinalityEstimate::exact(0)))
            .collect()
    }
}

/// Contexts for the iterations of one loop.
#[derive(Debug, Default)]
pub struct LoopContext {
    pub iteration_contexts: Vec<OptimizationContext>,
}

impl LoopContext {
    pub fn num_iterations(&self) -> usize {
        self.iteration_contexts.len().saturating_sub(1)
    }

    pub fn initial(&self) -> &OptimizationContext {
        &self.iteration_contexts[0]
    }

    pub fn final_context(&self) -> &OptimizationContext {
        self.iteration_contexts.last().expect("loop context without iterations")
    }
}

/// Arena of operator contexts for one plan level.
#[derive(Debug, Default)]
pub struct OptimizationContext {
    operator_contexts: BTreeMap<OperatorId, OperatorContext>,
    loop_contexts: BTreeMap<OperatorId, LoopContext>,
}

impl OptimizationContext {
    /// Build contexts for every operator in `graph`; loops get `n + 1`
    /// nested iteration contexts over their body.
    pub fn for_graph(graph: &PlanGraph) -> Self {
        let mut context = OptimizationContext::default();
        for node in graph.operators() {
            context
                .operator_contexts
                .insert(node.id, OperatorContext::new(node.inputs.len(), node.outputs.len()));
            if let OperatorKind::Loop(subplan) = &node.kind {
                let iteration_contexts = (0..=subplan.num_expected_iterations)
                    .map(|_| OptimizationContext::for_graph(&subplan.body))
                    .collect();
                context
                    .loop_contexts
                    .insert(node.id, LoopContext { iteration_contexts });
            }
        }
        context
    }

    pub fn operator(&self, id: OperatorId) -> Option<&OperatorContext> {
        self.operator_contexts.get(&id)
    }

    pub fn operator_mut(&mut self, id: OperatorId) -> Option<&mut OperatorContext> {
        self.operator_contexts.get_mut(&id)
    }

    pub fn loop_context(&self, id: OperatorId) -> Option<&LoopContext> {
        self.loop_contexts.get(&id)
    }

    pub fn loop_context_mut(&mut self, id: OperatorId) -> Option<&mut LoopContext> {
        self.loop_contexts.get_mut(&id)
    }

    pub fn operator_contexts(&self) -> impl Iterator<Item = (&OperatorId, &OperatorContext)> {
        self.operator_contexts.iter()
    }

    /// Locate the context of `operator`: the top level for `None`, or the
    /// given iteration of the loop whose body contains the operator. Used
    /// by measured-cardinality injection, where the instrumented channel
    /// names the producing operator and iteration.
    pub fn find_context(
        &self,
        operator: OperatorId,
        iteration: Option<u32>,
    ) -> Option<&OperatorContext> {
        match iteration {
            None => self.operator_contexts.get(&operator),
            Some(iteration) => self.loop_contexts.values().find_map(|loop_context| {
                loop_context
                    .iteration_contexts
                    .get(iteration as usize)
                    .and_then(|context| context.operator_contexts.get(&operator))
            }),
        }
    }

    /// Mutable analog of [`Self::find_context`]. The containing loop is
    /// located first so the mutable reborrow is unconditional.
    pub fn find_context_mut(
        &mut self,
        operator: OperatorId,
        iteration: Option<u32>,
    ) -> Option<&mut OperatorContext> {
        match iteration {
            None => self.operator_contexts.get_mut(&operator),
            Some(iteration) => {
                let loop_node = self.loop_contexts.iter().find_map(|(id, loop_context)| {
                    loop_context
                        .iteration_contexts
                        .get(iteration as usize)
                        .and_then(|context| context.operator_contexts.get(&operator))
                        .map(|_| *id)
                })?;
                self.loop_contexts
                    .get_mut(&loop_node)?
                    .iteration_contexts
                    .get_mut(iteration as usize)?
                    .operator_contexts
                    .get_mut(&operator)
            }
        }
    }

    /// Reset all change marks, recursively.
    pub fn clear_marks(&mut self) {
        for context in self.operator_contexts.values_mut() {
            context.clear_marks();
        }
        for loop_context in self.loop_contexts.values_mut() {
            for iteration_context in &mut loop_context.iteration_contexts {
                iteration_context.clear_marks();
            }
        }
    }

    /// Recompute load/time/cost figures for every alternative of every
    /// marked (or not yet costed) hyperplan node.
    pub fn update_cost_estimates(
        &mut self,
        graph: &PlanGraph,
        configuration: &Configuration,
        overrides: &LoadEstimatorOverrides,
    ) {
        for node in graph.operators() {
            if let OperatorKind::Loop(subplan) = &node.kind {
                if let Some(loop_context) = self.loop_contexts.get_mut(&node.id) {
                    for iteration_context in &mut loop_context.iteration_contexts {
                        iteration_context.update_cost_estimates(&subplan.body, configuration, overrides);
                    }
                }
                continue;
            }
            let alternatives = match node.alternatives() {
                Some(alternatives) if !alternatives.alternatives.is_empty() => alternatives,
                _ => continue,
            };
            let context = self.operator_contexts.get_mut(&node.id).expect("missing context");
            if !context.is_marked() && !context.alternative_costs.is_empty() {
                continue;
            }
            let inputs = context.input_cardinalities_or_default();
            let outputs = context.output_cardinalities_or_default();
            let mut costs = Vec::with_capacity(alternatives.alternatives.len());
            for alternative in &alternatives.alternatives {
                let estimator = resolve_load_estimator(
                    alternative.load_profile_key().as_deref(),
                    alternative.base_load_estimator(),
                    configuration,
                    overrides,
                )
                .unwrap_or_else(|e| {
                    tracing::warn!(operator = alternative.name(), error = %e, "falling back to zero load");
                    crate::optimizer::costs::LoadProfileEstimator {
                        cpu: None,
                        ram: None,
                        disk: None,
                        net: None,
                        overhead_millis: 0,
                        confidence: 0.5,
                    }
                });
                let load_profile = estimator.estimate(&inputs, &outputs, &|_| None);
                let platform = alternative.platform();
                let time_converter =
                    LoadProfileToTimeConverter::from_configuration(&platform, configuration);
                let cost_converter = TimeToCostConverter::from_configuration(&platform, configuration);
                let time_estimate = time_converter.convert(&load_profile);
                let cost_estimate = cost_converter.convert_without_fix_costs(&time_estimate);
                costs.push(AlternativeCost {
                    load_profile,
                    time_estimate,
                    cost_estimate,
                });
            }
            context.alternative_costs = costs;
        }
    }

    /// Whether every hyperplan node carries a time estimate per alternative.
    pub fn is_time_estimates_complete(&self, graph: &PlanGraph) -> bool {
        for node in graph.operators() {
            match &node.kind {
                OperatorKind::Alternatives(alternatives) => {
                    let context = match self.operator_contexts.get(&node.id) {
                        Some(context) => context,
                        None => return false,
                    };
                    if context.alternative_costs.len() != alternatives.alternatives.len() {
                        return false;
                    }
                }
                OperatorKind::Loop(subplan) => {
                    let loop_context = match self.loop_contexts.get(&node.id) {
                        Some(loop_context) => loop_context,
                        None => return false,
                    };
                    if !loop_context
                        .iteration_contexts
                        .iter()
                        .all(|c| c.is_time_estimates_complete(&subplan.body))
                    {
                        return false;
                    }
                }
                _ => {}
            }
        }
        true
    }
}
