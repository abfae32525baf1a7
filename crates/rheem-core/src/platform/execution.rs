//! Execution plans
//!
//! Lowering turns the picked `PlanImplementation` into tasks wired by
//! channels, instantiating junction conversion operators and unrolling loop
//! iterations. Stages group contiguous same-platform tasks; producer and
//! consumer tasks on different platforms always land in different stages,
//! and loop heads start a fresh stage so iterations stay re-plannable.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use rheem_common::{ChannelId, OperatorId, PlatformId, Result, RheemError, StageId, TaskId};

use crate::optimizer::channel_graph::Junction;
use crate::optimizer::enumeration::PlanImplementation;
use crate::plan::{LogicalOperator, OperatorKind, OperatorNode, OutputRef, PlanGraph};
use crate::plan::ExecutionOperator;
use crate::platform::channel::ChannelDescriptor;

/// Attribution of a task (and its output channels) to the hyperplan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskOrigin {
    pub operator: OperatorId,
    pub iteration: Option<u32>,
    /// The outer loop node this task belongs to, if any.
    pub loop_node: Option<OperatorId>,
}

pub struct ExecutionTask {
    pub id: TaskId,
    pub operator: Arc<dyn ExecutionOperator>,
    /// `None` for junction conversion tasks.
    pub origin: Option<TaskOrigin>,
    pub inputs: Vec<ChannelId>,
    pub outputs: Vec<ChannelId>,
    /// Loop-head tasks open an iteration and therefore a stage.
    pub starts_iteration: bool,
}

impl std::fmt::Debug for ExecutionTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]", self.id, self.operator.name())
    }
}

/// A channel in the execution plan.
#[derive(Debug, Clone)]
pub struct ExecutionChannel {
    pub id: ChannelId,
    pub descriptor: ChannelDescriptor,
    /// Producing task and output index; `None` for boundary channels that
    /// were produced by an earlier execution round.
    pub producer: Option<(TaskId, usize)>,
    pub consumers: Vec<(TaskId, usize)>,
    pub instrumented: bool,
    /// Where a measured cardinality of this channel belongs in the
    /// optimization context.
    pub measured_origin: Option<(OperatorId, usize, Option<u32>)>,
}

#[derive(Debug, Clone)]
pub struct ExecutionStage {
    pub id: StageId,
    pub platform: PlatformId,
    /// Tasks in execution order.
    pub tasks: Vec<TaskId>,
    pub predecessors: BTreeSet<StageId>,
    pub successors: BTreeSet<StageId>,
    pub iteration: Option<u32>,
}

#[derive(Default)]
pub struct ExecutionPlan {
    pub tasks: BTreeMap<TaskId, Arc<ExecutionTask>>,
    pub channels: BTreeMap<ChannelId, ExecutionChannel>,
    pub stages: BTreeMap<StageId, ExecutionStage>,
}

impl ExecutionPlan {
    /// Stages whose predecessors have all completed and that have not run
    /// themselves, in id order.
    pub fn ready_stages(&self, completed: &BTreeSet<StageId>) -> Vec<StageId> {
        self.stages
            .values()
            .filter(|stage| {
                !completed.contains(&stage.id)
                    && stage.predecessors.iter().all(|p| completed.contains(p))
            })
            .map(|stage| stage.id)
            .collect()
    }

    pub fn is_finished(&self, completed: &BTreeSet<StageId>) -> bool {
        self.stages.keys().all(|id| completed.contains(id))
    }

    /// Structural check after lowering or expansion: all task slots wired,
    /// channel endpoints consistent, stage graph acyclic.
    pub fn validate(&self) -> Result<()> {
        for task in self.tasks.values() {
            for channel_id in task.inputs.iter().chain(task.outputs.iter()) {
                if !self.channels.contains_key(channel_id) {
                    return Err(RheemError::PlanSanity(format!(
                        "{task:?} references missing {channel_id}"
                    )));
                }
            }
        }
        for channel in self.channels.values() {
            if let Some((producer, output_index)) = channel.producer {
                let task = self.tasks.get(&producer).ok_or_else(|| {
                    RheemError::PlanSanity(format!("{} produced by missing {producer}", channel.id))
                })?;
                if task.outputs.get(output_index) != Some(&channel.id) {
                    return Err(RheemError::PlanSanity(format!(
                        "{} and {producer} disagree about output {output_index}",
                        channel.id
                    )));
                }
            }
        }
        // Stage DAG must be acyclic.
        let mut in_degree: BTreeMap<StageId, usize> = self
            .stages
            .values()
            .map(|stage| (stage.id, stage.predecessors.len()))
            .collect();
        let mut ready: VecDeque<StageId> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut seen = 0;
        while let Some(id) = ready.pop_front() {
            seen += 1;
            for successor in &self.stages[&id].successors {
                let degree = in_degree.get_mut(successor).unwrap();
                *degree -= 1;
                if *degree == 0 {
                    ready.push_back(*successor);
                }
            }
        }
        if seen != self.stages.len() {
            return Err(RheemError::PlanSanity("stage graph contains a cycle".to_string()));
        }
        Ok(())
    }
}

// ============================================================================
// Lowering
// ============================================================================

/// Builds an `ExecutionPlan` from a plan implementation. `boundary` maps
/// already-produced outputs to their existing channels so an expanded plan
/// wires into the open channels of the previous round.
pub struct PlanLowering<'a> {
    graph: &'a PlanGraph,
    implementation: &'a PlanImplementation,
    boundary: BTreeMap<OutputRef, (ChannelId, ChannelDescriptor)>,
    executed: BTreeSet<OperatorId>,
    tasks: BTreeMap<TaskId, TaskBuild>,
    channels: BTreeMap<ChannelId, ExecutionChannel>,
    task_of: BTreeMap<(OperatorId, Option<u32>), TaskId>,
    next_task: u32,
    next_channel: u32,
}

struct TaskBuild {
    operator: Arc<dyn ExecutionOperator>,
    origin: Option<TaskOrigin>,
    inputs: Vec<Option<ChannelId>>,
    outputs: Vec<Option<ChannelId>>,
    starts_iteration: bool,
}

enum ProducerBinding {
    Task(TaskId, usize),
    Existing(ChannelId),
}

impl<'a> PlanLowering<'a> {
    pub fn new(graph: &'a PlanGraph, implementation: &'a PlanImplementation) -> Self {
        Self {
            graph,
            implementation,
            boundary: BTreeMap::new(),
            executed: BTreeSet::new(),
            tasks: BTreeMap::new(),
            channels: BTreeMap::new(),
            task_of: BTreeMap::new(),
            next_task: 0,
            next_channel: 0,
        }
    }

    /// Expansion mode: skip executed operators, wire junctions out of the
    /// given open channels. Channel ids continue after `channel_id_floor`
    /// so they never collide with the previous round's channels.
    pub fn with_boundary(
        mut self,
        executed: BTreeSet<OperatorId>,
        boundary: BTreeMap<OutputRef, (ChannelId, ChannelDescriptor)>,
        channel_id_floor: u32,
        task_id_floor: u32,
    ) -> Self {
        for (_, (channel_id, descriptor)) in &boundary {
            self.channels.insert(
                *channel_id,
                ExecutionChannel {
                    id: *channel_id,
                    descriptor: descriptor.clone(),
                    producer: None,
                    consumers: Vec::new(),
                    instrumented: false,
                    measured_origin: None,
                },
            );
        }
        self.executed = executed;
        self.boundary = boundary;
        self.next_channel = channel_id_floor;
        self.next_task = task_id_floor;
        self
    }

    pub fn lower(mut self) -> Result<ExecutionPlan> {
        // Tasks for every chosen alternative, loops unrolled per iteration.
        for id in self.graph.topological_order()? {
            if self.executed.contains(&id) {
                continue;
            }
            let node = self.graph.require(id)?;
            match &node.kind {
                OperatorKind::Alternatives(alternatives) => {
                    let choice = self.choice_of(id)?;
                    let operator = Arc::clone(&alternatives.alternatives[choice]);
                    self.create_task(
                        operator,
                        Some(TaskOrigin {
                            operator: id,
                            iteration: None,
                            loop_node: None,
                        }),
                        false,
                    );
                }
                OperatorKind::Loop(_) => self.lower_loop(node)?,
                other => {
                    return Err(RheemError::Internal(format!(
                        "cannot lower operator kind {other:?}"
                    )))
                }
            }
        }

        // Wire the junctions of the outer graph.
        let junctions: Vec<(OutputRef, Arc<Junction>)> = self
            .implementation
            .junctions
            .iter()
            .map(|(output, junction)| (*output, Arc::clone(junction)))
            .collect();
        for (output, junction) in junctions {
            self.wire_outer_junction(output, &junction)?;
        }

        self.finalize()
    }

    fn choice_of(&self, id: OperatorId) -> Result<usize> {
        self.implementation
            .operators
            .get(&id)
            .copied()
            .ok_or_else(|| RheemError::Internal(format!("implementation misses operator {id}")))
    }

    fn create_task(
        &mut self,
        operator: Arc<dyn ExecutionOperator>,
        origin: Option<TaskOrigin>,
        starts_iteration: bool,
    ) -> TaskId {
        let id = TaskId(self.next_task);
        self.next_task += 1;
        let build = TaskBuild {
            inputs: vec![None; operator.num_inputs()],
            outputs: vec![None; operator.num_outputs()],
            operator,
            origin,
            starts_iteration,
        };
        if let Some(origin) = origin {
            self.task_of.insert((origin.operator, origin.iteration), id);
        }
        self.tasks.insert(id, build);
        id
    }

    fn create_channel(
        &mut self,
        descriptor: ChannelDescriptor,
        producer: Option<(TaskId, usize)>,
        measured_origin: Option<(OperatorId, usize, Option<u32>)>,
    ) -> ChannelId {
        let id = ChannelId(self.next_channel);
        self.next_channel += 1;
        let instrumented = measured_origin.is_some();
        self.channels.insert(
            id,
            ExecutionChannel {
                id,
                descriptor,
                producer,
                consumers: Vec::new(),
                instrumented,
                measured_origin,
            },
        );
        id
    }

    /// Unroll a loop into per-iteration task instances. The final context
    /// instantiates only the head, which emits the loop's final state.
    fn lower_loop(&mut self, node: &OperatorNode) -> Result<()> {
        let subplan = node.as_loop().expect("checked by caller");
        let loop_implementation = self
            .implementation
            .loops
            .get(&node.id)
            .ok_or_else(|| RheemError::Internal(format!("no loop implementation for {node}")))?
            .clone();
        let body = &loop_implementation.body;
        let iterations = subplan.num_expected_iterations as u32;

        // Create tasks.
        for iteration in 0..=iterations {
            let head_only = iteration == iterations;
            for inner in subplan.body.operators() {
                if head_only && inner.id != subplan.head {
                    continue;
                }
                let alternatives = inner.alternatives().ok_or_else(|| {
                    RheemError::Internal(format!("loop body operator {inner} not mapped"))
                })?;
                let choice = *body.operators.get(&inner.id).ok_or_else(|| {
                    RheemError::Internal(format!("loop body implementation misses {inner}"))
                })?;
                let is_head = inner.id == subplan.head;
                self.create_task(
                    Arc::clone(&alternatives.alternatives[choice]),
                    Some(TaskOrigin {
                        operator: inner.id,
                        iteration: Some(iteration),
                        loop_node: Some(node.id),
                    }),
                    is_head,
                );
            }
        }

        // Wire body junctions per iteration. Feedback consumers attach to
        // the head of the next iteration.
        for iteration in 0..iterations {
            for (output, junction) in &body.junctions.clone() {
                let producer_node = subplan.body.require(output.operator)?;
                let producer_task = self.task_of[&(output.operator, Some(iteration))];
                let producer_slot = self.physical_output_index(producer_node, output.index);

                let mut consumers = Vec::new();
                for consumer in &producer_node.outputs[output.index].consumers {
                    let consumer_node = subplan.body.require(consumer.operator)?;
                    let is_feedback = consumer.operator == subplan.head && consumer.index > 0;
                    let (consumer_iteration, slot) = if is_feedback {
                        (iteration + 1, 0)
                    } else {
                        (iteration, consumer.index)
                    };
                    let Some(task) = self.task_of.get(&(consumer_node.id, Some(consumer_iteration)))
                    else {
                        continue;
                    };
                    consumers.push((*task, slot));
                }
                self.instantiate_junction(
                    junction,
                    ProducerBinding::Task(producer_task, producer_slot),
                    consumers,
                    Some((output.operator, output.index, Some(iteration))),
                )?;
            }
        }
        Ok(())
    }

    /// The head's logical slots (iteration, final) both map onto its single
    /// physical pass-through slot.
    fn physical_output_index(&self, node: &OperatorNode, logical_index: usize) -> usize {
        if matches!(node.logical(), Some(LogicalOperator::LoopHead)) {
            0
        } else {
            logical_index
        }
    }

    fn wire_outer_junction(&mut self, output: OutputRef, junction: &Junction) -> Result<()> {
        let node = self.graph.require(output.operator)?;

        let producer = if let Some((channel_id, _)) = self.boundary.get(&output) {
            ProducerBinding::Existing(*channel_id)
        } else {
            match &node.kind {
                OperatorKind::Alternatives(_) => {
                    let task = self.task_of[&(output.operator, None)];
                    ProducerBinding::Task(task, output.index)
                }
                OperatorKind::Loop(subplan) => {
                    let inner = subplan.trace_output(output.index).ok_or_else(|| {
                        RheemError::Internal(format!("loop {node} lacks output trace"))
                    })?;
                    let final_iteration = Some(subplan.num_expected_iterations as u32);
                    let task = self.task_of[&(inner.operator, final_iteration)];
                    let inner_node = subplan.body.require(inner.operator)?;
                    ProducerBinding::Task(task, self.physical_output_index(inner_node, inner.index))
                }
                _ => {
                    return Err(RheemError::Internal(format!(
                        "cannot wire junction out of {node}"
                    )))
                }
            }
        };

        let mut consumers = Vec::new();
        for consumer in &node.outputs[output.index].consumers {
            if self.executed.contains(&consumer.operator) {
                continue;
            }
            let consumer_node = self.graph.require(consumer.operator)?;
            let binding = match &consumer_node.kind {
                OperatorKind::Alternatives(_) => {
                    (self.task_of[&(consumer.operator, None)], consumer.index)
                }
                OperatorKind::Loop(subplan) => {
                    let inner = subplan.trace_input(consumer.index).ok_or_else(|| {
                        RheemError::Internal(format!("loop {consumer_node} lacks input trace"))
                    })?;
                    // The loop's outer input feeds the head's initial round.
                    (self.task_of[&(inner.operator, Some(0))], 0)
                }
                _ => {
                    return Err(RheemError::Internal(format!(
                        "cannot wire junction into {consumer_node}"
                    )))
                }
            };
            consumers.push(binding);
        }

        let measured_origin = match producer {
            ProducerBinding::Existing(_) => None,
            ProducerBinding::Task(_, _) => Some((output.operator, output.index, None)),
        };
        self.instantiate_junction(junction, producer, consumers, measured_origin)
    }

    /// Materialize a junction: the root channel, one conversion task and
    /// channel per step, and the consumer connections.
    fn instantiate_junction(
        &mut self,
        junction: &Junction,
        producer: ProducerBinding,
        consumers: Vec<(TaskId, usize)>,
        measured_origin: Option<(OperatorId, usize, Option<u32>)>,
    ) -> Result<()> {
        let root_id = match producer {
            ProducerBinding::Existing(channel_id) => channel_id,
            ProducerBinding::Task(task, slot) => {
                // The producer slot may already be wired if a previous
                // junction shares it (e.g. loop feedback + final output).
                if let Some(existing) = self.tasks[&task].outputs[slot] {
                    existing
                } else {
                    let id =
                        self.create_channel(junction.root.clone(), Some((task, slot)), measured_origin);
                    self.tasks.get_mut(&task).unwrap().outputs[slot] = Some(id);
                    id
                }
            }
        };

        let mut by_descriptor: BTreeMap<ChannelDescriptor, ChannelId> = BTreeMap::new();
        by_descriptor.insert(junction.root.clone(), root_id);
        for step in &junction.steps {
            let input_id = *by_descriptor.get(&step.from).ok_or_else(|| {
                RheemError::Internal(format!("junction step {step:?} has no source channel"))
            })?;
            let task = self.create_task(Arc::clone(&step.operator), None, false);
            self.channels.get_mut(&input_id).unwrap().consumers.push((task, 0));
            self.tasks.get_mut(&task).unwrap().inputs[0] = Some(input_id);
            let output_id = self.create_channel(step.to.clone(), Some((task, 0)), None);
            self.tasks.get_mut(&task).unwrap().outputs[0] = Some(output_id);
            by_descriptor.insert(step.to.clone(), output_id);
        }

        for (index, (consumer_task, input_slot)) in consumers.iter().enumerate() {
            let descriptor = junction
                .consumer_descriptors
                .get(index)
                .cloned()
                .unwrap_or_else(|| junction.root.clone());
            let channel_id = *by_descriptor.get(&descriptor).ok_or_else(|| {
                RheemError::Internal(format!("junction lacks a channel for {descriptor}"))
            })?;
            self.channels
                .get_mut(&channel_id)
                .unwrap()
                .consumers
                .push((*consumer_task, *input_slot));
            self.tasks.get_mut(consumer_task).unwrap().inputs[*input_slot] = Some(channel_id);
        }
        Ok(())
    }

    fn finalize(mut self) -> Result<ExecutionPlan> {
        // Unconsumed outputs still get a channel so the operator contract
        // holds.
        let unwired: Vec<(TaskId, usize)> = self
            .tasks
            .iter()
            .flat_map(|(id, task)| {
                task.outputs
                    .iter()
                    .enumerate()
                    .filter(|(_, c)| c.is_none())
                    .map(|(index, _)| (*id, index))
                    .collect::<Vec<_>>()
            })
            .collect();
        for (task_id, index) in unwired {
            let descriptor = self.tasks[&task_id]
                .operator
                .supported_output_channels(index)
                .into_iter()
                .next()
                .ok_or_else(|| {
                    RheemError::Internal("operator with unwirable output".to_string())
                })?;
            let origin = self.tasks[&task_id]
                .origin
                .map(|o| (o.operator, index, o.iteration));
            let channel = self.create_channel(descriptor, Some((task_id, index)), origin);
            self.tasks.get_mut(&task_id).unwrap().outputs[index] = Some(channel);
        }

        let mut plan = ExecutionPlan {
            channels: self.channels,
            ..Default::default()
        };
        for (id, build) in self.tasks {
            let inputs: Option<Vec<ChannelId>> = build.inputs.into_iter().collect();
            let outputs: Option<Vec<ChannelId>> = build.outputs.into_iter().collect();
            let (inputs, outputs) = match (inputs, outputs) {
                (Some(inputs), Some(outputs)) => (inputs, outputs),
                _ => {
                    return Err(RheemError::PlanSanity(format!(
                        "task {id} has unwired slots after lowering"
                    )))
                }
            };
            plan.tasks.insert(
                id,
                Arc::new(ExecutionTask {
                    id,
                    operator: build.operator,
                    origin: build.origin,
                    inputs,
                    outputs,
                    starts_iteration: build.starts_iteration,
                }),
            );
        }

        split_into_stages(&mut plan)?;
        plan.validate()?;
        Ok(plan)
    }
}

// ============================================================================
// Stage splitting
// ============================================================================

/// Group tasks into stages: one stage per contiguous same-platform,
/// same-iteration region; loop heads always open a new stage.
fn split_into_stages(plan: &mut ExecutionPlan) -> Result<()> {
    let order = task_topological_order(plan)?;
    let mut stage_of: BTreeMap<TaskId, StageId> = BTreeMap::new();
    let mut stages: BTreeMap<StageId, ExecutionStage> = BTreeMap::new();
    let mut next_stage = 0u32;

    for task_id in order {
        let task = &plan.tasks[&task_id];
        let platform = task.operator.platform();
        let iteration = task.origin.and_then(|o| o.iteration);

        let producer_stages: BTreeSet<StageId> = task
            .inputs
            .iter()
            .filter_map(|channel| plan.channels[channel].producer)
            .map(|(producer, _)| stage_of[&producer])
            .collect();

        // Join the latest matching producer stage if all other producers
        // are already upstream of it.
        let mut chosen: Option<StageId> = None;
        if !task.starts_iteration {
            for candidate in producer_stages.iter().rev() {
                let stage = &stages[candidate];
                if stage.platform != platform || stage.iteration != iteration {
                    continue;
                }
                let dominated = producer_stages
                    .iter()
                    .all(|other| other == candidate || is_ancestor(&stages, *other, *candidate));
                if dominated {
                    chosen = Some(*candidate);
                    break;
                }
            }
        }

        let stage_id = match chosen {
            Some(stage_id) => stage_id,
            None => {
                let id = StageId(next_stage);
                next_stage += 1;
                stages.insert(
                    id,
                    ExecutionStage {
                        id,
                        platform: platform.clone(),
                        tasks: Vec::new(),
                        predecessors: BTreeSet::new(),
                        successors: BTreeSet::new(),
                        iteration,
                    },
                );
                id
            }
        };
        stages.get_mut(&stage_id).unwrap().tasks.push(task_id);
        stage_of.insert(task_id, stage_id);
        for producer_stage in producer_stages {
            if producer_stage != stage_id {
                stages.get_mut(&stage_id).unwrap().predecessors.insert(producer_stage);
                stages.get_mut(&producer_stage).unwrap().successors.insert(stage_id);
            }
        }
    }

    plan.stages = stages;
    Ok(())
}

fn is_ancestor(stages: &BTreeMap<StageId, ExecutionStage>, ancestor: StageId, of: StageId) -> bool {
    let mut queue = VecDeque::from([of]);
    let mut seen = BTreeSet::new();
    while let Some(current) = queue.pop_front() {
        if current == ancestor {
            return true;
        }
        if !seen.insert(current) {
            continue;
        }
        queue.extend(stages[&current].predecessors.iter().copied());
    }
    false
}

fn task_topological_order(plan: &ExecutionPlan) -> Result<Vec<TaskId>> {
    let mut in_degree: BTreeMap<TaskId, usize> = plan
        .tasks
        .values()
        .map(|task| {
            let degree = task
                .inputs
                .iter()
                .filter(|channel| plan.channels[*channel].producer.is_some())
                .count();
            (task.id, degree)
        })
        .collect();
    let mut ready: VecDeque<TaskId> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut order = Vec::with_capacity(plan.tasks.len());
    while let Some(id) = ready.pop_front() {
        order.push(id);
        for channel_id in &plan.tasks[&id].outputs {
            for (consumer, _) in &plan.channels[channel_id].consumers {
                let degree = in_degree.get_mut(consumer).unwrap();
                *degree -= 1;
                if *degree == 0 {
                    ready.push_back(*consumer);
                }
            }
        }
    }
    if order.len() != plan.tasks.len() {
        return Err(RheemError::PlanSanity(
            "execution task graph contains a cycle".to_string(),
        ));
    }
    Ok(order)
}
