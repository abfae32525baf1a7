//! Execution driver
//!
//! A `Job` takes a logical plan through mapping, estimation and
//! enumeration, then executes the cheapest implementation wave by wave:
//! ready stages are dispatched concurrently to their platform executors,
//! measurements flow back into the optimizer, and on a cardinality-drift
//! breakpoint the unexecuted remainder is re-enumerated against the open
//! channels. The execution log is written at job end regardless of
//! outcome.

pub mod breakpoint;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use rheem_common::{
    ChannelId, Configuration, JobId, OperatorId, PlatformId, ProbabilisticDoubleInterval, Result,
    RheemError, StageId, TimeEstimate,
};

use crate::driver::breakpoint::{no_partial_loops, CardinalityDriftBreakpoint};
use crate::mapping::MappingRegistry;
use crate::optimizer::cardinality::CardinalityEstimatorManager;
use crate::optimizer::channel_graph::ChannelConversionGraph;
use crate::optimizer::context::OptimizationContext;
use crate::optimizer::costs::LoadEstimatorOverrides;
use crate::optimizer::enumeration::{PlanEnumerator, PlanImplementation};
use crate::optimizer::pruning::strategies_from_configuration;
use crate::plan::{OutputRef, PlanGraph};
use crate::platform::channel::{ChannelDescriptor, ChannelInstance};
use crate::platform::execution::{ExecutionPlan, ExecutionTask, PlanLowering};
use crate::platform::state::{ExecutionState, OperatorExecution, PartialExecution};
use crate::platform::{Executor, PlatformRegistry};
use crate::profiling::ExecutionLog;

/// Figures reported at job end.
#[derive(Debug, Clone)]
pub struct JobSummary {
    pub job_id: JobId,
    pub estimated_time: TimeEstimate,
    pub estimated_cost: ProbabilisticDoubleInterval,
    pub measured_millis: u64,
    pub executed_stages: usize,
    /// How many times the remainder of the plan was re-enumerated.
    pub reoptimizations: usize,
    pub platforms: Vec<PlatformId>,
}

pub struct Job {
    id: JobId,
    graph: PlanGraph,
    configuration: Arc<Configuration>,
    platforms: Arc<PlatformRegistry>,
    mappings: Arc<MappingRegistry>,
    conversions: Arc<ChannelConversionGraph>,
    overrides: LoadEstimatorOverrides,
    cancel: Arc<AtomicBool>,
}

impl Job {
    pub fn new(
        graph: PlanGraph,
        configuration: Arc<Configuration>,
        platforms: Arc<PlatformRegistry>,
        mappings: Arc<MappingRegistry>,
        conversions: Arc<ChannelConversionGraph>,
    ) -> Self {
        Self {
            id: JobId::new(),
            graph,
            configuration,
            platforms,
            mappings,
            conversions,
            overrides: LoadEstimatorOverrides::default(),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_overrides(mut self, overrides: LoadEstimatorOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    /// Cooperative cancellation flag, checked between stage submissions.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub async fn execute(mut self) -> Result<JobSummary> {
        let mut state = ExecutionState::default();
        let outcome = self.run(&mut state).await;
        if self.configuration.get_bool("rheem.core.log.enabled", false) {
            if let Err(error) = self.write_log(&state) {
                tracing::warn!(%error, "failed to write execution log");
            }
        }
        match &outcome {
            Ok(summary) => {
                tracing::info!(
                    job = %summary.job_id,
                    estimated_cost = %summary.estimated_cost,
                    measured_ms = summary.measured_millis,
                    stages = summary.executed_stages,
                    platforms = ?summary.platforms,
                    "job finished"
                );
            }
            Err(error) => {
                tracing::error!(job = %self.id, %error, "job failed");
            }
        }
        outcome
    }

    async fn run(&mut self, state: &mut ExecutionState) -> Result<JobSummary> {
        self.graph.is_sane()?;
        self.graph.inline_subplans()?;
        let active = self.platforms.active_platforms();
        if active.is_empty() {
            return Err(RheemError::Configuration("no platforms registered".to_string()));
        }

        let epochs = self.mappings.apply_all(&mut self.graph, &active)?;
        tracing::info!(epochs, operators = self.graph.len(), "built hyperplan");

        let mut context = OptimizationContext::for_graph(&self.graph);
        let manager =
            CardinalityEstimatorManager::new(&self.graph, &self.configuration, &self.overrides);
        manager.push_cardinalities(&mut context)?;

        let implementation = self.enumerate(&context, BTreeSet::new(), BTreeMap::new())?;
        let estimated_time = implementation.time_estimate;
        let estimated_cost = implementation.cost_estimate;
        tracing::info!(
            time = %estimated_time,
            cost = %estimated_cost,
            "picked cheapest implementation"
        );

        if self.configuration.get_bool("rheem.core.debug.skipexecution", false) {
            return Ok(JobSummary {
                job_id: self.id.clone(),
                estimated_time,
                estimated_cost,
                measured_millis: 0,
                executed_stages: 0,
                reoptimizations: 0,
                platforms: implementation.platforms(&self.graph).into_iter().collect(),
            });
        }

        let mut plan = PlanLowering::new(&self.graph, &implementation).lower()?;
        let mut executors: BTreeMap<PlatformId, Arc<dyn Executor>> = BTreeMap::new();
        let mut instances: BTreeMap<ChannelId, Arc<ChannelInstance>> = BTreeMap::new();
        self.prepare_round(&plan, &mut executors, &mut instances, state)?;

        let reoptimize = self.configuration.get_bool("rheem.core.optimizer.reoptimize", true);
        let drift_ratio = self.configuration.get_f64("rheem.core.optimizer.reoptimize.ratio", 5.0);
        let mut drift = CardinalityDriftBreakpoint::new(drift_ratio);

        let mut completed: BTreeSet<StageId> = BTreeSet::new();
        let mut executed_operators: BTreeSet<OperatorId> = BTreeSet::new();
        let mut open_channels: BTreeMap<OutputRef, (ChannelId, ChannelDescriptor)> = BTreeMap::new();
        let mut stage_offset = 0u32;
        let mut executed_stages = 0usize;
        let mut reoptimizations = 0usize;

        loop {
            let ready = plan.ready_stages(&completed);
            if ready.is_empty() {
                if !plan.is_finished(&completed) {
                    return Err(RheemError::Internal(
                        "execution plan deadlocked with unexecuted stages".to_string(),
                    ));
                }
                break;
            }
            if self.cancel.load(Ordering::Acquire) {
                for executor in executors.values() {
                    executor.cancel();
                }
                return Err(RheemError::execution("job", "cancelled"));
            }

            // Dispatch the wave; independent stages run concurrently, and
            // every dispatched task finishes before the breakpoint check.
            let mut wave = Vec::new();
            for stage_id in &ready {
                let stage = &plan.stages[stage_id];
                let executor = Arc::clone(&executors[&stage.platform]);
                let tasks: Vec<Arc<ExecutionTask>> = stage
                    .tasks
                    .iter()
                    .map(|task_id| Arc::clone(&plan.tasks[task_id]))
                    .collect();
                wave.push(execute_stage(
                    stage.id,
                    stage.platform.clone(),
                    tasks,
                    executor,
                    instances.clone(),
                ));
            }
            let outcomes = futures::future::try_join_all(wave).await?;

            for outcome in outcomes {
                completed.insert(outcome.stage_id);
                executed_stages += 1;
                state
                    .completed_stages
                    .insert(StageId(stage_offset + outcome.stage_id.0));
                state.initialized_platforms.insert(outcome.platform.clone());
                let partial = self.build_partial_execution(&outcome, &context);
                state.partial_executions.push(partial);
                state.partial_executions.extend(outcome.backend_partials);

                for task in &outcome.tasks {
                    if let Some(origin) = task.origin {
                        if origin.loop_node.is_none() {
                            executed_operators.insert(origin.operator);
                        }
                    }
                    // Remember produced outer channels as open boundaries.
                    for channel_id in &task.outputs {
                        let channel = &plan.channels[channel_id];
                        if let Some((operator, index, None)) = channel.measured_origin {
                            open_channels.insert(
                                OutputRef::new(operator, index),
                                (*channel_id, channel.descriptor.clone()),
                            );
                        }
                    }
                }
            }
            // Loops count as executed once all their iterations ran.
            for loop_node in fully_executed_loops(&plan, &completed) {
                executed_operators.insert(loop_node);
            }

            if plan.is_finished(&completed) {
                break;
            }

            // Feed measurements back; re-pushing is cheap when nothing
            // changed.
            state.channel_instances = instances.clone();
            let drifted = drift.detect(state, &context);
            let measurements = state.cardinality_measurements();
            manager.push_cardinality_updates(&mut context, &measurements)?;

            if reoptimize && drifted && no_partial_loops(&plan, &completed) {
                tracing::info!("re-optimizing the unexecuted remainder");
                let implementation = self.enumerate(
                    &context,
                    executed_operators.clone(),
                    open_channels.clone(),
                )?;
                let channel_floor = plan.channels.keys().map(|c| c.0 + 1).max().unwrap_or(0);
                let task_floor = plan.tasks.keys().map(|t| t.0 + 1).max().unwrap_or(0);
                stage_offset += plan.stages.len() as u32;
                plan = PlanLowering::new(&self.graph, &implementation)
                    .with_boundary(
                        executed_operators.clone(),
                        open_channels.clone(),
                        channel_floor,
                        task_floor,
                    )
                    .lower()?;
                completed.clear();
                reoptimizations += 1;
                self.prepare_round(&plan, &mut executors, &mut instances, state)?;
            }
        }

        state.channel_instances = instances;
        for executor in executors.values() {
            executor.dispose();
        }

        Ok(JobSummary {
            job_id: self.id.clone(),
            estimated_time,
            estimated_cost,
            measured_millis: state.total_measured_millis(),
            executed_stages,
            reoptimizations,
            platforms: state.initialized_platforms.iter().cloned().collect(),
        })
    }

    fn enumerate(
        &self,
        context: &OptimizationContext,
        executed: BTreeSet<OperatorId>,
        open_channels: BTreeMap<OutputRef, (ChannelId, ChannelDescriptor)>,
    ) -> Result<PlanImplementation> {
        let boundary = open_channels
            .into_iter()
            .map(|(output, (_, descriptor))| (output, descriptor))
            .collect();
        let enumerator = PlanEnumerator::new(
            &self.graph,
            context,
            &self.configuration,
            &self.conversions,
            self.platforms.active_platforms(),
            strategies_from_configuration(&self.configuration),
        )
        .with_executed(executed, boundary);
        let enumeration = enumerator.enumerate()?;
        enumeration
            .best()
            .cloned()
            .ok_or_else(|| RheemError::NoViablePlan("empty enumeration".to_string()))
    }

    /// Create executors and channel instances this round still misses.
    fn prepare_round(
        &self,
        plan: &ExecutionPlan,
        executors: &mut BTreeMap<PlatformId, Arc<dyn Executor>>,
        instances: &mut BTreeMap<ChannelId, Arc<ChannelInstance>>,
        state: &mut ExecutionState,
    ) -> Result<()> {
        for stage in plan.stages.values() {
            if !executors.contains_key(&stage.platform) {
                let platform = self.platforms.get(&stage.platform)?;
                executors.insert(stage.platform.clone(), platform.create_executor());
                state.initialized_platforms.insert(stage.platform.clone());
            }
        }
        for channel in plan.channels.values() {
            instances.entry(channel.id).or_insert_with(|| {
                let producer = channel.measured_origin.map(|(operator, index, _)| (operator, index));
                let iteration = channel.measured_origin.and_then(|(_, _, iteration)| iteration);
                let instance =
                    ChannelInstance::new(channel.id, channel.descriptor.clone(), producer, iteration);
                if channel.instrumented {
                    instance.mark_for_instrumentation();
                }
                instance
            });
        }
        Ok(())
    }

    fn build_partial_execution(
        &self,
        outcome: &StageOutcome,
        context: &OptimizationContext,
    ) -> PartialExecution {
        let mut operator_executions = Vec::new();
        for task in &outcome.tasks {
            let Some(origin) = task.origin else { continue };
            let (inputs, outputs) = context
                .find_context(origin.operator, origin.iteration)
                .map(|c| (c.input_cardinalities.clone(), c.output_cardinalities.clone()))
                .unwrap_or_default();
            operator_executions.push(OperatorExecution {
                operator_name: task.operator.name().to_string(),
                configuration_key: task.operator.load_profile_key(),
                input_cardinalities: inputs,
                output_cardinalities: outputs,
                num_executions: 1,
            });
        }
        PartialExecution {
            measured_execution_millis: outcome.duration_millis,
            operator_executions,
            initialized_platforms: vec![outcome.platform.to_string()],
        }
    }

    fn write_log(&self, state: &ExecutionState) -> Result<()> {
        if state.partial_executions.is_empty() {
            return Ok(());
        }
        let log = ExecutionLog::open(&self.configuration)?;
        for partial in &state.partial_executions {
            log.append(partial)?;
        }
        log.flush()
    }
}

/// Loops of the current plan whose every task has executed.
fn fully_executed_loops(
    plan: &ExecutionPlan,
    completed: &BTreeSet<StageId>,
) -> Vec<OperatorId> {
    let mut totals: BTreeMap<OperatorId, (usize, usize)> = BTreeMap::new();
    for stage in plan.stages.values() {
        let stage_completed = completed.contains(&stage.id);
        for task_id in &stage.tasks {
            if let Some(origin) = plan.tasks[task_id].origin {
                if let Some(loop_node) = origin.loop_node {
                    let entry = totals.entry(loop_node).or_insert((0, 0));
                    entry.0 += 1;
                    if stage_completed {
                        entry.1 += 1;
                    }
                }
            }
        }
    }
    totals
        .into_iter()
        .filter(|(_, (total, executed))| total == executed)
        .map(|(loop_node, _)| loop_node)
        .collect()
}

struct StageOutcome {
    stage_id: StageId,
    platform: PlatformId,
    duration_millis: u64,
    tasks: Vec<Arc<ExecutionTask>>,
    backend_partials: Vec<PartialExecution>,
}

/// Push executor template: submit each task of the stage in order, await
/// its completion, mark the produced lineage. A task is atomic; its
/// failure aborts the job with the task named in the error.
async fn execute_stage(
    stage_id: StageId,
    platform: PlatformId,
    tasks: Vec<Arc<ExecutionTask>>,
    executor: Arc<dyn Executor>,
    instances: BTreeMap<ChannelId, Arc<ChannelInstance>>,
) -> Result<StageOutcome> {
    let started = Instant::now();
    let mut backend_partials = Vec::new();
    for task in &tasks {
        let inputs: Vec<Arc<ChannelInstance>> = task
            .inputs
            .iter()
            .map(|id| Arc::clone(&instances[id]))
            .collect();
        let outputs: Vec<Arc<ChannelInstance>> = task
            .outputs
            .iter()
            .map(|id| Arc::clone(&instances[id]))
            .collect();
        for output in &outputs {
            for input in &inputs {
                output.add_predecessor(Arc::clone(input));
            }
        }
        let backend_partial = executor
            .execute(Arc::clone(task), inputs, outputs.clone())
            .await
            .map_err(|error| RheemError::execution(task.id.to_string(), error.to_string()))?;
        if let Some(partial) = backend_partial {
            backend_partials.push(partial);
        }
        for output in &outputs {
            output.collect_and_mark();
        }
    }
    Ok(StageOutcome {
        stage_id,
        platform,
        duration_millis: started.elapsed().as_millis() as u64,
        tasks,
        backend_partials,
    })
}
