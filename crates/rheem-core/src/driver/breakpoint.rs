//! Breakpoints
//!
//! The driver pauses between stage waves to decide whether the remainder of
//! the plan should be re-optimized. The cardinality-drift breakpoint fires
//! when a measurement leaves the estimated interval by more than the
//! configured ratio; the no-iteration rule keeps re-enumeration out of
//! half-finished loops (measurements are still injected there).

use std::collections::BTreeSet;

use rheem_common::{ChannelId, StageId};

use crate::optimizer::context::OptimizationContext;
use crate::platform::execution::ExecutionPlan;
use crate::platform::state::ExecutionState;

/// Fires when a measured cardinality drifts outside the estimated interval
/// stretched by `ratio`. Each channel triggers at most once.
pub struct CardinalityDriftBreakpoint {
    ratio: f64,
    processed: BTreeSet<ChannelId>,
}

impl CardinalityDriftBreakpoint {
    pub fn new(ratio: f64) -> Self {
        Self {
            ratio: ratio.max(1.0),
            processed: BTreeSet::new(),
        }
    }

    /// Check fresh measurements against the current estimates. Must run
    /// before the measurements are injected, while the estimates still
    /// reflect the optimizer's expectation.
    pub fn detect(&mut self, state: &ExecutionState, context: &OptimizationContext) -> bool {
        let mut drifted = false;
        for instance in state.cardinality_measurements() {
            if !self.processed.insert(instance.id()) {
                continue;
            }
            let Some(measured) = instance.measured_cardinality() else {
                continue;
            };
            let Some((operator, output_index)) = instance.producer() else {
                continue;
            };
            let estimate = context
                .find_context(operator, instance.producer_iteration())
                .and_then(|c| c.output_cardinalities.get(output_index).copied().flatten());
            let Some(estimate) = estimate else {
                continue;
            };
            let lower = estimate.lower as f64 / self.ratio;
            let upper = estimate.upper as f64 * self.ratio;
            if (measured as f64) < lower || measured as f64 > upper {
                tracing::info!(
                    %operator,
                    measured,
                    estimate = %estimate,
                    "cardinality drift detected"
                );
                drifted = true;
            }
        }
        drifted
    }
}

/// Re-enumeration must not fire while a loop is half-executed; iterations
/// are only re-planned at head boundaries.
pub fn no_partial_loops(plan: &ExecutionPlan, completed: &BTreeSet<StageId>) -> bool {
    use std::collections::BTreeMap;
    let mut totals: BTreeMap<rheem_common::OperatorId, (usize, usize)> = BTreeMap::new();
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
        .values()
        .all(|(total, executed)| *executed == 0 || executed == total)
}
