//! Execution state and measurements
//!
//! `PartialExecution` is the atomic measurement unit reported per executed
//! stage: wallclock duration plus the operator executions it covered. The
//! records are serializable; the execution log persists them and the
//! profiler trains on them.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use rheem_common::{CardinalityEstimate, ChannelId, PlatformId, StageId};
use serde::{Deserialize, Serialize};

use crate::platform::channel::ChannelInstance;

/// One operator's share of a partial execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorExecution {
    /// Execution operator name, e.g. `BasicMapOperator`.
    pub operator_name: String,
    /// Load profile configuration key, if the operator declares one.
    pub configuration_key: Option<String>,
    pub input_cardinalities: Vec<Option<CardinalityEstimate>>,
    pub output_cardinalities: Vec<Option<CardinalityEstimate>>,
    pub num_executions: u32,
}

/// One atomic measured run of one or more tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialExecution {
    pub measured_execution_millis: u64,
    pub operator_executions: Vec<OperatorExecution>,
    /// Platforms that were initialized for this execution.
    pub initialized_platforms: Vec<String>,
}

/// Mutable runtime state of one job execution.
#[derive(Default)]
pub struct ExecutionState {
    pub completed_stages: BTreeSet<StageId>,
    /// All materialized channel instances, keyed by plan channel id.
    pub channel_instances: BTreeMap<ChannelId, Arc<ChannelInstance>>,
    pub partial_executions: Vec<PartialExecution>,
    pub initialized_platforms: BTreeSet<PlatformId>,
}

impl ExecutionState {
    /// Instrumented instances that have been produced and carry a
    /// measurement; the input to cardinality injection.
    pub fn cardinality_measurements(&self) -> Vec<Arc<ChannelInstance>> {
        self.channel_instances
            .values()
            .filter(|instance| {
                instance.is_marked_for_instrumentation()
                    && instance.was_produced()
                    && instance.measured_cardinality().is_some()
            })
            .cloned()
            .collect()
    }

    pub fn total_measured_millis(&self) -> u64 {
        self.partial_executions
            .iter()
            .map(|p| p.measured_execution_millis)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_execution_roundtrip() {
        let partial = PartialExecution {
            measured_execution_millis: 1234,
            operator_executions: vec![OperatorExecution {
                operator_name: "BasicMapOperator".to_string(),
                configuration_key: Some("rheem.basic.map.load".to_string()),
                input_cardinalities: vec![Some(CardinalityEstimate::exact(10))],
                output_cardinalities: vec![Some(CardinalityEstimate::exact(10)), None],
                num_executions: 1,
            }],
            initialized_platforms: vec!["basic".to_string()],
        };
        let json = serde_json::to_string(&partial).unwrap();
        let read: PartialExecution = serde_json::from_str(&json).unwrap();
        assert_eq!(partial, read);
    }
}
