//! Dynamic load profile estimators
//!
//! For every operator class in the training data the learner instantiates
//! a linear template `a0*in0 + ... + b0*out0 + ... + c` whose coefficients
//! are optimization variables, plus one overhead variable per platform.
//! Fitted coefficients serialize back into the configuration's JSON load
//! profile format.

use std::collections::BTreeMap;

use rheem_common::Configuration;
use rheem_core::platform::state::{OperatorExecution, PartialExecution};

use crate::space::{Bitmask, OptimizationSpace};

/// A linear CPU load template over the cardinalities of one operator
/// class.
#[derive(Debug, Clone)]
pub struct DynamicLoadProfileEstimator {
    /// Load profile configuration key this estimator fits, e.g.
    /// `rheem.basic.map.load`.
    pub configuration_key: String,
    pub input_variables: Vec<usize>,
    pub output_variables: Vec<usize>,
    pub offset_variable: usize,
}

impl DynamicLoadProfileEstimator {
    /// Create the template for one operator class, registering its
    /// variables in the optimization space.
    pub fn for_operator(
        execution: &OperatorExecution,
        space: &mut OptimizationSpace,
    ) -> Self {
        let key = execution
            .configuration_key
            .clone()
            .unwrap_or_else(|| format!("rheem.unkeyed.{}.load", execution.operator_name));
        let input_variables = (0..execution.input_cardinalities.len())
            .map(|index| space.get_or_create(&format!("{key}.in{index}")))
            .collect();
        let output_variables = (0..execution.output_cardinalities.len())
            .map(|index| space.get_or_create(&format!("{key}.out{index}")))
            .collect();
        let offset_variable = space.get_or_create(&format!("{key}.offset"));
        Self {
            configuration_key: key,
            input_variables,
            output_variables,
            offset_variable,
        }
    }

    pub fn employed_variables(&self) -> Bitmask {
        let mut mask = Bitmask::default();
        for variable in self
            .input_variables
            .iter()
            .chain(self.output_variables.iter())
            .chain(std::iter::once(&self.offset_variable))
        {
            mask.insert(*variable);
        }
        mask
    }

    /// CPU load of one operator execution under a genome.
    pub fn estimate_cpu(&self, genome: &[f64], execution: &OperatorExecution) -> f64 {
        let mut load = genome[self.offset_variable];
        for (variable, cardinality) in self
            .input_variables
            .iter()
            .zip(execution.input_cardinalities.iter())
        {
            if let Some(cardinality) = cardinality {
                load += genome[*variable] * cardinality.average() as f64;
            }
        }
        for (variable, cardinality) in self
            .output_variables
            .iter()
            .zip(execution.output_cardinalities.iter())
        {
            if let Some(cardinality) = cardinality {
                load += genome[*variable] * cardinality.average() as f64;
            }
        }
        load.max(0.0)
    }

    /// Serialize the fitted coefficients in the configuration's JSON load
    /// profile format.
    pub fn to_json_config(&self, genome: &[f64]) -> String {
        let mut terms = Vec::new();
        for (index, variable) in self.input_variables.iter().enumerate() {
            terms.push(format!("{:.4} * in{index}", genome[*variable]));
        }
        for (index, variable) in self.output_variables.iter().enumerate() {
            terms.push(format!("{:.4} * out{index}", genome[*variable]));
        }
        terms.push(format!("{:.4}", genome[self.offset_variable]));
        let expression = terms.join(" + ");
        format!(
            "{} = {}",
            self.configuration_key,
            serde_json::json!({ "cpu": expression })
        )
    }
}

/// Predict the duration of a partial execution in milliseconds: per-operator
/// CPU loads converted by the platform's configured speed, plus the fitted
/// per-platform initialization overheads.
pub fn estimate_time(
    genome: &[f64],
    partial_execution: &PartialExecution,
    estimators: &BTreeMap<String, DynamicLoadProfileEstimator>,
    platform_overheads: &BTreeMap<String, usize>,
    configuration: &Configuration,
) -> f64 {
    let mut millis = 0.0;
    for execution in &partial_execution.operator_executions {
        let Some(estimator) = estimators.get(&execution.operator_name) else {
            continue;
        };
        let load = estimator.estimate_cpu(genome, execution) * execution.num_executions as f64;
        let platform = partial_execution
            .initialized_platforms
            .first()
            .map(String::as_str)
            .unwrap_or("basic");
        let speed = configuration.get_f64(&format!("rheem.{platform}.speed.cpu"), 1_000_000.0);
        millis += load / speed.max(f64::MIN_POSITIVE);
    }
    for platform in &partial_execution.initialized_platforms {
        if let Some(variable) = platform_overheads.get(platform) {
            millis += genome[*variable].max(0.0);
        }
    }
    millis
}

#[cfg(test)]
mod tests {
    use super::*;
    use rheem_common::CardinalityEstimate;

    fn execution(inputs: &[u64], outputs: &[u64]) -> OperatorExecution {
        OperatorExecution {
            operator_name: "BasicMapOperator".to_string(),
            configuration_key: Some("rheem.basic.map.load".to_string()),
            input_cardinalities: inputs.iter().map(|c| Some(CardinalityEstimate::exact(*c))).collect(),
            output_cardinalities: outputs.iter().map(|c| Some(CardinalityEstimate::exact(*c))).collect(),
            num_executions: 1,
        }
    }

    #[test]
    fn test_linear_template() {
        let mut space = OptimizationSpace::new();
        let execution = execution(&[10], &[10]);
        let estimator = DynamicLoadProfileEstimator::for_operator(&execution, &mut space);
        assert_eq!(space.num_dimensions(), 3);

        // genome: in0 = 2, out0 = 1, offset = 5
        let load = estimator.estimate_cpu(&[2.0, 1.0, 5.0], &execution);
        assert!((load - 35.0).abs() < 1e-9);
    }

    #[test]
    fn test_json_config_roundtrips_through_core_parser() {
        let mut space = OptimizationSpace::new();
        let execution = execution(&[10], &[]);
        let estimator = DynamicLoadProfileEstimator::for_operator(&execution, &mut space);
        let config_line = estimator.to_json_config(&[100.0, 5000.0]);
        let json = config_line.split_once(" = ").unwrap().1;
        let parsed = rheem_core::LoadProfileEstimator::from_json_spec(json).unwrap();
        let profile = parsed.estimate(&[CardinalityEstimate::exact(10)], &[], &|_| None);
        assert_eq!(profile.cpu.lower, 6000);
    }
}
