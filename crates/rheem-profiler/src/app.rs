//! Learner application
//!
//! Fits load profile coefficients from the execution log: load and filter
//! the records, group them by operator signature, thin dominant queries by
//! log-time binning, then run the genetic search (optionally seeded per
//! group in blocking mode and spread over parallel tribes), removing noisy
//! training points between convergence rounds. The result serializes in
//! the configuration's load profile format.

use std::collections::{BTreeMap, BTreeSet};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use rheem_common::{Configuration, Result, RheemError};
use rheem_core::platform::state::PartialExecution;
use rheem_core::profiling::ExecutionLog;

use crate::estimators::DynamicLoadProfileEstimator;
use crate::ga::{penalty, GeneticOptimizer};
use crate::space::{Individual, OptimizationSpace};

/// The learner's output: fitted coefficients ready for the configuration.
#[derive(Debug, Clone)]
pub struct FittedModel {
    pub fitness: f64,
    pub generations: usize,
    /// Active variable id -> fitted value.
    pub coefficients: BTreeMap<String, f64>,
    /// `<key> = {"cpu": "..."}` lines in the configuration's format.
    pub configuration_lines: Vec<String>,
}

pub struct GeneticOptimizerApp {
    configuration: Configuration,
    space: OptimizationSpace,
    partial_executions: Vec<PartialExecution>,
    estimators: BTreeMap<String, DynamicLoadProfileEstimator>,
    platform_overheads: BTreeMap<String, usize>,
    master_seed: u64,
}

impl GeneticOptimizerApp {
    pub fn new(configuration: Configuration) -> Result<Self> {
        let log_path =
            configuration.get_string("rheem.core.log.executions", "rheem-executions.json");
        let sampling = configuration.get_f64("rheem.profiler.ga.sampling", 1.0);
        let min_confidence =
            configuration.get_f64("rheem.profiler.ga.min-cardinality-confidence", 1.0);
        let master_seed = configuration.get_u64("rheem.profiler.ga.seed", 42);

        let mut rng = StdRng::seed_from_u64(master_seed);
        let mut partial_executions: Vec<PartialExecution> = ExecutionLog::read(&log_path)?
            .into_iter()
            .filter(|partial| is_confident(partial, min_confidence))
            .filter(|_| rng.gen::<f64>() < sampling)
            .collect();
        tracing::info!(records = partial_executions.len(), log = %log_path, "loaded execution log");

        // Log-time binning per signature group keeps one representative
        // per bucket so dominant queries do not flood the training set.
        let binning = configuration.get_f64("rheem.profiler.ga.binning", 1.1);
        if binning > 1.0 {
            let before = partial_executions.len();
            let groups = group_by_signature(std::mem::take(&mut partial_executions));
            for group in groups {
                partial_executions.extend(bin_by_execution_time(group, binning));
            }
            tracing::info!(before, after = partial_executions.len(), "applied binning");
        }

        // Instantiate the variable space.
        let mut space = OptimizationSpace::new();
        let mut estimators = BTreeMap::new();
        let mut platform_overheads = BTreeMap::new();
        for partial in &partial_executions {
            for execution in &partial.operator_executions {
                estimators
                    .entry(execution.operator_name.clone())
                    .or_insert_with(|| {
                        DynamicLoadProfileEstimator::for_operator(execution, &mut space)
                    });
            }
            for platform in &partial.initialized_platforms {
                platform_overheads
                    .entry(platform.clone())
                    .or_insert_with(|| space.get_or_create(&format!("{platform}.overhead")));
            }
        }
        tracing::info!(
            records = partial_executions.len(),
            operator_types = estimators.len(),
            platforms = platform_overheads.len(),
            "initialized optimization space"
        );

        Ok(Self {
            configuration,
            space,
            partial_executions,
            estimators,
            platform_overheads,
            master_seed,
        })
    }

    pub fn run(&mut self) -> Result<FittedModel> {
        if self.space.num_dimensions() == 0 {
            return Err(RheemError::Configuration(
                "nothing to optimize: the log declares no load profile variables".to_string(),
            ));
        }
        let max_generations =
            self.configuration.get_u64("rheem.profiler.ga.maxgenerations", 5000) as usize;
        let max_stable =
            self.configuration.get_u64("rheem.profiler.ga.maxstablegenerations", 2000) as usize;
        let min_fitness = self.configuration.get_f64("rheem.profiler.ga.minfitness", 0.0);
        let tribes = self
            .configuration
            .get_u64("rheem.profiler.ga.superoptimizations", 3)
            .max(1) as usize;
        let blocking = self.configuration.get_bool("rheem.profiler.ga.blocking", false);
        let max_removals = self.configuration.get_u64("rheem.profiler.ga.noise-filter.max", 3);
        let removal_threshold =
            self.configuration.get_f64("rheem.profiler.ga.noise-filter.threshold", 2.0);

        let mut population = {
            let mut optimizer = self.optimizer(&self.partial_executions, self.master_seed);
            optimizer.create_initial_population()
        };
        let mut generation = 0usize;

        // Blocking mode: seed the global run from per-group passes.
        if blocking {
            let groups = group_by_signature(self.partial_executions.clone());
            for group in &groups {
                if group.len() < 2 {
                    tracing::warn!(signature = ?signature_of(&group[0]), "few measurement points");
                    continue;
                }
                let min_time = group.iter().map(|p| p.measured_execution_millis).min().unwrap_or(0);
                let max_time = group.iter().map(|p| p.measured_execution_millis).max().unwrap_or(0);
                if max_time - min_time < 1000 {
                    tracing::warn!(signature = ?signature_of(&group[0]), "narrow training data");
                    continue;
                }
                let (next_generation, next_population) = self.super_optimize(
                    tribes,
                    population,
                    group,
                    generation,
                    max_generations,
                    max_stable,
                    min_fitness,
                );
                generation = next_generation;
                population = next_population;
            }
        }

        // Main convergence loop with the noise filter.
        loop {
            let (next_generation, next_population) = self.super_optimize(
                tribes,
                population,
                &self.partial_executions.clone(),
                generation,
                max_generations,
                max_stable,
                min_fitness,
            );
            generation = next_generation;
            population = next_population;
            let fittest = population[0].clone();

            if max_removals == 0 {
                break;
            }
            // Collect training points the model does not explain.
            let mut deviations: Vec<(usize, f64)> = {
                let optimizer = self.optimizer(&self.partial_executions, self.master_seed);
                self.partial_executions
                    .iter()
                    .enumerate()
                    .filter_map(|(index, partial)| {
                        let predicted = optimizer.estimate_time(&fittest.genome, partial);
                        let measured = partial.measured_execution_millis as f64;
                        let deviation =
                            (measured.max(predicted) + 500.0) / (measured.min(predicted) + 500.0);
                        (deviation > removal_threshold).then_some((index, deviation))
                    })
                    .collect()
            };
            if deviations.is_empty() {
                tracing::info!(
                    records = self.partial_executions.len(),
                    "all executions are explained by the model"
                );
                break;
            }
            tracing::info!(
                unexplained = deviations.len(),
                total = self.partial_executions.len(),
                "removing noisy training points"
            );
            deviations.sort_by(|a, b| {
                b.1.partial_cmp(&a.1)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.0.cmp(&b.0))
            });
            let removals: BTreeSet<usize> = deviations
                .iter()
                .take(max_removals as usize)
                .map(|(index, _)| *index)
                .collect();
            let mut index = 0;
            self.partial_executions.retain(|_| {
                let keep = !removals.contains(&index);
                index += 1;
                keep
            });
        }

        Ok(self.fitted_model(&population[0], generation))
    }

    fn optimizer<'a>(
        &'a self,
        data: &'a [PartialExecution],
        seed: u64,
    ) -> GeneticOptimizer<'a> {
        GeneticOptimizer::new(
            &self.space,
            data,
            &self.estimators,
            &self.platform_overheads,
            &self.configuration,
            seed,
        )
    }

    /// Run independent tribes in parallel, each with its own seeded RNG,
    /// and merge the top slice of every tribe.
    #[allow(clippy::too_many_arguments)]
    fn super_optimize(
        &self,
        tribes: usize,
        population: Vec<Individual>,
        data: &[PartialExecution],
        current_generation: usize,
        max_generations: usize,
        max_stable: usize,
        min_fitness: f64,
    ) -> (usize, Vec<Individual>) {
        let per_tribe = population.len().div_ceil(tribes);
        let results: Vec<(usize, Vec<Individual>)> = (0..tribes)
            .into_par_iter()
            .map(|tribe| {
                self.optimize(
                    population.clone(),
                    data,
                    self.master_seed.wrapping_add(tribe as u64 + 1),
                    current_generation,
                    max_generations,
                    max_stable,
                    min_fitness,
                )
            })
            .collect();

        let mut merged: Vec<Individual> = Vec::with_capacity(per_tribe * tribes);
        let mut max_generation = current_generation;
        for (generation, tribe_population) in results {
            max_generation = max_generation.max(generation);
            merged.extend(tribe_population.into_iter().take(per_tribe));
        }
        merged.sort_by(|a, b| {
            b.fitness
                .partial_cmp(&a.fitness)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        merged.truncate(population.len().max(1));
        (max_generation, merged)
    }

    /// Evolve until `max_generations` or until the fittest individual has
    /// not improved by 0.001 over a stable-generation window (while already
    /// meeting `min_fitness`).
    #[allow(clippy::too_many_arguments)]
    fn optimize(
        &self,
        mut population: Vec<Individual>,
        data: &[PartialExecution],
        seed: u64,
        mut current_generation: usize,
        max_generations: usize,
        max_stable: usize,
        min_fitness: f64,
    ) -> (usize, Vec<Individual>) {
        let mut optimizer = self.optimizer(data, seed);
        if optimizer.activated_genes().is_empty() {
            tracing::warn!("optimization task without optimizable genes, skipping");
            return (current_generation, population);
        }
        optimizer.update_fitness(&mut population);
        let mut checkpoint = f64::NEG_INFINITY;
        let stable_window = max_stable.max(1);
        for i in 0..max_generations {
            if i % stable_window == 0 {
                let fitness = population[0].fitness;
                if i > 0 && fitness < checkpoint + 0.001 && fitness >= min_fitness {
                    break;
                }
                checkpoint = fitness;
            }
            population = optimizer.evolve(population);
            current_generation += 1;
        }
        (current_generation, population)
    }

    fn fitted_model(&self, fittest: &Individual, generations: usize) -> FittedModel {
        let optimizer = self.optimizer(&self.partial_executions, self.master_seed);
        let active = optimizer.activated_genes().clone();
        let mut coefficients = BTreeMap::new();
        for gene in active.iter() {
            coefficients.insert(self.space.variable(gene).id.clone(), fittest.genome[gene]);
        }
        let mut configuration_lines = Vec::new();
        for estimator in self.estimators.values() {
            let covered = estimator
                .employed_variables()
                .iter()
                .all(|gene| active.contains(gene));
            if covered {
                configuration_lines.push(estimator.to_json_config(&fittest.genome));
            }
        }
        for (platform, variable) in &self.platform_overheads {
            if active.contains(*variable) {
                configuration_lines.push(format!(
                    "(overhead of {platform}) = {}",
                    fittest.genome[*variable].round()
                ));
            }
        }
        FittedModel {
            fitness: fittest.fitness,
            generations,
            coefficients,
            configuration_lines,
        }
    }

    /// Mean per-point penalty of a genome; exposed for tests.
    pub fn mean_penalty(&self, genome: &[f64]) -> f64 {
        let optimizer = self.optimizer(&self.partial_executions, self.master_seed);
        let mut sum = 0.0;
        for partial in &self.partial_executions {
            let predicted = optimizer.estimate_time(genome, partial);
            sum += penalty(partial.measured_execution_millis as f64, predicted);
        }
        sum / self.partial_executions.len().max(1) as f64
    }
}

fn is_confident(partial_execution: &PartialExecution, min_confidence: f64) -> bool {
    partial_execution.operator_executions.iter().all(|execution| {
        execution
            .input_cardinalities
            .iter()
            .chain(execution.output_cardinalities.iter())
            .flatten()
            .all(|cardinality| cardinality.correctness_prob >= min_confidence)
    })
}

fn signature_of(partial_execution: &PartialExecution) -> BTreeSet<String> {
    partial_execution
        .operator_executions
        .iter()
        .map(|execution| execution.operator_name.clone())
        .collect()
}

/// Group records by their operator-class signature, smallest signatures
/// first.
fn group_by_signature(partial_executions: Vec<PartialExecution>) -> Vec<Vec<PartialExecution>> {
    let mut groups: BTreeMap<Vec<String>, Vec<PartialExecution>> = BTreeMap::new();
    for partial in partial_executions {
        let signature: Vec<String> = signature_of(&partial).into_iter().collect();
        groups.entry(signature).or_default().push(partial);
    }
    let mut ordered: Vec<(Vec<String>, Vec<PartialExecution>)> = groups.into_iter().collect();
    ordered.sort_by_key(|(signature, _)| signature.len());
    ordered.into_iter().map(|(_, group)| group).collect()
}

/// Keep one representative per logarithmic execution-time bucket.
fn bin_by_execution_time(
    partial_executions: Vec<PartialExecution>,
    stretch: f64,
) -> Vec<PartialExecution> {
    let mut bins: BTreeMap<i64, PartialExecution> = BTreeMap::new();
    for partial in partial_executions {
        let key = ((1.0 + partial.measured_execution_millis as f64).ln() / stretch.ln()).round()
            as i64;
        bins.insert(key, partial);
    }
    bins.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rheem_common::CardinalityEstimate;
    use rheem_core::platform::state::OperatorExecution;

    fn record(millis: u64, confidence: f64) -> PartialExecution {
        PartialExecution {
            measured_execution_millis: millis,
            operator_executions: vec![OperatorExecution {
                operator_name: "BasicMapOperator".to_string(),
                configuration_key: Some("rheem.basic.map.load".to_string()),
                input_cardinalities: vec![Some(CardinalityEstimate::new(10, 10, confidence))],
                output_cardinalities: vec![],
                num_executions: 1,
            }],
            initialized_platforms: vec!["basic".to_string()],
        }
    }

    #[test]
    fn test_confidence_filter() {
        assert!(is_confident(&record(10, 1.0), 1.0));
        assert!(!is_confident(&record(10, 0.5), 1.0));
        assert!(is_confident(&record(10, 0.5), 0.5));
    }

    #[test]
    fn test_binning_keeps_one_per_bucket() {
        let records: Vec<PartialExecution> = (0..100).map(|i| record(1000 + i, 1.0)).collect();
        // Times within a few per mille of each other land in one bucket.
        let binned = bin_by_execution_time(records, 1.1);
        assert_eq!(binned.len(), 1);

        let spread: Vec<PartialExecution> =
            [10u64, 100, 1_000, 10_000].iter().map(|t| record(*t, 1.0)).collect();
        let binned = bin_by_execution_time(spread, 1.1);
        assert_eq!(binned.len(), 4);
    }

    #[test]
    fn test_grouping_sorts_by_signature_size() {
        let mut two_ops = record(10, 1.0);
        two_ops.operator_executions.push(OperatorExecution {
            operator_name: "BasicFilterOperator".to_string(),
            configuration_key: None,
            input_cardinalities: vec![],
            output_cardinalities: vec![],
            num_executions: 1,
        });
        let groups = group_by_signature(vec![two_ops, record(20, 1.0)]);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0][0].operator_executions.len(), 1);
    }
}
