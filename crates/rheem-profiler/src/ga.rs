//! Genetic optimizer
//!
//! Evolves variable assignments against a training set of partial
//! executions. Fitness is the negated sum of asymmetric log-ratio
//! penalties between measured and predicted durations; evolution keeps an
//! elite fraction, breeds by uniform crossover over the active genes and
//! mutates with scale-relative Gaussian noise. Equal fitness keeps
//! insertion order, so a fixed seed reproduces the run bit for bit.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rheem_common::Configuration;
use rheem_core::platform::state::PartialExecution;

use crate::estimators::{estimate_time, DynamicLoadProfileEstimator};
use crate::space::{Bitmask, Individual, OptimizationSpace};

pub struct GeneticOptimizer<'a> {
    space: &'a OptimizationSpace,
    data: &'a [PartialExecution],
    estimators: &'a BTreeMap<String, DynamicLoadProfileEstimator>,
    platform_overheads: &'a BTreeMap<String, usize>,
    configuration: &'a Configuration,
    activated_genes: Bitmask,
    population_size: usize,
    elite_ratio: f64,
    mutation_rate: f64,
    rng: StdRng,
}

impl<'a> GeneticOptimizer<'a> {
    pub fn new(
        space: &'a OptimizationSpace,
        data: &'a [PartialExecution],
        estimators: &'a BTreeMap<String, DynamicLoadProfileEstimator>,
        platform_overheads: &'a BTreeMap<String, usize>,
        configuration: &'a Configuration,
        seed: u64,
    ) -> Self {
        // Active genes: variables actually referenced by this training set.
        let mut activated_genes = Bitmask::default();
        for partial_execution in data {
            for execution in &partial_execution.operator_executions {
                if let Some(estimator) = estimators.get(&execution.operator_name) {
                    activated_genes.union(&estimator.employed_variables());
                }
            }
            for platform in &partial_execution.initialized_platforms {
                if let Some(variable) = platform_overheads.get(platform) {
                    activated_genes.insert(*variable);
                }
            }
        }
        Self {
            space,
            data,
            estimators,
            platform_overheads,
            configuration,
            activated_genes,
            population_size: configuration.get_u64("rheem.profiler.ga.population", 50) as usize,
            elite_ratio: configuration.get_f64("rheem.profiler.ga.elite", 0.2),
            mutation_rate: configuration.get_f64("rheem.profiler.ga.mutation", 0.2),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn data(&self) -> &[PartialExecution] {
        self.data
    }

    pub fn activated_genes(&self) -> &Bitmask {
        &self.activated_genes
    }

    pub fn create_initial_population(&mut self) -> Vec<Individual> {
        let mut population = Vec::with_capacity(self.population_size);
        for _ in 0..self.population_size {
            let genome = (0..self.space.num_dimensions())
                .map(|_| self.rng.gen_range(0.0..10.0))
                .collect();
            population.push(Individual::new(genome));
        }
        self.update_fitness(&mut population);
        population
    }

    /// Recompute all fitness values and sort descending; equal fitness
    /// keeps insertion order.
    pub fn update_fitness(&self, population: &mut Vec<Individual>) {
        for individual in population.iter_mut() {
            individual.fitness = self.fitness(&individual.genome);
        }
        population.sort_by(|a, b| {
            b.fitness
                .partial_cmp(&a.fitness)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
    }

    /// One generation: elite survives, offspring fills the rest.
    pub fn evolve(&mut self, population: Vec<Individual>) -> Vec<Individual> {
        let elite = ((self.population_size as f64 * self.elite_ratio).ceil() as usize)
            .clamp(1, self.population_size);
        let mut next: Vec<Individual> = population.iter().take(elite).cloned().collect();
        while next.len() < self.population_size {
            let left = self.select(&population);
            let right = self.select(&population);
            let mut genome = self.crossover(&population[left].genome, &population[right].genome);
            self.mutate(&mut genome);
            next.push(Individual::new(genome));
        }
        self.update_fitness(&mut next);
        next
    }

    /// `-sum(penalty)` over the training data; the penalty is the
    /// asymmetric log-ratio `ln(max+500)/ln(min+500) - 1`, insensitive at
    /// low magnitudes and unbounded at large divergence.
    pub fn fitness(&self, genome: &[f64]) -> f64 {
        let mut penalty_sum = 0.0;
        for partial_execution in self.data {
            let predicted = estimate_time(
                genome,
                partial_execution,
                self.estimators,
                self.platform_overheads,
                self.configuration,
            );
            let measured = partial_execution.measured_execution_millis as f64;
            penalty_sum += penalty(measured, predicted);
        }
        -penalty_sum
    }

    pub fn estimate_time(&self, genome: &[f64], partial_execution: &PartialExecution) -> f64 {
        estimate_time(
            genome,
            partial_execution,
            self.estimators,
            self.platform_overheads,
            self.configuration,
        )
    }

    /// Binary tournament selection.
    fn select(&mut self, population: &[Individual]) -> usize {
        let a = self.rng.gen_range(0..population.len());
        let b = self.rng.gen_range(0..population.len());
        if population[a].fitness >= population[b].fitness {
            a
        } else {
            b
        }
    }

    /// Uniform crossover over the active gene set; inactive genes come
    /// from the first parent.
    fn crossover(&mut self, left: &[f64], right: &[f64]) -> Vec<f64> {
        let mut genome = left.to_vec();
        for gene in self.activated_genes.iter() {
            if self.rng.gen_bool(0.5) {
                genome[gene] = right[gene];
            }
        }
        genome
    }

    /// Scale-relative Gaussian mutation on active genes.
    fn mutate(&mut self, genome: &mut [f64]) {
        let genes: Vec<usize> = self.activated_genes.iter().collect();
        for gene in genes {
            if self.rng.gen::<f64>() < self.mutation_rate {
                let scale = genome[gene].abs() * 0.5 + 1.0;
                genome[gene] += self.gaussian() * scale;
            }
        }
    }

    /// Box-Muller standard normal sample.
    fn gaussian(&mut self) -> f64 {
        let u1: f64 = self.rng.gen_range(f64::MIN_POSITIVE..1.0);
        let u2: f64 = self.rng.gen::<f64>();
        (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
    }
}

/// Asymmetric log-ratio penalty between a measurement and a prediction.
pub fn penalty(measured: f64, predicted: f64) -> f64 {
    let high = measured.max(predicted) + 500.0;
    let low = measured.min(predicted) + 500.0;
    high.ln() / low.ln() - 1.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use rheem_common::CardinalityEstimate;
    use rheem_core::platform::state::OperatorExecution;
    use crate::estimators::DynamicLoadProfileEstimator;
    use crate::space::OptimizationSpace;

    fn training_record(input: u64, millis: u64) -> PartialExecution {
        PartialExecution {
            measured_execution_millis: millis,
            operator_executions: vec![OperatorExecution {
                operator_name: "BasicMapOperator".to_string(),
                configuration_key: Some("rheem.test.map.load".to_string()),
                input_cardinalities: vec![Some(CardinalityEstimate::exact(input))],
                output_cardinalities: vec![],
                num_executions: 1,
            }],
            initialized_platforms: vec!["test".to_string()],
        }
    }

    fn setup(
        data: &[PartialExecution],
    ) -> (
        OptimizationSpace,
        BTreeMap<String, DynamicLoadProfileEstimator>,
        BTreeMap<String, usize>,
        Configuration,
    ) {
        let mut space = OptimizationSpace::new();
        let mut estimators = BTreeMap::new();
        let mut overheads = BTreeMap::new();
        for partial in data {
            for execution in &partial.operator_executions {
                estimators
                    .entry(execution.operator_name.clone())
                    .or_insert_with(|| DynamicLoadProfileEstimator::for_operator(execution, &mut space));
            }
            for platform in &partial.initialized_platforms {
                overheads
                    .entry(platform.clone())
                    .or_insert_with(|| space.get_or_create(&format!("{platform}.overhead")));
            }
        }
        let mut configuration = Configuration::new();
        configuration.set("rheem.test.speed.cpu", "1.0");
        (space, estimators, overheads, configuration)
    }

    #[test]
    fn test_penalty_shape() {
        assert!(penalty(100.0, 100.0).abs() < 1e-12);
        assert!(penalty(100.0, 1000.0) > 0.0);
        // Symmetric in its arguments.
        assert!((penalty(100.0, 1000.0) - penalty(1000.0, 100.0)).abs() < 1e-12);
        // Insensitive at low magnitudes, growing with divergence.
        assert!(penalty(1.0, 10.0) < penalty(1_000.0, 100_000.0));
    }

    #[test]
    fn test_fixed_seed_reproduces_evolution() {
        let data: Vec<PartialExecution> =
            (1..20).map(|i| training_record(i * 10, i * 10 * 7 + 100)).collect();
        let (space, estimators, overheads, configuration) = setup(&data);

        let run = || {
            let mut optimizer =
                GeneticOptimizer::new(&space, &data, &estimators, &overheads, &configuration, 99);
            let mut population = optimizer.create_initial_population();
            for _ in 0..50 {
                population = optimizer.evolve(population);
            }
            population[0].genome.clone()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_fitness_improves_over_generations() {
        let data: Vec<PartialExecution> =
            (1..30).map(|i| training_record(i * 10, i * 10 * 7 + 100)).collect();
        let (space, estimators, overheads, configuration) = setup(&data);
        let mut optimizer =
            GeneticOptimizer::new(&space, &data, &estimators, &overheads, &configuration, 7);
        let mut population = optimizer.create_initial_population();
        let initial = population[0].fitness;
        for _ in 0..200 {
            population = optimizer.evolve(population);
        }
        assert!(population[0].fitness >= initial);
    }
}
