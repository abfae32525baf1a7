//! Enumeration pruning strategies
//!
//! Applied in configured order after every concatenation. Every strategy
//! preserves the cheapest implementation, so pruning never removes the
//! best plan, only competitors.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rheem_common::{Configuration, PlatformId};

use crate::optimizer::enumeration::{PlanEnumeration, PlanImplementation};
use crate::plan::PlanGraph;

pub trait PruningStrategy: Send {
    fn name(&self) -> &'static str;

    fn prune(&mut self, graph: &PlanGraph, enumeration: &mut PlanEnumeration);
}

/// Instantiate the configured strategies, in application order.
pub fn strategies_from_configuration(configuration: &Configuration) -> Vec<Box<dyn PruningStrategy>> {
    let mut strategies: Vec<Box<dyn PruningStrategy>> = Vec::new();
    let top_k = configuration.get_u64("rheem.core.optimizer.pruning.topk", 8) as usize;
    if top_k > 0 {
        strategies.push(Box::new(TopKPruning { k: top_k }));
    }
    let sample = configuration.get_u64("rheem.core.optimizer.pruning.sample", 0) as usize;
    if sample > 0 {
        let seed = configuration.get_u64("rheem.core.optimizer.pruning.sample.seed", 42);
        strategies.push(Box::new(RandomPruning { cap: sample, seed }));
    }
    strategies.push(Box::new(LatentPruning));
    strategies
}

/// Keep the `k` cheapest implementations per operator-group signature
/// (same operators placed on the same platforms).
pub struct TopKPruning {
    pub k: usize,
}

impl PruningStrategy for TopKPruning {
    fn name(&self) -> &'static str {
        "top-k-by-cost"
    }

    fn prune(&mut self, graph: &PlanGraph, enumeration: &mut PlanEnumeration) {
        let mut groups: BTreeMap<Vec<(rheem_common::OperatorId, PlatformId)>, Vec<PlanImplementation>> =
            BTreeMap::new();
        for implementation in std::mem::take(&mut enumeration.implementations) {
            groups
                .entry(implementation.signature(graph))
                .or_default()
                .push(implementation);
        }
        for (_, mut group) in groups {
            // Stable: equal costs keep insertion order.
            group.sort_by(|a, b| a.cost_estimate.compare_by_expectation(&b.cost_estimate));
            group.truncate(self.k);
            enumeration.implementations.extend(group);
        }
    }
}

/// Cap the population by seeded random sampling; the cheapest
/// implementation is always retained.
pub struct RandomPruning {
    pub cap: usize,
    pub seed: u64,
}

impl PruningStrategy for RandomPruning {
    fn name(&self) -> &'static str {
        "random-sample"
    }

    fn prune(&mut self, _graph: &PlanGraph, enumeration: &mut PlanEnumeration) {
        if enumeration.implementations.len() <= self.cap {
            return;
        }
        let mut best_index = 0;
        for (index, implementation) in enumeration.implementations.iter().enumerate() {
            if implementation
                .cost_estimate
                .compare_by_expectation(&enumeration.implementations[best_index].cost_estimate)
                == std::cmp::Ordering::Less
            {
                best_index = index;
            }
        }

        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut indices: Vec<usize> = (0..enumeration.implementations.len())
            .filter(|index| *index != best_index)
            .collect();
        indices.shuffle(&mut rng);
        indices.truncate(self.cap.saturating_sub(1));
        indices.push(best_index);
        indices.sort_unstable();

        let implementations = std::mem::take(&mut enumeration.implementations);
        enumeration.implementations = implementations
            .into_iter()
            .enumerate()
            .filter(|(index, _)| indices.binary_search(index).is_ok())
            .map(|(_, implementation)| implementation)
            .collect();
    }
}

/// Drop implementations whose lower-bound cost already exceeds the
/// smallest upper-bound cost among their peers.
pub struct LatentPruning;

impl PruningStrategy for LatentPruning {
    fn name(&self) -> &'static str {
        "latent"
    }

    fn prune(&mut self, _graph: &PlanGraph, enumeration: &mut PlanEnumeration) {
        let min_upper = enumeration
            .implementations
            .iter()
            .map(|implementation| implementation.cost_estimate.upper)
            .fold(f64::INFINITY, f64::min);
        enumeration
            .implementations
            .retain(|implementation| implementation.cost_estimate.lower <= min_upper);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rheem_common::{ProbabilisticDoubleInterval, TimeEstimate};

    fn implementation(lower: f64, upper: f64) -> PlanImplementation {
        PlanImplementation {
            cost_estimate: ProbabilisticDoubleInterval::new(lower, upper, 1.0),
            time_estimate: TimeEstimate::ZERO,
            ..Default::default()
        }
    }

    #[test]
    fn test_latent_pruning_keeps_best() {
        let graph = PlanGraph::new();
        let mut enumeration = PlanEnumeration {
            scope: Default::default(),
            implementations: vec![
                implementation(10.0, 20.0),
                implementation(25.0, 40.0), // lower bound above min upper: dropped
                implementation(15.0, 18.0),
            ],
        };
        LatentPruning.prune(&graph, &mut enumeration);
        assert_eq!(enumeration.implementations.len(), 2);
    }

    #[test]
    fn test_random_pruning_retains_cheapest() {
        let graph = PlanGraph::new();
        let mut implementations = Vec::new();
        for i in 0..100 {
            implementations.push(implementation(100.0 + i as f64, 200.0 + i as f64));
        }
        implementations.push(implementation(1.0, 2.0));
        let mut enumeration = PlanEnumeration {
            scope: Default::default(),
            implementations,
        };
        let mut pruning = RandomPruning { cap: 10, seed: 7 };
        pruning.prune(&graph, &mut enumeration);
        assert_eq!(enumeration.implementations.len(), 10);
        assert!(enumeration
            .implementations
            .iter()
            .any(|i| i.cost_estimate.lower == 1.0));
    }

    #[test]
    fn test_random_pruning_is_deterministic() {
        let graph = PlanGraph::new();
        let build = || PlanEnumeration {
            scope: Default::default(),
            implementations: (0..50).map(|i| implementation(i as f64, i as f64 + 1.0)).collect(),
        };
        let mut a = build();
        let mut b = build();
        RandomPruning { cap: 5, seed: 13 }.prune(&graph, &mut a);
        RandomPruning { cap: 5, seed: 13 }.prune(&graph, &mut b);
        let costs = |e: &PlanEnumeration| {
            e.implementations
                .iter()
                .map(|i| i.cost_estimate.lower as i64)
                .collect::<Vec<_>>()
        };
        assert_eq!(costs(&a), costs(&b));
    }
}
