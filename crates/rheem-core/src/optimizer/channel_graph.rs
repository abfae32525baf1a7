//! Channel conversion graph
//!
//! Bridges execution operators whose supported channels do not line up,
//! e.g. a relational result set feeding an in-process collection operator.
//! Descriptors are vertices, conversion operators are weighted edges; a
//! bounded best-first search finds the cheapest conversion tree from the
//! producer's emittable descriptors to every consumer's acceptable set.

use std::collections::BTreeMap;
use std::sync::Arc;

use rheem_common::{
    CardinalityEstimate, Configuration, PlatformId, ProbabilisticDoubleInterval, TimeEstimate,
};

use crate::optimizer::costs::{LoadProfileToTimeConverter, TimeToCostConverter};
use crate::plan::ExecutionOperator;
use crate::platform::channel::ChannelDescriptor;

/// A directed conversion edge: a unary execution operator that reads one
/// channel format and produces another.
#[derive(Clone)]
pub struct ChannelConversion {
    pub source: ChannelDescriptor,
    pub target: ChannelDescriptor,
    pub operator: Arc<dyn ExecutionOperator>,
}

impl std::fmt::Debug for ChannelConversion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {} via {}", self.source, self.target, self.operator.name())
    }
}

/// What one consumer input accepts.
#[derive(Debug, Clone)]
pub struct ConsumerRequest {
    pub accepted: Vec<ChannelDescriptor>,
    pub broadcast: bool,
}

/// One conversion along a junction, with its cost share.
#[derive(Clone)]
pub struct ConversionStep {
    pub operator: Arc<dyn ExecutionOperator>,
    pub from: ChannelDescriptor,
    pub to: ChannelDescriptor,
    pub time_estimate: TimeEstimate,
    pub cost_estimate: ProbabilisticDoubleInterval,
}

impl std::fmt::Debug for ConversionStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {} -> {}", self.operator.name(), self.from, self.to)
    }
}

/// Resolved bridge between a producer output and its consumers: the chosen
/// root descriptor, a deduplicated conversion tree, and per consumer the
/// descriptor it ends up reading.
#[derive(Clone)]
pub struct Junction {
    pub root: ChannelDescriptor,
    pub steps: Vec<ConversionStep>,
    /// Per consumer: the descriptor it consumes.
    pub consumer_descriptors: Vec<ChannelDescriptor>,
    pub time_estimate: TimeEstimate,
    pub cost_estimate: ProbabilisticDoubleInterval,
}

impl std::fmt::Debug for Junction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Junction")
            .field("root", &self.root)
            .field("steps", &self.steps)
            .field("consumers", &self.consumer_descriptors)
            .finish()
    }
}

impl Junction {
    fn trivial(root: ChannelDescriptor, num_consumers: usize) -> Self {
        Self {
            consumer_descriptors: vec![root.clone(); num_consumers],
            root,
            steps: Vec::new(),
            time_estimate: TimeEstimate::ZERO,
            cost_estimate: ProbabilisticDoubleInterval::zero(),
        }
    }
}

#[derive(Debug, Default)]
pub struct ChannelConversionGraph {
    conversions: Vec<ChannelConversion>,
}

impl ChannelConversionGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, conversion: ChannelConversion) {
        self.conversions.push(conversion);
    }

    pub fn register_all(&mut self, conversions: impl IntoIterator<Item = ChannelConversion>) {
        self.conversions.extend(conversions);
    }

    /// Find the cheapest conversion tree from any producer descriptor to
    /// all consumers, or `None` if some consumer is unreachable.
    ///
    /// Broadcast consumers only accept reusable descriptors. On cost ties
    /// the tree with the smallest fan-out (fewest conversions) wins, then
    /// the earlier producer descriptor, keeping the search deterministic.
    pub fn find_junction(
        &self,
        producer_descriptors: &[ChannelDescriptor],
        consumers: &[ConsumerRequest],
        cardinality: &CardinalityEstimate,
        configuration: &Configuration,
        active_platforms: &[PlatformId],
    ) -> Option<Junction> {
        if producer_descriptors.is_empty() {
            return None;
        }
        if consumers.is_empty() {
            return Some(Junction::trivial(producer_descriptors[0].clone(), 0));
        }

        let edges = self.active_edges(cardinality, configuration, active_platforms);

        let mut best: Option<(f64, usize, Junction)> = None;
        for root in producer_descriptors {
            let Some(junction) = self.solve_for_root(root, consumers, &edges) else {
                continue;
            };
            let total = junction.cost_estimate.expectation();
            let fan_out = junction.steps.len();
            let better = match &best {
                None => true,
                Some((best_total, best_fan_out, _)) => {
                    total < *best_total || (total == *best_total && fan_out < *best_fan_out)
                }
            };
            if better {
                best = Some((total, fan_out, junction));
            }
        }
        best.map(|(_, _, junction)| junction)
    }

    /// Pre-cost the usable conversion edges.
    fn active_edges(
        &self,
        cardinality: &CardinalityEstimate,
        configuration: &Configuration,
        active_platforms: &[PlatformId],
    ) -> Vec<CostedEdge> {
        self.conversions
            .iter()
            .filter(|conversion| active_platforms.contains(&conversion.operator.platform()))
            .map(|conversion| {
                let estimator = crate::optimizer::costs::resolve_load_estimator(
                    conversion.operator.load_profile_key().as_deref(),
                    conversion.operator.base_load_estimator(),
                    configuration,
                    &Default::default(),
                )
                .unwrap_or_else(|error| {
                    tracing::warn!(
                        conversion = conversion.operator.name(),
                        %error,
                        "bad conversion load spec, assuming zero load"
                    );
                    crate::optimizer::costs::LoadProfileEstimator {
                        cpu: None,
                        ram: None,
                        disk: None,
                        net: None,
                        overhead_millis: 0,
                        confidence: 0.5,
                    }
                });
                let profile =
                    estimator.estimate(&[*cardinality], &[*cardinality], &|_| None);
                let platform = conversion.operator.platform();
                let time = LoadProfileToTimeConverter::from_configuration(&platform, configuration)
                    .convert(&profile);
                let cost = TimeToCostConverter::from_configuration(&platform, configuration)
                    .convert_without_fix_costs(&time);
                CostedEdge {
                    conversion: conversion.clone(),
                    time,
                    cost,
                }
            })
            .collect()
    }

    /// Dijkstra from one root; then assemble the per-consumer paths into a
    /// shared-prefix tree and validate reusability.
    fn solve_for_root(
        &self,
        root: &ChannelDescriptor,
        consumers: &[ConsumerRequest],
        edges: &[CostedEdge],
    ) -> Option<Junction> {
        let mut distance: BTreeMap<ChannelDescriptor, f64> = BTreeMap::new();
        let mut previous: BTreeMap<ChannelDescriptor, usize> = BTreeMap::new();
        distance.insert(root.clone(), 0.0);
        let mut settled: BTreeMap<ChannelDescriptor, bool> = BTreeMap::new();

        loop {
            let next = distance
                .iter()
                .filter(|(descriptor, _)| !settled.get(*descriptor).copied().unwrap_or(false))
                .min_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
                .map(|(descriptor, cost)| (descriptor.clone(), *cost));
            let Some((descriptor, cost)) = next else { break };
            settled.insert(descriptor.clone(), true);
            for (index, edge) in edges.iter().enumerate() {
                if edge.conversion.source != descriptor {
                    continue;
                }
                let tentative = cost + edge.cost.expectation();
                let target = &edge.conversion.target;
                if tentative < distance.get(target).copied().unwrap_or(f64::INFINITY) {
                    distance.insert(target.clone(), tentative);
                    previous.insert(target.clone(), index);
                }
            }
        }

        // Per consumer: cheapest accepted descriptor.
        let mut consumer_descriptors = Vec::with_capacity(consumers.len());
        for consumer in consumers {
            let mut choice: Option<(f64, &ChannelDescriptor)> = None;
            for accepted in &consumer.accepted {
                if consumer.broadcast && !accepted.reusable {
                    continue;
                }
                if let Some(cost) = distance.get(accepted) {
                    let better = match choice {
                        None => true,
                        Some((best_cost, _)) => *cost < best_cost,
                    };
                    if better {
                        choice = Some((*cost, accepted));
                    }
                }
            }
            consumer_descriptors.push(choice?.1.clone());
        }

        // Union of the tree edges along all chosen paths.
        let mut used_edges: Vec<usize> = Vec::new();
        for descriptor in &consumer_descriptors {
            let mut cursor = descriptor.clone();
            while &cursor != root {
                let edge_index = *previous.get(&cursor)?;
                if !used_edges.contains(&edge_index) {
                    used_edges.push(edge_index);
                }
                cursor = edges[edge_index].conversion.source.clone();
            }
        }
        // Application order: sources before targets.
        used_edges.sort_by_key(|index| {
            let mut depth = 0;
            let mut cursor = edges[*index].conversion.source.clone();
            while &cursor != root {
                depth += 1;
                match previous.get(&cursor) {
                    Some(edge_index) => cursor = edges[*edge_index].conversion.source.clone(),
                    None => break,
                }
            }
            depth
        });

        // A non-reusable descriptor can only feed one reader.
        let mut readers: BTreeMap<ChannelDescriptor, usize> = BTreeMap::new();
        for index in &used_edges {
            *readers.entry(edges[*index].conversion.source.clone()).or_insert(0) += 1;
        }
        for descriptor in &consumer_descriptors {
            *readers.entry(descriptor.clone()).or_insert(0) += 1;
        }
        for (descriptor, count) in &readers {
            if !descriptor.reusable && *count > 1 {
                return None;
            }
        }

        let mut time_estimate = TimeEstimate::ZERO;
        let mut cost_estimate = ProbabilisticDoubleInterval::zero();
        let steps: Vec<ConversionStep> = used_edges
            .iter()
            .map(|index| {
                let edge = &edges[*index];
                time_estimate = time_estimate.plus(&edge.time);
                cost_estimate = cost_estimate.plus(&edge.cost);
                ConversionStep {
                    operator: Arc::clone(&edge.conversion.operator),
                    from: edge.conversion.source.clone(),
                    to: edge.conversion.target.clone(),
                    time_estimate: edge.time,
                    cost_estimate: edge.cost,
                }
            })
            .collect();

        Some(Junction {
            root: root.clone(),
            steps,
            consumer_descriptors,
            time_estimate,
            cost_estimate,
        })
    }
}

struct CostedEdge {
    conversion: ChannelConversion,
    time: TimeEstimate,
    cost: ProbabilisticDoubleInterval,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::costs::{LoadProfileEstimator, ResourceEstimator};
    use crate::platform::channel::ChannelInstance;
    use rheem_common::Result;

    const COLLECTION: ChannelDescriptor = ChannelDescriptor::new("test.collection", true, false);
    const STREAM: ChannelDescriptor = ChannelDescriptor::new("test.stream", false, true);
    const TABLE: ChannelDescriptor = ChannelDescriptor::new("db.table", false, false);

    struct TestConversion {
        name: &'static str,
        cost_per_element: u64,
    }

    impl ExecutionOperator for TestConversion {
        fn name(&self) -> &str {
            self.name
        }
        fn platform(&self) -> PlatformId {
            PlatformId::new("test")
        }
        fn num_inputs(&self) -> usize {
            1
        }
        fn num_outputs(&self) -> usize {
            1
        }
        fn supported_input_channels(&self, _: usize) -> Vec<ChannelDescriptor> {
            vec![]
        }
        fn supported_output_channels(&self, _: usize) -> Vec<ChannelDescriptor> {
            vec![]
        }
        fn base_load_estimator(&self) -> Option<LoadProfileEstimator> {
            Some(LoadProfileEstimator::cpu_only(ResourceEstimator::linear(
                self.cost_per_element,
            )))
        }
        fn evaluate(
            &self,
            _: &[Arc<ChannelInstance>],
            _: &[Arc<ChannelInstance>],
        ) -> Result<()> {
            Ok(())
        }
        fn is_conversion(&self) -> bool {
            true
        }
    }

    fn conversion(
        from: ChannelDescriptor,
        to: ChannelDescriptor,
        name: &'static str,
        cost: u64,
    ) -> ChannelConversion {
        ChannelConversion {
            source: from,
            target: to,
            operator: Arc::new(TestConversion {
                name,
                cost_per_element: cost,
            }),
        }
    }

    fn graph() -> ChannelConversionGraph {
        let mut graph = ChannelConversionGraph::new();
        graph.register(conversion(TABLE, STREAM, "table-to-stream", 10));
        graph.register(conversion(STREAM, COLLECTION, "stream-to-collection", 5));
        graph.register(conversion(TABLE, COLLECTION, "table-to-collection", 100));
        graph
    }

    fn active() -> Vec<PlatformId> {
        vec![PlatformId::new("test")]
    }

    #[test]
    fn test_direct_match_needs_no_conversion() {
        let graph = graph();
        let junction = graph
            .find_junction(
                &[COLLECTION],
                &[ConsumerRequest {
                    accepted: vec![COLLECTION],
                    broadcast: false,
                }],
                &CardinalityEstimate::exact(100),
                &Configuration::new(),
                &active(),
            )
            .unwrap();
        assert!(junction.steps.is_empty());
        assert_eq!(junction.consumer_descriptors[0], COLLECTION);
    }

    #[test]
    fn test_cheapest_path_wins() {
        // table -> stream -> collection (15/unit) beats direct (100/unit).
        let graph = graph();
        let junction = graph
            .find_junction(
                &[TABLE],
                &[ConsumerRequest {
                    accepted: vec![COLLECTION],
                    broadcast: false,
                }],
                &CardinalityEstimate::exact(1000),
                &Configuration::new(),
                &active(),
            )
            .unwrap();
        assert_eq!(junction.steps.len(), 2);
        assert_eq!(junction.steps[0].operator.name(), "table-to-stream");
        assert_eq!(junction.steps[1].operator.name(), "stream-to-collection");
    }

    #[test]
    fn test_broadcast_requires_reusable() {
        let graph = graph();
        let junction = graph
            .find_junction(
                &[TABLE],
                &[ConsumerRequest {
                    // Would accept the stream, but broadcast restricts to
                    // reusable descriptors and the stream is not.
                    accepted: vec![STREAM, COLLECTION],
                    broadcast: true,
                }],
                &CardinalityEstimate::exact(10),
                &Configuration::new(),
                &active(),
            )
            .unwrap();
        assert_eq!(junction.consumer_descriptors[0], COLLECTION);
    }

    #[test]
    fn test_no_path_is_none() {
        let graph = ChannelConversionGraph::new();
        let junction = graph.find_junction(
            &[TABLE],
            &[ConsumerRequest {
                accepted: vec![COLLECTION],
                broadcast: false,
            }],
            &CardinalityEstimate::exact(10),
            &Configuration::new(),
            &active(),
        );
        assert!(junction.is_none());
    }

    #[test]
    fn test_shared_prefix_for_two_consumers() {
        let graph = graph();
        let junction = graph
            .find_junction(
                &[TABLE],
                &[
                    ConsumerRequest {
                        accepted: vec![COLLECTION],
                        broadcast: false,
                    },
                    ConsumerRequest {
                        accepted: vec![COLLECTION],
                        broadcast: false,
                    },
                ],
                &CardinalityEstimate::exact(100),
                &Configuration::new(),
                &active(),
            )
            .unwrap();
        // The conversion chain is shared: still only two steps, and the
        // reusable collection feeds both consumers.
        assert_eq!(junction.steps.len(), 2);
        assert_eq!(junction.consumer_descriptors.len(), 2);
    }
}
