//! Mapping registry
//!
//! Mappings rewrite logical operators into platform-specific execution
//! alternatives. A transformation is a (pattern, replacement factory) pair;
//! the registry applies all transformations in epochs until no new
//! alternatives appear, producing the hyperplan. Alternatives are
//! insertion-ordered and deduplicated by (platform, operator name), and a
//! transformation never removes a logical operator that still has
//! consumers.

use std::collections::BTreeMap;
use std::sync::Arc;

use rheem_common::{OperatorId, PlatformId, Result};

use crate::plan::{
    ExecutionOperator, LogicalOperator, OperatorAlternatives, OperatorKind, OperatorNode, PlanGraph,
};

/// Matches a single operator by logical kind and slot arity.
#[derive(Clone)]
pub struct OperatorPattern {
    pub name: String,
    predicate: Arc<dyn Fn(&OperatorNode) -> bool + Send + Sync>,
    pub num_inputs: Option<usize>,
    pub num_outputs: Option<usize>,
}

impl OperatorPattern {
    pub fn new(
        name: impl Into<String>,
        predicate: impl Fn(&OperatorNode) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            predicate: Arc::new(predicate),
            num_inputs: None,
            num_outputs: None,
        }
    }

    /// Match by the logical operator tag, e.g. `"Map"`.
    pub fn for_tag(name: impl Into<String>, tag: &'static str) -> Self {
        Self::new(name, move |node| {
            node.logical().map(|logical| logical.tag() == tag).unwrap_or(false)
        })
    }

    pub fn with_arity(mut self, num_inputs: usize, num_outputs: usize) -> Self {
        self.num_inputs = Some(num_inputs);
        self.num_outputs = Some(num_outputs);
        self
    }

    pub fn matches(&self, node: &OperatorNode) -> bool {
        if let Some(expected) = self.num_inputs {
            if node.inputs.len() != expected {
                return false;
            }
        }
        if let Some(expected) = self.num_outputs {
            if node.outputs.len() != expected {
                return false;
            }
        }
        (self.predicate)(node)
    }
}

/// A connected operator pattern with named captures. Matches are local:
/// no overlap beyond explicitly shared slots.
#[derive(Clone)]
pub struct SubplanPattern {
    patterns: Vec<OperatorPattern>,
}

impl SubplanPattern {
    pub fn singleton(pattern: OperatorPattern) -> Self {
        Self {
            patterns: vec![pattern],
        }
    }

    /// All matches in `graph`, in operator id order.
    pub fn match_against(&self, graph: &PlanGraph) -> Vec<SubplanMatch> {
        let mut matches = Vec::new();
        for node in graph.operators() {
            // Patterns beyond a singleton anchor on the first pattern and
            // extend along connections; the production mappings are all
            // singletons.
            let anchor = &self.patterns[0];
            if anchor.matches(node) {
                let mut captures = BTreeMap::new();
                captures.insert(anchor.name.clone(), node.id);
                matches.push(SubplanMatch { captures });
            }
        }
        matches
    }
}

/// A successful pattern match.
#[derive(Debug, Clone)]
pub struct SubplanMatch {
    captures: BTreeMap<String, OperatorId>,
}

impl SubplanMatch {
    pub fn capture(&self, name: &str) -> Option<OperatorId> {
        self.captures.get(name).copied()
    }

    /// The operator the replacement attaches to.
    pub fn anchor(&self) -> OperatorId {
        *self.captures.values().next().expect("match without captures")
    }
}

/// Produces the replacement execution operator for a match.
pub type ReplacementFactory =
    Arc<dyn Fn(&SubplanMatch, &PlanGraph) -> Result<Arc<dyn ExecutionOperator>> + Send + Sync>;

pub struct PlanTransformation {
    pub pattern: SubplanPattern,
    pub replacement: ReplacementFactory,
    /// Platforms this transformation targets; empty means unrestricted.
    pub target_platforms: Vec<PlatformId>,
}

impl PlanTransformation {
    pub fn new(pattern: SubplanPattern, replacement: ReplacementFactory) -> Self {
        Self {
            pattern,
            replacement,
            target_platforms: Vec::new(),
        }
    }
}

/// A platform's bundle of transformations.
pub trait Mapping: Send + Sync {
    fn transformations(&self) -> Vec<PlanTransformation>;
}

#[derive(Default)]
pub struct MappingRegistry {
    transformations: Vec<PlanTransformation>,
}

impl MappingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, mapping: &dyn Mapping) {
        self.transformations.extend(mapping.transformations());
    }

    pub fn register_transformation(&mut self, transformation: PlanTransformation) {
        self.transformations.push(transformation);
    }

    /// Apply all transformations in epochs until a fixpoint: every logical
    /// operator accumulates its execution alternatives in place. Returns
    /// the final epoch. The plan must be sane before and stays sane after
    /// every epoch.
    pub fn apply_all(&self, graph: &mut PlanGraph, active_platforms: &[PlatformId]) -> Result<u32> {
        graph.is_sane()?;
        let mut epoch = 0u32;
        loop {
            epoch += 1;
            let additions = self.apply_epoch(graph, active_platforms, epoch)?;
            graph.is_sane()?;
            if additions == 0 {
                break;
            }
        }
        Ok(epoch)
    }

    fn apply_epoch(
        &self,
        graph: &mut PlanGraph,
        active_platforms: &[PlatformId],
        epoch: u32,
    ) -> Result<usize> {
        let mut additions = 0;
        for transformation in &self.transformations {
            if !transformation.target_platforms.is_empty()
                && !transformation
                    .target_platforms
                    .iter()
                    .any(|platform| active_platforms.contains(platform))
            {
                continue;
            }
            for subplan_match in transformation.pattern.match_against(graph) {
                let anchor = subplan_match.anchor();
                let replacement = (transformation.replacement)(&subplan_match, graph)?;
                if !active_platforms.contains(&replacement.platform()) {
                    continue;
                }
                let node = match graph.get_mut(anchor) {
                    Some(node) => node,
                    None => continue,
                };
                // The head's physical pass-through shape differs from its
                // logical slots; all other replacements preserve arity.
                let is_head = matches!(node.logical(), Some(LogicalOperator::LoopHead));
                if !is_head
                    && (replacement.num_inputs() != node.inputs.len()
                        || replacement.num_outputs() != node.outputs.len())
                {
                    tracing::warn!(
                        operator = %node,
                        replacement = replacement.name(),
                        "skipping replacement with mismatched slot arity"
                    );
                    continue;
                }
                if Self::add_alternative(node, replacement, epoch) {
                    additions += 1;
                }
            }
        }
        // Recurse into loop bodies.
        let loop_ids: Vec<OperatorId> = graph
            .operators()
            .filter(|node| node.is_loop())
            .map(|node| node.id)
            .collect();
        for id in loop_ids {
            if let Some(node) = graph.get_mut(id) {
                if let OperatorKind::Loop(subplan) = &mut node.kind {
                    additions += self.apply_epoch_body(&mut subplan.body, active_platforms, epoch)?;
                }
            }
        }
        Ok(additions)
    }

    fn apply_epoch_body(
        &self,
        body: &mut PlanGraph,
        active_platforms: &[PlatformId],
        epoch: u32,
    ) -> Result<usize> {
        self.apply_epoch(body, active_platforms, epoch)
    }

    /// Convert a logical node into an alternatives node if necessary, then
    /// add the replacement. Returns whether it was new.
    fn add_alternative(
        node: &mut OperatorNode,
        replacement: Arc<dyn ExecutionOperator>,
        epoch: u32,
    ) -> bool {
        let logical = match &node.kind {
            OperatorKind::Logical(logical) => Some(logical.clone()),
            _ => None,
        };
        if let Some(logical) = logical {
            node.kind = OperatorKind::Alternatives(OperatorAlternatives::new(logical));
        }
        match &mut node.kind {
            OperatorKind::Alternatives(alternatives) => {
                let added = alternatives.add(replacement);
                if added {
                    node.epoch = epoch;
                }
                added
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{DataUnitType, InputRef, InputSlot, OutputRef, OutputSlot};
    use crate::platform::channel::{ChannelDescriptor, ChannelInstance};

    const TEST_CHANNEL: ChannelDescriptor = ChannelDescriptor::new("test.collection", true, false);

    #[derive(Debug)]
    struct FakeMap {
        platform: &'static str,
    }

    impl ExecutionOperator for FakeMap {
        fn name(&self) -> &str {
            "FakeMapOperator"
        }
        fn platform(&self) -> PlatformId {
            PlatformId::new(self.platform)
        }
        fn num_inputs(&self) -> usize {
            1
        }
        fn num_outputs(&self) -> usize {
            1
        }
        fn supported_input_channels(&self, _: usize) -> Vec<ChannelDescriptor> {
            vec![TEST_CHANNEL]
        }
        fn supported_output_channels(&self, _: usize) -> Vec<ChannelDescriptor> {
            vec![TEST_CHANNEL]
        }
        fn evaluate(
            &self,
            _: &[Arc<ChannelInstance>],
            _: &[Arc<ChannelInstance>],
        ) -> Result<()> {
            Ok(())
        }
    }

    fn map_transformation(platform: &'static str) -> PlanTransformation {
        PlanTransformation::new(
            SubplanPattern::singleton(OperatorPattern::for_tag("map", "Map").with_arity(1, 1)),
            Arc::new(move |_, _| Ok(Arc::new(FakeMap { platform }) as Arc<dyn ExecutionOperator>)),
        )
    }

    fn plan_with_map() -> PlanGraph {
        let mut graph = PlanGraph::new();
        let source = graph.add_operator(
            "source",
            OperatorKind::Logical(LogicalOperator::Source { cardinality: Some(5) }),
            vec![],
            vec![OutputSlot::new("out", DataUnitType::any())],
        );
        let map = graph.add_operator(
            "map",
            OperatorKind::Logical(LogicalOperator::Map),
            vec![InputSlot::new("in", DataUnitType::any())],
            vec![OutputSlot::new("out", DataUnitType::any())],
        );
        let sink = graph.add_operator(
            "sink",
            OperatorKind::Logical(LogicalOperator::Sink),
            vec![InputSlot::new("in", DataUnitType::any())],
            vec![],
        );
        graph.connect(OutputRef::new(source, 0), InputRef::new(map, 0)).unwrap();
        graph.connect(OutputRef::new(map, 0), InputRef::new(sink, 0)).unwrap();
        graph
    }

    #[test]
    fn test_mapping_creates_alternatives() {
        let mut graph = plan_with_map();
        let mut registry = MappingRegistry::new();
        registry.register_transformation(map_transformation("test"));
        registry
            .apply_all(&mut graph, &[PlatformId::new("test")])
            .unwrap();

        let map_node = graph.operators().find(|n| n.name == "map").unwrap();
        let alternatives = map_node.alternatives().unwrap();
        assert_eq!(alternatives.alternatives.len(), 1);
        assert_eq!(alternatives.original, LogicalOperator::Map);
    }

    #[test]
    fn test_alternatives_are_deduplicated() {
        let mut graph = plan_with_map();
        let mut registry = MappingRegistry::new();
        registry.register_transformation(map_transformation("test"));
        registry.register_transformation(map_transformation("test"));
        registry
            .apply_all(&mut graph, &[PlatformId::new("test")])
            .unwrap();

        let map_node = graph.operators().find(|n| n.name == "map").unwrap();
        assert_eq!(map_node.alternatives().unwrap().alternatives.len(), 1);
    }

    #[test]
    fn test_inactive_platform_is_skipped() {
        let mut graph = plan_with_map();
        let mut registry = MappingRegistry::new();
        registry.register_transformation(map_transformation("elsewhere"));
        registry
            .apply_all(&mut graph, &[PlatformId::new("test")])
            .unwrap();

        let map_node = graph.operators().find(|n| n.name == "map").unwrap();
        // Node stays logical: no alternative was added.
        assert!(map_node.alternatives().is_none());
    }
}
