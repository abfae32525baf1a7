//! Mappings of the basic platform
//!
//! One transformation per logical operator, each reading the operator's
//! UDF payload and producing the corresponding basic execution operator.

use std::sync::Arc;

use rheem_core::mapping::{
    MappingRegistry, OperatorPattern, PlanTransformation, SubplanPattern,
};
use rheem_core::plan::ExecutionOperator;
use rheem_core::platform::PlatformRegistry;
use rheem_common::{Result, RheemError};

use crate::data::{
    FilterDescriptor, FlatMapDescriptor, JoinDescriptor, MapDescriptor, ReduceByDescriptor,
    ReduceDescriptor, SampleDescriptor, SinkDescriptor, SourceDescriptor,
};
use crate::platform::{
    BasicCallbackSink, BasicCollectionSource, BasicCount, BasicDistinct, BasicFilter,
    BasicFlatMap, BasicJoin, BasicMap, BasicPlatform, BasicReduce, BasicReduceBy, BasicRepeatHead,
    BasicSample, BasicSort, BasicUnion,
};

fn payload_error(tag: &str) -> RheemError {
    RheemError::Internal(format!("logical {tag} operator lacks its descriptor payload"))
}

/// Pattern over a logical tag whose node also carries the expected UDF
/// payload; keeps this platform's mappings away from sources and sinks
/// owned by other backends.
fn tag_with_payload<T: Send + Sync + 'static>(name: &str, tag: &'static str) -> OperatorPattern {
    OperatorPattern::new(name, move |node| {
        node.logical().map(|logical| logical.tag() == tag).unwrap_or(false)
            && node.payload_as::<T>().is_some()
    })
}

fn transformations() -> Vec<PlanTransformation> {
    let mut transformations = Vec::new();

    transformations.push(PlanTransformation::new(
        SubplanPattern::singleton(tag_with_payload::<SourceDescriptor>("source", "Source")),
        Arc::new(|subplan_match, graph| {
            let node = graph.require(subplan_match.anchor())?;
            let descriptor = node
                .payload_as::<SourceDescriptor>()
                .ok_or_else(|| payload_error("Source"))?;
            Ok(Arc::new(BasicCollectionSource { descriptor }) as Arc<dyn ExecutionOperator>)
        }),
    ));

    transformations.push(PlanTransformation::new(
        SubplanPattern::singleton(tag_with_payload::<MapDescriptor>("map", "Map").with_arity(1, 1)),
        Arc::new(|subplan_match, graph| {
            let node = graph.require(subplan_match.anchor())?;
            let descriptor = node
                .payload_as::<MapDescriptor>()
                .ok_or_else(|| payload_error("Map"))?;
            Ok(Arc::new(BasicMap { descriptor }) as Arc<dyn ExecutionOperator>)
        }),
    ));

    transformations.push(PlanTransformation::new(
        SubplanPattern::singleton(tag_with_payload::<FilterDescriptor>("filter", "Filter").with_arity(1, 1)),
        Arc::new(|subplan_match, graph| {
            let node = graph.require(subplan_match.anchor())?;
            let descriptor = node
                .payload_as::<FilterDescriptor>()
                .ok_or_else(|| payload_error("Filter"))?;
            Ok(Arc::new(BasicFilter { descriptor }) as Arc<dyn ExecutionOperator>)
        }),
    ));

    transformations.push(PlanTransformation::new(
        SubplanPattern::singleton(tag_with_payload::<FlatMapDescriptor>("flat_map", "FlatMap").with_arity(1, 1)),
        Arc::new(|subplan_match, graph| {
            let node = graph.require(subplan_match.anchor())?;
            let descriptor = node
                .payload_as::<FlatMapDescriptor>()
                .ok_or_else(|| payload_error("FlatMap"))?;
            Ok(Arc::new(BasicFlatMap { descriptor }) as Arc<dyn ExecutionOperator>)
        }),
    ));

    transformations.push(PlanTransformation::new(
        SubplanPattern::singleton(tag_with_payload::<ReduceDescriptor>("reduce", "Reduce").with_arity(1, 1)),
        Arc::new(|subplan_match, graph| {
            let node = graph.require(subplan_match.anchor())?;
            let descriptor = node
                .payload_as::<ReduceDescriptor>()
                .ok_or_else(|| payload_error("Reduce"))?;
            Ok(Arc::new(BasicReduce { descriptor }) as Arc<dyn ExecutionOperator>)
        }),
    ));

    transformations.push(PlanTransformation::new(
        SubplanPattern::singleton(tag_with_payload::<ReduceByDescriptor>("reduce_by", "ReduceBy").with_arity(1, 1)),
        Arc::new(|subplan_match, graph| {
            let node = graph.require(subplan_match.anchor())?;
            let descriptor = node
                .payload_as::<ReduceByDescriptor>()
                .ok_or_else(|| payload_error("ReduceBy"))?;
            Ok(Arc::new(BasicReduceBy { descriptor }) as Arc<dyn ExecutionOperator>)
        }),
    ));

    transformations.push(PlanTransformation::new(
        SubplanPattern::singleton(tag_with_payload::<JoinDescriptor>("join", "Join").with_arity(2, 1)),
        Arc::new(|subplan_match, graph| {
            let node = graph.require(subplan_match.anchor())?;
            let descriptor = node
                .payload_as::<JoinDescriptor>()
                .ok_or_else(|| payload_error("Join"))?;
            Ok(Arc::new(BasicJoin { descriptor }) as Arc<dyn ExecutionOperator>)
        }),
    ));

    transformations.push(PlanTransformation::new(
        SubplanPattern::singleton(OperatorPattern::for_tag("union", "Union").with_arity(2, 1)),
        Arc::new(|_, _| Ok(Arc::new(BasicUnion) as Arc<dyn ExecutionOperator>)),
    ));

    transformations.push(PlanTransformation::new(
        SubplanPattern::singleton(OperatorPattern::for_tag("distinct", "Distinct").with_arity(1, 1)),
        Arc::new(|_, _| Ok(Arc::new(BasicDistinct) as Arc<dyn ExecutionOperator>)),
    ));

    transformations.push(PlanTransformation::new(
        SubplanPattern::singleton(OperatorPattern::for_tag("sort", "Sort").with_arity(1, 1)),
        Arc::new(|_, _| Ok(Arc::new(BasicSort) as Arc<dyn ExecutionOperator>)),
    ));

    transformations.push(PlanTransformation::new(
        SubplanPattern::singleton(OperatorPattern::for_tag("count", "Count").with_arity(1, 1)),
        Arc::new(|_, _| Ok(Arc::new(BasicCount) as Arc<dyn ExecutionOperator>)),
    ));

    transformations.push(PlanTransformation::new(
        SubplanPattern::singleton(tag_with_payload::<SampleDescriptor>("sample", "Sample").with_arity(1, 1)),
        Arc::new(|subplan_match, graph| {
            let node = graph.require(subplan_match.anchor())?;
            let descriptor = node
                .payload_as::<SampleDescriptor>()
                .ok_or_else(|| payload_error("Sample"))?;
            Ok(Arc::new(BasicSample { descriptor }) as Arc<dyn ExecutionOperator>)
        }),
    ));

    transformations.push(PlanTransformation::new(
        SubplanPattern::singleton(tag_with_payload::<SinkDescriptor>("sink", "Sink")),
        Arc::new(|subplan_match, graph| {
            let node = graph.require(subplan_match.anchor())?;
            let descriptor = node
                .payload_as::<SinkDescriptor>()
                .ok_or_else(|| payload_error("Sink"))?;
            Ok(Arc::new(BasicCallbackSink { descriptor }) as Arc<dyn ExecutionOperator>)
        }),
    ));

    transformations.push(PlanTransformation::new(
        SubplanPattern::singleton(OperatorPattern::for_tag("loop_head", "LoopHead")),
        Arc::new(|_, _| Ok(Arc::new(BasicRepeatHead) as Arc<dyn ExecutionOperator>)),
    ));

    transformations
}

/// Register the basic platform and all its mappings.
pub fn register_basic(platforms: &mut PlatformRegistry, mappings: &mut MappingRegistry) -> Result<()> {
    platforms.register(Arc::new(BasicPlatform));
    for transformation in transformations() {
        mappings.register_transformation(transformation);
    }
    Ok(())
}
