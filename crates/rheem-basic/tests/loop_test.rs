//! Loop execution
//!
//! A `repeat` loop with n iterations owns n + 1 optimization contexts; the
//! unrolled execution runs the head once per iteration plus a final time
//! for the loop's exit state, each iteration opening its own stage.

use std::sync::Arc;

use rheem_basic::{register_basic, PlanBuilder, Value};
use rheem_common::Configuration;
use rheem_core::optimizer::channel_graph::ChannelConversionGraph;
use rheem_core::{Job, MappingRegistry, PlatformRegistry};

#[tokio::test]
async fn test_repeat_three_times() {
    let mut builder = PlanBuilder::new();
    let source = builder.read_collection((1..=4).map(Value::Int));
    let looped = builder.repeat(source, 3, |body, flow| {
        body.map(
            flow,
            Arc::new(|value: &Value| Value::Int(value.as_int().unwrap() * 2)),
        )
    });
    let collector = builder.collect(looped);

    let mut platforms = PlatformRegistry::new();
    let mut mappings = MappingRegistry::new();
    register_basic(&mut platforms, &mut mappings).unwrap();
    let summary = Job::new(
        builder.build(),
        Arc::new(Configuration::new()),
        Arc::new(platforms),
        Arc::new(mappings),
        Arc::new(ChannelConversionGraph::new()),
    )
    .execute()
    .await
    .unwrap();

    // Three doublings: [1,2,3,4] -> [8,16,24,32].
    assert_eq!(
        collector.lock().clone(),
        vec![Value::Int(8), Value::Int(16), Value::Int(24), Value::Int(32)]
    );
    // Source stage + one stage per iteration + final head + sink stage.
    assert!(summary.executed_stages >= 5, "stages: {}", summary.executed_stages);
}

#[tokio::test]
async fn test_zero_iteration_loop_runs_head_once() {
    let mut builder = PlanBuilder::new();
    let source = builder.read_collection((1..=4).map(Value::Int));
    let looped = builder.repeat(source, 0, |body, flow| {
        body.map(
            flow,
            Arc::new(|value: &Value| Value::Int(value.as_int().unwrap() * 2)),
        )
    });
    let collector = builder.collect(looped);

    let mut platforms = PlatformRegistry::new();
    let mut mappings = MappingRegistry::new();
    register_basic(&mut platforms, &mut mappings).unwrap();
    Job::new(
        builder.build(),
        Arc::new(Configuration::new()),
        Arc::new(platforms),
        Arc::new(mappings),
        Arc::new(ChannelConversionGraph::new()),
    )
    .execute()
    .await
    .unwrap();

    // The body never ran: the head passes the input through unchanged.
    assert_eq!(
        collector.lock().clone(),
        vec![Value::Int(1), Value::Int(2), Value::Int(3), Value::Int(4)]
    );
}
