//! Single-platform pipeline execution

use std::sync::Arc;

use rheem_basic::{register_basic, PlanBuilder, Value};
use rheem_common::{Configuration, RheemError};
use rheem_core::optimizer::channel_graph::ChannelConversionGraph;
use rheem_core::{ExecutionLog, Job, JobSummary, MappingRegistry, PlanGraph, PlatformRegistry};

async fn run_basic(graph: PlanGraph, configuration: Configuration) -> rheem_common::Result<JobSummary> {
    let mut platforms = PlatformRegistry::new();
    let mut mappings = MappingRegistry::new();
    register_basic(&mut platforms, &mut mappings).unwrap();
    Job::new(
        graph,
        Arc::new(configuration),
        Arc::new(platforms),
        Arc::new(mappings),
        Arc::new(ChannelConversionGraph::new()),
    )
    .execute()
    .await
}

#[tokio::test]
async fn test_source_map_collect_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("executions.json");
    let mut configuration = Configuration::new();
    configuration.set("rheem.core.log.enabled", "true");
    configuration.set("rheem.core.log.executions", log_path.display().to_string());

    let mut builder = PlanBuilder::new();
    let source = builder.read_collection((1..=10).map(Value::Int));
    let mapped = builder.map(
        source,
        Arc::new(|value: &Value| Value::Int(value.as_int().unwrap() + 1)),
    );
    let collector = builder.collect(mapped);

    let summary = run_basic(builder.build(), configuration).await.unwrap();

    let results = collector.lock().clone();
    assert_eq!(results, (2..=11).map(Value::Int).collect::<Vec<_>>());

    // One contiguous basic stage, no re-optimization.
    assert_eq!(summary.executed_stages, 1);
    assert_eq!(summary.reoptimizations, 0);
    assert_eq!(summary.platforms.len(), 1);

    // The log holds the partial execution with the operator entries and
    // the (exact) map output cardinality of 10.
    let records = ExecutionLog::read(&log_path).unwrap();
    assert_eq!(records.len(), 1);
    let names: Vec<&str> = records[0]
        .operator_executions
        .iter()
        .map(|execution| execution.operator_name.as_str())
        .collect();
    assert!(names.contains(&"BasicCollectionSource"));
    assert!(names.contains(&"BasicMapOperator"));
    assert!(names.contains(&"BasicCallbackSink"));

    let map_execution = records[0]
        .operator_executions
        .iter()
        .find(|execution| execution.operator_name == "BasicMapOperator")
        .unwrap();
    let output = map_execution.output_cardinalities[0].unwrap();
    assert_eq!(output.lower, 10);
    assert_eq!(output.upper, 10);
}

#[tokio::test]
async fn test_filter_reduce_pipeline() {
    let mut builder = PlanBuilder::new();
    let source = builder.read_collection((1..=100).map(Value::Int));
    let filtered = builder.filter(
        source,
        0.5,
        Arc::new(|value: &Value| value.as_int().unwrap() % 2 == 0),
    );
    let summed = builder.reduce(
        filtered,
        Arc::new(|a: &Value, b: &Value| Value::Int(a.as_int().unwrap() + b.as_int().unwrap())),
    );
    let collector = builder.collect(summed);

    run_basic(builder.build(), Configuration::new()).await.unwrap();
    assert_eq!(collector.lock().clone(), vec![Value::Int(2550)]);
}

#[tokio::test]
async fn test_skip_execution_estimates_only() {
    let mut configuration = Configuration::new();
    configuration.set("rheem.core.debug.skipexecution", "true");

    let mut builder = PlanBuilder::new();
    let source = builder.read_collection((1..=10).map(Value::Int));
    let collector = builder.collect(source);

    let summary = run_basic(builder.build(), configuration).await.unwrap();
    assert_eq!(summary.executed_stages, 0);
    assert!(summary.estimated_time.upper_millis >= 1);
    assert!(collector.lock().is_empty());
}

#[tokio::test]
async fn test_empty_plan_is_rejected() {
    let result = run_basic(PlanGraph::new(), Configuration::new()).await;
    assert!(matches!(result, Err(RheemError::PlanSanity(_))));
}

#[tokio::test]
async fn test_reduce_by_groups() {
    let mut builder = PlanBuilder::new();
    let source = builder.read_collection((1..=10).map(Value::Int));
    let grouped = builder.reduce_by(
        source,
        0.2,
        Arc::new(|value: &Value| Value::Int(value.as_int().unwrap() % 2)),
        Arc::new(|a: &Value, b: &Value| Value::Int(a.as_int().unwrap() + b.as_int().unwrap())),
    );
    let collector = builder.collect(grouped);

    run_basic(builder.build(), Configuration::new()).await.unwrap();
    // Insertion order: odd values appear first (1 comes before 2).
    assert_eq!(
        collector.lock().clone(),
        vec![Value::Int(25), Value::Int(30)]
    );
}
