//! Cross-platform planning and re-optimization
//!
//! A mock relational platform ("db") owns a table source plus filter and
//! sum operators over its own table channel; a conversion operator loads a
//! table into a basic collection. The enumerator weighs keeping work on
//! the database against bridging to the in-process engine.

use std::sync::Arc;

use async_trait::async_trait;
use rheem_basic::data::{Dataset, FilterDescriptor, ReduceDescriptor};
use rheem_basic::{register_basic, PlanBuilder, Value, COLLECTION_CHANNEL};
use rheem_common::{Configuration, PlatformId, Result, RheemError};
use rheem_core::mapping::{MappingRegistry, OperatorPattern, PlanTransformation, SubplanPattern};
use rheem_core::optimizer::channel_graph::{ChannelConversion, ChannelConversionGraph};
use rheem_core::optimizer::costs::{LoadProfileEstimator, ResourceEstimator};
use rheem_core::plan::ExecutionOperator;
use rheem_core::platform::channel::{ChannelDescriptor, ChannelInstance};
use rheem_core::platform::execution::ExecutionTask;
use rheem_core::platform::state::PartialExecution;
use rheem_core::{ExecutionLog, Executor, Job, JobSummary, Platform, PlanGraph, PlatformRegistry};

const DB_TABLE: ChannelDescriptor = ChannelDescriptor::new("db.table", true, false);
const DB_PLATFORM: &str = "db";

/// Payload marking a source as a database table.
struct DbTableDescriptor {
    values: Dataset,
}

struct DbPlatform;

impl Platform for DbPlatform {
    fn id(&self) -> PlatformId {
        PlatformId::new(DB_PLATFORM)
    }
    fn display_name(&self) -> &str {
        "Mock relational engine"
    }
    fn create_executor(&self) -> Arc<dyn Executor> {
        Arc::new(DbExecutor)
    }
}

struct DbExecutor;

#[async_trait]
impl Executor for DbExecutor {
    async fn execute(
        &self,
        task: Arc<ExecutionTask>,
        inputs: Vec<Arc<ChannelInstance>>,
        outputs: Vec<Arc<ChannelInstance>>,
    ) -> Result<Option<PartialExecution>> {
        task.operator.evaluate(&inputs, &outputs)?;
        for output in &outputs {
            if output.is_marked_for_instrumentation() {
                if let Some(dataset) = output.payload_as::<Dataset>() {
                    output.set_measured_cardinality(dataset.len() as u64);
                }
            }
        }
        Ok(None)
    }
}

fn table(inputs: &[Arc<ChannelInstance>], index: usize) -> Result<Arc<Dataset>> {
    inputs
        .get(index)
        .and_then(|instance| instance.payload_as::<Dataset>())
        .ok_or_else(|| RheemError::Internal(format!("missing table payload at input {index}")))
}

struct DbTableSource {
    descriptor: Arc<DbTableDescriptor>,
}

impl ExecutionOperator for DbTableSource {
    fn name(&self) -> &str {
        "DbTableSource"
    }
    fn platform(&self) -> PlatformId {
        PlatformId::new(DB_PLATFORM)
    }
    fn num_inputs(&self) -> usize {
        0
    }
    fn num_outputs(&self) -> usize {
        1
    }
    fn supported_input_channels(&self, _: usize) -> Vec<ChannelDescriptor> {
        vec![DB_TABLE]
    }
    fn supported_output_channels(&self, _: usize) -> Vec<ChannelDescriptor> {
        vec![DB_TABLE]
    }
    fn load_profile_key(&self) -> Option<String> {
        Some("rheem.db.source.load".to_string())
    }
    fn base_load_estimator(&self) -> Option<LoadProfileEstimator> {
        Some(LoadProfileEstimator::cpu_only(ResourceEstimator::Closure(
            Arc::new(|_, outputs| outputs.iter().sum::<u64>() * 50),
        )))
    }
    fn evaluate(
        &self,
        _inputs: &[Arc<ChannelInstance>],
        outputs: &[Arc<ChannelInstance>],
    ) -> Result<()> {
        outputs[0].set_payload(Arc::new(self.descriptor.values.clone()));
        Ok(())
    }
}

struct DbFilter {
    descriptor: Arc<FilterDescriptor>,
}

impl ExecutionOperator for DbFilter {
    fn name(&self) -> &str {
        "DbFilterOperator"
    }
    fn platform(&self) -> PlatformId {
        PlatformId::new(DB_PLATFORM)
    }
    fn num_inputs(&self) -> usize {
        1
    }
    fn num_outputs(&self) -> usize {
        1
    }
    fn supported_input_channels(&self, _: usize) -> Vec<ChannelDescriptor> {
        vec![DB_TABLE]
    }
    fn supported_output_channels(&self, _: usize) -> Vec<ChannelDescriptor> {
        vec![DB_TABLE]
    }
    fn load_profile_key(&self) -> Option<String> {
        Some("rheem.db.filter.load".to_string())
    }
    fn base_load_estimator(&self) -> Option<LoadProfileEstimator> {
        Some(LoadProfileEstimator::cpu_only(ResourceEstimator::linear(10)))
    }
    fn evaluate(
        &self,
        inputs: &[Arc<ChannelInstance>],
        outputs: &[Arc<ChannelInstance>],
    ) -> Result<()> {
        let input = table(inputs, 0)?;
        let output: Dataset = input
            .iter()
            .filter(|value| (self.descriptor.predicate)(value))
            .cloned()
            .collect();
        outputs[0].set_payload(Arc::new(output));
        Ok(())
    }
}

struct DbSum {
    descriptor: Arc<ReduceDescriptor>,
}

impl ExecutionOperator for DbSum {
    fn name(&self) -> &str {
        "DbSumOperator"
    }
    fn platform(&self) -> PlatformId {
        PlatformId::new(DB_PLATFORM)
    }
    fn num_inputs(&self) -> usize {
        1
    }
    fn num_outputs(&self) -> usize {
        1
    }
    fn supported_input_channels(&self, _: usize) -> Vec<ChannelDescriptor> {
        vec![DB_TABLE]
    }
    fn supported_output_channels(&self, _: usize) -> Vec<ChannelDescriptor> {
        vec![DB_TABLE]
    }
    fn load_profile_key(&self) -> Option<String> {
        Some("rheem.db.reduce.load".to_string())
    }
    fn base_load_estimator(&self) -> Option<LoadProfileEstimator> {
        Some(LoadProfileEstimator::cpu_only(ResourceEstimator::linear(200)))
    }
    fn evaluate(
        &self,
        inputs: &[Arc<ChannelInstance>],
        outputs: &[Arc<ChannelInstance>],
    ) -> Result<()> {
        let input = table(inputs, 0)?;
        let mut iterator = input.iter();
        let output: Dataset = match iterator.next() {
            Some(first) => vec![iterator.fold(first.clone(), |accumulator, value| {
                (self.descriptor.function)(&accumulator, value)
            })],
            None => Vec::new(),
        };
        outputs[0].set_payload(Arc::new(output));
        Ok(())
    }
}

/// Loads a database table into an in-process collection.
struct DbToCollection;

impl ExecutionOperator for DbToCollection {
    fn name(&self) -> &str {
        "DbToCollectionOperator"
    }
    fn platform(&self) -> PlatformId {
        PlatformId::new("basic")
    }
    fn num_inputs(&self) -> usize {
        1
    }
    fn num_outputs(&self) -> usize {
        1
    }
    fn supported_input_channels(&self, _: usize) -> Vec<ChannelDescriptor> {
        vec![DB_TABLE]
    }
    fn supported_output_channels(&self, _: usize) -> Vec<ChannelDescriptor> {
        vec![COLLECTION_CHANNEL]
    }
    fn load_profile_key(&self) -> Option<String> {
        Some("rheem.basic.db-to-collection.load".to_string())
    }
    fn base_load_estimator(&self) -> Option<LoadProfileEstimator> {
        Some(LoadProfileEstimator::cpu_only(ResourceEstimator::linear(1000)))
    }
    fn evaluate(
        &self,
        inputs: &[Arc<ChannelInstance>],
        outputs: &[Arc<ChannelInstance>],
    ) -> Result<()> {
        let input = table(inputs, 0)?;
        outputs[0].set_payload(Arc::new(input.as_ref().clone()));
        Ok(())
    }
    fn is_conversion(&self) -> bool {
        true
    }
}

fn db_transformations() -> Vec<PlanTransformation> {
    let mut transformations = Vec::new();
    transformations.push(PlanTransformation::new(
        SubplanPattern::singleton(OperatorPattern::new("source", |node| {
            node.logical().map(|l| l.tag() == "Source").unwrap_or(false)
                && node.payload_as::<DbTableDescriptor>().is_some()
        })),
        Arc::new(|subplan_match, graph| {
            let node = graph.require(subplan_match.anchor())?;
            let descriptor = node
                .payload_as::<DbTableDescriptor>()
                .ok_or_else(|| RheemError::Internal("missing table payload".to_string()))?;
            Ok(Arc::new(DbTableSource { descriptor }) as Arc<dyn ExecutionOperator>)
        }),
    ));
    transformations.push(PlanTransformation::new(
        SubplanPattern::singleton(OperatorPattern::new("filter", |node| {
            node.logical().map(|l| l.tag() == "Filter").unwrap_or(false)
                && node.payload_as::<FilterDescriptor>().is_some()
        })),
        Arc::new(|subplan_match, graph| {
            let node = graph.require(subplan_match.anchor())?;
            let descriptor = node
                .payload_as::<FilterDescriptor>()
                .ok_or_else(|| RheemError::Internal("missing filter payload".to_string()))?;
            Ok(Arc::new(DbFilter { descriptor }) as Arc<dyn ExecutionOperator>)
        }),
    ));
    transformations.push(PlanTransformation::new(
        SubplanPattern::singleton(OperatorPattern::new("reduce", |node| {
            node.logical().map(|l| l.tag() == "Reduce").unwrap_or(false)
                && node.payload_as::<ReduceDescriptor>().is_some()
        })),
        Arc::new(|subplan_match, graph| {
            let node = graph.require(subplan_match.anchor())?;
            let descriptor = node
                .payload_as::<ReduceDescriptor>()
                .ok_or_else(|| RheemError::Internal("missing reduce payload".to_string()))?;
            Ok(Arc::new(DbSum { descriptor }) as Arc<dyn ExecutionOperator>)
        }),
    ));
    transformations
}

/// Source(db table) -> filter -> sum -> collect, with the given declared
/// filter selectivity and predicate threshold.
fn table_sum_plan(
    rows: i64,
    declared_selectivity: f64,
    keep_below: i64,
) -> (PlanGraph, Arc<parking_lot::Mutex<Dataset>>) {
    let mut builder = PlanBuilder::new();
    let source = builder.read_declared(
        "orders",
        rows as u64,
        Arc::new(DbTableDescriptor {
            values: (0..rows).map(Value::Int).collect(),
        }),
    );
    let filtered = builder.filter(
        source,
        declared_selectivity,
        Arc::new(move |value: &Value| value.as_int().unwrap() < keep_below),
    );
    let summed = builder.reduce(
        filtered,
        Arc::new(|a: &Value, b: &Value| Value::Int(a.as_int().unwrap() + b.as_int().unwrap())),
    );
    let collector = builder.collect(summed);
    (builder.build(), collector)
}

async fn run_cross_platform(
    graph: PlanGraph,
    configuration: Configuration,
    with_conversion: bool,
) -> rheem_common::Result<JobSummary> {
    let mut platforms = PlatformRegistry::new();
    let mut mappings = MappingRegistry::new();
    register_basic(&mut platforms, &mut mappings).unwrap();
    platforms.register(Arc::new(DbPlatform));
    for transformation in db_transformations() {
        mappings.register_transformation(transformation);
    }
    let mut conversions = ChannelConversionGraph::new();
    if with_conversion {
        conversions.register(ChannelConversion {
            source: DB_TABLE,
            target: COLLECTION_CHANNEL,
            operator: Arc::new(DbToCollection),
        });
    }
    Job::new(
        graph,
        Arc::new(configuration),
        Arc::new(platforms),
        Arc::new(mappings),
        Arc::new(conversions),
    )
    .execute()
    .await
}

#[tokio::test]
async fn test_filter_and_reduce_stay_on_the_database() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("executions.json");
    let mut configuration = Configuration::new();
    configuration.set("rheem.core.log.enabled", "true");
    configuration.set("rheem.core.log.executions", log_path.display().to_string());
    // Slow the clocks down so load differences dominate the per-task floor.
    configuration.set("rheem.basic.speed.cpu", "1000");
    configuration.set("rheem.db.speed.cpu", "1000");

    // Accurate selectivity estimate: 100 of 1000 rows survive.
    let (graph, collector) = table_sum_plan(1000, 0.1, 100);
    let summary = run_cross_platform(graph, configuration, true).await.unwrap();

    // sum(0..100) = 4950
    assert_eq!(collector.lock().clone(), vec![Value::Int(4950)]);
    assert_eq!(summary.reoptimizations, 0);

    // The cheap plan keeps filter and reduce on the database; only the
    // final single-row result crosses into the collection sink.
    let records = ExecutionLog::read(&log_path).unwrap();
    let names: Vec<String> = records
        .iter()
        .flat_map(|record| record.operator_executions.iter())
        .map(|execution| execution.operator_name.clone())
        .collect();
    assert!(names.contains(&"DbFilterOperator".to_string()), "{names:?}");
    assert!(names.contains(&"DbSumOperator".to_string()), "{names:?}");
    assert!(!names.contains(&"BasicFilterOperator".to_string()), "{names:?}");
    assert!(!names.contains(&"BasicReduceOperator".to_string()), "{names:?}");
}

#[tokio::test]
async fn test_cardinality_drift_triggers_reoptimization() {
    let mut configuration = Configuration::new();
    configuration.set("rheem.basic.speed.cpu", "1000");
    configuration.set("rheem.db.speed.cpu", "1000");
    // The relational engine aggregates poorly, so the first pick bridges
    // after the filter.
    configuration.set("rheem.db.reduce.load", r#"{"cpu": "200000 * in0"}"#);

    // Declared selectivity 0.9 is badly wrong: only 50 of 1000 survive.
    let (graph, collector) = table_sum_plan(1000, 0.9, 50);
    let summary = run_cross_platform(graph, configuration, true).await.unwrap();

    // sum(0..50) = 1225, despite the re-planned remainder.
    assert_eq!(collector.lock().clone(), vec![Value::Int(1225)]);
    assert!(summary.reoptimizations >= 1, "expected a drift breakpoint");
    assert!(summary.platforms.len() >= 2);
}

#[tokio::test]
async fn test_missing_conversion_path_is_no_viable_plan() {
    let (graph, collector) = table_sum_plan(100, 0.5, 50);
    let result = run_cross_platform(graph, Configuration::new(), false).await;
    assert!(matches!(result, Err(RheemError::NoViablePlan(_))), "{result:?}");
    // Nothing executed.
    assert!(collector.lock().is_empty());
}
