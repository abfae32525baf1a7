//! The basic platform
//!
//! An in-process backend over in-memory collections. One channel kind (the
//! reusable collection), one executor that evaluates operators inline and
//! measures output cardinalities on instrumented channels.

use std::sync::Arc;

use async_trait::async_trait;
use rheem_core::optimizer::costs::{LoadProfileEstimator, ResourceEstimator};
use rheem_core::plan::ExecutionOperator;
use rheem_core::platform::channel::{ChannelDescriptor, ChannelInstance};
use rheem_core::platform::execution::ExecutionTask;
use rheem_core::platform::state::PartialExecution;
use rheem_core::platform::{Executor, Platform};
use rheem_common::{PlatformId, Result, RheemError};

use crate::data::{
    Dataset, FilterDescriptor, FlatMapDescriptor, JoinDescriptor, MapDescriptor,
    ReduceByDescriptor, ReduceDescriptor, SampleDescriptor, SinkDescriptor, SourceDescriptor,
    Value,
};

/// The one channel of the basic platform: a reusable in-memory collection.
pub const COLLECTION_CHANNEL: ChannelDescriptor =
    ChannelDescriptor::new("basic.collection", true, false);

pub const BASIC_PLATFORM: &str = "basic";

pub struct BasicPlatform;

impl Platform for BasicPlatform {
    fn id(&self) -> PlatformId {
        PlatformId::new(BASIC_PLATFORM)
    }

    fn display_name(&self) -> &str {
        "Basic (in-process)"
    }

    fn create_executor(&self) -> Arc<dyn Executor> {
        Arc::new(BasicExecutor)
    }
}

/// Evaluates tasks inline; the push template in the driver awaits each
/// task, so inline evaluation is already the atomic unit it expects.
pub struct BasicExecutor;

#[async_trait]
impl Executor for BasicExecutor {
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

fn collection() -> Vec<ChannelDescriptor> {
    vec![COLLECTION_CHANNEL]
}

fn input_dataset(inputs: &[Arc<ChannelInstance>], index: usize) -> Result<Arc<Dataset>> {
    inputs
        .get(index)
        .and_then(|instance| instance.payload_as::<Dataset>())
        .ok_or_else(|| RheemError::Internal(format!("missing collection payload at input {index}")))
}

fn linear_cpu(units_per_element: u64) -> Option<LoadProfileEstimator> {
    Some(LoadProfileEstimator::cpu_only(ResourceEstimator::linear(
        units_per_element,
    )))
}

// ============================================================================
// Execution operators
// ============================================================================

pub struct BasicCollectionSource {
    pub descriptor: Arc<SourceDescriptor>,
}

impl ExecutionOperator for BasicCollectionSource {
    fn name(&self) -> &str {
        "BasicCollectionSource"
    }
    fn platform(&self) -> PlatformId {
        PlatformId::new(BASIC_PLATFORM)
    }
    fn num_inputs(&self) -> usize {
        0
    }
    fn num_outputs(&self) -> usize {
        1
    }
    fn supported_input_channels(&self, _: usize) -> Vec<ChannelDescriptor> {
        collection()
    }
    fn supported_output_channels(&self, _: usize) -> Vec<ChannelDescriptor> {
        collection()
    }
    fn load_profile_key(&self) -> Option<String> {
        Some("rheem.basic.source.load".to_string())
    }
    fn base_load_estimator(&self) -> Option<LoadProfileEstimator> {
        Some(LoadProfileEstimator::cpu_only(ResourceEstimator::Closure(
            Arc::new(|_, outputs| outputs.iter().sum::<u64>() * 100),
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

pub struct BasicMap {
    pub descriptor: Arc<MapDescriptor>,
}

impl ExecutionOperator for BasicMap {
    fn name(&self) -> &str {
        "BasicMapOperator"
    }
    fn platform(&self) -> PlatformId {
        PlatformId::new(BASIC_PLATFORM)
    }
    fn num_inputs(&self) -> usize {
        1
    }
    fn num_outputs(&self) -> usize {
        1
    }
    fn supported_input_channels(&self, _: usize) -> Vec<ChannelDescriptor> {
        collection()
    }
    fn supported_output_channels(&self, _: usize) -> Vec<ChannelDescriptor> {
        collection()
    }
    fn load_profile_key(&self) -> Option<String> {
        Some("rheem.basic.map.load".to_string())
    }
    fn base_load_estimator(&self) -> Option<LoadProfileEstimator> {
        linear_cpu(500)
    }
    fn evaluate(
        &self,
        inputs: &[Arc<ChannelInstance>],
        outputs: &[Arc<ChannelInstance>],
    ) -> Result<()> {
        let input = input_dataset(inputs, 0)?;
        let output: Dataset = input.iter().map(|v| (self.descriptor.function)(v)).collect();
        outputs[0].set_payload(Arc::new(output));
        Ok(())
    }
}

pub struct BasicFilter {
    pub descriptor: Arc<FilterDescriptor>,
}

impl ExecutionOperator for BasicFilter {
    fn name(&self) -> &str {
        "BasicFilterOperator"
    }
    fn platform(&self) -> PlatformId {
        PlatformId::new(BASIC_PLATFORM)
    }
    fn num_inputs(&self) -> usize {
        1
    }
    fn num_outputs(&self) -> usize {
        1
    }
    fn supported_input_channels(&self, _: usize) -> Vec<ChannelDescriptor> {
        collection()
    }
    fn supported_output_channels(&self, _: usize) -> Vec<ChannelDescriptor> {
        collection()
    }
    fn load_profile_key(&self) -> Option<String> {
        Some("rheem.basic.filter.load".to_string())
    }
    fn base_load_estimator(&self) -> Option<LoadProfileEstimator> {
        linear_cpu(300)
    }
    fn evaluate(
        &self,
        inputs: &[Arc<ChannelInstance>],
        outputs: &[Arc<ChannelInstance>],
    ) -> Result<()> {
        let input = input_dataset(inputs, 0)?;
        let output: Dataset = input
            .iter()
            .filter(|v| (self.descriptor.predicate)(v))
            .cloned()
            .collect();
        outputs[0].set_payload(Arc::new(output));
        Ok(())
    }
}

pub struct BasicFlatMap {
    pub descriptor: Arc<FlatMapDescriptor>,
}

impl ExecutionOperator for BasicFlatMap {
    fn name(&self) -> &str {
        "BasicFlatMapOperator"
    }
    fn platform(&self) -> PlatformId {
        PlatformId::new(BASIC_PLATFORM)
    }
    fn num_inputs(&self) -> usize {
        1
    }
    fn num_outputs(&self) -> usize {
        1
    }
    fn supported_input_channels(&self, _: usize) -> Vec<ChannelDescriptor> {
        collection()
    }
    fn supported_output_channels(&self, _: usize) -> Vec<ChannelDescriptor> {
        collection()
    }
    fn load_profile_key(&self) -> Option<String> {
        Some("rheem.basic.flatmap.load".to_string())
    }
    fn base_load_estimator(&self) -> Option<LoadProfileEstimator> {
        linear_cpu(600)
    }
    fn evaluate(
        &self,
        inputs: &[Arc<ChannelInstance>],
        outputs: &[Arc<ChannelInstance>],
    ) -> Result<()> {
        let input = input_dataset(inputs, 0)?;
        let output: Dataset = input
            .iter()
            .flat_map(|v| (self.descriptor.function)(v))
            .collect();
        outputs[0].set_payload(Arc::new(output));
        Ok(())
    }
}

pub struct BasicReduce {
    pub descriptor: Arc<ReduceDescriptor>,
}

impl ExecutionOperator for BasicReduce {
    fn name(&self) -> &str {
        "BasicReduceOperator"
    }
    fn platform(&self) -> PlatformId {
        PlatformId::new(BASIC_PLATFORM)
    }
    fn num_inputs(&self) -> usize {
        1
    }
    fn num_outputs(&self) -> usize {
        1
    }
    fn supported_input_channels(&self, _: usize) -> Vec<ChannelDescriptor> {
        collection()
    }
    fn supported_output_channels(&self, _: usize) -> Vec<ChannelDescriptor> {
        collection()
    }
    fn load_profile_key(&self) -> Option<String> {
        Some("rheem.basic.reduce.load".to_string())
    }
    fn base_load_estimator(&self) -> Option<LoadProfileEstimator> {
        linear_cpu(400)
    }
    fn evaluate(
        &self,
        inputs: &[Arc<ChannelInstance>],
        outputs: &[Arc<ChannelInstance>],
    ) -> Result<()> {
        let input = input_dataset(inputs, 0)?;
        let mut iterator = input.iter();
        let output: Dataset = match iterator.next() {
            Some(first) => {
                let folded = iterator.fold(first.clone(), |accumulator, value| {
                    (self.descriptor.function)(&accumulator, value)
                });
                vec![folded]
            }
            None => Vec::new(),
        };
        outputs[0].set_payload(Arc::new(output));
        Ok(())
    }
}

pub struct BasicReduceBy {
    pub descriptor: Arc<ReduceByDescriptor>,
}

impl ExecutionOperator for BasicReduceBy {
    fn name(&self) -> &str {
        "BasicReduceByOperator"
    }
    fn platform(&self) -> PlatformId {
        PlatformId::new(BASIC_PLATFORM)
    }
    fn num_inputs(&self) -> usize {
        1
    }
    fn num_outputs(&self) -> usize {
        1
    }
    fn supported_input_channels(&self, _: usize) -> Vec<ChannelDescriptor> {
        collection()
    }
    fn supported_output_channels(&self, _: usize) -> Vec<ChannelDescriptor> {
        collection()
    }
    fn load_profile_key(&self) -> Option<String> {
        Some("rheem.basic.reduceby.load".to_string())
    }
    fn base_load_estimator(&self) -> Option<LoadProfileEstimator> {
        linear_cpu(800)
    }
    fn evaluate(
        &self,
        inputs: &[Arc<ChannelInstance>],
        outputs: &[Arc<ChannelInstance>],
    ) -> Result<()> {
        use std::collections::HashMap;
        let input = input_dataset(inputs, 0)?;
        // Insertion-ordered grouping keeps the output deterministic.
        let mut order: Vec<Value> = Vec::new();
        let mut groups: HashMap<Value, Value> = HashMap::new();
        for value in input.iter() {
            let key = (self.descriptor.key)(value);
            match groups.get_mut(&key) {
                Some(accumulator) => {
                    *accumulator = (self.descriptor.function)(accumulator, value);
                }
                None => {
                    order.push(key.clone());
                    groups.insert(key, value.clone());
                }
            }
        }
        let output: Dataset = order
            .into_iter()
            .map(|key| groups.remove(&key).expect("grouped key"))
            .collect();
        outputs[0].set_payload(Arc::new(output));
        Ok(())
    }
}

pub struct BasicJoin {
    pub descriptor: Arc<JoinDescriptor>,
}

impl ExecutionOperator for BasicJoin {
    fn name(&self) -> &str {
        "BasicJoinOperator"
    }
    fn platform(&self) -> PlatformId {
        PlatformId::new(BASIC_PLATFORM)
    }
    fn num_inputs(&self) -> usize {
        2
    }
    fn num_outputs(&self) -> usize {
        1
    }
    fn supported_input_channels(&self, _: usize) -> Vec<ChannelDescriptor> {
        collection()
    }
    fn supported_output_channels(&self, _: usize) -> Vec<ChannelDescriptor> {
        collection()
    }
    fn load_profile_key(&self) -> Option<String> {
        Some("rheem.basic.join.load".to_string())
    }
    fn base_load_estimator(&self) -> Option<LoadProfileEstimator> {
        linear_cpu(1500)
    }
    fn evaluate(
        &self,
        inputs: &[Arc<ChannelInstance>],
        outputs: &[Arc<ChannelInstance>],
    ) -> Result<()> {
        use std::collections::HashMap;
        let left = input_dataset(inputs, 0)?;
        let right = input_dataset(inputs, 1)?;
        let mut table: HashMap<Value, Vec<&Value>> = HashMap::new();
        for value in right.iter() {
            table.entry((self.descriptor.right_key)(value)).or_default().push(value);
        }
        let mut output = Dataset::new();
        for value in left.iter() {
            if let Some(matches) = table.get(&(self.descriptor.left_key)(value)) {
                for partner in matches {
                    output.push(Value::Pair(
                        Box::new(value.clone()),
                        Box::new((*partner).clone()),
                    ));
                }
            }
        }
        outputs[0].set_payload(Arc::new(output));
        Ok(())
    }
}

pub struct BasicUnion;

impl ExecutionOperator for BasicUnion {
    fn name(&self) -> &str {
        "BasicUnionOperator"
    }
    fn platform(&self) -> PlatformId {
        PlatformId::new(BASIC_PLATFORM)
    }
    fn num_inputs(&self) -> usize {
        2
    }
    fn num_outputs(&self) -> usize {
        1
    }
    fn supported_input_channels(&self, _: usize) -> Vec<ChannelDescriptor> {
        collection()
    }
    fn supported_output_channels(&self, _: usize) -> Vec<ChannelDescriptor> {
        collection()
    }
    fn load_profile_key(&self) -> Option<String> {
        Some("rheem.basic.union.load".to_string())
    }
    fn base_load_estimator(&self) -> Option<LoadProfileEstimator> {
        linear_cpu(100)
    }
    fn evaluate(
        &self,
        inputs: &[Arc<ChannelInstance>],
        outputs: &[Arc<ChannelInstance>],
    ) -> Result<()> {
        let mut output = input_dataset(inputs, 0)?.as_ref().clone();
        output.extend(input_dataset(inputs, 1)?.iter().cloned());
        outputs[0].set_payload(Arc::new(output));
        Ok(())
    }
}

pub struct BasicDistinct;

impl ExecutionOperator for BasicDistinct {
    fn name(&self) -> &str {
        "BasicDistinctOperator"
    }
    fn platform(&self) -> PlatformId {
        PlatformId::new(BASIC_PLATFORM)
    }
    fn num_inputs(&self) -> usize {
        1
    }
    fn num_outputs(&self) -> usize {
        1
    }
    fn supported_input_channels(&self, _: usize) -> Vec<ChannelDescriptor> {
        collection()
    }
    fn supported_output_channels(&self, _: usize) -> Vec<ChannelDescriptor> {
        collection()
    }
    fn load_profile_key(&self) -> Option<String> {
        Some("rheem.basic.distinct.load".to_string())
    }
    fn base_load_estimator(&self) -> Option<LoadProfileEstimator> {
        linear_cpu(700)
    }
    fn evaluate(
        &self,
        inputs: &[Arc<ChannelInstance>],
        outputs: &[Arc<ChannelInstance>],
    ) -> Result<()> {
        use std::collections::HashSet;
        let input = input_dataset(inputs, 0)?;
        let mut seen = HashSet::new();
        let output: Dataset = input
            .iter()
            .filter(|value| seen.insert((*value).clone()))
            .cloned()
            .collect();
        outputs[0].set_payload(Arc::new(output));
        Ok(())
    }
}

pub struct BasicSort;

impl ExecutionOperator for BasicSort {
    fn name(&self) -> &str {
        "BasicSortOperator"
    }
    fn platform(&self) -> PlatformId {
        PlatformId::new(BASIC_PLATFORM)
    }
    fn num_inputs(&self) -> usize {
        1
    }
    fn num_outputs(&self) -> usize {
        1
    }
    fn supported_input_channels(&self, _: usize) -> Vec<ChannelDescriptor> {
        collection()
    }
    fn supported_output_channels(&self, _: usize) -> Vec<ChannelDescriptor> {
        collection()
    }
    fn load_profile_key(&self) -> Option<String> {
        Some("rheem.basic.sort.load".to_string())
    }
    fn base_load_estimator(&self) -> Option<LoadProfileEstimator> {
        Some(LoadProfileEstimator::cpu_only(ResourceEstimator::Closure(
            Arc::new(|inputs, _| {
                let n = inputs.iter().sum::<u64>().max(1) as f64;
                (n * n.log2().max(1.0) * 1200.0) as u64
            }),
        )))
    }
    fn evaluate(
        &self,
        inputs: &[Arc<ChannelInstance>],
        outputs: &[Arc<ChannelInstance>],
    ) -> Result<()> {
        let mut output = input_dataset(inputs, 0)?.as_ref().clone();
        output.sort_by(|a, b| a.total_cmp(b));
        outputs[0].set_payload(Arc::new(output));
        Ok(())
    }
}

pub struct BasicCount;

impl ExecutionOperator for BasicCount {
    fn name(&self) -> &str {
        "BasicCountOperator"
    }
    fn platform(&self) -> PlatformId {
        PlatformId::new(BASIC_PLATFORM)
    }
    fn num_inputs(&self) -> usize {
        1
    }
    fn num_outputs(&self) -> usize {
        1
    }
    fn supported_input_channels(&self, _: usize) -> Vec<ChannelDescriptor> {
        collection()
    }
    fn supported_output_channels(&self, _: usize) -> Vec<ChannelDescriptor> {
        collection()
    }
    fn load_profile_key(&self) -> Option<String> {
        Some("rheem.basic.count.load".to_string())
    }
    fn base_load_estimator(&self) -> Option<LoadProfileEstimator> {
        linear_cpu(50)
    }
    fn evaluate(
        &self,
        inputs: &[Arc<ChannelInstance>],
        outputs: &[Arc<ChannelInstance>],
    ) -> Result<()> {
        let input = input_dataset(inputs, 0)?;
        outputs[0].set_payload(Arc::new(vec![Value::Int(input.len() as i64)]));
        Ok(())
    }
}

pub struct BasicSample {
    pub descriptor: Arc<SampleDescriptor>,
}

impl ExecutionOperator for BasicSample {
    fn name(&self) -> &str {
        "BasicSampleOperator"
    }
    fn platform(&self) -> PlatformId {
        PlatformId::new(BASIC_PLATFORM)
    }
    fn num_inputs(&self) -> usize {
        1
    }
    fn num_outputs(&self) -> usize {
        1
    }
    fn supported_input_channels(&self, _: usize) -> Vec<ChannelDescriptor> {
        collection()
    }
    fn supported_output_channels(&self, _: usize) -> Vec<ChannelDescriptor> {
        collection()
    }
    fn load_profile_key(&self) -> Option<String> {
        Some("rheem.basic.sample.load".to_string())
    }
    fn base_load_estimator(&self) -> Option<LoadProfileEstimator> {
        linear_cpu(50)
    }
    fn evaluate(
        &self,
        inputs: &[Arc<ChannelInstance>],
        outputs: &[Arc<ChannelInstance>],
    ) -> Result<()> {
        let input = input_dataset(inputs, 0)?;
        let output: Dataset = input
            .iter()
            .take(self.descriptor.size as usize)
            .cloned()
            .collect();
        outputs[0].set_payload(Arc::new(output));
        Ok(())
    }
}

pub struct BasicCallbackSink {
    pub descriptor: Arc<SinkDescriptor>,
}

impl ExecutionOperator for BasicCallbackSink {
    fn name(&self) -> &str {
        "BasicCallbackSink"
    }
    fn platform(&self) -> PlatformId {
        PlatformId::new(BASIC_PLATFORM)
    }
    fn num_inputs(&self) -> usize {
        1
    }
    fn num_outputs(&self) -> usize {
        0
    }
    fn supported_input_channels(&self, _: usize) -> Vec<ChannelDescriptor> {
        collection()
    }
    fn supported_output_channels(&self, _: usize) -> Vec<ChannelDescriptor> {
        collection()
    }
    fn load_profile_key(&self) -> Option<String> {
        Some("rheem.basic.sink.load".to_string())
    }
    fn base_load_estimator(&self) -> Option<LoadProfileEstimator> {
        linear_cpu(100)
    }
    fn evaluate(
        &self,
        inputs: &[Arc<ChannelInstance>],
        _outputs: &[Arc<ChannelInstance>],
    ) -> Result<()> {
        let input = input_dataset(inputs, 0)?;
        *self.descriptor.collector.lock() = input.as_ref().clone();
        Ok(())
    }
}

/// Pass-through loop head; iteration control lives in the driver's
/// unrolled stages.
pub struct BasicRepeatHead;

impl ExecutionOperator for BasicRepeatHead {
    fn name(&self) -> &str {
        "BasicRepeatHead"
    }
    fn platform(&self) -> PlatformId {
        PlatformId::new(BASIC_PLATFORM)
    }
    fn num_inputs(&self) -> usize {
        1
    }
    fn num_outputs(&self) -> usize {
        1
    }
    fn supported_input_channels(&self, _: usize) -> Vec<ChannelDescriptor> {
        collection()
    }
    fn supported_output_channels(&self, _: usize) -> Vec<ChannelDescriptor> {
        collection()
    }
    fn load_profile_key(&self) -> Option<String> {
        Some("rheem.basic.repeat.load".to_string())
    }
    fn base_load_estimator(&self) -> Option<LoadProfileEstimator> {
        linear_cpu(50)
    }
    fn evaluate(
        &self,
        inputs: &[Arc<ChannelInstance>],
        outputs: &[Arc<ChannelInstance>],
    ) -> Result<()> {
        let input = input_dataset(inputs, 0)?;
        outputs[0].set_payload(Arc::new(input.as_ref().clone()));
        Ok(())
    }
}
