//! Channels
//!
//! A channel is a typed conduit between two execution operators, possibly
//! crossing backends. The descriptor is the static identity + capability
//! set; the instance is the runtime materialization with payload, measured
//! cardinality and a lineage DAG of not-yet-executed predecessors.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rheem_common::{ChannelId, OperatorId};

/// Static channel identity and capabilities.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelDescriptor {
    pub name: &'static str,
    /// Reusable channels can be consumed more than once (required for
    /// broadcasts and shared subexpressions).
    pub reusable: bool,
    /// Internal channels never leave their platform.
    pub internal: bool,
}

impl ChannelDescriptor {
    pub const fn new(name: &'static str, reusable: bool, internal: bool) -> Self {
        Self {
            name,
            reusable,
            internal,
        }
    }
}

impl std::fmt::Display for ChannelDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Opaque payload carried by a channel instance; interpreted by backends.
pub type Payload = Arc<dyn Any + Send + Sync>;

/// Runtime materialization of a channel.
pub struct ChannelInstance {
    id: ChannelId,
    descriptor: ChannelDescriptor,
    /// Producing operator and output index, if instrumentation should
    /// attribute measurements to it. Conversions carry `None`.
    producer: Option<(OperatorId, usize)>,
    /// Loop iteration of the producer, for operators inside loops.
    producer_iteration: Option<u32>,
    payload: Mutex<Option<Payload>>,
    produced: AtomicBool,
    instrumented: AtomicBool,
    measured_cardinality: Mutex<Option<u64>>,
    /// Predecessor instances that had not yet executed when this instance
    /// was created; drained as they are produced.
    lineage: Mutex<Vec<Arc<ChannelInstance>>>,
}

impl ChannelInstance {
    pub fn new(
        id: ChannelId,
        descriptor: ChannelDescriptor,
        producer: Option<(OperatorId, usize)>,
        producer_iteration: Option<u32>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            descriptor,
            producer,
            producer_iteration,
            payload: Mutex::new(None),
            produced: AtomicBool::new(false),
            instrumented: AtomicBool::new(false),
            measured_cardinality: Mutex::new(None),
            lineage: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn descriptor(&self) -> &ChannelDescriptor {
        &self.descriptor
    }

    pub fn producer(&self) -> Option<(OperatorId, usize)> {
        self.producer
    }

    pub fn producer_iteration(&self) -> Option<u32> {
        self.producer_iteration
    }

    pub fn was_produced(&self) -> bool {
        self.produced.load(Ordering::Acquire)
    }

    pub fn mark_produced(&self) {
        self.produced.store(true, Ordering::Release);
    }

    pub fn mark_for_instrumentation(&self) {
        self.instrumented.store(true, Ordering::Release);
    }

    pub fn is_marked_for_instrumentation(&self) -> bool {
        self.instrumented.load(Ordering::Acquire)
    }

    pub fn set_measured_cardinality(&self, cardinality: u64) {
        *self.measured_cardinality.lock() = Some(cardinality);
    }

    pub fn measured_cardinality(&self) -> Option<u64> {
        *self.measured_cardinality.lock()
    }

    pub fn set_payload(&self, payload: Payload) {
        *self.payload.lock() = Some(payload);
    }

    pub fn payload(&self) -> Option<Payload> {
        self.payload.lock().clone()
    }

    /// Typed payload accessor for backends.
    pub fn payload_as<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.payload().and_then(|p| p.downcast::<T>().ok())
    }

    pub fn add_predecessor(self: &Arc<Self>, predecessor: Arc<ChannelInstance>) {
        self.lineage.lock().push(predecessor);
    }

    /// Collect all unproduced instances in the lineage of this instance
    /// (including itself), mark them produced, and drop produced
    /// predecessors so later traversals are O(new work).
    pub fn collect_and_mark(self: &Arc<Self>) -> Vec<LineageEntry> {
        let mut collected = Vec::new();
        Self::collect_into(self, &mut collected);
        collected
    }

    fn collect_into(instance: &Arc<ChannelInstance>, collected: &mut Vec<LineageEntry>) {
        if instance.was_produced() {
            return;
        }
        let predecessors: Vec<Arc<ChannelInstance>> = {
            let mut lineage = instance.lineage.lock();
            let taken = lineage.clone();
            lineage.retain(|p| !p.was_produced());
            taken
        };
        for predecessor in predecessors {
            Self::collect_into(&predecessor, collected);
        }
        instance.mark_produced();
        collected.push(LineageEntry {
            producer: instance.producer,
            iteration: instance.producer_iteration,
            instance: Arc::clone(instance),
        });
    }
}

impl std::fmt::Debug for ChannelInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelInstance")
            .field("id", &self.id)
            .field("descriptor", &self.descriptor)
            .field("produced", &self.was_produced())
            .finish()
    }
}

/// One node surfaced by a lineage traversal.
#[derive(Debug, Clone)]
pub struct LineageEntry {
    pub producer: Option<(OperatorId, usize)>,
    pub iteration: Option<u32>,
    pub instance: Arc<ChannelInstance>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_CHANNEL: ChannelDescriptor = ChannelDescriptor::new("test.collection", true, false);

    #[test]
    fn test_produced_flag_and_measurement() {
        let instance = ChannelInstance::new(ChannelId(0), TEST_CHANNEL, None, None);
        assert!(!instance.was_produced());
        instance.mark_produced();
        assert!(instance.was_produced());

        assert_eq!(instance.measured_cardinality(), None);
        instance.set_measured_cardinality(42);
        assert_eq!(instance.measured_cardinality(), Some(42));
    }

    #[test]
    fn test_lineage_collects_predecessors_once() {
        let a = ChannelInstance::new(ChannelId(0), TEST_CHANNEL, Some((OperatorId(1), 0)), None);
        let b = ChannelInstance::new(ChannelId(1), TEST_CHANNEL, Some((OperatorId(2), 0)), None);
        b.add_predecessor(Arc::clone(&a));

        let collected = b.collect_and_mark();
        assert_eq!(collected.len(), 2);
        assert!(a.was_produced());
        assert!(b.was_produced());

        // Second traversal sees nothing new.
        let c = ChannelInstance::new(ChannelId(2), TEST_CHANNEL, Some((OperatorId(3), 0)), None);
        c.add_predecessor(Arc::clone(&b));
        let collected = c.collect_and_mark();
        assert_eq!(collected.len(), 1);
    }

    #[test]
    fn test_typed_payload() {
        let instance = ChannelInstance::new(ChannelId(0), TEST_CHANNEL, None, None);
        instance.set_payload(Arc::new(vec![1i64, 2, 3]));
        let payload = instance.payload_as::<Vec<i64>>().unwrap();
        assert_eq!(payload.len(), 3);
    }
}
