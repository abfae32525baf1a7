//! Platform and executor contracts
//!
//! A platform is a backend adapter: it names itself, creates executors and
//! contributes execution operators, channels and conversions. The core
//! talks to it through the push executor template: submit one task, await
//! its completion, observe the produced channel instances. Platforms are
//! registered explicitly at construction.

pub mod channel;
pub mod execution;
pub mod state;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use rheem_common::{PlatformId, Result, RheemError};

use crate::platform::channel::ChannelInstance;
use crate::platform::execution::ExecutionTask;
use crate::platform::state::PartialExecution;

/// A registered backend.
pub trait Platform: Send + Sync {
    fn id(&self) -> PlatformId;

    /// Human-readable name for summaries.
    fn display_name(&self) -> &str;

    fn create_executor(&self) -> Arc<dyn Executor>;
}

/// Executes tasks on one platform.
///
/// A task is atomic from the core's perspective: no partial output is ever
/// observed. Implementations fill the prepared output instances and may
/// report their own timing as a `PartialExecution`.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(
        &self,
        task: Arc<ExecutionTask>,
        inputs: Vec<Arc<ChannelInstance>>,
        outputs: Vec<Arc<ChannelInstance>>,
    ) -> Result<Option<PartialExecution>>;

    /// Idempotent teardown.
    fn dispose(&self) {}

    /// Best-effort cancellation of in-flight work.
    fn cancel(&self) {}
}

/// Explicit registry of platforms; replaces any reflective plugin loading.
#[derive(Default)]
pub struct PlatformRegistry {
    platforms: BTreeMap<PlatformId, Arc<dyn Platform>>,
}

impl PlatformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, platform: Arc<dyn Platform>) {
        self.platforms.insert(platform.id(), platform);
    }

    pub fn get(&self, id: &PlatformId) -> Result<&Arc<dyn Platform>> {
        self.platforms
            .get(id)
            .ok_or_else(|| RheemError::Configuration(format!("unknown platform `{id}`")))
    }

    pub fn contains(&self, id: &PlatformId) -> bool {
        self.platforms.contains_key(id)
    }

    /// Ids of all registered platforms, in name order.
    pub fn active_platforms(&self) -> Vec<PlatformId> {
        self.platforms.keys().cloned().collect()
    }
}
