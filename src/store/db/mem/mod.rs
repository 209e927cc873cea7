mod collect;
mod r#impl;

use std::sync::Arc;

use serde::{Serialize, de::DeserializeOwned};

use crate::{
    runtime::ExecutionContext,
    store::{DbCollection, DbStore, Store, data::*},
    trigger::FlowTrigger,
};
pub use collect::Collect;

/// Volatile store for tests, demos and single-process deployments.
#[derive(Debug, Clone)]
pub struct MemStore {
    flows: Arc<Collect<Flow>>,
    flow_versions: Arc<Collect<FlowVersion>>,
    executions: Arc<Collect<ExecutionContext>>,
    steps: Arc<Collect<ExecutionStep>>,
    triggers: Arc<Collect<FlowTrigger>>,
    barriers: Arc<Collect<MergeBarrier>>,
}

trait DbDocument: Serialize + DeserializeOwned + Clone + Send + Sync {
    fn id(&self) -> &str;
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DbStore for MemStore {
    fn init(
        &self,
        s: &Store,
    ) {
        s.register(self.flows());
        s.register(self.flow_versions());
        s.register(self.executions());
        s.register(self.steps());
        s.register(self.triggers());
        s.register(self.barriers());
    }
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            flows: Arc::new(Collect::new("flows")),
            flow_versions: Arc::new(Collect::new("flow_versions")),
            executions: Arc::new(Collect::new("executions")),
            steps: Arc::new(Collect::new("steps")),
            triggers: Arc::new(Collect::new("triggers")),
            barriers: Arc::new(Collect::new("barriers")),
        }
    }

    pub fn flows(&self) -> Arc<dyn DbCollection<Item = Flow> + Send + Sync> {
        self.flows.clone()
    }

    pub fn flow_versions(&self) -> Arc<dyn DbCollection<Item = FlowVersion> + Send + Sync> {
        self.flow_versions.clone()
    }

    pub fn executions(&self) -> Arc<dyn DbCollection<Item = ExecutionContext> + Send + Sync> {
        self.executions.clone()
    }

    pub fn steps(&self) -> Arc<dyn DbCollection<Item = ExecutionStep> + Send + Sync> {
        self.steps.clone()
    }

    pub fn triggers(&self) -> Arc<dyn DbCollection<Item = FlowTrigger> + Send + Sync> {
        self.triggers.clone()
    }

    pub fn barriers(&self) -> Arc<dyn DbCollection<Item = MergeBarrier> + Send + Sync> {
        self.barriers.clone()
    }
}
